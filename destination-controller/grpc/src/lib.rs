#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authority;
mod endpoints;
mod metrics;
mod profiles;
mod token;

pub use self::metrics::ServerMetrics;
use self::{
    endpoints::EndpointTranslator,
    profiles::{EndpointProfileTranslator, ProfileTranslator},
    token::ContextToken,
};
use linkerd2_proxy_api::destination::{
    self as pb,
    destination_server::{self, Destination},
};
use linkerd_destination_controller_core::{
    endpoints::{DiscoverEndpoints, PodEndpoint, ServiceId},
    profiles::{DiscoverProfiles, ProfileId},
    DiscoveryError,
};
use std::{num::NonZeroU16, sync::Arc};
use tracing::debug;

/// Serves the proxy-facing destination API over a discovery source.
#[derive(Clone, Debug)]
pub struct DestinationServer<T> {
    discover: T,
    cluster_domain: Arc<str>,
    enable_h2_upgrade: bool,
    metrics: ServerMetrics,
    drain: drain::Watch,
}

// === impl DestinationServer ===

impl<T> DestinationServer<T>
where
    T: DiscoverEndpoints + DiscoverProfiles + Send + Sync + 'static,
{
    pub fn new(
        discover: T,
        cluster_domain: impl Into<Arc<str>>,
        enable_h2_upgrade: bool,
        metrics: ServerMetrics,
        drain: drain::Watch,
    ) -> Self {
        Self {
            discover,
            cluster_domain: cluster_domain.into(),
            enable_h2_upgrade,
            metrics,
            drain,
        }
    }

    pub fn svc(self) -> destination_server::DestinationServer<Self> {
        destination_server::DestinationServer::new(self)
    }

    fn check_scheme(scheme: &str) -> Result<(), tonic::Status> {
        if scheme.is_empty() || scheme == "k8s" {
            return Ok(());
        }
        Err(tonic::Status::invalid_argument(format!(
            "unsupported scheme: {scheme}"
        )))
    }

    /// Builds the composite profile stream for a service: profile translator
    /// fed by the fallback over the caller-scoped and service-scoped
    /// profiles, merged with the service's opaque-ports annotation.
    async fn profile_stream(
        &self,
        service: ServiceId,
        port: NonZeroU16,
        token: &ContextToken,
    ) -> profiles::BoxProfileStream {
        let fqn = authority::service_fqn(&service, &self.cluster_domain);

        let primary = match token.ns.is_empty() {
            true => None,
            false => {
                let id = ProfileId {
                    namespace: token.ns.clone(),
                    name: fqn.clone(),
                };
                Some(self.discover.watch_profile(&id).await)
            }
        };
        let secondary = self
            .discover
            .watch_profile(&ProfileId {
                namespace: service.namespace.clone(),
                name: fqn.clone(),
            })
            .await;
        let opaque_ports = self.discover.watch_opaque_ports(&service).await;

        profiles::response_stream(
            ProfileTranslator::new(fqn, port),
            primary,
            secondary,
            opaque_ports,
            self.drain.clone(),
            self.metrics.updates("get_profile"),
        )
    }

    /// Builds the profile stream for a single resolved endpoint. A
    /// pod-annotated opaque port needs no Server subscription; otherwise the
    /// Server watch drives protocol updates.
    async fn endpoint_profile_stream(&self, ep: PodEndpoint) -> profiles::BoxProfileStream {
        let translator = EndpointProfileTranslator::new(Some(ep.address.clone()), self.enable_h2_upgrade);

        if ep.opaque_annotated {
            return profiles::endpoint_response_stream(
                translator,
                true,
                None,
                self.drain.clone(),
                self.metrics.updates("get_profile"),
            );
        }

        let protocol = match &ep.address.pod {
            Some(pod) => Some(
                self.discover
                    .watch_pod_protocol(&pod.namespace, &pod.name, ep.address.port)
                    .await,
            ),
            None => None,
        };
        profiles::endpoint_response_stream(
            translator,
            ep.address.opaque_protocol,
            protocol,
            self.drain.clone(),
            self.metrics.updates("get_profile"),
        )
    }
}

#[async_trait::async_trait]
impl<T> Destination for DestinationServer<T>
where
    T: DiscoverEndpoints + DiscoverProfiles + Send + Sync + 'static,
{
    type GetStream = endpoints::BoxGetStream;

    async fn get(
        &self,
        req: tonic::Request<pb::GetDestination>,
    ) -> Result<tonic::Response<Self::GetStream>, tonic::Status> {
        let get = req.into_inner();
        self.metrics.stream_started("get");
        Self::check_scheme(&get.scheme)?;
        debug!(path = %get.path, "Get");

        let token = ContextToken::parse(&get.context_token);

        let (host, port) = authority::get_host_and_port(&get.path).map_err(|error| {
            debug!(%error, path = %get.path, "Invalid authority");
            tonic::Status::invalid_argument(format!("invalid authority: {}", get.path))
        })?;

        if host.parse::<std::net::IpAddr>().is_ok() {
            return Err(tonic::Status::invalid_argument(format!(
                "IP queries not supported by the Get API: host={host}"
            )));
        }

        let (service, instance) =
            authority::parse_service_name(host, &self.cluster_domain).map_err(|error| {
                debug!(%error, path = %get.path, "Invalid service");
                tonic::Status::invalid_argument(format!("invalid authority: {}", get.path))
            })?;

        let endpoints = self
            .discover
            .watch_endpoints(&service, port, instance.as_deref())
            .await
            .map_err(status_from_discovery)?;

        let client_zone = match token.node_name.is_empty() {
            true => None,
            false => self.discover.node_zone(&token.node_name),
        };
        let translator = EndpointTranslator::new(service, self.enable_h2_upgrade, client_zone);

        Ok(tonic::Response::new(endpoints::response_stream(
            translator,
            endpoints,
            self.drain.clone(),
            self.metrics.updates("get"),
        )))
    }

    type GetProfileStream = profiles::BoxProfileStream;

    async fn get_profile(
        &self,
        req: tonic::Request<pb::GetDestination>,
    ) -> Result<tonic::Response<Self::GetProfileStream>, tonic::Status> {
        let get = req.into_inner();
        self.metrics.stream_started("get_profile");
        Self::check_scheme(&get.scheme)?;
        debug!(path = %get.path, "GetProfile");

        let token = ContextToken::parse(&get.context_token);

        let (host, port) = authority::get_host_and_port(&get.path).map_err(|error| {
            debug!(%error, path = %get.path, "Invalid authority");
            tonic::Status::invalid_argument(format!("invalid authority: {error}"))
        })?;

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            // A cluster IP resolves to the service's profile; otherwise the
            // address may map to a pod on the host or pod network.
            if let Some(service) = self
                .discover
                .lookup_service(ip)
                .map_err(status_from_discovery)?
            {
                let stream = self.profile_stream(service, port, &token).await;
                return Ok(tonic::Response::new(stream));
            }

            return match self
                .discover
                .lookup_pod_endpoint(ip, port)
                .map_err(status_from_discovery)?
            {
                Some(ep) => Ok(tonic::Response::new(self.endpoint_profile_stream(ep).await)),
                // Neither a service nor a pod: a single profile with no
                // endpoint.
                None => Ok(tonic::Response::new(profiles::endpoint_response_stream(
                    EndpointProfileTranslator::new(None, self.enable_h2_upgrade),
                    false,
                    None,
                    self.drain.clone(),
                    self.metrics.updates("get_profile"),
                ))),
            };
        }

        let (service, instance) =
            authority::parse_service_name(host, &self.cluster_domain).map_err(|error| {
                debug!(%error, path = %get.path, "Invalid service");
                tonic::Status::invalid_argument(format!("invalid service: {error}"))
            })?;

        // A per-instance DNS name is answered like an IP-to-pod query, using
        // the endpoint the hostname maps to.
        if let Some(hostname) = instance {
            let ep = self
                .discover
                .endpoint_by_hostname(&service, &hostname, port)
                .map_err(status_from_discovery)?;
            return Ok(tonic::Response::new(self.endpoint_profile_stream(ep).await));
        }

        let stream = self.profile_stream(service, port, &token).await;
        Ok(tonic::Response::new(stream))
    }
}

fn status_from_discovery(error: DiscoveryError) -> tonic::Status {
    let message = error.to_string();
    match error {
        DiscoveryError::InvalidService(_) => tonic::Status::invalid_argument(message),
        DiscoveryError::Conflict { .. } => tonic::Status::failed_precondition(message),
        DiscoveryError::UnknownHostname { .. } => tonic::Status::unknown(message),
    }
}
