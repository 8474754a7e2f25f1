#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use linkerd_destination_controller_core::{
    endpoints::{DiscoverEndpoints, EndpointsStream, PodEndpoint, ServiceId},
    profiles::{DiscoverProfiles, OpaquePortsStream, ProfileId, ProfileStream, ProtocolStream},
    DiscoveryError,
};
pub use linkerd_destination_controller_grpc as grpc;
pub use linkerd_destination_controller_k8s_api as k8s;
pub use linkerd_destination_controller_k8s_index as index;
use std::{net::IpAddr, num::NonZeroU16};
use tokio_stream::wrappers::WatchStream;

/// Answers discovery queries from the shared indexes.
#[derive(Clone, Debug)]
pub struct Discover {
    endpoints: index::endpoints::SharedIndex,
    profiles: index::profiles::SharedIndex,
    servers: index::server::SharedIndex,
}

// === impl Discover ===

impl Discover {
    pub fn new(
        endpoints: index::endpoints::SharedIndex,
        profiles: index::profiles::SharedIndex,
        servers: index::server::SharedIndex,
    ) -> Self {
        Self {
            endpoints,
            profiles,
            servers,
        }
    }
}

#[async_trait::async_trait]
impl DiscoverEndpoints for Discover {
    async fn watch_endpoints(
        &self,
        id: &ServiceId,
        port: NonZeroU16,
        instance: Option<&str>,
    ) -> Result<EndpointsStream, DiscoveryError> {
        let rx = self.endpoints.write().endpoints_rx(id, port, instance)?;
        Ok(Box::pin(WatchStream::new(rx)))
    }

    fn node_zone(&self, name: &str) -> Option<String> {
        self.endpoints.read().node_zone(name)
    }
}

#[async_trait::async_trait]
impl DiscoverProfiles for Discover {
    async fn watch_profile(&self, id: &ProfileId) -> ProfileStream {
        let rx = self.profiles.write().profile_rx(id);
        Box::pin(WatchStream::new(rx))
    }

    async fn watch_opaque_ports(&self, id: &ServiceId) -> OpaquePortsStream {
        let rx = self.endpoints.write().opaque_ports_rx(id);
        Box::pin(WatchStream::new(rx))
    }

    async fn watch_pod_protocol(
        &self,
        namespace: &str,
        pod: &str,
        port: NonZeroU16,
    ) -> ProtocolStream {
        let rx = self.servers.write().protocol_rx(namespace, pod, port);
        Box::pin(WatchStream::new(rx))
    }

    fn lookup_service(&self, addr: IpAddr) -> Result<Option<ServiceId>, DiscoveryError> {
        self.endpoints.read().lookup_service(addr)
    }

    fn lookup_pod_endpoint(
        &self,
        addr: IpAddr,
        port: NonZeroU16,
    ) -> Result<Option<PodEndpoint>, DiscoveryError> {
        self.endpoints.read().lookup_pod_endpoint(addr, port)
    }

    fn endpoint_by_hostname(
        &self,
        id: &ServiceId,
        hostname: &str,
        port: NonZeroU16,
    ) -> Result<PodEndpoint, DiscoveryError> {
        self.endpoints.read().endpoint_by_hostname(id, hostname, port)
    }
}
