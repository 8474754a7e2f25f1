//! Translates profile state into `DestinationProfile` messages for a single
//! `GetProfile` stream.
//!
//! A stream over a service name merges three sources: the caller-scoped
//! profile (primary), the service-scoped profile (secondary), and the
//! service's opaque-ports annotation. The effective profile is the primary's
//! when the primary reports one, else the secondary's; its opaque-port set is
//! unioned with the annotation set. Downstream messages are emitted only when
//! the effective value changes.

use crate::endpoints::to_weighted_addr;
use futures::prelude::*;
use linkerd2_proxy_api::{
    destination::{self as pb, DestinationProfile},
    http_types::{self, HttpMethod},
};
use linkerd_destination_controller_core::{
    endpoints::Address,
    profiles::{
        OpaquePortsStream, Profile, ProfileStream, ProtocolStream, RequestMatch, ResponseClass,
        ResponseMatch, RetryBudget, Route,
    },
};
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::{BTreeSet, HashMap},
    num::NonZeroU16,
    pin::Pin,
};

pub type BoxProfileStream =
    Pin<Box<dyn Stream<Item = Result<DestinationProfile, tonic::Status>> + Send + Sync + 'static>>;

/// Stream-bound state converting profile views into wire messages.
#[derive(Debug)]
pub(crate) struct ProfileTranslator {
    fqn: String,
    port: NonZeroU16,
    last: Option<DestinationProfile>,
}

// === impl ProfileTranslator ===

impl ProfileTranslator {
    pub(crate) fn new(fqn: String, port: NonZeroU16) -> Self {
        Self {
            fqn,
            port,
            last: None,
        }
    }

    /// Converts the effective profile and opaque-ports set into a message,
    /// suppressing duplicates.
    pub(crate) fn update(
        &mut self,
        profile: &Profile,
        service_opaque: &BTreeSet<NonZeroU16>,
    ) -> Option<DestinationProfile> {
        let opaque_ports: BTreeSet<NonZeroU16> = profile
            .opaque_ports
            .union(service_opaque)
            .copied()
            .collect();

        let msg = DestinationProfile {
            fully_qualified_name: self.fqn.clone(),
            opaque_protocol: opaque_ports.contains(&self.port),
            routes: profile.routes.iter().map(to_route).collect(),
            retry_budget: Some(
                profile
                    .retry_budget
                    .as_ref()
                    .map(to_retry_budget)
                    .unwrap_or_else(default_retry_budget),
            ),
            dst_overrides: profile
                .dst_overrides
                .iter()
                .map(|dst| pb::WeightedDst {
                    authority: dst.authority.clone(),
                    weight: dst.weight,
                })
                .collect(),
            ..Default::default()
        };

        if self.last.as_ref() == Some(&msg) {
            return None;
        }
        self.last = Some(msg.clone());
        Some(msg)
    }
}

/// Stream-bound state for a profile answered with a single endpoint (IP and
/// per-instance queries). The only input is the opaque bit.
#[derive(Debug)]
pub(crate) struct EndpointProfileTranslator {
    address: Option<Address>,
    enable_h2_upgrade: bool,
    last: Option<DestinationProfile>,
}

// === impl EndpointProfileTranslator ===

impl EndpointProfileTranslator {
    pub(crate) fn new(address: Option<Address>, enable_h2_upgrade: bool) -> Self {
        Self {
            address,
            enable_h2_upgrade,
            last: None,
        }
    }

    pub(crate) fn update_protocol(&mut self, opaque: bool) -> Option<DestinationProfile> {
        let endpoint = self.address.as_ref().map(|addr| {
            let mut wa = to_weighted_addr(addr, opaque, self.enable_h2_upgrade, None);
            // Unlike `Get`, per-endpoint profiles carry the namespace on the
            // address itself.
            if let Some(pod) = &addr.pod {
                wa.metric_labels
                    .insert("namespace".to_string(), pod.namespace.clone());
            }
            wa
        });

        let msg = DestinationProfile {
            retry_budget: Some(default_retry_budget()),
            endpoint,
            opaque_protocol: opaque,
            ..Default::default()
        };

        if self.last.as_ref() == Some(&msg) {
            return None;
        }
        self.last = Some(msg.clone());
        Some(msg)
    }
}

/// Drives a `GetProfile` stream over a service name.
///
/// `primary` is subscribed only when the query carried a context token
/// namespace.
pub(crate) fn response_stream(
    mut translator: ProfileTranslator,
    primary: Option<ProfileStream>,
    mut secondary: ProfileStream,
    mut opaque_ports: OpaquePortsStream,
    drain: drain::Watch,
    updates: Counter,
) -> BoxProfileStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut primary = primary;
        // Without a primary subscription the fallback is permanently driven
        // by the secondary.
        let mut primary_state: Option<Option<Profile>> =
            primary.is_none().then(|| None);
        let mut secondary_state: Option<Option<Profile>> = None;
        let mut ports_state: Option<BTreeSet<NonZeroU16>> = None;

        loop {
            tokio::select! {
                res = next_or_pending(&mut primary) => match res {
                    Some(profile) => primary_state = Some(profile),
                    None => return,
                },
                res = secondary.next() => match res {
                    Some(profile) => secondary_state = Some(profile),
                    None => return,
                },
                res = opaque_ports.next() => match res {
                    Some(ports) => ports_state = Some(ports),
                    None => return,
                },
                _ = (&mut shutdown) => {
                    return;
                }
            }

            // The primary's profile wins whenever the primary reports one.
            let effective = match &primary_state {
                Some(Some(profile)) => Some(profile),
                _ => secondary_state.as_ref().and_then(|state| state.as_ref()),
            };
            let profile = effective.cloned().unwrap_or_default();
            let ports = ports_state.clone().unwrap_or_default();
            if let Some(msg) = translator.update(&profile, &ports) {
                updates.inc();
                yield msg;
            }
        }
    })
}

/// Drives a `GetProfile` stream answered with a single endpoint. When the
/// port is annotated opaque no protocol stream is supplied and the initial
/// message is the only one.
pub(crate) fn endpoint_response_stream(
    mut translator: EndpointProfileTranslator,
    initial_opaque: bool,
    protocol: Option<ProtocolStream>,
    drain: drain::Watch,
    updates: Counter,
) -> BoxProfileStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        if let Some(msg) = translator.update_protocol(initial_opaque) {
            updates.inc();
            yield msg;
        }

        let mut protocol = protocol;
        loop {
            tokio::select! {
                res = next_or_pending(&mut protocol) => match res {
                    Some(opaque) => {
                        if let Some(msg) = translator.update_protocol(opaque) {
                            updates.inc();
                            yield msg;
                        }
                    }
                    None => return,
                },
                _ = (&mut shutdown) => {
                    return;
                }
            }
        }
    })
}

async fn next_or_pending<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

fn to_route(route: &Route) -> pb::Route {
    let mut metrics_labels = HashMap::new();
    metrics_labels.insert("route".to_string(), route.name.clone());

    pb::Route {
        condition: Some(to_request_match(&route.condition)),
        metrics_labels,
        response_classes: route.response_classes.iter().map(to_response_class).collect(),
        is_retryable: route.is_retryable,
        timeout: route.timeout.and_then(|timeout| {
            timeout
                .try_into()
                .map_err(
                    |error| tracing::warn!(%error, "Failed to convert route timeout to protobuf"),
                )
                .ok()
        }),
    }
}

fn to_request_match(m: &RequestMatch) -> pb::RequestMatch {
    use pb::request_match;

    let m = match m {
        RequestMatch::All(matches) => request_match::Match::All(request_match::Seq {
            matches: matches.iter().map(to_request_match).collect(),
        }),
        RequestMatch::Any(matches) => request_match::Match::Any(request_match::Seq {
            matches: matches.iter().map(to_request_match).collect(),
        }),
        RequestMatch::Not(inner) => {
            request_match::Match::Not(Box::new(to_request_match(inner)))
        }
        RequestMatch::Path(regex) => request_match::Match::Path(pb::PathMatch {
            regex: regex.clone(),
        }),
        RequestMatch::Method(method) => request_match::Match::Method(to_http_method(method)),
    };

    pb::RequestMatch { r#match: Some(m) }
}

fn to_http_method(method: &str) -> HttpMethod {
    use http_types::http_method::{Registered, Type};

    let registered = match method.to_ascii_uppercase().as_str() {
        "GET" => Some(Registered::Get),
        "POST" => Some(Registered::Post),
        "PUT" => Some(Registered::Put),
        "DELETE" => Some(Registered::Delete),
        "PATCH" => Some(Registered::Patch),
        "OPTIONS" => Some(Registered::Options),
        "CONNECT" => Some(Registered::Connect),
        "HEAD" => Some(Registered::Head),
        _ => None,
    };

    HttpMethod {
        r#type: Some(match registered {
            Some(m) => Type::Registered(m as i32),
            None => Type::Unregistered(method.to_string()),
        }),
    }
}

fn to_response_class(class: &ResponseClass) -> pb::ResponseClass {
    pb::ResponseClass {
        condition: Some(to_response_match(&class.condition)),
        is_failure: class.is_failure,
    }
}

fn to_response_match(m: &ResponseMatch) -> pb::ResponseMatch {
    use pb::response_match;

    let m = match m {
        ResponseMatch::All(matches) => response_match::Match::All(response_match::Seq {
            matches: matches.iter().map(to_response_match).collect(),
        }),
        ResponseMatch::Any(matches) => response_match::Match::Any(response_match::Seq {
            matches: matches.iter().map(to_response_match).collect(),
        }),
        ResponseMatch::Not(inner) => {
            response_match::Match::Not(Box::new(to_response_match(inner)))
        }
        ResponseMatch::Status { min, max } => {
            response_match::Match::Status(pb::HttpStatusRange {
                min: *min,
                max: *max,
            })
        }
    };

    pb::ResponseMatch { r#match: Some(m) }
}

fn to_retry_budget(budget: &RetryBudget) -> pb::RetryBudget {
    pb::RetryBudget {
        retry_ratio: budget.retry_ratio,
        min_retries_per_second: budget.min_retries_per_second,
        ttl: budget.ttl.try_into().ok(),
    }
}

/// The budget applied when a profile does not configure one.
fn default_retry_budget() -> pb::RetryBudget {
    pb::RetryBudget {
        retry_ratio: 0.2,
        min_retries_per_second: 10,
        ttl: Some(prost_types::Duration {
            seconds: 10,
            nanos: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_controller_core::profiles::WeightedDst;
    use tokio::sync::watch;
    use tokio_stream::wrappers::WatchStream;

    fn port(p: u16) -> NonZeroU16 {
        NonZeroU16::new(p).unwrap()
    }

    fn route(name: &str) -> Route {
        Route {
            name: name.to_string(),
            condition: RequestMatch::Path(format!("/{name}")),
            response_classes: Vec::new(),
            is_retryable: false,
            timeout: None,
        }
    }

    fn profile_with_route(name: &str) -> Profile {
        Profile {
            routes: vec![route(name)],
            ..Default::default()
        }
    }

    fn route_names(msg: &DestinationProfile) -> Vec<&str> {
        msg.routes
            .iter()
            .map(|r| r.metrics_labels["route"].as_str())
            .collect()
    }

    #[test]
    fn opaque_ports_are_merged() {
        // The service annotates 3306 and the profile declares 6379; a port in
        // either set is opaque.
        let service_opaque: BTreeSet<NonZeroU16> = [port(3306)].into_iter().collect();
        let profile = Profile {
            opaque_ports: [port(6379)].into_iter().collect(),
            ..Default::default()
        };

        for (p, opaque) in [(3306, true), (6379, true), (80, false)] {
            let mut translator =
                ProfileTranslator::new("api.prod.svc.cluster.local".to_string(), port(p));
            let msg = translator.update(&profile, &service_opaque).unwrap();
            assert_eq!(msg.opaque_protocol, opaque, "port {p}");
        }
    }

    #[test]
    fn empty_profiles_are_still_valid() {
        let mut translator =
            ProfileTranslator::new("api.prod.svc.cluster.local".to_string(), port(80));
        let msg = translator
            .update(&Profile::default(), &BTreeSet::new())
            .expect("an empty profile must be emitted");
        assert_eq!(msg.fully_qualified_name, "api.prod.svc.cluster.local");
        assert!(msg.routes.is_empty());
        assert!(!msg.opaque_protocol);
        let budget = msg.retry_budget.expect("default budget must be set");
        assert_eq!(budget.min_retries_per_second, 10);

        assert!(
            translator.update(&Profile::default(), &BTreeSet::new()).is_none(),
            "identical updates are coalesced"
        );
    }

    #[test]
    fn dst_overrides_are_forwarded() {
        let profile = Profile {
            dst_overrides: vec![WeightedDst {
                authority: "books-v2.prod.svc.cluster.local:80".to_string(),
                weight: 700,
            }],
            ..Default::default()
        };
        let mut translator =
            ProfileTranslator::new("books.prod.svc.cluster.local".to_string(), port(80));
        let msg = translator.update(&profile, &BTreeSet::new()).unwrap();
        assert_eq!(msg.dst_overrides.len(), 1);
        assert_eq!(msg.dst_overrides[0].weight, 700);
    }

    /// Exercises the primary/secondary fallback over a stream: the effective
    /// profile is the caller-scoped one when it exists, else the service's,
    /// and transitions re-emit.
    #[tokio::test]
    async fn fallback_prefers_the_primary_profile() {
        let (primary_tx, primary_rx) = watch::channel::<Option<Profile>>(None);
        let (secondary_tx, secondary_rx) = watch::channel::<Option<Profile>>(None);
        let (_ports_tx, ports_rx) = watch::channel(BTreeSet::new());
        let (signal, drain) = drain::channel();

        let translator =
            ProfileTranslator::new("api.prod.svc.cluster.local".to_string(), port(80));
        let mut stream = response_stream(
            translator,
            Some(Box::pin(WatchStream::new(primary_rx))),
            Box::pin(WatchStream::new(secondary_rx)),
            Box::pin(WatchStream::new(ports_rx)),
            drain,
            Counter::default(),
        );

        // Neither profile exists: the empty profile is emitted.
        let msg = stream.next().await.unwrap().unwrap();
        assert!(msg.routes.is_empty());

        // The service's own profile appears.
        secondary_tx
            .send(Some(profile_with_route("prod")))
            .unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(route_names(&msg), vec!["prod"]);

        // A caller-scoped profile takes precedence.
        primary_tx
            .send(Some(profile_with_route("client-ns")))
            .unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(route_names(&msg), vec!["client-ns"]);

        // Deleting the caller-scoped profile falls back to the service's.
        primary_tx.send(None).unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(route_names(&msg), vec!["prod"]);

        let drained = tokio::spawn(signal.drain());
        assert!(stream.next().await.is_none(), "drain must end the stream");
        drop(stream);
        drained.await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_profiles_follow_protocol_updates() {
        use linkerd_destination_controller_core::endpoints::PodRef;

        let address = Address {
            ip: "192.168.1.5".parse().unwrap(),
            port: port(9995),
            hostname: None,
            pod: Some(PodRef {
                namespace: "prod".to_string(),
                name: "metrics-0".to_string(),
                serviceaccount: Some("metrics".to_string()),
                owner: None,
                proxy_inbound_port: NonZeroU16::new(4143),
            }),
            identity: Some("metrics.prod.serviceaccount.identity.linkerd.cluster.local".into()),
            zone: None,
            opaque_protocol: false,
        };

        let (protocol_tx, protocol_rx) = watch::channel(false);
        let (_signal, drain) = drain::channel();
        let translator = EndpointProfileTranslator::new(Some(address), true);
        let mut stream = endpoint_response_stream(
            translator,
            false,
            Some(Box::pin(WatchStream::new(protocol_rx))),
            drain,
            Counter::default(),
        );

        let msg = stream.next().await.unwrap().unwrap();
        let endpoint = msg.endpoint.as_ref().expect("profile must carry the endpoint");
        assert_eq!(endpoint.metric_labels["namespace"], "prod");
        assert!(!msg.opaque_protocol);

        // A Server marking the port opaque re-emits the profile.
        protocol_tx.send(true).unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        assert!(msg.opaque_protocol);
        let hint = msg.endpoint.unwrap().protocol_hint.unwrap();
        assert_eq!(hint.opaque_transport.unwrap().inbound_port, 4143);
    }

    #[tokio::test]
    async fn unresolved_queries_emit_one_empty_profile() {
        let (_signal, drain) = drain::channel();
        let translator = EndpointProfileTranslator::new(None, true);
        let mut stream =
            endpoint_response_stream(translator, false, None, drain, Counter::default());

        let msg = stream.next().await.unwrap().unwrap();
        assert!(msg.endpoint.is_none());
        assert!(!msg.opaque_protocol);
        assert!(msg.retry_budget.is_some());
    }
}
