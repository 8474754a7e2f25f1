use crate::{
    endpoints::{PodEndpoint, ServiceId},
    DiscoveryError,
};
use futures::prelude::*;
use std::{collections::BTreeSet, net::IpAddr, num::NonZeroU16, pin::Pin, time::Duration};

/// Identifies a ServiceProfile resource.
///
/// The namespace is the caller's namespace when a context token supplies one;
/// otherwise it is the service's own namespace.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ProfileId {
    pub namespace: String,

    /// The fully-qualified service name, e.g. `web.prod.svc.cluster.local`.
    pub name: String,
}

/// Per-service route and retry policy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Profile {
    pub routes: Vec<Route>,
    pub retry_budget: Option<RetryBudget>,
    pub opaque_ports: BTreeSet<NonZeroU16>,
    pub dst_overrides: Vec<WeightedDst>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub name: String,
    pub condition: RequestMatch,
    pub response_classes: Vec<ResponseClass>,
    pub is_retryable: bool,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestMatch {
    All(Vec<RequestMatch>),
    Any(Vec<RequestMatch>),
    Not(Box<RequestMatch>),

    /// A regular expression applied to the request path.
    Path(String),
    Method(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseClass {
    pub condition: ResponseMatch,
    pub is_failure: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseMatch {
    All(Vec<ResponseMatch>),
    Any(Vec<ResponseMatch>),
    Not(Box<ResponseMatch>),
    Status { min: u32, max: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBudget {
    pub min_retries_per_second: u32,
    pub retry_ratio: f32,
    pub ttl: Duration,
}

/// A traffic-split leaf: an authority and its share of the apex's traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedDst {
    pub authority: String,
    pub weight: u32,
}

/// `None` indicates the upstream reported "no profile" for the key.
pub type ProfileStream = Pin<Box<dyn Stream<Item = Option<Profile>> + Send + Sync + 'static>>;

pub type OpaquePortsStream =
    Pin<Box<dyn Stream<Item = BTreeSet<NonZeroU16>> + Send + Sync + 'static>>;

/// `true` indicates the pod port must be treated as opaque.
pub type ProtocolStream = Pin<Box<dyn Stream<Item = bool> + Send + Sync + 'static>>;

/// Models profile discovery for the `GetProfile` API.
#[async_trait::async_trait]
pub trait DiscoverProfiles {
    /// Begins watching a profile. The stream yields the current state first;
    /// `None` means no such profile exists.
    async fn watch_profile(&self, id: &ProfileId) -> ProfileStream;

    /// Begins watching the set of ports a service annotates as opaque.
    async fn watch_opaque_ports(&self, id: &ServiceId) -> OpaquePortsStream;

    /// Begins watching the protocol that `Server` resources declare for a
    /// pod's port.
    async fn watch_pod_protocol(&self, namespace: &str, pod: &str, port: NonZeroU16)
        -> ProtocolStream;

    /// Resolves a cluster IP to the service claiming it.
    fn lookup_service(&self, addr: IpAddr) -> Result<Option<ServiceId>, DiscoveryError>;

    /// Resolves an address to a pod, either via a host port or a pod IP.
    fn lookup_pod_endpoint(
        &self,
        addr: IpAddr,
        port: NonZeroU16,
    ) -> Result<Option<PodEndpoint>, DiscoveryError>;

    /// Resolves a per-instance hostname through a service's endpoints.
    fn endpoint_by_hostname(
        &self,
        id: &ServiceId,
        hostname: &str,
        port: NonZeroU16,
    ) -> Result<PodEndpoint, DiscoveryError>;
}
