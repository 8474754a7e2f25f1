use crate::DiscoveryError;
use futures::prelude::*;
use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    pin::Pin,
};

/// Identifies a Service within the cluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

/// One reachable address backing a service port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ip: IpAddr,
    pub port: NonZeroU16,

    /// The per-instance hostname published by the Endpoints controller, when
    /// the backing workload has a stable identity (e.g. a StatefulSet pod).
    pub hostname: Option<String>,

    /// The backing pod, when the endpoint address targets one.
    pub pod: Option<PodRef>,

    /// The endpoint's mesh TLS identity. Unset when the pod is not meshed or
    /// the target port bypasses the inbound proxy.
    pub identity: Option<String>,

    /// The topology zone of the node hosting the endpoint.
    pub zone: Option<String>,

    /// Indicates that connections to this endpoint must not be protocol
    /// detected.
    pub opaque_protocol: bool,
}

/// References the pod backing an endpoint, along with the metadata projected
/// into per-endpoint metric labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub serviceaccount: Option<String>,
    pub owner: Option<Owner>,

    /// The proxy's inbound port, carried on opaque-transport protocol hints.
    pub proxy_inbound_port: Option<NonZeroU16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub kind: String,
    pub name: String,
}

/// The complete set of addresses for an endpoints subscription key.
///
/// `exists` distinguishes a service that currently has no ready endpoints
/// from a service that is not known to the cluster at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub exists: bool,
    pub addresses: BTreeMap<SocketAddr, Address>,
}

/// An endpoint resolved for a profile query, along with whether its port was
/// annotated as opaque on the pod itself.
///
/// An annotated port is opaque unconditionally, so the caller need not watch
/// `Server` resources for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodEndpoint {
    pub address: Address,
    pub opaque_annotated: bool,
}

pub type EndpointsStream = Pin<Box<dyn Stream<Item = Endpoints> + Send + Sync + 'static>>;

/// Models endpoint discovery for the `Get` API.
#[async_trait::async_trait]
pub trait DiscoverEndpoints {
    /// Begins watching the addresses backing a service port, optionally
    /// restricted to a single named instance.
    ///
    /// The returned stream yields the current view before any subsequent
    /// change. The stream ends when the service is deleted.
    async fn watch_endpoints(
        &self,
        id: &ServiceId,
        port: NonZeroU16,
        instance: Option<&str>,
    ) -> Result<EndpointsStream, DiscoveryError>;

    /// Reads the topology zone of a node, if the node is known.
    fn node_zone(&self, name: &str) -> Option<String>;
}

// === impl ServiceId ===

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Address ===

impl Address {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port.get())
    }
}
