//! Translates endpoint views into `Update` messages for a single `Get`
//! stream.

use futures::prelude::*;
use linkerd2_proxy_api::{
    destination::{
        self as pb,
        protocol_hint,
        tls_identity::{DnsLikeIdentity, Strategy},
        ProtocolHint, TlsIdentity, Update, WeightedAddr,
    },
    net,
};
use linkerd_destination_controller_core::endpoints::{
    Address, Endpoints, EndpointsStream, ServiceId,
};
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    pin::Pin,
};

/// Every endpoint carries the same weight; traffic splits are applied by the
/// profile path, not here.
const DEFAULT_WEIGHT: u32 = 10_000;

pub type BoxGetStream =
    Pin<Box<dyn Stream<Item = Result<Update, tonic::Status>> + Send + Sync + 'static>>;

/// Stream-bound state converting endpoint views into a minimal sequence of
/// `Add`/`Remove`/`NoEndpoints` messages.
#[derive(Debug)]
pub(crate) struct EndpointTranslator {
    service: ServiceId,
    enable_h2_upgrade: bool,

    /// The querying proxy's topology zone, used to label endpoint locality.
    client_zone: Option<String>,

    state: State,
    current: BTreeMap<SocketAddr, Address>,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Init,
    NotExists,
    Empty,
    Active,
}

// === impl EndpointTranslator ===

impl EndpointTranslator {
    pub(crate) fn new(
        service: ServiceId,
        enable_h2_upgrade: bool,
        client_zone: Option<String>,
    ) -> Self {
        Self {
            service,
            enable_h2_upgrade,
            client_zone,
            state: State::Init,
            current: BTreeMap::new(),
        }
    }

    /// Computes the messages that reconcile the stream with a new view.
    /// Unchanged addresses produce nothing, so consecutive identical views
    /// are coalesced.
    pub(crate) fn update(&mut self, view: &Endpoints) -> Vec<Update> {
        if !view.exists {
            self.current.clear();
            if self.state == State::NotExists {
                return Vec::new();
            }
            self.state = State::NotExists;
            return vec![no_endpoints(false)];
        }

        if view.addresses.is_empty() {
            self.current.clear();
            if self.state == State::Empty {
                return Vec::new();
            }
            self.state = State::Empty;
            return vec![no_endpoints(true)];
        }

        let added: Vec<&Address> = view
            .addresses
            .iter()
            .filter(|(sa, addr)| self.current.get(sa) != Some(addr))
            .map(|(_, addr)| addr)
            .collect();
        let removed: Vec<SocketAddr> = self
            .current
            .keys()
            .filter(|sa| !view.addresses.contains_key(sa))
            .copied()
            .collect();

        let mut updates = Vec::new();
        if !added.is_empty() {
            updates.push(self.add(&added));
        }
        if !removed.is_empty() {
            updates.push(remove(removed));
        }

        self.state = State::Active;
        self.current = view.addresses.clone();
        updates
    }

    fn add(&self, addrs: &[&Address]) -> Update {
        let mut metric_labels = HashMap::new();
        metric_labels.insert("namespace".to_string(), self.service.namespace.clone());
        metric_labels.insert("service".to_string(), self.service.name.clone());

        Update {
            update: Some(pb::update::Update::Add(pb::WeightedAddrSet {
                addrs: addrs
                    .iter()
                    .map(|addr| {
                        to_weighted_addr(
                            addr,
                            addr.opaque_protocol,
                            self.enable_h2_upgrade,
                            self.client_zone.as_deref(),
                        )
                    })
                    .collect(),
                metric_labels,
            })),
        }
    }
}

fn remove(addrs: Vec<SocketAddr>) -> Update {
    Update {
        update: Some(pb::update::Update::Remove(pb::AddrSet {
            addrs: addrs.into_iter().map(to_tcp_address).collect(),
        })),
    }
}

fn no_endpoints(exists: bool) -> Update {
    Update {
        update: Some(pb::update::Update::NoEndpoints(pb::NoEndpoints { exists })),
    }
}

/// Builds the wire representation of an endpoint.
pub(crate) fn to_weighted_addr(
    addr: &Address,
    opaque: bool,
    enable_h2_upgrade: bool,
    client_zone: Option<&str>,
) -> WeightedAddr {
    let mut metric_labels = HashMap::new();
    if let Some(pod) = &addr.pod {
        metric_labels.insert("pod".to_string(), pod.name.clone());
        if let Some(sa) = &pod.serviceaccount {
            metric_labels.insert("serviceaccount".to_string(), sa.clone());
        }
        if let Some(owner) = &pod.owner {
            metric_labels.insert(owner.kind.clone(), owner.name.clone());
        }
    }
    if let (Some(zone), Some(client_zone)) = (addr.zone.as_deref(), client_zone) {
        let locality = if zone == client_zone { "local" } else { "remote" };
        metric_labels.insert("zone_locality".to_string(), locality.to_string());
    }

    let tls_identity = addr.identity.as_ref().map(|name| TlsIdentity {
        strategy: Some(Strategy::DnsLikeIdentity(DnsLikeIdentity {
            name: name.clone(),
        })),
        ..Default::default()
    });

    WeightedAddr {
        addr: Some(to_tcp_address(addr.socket_addr())),
        weight: DEFAULT_WEIGHT,
        metric_labels,
        tls_identity,
        protocol_hint: protocol_hint(addr, opaque, enable_h2_upgrade),
        ..Default::default()
    }
}

/// The protocol hint advertises how the endpoint's proxy can be addressed.
/// Endpoints without a proxy on the target port get no hint.
fn protocol_hint(addr: &Address, opaque: bool, enable_h2_upgrade: bool) -> Option<ProtocolHint> {
    if addr.identity.is_none() {
        return None;
    }
    if opaque {
        return Some(ProtocolHint {
            protocol: Some(protocol_hint::Protocol::Opaque(protocol_hint::Opaque {})),
            opaque_transport: addr
                .pod
                .as_ref()
                .and_then(|pod| pod.proxy_inbound_port)
                .map(|port| protocol_hint::OpaqueTransport {
                    inbound_port: port.get().into(),
                }),
        });
    }
    if enable_h2_upgrade {
        return Some(ProtocolHint {
            protocol: Some(protocol_hint::Protocol::H2(protocol_hint::H2 {})),
            opaque_transport: None,
        });
    }
    None
}

fn to_tcp_address(sa: SocketAddr) -> net::TcpAddress {
    net::TcpAddress {
        ip: Some(sa.ip().into()),
        port: sa.port().into(),
    }
}

/// Drives a `Get` stream: each new endpoints view is translated into updates
/// until the subscription ends or the server drains.
pub(crate) fn response_stream(
    mut translator: EndpointTranslator,
    mut endpoints: EndpointsStream,
    drain: drain::Watch,
    updates: Counter,
) -> BoxGetStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                res = endpoints.next() => match res {
                    Some(view) => {
                        for update in translator.update(&view) {
                            updates.inc();
                            yield update;
                        }
                    }
                    // The watch ends when the service is deleted.
                    None => return,
                },

                // If the server starts shutting down, close the stream so that it
                // doesn't hold the server open.
                _ = (&mut shutdown) => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_destination_controller_core::endpoints::{Owner, PodRef};
    use std::num::NonZeroU16;

    fn addr(ip: &str, port: u16, meshed: bool) -> Address {
        Address {
            ip: ip.parse().unwrap(),
            port: NonZeroU16::new(port).unwrap(),
            hostname: None,
            pod: Some(PodRef {
                namespace: "prod".to_string(),
                name: format!("web-{ip}"),
                serviceaccount: Some("web".to_string()),
                owner: Some(Owner {
                    kind: "deployment".to_string(),
                    name: "web".to_string(),
                }),
                proxy_inbound_port: NonZeroU16::new(4143),
            }),
            identity: meshed
                .then(|| "web.prod.serviceaccount.identity.linkerd.cluster.local".to_string()),
            zone: None,
            opaque_protocol: false,
        }
    }

    fn view(addrs: &[Address]) -> Endpoints {
        Endpoints {
            exists: true,
            addresses: addrs.iter().map(|a| (a.socket_addr(), a.clone())).collect(),
        }
    }

    fn mk_translator() -> EndpointTranslator {
        EndpointTranslator::new(ServiceId::new("prod", "web"), true, None)
    }

    fn added(update: &Update) -> Vec<SocketAddr> {
        match update.update.as_ref().unwrap() {
            pb::update::Update::Add(set) => set
                .addrs
                .iter()
                .map(|wa| {
                    let tcp = wa.addr.as_ref().unwrap();
                    let ip = match tcp.ip.as_ref().and_then(|ip| ip.ip.as_ref()).unwrap() {
                        net::ip_address::Ip::Ipv4(octets) => {
                            std::net::IpAddr::from(std::net::Ipv4Addr::from(*octets))
                        }
                        ip => panic!("unexpected address {ip:?}"),
                    };
                    SocketAddr::new(ip, tcp.port as u16)
                })
                .collect(),
            update => panic!("expected an add, got {update:?}"),
        }
    }

    #[test]
    fn diffs_views_into_adds_and_removes() {
        let mut translator = mk_translator();
        let a = addr("10.0.0.1", 8080, true);
        let b = addr("10.0.0.2", 8080, true);

        let updates = translator.update(&view(&[a.clone(), b.clone()]));
        assert_eq!(updates.len(), 1);
        assert_eq!(
            added(&updates[0]),
            vec![a.socket_addr(), b.socket_addr()],
            "the snapshot is sent as one add"
        );

        // An identical view is coalesced.
        assert!(translator.update(&view(&[a.clone(), b.clone()])).is_empty());

        let updates = translator.update(&view(&[b.clone()]));
        assert_eq!(updates.len(), 1);
        match updates[0].update.as_ref().unwrap() {
            pb::update::Update::Remove(set) => {
                assert_eq!(set.addrs.len(), 1);
                assert_eq!(set.addrs[0].port, 8080);
            }
            update => panic!("expected a remove, got {update:?}"),
        }

        // Scaling to zero reports an extant service with no endpoints.
        let updates = translator.update(&Endpoints {
            exists: true,
            addresses: Default::default(),
        });
        assert!(matches!(
            updates[0].update,
            Some(pb::update::Update::NoEndpoints(pb::NoEndpoints { exists: true }))
        ));

        // Deleting the service reports that it no longer exists.
        let updates = translator.update(&Endpoints::default());
        assert!(matches!(
            updates[0].update,
            Some(pb::update::Update::NoEndpoints(pb::NoEndpoints {
                exists: false
            }))
        ));
        assert!(
            translator.update(&Endpoints::default()).is_empty(),
            "repeated no-endpoints states are coalesced"
        );
    }

    #[test]
    fn meshed_endpoints_carry_identity_and_h2_hint() {
        let wa = to_weighted_addr(&addr("10.0.0.1", 8080, true), false, true, None);
        assert!(wa.tls_identity.is_some());
        assert!(matches!(
            wa.protocol_hint.as_ref().unwrap().protocol,
            Some(protocol_hint::Protocol::H2(_))
        ));
        assert_eq!(wa.weight, DEFAULT_WEIGHT);
        assert_eq!(wa.metric_labels["deployment"], "web");

        let wa = to_weighted_addr(&addr("10.0.0.1", 8080, false), false, true, None);
        assert!(wa.tls_identity.is_none(), "unmeshed endpoints have no identity");
        assert!(wa.protocol_hint.is_none(), "unmeshed endpoints have no hint");
    }

    #[test]
    fn opaque_endpoints_hint_opaque_transport() {
        let wa = to_weighted_addr(&addr("10.0.0.1", 3306, true), true, true, None);
        let hint = wa.protocol_hint.expect("hint must be set");
        assert!(matches!(
            hint.protocol,
            Some(protocol_hint::Protocol::Opaque(_))
        ));
        assert_eq!(hint.opaque_transport.unwrap().inbound_port, 4143);
    }

    #[test]
    fn zone_locality_compares_client_and_endpoint_zones() {
        let mut a = addr("10.0.0.1", 8080, true);
        a.zone = Some("us-east-1a".to_string());

        let wa = to_weighted_addr(&a, false, true, Some("us-east-1a"));
        assert_eq!(wa.metric_labels["zone_locality"], "local");

        let wa = to_weighted_addr(&a, false, true, Some("us-east-1b"));
        assert_eq!(wa.metric_labels["zone_locality"], "remote");

        let wa = to_weighted_addr(&a, false, true, None);
        assert!(!wa.metric_labels.contains_key("zone_locality"));
    }
}
