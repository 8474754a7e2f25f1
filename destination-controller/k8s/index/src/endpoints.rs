//! Indexes Services, Endpoints, Pods, Nodes, and Servers to answer endpoint
//! discovery: per-(service, port, instance) address sets, the per-service
//! opaque-ports annotation, and IP reverse lookups.

use crate::{
    ports::{named_ports_annotation, ports_annotation, PortSet},
    ClusterInfo,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use linkerd_destination_controller_core::{
    endpoints::{Address, Endpoints, Owner, PodEndpoint, PodRef, ServiceId},
    DiscoveryError,
};
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    num::NonZeroU16,
    sync::Arc,
};
use tokio::sync::watch;

/// The label set on pods injected with a mesh proxy.
const MESH_LABEL: &str = "linkerd.io/control-plane-ns";

const OPAQUE_PORTS_ANNOTATION: &str = "config.linkerd.io/opaque-ports";
const SKIP_INBOUND_PORTS_ANNOTATION: &str = "config.linkerd.io/skip-inbound-ports";

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// The proxy's inbound port when the pod spec does not expose one by name.
const DEFAULT_PROXY_INBOUND_PORT: u16 = 4143;
const PROXY_CONTAINER_NAME: &str = "linkerd-proxy";

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    by_ns: HashMap<String, Namespace>,

    /// Node name to topology zone.
    nodes: HashMap<String, Option<String>>,

    /// Reverse lookups are multi-valued; conflicts are detected when a lookup
    /// is answered, not when entries are written, since watch events for the
    /// colliding resources may arrive in any order.
    services_by_ip: HashMap<IpAddr, HashSet<ServiceId>>,
    pods_by_ip: HashMap<IpAddr, HashSet<PodId>>,
    pods_by_host_port: HashMap<(IpAddr, NonZeroU16), HashSet<PodId>>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct PodId {
    namespace: String,
    name: String,
}

#[derive(Debug)]
struct Namespace {
    name: Arc<String>,
    services: HashMap<String, ServiceMeta>,
    endpoints: HashMap<String, Vec<Subset>>,
    pods: HashMap<String, PodMeta>,
    servers: HashMap<String, ServerMeta>,

    /// Endpoint subscriptions. Each sender holds the key's current view;
    /// subscribers synchronously observe it before any delta.
    watches: HashMap<EndpointsKey, watch::Sender<Endpoints>>,

    /// Per-service opaque-ports subscriptions.
    opaque_ports: HashMap<String, watch::Sender<BTreeSet<NonZeroU16>>>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct EndpointsKey {
    service: String,
    port: NonZeroU16,
    instance: Option<String>,
}

#[derive(Debug)]
struct ServiceMeta {
    cluster_ip: Option<IpAddr>,
    external_name: bool,
    /// (port, name) pairs from the service spec, used to match subset ports.
    ports: Vec<(NonZeroU16, Option<String>)>,
    /// The opaque-ports annotation; `None` when unannotated.
    opaque_ports: Option<PortSet>,
}

#[derive(Debug)]
struct Subset {
    addresses: Vec<EndpointAddr>,
    ports: Vec<(Option<String>, NonZeroU16)>,
}

#[derive(Debug)]
struct EndpointAddr {
    ip: IpAddr,
    hostname: Option<String>,
    /// The name of the backing pod, when the target reference is a pod in
    /// this namespace.
    pod: Option<String>,
}

#[derive(Debug)]
struct PodMeta {
    labels: k8s::Labels,
    meshed: bool,
    serviceaccount: Option<String>,
    node: Option<String>,
    ip: Option<IpAddr>,
    host_ip: Option<IpAddr>,
    host_ports: Vec<NonZeroU16>,
    named_ports: HashMap<String, NonZeroU16>,
    /// The opaque-ports annotation with names resolved; `None` when
    /// unannotated.
    opaque_ports: Option<PortSet>,
    skip_inbound_ports: PortSet,
    owner: Option<Owner>,
    proxy_inbound_port: Option<NonZeroU16>,
    terminal: bool,
    terminating: bool,
}

#[derive(Debug)]
struct ServerMeta {
    selector: k8s::labels::Selector,
    port: k8s::policy::server::Port,
    opaque: bool,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: Arc<ClusterInfo>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info,
            by_ns: HashMap::default(),
            nodes: HashMap::default(),
            services_by_ip: HashMap::default(),
            pods_by_ip: HashMap::default(),
            pods_by_host_port: HashMap::default(),
        }))
    }

    /// Subscribes to the endpoints backing a service port.
    ///
    /// The receiver's initial value is the current view; an unknown service
    /// is observed as `exists: false`. Services that cannot be resolved
    /// through the endpoints API (ExternalName) are rejected.
    pub fn endpoints_rx(
        &mut self,
        id: &ServiceId,
        port: NonZeroU16,
        instance: Option<&str>,
    ) -> Result<watch::Receiver<Endpoints>, DiscoveryError> {
        if let Some(svc) = self
            .by_ns
            .get(&id.namespace)
            .and_then(|ns| ns.services.get(&id.name))
        {
            if svc.external_name {
                return Err(DiscoveryError::InvalidService(id.to_string()));
            }
        }

        tracing::debug!(service = %id, %port, ?instance, "Subscribing to endpoints");
        let key = EndpointsKey {
            service: id.name.clone(),
            port,
            instance: instance.map(Into::into),
        };
        let view = self.endpoints_view(&id.namespace, &key);
        let ns = self.ns_or_default(&id.namespace);
        let tx = ns
            .watches
            .entry(key)
            .or_insert_with(move || watch::channel(view).0);
        Ok(tx.subscribe())
    }

    /// Subscribes to the set of ports a service annotates as opaque. An
    /// unknown or unannotated service is observed as the cluster default set.
    pub fn opaque_ports_rx(&mut self, id: &ServiceId) -> watch::Receiver<BTreeSet<NonZeroU16>> {
        let cluster = self.cluster_info.clone();
        let ns = self.ns_or_default(&id.namespace);
        let current = ns
            .services
            .get(&id.name)
            .and_then(|svc| svc.opaque_ports.as_ref())
            .unwrap_or(&cluster.default_opaque_ports);
        let current = to_port_list(current);
        let tx = ns
            .opaque_ports
            .entry(id.name.clone())
            .or_insert_with(move || watch::channel(current).0);
        tx.subscribe()
    }

    /// Resolves a cluster IP to the service claiming it. Fails when more than
    /// one service claims the address.
    pub fn lookup_service(&self, addr: IpAddr) -> Result<Option<ServiceId>, DiscoveryError> {
        let Some(ids) = self.services_by_ip.get(&addr) else {
            return Ok(None);
        };
        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.iter().next().cloned()),
            count => {
                tracing::warn!(%addr, %count, "Conflicting cluster IP claims");
                Err(DiscoveryError::Conflict {
                    kind: "services",
                    addr: addr.to_string(),
                    count,
                })
            }
        }
    }

    /// Resolves an address to a pod endpoint, checking host-network pods
    /// before the pod network. Pods that cannot receive traffic (terminal
    /// phase or terminating) are filtered here rather than at index time,
    /// since a pod's phase changes over its life.
    pub fn lookup_pod_endpoint(
        &self,
        addr: IpAddr,
        port: NonZeroU16,
    ) -> Result<Option<PodEndpoint>, DiscoveryError> {
        let host = self.receiving_pods(self.pods_by_host_port.get(&(addr, port)));
        if host.len() > 1 {
            tracing::warn!(%addr, %port, "Conflicting host network endpoints");
            return Err(DiscoveryError::Conflict {
                kind: "pods",
                addr: format!("{addr}:{port}"),
                count: host.len(),
            });
        }
        if let Some(pid) = host.first() {
            tracing::debug!(%addr, %port, "Found endpoint on the host network");
            return Ok(Some(self.mk_pod_endpoint(pid, addr, port)));
        }

        let by_ip = self.receiving_pods(self.pods_by_ip.get(&addr));
        if by_ip.len() > 1 {
            tracing::warn!(%addr, "Conflicting pod network IPs");
            return Err(DiscoveryError::Conflict {
                kind: "pods",
                addr: addr.to_string(),
                count: by_ip.len(),
            });
        }
        if let Some(pid) = by_ip.first() {
            tracing::debug!(%addr, "Found endpoint on the pod network");
            return Ok(Some(self.mk_pod_endpoint(pid, addr, port)));
        }

        tracing::debug!(%addr, %port, "No pod found");
        Ok(None)
    }

    /// Resolves a per-instance hostname through a service's endpoints
    /// subsets.
    pub fn endpoint_by_hostname(
        &self,
        id: &ServiceId,
        hostname: &str,
        port: NonZeroU16,
    ) -> Result<PodEndpoint, DiscoveryError> {
        let not_found = || DiscoveryError::UnknownHostname {
            service: id.clone(),
            hostname: hostname.to_string(),
        };

        let ns = self.by_ns.get(&id.namespace).ok_or_else(not_found)?;
        for subset in ns.endpoints.get(&id.name).into_iter().flatten() {
            for addr in &subset.addresses {
                if addr.hostname.as_deref() != Some(hostname) {
                    continue;
                }

                if let Some(pid) = addr.pod.as_ref().map(|name| PodId {
                    namespace: id.namespace.clone(),
                    name: name.clone(),
                }) {
                    if ns.pods.contains_key(&pid.name) {
                        return Ok(self.mk_pod_endpoint(&pid, addr.ip, port));
                    }
                }

                // The address is not backed by a pod we know about.
                return Ok(PodEndpoint {
                    address: Address {
                        ip: addr.ip,
                        port,
                        hostname: Some(hostname.to_string()),
                        pod: None,
                        identity: None,
                        zone: None,
                        opaque_protocol: false,
                    },
                    opaque_annotated: self.cluster_info.default_opaque_ports.contains(&port),
                });
            }
        }

        Err(not_found())
    }

    /// Reads the topology zone of a node.
    pub fn node_zone(&self, name: &str) -> Option<String> {
        self.nodes.get(name).cloned().flatten()
    }

    pub fn service_count(&self) -> usize {
        self.by_ns.values().map(|ns| ns.services.len()).sum()
    }

    pub fn pod_count(&self) -> usize {
        self.by_ns.values().map(|ns| ns.pods.len()).sum()
    }

    pub fn endpoint_watch_count(&self) -> usize {
        self.by_ns
            .values()
            .map(|ns| ns.watches.len() + ns.opaque_ports.len())
            .sum()
    }

    fn ns_or_default(&mut self, namespace: &str) -> &mut Namespace {
        self.by_ns
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace::new(namespace.to_string()))
    }

    /// Recomputes and republishes every endpoint view in a namespace.
    fn reindex_endpoints(&mut self, namespace: &str) {
        let keys: Vec<EndpointsKey> = match self.by_ns.get(namespace) {
            Some(ns) => ns.watches.keys().cloned().collect(),
            None => return,
        };
        let views: Vec<(EndpointsKey, Endpoints)> = keys
            .into_iter()
            .map(|key| {
                let view = self.endpoints_view(namespace, &key);
                (key, view)
            })
            .collect();

        if let Some(ns) = self.by_ns.get_mut(namespace) {
            for (key, view) in views {
                if let Some(tx) = ns.watches.get(&key) {
                    tx.send_if_modified(|current| {
                        if *current == view {
                            false
                        } else {
                            *current = view;
                            true
                        }
                    });
                }
            }
        }
    }

    fn reindex_all(&mut self) {
        let namespaces: Vec<String> = self.by_ns.keys().cloned().collect();
        for ns in namespaces {
            self.reindex_endpoints(&ns);
        }
    }

    /// Computes the current view for an endpoints key.
    fn endpoints_view(&self, namespace: &str, key: &EndpointsKey) -> Endpoints {
        let Some(ns) = self.by_ns.get(namespace) else {
            return Endpoints::default();
        };
        let Some(svc) = ns.services.get(&key.service) else {
            return Endpoints::default();
        };
        if svc.external_name {
            return Endpoints::default();
        }

        let port_name = svc
            .ports
            .iter()
            .find(|(p, _)| *p == key.port)
            .and_then(|(_, name)| name.as_deref());

        let mut addresses = BTreeMap::new();
        for subset in ns.endpoints.get(&key.service).into_iter().flatten() {
            let Some(port) = subset.resolve_port(port_name) else {
                continue;
            };
            for ep in &subset.addresses {
                if let Some(instance) = key.instance.as_deref() {
                    if ep.hostname.as_deref() != Some(instance) {
                        continue;
                    }
                }
                let address = self.mk_address(ns, svc, ep, port);
                addresses.insert(address.socket_addr(), address);
            }
        }

        Endpoints {
            exists: true,
            addresses,
        }
    }

    fn mk_address(
        &self,
        ns: &Namespace,
        svc: &ServiceMeta,
        ep: &EndpointAddr,
        port: NonZeroU16,
    ) -> Address {
        let cluster = &*self.cluster_info;
        let svc_opaque = svc
            .opaque_ports
            .as_ref()
            .unwrap_or(&cluster.default_opaque_ports);
        let mut opaque = svc_opaque.contains(&port);

        let mut identity = None;
        let mut zone = None;
        let mut pod = None;
        if let Some((name, meta)) = ep
            .pod
            .as_deref()
            .and_then(|name| ns.pods.get(name).map(|meta| (name, meta)))
        {
            if let Some(annotated) = meta.opaque_ports.as_ref() {
                if annotated.contains(&port) {
                    opaque = true;
                }
            }
            if ns.server_opaque(meta, port) {
                opaque = true;
            }
            if meta.meshed && !meta.skip_inbound_ports.contains(&port) {
                identity = Some(cluster.service_account_identity(
                    &ns.name,
                    meta.serviceaccount.as_deref().unwrap_or("default"),
                ));
            }
            zone = meta
                .node
                .as_deref()
                .and_then(|node| self.nodes.get(node))
                .cloned()
                .flatten();
            pod = Some(PodRef {
                namespace: ns.name.to_string(),
                name: name.to_string(),
                serviceaccount: meta.serviceaccount.clone(),
                owner: meta.owner.clone(),
                proxy_inbound_port: meta.proxy_inbound_port,
            });
        }

        Address {
            ip: ep.ip,
            port,
            hostname: ep.hostname.clone(),
            pod,
            identity,
            zone,
            opaque_protocol: opaque,
        }
    }

    fn mk_pod_endpoint(&self, pid: &PodId, ip: IpAddr, port: NonZeroU16) -> PodEndpoint {
        let cluster = &*self.cluster_info;
        let ns = &self.by_ns[&pid.namespace];
        let meta = &ns.pods[&pid.name];

        let opaque_annotated = meta.opaque_ports_or_default(cluster).contains(&port);
        let identity = if meta.meshed && !meta.skip_inbound_ports.contains(&port) {
            Some(cluster.service_account_identity(
                &pid.namespace,
                meta.serviceaccount.as_deref().unwrap_or("default"),
            ))
        } else {
            None
        };
        let zone = meta
            .node
            .as_deref()
            .and_then(|node| self.nodes.get(node))
            .cloned()
            .flatten();

        PodEndpoint {
            address: Address {
                ip,
                port,
                hostname: None,
                pod: Some(PodRef {
                    namespace: pid.namespace.clone(),
                    name: pid.name.clone(),
                    serviceaccount: meta.serviceaccount.clone(),
                    owner: meta.owner.clone(),
                    proxy_inbound_port: meta.proxy_inbound_port,
                }),
                identity,
                zone,
                opaque_protocol: ns.server_opaque(meta, port),
            },
            opaque_annotated,
        }
    }

    fn receiving_pods<'a>(&'a self, ids: Option<&'a HashSet<PodId>>) -> Vec<&'a PodId> {
        ids.into_iter()
            .flatten()
            .filter(|pid| {
                self.by_ns
                    .get(&pid.namespace)
                    .and_then(|ns| ns.pods.get(&pid.name))
                    .map(|meta| meta.receiving_traffic())
                    .unwrap_or(false)
            })
            .collect()
    }

    fn unlink_pod(&mut self, pid: &PodId, meta: &PodMeta) {
        if let Some(ip) = meta.ip {
            unlink(&mut self.pods_by_ip, ip, pid);
        }
        if let Some(host_ip) = meta.host_ip {
            for port in &meta.host_ports {
                unlink(&mut self.pods_by_host_port, (host_ip, *port), pid);
            }
        }
    }

    fn link_pod(&mut self, pid: &PodId, meta: &PodMeta) {
        if let Some(ip) = meta.ip {
            self.pods_by_ip.entry(ip).or_default().insert(pid.clone());
        }
        if let Some(host_ip) = meta.host_ip {
            for port in &meta.host_ports {
                self.pods_by_host_port
                    .entry((host_ip, *port))
                    .or_default()
                    .insert(pid.clone());
            }
        }
    }
}

fn unlink<K: std::hash::Hash + Eq, V: std::hash::Hash + Eq>(
    map: &mut HashMap<K, HashSet<V>>,
    key: K,
    value: &V,
) {
    if let Some(set) = map.get_mut(&key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(&key);
        }
    }
}

fn to_port_list(ports: &PortSet) -> BTreeSet<NonZeroU16> {
    ports.iter().copied().collect()
}

// === indexing ===

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        let namespace = svc.namespace().expect("service must be namespaced");
        let name = svc.name_unchecked();
        let id = ServiceId::new(namespace.clone(), name.clone());
        let meta = service_meta(&svc);

        let old_ip = self
            .by_ns
            .get(&namespace)
            .and_then(|ns| ns.services.get(&name))
            .and_then(|svc| svc.cluster_ip);
        if old_ip != meta.cluster_ip {
            if let Some(ip) = old_ip {
                unlink(&mut self.services_by_ip, ip, &id);
            }
            if let Some(ip) = meta.cluster_ip {
                self.services_by_ip.entry(ip).or_default().insert(id);
            }
        }

        let opaque = to_port_list(
            meta.opaque_ports
                .as_ref()
                .unwrap_or(&self.cluster_info.default_opaque_ports),
        );
        let ns = self.ns_or_default(&namespace);
        ns.services.insert(name.clone(), meta);
        if let Some(tx) = ns.opaque_ports.get(&name) {
            tx.send_if_modified(|current| {
                if *current == opaque {
                    false
                } else {
                    *current = opaque;
                    true
                }
            });
        }

        self.reindex_endpoints(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ServiceId::new(namespace.clone(), name.clone());
        let default_opaque = to_port_list(&self.cluster_info.default_opaque_ports);

        let Some(ns) = self.by_ns.get_mut(&namespace) else {
            return;
        };
        let Some(meta) = ns.services.remove(&name) else {
            return;
        };

        // Deleting a service ends its endpoint subscriptions: each observes
        // `exists: false` and then the end of the stream.
        let keys: Vec<EndpointsKey> = ns
            .watches
            .keys()
            .filter(|key| key.service == name)
            .cloned()
            .collect();
        for key in keys {
            if let Some(tx) = ns.watches.remove(&key) {
                tx.send_replace(Endpoints::default());
            }
        }

        if let Some(tx) = ns.opaque_ports.get(&name) {
            tx.send_if_modified(|current| {
                if *current == default_opaque {
                    false
                } else {
                    *current = default_opaque.clone();
                    true
                }
            });
        }

        if ns.is_empty() {
            self.by_ns.remove(&namespace);
        }
        if let Some(ip) = meta.cluster_ip {
            unlink(&mut self.services_by_ip, ip, &id);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, eps: k8s::Endpoints) {
        let namespace = eps.namespace().expect("endpoints must be namespaced");
        let name = eps.name_unchecked();
        let subsets: Vec<Subset> = eps
            .subsets
            .into_iter()
            .flatten()
            .map(convert_subset)
            .collect();
        self.ns_or_default(&namespace).endpoints.insert(name, subsets);
        self.reindex_endpoints(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.by_ns.get_mut(&namespace) {
            ns.endpoints.remove(&name);
            self.reindex_endpoints(&namespace);
            if let Some(ns) = self.by_ns.get(&namespace) {
                if ns.is_empty() {
                    self.by_ns.remove(&namespace);
                }
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("pod must be namespaced");
        let name = pod.name_unchecked();
        let pid = PodId {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        let meta = pod_meta(pod);

        if let Some(old) = self
            .by_ns
            .get_mut(&namespace)
            .and_then(|ns| ns.pods.remove(&name))
        {
            self.unlink_pod(&pid, &old);
        }
        self.link_pod(&pid, &meta);
        self.ns_or_default(&namespace).pods.insert(name, meta);
        self.reindex_endpoints(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let pid = PodId {
            namespace: namespace.clone(),
            name,
        };
        let Some(meta) = self
            .by_ns
            .get_mut(&namespace)
            .and_then(|ns| ns.pods.remove(&pid.name))
        else {
            return;
        };
        self.unlink_pod(&pid, &meta);
        self.reindex_endpoints(&namespace);
        if let Some(ns) = self.by_ns.get(&namespace) {
            if ns.is_empty() {
                self.by_ns.remove(&namespace);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::policy::Server> for Index {
    fn apply(&mut self, srv: k8s::policy::Server) {
        let namespace = srv.namespace().expect("server must be namespaced");
        let name = srv.name_unchecked();
        let meta = ServerMeta {
            selector: srv.spec.pod_selector,
            port: srv.spec.port,
            opaque: matches!(
                srv.spec.proxy_protocol,
                Some(k8s::policy::server::ProxyProtocol::Opaque)
            ),
        };
        self.ns_or_default(&namespace).servers.insert(name, meta);
        self.reindex_endpoints(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.by_ns.get_mut(&namespace) {
            ns.servers.remove(&name);
            self.reindex_endpoints(&namespace);
            if let Some(ns) = self.by_ns.get(&namespace) {
                if ns.is_empty() {
                    self.by_ns.remove(&namespace);
                }
            }
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let zone = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(ZONE_LABEL))
            .cloned();
        let prev = self.nodes.insert(name, zone.clone());
        // Node updates are frequent (heartbeats); only recompute views when
        // the zone actually changed.
        if prev.as_ref() != Some(&zone) {
            self.reindex_all();
        }
    }

    fn delete(&mut self, name: String) {
        if self.nodes.remove(&name).flatten().is_some() {
            self.reindex_all();
        }
    }
}

// === impl Namespace ===

impl Namespace {
    fn new(name: String) -> Self {
        Self {
            name: Arc::new(name),
            services: HashMap::default(),
            endpoints: HashMap::default(),
            pods: HashMap::default(),
            servers: HashMap::default(),
            watches: HashMap::default(),
            opaque_ports: HashMap::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.endpoints.is_empty()
            && self.pods.is_empty()
            && self.servers.is_empty()
            && self.watches.is_empty()
            && self.opaque_ports.is_empty()
    }

    /// Indicates whether a `Server` declares the pod's port opaque.
    fn server_opaque(&self, pod: &PodMeta, port: NonZeroU16) -> bool {
        self.servers.values().any(|srv| {
            srv.opaque
                && srv.selector.matches(&pod.labels)
                && match &srv.port {
                    k8s::policy::server::Port::Number(n) => *n == port.get(),
                    k8s::policy::server::Port::Name(name) => {
                        pod.named_ports.get(name) == Some(&port)
                    }
                }
        })
    }
}

// === impl PodMeta ===

impl PodMeta {
    fn receiving_traffic(&self) -> bool {
        !self.terminal && !self.terminating
    }

    fn opaque_ports_or_default<'a>(&'a self, cluster: &'a ClusterInfo) -> &'a PortSet {
        self.opaque_ports
            .as_ref()
            .unwrap_or(&cluster.default_opaque_ports)
    }
}

// === impl Subset ===

impl Subset {
    /// Finds the subset port backing a service port: by name when the service
    /// port is named, otherwise the subset's single (or unnamed) port.
    fn resolve_port(&self, port_name: Option<&str>) -> Option<NonZeroU16> {
        if let Some(name) = port_name {
            return self
                .ports
                .iter()
                .find(|(n, _)| n.as_deref() == Some(name))
                .map(|(_, p)| *p);
        }
        if self.ports.len() == 1 {
            return Some(self.ports[0].1);
        }
        self.ports.iter().find(|(n, _)| n.is_none()).map(|(_, p)| *p)
    }
}

// === conversions ===

fn service_meta(svc: &k8s::Service) -> ServiceMeta {
    let spec = svc.spec.clone().unwrap_or_default();
    let cluster_ip = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .and_then(|ip| {
            ip.parse()
                .map_err(|error| tracing::warn!(%error, %ip, "Invalid cluster IP"))
                .ok()
        });
    let external_name = spec.type_.as_deref() == Some("ExternalName");
    let ports = spec
        .ports
        .into_iter()
        .flatten()
        .filter_map(|p: k8s::ServicePort| {
            let port = u16::try_from(p.port).ok().and_then(NonZeroU16::new)?;
            Some((port, p.name))
        })
        .collect();
    let opaque_ports = svc
        .metadata
        .annotations
        .as_ref()
        .and_then(|anns| ports_annotation(anns, OPAQUE_PORTS_ANNOTATION));

    ServiceMeta {
        cluster_ip,
        external_name,
        ports,
        opaque_ports,
    }
}

fn convert_subset(subset: k8s::EndpointSubset) -> Subset {
    let addresses = subset
        .addresses
        .into_iter()
        .flatten()
        .filter_map(|addr: k8s::EndpointAddress| {
            let ip = addr
                .ip
                .parse()
                .map_err(|error| tracing::warn!(%error, ip = %addr.ip, "Invalid endpoint IP"))
                .ok()?;
            let pod = addr
                .target_ref
                .filter(|target| target.kind.as_deref() == Some("Pod"))
                .and_then(|target| target.name);
            Some(EndpointAddr {
                ip,
                hostname: addr.hostname,
                pod,
            })
        })
        .collect();
    let ports = subset
        .ports
        .into_iter()
        .flatten()
        .filter_map(|p: k8s::EndpointPort| {
            if !matches!(p.protocol.as_deref(), None | Some("TCP")) {
                return None;
            }
            let port = u16::try_from(p.port).ok().and_then(NonZeroU16::new)?;
            Some((p.name, port))
        })
        .collect();
    Subset { addresses, ports }
}

fn pod_meta(pod: k8s::Pod) -> PodMeta {
    let labels = k8s::Labels::from(pod.metadata.labels);
    let meshed = labels.contains_key(MESH_LABEL);
    let terminating = pod.metadata.deletion_timestamp.is_some();

    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();

    let mut named_ports = HashMap::default();
    let mut host_ports = Vec::new();
    let mut proxy_inbound_port = None;
    for container in &spec.containers {
        for port in container.ports.iter().flatten() {
            let Some(number) = u16::try_from(port.container_port)
                .ok()
                .and_then(NonZeroU16::new)
            else {
                continue;
            };
            if let Some(name) = &port.name {
                named_ports.insert(name.clone(), number);
                if container.name == PROXY_CONTAINER_NAME && name == PROXY_CONTAINER_NAME {
                    proxy_inbound_port = Some(number);
                }
            }
            if let Some(host_port) = port
                .host_port
                .and_then(|p| u16::try_from(p).ok())
                .and_then(NonZeroU16::new)
            {
                host_ports.push(host_port);
            }
        }
    }
    if meshed && proxy_inbound_port.is_none() {
        proxy_inbound_port = NonZeroU16::new(DEFAULT_PROXY_INBOUND_PORT);
    }

    let annotations = pod.metadata.annotations.unwrap_or_default();
    let opaque_ports = named_ports_annotation(&annotations, OPAQUE_PORTS_ANNOTATION, &named_ports);
    let skip_inbound_ports =
        ports_annotation(&annotations, SKIP_INBOUND_PORTS_ANNOTATION).unwrap_or_default();

    let owner = pod
        .metadata
        .owner_references
        .into_iter()
        .flatten()
        .find(|reference| reference.controller == Some(true))
        .map(|reference| Owner {
            kind: reference.kind.to_ascii_lowercase(),
            name: reference.name,
        });

    PodMeta {
        labels,
        meshed,
        serviceaccount: spec.service_account_name,
        node: spec.node_name,
        ip: status.pod_ip.as_deref().and_then(|ip| ip.parse().ok()),
        host_ip: status.host_ip.as_deref().and_then(|ip| ip.parse().ok()),
        host_ports,
        named_ports,
        opaque_ports,
        skip_inbound_ports,
        owner,
        proxy_inbound_port,
        terminal: matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")),
        terminating,
    }
}
