//! Indexes Servers and Pods to answer one question per (pod, port)
//! subscription: must the port be treated as opaque?

use ahash::AHashMap as HashMap;
use linkerd_destination_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::{num::NonZeroU16, sync::Arc};
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug, Default)]
pub struct Index {
    by_ns: HashMap<String, Namespace>,
}

#[derive(Debug, Default)]
struct Namespace {
    pods: HashMap<String, Pod>,
    servers: HashMap<String, Server>,
    watches: HashMap<(String, NonZeroU16), watch::Sender<bool>>,
}

#[derive(Debug)]
struct Pod {
    labels: k8s::Labels,
    named_ports: HashMap<String, NonZeroU16>,
}

#[derive(Debug)]
struct Server {
    selector: k8s::labels::Selector,
    port: k8s::policy::server::Port,
    opaque: bool,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Subscribes to the protocol `Server` resources declare for a pod's
    /// port. The receiver's initial value reflects the current state.
    pub fn protocol_rx(
        &mut self,
        namespace: &str,
        pod: &str,
        port: NonZeroU16,
    ) -> watch::Receiver<bool> {
        let ns = self.by_ns.entry(namespace.to_string()).or_default();
        let opaque = ns.opaque(pod, port);
        let tx = ns
            .watches
            .entry((pod.to_string(), port))
            .or_insert_with(move || watch::channel(opaque).0);
        tx.subscribe()
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("pod must be namespaced");
        let name = pod.name_unchecked();
        let labels = k8s::Labels::from(pod.metadata.labels);

        let mut named_ports = HashMap::default();
        for container in pod.spec.into_iter().flat_map(|spec| spec.containers) {
            for port in container.ports.into_iter().flatten() {
                if let (Some(name), Some(number)) = (
                    port.name,
                    u16::try_from(port.container_port)
                        .ok()
                        .and_then(NonZeroU16::new),
                ) {
                    named_ports.insert(name, number);
                }
            }
        }

        let ns = self.by_ns.entry(namespace).or_default();
        ns.pods.insert(
            name,
            Pod {
                labels,
                named_ports,
            },
        );
        ns.reindex();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.by_ns.get_mut(&namespace) {
            ns.pods.remove(&name);
            ns.reindex();
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
        let server = Server {
            selector: srv.spec.pod_selector,
            port: srv.spec.port,
            opaque: matches!(
                srv.spec.proxy_protocol,
                Some(k8s::policy::server::ProxyProtocol::Opaque)
            ),
        };

        let ns = self.by_ns.entry(namespace).or_default();
        ns.servers.insert(name, server);
        ns.reindex();
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ns) = self.by_ns.get_mut(&namespace) {
            ns.servers.remove(&name);
            ns.reindex();
            if ns.is_empty() {
                self.by_ns.remove(&namespace);
            }
        }
    }
}

// === impl Namespace ===

impl Namespace {
    fn is_empty(&self) -> bool {
        self.pods.is_empty() && self.servers.is_empty() && self.watches.is_empty()
    }

    fn opaque(&self, pod: &str, port: NonZeroU16) -> bool {
        let Some(pod) = self.pods.get(pod) else {
            return false;
        };
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

    fn reindex(&self) {
        for ((pod, port), tx) in &self.watches {
            let opaque = self.opaque(pod, *port);
            tx.send_if_modified(|current| {
                if *current == opaque {
                    false
                } else {
                    *current = opaque;
                    true
                }
            });
        }
    }
}
