//! Indexes ServiceProfiles, publishing a converted view per (namespace,
//! fully-qualified name) subscription.

use ahash::AHashMap as HashMap;
use linkerd_destination_controller_core::profiles::{
    Profile, ProfileId, RequestMatch, ResponseClass, ResponseMatch, RetryBudget, Route, WeightedDst,
};
use linkerd_destination_controller_k8s_api::{self as k8s, duration::parse_duration, ResourceExt};
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
    profiles: HashMap<String, Profile>,
    watches: HashMap<String, watch::Sender<Option<Profile>>>,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Subscribes to a profile. The receiver's initial value is the current
    /// state; `None` means no such profile exists.
    pub fn profile_rx(&mut self, id: &ProfileId) -> watch::Receiver<Option<Profile>> {
        let ns = self.by_ns.entry(id.namespace.clone()).or_default();
        let current = ns.profiles.get(&id.name).cloned();
        let tx = ns
            .watches
            .entry(id.name.clone())
            .or_insert_with(move || watch::channel(current).0);
        tx.subscribe()
    }

    pub fn profile_watch_count(&self) -> usize {
        self.by_ns.values().map(|ns| ns.watches.len()).sum()
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ServiceProfile> for Index {
    fn apply(&mut self, sp: k8s::ServiceProfile) {
        let namespace = sp.namespace().expect("serviceprofile must be namespaced");
        let name = sp.name_unchecked();
        tracing::debug!(%namespace, %name, "Indexing profile");
        let profile = convert_profile(sp.spec);

        let ns = self.by_ns.entry(namespace).or_default();
        if let Some(tx) = ns.watches.get(&name) {
            let profile = profile.clone();
            tx.send_if_modified(move |current| {
                if current.as_ref() == Some(&profile) {
                    false
                } else {
                    *current = Some(profile);
                    true
                }
            });
        }
        ns.profiles.insert(name, profile);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some(ns) = self.by_ns.get_mut(&namespace) else {
            return;
        };
        if ns.profiles.remove(&name).is_some() {
            if let Some(tx) = ns.watches.get(&name) {
                tx.send_if_modified(|current| current.take().is_some());
            }
        }
        if ns.profiles.is_empty() && ns.watches.is_empty() {
            self.by_ns.remove(&namespace);
        }
    }
}

// === conversions ===

fn convert_profile(spec: k8s::ServiceProfileSpec) -> Profile {
    let routes = spec
        .routes
        .into_iter()
        .flatten()
        .filter_map(convert_route)
        .collect();
    let retry_budget = spec.retry_budget.and_then(convert_retry_budget);
    let opaque_ports = spec
        .opaque_ports
        .into_iter()
        .flatten()
        .filter_map(NonZeroU16::new)
        .collect();
    let dst_overrides = spec
        .dst_overrides
        .into_iter()
        .flatten()
        .map(|dst| WeightedDst {
            authority: dst.authority,
            weight: dst.weight,
        })
        .collect();

    Profile {
        routes,
        retry_budget,
        opaque_ports,
        dst_overrides,
    }
}

fn convert_route(route: k8s::profile::RouteSpec) -> Option<Route> {
    let condition = convert_request_match(route.condition)?;
    let timeout = route.timeout.as_deref().and_then(|timeout| {
        parse_duration(timeout)
            .map_err(|error| {
                tracing::warn!(%error, %timeout, route = %route.name, "Invalid route timeout")
            })
            .ok()
    });
    let response_classes = route
        .response_classes
        .into_iter()
        .flatten()
        .filter_map(|class| {
            let condition = convert_response_match(class.condition)?;
            Some(ResponseClass {
                condition,
                is_failure: class.is_failure.unwrap_or(false),
            })
        })
        .collect();

    Some(Route {
        name: route.name,
        condition,
        response_classes,
        is_retryable: route.is_retryable.unwrap_or(false),
        timeout,
    })
}

/// A condition with several fields set requires all of them.
fn convert_request_match(m: k8s::profile::RequestMatch) -> Option<RequestMatch> {
    let mut matches = Vec::new();
    if let Some(all) = m.all {
        matches.push(RequestMatch::All(
            all.into_iter().filter_map(convert_request_match).collect(),
        ));
    }
    if let Some(any) = m.any {
        matches.push(RequestMatch::Any(
            any.into_iter().filter_map(convert_request_match).collect(),
        ));
    }
    if let Some(not) = m.not {
        if let Some(inner) = convert_request_match(*not) {
            matches.push(RequestMatch::Not(Box::new(inner)));
        }
    }
    if let Some(path) = m.path_regex {
        matches.push(RequestMatch::Path(path));
    }
    if let Some(method) = m.method {
        matches.push(RequestMatch::Method(method));
    }

    match matches.len() {
        0 => {
            tracing::warn!("Route condition matches no requests");
            None
        }
        1 => matches.into_iter().next(),
        _ => Some(RequestMatch::All(matches)),
    }
}

fn convert_response_match(m: k8s::profile::ResponseMatch) -> Option<ResponseMatch> {
    let mut matches = Vec::new();
    if let Some(all) = m.all {
        matches.push(ResponseMatch::All(
            all.into_iter().filter_map(convert_response_match).collect(),
        ));
    }
    if let Some(any) = m.any {
        matches.push(ResponseMatch::Any(
            any.into_iter().filter_map(convert_response_match).collect(),
        ));
    }
    if let Some(not) = m.not {
        if let Some(inner) = convert_response_match(*not) {
            matches.push(ResponseMatch::Not(Box::new(inner)));
        }
    }
    if let Some(status) = m.status {
        let min = status.min.or(status.max).unwrap_or(200);
        let max = status.max.unwrap_or(min);
        matches.push(ResponseMatch::Status { min, max });
    }

    match matches.len() {
        0 => {
            tracing::warn!("Response class condition matches no responses");
            None
        }
        1 => matches.into_iter().next(),
        _ => Some(ResponseMatch::All(matches)),
    }
}

fn convert_retry_budget(budget: k8s::profile::RetryBudget) -> Option<RetryBudget> {
    let ttl = parse_duration(&budget.ttl)
        .map_err(|error| tracing::warn!(%error, ttl = %budget.ttl, "Invalid retry budget TTL"))
        .ok()?;
    if !(0.0..=1000.0).contains(&budget.retry_ratio) {
        tracing::warn!(retry_ratio = budget.retry_ratio, "Invalid retry ratio");
        return None;
    }
    Some(RetryBudget {
        min_retries_per_second: budget.min_retries_per_second,
        retry_ratio: budget.retry_ratio,
        ttl,
    })
}
