//! Linkerd Destination Controller — discovery indexes
//!
//! The destination controller answers endpoint and profile discovery requests
//! from outbound proxies. This crate maintains the reactive caches behind
//! those answers, watching the following cluster resources:
//!
//! - `Service`s provide subscription keys, cluster-IP reverse lookups, and
//!   the per-service opaque-ports annotation.
//! - `Endpoints` enumerate the ready addresses backing each service port.
//! - `Pod`s carry the metadata projected onto each endpoint (mesh identity,
//!   opaque and skipped ports, owner, node) and back the pod-IP and host-IP
//!   reverse lookups.
//! - `Node`s provide topology zones for endpoint locality.
//! - `Server`s declare the protocol served on a pod's port.
//! - `ServiceProfile`s provide per-route policy.
//!
//! Each subscription key is backed by a `tokio::sync::watch` channel: a new
//! subscriber synchronously observes the current view, and subsequent changes
//! for the key are delivered in order and coalesced (`send_if_modified`).
//! Indexing is driven by a single task per resource watch; the shared state is
//! guarded by an `RwLock` that is never held across an await point.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
pub mod endpoints;
pub mod metrics;
pub mod ports;
pub mod profiles;
pub mod server;

pub use self::cluster_info::ClusterInfo;
