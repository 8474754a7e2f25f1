#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod profiles;

/// Describes why a discovery lookup could not be answered.
///
/// Variants map onto distinct gRPC status codes at the API boundary.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The target exists but cannot be resolved through the endpoints API
    /// (e.g. an ExternalName service).
    #[error("invalid service {0}")]
    InvalidService(String),

    /// More than one resource claims the looked-up address.
    #[error("found {count} {kind} with conflicting address {addr}")]
    Conflict {
        kind: &'static str,
        addr: String,
        count: usize,
    },

    /// A per-instance DNS name did not match any endpoint of its service.
    #[error("no endpoint found in {service} for hostname {hostname}")]
    UnknownHostname {
        service: endpoints::ServiceId,
        hostname: String,
    },
}
