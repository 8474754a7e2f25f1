use crate::ports::PortSet;
use linkerd_destination_controller_core::endpoints::ServiceId;

/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The namespace where the linkerd control plane is deployed.
    pub control_plane_ns: String,

    /// E.g. "cluster.local".
    pub dns_domain: String,

    /// The cluster's mesh identity trust domain.
    pub identity_domain: String,

    /// Ports that are opaque for every workload unless overridden by
    /// annotation.
    pub default_opaque_ports: PortSet,
}

impl ClusterInfo {
    pub(crate) fn service_account_identity(&self, ns: &str, sa: &str) -> String {
        format!(
            "{}.{}.serviceaccount.identity.{}.{}",
            sa, ns, self.control_plane_ns, self.identity_domain
        )
    }

    pub fn service_fqn(&self, id: &ServiceId) -> String {
        format!("{}.{}.svc.{}", id.name, id.namespace, self.dns_domain)
    }
}
