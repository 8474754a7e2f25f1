use linkerd_destination_controller_core::endpoints::ServiceId;
use std::num::NonZeroU16;

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum InvalidAuthority {
    #[error("invalid destination {0}")]
    Malformed(String),

    #[error("invalid port {0}")]
    Port(String),

    #[error("name {fqdn} does not match cluster domain {domain}")]
    Domain { fqdn: String, domain: String },

    #[error("invalid k8s service {0}")]
    Shape(String),
}

/// Splits an authority into its host and port. The port defaults to 80 when
/// omitted; more than one colon is an error.
pub(crate) fn get_host_and_port(authority: &str) -> Result<(&str, NonZeroU16), InvalidAuthority> {
    let mut parts = authority.split(':');
    let host = parts.next().unwrap_or_default();
    let port = match parts.next() {
        None => NonZeroU16::new(DEFAULT_PORT).unwrap(),
        Some(port) => port
            .parse::<NonZeroU16>()
            .map_err(|_| InvalidAuthority::Port(port.to_string()))?,
    };
    if parts.next().is_some() || host.is_empty() {
        return Err(InvalidAuthority::Malformed(authority.to_string()));
    }
    Ok((host, port))
}

/// Destructures a Kubernetes service hostname into its service and, when the
/// name addresses a single instance (e.g. a StatefulSet pod's DNS name), the
/// instance ID.
///
/// The hostname must be of the form
/// `[instance.]service.namespace.svc.<cluster-domain>`.
pub(crate) fn parse_service_name(
    fqdn: &str,
    cluster_domain: &str,
) -> Result<(ServiceId, Option<String>), InvalidAuthority> {
    let labels: Vec<&str> = fqdn.trim_end_matches('.').split('.').collect();
    let suffix: Vec<&str> = std::iter::once("svc")
        .chain(cluster_domain.split('.'))
        .collect();

    if labels.len() < suffix.len()
        || labels[labels.len() - suffix.len()..]
            .iter()
            .zip(suffix.iter())
            .any(|(a, b)| a != b)
    {
        return Err(InvalidAuthority::Domain {
            fqdn: fqdn.to_string(),
            domain: cluster_domain.to_string(),
        });
    }

    match labels.len() - suffix.len() {
        // <service>.<namespace>.<suffix>
        2 => Ok((ServiceId::new(labels[1], labels[0]), None)),
        // <instance>.<service>.<namespace>.<suffix>
        3 => Ok((
            ServiceId::new(labels[2], labels[1]),
            Some(labels[0].to_string()),
        )),
        _ => Err(InvalidAuthority::Shape(fqdn.to_string())),
    }
}

/// Formats the canonical fully-qualified name of a service.
pub(crate) fn service_fqn(id: &ServiceId, cluster_domain: &str) -> String {
    format!("{}.{}.svc.{}", id.name, id.namespace, cluster_domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        let (host, port) = get_host_and_port("web.prod.svc.cluster.local:8080").unwrap();
        assert_eq!(host, "web.prod.svc.cluster.local");
        assert_eq!(port.get(), 8080);

        let (host, port) = get_host_and_port("web.prod.svc.cluster.local").unwrap();
        assert_eq!(host, "web.prod.svc.cluster.local");
        assert_eq!(port.get(), 80, "port defaults to 80");
    }

    #[test]
    fn rejects_malformed_authorities() {
        assert!(matches!(
            get_host_and_port("a:80:80"),
            Err(InvalidAuthority::Malformed(_))
        ));
        assert!(matches!(
            get_host_and_port(":80"),
            Err(InvalidAuthority::Malformed(_))
        ));
        assert!(matches!(
            get_host_and_port("web:0"),
            Err(InvalidAuthority::Port(_))
        ));
        assert!(matches!(
            get_host_and_port("web:65536"),
            Err(InvalidAuthority::Port(_))
        ));
        assert!(matches!(
            get_host_and_port("web:http"),
            Err(InvalidAuthority::Port(_))
        ));
    }

    #[test]
    fn parses_service_names() {
        let (id, instance) =
            parse_service_name("web.prod.svc.cluster.local", "cluster.local").unwrap();
        assert_eq!(id, ServiceId::new("prod", "web"));
        assert_eq!(instance, None);

        let (id, instance) =
            parse_service_name("web-0.web.prod.svc.cluster.local", "cluster.local").unwrap();
        assert_eq!(id, ServiceId::new("prod", "web"));
        assert_eq!(instance.as_deref(), Some("web-0"));
    }

    #[test]
    fn rejects_unqualified_names() {
        assert!(parse_service_name("web.prod", "cluster.local").is_err());
        assert!(parse_service_name("web.prod.svc.other.domain", "cluster.local").is_err());
        assert!(
            parse_service_name("a.b.web.prod.svc.cluster.local", "cluster.local").is_err(),
            "too many leading labels"
        );
        assert!(
            parse_service_name("prod.svc.cluster.local", "cluster.local").is_err(),
            "missing service label"
        );
    }

    #[test]
    fn formatting_round_trips() {
        for (ns, name, domain) in [
            ("prod", "web", "cluster.local"),
            ("linkerd-viz", "metrics", "cluster.local"),
            ("default", "api", "example.org"),
        ] {
            let id = ServiceId::new(ns, name);
            let fqn = service_fqn(&id, domain);
            let (parsed, instance) = parse_service_name(&fqn, domain).unwrap();
            assert_eq!(parsed, id);
            assert_eq!(instance, None);
        }
    }
}
