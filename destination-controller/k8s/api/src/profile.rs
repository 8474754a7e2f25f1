use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes per-route policy for a service: request classification, retry
/// and timeout metadata, traffic splits, and opaque ports.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "linkerd.io",
    version = "v1alpha2",
    kind = "ServiceProfile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfileSpec {
    pub routes: Option<Vec<RouteSpec>>,
    pub retry_budget: Option<RetryBudget>,
    pub dst_overrides: Option<Vec<WeightedDst>>,
    pub opaque_ports: Option<Vec<u16>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub name: String,
    pub condition: RequestMatch,
    pub response_classes: Option<Vec<ResponseClass>>,
    pub is_retryable: Option<bool>,

    /// A Go-style duration string, e.g. "250ms".
    pub timeout: Option<String>,
}

/// A request classifier. Exactly one field should be set; `all`, `any`, and
/// `not` nest recursively.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    pub all: Option<Vec<RequestMatch>>,
    pub any: Option<Vec<RequestMatch>>,
    pub not: Option<Box<RequestMatch>>,
    pub path_regex: Option<String>,
    pub method: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseClass {
    pub condition: ResponseMatch,
    pub is_failure: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMatch {
    pub all: Option<Vec<ResponseMatch>>,
    pub any: Option<Vec<ResponseMatch>>,
    pub not: Option<Box<ResponseMatch>>,
    pub status: Option<StatusRange>,
}

/// An inclusive range of HTTP status codes. An unset bound takes the value of
/// the other bound.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub retry_ratio: f32,
    pub min_retries_per_second: u32,

    /// A Go-style duration string.
    pub ttl: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WeightedDst {
    pub authority: String,
    #[serde(default)]
    pub weight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_profile_spec() {
        let spec: ServiceProfileSpec = serde_yaml::from_str(
            r#"
            routes:
              - name: GET /books
                condition:
                  method: GET
                  pathRegex: /books
                isRetryable: true
                timeout: 250ms
                responseClasses:
                  - condition:
                      status:
                        min: 500
                        max: 599
                    isFailure: true
            retryBudget:
              retryRatio: 0.2
              minRetriesPerSecond: 10
              ttl: 10s
            opaquePorts:
              - 6379
            dstOverrides:
              - authority: books-v2.prod.svc.cluster.local:80
                weight: 700
            "#,
        )
        .expect("valid spec must parse");

        let routes = spec.routes.expect("routes");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].condition.method.as_deref(), Some("GET"));
        assert_eq!(routes[0].timeout.as_deref(), Some("250ms"));
        assert_eq!(spec.opaque_ports, Some(vec![6379]));
        assert_eq!(spec.dst_overrides.expect("overrides")[0].weight, 700);
    }

    #[test]
    fn deserializes_nested_conditions() {
        let m: RequestMatch = serde_yaml::from_str(
            r#"
            any:
              - method: POST
              - not:
                  pathRegex: /healthz
            "#,
        )
        .expect("nested match must parse");
        let any = m.any.expect("any");
        assert_eq!(any.len(), 2);
        assert!(any[1].not.is_some());
    }
}
