use serde::Deserialize;

/// The opaque token a client may attach to a destination query.
///
/// `ns` scopes profile resolution to the caller's namespace; `node_name`
/// feeds endpoint locality metadata.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub(crate) struct ContextToken {
    #[serde(default)]
    pub ns: String,

    #[serde(default, rename = "nodeName")]
    pub node_name: String,
}

impl ContextToken {
    /// Parses a context token, preferring the JSON form and falling back to
    /// the legacy `ns:<namespace>` form. Invalid tokens degrade to an empty
    /// token; they never fail the query.
    pub(crate) fn parse(token: &str) -> Self {
        if token.is_empty() {
            return Self::default();
        }
        match serde_json::from_str(token) {
            Ok(token) => token,
            Err(error) => {
                let parts: Vec<&str> = token.split(':').collect();
                if let ["ns", ns] = parts[..] {
                    tracing::warn!(%token, "Context token using the legacy format");
                    return Self {
                        ns: ns.to_string(),
                        node_name: String::new(),
                    };
                }
                tracing::error!(%token, %error, "Invalid context token");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_tokens() {
        assert_eq!(
            ContextToken::parse(r#"{"ns":"client-ns","nodeName":"node-1"}"#),
            ContextToken {
                ns: "client-ns".to_string(),
                node_name: "node-1".to_string(),
            }
        );
        assert_eq!(
            ContextToken::parse(r#"{"ns":"client-ns"}"#),
            ContextToken {
                ns: "client-ns".to_string(),
                node_name: String::new(),
            }
        );
    }

    #[test]
    fn parses_legacy_tokens() {
        assert_eq!(
            ContextToken::parse("ns:client-ns"),
            ContextToken {
                ns: "client-ns".to_string(),
                node_name: String::new(),
            }
        );
    }

    #[test]
    fn invalid_tokens_degrade_to_empty() {
        assert_eq!(ContextToken::parse(""), ContextToken::default());
        assert_eq!(ContextToken::parse("ns:a:b"), ContextToken::default());
        assert_eq!(ContextToken::parse("bogus"), ContextToken::default());
        assert_eq!(ContextToken::parse("{\"ns\":3}"), ContextToken::default());
    }
}
