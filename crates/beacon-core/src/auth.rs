use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::HubError;

/// The authenticated identity behind a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Converts an opaque credential into a verified principal.
///
/// Credential validation is an external capability; the hub only consumes
/// this trait. Implementations must be cheap to call concurrently.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Principal, HubError>;
}

/// Resolver backed by a fixed token table, built once at startup.
/// Suitable for standalone deployments and tests.
pub struct StaticTokenResolver {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self { tokens }
    }

    /// Parse a `token=subject,token2=subject2` table, as configured from the
    /// environment. Malformed entries are skipped.
    pub fn from_table(table: &str) -> Self {
        let tokens = table
            .split(',')
            .filter_map(|entry| {
                let (token, subject) = entry.split_once('=')?;
                let token = token.trim();
                let subject = subject.trim();
                if token.is_empty() || subject.is_empty() {
                    return None;
                }
                Some((token.to_owned(), Principal::new(subject)))
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl PrincipalResolver for StaticTokenResolver {
    async fn authenticate(&self, credential: &str) -> Result<Principal, HubError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| HubError::Unauthenticated("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_accepts_known_token() {
        let mut tokens = HashMap::new();
        tokens.insert("tok-1".to_owned(), Principal::new("alice"));
        let resolver = StaticTokenResolver::new(tokens);

        let principal = resolver.authenticate("tok-1").await.unwrap();
        assert_eq!(principal.subject, "alice");
    }

    #[tokio::test]
    async fn static_resolver_rejects_unknown_token() {
        let resolver = StaticTokenResolver::new(HashMap::new());
        let err = resolver.authenticate("nope").await.unwrap_err();
        assert_eq!(err.error_kind(), "unauthenticated");
    }

    #[tokio::test]
    async fn from_table_parses_entries() {
        let resolver = StaticTokenResolver::from_table("tok-1=alice, tok-2=bob");
        assert_eq!(resolver.len(), 2);

        let principal = resolver.authenticate("tok-2").await.unwrap();
        assert_eq!(principal.subject, "bob");
    }

    #[test]
    fn from_table_skips_malformed_entries() {
        let resolver = StaticTokenResolver::from_table("tok-1=alice,garbage,=empty,");
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn principal_display_name() {
        let p = Principal::new("alice").with_display_name("Alice");
        assert_eq!(p.subject, "alice");
        assert_eq!(p.display_name.as_deref(), Some("Alice"));

        let json = serde_json::to_string(&Principal::new("bob")).unwrap();
        assert!(!json.contains("display_name"));
    }
}
