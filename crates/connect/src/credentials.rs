//! Lazily-produced credentials folded into the connection URL's query
//! string (spec.md §4.3, §6 "Authentication").

use std::collections::BTreeMap;

use async_trait::async_trait;

/// Produces the credential key/value pairs appended to the WebSocket URL's
/// query string. An async trait because, per spec, "credentials may be
/// produced lazily — the manager awaits a provider before dialling" (e.g.
/// a token that needs refreshing before the first connect).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

/// A provider for endpoints with no authentication.
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn credentials(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// A provider backed by a fixed, already-known credential map. Useful when
/// the token is available up front and doesn't need lazy resolution.
pub struct StaticCredentials(BTreeMap<String, String>);

impl StaticCredentials {
    pub fn new(credentials: BTreeMap<String, String>) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_credentials_is_empty() {
        assert!(NoCredentials.credentials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_credentials_returns_the_fixed_map() {
        let mut creds = BTreeMap::new();
        creds.insert("token".to_string(), "abc".to_string());
        let provider = StaticCredentials::new(creds.clone());
        assert_eq!(provider.credentials().await.unwrap(), creds);
    }
}
