//! Mail provider adapter trait and per-tag registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::ProviderError;
use crate::mail::types::{Account, EmailEnvelope, FetchOptions, TokenGrant};

/// A mailbox provider (Gmail, Outlook, IMAP, ...).
///
/// Implementations do their own network I/O; the coordinator wraps every
/// call in a deadline.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider tag this adapter serves.
    fn provider(&self) -> &str;

    /// Return a usable access token, refreshing it if needed.
    async fn ensure_valid_access_token(&self, account: &Account)
    -> Result<TokenGrant, ProviderError>;

    /// List unread envelopes, newest first, at most `options.max`.
    async fn fetch_unread(
        &self,
        account: &Account,
        access_token: &SecretString,
        options: FetchOptions,
    ) -> Result<Vec<EmailEnvelope>, ProviderError>;
}

/// Adapters keyed by provider tag.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn MailProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own tag, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn MailProvider>) {
        let tag = adapter.provider().to_string();
        tracing::info!(provider = %tag, "Registered mail provider adapter");
        self.adapters.insert(tag, adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn MailProvider>) -> Self {
        self.register(adapter);
        self
    }

    /// Look up the adapter for a tag.
    pub fn get(&self, provider: &str) -> Result<Arc<dyn MailProvider>, ProviderError> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::NoAdapter {
                provider: provider.to_string(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait]
    impl MailProvider for NullProvider {
        fn provider(&self) -> &str {
            "null"
        }

        async fn ensure_valid_access_token(
            &self,
            _account: &Account,
        ) -> Result<TokenGrant, ProviderError> {
            Ok(TokenGrant::valid("t"))
        }

        async fn fetch_unread(
            &self,
            _account: &Account,
            _access_token: &SecretString,
            _options: FetchOptions,
        ) -> Result<Vec<EmailEnvelope>, ProviderError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn lookup_by_tag() {
        let registry = ProviderRegistry::new().with(Arc::new(NullProvider));
        assert!(registry.get("null").is_ok());
        let missing = registry.get("gmail");
        assert!(matches!(missing, Err(ProviderError::NoAdapter { .. })));
        if let Err(e) = missing {
            assert!(e.to_string().contains("No adapter registered for provider gmail"));
        }
    }
}
