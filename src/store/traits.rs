//! `Store` trait: get-all/replace-all persistence per named collection.
//!
//! Every collection is a single versioned JSON array per tenant. Callers
//! re-read, mutate in memory, and write the whole collection back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Named collections held per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Accounts,
    Conversations,
    Logs,
    Filters,
    Directors,
    Agents,
    Prompts,
    Settings,
    Traces,
}

impl Collection {
    /// Storage key for this collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Conversations => "conversations",
            Self::Logs => "logs",
            Self::Filters => "filters",
            Self::Directors => "directors",
            Self::Agents => "agents",
            Self::Prompts => "prompts",
            Self::Settings => "settings",
            Self::Traces => "traces",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collection as read: its items plus the version they were read at.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: u64,
    pub items: Vec<serde_json::Value>,
}

/// Backend-agnostic persistence for replace-all collections.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a whole collection. Missing collections read as empty at version 0.
    async fn get_all(&self, tenant: &str, collection: Collection)
    -> Result<Snapshot, StoreError>;

    /// Replace a whole collection. Returns the new version.
    async fn replace_all(
        &self,
        tenant: &str,
        collection: Collection,
        items: Vec<serde_json::Value>,
    ) -> Result<u64, StoreError>;
}

/// Typed, tenant-scoped view over a `Store`.
#[derive(Clone)]
pub struct TenantStore {
    store: Arc<dyn Store>,
    tenant: String,
}

impl TenantStore {
    pub fn new(store: Arc<dyn Store>, tenant: impl Into<String>) -> Self {
        Self {
            store,
            tenant: tenant.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Load and deserialize every item of a collection.
    pub async fn load<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<Vec<T>, StoreError> {
        let snapshot = self.store.get_all(&self.tenant, collection).await?;
        snapshot
            .items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| StoreError::Serialization {
                    collection: collection.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Serialize and write back a whole collection.
    pub async fn save<T: Serialize>(
        &self,
        collection: Collection,
        items: &[T],
    ) -> Result<u64, StoreError> {
        let values = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Serialization {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;
        self.store.replace_all(&self.tenant, collection, values).await
    }

    /// Current version of a collection.
    pub async fn version(&self, collection: Collection) -> Result<u64, StoreError> {
        Ok(self.store.get_all(&self.tenant, collection).await?.version)
    }
}
