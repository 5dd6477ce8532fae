//! In-process store: `Store` and `WorkspaceStore` over tokio locks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{StoreError, WorkspaceError};
use crate::store::traits::{Collection, Snapshot, Store};
use crate::workspace::{NewWorkspaceItem, WorkspaceItem, WorkspacePatch, WorkspaceStore};

/// Memory-backed store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(String, Collection), Snapshot>>,
    workspace: RwLock<HashMap<String, Vec<WorkspaceItem>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_all(
        &self,
        tenant: &str,
        collection: Collection,
    ) -> Result<Snapshot, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&(tenant.to_string(), collection))
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_all(
        &self,
        tenant: &str,
        collection: Collection,
        items: Vec<serde_json::Value>,
    ) -> Result<u64, StoreError> {
        let mut collections = self.collections.write().await;
        let entry = collections
            .entry((tenant.to_string(), collection))
            .or_default();
        entry.version += 1;
        entry.items = items;
        Ok(entry.version)
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn create(
        &self,
        tenant: &str,
        item: NewWorkspaceItem,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let item = WorkspaceItem::from_new(item, Utc::now());
        self.workspace
            .write()
            .await
            .entry(tenant.to_string())
            .or_default()
            .push(item.clone());
        Ok(item)
    }

    async fn get(&self, tenant: &str, id: &str) -> Result<Option<WorkspaceItem>, WorkspaceError> {
        let workspace = self.workspace.read().await;
        Ok(workspace
            .get(tenant)
            .and_then(|items| items.iter().find(|i| i.id == id))
            .cloned())
    }

    async fn list(
        &self,
        tenant: &str,
        include_deleted: bool,
    ) -> Result<Vec<WorkspaceItem>, WorkspaceError> {
        let workspace = self.workspace.read().await;
        Ok(workspace
            .get(tenant)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| include_deleted || !i.deleted)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
        patch: WorkspacePatch,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let mut workspace = self.workspace.write().await;
        let item = workspace
            .get_mut(tenant)
            .and_then(|items| items.iter_mut().find(|i| i.id == id))
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?;
        item.check_writable(expected_revision)?;
        item.apply(patch, Utc::now());
        Ok(item.clone())
    }

    async fn delete(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let mut workspace = self.workspace.write().await;
        let item = workspace
            .get_mut(tenant)
            .and_then(|items| items.iter_mut().find(|i| i.id == id))
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })?;
        item.check_writable(expected_revision)?;
        item.mark_deleted(Utc::now());
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let store = MemoryStore::new();
        let snapshot = store.get_all("t1", Collection::Filters).await.unwrap();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.items.is_empty());
    }

    #[tokio::test]
    async fn replace_all_bumps_version_per_tenant() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .replace_all("t1", Collection::Logs, vec![json!({"a": 1})])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .replace_all("t1", Collection::Logs, vec![json!({"a": 2})])
                .await
                .unwrap(),
            2
        );
        let other = store.get_all("t2", Collection::Logs).await.unwrap();
        assert_eq!(other.version, 0);

        let snapshot = store.get_all("t1", Collection::Logs).await.unwrap();
        assert_eq!(snapshot.items, vec![json!({"a": 2})]);
    }

    #[tokio::test]
    async fn stale_update_leaves_revision_unchanged() {
        let store = MemoryStore::new();
        let item = store
            .create("t1", NewWorkspaceItem::markdown("Notes", "v1"))
            .await
            .unwrap();

        let updated = store
            .update(
                "t1",
                &item.id,
                1,
                WorkspacePatch {
                    data: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);

        let stale = store
            .update(
                "t1",
                &item.id,
                1,
                WorkspacePatch {
                    data: Some("v3".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(stale, Err(WorkspaceError::Conflict { .. })));

        let stored = store.get("t1", &item.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.data, "v2");
    }

    #[tokio::test]
    async fn delete_is_soft_and_hidden_from_default_listing() {
        let store = MemoryStore::new();
        let item = store
            .create("t1", NewWorkspaceItem::markdown("Notes", "v1"))
            .await
            .unwrap();
        let deleted = store.delete("t1", &item.id, 1).await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.revision, 2);

        assert!(store.list("t1", false).await.unwrap().is_empty());
        assert_eq!(store.list("t1", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_item_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .update("t1", "missing", 1, WorkspacePatch::default())
            .await;
        assert!(matches!(result, Err(WorkspaceError::NotFound { .. })));
    }
}
