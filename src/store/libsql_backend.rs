//! libSQL backend: `Store` and `WorkspaceStore` over a local database.
//!
//! Collections live in one row per (tenant, name) holding the JSON body and a
//! version counter. Workspace items get their own table so revision checks can
//! be done in a single conditional UPDATE.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tracing::{debug, info};

use crate::error::{StoreError, WorkspaceError};
use crate::store::migrations;
use crate::store::traits::{Collection, Snapshot, Store};
use crate::workspace::{NewWorkspaceItem, WorkspaceItem, WorkspacePatch, WorkspaceStore};

/// libSQL database backend.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn query_items(
        &self,
        tenant: &str,
        id: Option<&str>,
    ) -> Result<Vec<WorkspaceItem>, WorkspaceError> {
        let mut rows = match id {
            Some(id) => self
                .conn
                .query(
                    &format!("{WORKSPACE_SELECT} WHERE tenant = ?1 AND id = ?2"),
                    params![tenant, id],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!("{WORKSPACE_SELECT} WHERE tenant = ?1 ORDER BY created_at, rowid"),
                    params![tenant],
                )
                .await,
        }
        .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            items.push(row_to_item(&row).map_err(storage_err)?);
        }
        Ok(items)
    }

    async fn require_item(&self, tenant: &str, id: &str) -> Result<WorkspaceItem, WorkspaceError> {
        self.query_items(tenant, Some(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WorkspaceError::NotFound { id: id.to_string() })
    }

    /// Write `item` back if the stored revision still equals `expected_revision`.
    async fn compare_and_swap(
        &self,
        tenant: &str,
        item: &WorkspaceItem,
        expected_revision: u64,
    ) -> Result<(), WorkspaceError> {
        let tags = serde_json::to_string(&item.tags).map_err(storage_err)?;
        let affected = self
            .conn
            .execute(
                "UPDATE workspace_items
                 SET label = ?1, mime_type = ?2, data = ?3, tags = ?4,
                     revision = ?5, deleted = ?6, updated_at = ?7
                 WHERE tenant = ?8 AND id = ?9 AND revision = ?10 AND deleted = 0",
                params![
                    item.label.as_str(),
                    item.mime_type.as_str(),
                    item.data.as_str(),
                    tags,
                    item.revision as i64,
                    item.deleted as i64,
                    item.updated_at.to_rfc3339(),
                    tenant,
                    item.id.as_str(),
                    expected_revision as i64
                ],
            )
            .await
            .map_err(storage_err)?;

        if affected == 0 {
            // Lost a race: report whatever is stored now.
            let current = self.require_item(tenant, &item.id).await?;
            current.check_writable(expected_revision)?;
            return Err(WorkspaceError::Conflict {
                id: item.id.clone(),
                expected: expected_revision,
                actual: current.revision,
            });
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

const WORKSPACE_SELECT: &str = "SELECT id, label, mime_type, encoding, data, tags, provenance, \
     revision, deleted, created_at, updated_at FROM workspace_items";

fn storage_err(e: impl std::fmt::Display) -> WorkspaceError {
    WorkspaceError::Storage(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_item(row: &Row) -> Result<WorkspaceItem, String> {
    let get_str = |idx: i32| row.get::<String>(idx).map_err(|e| e.to_string());
    let get_int = |idx: i32| row.get::<i64>(idx).map_err(|e| e.to_string());

    let tags: Vec<String> = serde_json::from_str(&get_str(5)?).unwrap_or_default();
    let provenance = serde_json::from_str(&get_str(6)?).unwrap_or_default();

    Ok(WorkspaceItem {
        id: get_str(0)?,
        label: get_str(1)?,
        mime_type: get_str(2)?,
        encoding: get_str(3)?,
        data: get_str(4)?,
        tags,
        provenance,
        revision: get_int(7)?.max(0) as u64,
        deleted: get_int(8)? != 0,
        created_at: parse_datetime(&get_str(9)?),
        updated_at: parse_datetime(&get_str(10)?),
    })
}

// ── Store ───────────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn get_all(
        &self,
        tenant: &str,
        collection: Collection,
    ) -> Result<Snapshot, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT version, body FROM collections WHERE tenant = ?1 AND name = ?2",
                params![tenant, collection.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read {collection}: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read {collection}: {e}")))?
        else {
            return Ok(Snapshot::default());
        };

        let version: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("Bad version column: {e}")))?;
        let body: String = row
            .get(1)
            .map_err(|e| StoreError::Query(format!("Bad body column: {e}")))?;
        let items: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| StoreError::Serialization {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Snapshot {
            version: version.max(0) as u64,
            items,
        })
    }

    async fn replace_all(
        &self,
        tenant: &str,
        collection: Collection,
        items: Vec<serde_json::Value>,
    ) -> Result<u64, StoreError> {
        let body = serde_json::to_string(&items).map_err(|e| StoreError::Serialization {
            collection: collection.to_string(),
            reason: e.to_string(),
        })?;

        self.conn
            .execute(
                "INSERT INTO collections (tenant, name, version, body, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT(tenant, name) DO UPDATE SET
                     version = collections.version + 1,
                     body = excluded.body,
                     updated_at = excluded.updated_at",
                params![tenant, collection.as_str(), body, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to write {collection}: {e}")))?;

        let version = self.get_all(tenant, collection).await?.version;
        debug!(tenant, %collection, version, count = items.len(), "Collection replaced");
        Ok(version)
    }
}

// ── Workspace ───────────────────────────────────────────────────────

#[async_trait]
impl WorkspaceStore for LibSqlStore {
    async fn create(
        &self,
        tenant: &str,
        item: NewWorkspaceItem,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let item = WorkspaceItem::from_new(item, Utc::now());
        let tags = serde_json::to_string(&item.tags).map_err(storage_err)?;
        let provenance = serde_json::to_string(&item.provenance).map_err(storage_err)?;

        self.conn
            .execute(
                "INSERT INTO workspace_items
                 (id, tenant, label, mime_type, encoding, data, tags, provenance,
                  revision, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
                params![
                    item.id.as_str(),
                    tenant,
                    item.label.as_str(),
                    item.mime_type.as_str(),
                    item.encoding.as_str(),
                    item.data.as_str(),
                    tags,
                    provenance,
                    item.revision as i64,
                    item.created_at.to_rfc3339(),
                    item.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;

        debug!(tenant, id = %item.id, label = %item.label, "Workspace item created");
        Ok(item)
    }

    async fn get(&self, tenant: &str, id: &str) -> Result<Option<WorkspaceItem>, WorkspaceError> {
        Ok(self.query_items(tenant, Some(id)).await?.into_iter().next())
    }

    async fn list(
        &self,
        tenant: &str,
        include_deleted: bool,
    ) -> Result<Vec<WorkspaceItem>, WorkspaceError> {
        let items = self.query_items(tenant, None).await?;
        Ok(items
            .into_iter()
            .filter(|i| include_deleted || !i.deleted)
            .collect())
    }

    async fn update(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
        patch: WorkspacePatch,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let mut item = self.require_item(tenant, id).await?;
        item.check_writable(expected_revision)?;
        item.apply(patch, Utc::now());
        self.compare_and_swap(tenant, &item, expected_revision).await?;
        Ok(item)
    }

    async fn delete(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
    ) -> Result<WorkspaceItem, WorkspaceError> {
        let mut item = self.require_item(tenant, id).await?;
        item.check_writable(expected_revision)?;
        item.mark_deleted(Utc::now());
        self.compare_and_swap(tenant, &item, expected_revision).await?;
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn collection_versions_increase() {
        let store = LibSqlStore::new_memory().await.unwrap();
        assert_eq!(
            store.get_all("t1", Collection::Filters).await.unwrap().version,
            0
        );

        let v1 = store
            .replace_all("t1", Collection::Filters, vec![json!({"id": "f1"})])
            .await
            .unwrap();
        let v2 = store
            .replace_all("t1", Collection::Filters, vec![json!({"id": "f2"})])
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let snapshot = store.get_all("t1", Collection::Filters).await.unwrap();
        assert_eq!(snapshot.items, vec![json!({"id": "f2"})]);
        assert!(
            store
                .get_all("t2", Collection::Filters)
                .await
                .unwrap()
                .items
                .is_empty()
        );
    }

    #[tokio::test]
    async fn workspace_round_trip_and_conflict() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let item = store
            .create(
                "t1",
                NewWorkspaceItem::markdown("Summary", "v1").with_tag("director-output"),
            )
            .await
            .unwrap();

        let loaded = store.get("t1", &item.id).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.tags, vec!["director-output".to_string()]);

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
        assert!(matches!(
            stale,
            Err(WorkspaceError::Conflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        let stored = store.get("t1", &item.id).await.unwrap().unwrap();
        assert_eq!(stored.data, "v2");
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn deleted_items_hidden_by_default() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let item = store
            .create("t1", NewWorkspaceItem::markdown("Scratch", "x"))
            .await
            .unwrap();
        store.delete("t1", &item.id, 1).await.unwrap();

        assert!(store.list("t1", false).await.unwrap().is_empty());
        let all = store.list("t1", true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);
        assert_eq!(all[0].revision, 2);
    }

    #[tokio::test]
    async fn new_local_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let store = LibSqlStore::new_local(&path).await.unwrap();
        store
            .replace_all("t1", Collection::Logs, vec![json!({"event": "x"})])
            .await
            .unwrap();
        assert!(path.exists());
    }
}
