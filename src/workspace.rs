//! Shared workspace of artifacts produced during orchestration.
//!
//! Items are MIME-typed blobs with per-item optimistic concurrency: every
//! update or delete carries the revision the writer read, and a mismatch is
//! rejected as a conflict rather than overwriting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkspaceError;

/// Well-known tags attached by the orchestration core.
pub mod tags {
    pub const DIRECTOR_OUTPUT: &str = "director-output";
    pub const AGENT_OUTPUT: &str = "agent-output";
}

/// Where an item came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// A stored workspace artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceItem {
    pub id: String,
    pub label: String,
    pub mime_type: String,
    /// Encoding of `data`: "utf-8" or "base64".
    pub encoding: String,
    pub data: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, bumped on every accepted write.
    pub revision: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub provenance: Provenance,
}

/// Input for creating an item.
#[derive(Debug, Clone)]
pub struct NewWorkspaceItem {
    pub label: String,
    pub mime_type: String,
    pub encoding: String,
    pub data: String,
    pub tags: Vec<String>,
    pub provenance: Provenance,
}

impl NewWorkspaceItem {
    /// A UTF-8 markdown item.
    pub fn markdown(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            mime_type: "text/markdown".to_string(),
            encoding: "utf-8".to_string(),
            data: data.into(),
            tags: Vec::new(),
            provenance: Provenance::default(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePatch {
    pub label: Option<String>,
    pub mime_type: Option<String>,
    pub data: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl WorkspaceItem {
    /// Materialize a new item at revision 1.
    pub fn from_new(new: NewWorkspaceItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: new.label,
            mime_type: new.mime_type,
            encoding: new.encoding,
            data: new.data,
            tags: new.tags,
            created_at: now,
            updated_at: now,
            revision: 1,
            deleted: false,
            provenance: new.provenance,
        }
    }

    /// Check that a writer read the current revision of a live item.
    pub fn check_writable(&self, expected_revision: u64) -> Result<(), WorkspaceError> {
        if self.deleted {
            return Err(WorkspaceError::Deleted {
                id: self.id.clone(),
            });
        }
        if self.revision != expected_revision {
            return Err(WorkspaceError::Conflict {
                id: self.id.clone(),
                expected: expected_revision,
                actual: self.revision,
            });
        }
        Ok(())
    }

    /// Apply a patch and bump the revision. Callers check the revision first.
    pub fn apply(&mut self, patch: WorkspacePatch, now: DateTime<Utc>) {
        if let Some(label) = patch.label {
            self.label = label;
        }
        if let Some(mime_type) = patch.mime_type {
            self.mime_type = mime_type;
        }
        if let Some(data) = patch.data {
            self.data = data;
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        self.revision += 1;
        self.updated_at = now;
    }

    /// Soft-delete and bump the revision.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.deleted = true;
        self.revision += 1;
        self.updated_at = now;
    }
}

/// Workspace persistence with per-item optimistic concurrency.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn create(
        &self,
        tenant: &str,
        item: NewWorkspaceItem,
    ) -> Result<WorkspaceItem, WorkspaceError>;

    async fn get(&self, tenant: &str, id: &str) -> Result<Option<WorkspaceItem>, WorkspaceError>;

    /// List items in creation order.
    async fn list(
        &self,
        tenant: &str,
        include_deleted: bool,
    ) -> Result<Vec<WorkspaceItem>, WorkspaceError>;

    /// Update an item if its stored revision equals `expected_revision`.
    async fn update(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
        patch: WorkspacePatch,
    ) -> Result<WorkspaceItem, WorkspaceError>;

    /// Soft-delete an item if its stored revision equals `expected_revision`.
    async fn delete(
        &self,
        tenant: &str,
        id: &str,
        expected_revision: u64,
    ) -> Result<WorkspaceItem, WorkspaceError>;
}
