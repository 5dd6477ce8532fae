//! Persisted fetch log with TTL + count retention.
//!
//! Every append is mirrored as a `tracing` event and then written to the
//! tenant's `logs` collection, pruned on the way in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RetentionConfig;
use crate::error::StoreError;
use crate::store::{Collection, TenantStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 when written by us; foreign entries may hold anything.
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level,
            event: event.into(),
            account_id: None,
            email_id: None,
            director_id: None,
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn info(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, event, message)
    }

    pub fn warn(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, event, message)
    }

    pub fn error(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, event, message)
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn email(mut self, email_id: impl Into<String>) -> Self {
        self.email_id = Some(email_id.into());
        self
    }

    pub fn director(mut self, director_id: impl Into<String>) -> Self {
        self.director_id = Some(director_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.to_rfc3339();
        self
    }

    fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Drop entries older than the TTL, then keep the most recent `max_entries`
/// in their original order. Entries with unparsable timestamps are kept.
pub fn prune(entries: Vec<LogEntry>, now: DateTime<Utc>, retention: &RetentionConfig) -> Vec<LogEntry> {
    let cutoff = now - Duration::days(retention.ttl_days);
    let mut kept: Vec<LogEntry> = entries
        .into_iter()
        .filter(|e| e.parsed_timestamp().is_none_or(|ts| ts >= cutoff))
        .collect();
    if kept.len() > retention.max_entries {
        let excess = kept.len() - retention.max_entries;
        kept.drain(..excess);
    }
    kept
}

/// Tenant-scoped fetch log.
pub struct FetchLog {
    store: TenantStore,
    retention: RetentionConfig,
    write_lock: Mutex<()>,
}

impl FetchLog {
    pub fn new(store: TenantStore, retention: RetentionConfig) -> Self {
        Self {
            store,
            retention,
            write_lock: Mutex::new(()),
        }
    }

    /// Mirror to `tracing`, then persist with pruning.
    pub async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        emit(self.store.tenant(), &entry);

        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<LogEntry> = self.store.load(Collection::Logs).await?;
        entries.push(entry);
        let entries = prune(entries, Utc::now(), &self.retention);
        self.store.save(Collection::Logs, &entries).await?;
        Ok(())
    }

    /// Append, logging instead of failing if the store is unavailable.
    pub async fn record(&self, entry: LogEntry) {
        let event = entry.event.clone();
        if let Err(e) = self.append(entry).await {
            warn!(tenant = %self.store.tenant(), event = %event, error = %e, "Failed to persist log entry");
        }
    }

    /// Load the log, pruning and writing back if anything aged out.
    pub async fn load(&self) -> Result<Vec<LogEntry>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let entries: Vec<LogEntry> = self.store.load(Collection::Logs).await?;
        let before = entries.len();
        let pruned = prune(entries, Utc::now(), &self.retention);
        if pruned.len() != before {
            debug!(tenant = %self.store.tenant(), dropped = before - pruned.len(), "Pruned fetch log on load");
            self.store.save(Collection::Logs, &pruned).await?;
        }
        Ok(pruned)
    }
}

fn emit(tenant: &str, entry: &LogEntry) {
    let account_id = entry.account_id.as_deref().unwrap_or("");
    let email_id = entry.email_id.as_deref().unwrap_or("");
    let director_id = entry.director_id.as_deref().unwrap_or("");
    match entry.level {
        LogLevel::Debug => {
            debug!(tenant, event = %entry.event, account_id, email_id, director_id, "{}", entry.message)
        }
        LogLevel::Info => {
            info!(tenant, event = %entry.event, account_id, email_id, director_id, "{}", entry.message)
        }
        LogLevel::Warn => {
            warn!(tenant, event = %entry.event, account_id, email_id, director_id, "{}", entry.message)
        }
        LogLevel::Error => {
            error!(tenant, event = %entry.event, account_id, email_id, director_id, "{}", entry.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn retention(ttl_days: i64, max_entries: usize) -> RetentionConfig {
        RetentionConfig {
            ttl_days,
            max_entries,
        }
    }

    #[test]
    fn keeps_most_recent_in_order() {
        let now = Utc::now();
        let entries: Vec<LogEntry> = (0..10)
            .map(|i| {
                LogEntry::info(format!("e{i}"), "")
                    .at(now - Duration::minutes(10 - i as i64))
            })
            .collect();
        let kept = prune(entries, now, &retention(7, 3));
        let events: Vec<&str> = kept.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["e7", "e8", "e9"]);
    }

    #[test]
    fn drops_expired_keeps_unparsable() {
        let now = Utc::now();
        let mut garbage = LogEntry::info("garbage", "");
        garbage.timestamp = "yesterday-ish".into();
        let entries = vec![
            LogEntry::info("old", "").at(now - Duration::days(8)),
            garbage,
            LogEntry::info("fresh", "").at(now - Duration::days(1)),
        ];
        let kept = prune(entries, now, &retention(7, 100));
        let events: Vec<&str> = kept.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["garbage", "fresh"]);
    }

    #[tokio::test]
    async fn append_prunes_persisted_log() {
        let store = TenantStore::new(Arc::new(MemoryStore::new()), "t1");
        let log = FetchLog::new(store.clone(), retention(7, 2));
        for i in 0..4 {
            log.append(LogEntry::info(format!("e{i}"), "m")).await.unwrap();
        }
        let stored: Vec<LogEntry> = store.load(Collection::Logs).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].event, "e3");
    }

    #[tokio::test]
    async fn load_writes_back_pruned_log() {
        let store = TenantStore::new(Arc::new(MemoryStore::new()), "t1");
        let stale = vec![
            LogEntry::info("old", "").at(Utc::now() - Duration::days(30)),
            LogEntry::info("new", ""),
        ];
        store.save(Collection::Logs, &stale).await.unwrap();

        let log = FetchLog::new(store.clone(), retention(7, 100));
        let loaded = log.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let stored: Vec<LogEntry> = store.load(Collection::Logs).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event, "new");
    }
}
