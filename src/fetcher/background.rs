//! Error channel for detached fetch work.
//!
//! Detached cycles (manual triggers and the periodic loop) have no caller to
//! return an error to. They push a `BackgroundError` onto a bounded channel;
//! the drain task writes each one into the tenant's fetch log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::fetcher::tenant::TenantRegistry;
use crate::logs::LogEntry;

pub const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Which detached task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    ManualTrigger,
    Schedule,
}

impl BackgroundTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualTrigger => "manual_trigger",
            Self::Schedule => "schedule",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundError {
    pub tenant: String,
    pub task: BackgroundTask,
    pub message: String,
    /// The task panicked rather than returning an error.
    pub panicked: bool,
    pub at: DateTime<Utc>,
}

impl BackgroundError {
    pub fn failed(tenant: impl Into<String>, task: BackgroundTask, message: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            task,
            message: message.into(),
            panicked: false,
            at: Utc::now(),
        }
    }

    pub fn panicked(tenant: impl Into<String>, task: BackgroundTask, message: impl Into<String>) -> Self {
        Self {
            panicked: true,
            ..Self::failed(tenant, task, message)
        }
    }

    fn to_log_entry(&self) -> LogEntry {
        let event = if self.panicked {
            "background_panic"
        } else {
            "background_error"
        };
        LogEntry::error(event, self.message.clone())
            .at(self.at)
            .detail(json!({ "task": self.task.as_str() }))
    }
}

/// Sending half handed to detached tasks.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<BackgroundError>,
}

impl ErrorReporter {
    pub fn channel() -> (Self, mpsc::Receiver<BackgroundError>) {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue an error. A full or closed channel falls back to `tracing`.
    pub fn report(&self, error: BackgroundError) {
        if let Err(e) = self.tx.try_send(error) {
            let error = match e {
                mpsc::error::TrySendError::Full(error) | mpsc::error::TrySendError::Closed(error) => error,
            };
            warn!(
                tenant = %error.tenant,
                task = error.task.as_str(),
                "Background error channel unavailable: {}",
                error.message
            );
        }
    }
}

/// Drain background errors into each tenant's fetch log until every
/// reporter is dropped.
pub fn spawn_error_drain(
    registry: Arc<TenantRegistry>,
    mut rx: mpsc::Receiver<BackgroundError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(error) = rx.recv().await {
            let session = registry.get_or_create(&error.tenant).await;
            session.log().record(error.to_log_entry()).await;
        }
        info!("Background error drain finished");
    })
}
