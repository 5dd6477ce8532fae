//! Error types for the mail director.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error in {collection}: {reason}")]
    Serialization { collection: String, reason: String },
}

/// Mail provider adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("No adapter registered for provider {provider}")]
    NoAdapter { provider: String },

    #[error("Token refresh failed for account {account_id}: {reason}")]
    TokenRefresh { account_id: String, reason: String },

    #[error("Fetching unread mail failed for account {account_id}: {reason}")]
    Fetch { account_id: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

/// LLM backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Conversation step timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Workspace item errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Workspace item {id} not found")]
    NotFound { id: String },

    #[error("Revision conflict on workspace item {id}: expected {expected}, stored {actual}")]
    Conflict { id: String, expected: u64, actual: u64 },

    #[error("Workspace item {id} is deleted")]
    Deleted { id: String },

    #[error("Workspace storage failed: {0}")]
    Storage(String),
}

/// Conversation state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Thread {id} not found")]
    ThreadNotFound { id: String },

    #[error("Thread {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Agent thread {id} references missing director thread {parent_id}")]
    MissingParent { id: String, parent_id: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
