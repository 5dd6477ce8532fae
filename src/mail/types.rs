//! Mailbox and message types shared by provider adapters and the pipeline.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// A connected mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Adapter tag, e.g. "gmail" or "outlook".
    pub provider: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Opaque adapter-owned credentials. Only token refresh rewrites this.
    #[serde(default)]
    pub credentials: serde_json::Value,
}

/// Attachment metadata. Contents are never carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: usize,
}

/// A fetched message. Immutable once listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailEnvelope {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl EmailEnvelope {
    /// Render the envelope as the user turn handed to a director.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\n", self.from));
        if !self.to.is_empty() {
            out.push_str(&format!("To: {}\n", self.to.join(", ")));
        }
        if !self.cc.is_empty() {
            out.push_str(&format!("Cc: {}\n", self.cc.join(", ")));
        }
        if let Some(date) = self.date {
            out.push_str(&format!("Date: {}\n", date.to_rfc3339()));
        }
        out.push_str(&format!("Subject: {}\n", self.subject));
        if !self.attachments.is_empty() {
            let names: Vec<&str> = self
                .attachments
                .iter()
                .map(|a| a.filename.as_str())
                .collect();
            out.push_str(&format!("Attachments: {}\n", names.join(", ")));
        }
        out.push('\n');
        match (&self.text_body, &self.html_body) {
            (Some(text), _) if !text.trim().is_empty() => out.push_str(text.trim()),
            (_, Some(html)) if !html.trim().is_empty() => out.push_str(html.trim()),
            _ => out.push_str(&self.snippet),
        }
        out
    }
}

/// Result of `ensure_valid_access_token`.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub expiry: Option<DateTime<Utc>>,
    /// Credentials were refreshed and must be persisted.
    pub updated: bool,
    /// Replacement credentials when `updated` is set.
    pub credentials: Option<serde_json::Value>,
    /// Adapter-reported error. A grant carrying an error is unusable.
    pub error: Option<String>,
}

impl TokenGrant {
    /// A still-valid token, nothing to persist.
    pub fn valid(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            expiry: None,
            updated: false,
            credentials: None,
            error: None,
        }
    }

    /// A freshly refreshed token with replacement credentials.
    pub fn refreshed(access_token: impl Into<String>, credentials: serde_json::Value) -> Self {
        Self {
            updated: true,
            credentials: Some(credentials),
            ..Self::valid(access_token)
        }
    }
}

/// Listing options passed to `fetch_unread`.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub max: usize,
    pub unread_only: bool,
}
