//! Conversation thread state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConversationError;
use crate::llm::{ChatMessage, Role};
use crate::mail::EmailEnvelope;
use crate::pipeline::{Agent, Director};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Director,
    Agent,
}

/// Lifecycle of a thread. Every status but `Ongoing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Ongoing,
    Completed,
    Failed,
    /// Inactivity timeout. Only agent threads expire.
    Expired,
}

impl ThreadStatus {
    pub fn can_transition_to(&self, target: ThreadStatus) -> bool {
        use ThreadStatus::*;

        matches!(
            (self, target),
            (Ongoing, Completed) | (Ongoing, Failed) | (Ongoing, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ongoing)
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// An error recorded against a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// A director or agent conversation.
///
/// Invariants: status never leaves a terminal state, and `finalized` implies
/// a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub kind: ThreadKind,
    /// Director thread this agent thread hangs off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub director_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session id the director asked for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub trace_id: String,
    pub email: EmailEnvelope,
    pub prompt_id: String,
    pub model_config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ThreadStatus,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub errors: Vec<ThreadError>,
}

impl ConversationThread {
    fn blank(
        kind: ThreadKind,
        director_id: &str,
        prompt_id: &str,
        model_config_id: &str,
        email: &EmailEnvelope,
        trace_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            parent_id: None,
            director_id: director_id.to_string(),
            agent_id: None,
            session_id: None,
            trace_id: trace_id.to_string(),
            email: email.clone(),
            prompt_id: prompt_id.to_string(),
            model_config_id: model_config_id.to_string(),
            provider: None,
            started_at: now,
            last_active_at: now,
            expires_at: None,
            ended_at: None,
            status: ThreadStatus::Ongoing,
            finalized: false,
            messages: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A fresh director thread for one email.
    pub fn new_director(
        director: &Director,
        email: &EmailEnvelope,
        trace_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::blank(
            ThreadKind::Director,
            &director.id,
            &director.prompt_id,
            &director.model_config_id,
            email,
            trace_id,
            now,
        )
    }

    /// A fresh agent thread under `parent`, expiring after `timeout_minutes` idle.
    pub fn new_agent(
        parent: &ConversationThread,
        agent: &Agent,
        session_id: Option<String>,
        timeout_minutes: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut thread = Self::blank(
            ThreadKind::Agent,
            &parent.director_id,
            &agent.prompt_id,
            &agent.model_config_id,
            &parent.email,
            &parent.trace_id,
            now,
        );
        thread.parent_id = Some(parent.id.clone());
        thread.agent_id = Some(agent.id.clone());
        thread.session_id = session_id;
        thread.expires_at = Some(now + Duration::minutes(timeout_minutes));
        thread
    }

    pub fn transition_to(
        &mut self,
        target: ThreadStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ConversationError> {
        if !self.status.can_transition_to(target) {
            return Err(ConversationError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        if target.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.errors.push(ThreadError {
            at: now,
            message: message.into(),
        });
    }

    /// Record an error and mark the thread failed. A terminal thread only
    /// gets the error entry.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.record_error(message, now);
        if !self.status.is_terminal() {
            self.status = ThreadStatus::Failed;
            self.ended_at = Some(now);
        }
    }

    /// Mark an open thread expired. Expiry does not finalize.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ThreadStatus::Expired;
            self.ended_at = Some(now);
        }
    }

    /// Complete (if still open) and finalize.
    pub fn finalize(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ThreadStatus::Completed;
            self.ended_at = Some(now);
        }
        self.ended_at.get_or_insert(now);
        self.finalized = true;
    }

    /// Expired by status or by the sliding inactivity window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ThreadStatus::Expired || self.expires_at.is_some_and(|at| now > at)
    }

    /// Record activity and slide the expiry window.
    pub fn touch(&mut self, now: DateTime<Utc>, timeout_minutes: i64) {
        self.last_active_at = now;
        if self.expires_at.is_some() {
            self.expires_at = Some(now + Duration::minutes(timeout_minutes));
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Content of the most recent non-empty assistant message.
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.trim())
            .find(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn director() -> Director {
        Director {
            id: "d1".into(),
            name: "Billing".into(),
            prompt_id: "p1".into(),
            model_config_id: "m1".into(),
            agent_ids: vec!["a1".into()],
            enabled: true,
        }
    }

    fn agent() -> Agent {
        Agent {
            id: "a1".into(),
            name: "Lookup".into(),
            description: String::new(),
            prompt_id: "p2".into(),
            model_config_id: "m1".into(),
            session_timeout_minutes: None,
        }
    }

    #[test]
    fn valid_transitions() {
        assert!(ThreadStatus::Ongoing.can_transition_to(ThreadStatus::Completed));
        assert!(ThreadStatus::Ongoing.can_transition_to(ThreadStatus::Failed));
        assert!(ThreadStatus::Ongoing.can_transition_to(ThreadStatus::Expired));
    }

    #[test]
    fn terminal_status_never_changes() {
        let now = Utc::now();
        for terminal in [
            ThreadStatus::Completed,
            ThreadStatus::Failed,
            ThreadStatus::Expired,
        ] {
            let mut thread =
                ConversationThread::new_director(&director(), &EmailEnvelope::default(), "t", now);
            thread.transition_to(terminal, now).unwrap();

            for target in [
                ThreadStatus::Ongoing,
                ThreadStatus::Completed,
                ThreadStatus::Failed,
                ThreadStatus::Expired,
            ] {
                assert!(thread.transition_to(target, now).is_err());
            }
            thread.fail("late error", now);
            thread.expire(now);
            thread.finalize(now);
            assert_eq!(thread.status, terminal);
            assert!(thread.finalized);
        }
    }

    #[test]
    fn finalize_completes_open_thread() {
        let now = Utc::now();
        let mut thread =
            ConversationThread::new_director(&director(), &EmailEnvelope::default(), "t", now);
        thread.finalize(now);
        assert_eq!(thread.status, ThreadStatus::Completed);
        assert!(thread.finalized);
        assert_eq!(thread.ended_at, Some(now));
    }

    #[test]
    fn agent_thread_expiry_window_slides() {
        let now = Utc::now();
        let parent =
            ConversationThread::new_director(&director(), &EmailEnvelope::default(), "t", now);
        let mut thread = ConversationThread::new_agent(&parent, &agent(), None, 15, now);
        assert_eq!(thread.parent_id.as_deref(), Some(parent.id.as_str()));
        assert!(!thread.is_expired(now + Duration::minutes(15)));
        assert!(thread.is_expired(now + Duration::minutes(16)));

        thread.touch(now + Duration::minutes(10), 15);
        assert!(!thread.is_expired(now + Duration::minutes(16)));
    }

    #[test]
    fn director_threads_never_expire_by_time() {
        let now = Utc::now();
        let thread =
            ConversationThread::new_director(&director(), &EmailEnvelope::default(), "t", now);
        assert!(!thread.is_expired(now + Duration::days(30)));
    }

    #[test]
    fn last_assistant_content_skips_empty() {
        let now = Utc::now();
        let mut thread =
            ConversationThread::new_director(&director(), &EmailEnvelope::default(), "t", now);
        thread.push_message(ChatMessage::assistant("first", Vec::new()));
        thread.push_message(ChatMessage::assistant("  ", Vec::new()));
        thread.push_message(ChatMessage::tool_result("c", "{}"));
        assert_eq!(thread.last_assistant_content(), Some("first"));
    }
}
