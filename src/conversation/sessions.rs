//! Agent session manager.
//!
//! Creates, reuses, or refuses agent threads under a director thread. A
//! session is keyed by (director thread, agent, requested session id).
//! An expired session is never silently recreated under the same key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::conversation::arena::ThreadArena;
use crate::conversation::thread::ConversationThread;
use crate::llm::ChatMessage;
use crate::pipeline::{Agent, Binding, Catalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    Finalized,
    Expired,
    MissingConfig,
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Finalized => "finalized",
            Self::Expired => "expired",
            Self::MissingConfig => "missing_config",
        };
        write!(f, "{s}")
    }
}

/// Why an agent session could not be provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRefusal {
    pub reason: RefusalReason,
    pub message: String,
}

impl SessionRefusal {
    fn new(reason: RefusalReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Tool-result payload handed back to the director.
    pub fn to_tool_result(&self) -> serde_json::Value {
        json!({
            "error": "session refused",
            "reason": self.reason,
            "message": self.message,
        })
    }
}

/// A usable agent thread plus its resolved prompt/model.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub thread_id: String,
    pub binding: Binding,
    /// True if the thread was created by this call.
    pub created: bool,
}

pub struct SessionManager {
    default_timeout_minutes: i64,
}

impl SessionManager {
    pub fn new(default_timeout_minutes: i64) -> Self {
        Self {
            default_timeout_minutes,
        }
    }

    /// Inactivity timeout for an agent, honoring its override.
    pub fn timeout_for(&self, agent: &Agent) -> i64 {
        agent
            .session_timeout_minutes
            .filter(|m| *m > 0)
            .unwrap_or(self.default_timeout_minutes)
    }

    /// Find or create the agent thread for this invocation.
    pub fn ensure_agent_thread(
        &self,
        arena: &mut ThreadArena,
        catalog: &Catalog,
        director_thread_id: &str,
        agent: &Agent,
        requested_session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AgentSession, SessionRefusal> {
        let Some(parent) = arena.get(director_thread_id).cloned() else {
            return Err(SessionRefusal::new(
                RefusalReason::Finalized,
                "director thread not found",
            ));
        };

        if parent.finalized {
            if let Some(existing) =
                arena.find_agent_session_mut(director_thread_id, &agent.id, requested_session_id)
            {
                existing.expire(now);
            }
            return Err(SessionRefusal::new(
                RefusalReason::Finalized,
                "director thread is finalized",
            ));
        }

        let binding = catalog.resolve_binding(&agent.prompt_id, &agent.model_config_id);
        let timeout = self.timeout_for(agent);

        if let Some(existing) =
            arena.find_agent_session_mut(director_thread_id, &agent.id, requested_session_id)
        {
            if existing.is_expired(now) {
                existing.expire(now);
                info!(thread_id = %existing.id, agent_id = %agent.id, "Agent session expired");
                return Err(SessionRefusal::new(
                    RefusalReason::Expired,
                    "agent session expired; start a new session id",
                ));
            }
            // The session's own thread ended (failed, completed); the parent is
            // still live, so the director can open a fresh session id.
            if existing.status.is_terminal() {
                return Err(SessionRefusal::new(
                    RefusalReason::Finalized,
                    format!(
                        "agent session already ended with status {}; the director thread is still open, start a new session id",
                        existing.status
                    ),
                ));
            }
            let Some(binding) = binding else {
                return Err(missing_config(agent));
            };
            existing.touch(now, timeout);
            debug!(thread_id = %existing.id, agent_id = %agent.id, "Reusing agent session");
            return Ok(AgentSession {
                thread_id: existing.id.clone(),
                binding,
                created: false,
            });
        }

        let Some(binding) = binding else {
            return Err(missing_config(agent));
        };

        let mut thread = ConversationThread::new_agent(
            &parent,
            agent,
            requested_session_id.map(str::to_string),
            timeout,
            now,
        );
        thread.provider = Some(binding.model.provider.clone());
        thread.push_message(ChatMessage::system(binding.prompt.system.clone()));
        let thread_id = thread.id.clone();
        arena.insert(thread).map_err(|e| {
            SessionRefusal::new(RefusalReason::Finalized, e.to_string())
        })?;

        info!(thread_id = %thread_id, agent_id = %agent.id, "Created agent session");
        Ok(AgentSession {
            thread_id,
            binding,
            created: true,
        })
    }
}

fn missing_config(agent: &Agent) -> SessionRefusal {
    SessionRefusal::new(
        RefusalReason::MissingConfig,
        format!(
            "agent {} has no resolvable prompt {} / model config {}",
            agent.id, agent.prompt_id, agent.model_config_id
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::thread::ThreadStatus;
    use crate::mail::EmailEnvelope;
    use crate::pipeline::{Director, ModelConfig, Prompt};
    use chrono::Duration;

    fn catalog() -> Catalog {
        Catalog {
            directors: vec![Director {
                id: "d1".into(),
                name: "Billing".into(),
                prompt_id: "pd".into(),
                model_config_id: "m1".into(),
                agent_ids: vec!["a1".into()],
                enabled: true,
            }],
            agents: vec![agent(None)],
            prompts: vec![
                Prompt {
                    id: "pd".into(),
                    name: "director".into(),
                    system: "direct".into(),
                },
                Prompt {
                    id: "pa".into(),
                    name: "agent".into(),
                    system: "assist".into(),
                },
            ],
            model_configs: vec![ModelConfig {
                id: "m1".into(),
                provider: "openai".into(),
                model: "gpt".into(),
                temperature: None,
                max_tokens: None,
            }],
        }
    }

    fn agent(timeout: Option<i64>) -> Agent {
        Agent {
            id: "a1".into(),
            name: "Lookup".into(),
            description: String::new(),
            prompt_id: "pa".into(),
            model_config_id: "m1".into(),
            session_timeout_minutes: timeout,
        }
    }

    fn setup(now: DateTime<Utc>) -> (ThreadArena, String) {
        let catalog = catalog();
        let director = catalog.director("d1").unwrap();
        let thread = ConversationThread::new_director(director, &EmailEnvelope::default(), "t", now);
        let id = thread.id.clone();
        let mut arena = ThreadArena::default();
        arena.insert(thread).unwrap();
        (arena, id)
    }

    #[test]
    fn creates_then_reuses_same_session() {
        let now = Utc::now();
        let (mut arena, parent) = setup(now);
        let manager = SessionManager::new(15);
        let catalog = catalog();

        let first = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), now)
            .unwrap();
        assert!(first.created);
        let thread = arena.get(&first.thread_id).unwrap();
        assert_eq!(thread.messages[0].content, "assist");
        assert_eq!(thread.expires_at, Some(now + Duration::minutes(15)));

        let later = now + Duration::minutes(5);
        let second = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), later)
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.thread_id, first.thread_id);
        let thread = arena.get(&second.thread_id).unwrap();
        assert_eq!(thread.last_active_at, later);
        assert_eq!(thread.expires_at, Some(later + Duration::minutes(15)));

        let other = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s2"), later)
            .unwrap();
        assert_ne!(other.thread_id, first.thread_id);
    }

    #[test]
    fn expired_session_is_refused_not_recreated() {
        let now = Utc::now();
        let (mut arena, parent) = setup(now);
        let manager = SessionManager::new(15);
        let catalog = catalog();

        let first = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), now)
            .unwrap();

        let late = now + Duration::minutes(16);
        let refusal = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), late)
            .unwrap_err();
        assert_eq!(refusal.reason, RefusalReason::Expired);
        assert_eq!(refusal.to_tool_result()["reason"], "expired");
        assert_eq!(
            arena.get(&first.thread_id).unwrap().status,
            ThreadStatus::Expired
        );
        assert_eq!(arena.children(&parent).count(), 1);
    }

    #[test]
    fn finalized_parent_refuses_and_expires_match() {
        let now = Utc::now();
        let (mut arena, parent) = setup(now);
        let manager = SessionManager::new(15);
        let catalog = catalog();

        let first = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), None, now)
            .unwrap();
        arena.get_mut(&parent).unwrap().finalize(now);

        let refusal = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), None, now)
            .unwrap_err();
        assert_eq!(refusal.reason, RefusalReason::Finalized);
        assert_eq!(
            arena.get(&first.thread_id).unwrap().status,
            ThreadStatus::Expired
        );
    }

    #[test]
    fn ended_session_is_refused_with_fresh_id_hint() {
        let now = Utc::now();
        let (mut arena, parent) = setup(now);
        let manager = SessionManager::new(15);
        let catalog = catalog();

        let first = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), now)
            .unwrap();
        arena
            .get_mut(&first.thread_id)
            .unwrap()
            .fail("agent run failed", now);

        let refusal = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s1"), now)
            .unwrap_err();
        assert_eq!(refusal.reason, RefusalReason::Finalized);
        assert!(refusal.message.contains("already ended with status failed"));
        assert!(refusal.message.contains("start a new session id"));
        assert!(!arena.get(&parent).unwrap().finalized);

        let fresh = manager
            .ensure_agent_thread(&mut arena, &catalog, &parent, &agent(None), Some("s2"), now)
            .unwrap();
        assert!(fresh.created);
    }

    #[test]
    fn unresolvable_agent_config_is_refused() {
        let now = Utc::now();
        let (mut arena, parent) = setup(now);
        let manager = SessionManager::new(15);
        let mut broken = agent(None);
        broken.prompt_id = "missing".into();

        let refusal = manager
            .ensure_agent_thread(&mut arena, &catalog(), &parent, &broken, None, now)
            .unwrap_err();
        assert_eq!(refusal.reason, RefusalReason::MissingConfig);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn agent_override_wins_over_default_timeout() {
        let manager = SessionManager::new(15);
        assert_eq!(manager.timeout_for(&agent(Some(60))), 60);
        assert_eq!(manager.timeout_for(&agent(None)), 15);
        assert_eq!(manager.timeout_for(&agent(Some(0))), 15);
    }
}
