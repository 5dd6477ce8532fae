//! Thread arena: every conversation of a tenant in one flat list.
//!
//! Agent threads point at their director thread through `parent_id`; there
//! are no owning references between threads.

use chrono::{DateTime, Utc};

use crate::conversation::thread::{ConversationThread, ThreadKind};
use crate::error::{ConversationError, StoreError};
use crate::store::{Collection, TenantStore};

#[derive(Debug, Clone, Default)]
pub struct ThreadArena {
    threads: Vec<ConversationThread>,
}

impl ThreadArena {
    pub fn new(threads: Vec<ConversationThread>) -> Self {
        Self { threads }
    }

    pub fn threads(&self) -> &[ConversationThread] {
        &self.threads
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ConversationThread> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ConversationThread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    /// Look up a thread or fail with `ThreadNotFound`.
    pub fn require_mut(&mut self, id: &str) -> Result<&mut ConversationThread, ConversationError> {
        self.get_mut(id)
            .ok_or_else(|| ConversationError::ThreadNotFound { id: id.to_string() })
    }

    /// Add a thread. Agent threads must reference an existing director thread.
    pub fn insert(&mut self, thread: ConversationThread) -> Result<(), ConversationError> {
        if thread.kind == ThreadKind::Agent {
            let parent_id = thread.parent_id.clone().unwrap_or_default();
            let parent_ok = self
                .get(&parent_id)
                .is_some_and(|p| p.kind == ThreadKind::Director);
            if !parent_ok {
                return Err(ConversationError::MissingParent {
                    id: thread.id,
                    parent_id,
                });
            }
        }
        self.threads.push(thread);
        Ok(())
    }

    /// Find the agent thread for (parent, agent, session).
    pub fn find_agent_session_mut(
        &mut self,
        parent_id: &str,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Option<&mut ConversationThread> {
        self.threads.iter_mut().find(|t| {
            t.kind == ThreadKind::Agent
                && t.parent_id.as_deref() == Some(parent_id)
                && t.agent_id.as_deref() == Some(agent_id)
                && t.session_id.as_deref() == session_id
        })
    }

    /// Agent threads hanging off a director thread.
    pub fn children<'a>(
        &'a self,
        parent_id: &'a str,
    ) -> impl Iterator<Item = &'a ConversationThread> + 'a {
        self.threads
            .iter()
            .filter(move |t| t.parent_id.as_deref() == Some(parent_id))
    }

    /// Finalize a director thread and cascade to its open agent children.
    ///
    /// Returns how many children were finalized. Threads outside this
    /// director's subtree are untouched.
    pub fn finalize_director(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, ConversationError> {
        self.require_mut(id)?.finalize(now);

        let mut cascaded = 0;
        for child in self
            .threads
            .iter_mut()
            .filter(|t| t.parent_id.as_deref() == Some(id) && !t.finalized)
        {
            child.finalize(now);
            cascaded += 1;
        }
        Ok(cascaded)
    }
}

/// Persists the arena as the tenant's `conversations` collection.
#[derive(Clone)]
pub struct ConversationRepo {
    store: TenantStore,
}

impl ConversationRepo {
    pub fn new(store: TenantStore) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<ThreadArena, StoreError> {
        Ok(ThreadArena::new(
            self.store.load(Collection::Conversations).await?,
        ))
    }

    pub async fn save(&self, arena: &ThreadArena) -> Result<u64, StoreError> {
        self.store
            .save(Collection::Conversations, arena.threads())
            .await
    }
}
