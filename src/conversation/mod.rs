//! Director and agent conversations.
//!
//! - `thread`: per-conversation state machine
//! - `arena`: flat thread list plus its persisted collection
//! - `sessions`: agent thread reuse, expiry, and refusal
//! - `driver`: the bounded director/agent tool loop

pub mod arena;
pub mod driver;
pub mod sessions;
pub mod thread;

pub use arena::{ConversationRepo, ThreadArena};
pub use driver::{ConversationDriver, DirectorOutcome, RunContext};
pub use sessions::{AgentSession, RefusalReason, SessionManager, SessionRefusal};
pub use thread::{ConversationThread, ThreadError, ThreadKind, ThreadStatus};
