//! Mail Director: routes unread mail through rule filters into bounded
//! director/agent LLM conversations.

pub mod config;
pub mod conversation;
pub mod error;
pub mod fetcher;
pub mod llm;
pub mod logs;
pub mod mail;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod trace;
pub mod workspace;
