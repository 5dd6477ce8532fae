//! Routing pipeline.
//!
//! Every fetched envelope flows through:
//! 1. `FilterSet::evaluate()`: user regexes over envelope fields
//! 2. `select_triggers()`: ordered, per-email deduplicated director list
//! 3. `ConversationDriver::run_director()`: one bounded LLM conversation per director

pub mod catalog;
pub mod filters;

pub use catalog::{Agent, Binding, Catalog, Director, ModelConfig, Prompt, Settings};
pub use filters::{
    Filter, FilterEvaluation, FilterField, FilterSet, evaluate, field_value, select_triggers,
};
