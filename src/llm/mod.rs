//! LLM integration.
//!
//! The backend itself is injected by embedders through `LlmBackend`; this
//! module owns the message model and tool-call resolution.

pub mod provider;
pub mod tool_call;

pub use provider::{
    ChatMessage, ConversationContext, ConversationRequest, ConversationResponse,
    ConversationRole, LlmBackend, Role, RoleCapabilities, ToolCall, ToolDefinition,
    UnconfiguredBackend, Usage,
};
pub use tool_call::{
    AGENT_TOOL_PREFIX, AgentInvocation, ResolvedToolCall, ToolCallKind, agent_tool_definition,
    agent_tool_name, not_implemented_result, parse_arguments,
};
