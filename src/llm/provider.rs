//! LLM backend trait and conversation message types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::pipeline::ModelConfig;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Which side of the orchestration is talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    Director,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCapabilities {
    pub can_invoke_agents: bool,
}

impl RoleCapabilities {
    pub fn for_role(role: ConversationRole) -> Self {
        Self {
            can_invoke_agents: role == ConversationRole::Director,
        }
    }
}

/// Correlation ids passed through to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub tenant: String,
    pub thread_id: String,
    pub trace_id: String,
    pub email_id: String,
    pub director_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One conversation step.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRequest {
    pub messages: Vec<ChatMessage>,
    pub model_config: ModelConfig,
    pub role: ConversationRole,
    pub capabilities: RoleCapabilities,
    pub tools: Vec<ToolDefinition>,
    pub context: ConversationContext,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Backend reply to one step.
#[derive(Debug, Clone, Default)]
pub struct ConversationResponse {
    pub assistant_message: String,
    pub tool_calls: Vec<ToolCall>,
    /// Raw request as sent, for tracing.
    pub request: serde_json::Value,
    /// Raw response as received, for tracing.
    pub response: serde_json::Value,
    pub usage: Usage,
}

/// A chat-completion backend with tool calling.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name for logs and errors.
    fn name(&self) -> &str;

    /// Run one conversation step.
    async fn run(&self, request: ConversationRequest) -> Result<ConversationResponse, LlmError>;
}

/// Placeholder backend that fails every step. Used until an embedder injects one.
pub struct UnconfiguredBackend;

#[async_trait]
impl LlmBackend for UnconfiguredBackend {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn run(&self, _request: ConversationRequest) -> Result<ConversationResponse, LlmError> {
        Err(LlmError::RequestFailed {
            backend: self.name().to_string(),
            reason: "no LLM backend configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_carries_call_id() {
        let msg = ChatMessage::tool_result("call-1", "{}");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn empty_tool_calls_are_not_serialized() {
        let json = serde_json::to_value(ChatMessage::assistant("hi", Vec::new())).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert_eq!(json["role"], "assistant");
    }

    #[test]
    fn only_directors_invoke_agents() {
        assert!(RoleCapabilities::for_role(ConversationRole::Director).can_invoke_agents);
        assert!(!RoleCapabilities::for_role(ConversationRole::Agent).can_invoke_agents);
    }
}
