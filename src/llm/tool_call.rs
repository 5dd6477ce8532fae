//! Tool-call resolution at the LLM boundary.
//!
//! Raw tool calls are resolved once into `ToolCallKind` so the driver
//! dispatches on a closed enum instead of re-parsing names.

use serde_json::{Value, json};

use crate::llm::provider::{ToolCall, ToolDefinition};
use crate::pipeline::Agent;

/// Tool name prefix for agent invocations; the remainder is the agent id.
pub const AGENT_TOOL_PREFIX: &str = "call_agent__";

/// Arguments of an agent-addressed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub agent_id: String,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallKind {
    Agent(AgentInvocation),
    Unsupported { name: String },
}

/// A tool call with parsed arguments.
#[derive(Debug, Clone)]
pub struct ResolvedToolCall {
    pub call_id: String,
    pub name: String,
    pub kind: ToolCallKind,
    pub arguments: Value,
    /// Set when the raw arguments were not a JSON object.
    pub argument_error: Option<String>,
}

impl ResolvedToolCall {
    pub fn resolve(call: &ToolCall) -> Self {
        let (arguments, argument_error) = parse_arguments(&call.arguments);
        let kind = match call.name.strip_prefix(AGENT_TOOL_PREFIX) {
            Some(agent_id) if !agent_id.is_empty() => ToolCallKind::Agent(AgentInvocation {
                agent_id: agent_id.to_string(),
                message: string_arg(&arguments, &["message", "input"]).unwrap_or_default(),
                session_id: string_arg(&arguments, &["sessionId", "session_id"]),
            }),
            _ => ToolCallKind::Unsupported {
                name: call.name.clone(),
            },
        };
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            kind,
            arguments,
            argument_error,
        }
    }
}

/// Parse tool arguments leniently: anything but a JSON object becomes `{}`.
pub fn parse_arguments(raw: &str) -> (Value, Option<String>) {
    if raw.trim().is_empty() {
        return (json!({}), None);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => (value, None),
        Ok(other) => (
            json!({}),
            Some(format!("tool arguments are not an object: {other}")),
        ),
        Err(e) => (json!({}), Some(format!("invalid tool arguments: {e}"))),
    }
}

fn string_arg(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| args.get(*k))
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn agent_tool_name(agent_id: &str) -> String {
    format!("{AGENT_TOOL_PREFIX}{agent_id}")
}

/// Tool definition offered to a director for one agent.
pub fn agent_tool_definition(agent: &Agent) -> ToolDefinition {
    let description = if agent.description.is_empty() {
        format!("Delegate a task to the {} agent.", agent.name)
    } else {
        agent.description.clone()
    };
    ToolDefinition {
        name: agent_tool_name(&agent.id),
        description,
        parameters: json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Instruction or question for the agent."
                },
                "sessionId": {
                    "type": "string",
                    "description": "Reuse an earlier conversation with this agent."
                }
            },
            "required": ["message"]
        }),
    }
}

/// Tool result for an unknown non-agent tool.
pub fn not_implemented_result() -> Value {
    json!({ "error": "tool not implemented" })
}
