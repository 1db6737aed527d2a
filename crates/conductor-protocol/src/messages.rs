//! Native agent message protocol.
//!
//! The agent CLI prints one JSON object per line on stdout (`stream-json`),
//! and workers forward the same objects as SSE events named after their
//! `type`. Unknown types and fields are tolerated so newer agents keep
//! working.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// `system{subtype:"init", session_id}` and other system notices.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Incremental streaming event.
    StreamEvent {
        event: StreamEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Complete assistant message; marks the end of an assistant turn.
    Assistant {
        message: MessageBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// User message echo, carrying tool results.
    User {
        message: MessageBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Turn summary.
    Result(ResultMessage),

    /// Agent asks the host something (tool permission, ask-user).
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },

    /// Agent answers a host control request (e.g. interrupt).
    ControlResponse {
        #[serde(default)]
        response: Value,
    },

    #[serde(other)]
    Unknown,
}

impl AgentMessage {
    /// Parse one protocol line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Type name as used for SSE event names.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::StreamEvent { .. } => "stream_event",
            Self::Assistant { .. } => "assistant",
            Self::User { .. } => "user",
            Self::Result(_) => "result",
            Self::ControlRequest { .. } => "control_request",
            Self::ControlResponse { .. } => "control_response",
            Self::Unknown => "unknown",
        }
    }
}

/// Body of an `assistant` or `user` message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<NativeBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// User message content may be a bare string.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<NativeBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<NativeBlock>),
    }

    Ok(match Content::deserialize(deserializer)? {
        Content::Text(text) => vec![NativeBlock::Text { text }],
        Content::Blocks(blocks) => blocks,
    })
}

/// A content block as the agent reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Streaming events nested in `stream_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: NativeBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<Value>,
    },
    MessageStop,
    #[serde(other)]
    Unknown,
}

/// Payload of a `content_block_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

/// `result` message closing a turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

// ============================================================================
// Control protocol (stdio only)
// ============================================================================

/// Request body of a `control_request` sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Permission check before a tool runs. Ask-user arrives here too.
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Build the `control_response` line allowing a tool, optionally with a
/// rewritten input (ask-user answers are delivered this way).
pub fn allow_tool_response(request_id: &str, updated_input: Value) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "allow",
                "updatedInput": updated_input,
            }
        }
    })
}

/// Build the `control_response` line denying a tool.
pub fn deny_tool_response(request_id: &str, message: &str) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "deny",
                "message": message,
            }
        }
    })
}

/// Build a host-initiated `control_request` asking the agent to stop the turn.
pub fn interrupt_request(request_id: &str) -> Value {
    serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": "interrupt" }
    })
}

/// Build a user message line for the agent's stdin.
pub fn user_message_line(text: &str) -> Value {
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
        "parent_tool_use_id": null,
    })
}
