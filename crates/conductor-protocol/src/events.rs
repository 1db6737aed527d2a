//! Caller-facing event types.
//!
//! Every backend yields the same sequence of [`Event`]s for a turn, whether
//! the agent runs in-process, in a container, or in a cloud pool. The
//! `session_id` on an event is always the orchestrator's id, never the id a
//! worker or agent runtime assigned internally.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event envelope
// ============================================================================

/// An event with routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Orchestrator session this event belongs to.
    pub session_id: String,

    /// Unix ms timestamp.
    pub ts: i64,

    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with the session id and the current time.
    pub fn now(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            ts: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Whether this event ends the sequence it was yielded from.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::SessionEnded { .. } | EventPayload::Error { .. }
        )
    }
}

// ============================================================================
// Event payloads
// ============================================================================

/// All event types, tagged by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    /// The backend allocated a runtime slot and the agent accepted the session.
    #[serde(rename = "session.started")]
    SessionStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },

    /// A content block was finalized.
    #[serde(rename = "content.block")]
    ContentBlock { block: ContentBlock },

    /// A complete message (all blocks of an assistant turn, or tool results).
    #[serde(rename = "message")]
    Message {
        role: Role,
        content: Vec<ContentBlock>,
    },

    /// Turn finished; carries cost, usage and the conversation id to resume with.
    #[serde(rename = "result")]
    Result(TurnResult),

    /// The agent is asking the user something and waits for `answer_question`.
    #[serde(rename = "question")]
    Question {
        tool_use_id: String,
        questions: Vec<QuestionItem>,
    },

    /// The session ended without an error (e.g. duration ceiling reached).
    #[serde(rename = "session.ended")]
    SessionEnded { reason: String },

    /// The operation failed.
    #[serde(rename = "error")]
    Error { error: String, kind: ErrorKind },
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    User,
}

/// Error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Startup,
    Transport,
    Protocol,
    NotFound,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Transport => write!(f, "transport"),
            Self::Protocol => write!(f, "protocol"),
            Self::NotFound => write!(f, "not_found"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

// ============================================================================
// Content blocks
// ============================================================================

/// Kind of a reconstructed content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

/// A content block rebuilt from streaming deltas.
///
/// `index` is stable for the duration of one turn and is the only key that
/// correlates start/delta/stop events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub kind: BlockKind,
    pub index: usize,

    /// Text, reasoning, raw tool input JSON, or tool result text.
    #[serde(default)]
    pub text: String,

    /// Parsed tool input (tool_use only, set once finalized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,

    /// Tool result outcome (tool_result only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Still receiving deltas.
    #[serde(default)]
    pub streaming: bool,
}

impl ContentBlock {
    pub fn new(kind: BlockKind, index: usize) -> Self {
        Self {
            kind,
            index,
            text: String::new(),
            input: None,
            tool_name: None,
            tool_use_id: None,
            success: None,
            streaming: true,
        }
    }
}

// ============================================================================
// Turn result and questions
// ============================================================================

/// Summary of a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    /// Backend-native conversation id; pass as `resume_id` to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// One question inside an ask-user tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect", alias = "multi_select")]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}
