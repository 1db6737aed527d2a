//! Worker HTTP API and cloud control-plane types.
//!
//! Workers expose:
//!
//! | Method | Path                        | Response      |
//! |--------|-----------------------------|---------------|
//! | GET    | `/health`                   | 2xx when up   |
//! | POST   | `/sessions`                 | SSE stream    |
//! | POST   | `/sessions/{id}/messages`   | SSE stream    |
//! | POST   | `/sessions/{id}/answer`     | SSE stream    |
//! | POST   | `/sessions/{id}/interrupt`  | JSON          |
//! | DELETE | `/sessions/{id}`            | JSON          |
//!
//! SSE frames are `event: <name>\ndata: <json>\n\n`. Names are
//! [`SSE_SESSION_STARTED`], the message-protocol type names, [`SSE_ERROR`]
//! and the terminal [`SSE_DONE`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Answers to an ask-user question, keyed by question text.
pub type Answers = HashMap<String, String>;

pub const SSE_SESSION_STARTED: &str = "session-started";
pub const SSE_DONE: &str = "done";
pub const SSE_ERROR: &str = "error";

/// Tools available in plan mode.
pub const PLAN_MODE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    crate::ASK_USER_TOOL,
];

/// Agent operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Read-only exploration.
    Plan,
    /// Unrestricted.
    #[default]
    Build,
}

impl AgentMode {
    /// Tool allow-list, `None` when unrestricted.
    pub fn allowed_tools(&self) -> Option<Vec<String>> {
        match self {
            AgentMode::Plan => Some(PLAN_MODE_TOOLS.iter().map(|t| t.to_string()).collect()),
            AgentMode::Build => None,
        }
    }

    /// Agent permission mode, `None` for the agent's default.
    pub fn permission_mode(&self) -> Option<&'static str> {
        match self {
            AgentMode::Plan => Some("plan"),
            AgentMode::Build => None,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Build => write!(f, "build"),
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plan" => Ok(AgentMode::Plan),
            "build" => Ok(AgentMode::Build),
            other => Err(format!("unknown mode '{other}' (expected plan or build)")),
        }
    }
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionBody {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

/// Body of `POST /sessions/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Body of `POST /sessions/{id}/answer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerBody {
    pub tool_use_id: String,
    pub answers: Answers,
}

/// Data of the `session-started` SSE event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartedData {
    pub session_id: String,
}

/// Body of `POST {base}/pools/{pool}/sessions`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoolSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Response of `POST {base}/pools/{pool}/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSession {
    pub id: String,
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_mode_restricts_tools() {
        let tools = AgentMode::Plan.allowed_tools().unwrap();
        assert_eq!(tools.len(), 8);
        assert!(tools.iter().any(|t| t == "AskUserQuestion"));
        assert!(!tools.iter().any(|t| t == "Bash" || t == "Edit"));
        assert_eq!(AgentMode::Plan.permission_mode(), Some("plan"));
    }

    #[test]
    fn test_build_mode_unrestricted() {
        assert!(AgentMode::Build.allowed_tools().is_none());
        assert!(AgentMode::Build.permission_mode().is_none());
    }

    #[test]
    fn test_create_body_omits_unset_fields() {
        let body = CreateSessionBody {
            prompt: "hi".to_string(),
            working_directory: None,
            mode: AgentMode::Build,
            model: None,
            system_prompt: None,
            resume_id: None,
            allowed_tools: None,
            permission_mode: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"prompt": "hi", "mode": "build"}));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("PLAN".parse::<AgentMode>().unwrap(), AgentMode::Plan);
        assert!("review".parse::<AgentMode>().is_err());
    }
}
