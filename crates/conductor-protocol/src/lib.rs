//! Protocol types for the conductor agent orchestrator.
//!
//! Three boundaries share these types:
//!
//! ```text
//! Caller <--[events]-- Backend <--[SSE: message protocol]-- Worker (container / cloud pool)
//!                         |
//!                         +--[stdio: message protocol + control]-- Agent CLI (in-process)
//! ```
//!
//! Callers only ever see [`events::Event`]. Backends translate the agent's
//! native message protocol ([`messages`]) into that vocabulary, independent of
//! where the agent process runs.

pub mod events;
pub mod messages;
pub mod worker;

pub use events::{
    BlockKind, ContentBlock, ErrorKind, Event, EventPayload, QuestionItem, QuestionOption, Role,
    TurnResult,
};
pub use messages::{AgentMessage, BlockDelta, NativeBlock, ResultMessage, StreamEvent};
pub use worker::{AgentMode, Answers};

/// Name of the tool the agent uses to ask the user a question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";
