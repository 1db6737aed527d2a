//! Conductor: agent execution orchestration.
//!
//! Delegates coding-agent conversations to an execution backend (in-process,
//! container-per-task or cloud pool) and hands callers one uniform event
//! stream regardless of where the agent runs.

pub mod backend;
pub mod container;
pub mod error;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod transport;

pub use backend::{AgentBackend, BackendKind, EventStream, StartSessionRequest};
pub use error::{BackendError, BackendResult};
pub use registry::SessionStatus;
