//! Execution backends.
//!
//! An [`AgentBackend`] places the agent process somewhere and turns its
//! output into caller [`Event`]s:
//!
//! - [`InProcessBackend`]: agent runtime client driven from this process.
//! - [`ContainerBackend`]: one worker container per task, proxied over HTTP.
//! - [`CloudBackend`]: dynamic session from a cloud pool, proxied over HTTP.
//!
//! Long-running calls return an [`EventStream`] fed by a spawned task; errors
//! on those calls arrive as error events rather than `Err`.

mod cloud;
mod collaborators;
mod container;
mod emitter;
mod in_process;
mod runtime;
mod worker;

pub use cloud::{
    CloudBackend, CloudBackendConfig, ControlPlane, HttpControlPlane, MAX_DURATION_REASON,
};
pub use collaborators::{
    Collaborators, LiveUpdateSink, MessageCache, NoopCollaborator, Workspace, WorkspaceProvider,
};
pub use container::{ContainerBackend, ContainerBackendConfig, CredentialSpec};
pub use emitter::EventEmitter;
pub use in_process::{InProcessBackend, InProcessConfig};
pub use runtime::{
    AgentClient, AgentOptions, AgentRuntime, CliAgentConfig, CliAgentRuntime, QueryHandle,
    QueryRequest,
};
pub use worker::{HealthProbe, HttpHealthProbe, WorkerClient};

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use conductor_protocol::{AgentMode, Answers, Event, EventPayload};
use futures::{Stream, StreamExt};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};
use crate::registry::SessionStatus;

/// Lazy, non-restartable sequence of events for one operation.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Events buffered between a backend task and a slow consumer.
pub(crate) const EVENT_BUFFER: usize = 256;

/// Backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    InProcess,
    Container,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::InProcess => write!(f, "in_process"),
            BackendKind::Container => write!(f, "container"),
            BackendKind::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "in_process" | "local" => Ok(BackendKind::InProcess),
            "container" => Ok(BackendKind::Container),
            "cloud" => Ok(BackendKind::Cloud),
            other => Err(format!(
                "unknown backend '{other}' (expected in_process, container or cloud)"
            )),
        }
    }
}

/// Parameters for [`AgentBackend::start_session`].
#[derive(Debug, Clone, Default)]
pub struct StartSessionRequest {
    /// Orchestrator session id; generated when absent.
    pub session_id: Option<String>,
    pub working_directory: PathBuf,
    pub mode: AgentMode,
    pub model: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Conversation id from an earlier turn to continue.
    pub resume_id: Option<String>,
    /// Task the session belongs to (container backend reuses its worker).
    pub task_id: Option<String>,
}

impl StartSessionRequest {
    pub fn new(prompt: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn resume(mut self, conversation_id: impl Into<String>) -> Self {
        self.resume_id = Some(conversation_id.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Uniform interface over execution backends.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Allocate a runtime slot, run the first prompt and stream its events.
    async fn start_session(&self, request: StartSessionRequest) -> EventStream;

    /// Run another turn in an existing session. Waits for any in-flight
    /// operation of the session to finish first.
    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        model: Option<String>,
    ) -> EventStream;

    /// Deliver answers to a pending question. Backends whose waiting turn
    /// resumes on its original stream return `Ok(None)`.
    async fn answer_question(
        &self,
        session_id: &str,
        tool_use_id: &str,
        answers: Answers,
    ) -> BackendResult<Option<EventStream>>;

    /// Cut the running turn short; the session stays usable.
    async fn interrupt_session(&self, session_id: &str) -> BackendResult<()>;

    /// End the session and release its runtime slot.
    async fn stop_session(&self, session_id: &str) -> BackendResult<()>;

    async fn session_status(&self, session_id: &str) -> Option<SessionStatus>;

    async fn list_sessions(&self) -> Vec<SessionStatus>;

    /// Remove runtime resources no session tracks. Returns how many.
    async fn cleanup_orphaned_containers(&self) -> BackendResult<usize> {
        Ok(0)
    }

    /// Stop every session; errors are logged.
    async fn shutdown(&self) {
        for status in self.list_sessions().await {
            if let Err(e) = self.stop_session(&status.session_id).await {
                warn!("failed to stop session {}: {}", status.session_id, e);
            }
        }
    }
}

/// Generate an orchestrator session id.
pub fn new_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().simple())
}

/// A stream yielding a single error event.
pub(crate) fn error_stream(session_id: &str, error: &BackendError) -> EventStream {
    let event = Event::now(
        session_id,
        EventPayload::Error {
            error: error.to_string(),
            kind: error.kind(),
        },
    );
    futures::stream::iter([event]).boxed()
}

/// Error payload for a failed operation.
pub(crate) fn error_payload(error: &BackendError) -> EventPayload {
    EventPayload::Error {
        error: error.to_string(),
        kind: error.kind(),
    }
}

/// Events persisted to the message cache.
pub(crate) fn is_cacheable(payload: &EventPayload) -> bool {
    matches!(
        payload,
        EventPayload::Message { .. } | EventPayload::Result(_) | EventPayload::Question { .. }
    )
}
