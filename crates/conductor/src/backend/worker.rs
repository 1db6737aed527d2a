//! Worker HTTP API shared by the container and cloud backends.
//!
//! A worker wraps the agent behind `POST /sessions`, `POST
//! /sessions/{id}/messages|answer|interrupt`, `DELETE /sessions/{id}` and
//! `GET /health`. Streaming endpoints answer with SSE events named after the
//! native message type.

use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::worker::{
    AnswerBody, CreateSessionBody, SSE_ERROR, SSE_SESSION_STARTED, SendMessageBody,
    SessionStartedData,
};
use conductor_protocol::{AgentMessage, EventPayload};
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::EventEmitter;
use crate::error::{BackendError, BackendResult};
use crate::registry::{SessionRecord, SessionRegistry};
use crate::stream::TurnTranslator;
use crate::transport::{NamedEvent, NamedEventStream, Transport, TransportResult, join_url};

/// Client for one worker endpoint.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    transport: Transport,
    base_url: String,
}

impl WorkerClient {
    pub fn new(transport: Transport, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub async fn create_session(
        &self,
        body: &CreateSessionBody,
    ) -> TransportResult<NamedEventStream> {
        self.transport.stream_request(&self.url("sessions"), body).await
    }

    pub async fn send_message(
        &self,
        worker_session_id: &str,
        body: &SendMessageBody,
    ) -> TransportResult<NamedEventStream> {
        let url = self.url(&format!("sessions/{}/messages", worker_session_id));
        self.transport.stream_request(&url, body).await
    }

    pub async fn answer(
        &self,
        worker_session_id: &str,
        body: &AnswerBody,
    ) -> TransportResult<NamedEventStream> {
        let url = self.url(&format!("sessions/{}/answer", worker_session_id));
        self.transport.stream_request(&url, body).await
    }

    pub async fn interrupt(&self, worker_session_id: &str) -> TransportResult<()> {
        let url = self.url(&format!("sessions/{}/interrupt", worker_session_id));
        self.transport.post_empty(&url).await
    }

    pub async fn delete_session(&self, worker_session_id: &str) -> TransportResult<()> {
        let url = self.url(&format!("sessions/{}", worker_session_id));
        self.transport.delete(&url).await
    }

    pub async fn is_healthy(&self, timeout: Duration) -> bool {
        self.transport.probe(&self.url("health"), timeout).await
    }
}

/// Decides when a freshly allocated worker is ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Single check.
    async fn is_healthy(&self, base_url: &str) -> bool;

    /// Poll until healthy. Fails with a startup error when attempts run out.
    async fn wait_healthy(&self, base_url: &str, cancel: &CancellationToken) -> BackendResult<()>;
}

/// Polls `GET {base}/health` a fixed number of times.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    transport: Transport,
    attempts: u32,
    interval: Duration,
    probe_timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(transport: Transport, attempts: u32, interval: Duration) -> Self {
        Self {
            transport,
            attempts: attempts.max(1),
            interval,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_healthy(&self, base_url: &str) -> bool {
        self.transport
            .probe(&join_url(base_url, "health"), self.probe_timeout)
            .await
    }

    async fn wait_healthy(&self, base_url: &str, cancel: &CancellationToken) -> BackendResult<()> {
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            if self.is_healthy(base_url).await {
                debug!("worker {} healthy after {} attempt(s)", base_url, attempt);
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        Err(BackendError::Startup(format!(
            "worker at {} not healthy after {} attempts",
            base_url, self.attempts
        )))
    }
}

/// How a proxied turn ended.
#[derive(Debug)]
pub(crate) enum PumpOutcome {
    /// The worker finished the stream.
    Completed,
    /// The operation scope was cancelled.
    Cancelled,
    /// The caller dropped the event stream.
    Closed,
    /// The session's duration ceiling passed.
    Deadline,
    Failed(BackendError),
}

/// Parameters of one proxied turn.
pub(crate) struct WorkerTurn<'a> {
    pub emitter: &'a EventEmitter,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    /// Emit `session.started` once the worker confirms the session.
    pub announce: bool,
    pub resume_id: Option<String>,
}

impl WorkerTurn<'_> {
    /// Forward worker events through `translator` until the stream ends.
    /// `on_started` receives the worker's own session id.
    pub async fn pump<F>(
        &self,
        mut stream: NamedEventStream,
        translator: &mut TurnTranslator,
        mut on_started: F,
    ) -> PumpOutcome
    where
        F: FnMut(&str),
    {
        let deadline = until(self.deadline);
        tokio::pin!(deadline);

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return PumpOutcome::Cancelled,
                _ = &mut deadline => return PumpOutcome::Deadline,
                item = stream.next() => item,
            };
            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(e)) => return PumpOutcome::Failed(e.into()),
                None => return PumpOutcome::Completed,
            };

            let payloads = match event.event_type.as_str() {
                SSE_SESSION_STARTED => {
                    match serde_json::from_str::<SessionStartedData>(&event.data) {
                        Ok(data) => {
                            info!("worker session {} started", data.session_id);
                            on_started(&data.session_id);
                        }
                        Err(e) => warn!("unreadable session-started data: {}", e),
                    }
                    if !self.announce {
                        continue;
                    }
                    vec![EventPayload::SessionStarted {
                        conversation_id: self.resume_id.clone(),
                    }]
                }
                SSE_ERROR => {
                    // The turn's own result/stream end is authoritative.
                    warn!("worker reported error: {}", truncate(&event.data));
                    continue;
                }
                _ => match decode_message(&event) {
                    Some(message) => translator.translate(&message),
                    None => continue,
                },
            };

            if !self.emitter.emit_all(payloads).await {
                return PumpOutcome::Closed;
            }
        }
    }
}

/// Worker request that opens a turn stream.
#[derive(Debug, Clone)]
pub(crate) enum WorkerCall {
    Create(CreateSessionBody),
    Send {
        worker_session_id: String,
        body: SendMessageBody,
    },
    Answer {
        worker_session_id: String,
        body: AnswerBody,
    },
}

/// Open `call` on the worker and pump its events for `record`'s session.
///
/// The worker session id is written into the slot through `set_worker_id`;
/// the conversation id and activity time are written back when the stream
/// ends, whatever the outcome.
pub(crate) async fn proxy_turn<S, F>(
    registry: &SessionRegistry<S>,
    record: &SessionRecord<S>,
    emitter: &EventEmitter,
    client: &WorkerClient,
    call: WorkerCall,
    deadline: Option<Instant>,
    set_worker_id: F,
) -> PumpOutcome
where
    S: Clone,
    F: Fn(&mut S, &str),
{
    let announce = matches!(call, WorkerCall::Create(_));
    let open = async {
        match call {
            WorkerCall::Create(ref body) => client.create_session(body).await,
            WorkerCall::Send {
                ref worker_session_id,
                ref body,
            } => client.send_message(worker_session_id, body).await,
            WorkerCall::Answer {
                ref worker_session_id,
                ref body,
            } => client.answer(worker_session_id, body).await,
        }
    };
    // A worker may hold the response headers until the agent starts.
    let opened = tokio::select! {
        _ = record.cancel.cancelled() => return PumpOutcome::Cancelled,
        _ = until(deadline) => return PumpOutcome::Deadline,
        opened = open => opened,
    };
    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => return PumpOutcome::Failed(e.into()),
    };

    let turn = WorkerTurn {
        emitter,
        cancel: record.cancel.clone(),
        deadline,
        announce,
        resume_id: record.conversation_id.clone(),
    };
    let session_id = record.session_id.as_str();
    let mut translator = TurnTranslator::new();
    let outcome = turn
        .pump(stream, &mut translator, |worker_id| {
            registry.update(session_id, |r| {
                let mut next = r.clone();
                set_worker_id(&mut next.slot, worker_id);
                next
            });
        })
        .await;

    let conversation_id = translator.conversation_id().map(str::to_string);
    registry.update(session_id, |r| {
        let conversation_id = conversation_id.or_else(|| r.conversation_id.clone());
        r.touched().with_conversation_id(conversation_id)
    });
    outcome
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Decode a native message forwarded as SSE. The event name fills in a
/// missing `type`.
fn decode_message(event: &NamedEvent) -> Option<AgentMessage> {
    let mut value: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "undecodable {} event: {} ({})",
                event.event_type,
                truncate(&event.data),
                e
            );
            return None;
        }
    };
    if let Some(obj) = value.as_object_mut()
        && !obj.contains_key("type")
    {
        obj.insert("type".to_string(), Value::String(event.event_type.clone()));
    }

    match serde_json::from_value::<AgentMessage>(value) {
        Ok(AgentMessage::Unknown) => {
            debug!("ignoring worker event {}", event.event_type);
            None
        }
        Ok(message) => Some(message),
        Err(e) => {
            warn!("malformed {} event: {}", event.event_type, e);
            None
        }
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}
