use conductor_protocol::{Event, EventPayload};
use futures::StreamExt;
use log::warn;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Collaborators, EVENT_BUFFER, EventStream, is_cacheable};
use crate::error::BackendError;

/// Stamps payloads with the orchestrator session id and fans them out to the
/// caller's stream, the message cache and the live-update sink.
#[derive(Clone)]
pub struct EventEmitter {
    session_id: String,
    tx: mpsc::Sender<Event>,
    collaborators: Collaborators,
}

impl EventEmitter {
    /// A new emitter and the stream it feeds.
    pub fn channel(
        session_id: impl Into<String>,
        collaborators: Collaborators,
    ) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let emitter = Self {
            session_id: session_id.into(),
            tx,
            collaborators,
        };
        (emitter, ReceiverStream::new(rx).boxed())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit one event. Returns `false` once the caller dropped the stream.
    pub async fn emit(&self, payload: EventPayload) -> bool {
        let event = Event::now(&self.session_id, payload);

        if is_cacheable(&event.payload)
            && let Err(e) = self
                .collaborators
                .cache
                .append_message(&self.session_id, &event)
                .await
        {
            warn!("failed to cache event for session {}: {:#}", self.session_id, e);
        }
        self.collaborators.live.notify(&self.session_id, &event).await;

        self.tx.send(event).await.is_ok()
    }

    pub async fn emit_all(&self, payloads: Vec<EventPayload>) -> bool {
        for payload in payloads {
            if !self.emit(payload).await {
                return false;
            }
        }
        true
    }

    /// Emit an error event. Cancellation is not an error for the caller and
    /// emits nothing.
    pub async fn error(&self, error: &BackendError) -> bool {
        if matches!(error, BackendError::Cancelled) {
            return !self.tx.is_closed();
        }
        warn!("session {}: {}", self.session_id, error);
        self.emit(super::error_payload(error)).await
    }

    /// Whether the caller dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
