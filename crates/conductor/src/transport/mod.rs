//! HTTP transport to workers and control planes.
//!
//! [`Transport::stream_request`] POSTs a JSON body and exposes the SSE
//! response as a lazy stream of [`NamedEvent`]s. It is single-use: the stream
//! ends on the terminal `done` event, on a broken connection (as an error),
//! or when the caller drops it. Retries are the caller's business, so the
//! event source never reconnects.

use std::pin::Pin;
use std::time::Duration;

use conductor_protocol::worker::SSE_DONE;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use reqwest_eventsource::{Event as SseEvent, EventSource, retry::Never};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// One SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedEvent {
    pub event_type: String,
    pub data: String,
}

pub type NamedEventStream = Pin<Box<dyn Stream<Item = Result<NamedEvent, TransportError>> + Send>>;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Non-2xx response.
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    /// Connection-level failure before a response arrived.
    #[error("{method} {url} failed: {message}")]
    Request {
        method: &'static str,
        url: String,
        message: String,
    },

    /// The event stream broke after it was opened.
    #[error("event stream from {url} broke: {message}")]
    Stream { url: String, message: String },

    /// The response body could not be decoded.
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl TransportError {
    /// HTTP status of a rejected request, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared HTTP client with an optional bearer token.
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    bearer_token: Option<String>,
    request_timeout: Duration,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            bearer_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    /// Timeout for plain (non-streaming) requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// POST `body` and stream the SSE response.
    ///
    /// Resolves once the response headers arrive; a non-2xx status is
    /// returned as [`TransportError::Status`] here rather than on the stream.
    pub async fn stream_request<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> TransportResult<NamedEventStream> {
        let request = self
            .authorize(self.client.post(url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body);

        let mut source = EventSource::new(request).map_err(|e| TransportError::Request {
            method: "POST",
            url: url.to_string(),
            message: e.to_string(),
        })?;
        source.set_retry_policy(Box::new(Never));

        let mut first = None;
        match source.next().await {
            Some(Ok(SseEvent::Open)) => {
                debug!("event stream opened: {}", url);
            }
            Some(Ok(SseEvent::Message(msg))) => {
                first = Some(Ok(NamedEvent {
                    event_type: msg.event,
                    data: msg.data,
                }));
            }
            Some(Err(e)) => {
                source.close();
                return Err(open_error(url, e).await);
            }
            None => {
                return Err(TransportError::Stream {
                    url: url.to_string(),
                    message: "stream closed before opening".to_string(),
                });
            }
        }

        let rest = named_events(url.to_string(), source);
        Ok(futures::stream::iter(first).chain(rest).boxed())
    }

    /// POST JSON and decode a JSON response.
    pub async fn post_json<B, R>(&self, url: &str, body: &B) -> TransportResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self
            .authorize(self.client.post(url))
            .timeout(self.request_timeout)
            .json(body);
        let response = send(request, "POST", url).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| TransportError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    /// POST with no body, ignoring the response body.
    pub async fn post_empty(&self, url: &str) -> TransportResult<()> {
        let request = self
            .authorize(self.client.post(url))
            .timeout(self.request_timeout);
        send(request, "POST", url).await.map(|_| ())
    }

    pub async fn delete(&self, url: &str) -> TransportResult<()> {
        let request = self
            .authorize(self.client.delete(url))
            .timeout(self.request_timeout);
        send(request, "DELETE", url).await.map(|_| ())
    }

    /// GET and report whether the response was 2xx. Connection errors count
    /// as unhealthy.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("probe {} failed: {}", url, e);
                false
            }
        }
    }
}

async fn send(
    request: reqwest::RequestBuilder,
    method: &'static str,
    url: &str,
) -> TransportResult<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| TransportError::Request {
            method,
            url: url.to_string(),
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            method,
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

async fn open_error(url: &str, error: reqwest_eventsource::Error) -> TransportError {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            TransportError::Status {
                method: "POST",
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
        }
        reqwest_eventsource::Error::InvalidContentType(content_type, _) => {
            TransportError::Decode {
                url: url.to_string(),
                message: format!("expected text/event-stream, got {:?}", content_type),
            }
        }
        other => TransportError::Request {
            method: "POST",
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

/// Adapt an opened event source into a stream of named events that ends
/// after `done`.
fn named_events(url: String, source: EventSource) -> NamedEventStream {
    let state = Some((url, source));
    futures::stream::unfold(state, |state| async move {
        let (url, mut source) = state?;
        loop {
            match source.next().await {
                Some(Ok(SseEvent::Open)) => continue,
                Some(Ok(SseEvent::Message(msg))) => {
                    if msg.event == SSE_DONE {
                        debug!("event stream from {} done", url);
                        source.close();
                        return None;
                    }
                    let event = NamedEvent {
                        event_type: msg.event,
                        data: msg.data,
                    };
                    return Some((Ok(event), Some((url, source))));
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    source.close();
                    let err = TransportError::Stream {
                        url: url.clone(),
                        message: "stream ended before done".to_string(),
                    };
                    return Some((Err(err), None));
                }
                Some(Err(e)) => {
                    source.close();
                    let err = TransportError::Stream {
                        url: url.clone(),
                        message: e.to_string(),
                    };
                    return Some((Err(err), None));
                }
            }
        }
    })
    .boxed()
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a:1/", "/health"), "http://a:1/health");
        assert_eq!(join_url("http://a:1", "sessions/x"), "http://a:1/sessions/x");
    }

    #[test]
    fn test_status_accessor() {
        let err = TransportError::Status {
            method: "POST",
            url: "u".into(),
            status: 503,
            body: String::new(),
        };
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("503"));
    }
}
