//! SSE transport against a live HTTP server.

use conductor::transport::{Transport, TransportError, join_url};
use conductor_protocol::worker::{CreateSessionBody, SendMessageBody};
use futures::StreamExt;

mod common;
use common::FakeWorker;

fn create_body(prompt: &str) -> CreateSessionBody {
    CreateSessionBody {
        prompt: prompt.to_string(),
        working_directory: None,
        mode: Default::default(),
        model: None,
        system_prompt: None,
        resume_id: None,
        allowed_tools: None,
        permission_mode: None,
    }
}

#[tokio::test]
async fn test_stream_request_splits_named_events() {
    let worker = FakeWorker::start().await;
    let transport = Transport::new();

    let stream = transport
        .stream_request(&join_url(&worker.base_url, "sessions"), &create_body("hi"))
        .await
        .unwrap();
    let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;

    let names: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "session-started",
            "system",
            "stream_event",
            "stream_event",
            "stream_event",
            "stream_event",
            "assistant",
            "result",
        ]
    );
    let started: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(started["session_id"], "w-1");
}

#[tokio::test]
async fn test_rejected_stream_reports_status() {
    let worker = FakeWorker::start().await;
    let transport = Transport::new();
    let body = SendMessageBody {
        message: "hello".to_string(),
        model: None,
    };

    let err = match transport
        .stream_request(
            &join_url(&worker.base_url, "sessions/unknown/messages"),
            &body,
        )
        .await
    {
        Ok(_) => panic!("expected a status error"),
        Err(e) => e,
    };
    assert!(matches!(err, TransportError::Status { .. }));
    assert_eq!(err.status(), Some(404));
}

#[tokio::test]
async fn test_plain_helpers() {
    let worker = FakeWorker::start().await;
    let transport = Transport::new().with_bearer_token(Some("tok".to_string()));

    transport
        .post_empty(&join_url(&worker.base_url, "sessions/w-9/interrupt"))
        .await
        .unwrap();
    transport
        .delete(&join_url(&worker.base_url, "sessions/w-9"))
        .await
        .unwrap();
    assert_eq!(*worker.state.interrupted.lock().unwrap(), vec!["w-9"]);
    assert_eq!(*worker.state.deleted.lock().unwrap(), vec!["w-9"]);

    assert!(
        transport
            .probe(
                &join_url(&worker.base_url, "health"),
                std::time::Duration::from_secs(1)
            )
            .await
    );
    assert!(
        !transport
            .probe("http://127.0.0.1:9/health", std::time::Duration::from_secs(1))
            .await
    );
}
