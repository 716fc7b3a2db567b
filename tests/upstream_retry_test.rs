// ABOUTME: Integration tests for the upstream client against a stub HTTP server
// ABOUTME: Covers retry/backoff policy, rate limit handling, and stream decoding end-to-end
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures_util::stream;
use tokio_stream::StreamExt;

use chat_relay_server::errors::ErrorCode;
use chat_relay_server::llm::{
    ChatMessage, CompletionBackend, CompletionRequest, RetryPolicy, UpstreamClient, UpstreamConfig,
};

// ============================================================================
// Stub Upstream Server
// ============================================================================

#[derive(Clone)]
enum Behavior {
    /// First `limited` requests get a 429 with `Retry-After`, then a stream
    RateLimitThenStream { limited: u32, retry_after_secs: u64 },
    /// Every request gets a 500
    AlwaysServerError,
    /// Every request gets a 400 with a JSON error body
    BadRequest,
    /// Every request gets a successful SSE stream
    Stream,
    /// Every request gets a whole-body completion
    Complete,
    /// Accepts the request but never sends response headers
    NeverResponds,
    /// Sends one chunk, then holds the connection open forever
    StallAfterFirstChunk,
}

#[derive(Clone)]
struct StubState {
    hits: Arc<AtomicU32>,
    behavior: Behavior,
}

fn sse_body() -> Response {
    let body = concat!(
        "data: {\"id\":\"stub-1\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"stub-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"stub-1\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"stub-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"stub-1\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"stub-model\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    (
        StatusCode::OK,
        [("content-type", "text/event-stream")],
        body,
    )
        .into_response()
}

async fn completions_handler(State(state): State<StubState>) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;

    match state.behavior {
        Behavior::RateLimitThenStream {
            limited,
            retry_after_secs,
        } => {
            if hit <= limited {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", retry_after_secs.to_string())],
                    "rate limited",
                )
                    .into_response()
            } else {
                sse_body()
            }
        }
        Behavior::AlwaysServerError => {
            (StatusCode::INTERNAL_SERVER_ERROR, "oops").into_response()
        }
        Behavior::BadRequest => (
            StatusCode::BAD_REQUEST,
            [("content-type", "application/json")],
            r#"{"error":{"message":"bad model name","type":"invalid_request_error"}}"#,
        )
            .into_response(),
        Behavior::Stream => sse_body(),
        Behavior::Complete => (
            StatusCode::OK,
            [("content-type", "application/json")],
            r#"{"choices":[{"message":{"content":"Hi there"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7},"model":"stub-model"}"#,
        )
            .into_response(),
        Behavior::NeverResponds => {
            std::future::pending::<()>().await;
            unreachable!()
        }
        Behavior::StallAfterFirstChunk => {
            let first = Bytes::from(
                "data: {\"id\":\"stub-1\",\"object\":\"chat.completion.chunk\",\"created\":1700000000,\"model\":\"stub-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            );
            let body = Body::from_stream(
                stream::iter([Ok::<_, std::io::Error>(first)]).chain(stream::pending()),
            );
            (
                StatusCode::OK,
                [("content-type", "text/event-stream")],
                body,
            )
                .into_response()
        }
    }
}

async fn spawn_stub(behavior: Behavior) -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let state = StubState {
        hits: Arc::clone(&hits),
        behavior,
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(completions_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/v1"), hits)
}

fn client(base_url: String, max_retries: u32, base_delay: Duration) -> UpstreamClient {
    client_with_chunk_timeout(base_url, max_retries, base_delay, Duration::from_secs(5))
}

fn client_with_chunk_timeout(
    base_url: String,
    max_retries: u32,
    base_delay: Duration,
    chunk_timeout: Duration,
) -> UpstreamClient {
    UpstreamClient::new(UpstreamConfig {
        base_url,
        api_key: "test-key".to_owned(),
        default_model: "stub-model".to_owned(),
        default_temperature: None,
        default_max_tokens: None,
        chunk_timeout,
        retry: RetryPolicy {
            max_retries,
            base_delay,
        },
    })
    .unwrap()
}

fn request() -> CompletionRequest {
    CompletionRequest::new(vec![ChatMessage::user("hello")])
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_rate_limit_waits_without_consuming_retry_budget() {
    let (base_url, hits) = spawn_stub(Behavior::RateLimitThenStream {
        limited: 1,
        retry_after_secs: 1,
    })
    .await;
    // Zero retries: success after a 429 proves the budget was not consumed
    let client = client(base_url, 0, Duration::from_millis(25));

    let started = Instant::now();
    let stream = client.complete_stream(&request().with_streaming()).await.unwrap();
    let events: Vec<_> = stream.collect().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "waited {elapsed:?}");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let text: String = events
        .iter()
        .filter_map(|e| e.as_ref().ok())
        .filter_map(|e| e.content.clone())
        .collect();
    assert_eq!(text, "Hello");
}

#[tokio::test]
async fn test_server_errors_exhaust_budget_with_exponential_backoff() {
    let (base_url, hits) = spawn_stub(Behavior::AlwaysServerError).await;
    let base = Duration::from_millis(50);
    let client = client(base_url, 3, base);

    let started = Instant::now();
    let error = client.complete(&request()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.code, ErrorCode::ExternalServiceUnavailable);
    // Initial request plus three retries
    assert_eq!(hits.load(Ordering::SeqCst), 4);
    // Backoff slept at least base * (1 + 2 + 4)
    assert!(elapsed >= base * 7, "backoff too short: {elapsed:?}");
}

#[tokio::test]
async fn test_client_error_is_terminal_without_retry() {
    let (base_url, hits) = spawn_stub(Behavior::BadRequest).await;
    let client = client(base_url, 3, Duration::from_millis(25));

    let error = client.complete(&request()).await.unwrap_err();

    assert_eq!(error.code, ErrorCode::ExternalServiceError);
    assert!(error.message.contains("bad model name"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streaming_decodes_chunks_and_terminates_on_done() {
    let (base_url, _hits) = spawn_stub(Behavior::Stream).await;
    let client = client(base_url, 0, Duration::from_millis(25));

    let stream = client.complete_stream(&request().with_streaming()).await.unwrap();
    let events: Vec<_> = stream.collect().await;

    assert_eq!(events.len(), 3);
    let text: String = events
        .iter()
        .filter_map(|e| e.as_ref().ok())
        .filter_map(|e| e.content.clone())
        .collect();
    assert_eq!(text, "Hello");

    let last = events.last().unwrap().as_ref().unwrap();
    assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    assert_eq!(last.id, "stub-1");
    assert_eq!(last.model, "stub-model");
}

#[tokio::test]
async fn test_whole_body_completion() {
    let (base_url, hits) = spawn_stub(Behavior::Complete).await;
    let client = client(base_url, 0, Duration::from_millis(25));

    let response = client.complete(&request()).await.unwrap();

    assert_eq!(response.content, "Hi there");
    assert_eq!(response.model, "stub-model");
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert_eq!(response.usage.as_ref().unwrap().total_tokens, 7);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_header_silence_times_out_and_retries() {
    let (base_url, hits) = spawn_stub(Behavior::NeverResponds).await;
    let client = client_with_chunk_timeout(
        base_url,
        1,
        Duration::from_millis(10),
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let error = match client.complete_stream(&request().with_streaming()).await {
        Ok(_) => panic!("expected an error"),
        Err(error) => error,
    };
    let elapsed = started.elapsed();

    assert_eq!(error.code, ErrorCode::ExternalServiceUnavailable);
    // Initial request plus one retry, each cut off at the header timeout
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(400), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "hung too long: {elapsed:?}");
}

#[tokio::test]
async fn test_mid_stream_stall_surfaces_timeout_error() {
    let (base_url, _hits) = spawn_stub(Behavior::StallAfterFirstChunk).await;
    let client = client_with_chunk_timeout(
        base_url,
        0,
        Duration::from_millis(10),
        Duration::from_millis(200),
    );

    let stream = client.complete_stream(&request().with_streaming()).await.unwrap();
    let events: Vec<_> = stream.collect().await;

    // One decoded chunk, then the inactivity timeout ends the stream
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_ref().unwrap().content.as_deref(), Some("Hel"));
    let error = events[1].as_ref().unwrap_err();
    assert_eq!(error.code, ErrorCode::ExternalServiceUnavailable);
}

#[tokio::test]
async fn test_unreachable_upstream_exhausts_connect_retries() {
    // Nothing listens on this port
    let client = client(
        "http://127.0.0.1:1/v1".to_owned(),
        1,
        Duration::from_millis(10),
    );

    let error = client.complete(&request()).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::ExternalServiceUnavailable);
}
