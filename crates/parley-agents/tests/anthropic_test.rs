use std::io;
use std::net::SocketAddr;

use axum::response::sse::{Event, KeepAlive};
use axum::{
    Router,
    extract::Json,
    response::{IntoResponse, Sse},
    routing::post,
};
use futures::stream::{self, StreamExt};
use parley_agents::providers::{
    AnthropicProvider, ChatMessage, ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest,
    LlmStreamEvent,
};
use parley_common::Result;
use serde_json::json;
use tokio::sync::oneshot;

async fn start_mock_server() -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let app = Router::new().route("/v1/messages", post(mock_messages));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });

    (addr, tx)
}

async fn mock_messages(Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    let stream = payload["stream"].as_bool().unwrap_or(false);

    if stream {
        let events = vec![
            json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "claude-sonnet-4-20250514",
                    "stop_reason": null,
                    "usage": {"input_tokens": 12, "output_tokens": 1}
                }
            }),
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "thinking", "thinking": ""}
            }),
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": "considering"}
            }),
            json!({"type": "content_block_stop", "index": 0}),
            json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "text", "text": ""}
            }),
            json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": {"type": "text_delta", "text": "Hello"}
            }),
            json!({"type": "content_block_stop", "index": 1}),
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 6}
            }),
            json!({"type": "message_stop"}),
        ];

        let stream = stream::iter(
            events
                .into_iter()
                .map(|e| Ok::<_, io::Error>(Event::default().data(e.to_string()))),
        );

        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        Json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "Hello world"}],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 6}
        }))
        .into_response()
    }
}

fn request() -> LlmRequest {
    LlmRequest {
        model: "claude-sonnet-4-20250514".to_string(),
        messages: vec![ChatMessage::user_text("Hello")],
        system: None,
        max_tokens: Some(100),
        temperature: None,
        tools: vec![],
    }
}

#[tokio::test]
async fn complete_returns_text_and_usage() -> Result<()> {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = AnthropicProvider::new("test-key".to_string())
        .with_base_url(format!("http://{addr}/v1/messages"));

    let response = provider.complete(&request()).await?;

    assert_eq!(response.content.len(), 1);
    match &response.content[0] {
        ContentBlock::Text { text } => assert_eq!(text, "Hello world"),
        other => panic!("expected text content, got {other:?}"),
    }
    assert_eq!(response.usage.unwrap().input_tokens, 12);
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));

    Ok(())
}

#[tokio::test]
async fn stream_yields_thinking_and_text_deltas() -> Result<()> {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = AnthropicProvider::new("test-key".to_string())
        .with_base_url(format!("http://{addr}/v1/messages"));

    let mut stream = provider.stream(&request()).await?;
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }

    assert!(matches!(
        events.first(),
        Some(LlmStreamEvent::MessageStart { id: Some(id), usage: Some(u) })
            if id == "msg_1" && u.input_tokens == 12
    ));

    let has_thinking = events.iter().any(|e| {
        matches!(
            e,
            LlmStreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::Thinking { thinking },
                ..
            } if thinking == "considering"
        )
    });
    assert!(has_thinking, "missing thinking delta");

    let has_text = events.iter().any(|e| {
        matches!(
            e,
            LlmStreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::Text { text },
                ..
            } if text == "Hello"
        )
    });
    assert!(has_text, "missing text delta");

    let has_stop = events.iter().any(|e| {
        matches!(
            e,
            LlmStreamEvent::MessageStop { stop_reason: Some(r), .. } if r == "end_turn"
        )
    });
    assert!(has_stop, "missing message stop");

    Ok(())
}

#[tokio::test]
async fn health_check_reports_reachable_server() -> Result<()> {
    let (addr, _shutdown_tx) = start_mock_server().await;
    let provider = AnthropicProvider::new("test-key".to_string())
        .with_base_url(format!("http://{addr}/v1/messages"));

    assert!(provider.health_check().await?);
    Ok(())
}
