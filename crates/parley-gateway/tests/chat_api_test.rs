use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parley_agents::ChatPipeline;
use parley_agents::providers::{
    ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest, LlmResponse, LlmStreamEvent,
};
use parley_agents::toolset::ToolRegistry;
use parley_common::{Identity, MessageRole, Result, WorkspaceId};
use parley_db::{ChatStore, NewConversation, NewMessage};
use parley_gateway::{AppState, build_router};
use serde_json::json;

/// Provider that answers every turn with a fixed text response.
struct CannedProvider;

#[async_trait]
impl LlmProvider for CannedProvider {
    fn provider_id(&self) -> &str {
        "canned"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        Ok(LlmResponse {
            content: vec![ContentBlock::Text {
                text: "Canned title".to_string(),
            }],
            model: "canned".to_string(),
            usage: None,
            stop_reason: Some("end_turn".to_string()),
        })
    }

    async fn stream(
        &self,
        _request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let events = vec![
            LlmStreamEvent::MessageStart { id: None, usage: None },
            LlmStreamEvent::ContentBlockDelta {
                index: 0,
                delta: ContentBlockDelta::Text {
                    text: "Hello from the model. ".to_string(),
                },
            },
            LlmStreamEvent::MessageStop {
                stop_reason: Some("end_turn".to_string()),
                usage: None,
            },
        ];
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

struct TestServer {
    base_url: String,
    store: Arc<ChatStore>,
    client: reqwest::Client,
}

async fn start_server() -> TestServer {
    let store = Arc::new(ChatStore::in_memory().unwrap());
    store
        .insert_session(
            "test-token",
            &Identity {
                user_id: "u1".to_string(),
                workspace_id: WorkspaceId::from("ws-1"),
            },
        )
        .unwrap();

    let pipeline = ChatPipeline::new(
        Arc::clone(&store) as Arc<dyn parley_agents::ConversationStore>,
        Arc::new(CannedProvider),
        Arc::new(ToolRegistry::new()),
        vec![],
        5,
        0.7,
        128_000,
    );

    let state = AppState {
        config: Arc::new(parley_config::AppConfig::default()),
        store: Arc::clone(&store),
        pipeline: Arc::new(pipeline),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        store,
        client: reqwest::Client::new(),
    }
}

fn chat_body(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "messages": [{"role": "user", "content": "Say hello"}],
        "selectedChatModel": "test-model",
        "supportsTools": false,
    })
}

#[tokio::test]
async fn chat_streams_ndjson_events() {
    let server = start_server().await;

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .bearer_auth("test-token")
        .json(&chat_body("c1"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );

    let body = resp.text().await.unwrap();
    let events: Vec<serde_json::Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(events.iter().any(|e| e["type"] == "text-delta"));
    let finish = events.last().unwrap();
    assert_eq!(finish["type"], "finish");
    assert_eq!(finish["conversation_id"], "c1");
    assert!(finish["message_id"].is_string());

    // Both sides of the turn were persisted
    let messages = server.store.load_messages("c1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
}

#[tokio::test]
async fn chat_requires_a_session() {
    let server = start_server().await;

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .json(&chat_body("c1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .bearer_auth("wrong-token")
        .json(&chat_body("c1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn malformed_chat_body_is_rejected_with_details() {
    let server = start_server().await;

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .bearer_auth("test-token")
        .json(&json!({"id": "c1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn malformed_chat_body_outranks_a_bad_session() {
    let server = start_server().await;

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .bearer_auth("wrong-token")
        .json(&json!({"id": "c1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let server = start_server().await;

    let mut body = chat_body("c1");
    body["selectedChatModel"] = json!("agent/missing");

    let resp = server
        .client
        .post(format!("{}/chat", server.base_url))
        .bearer_auth("test-token")
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert!(server.store.load_messages("c1").unwrap().is_empty());
}

fn seed_conversation(store: &ChatStore, id: &str, owner: &str) {
    store
        .create_conversation(&NewConversation {
            id: id.to_string(),
            owner_id: owner.to_string(),
            workspace_id: "ws-1".to_string(),
            title: "seeded".to_string(),
            model: "test-model".to_string(),
            system_prompt: String::new(),
            temperature: 0.7,
            context_window: 128_000,
            agent_id: None,
        })
        .unwrap();
}

#[tokio::test]
async fn delete_chat_enforces_ownership() {
    let server = start_server().await;
    seed_conversation(&server.store, "mine", "u1");
    seed_conversation(&server.store, "theirs", "u2");

    let resp = server
        .client
        .delete(format!("{}/chat?id=theirs", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(server.store.get_conversation("theirs").unwrap().is_some());

    let resp = server
        .client
        .delete(format!("{}/chat?id=mine", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(server.store.get_conversation("mine").unwrap().is_none());

    // Gone now
    let resp = server
        .client
        .delete(format!("{}/chat?id=mine", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn delete_chat_without_id_is_not_found() {
    let server = start_server().await;

    let resp = server
        .client
        .delete(format!("{}/chat", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn vote_round_trip() {
    let server = start_server().await;
    seed_conversation(&server.store, "c1", "u1");
    server
        .store
        .append_message(&NewMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            role: MessageRole::Assistant,
            parts: vec![parley_common::ContentPart::text("hi")],
            attachments: vec![],
            model: None,
            response_id: None,
        })
        .unwrap();

    let resp = server
        .client
        .patch(format!("{}/vote", server.base_url))
        .bearer_auth("test-token")
        .json(&json!({"chatId": "c1", "messageId": "m1", "type": "up"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let votes: serde_json::Value = server
        .client
        .get(format!("{}/vote?chatId=c1", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(votes[0]["messageId"], "m1");
    assert_eq!(votes[0]["isUpvoted"], true);

    // Re-voting replaces the previous vote
    server
        .client
        .patch(format!("{}/vote", server.base_url))
        .bearer_auth("test-token")
        .json(&json!({"chatId": "c1", "messageId": "m1", "type": "down"}))
        .send()
        .await
        .unwrap();

    let votes: serde_json::Value = server
        .client
        .get(format!("{}/vote?chatId=c1", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(votes.as_array().unwrap().len(), 1);
    assert_eq!(votes[0]["isUpvoted"], false);
}

#[tokio::test]
async fn vote_validates_params_and_existence() {
    let server = start_server().await;
    seed_conversation(&server.store, "c1", "u1");

    let resp = server
        .client
        .get(format!("{}/vote", server.base_url))
        .bearer_auth("test-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .patch(format!("{}/vote", server.base_url))
        .bearer_auth("test-token")
        .json(&json!({"chatId": "c1", "messageId": "m1", "type": "sideways"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Message does not exist in the conversation
    let resp = server
        .client
        .patch(format!("{}/vote", server.base_url))
        .bearer_auth("test-token")
        .json(&json!({"chatId": "c1", "messageId": "ghost", "type": "up"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn health_is_open() {
    let server = start_server().await;

    let resp = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}
