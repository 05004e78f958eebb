use std::env;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parley_common::{Error, Result};
use reqwest::Client;
use serde_json::json;

use super::{
    ChatMessage, ChatRole, ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest, LlmResponse,
    LlmStreamEvent, MessageContent, Usage,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions provider. Also covers self-hosted
/// gateways that speak the same wire format.
pub struct OpenAiProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn from_env(api_key_env: &str) -> Result<Self> {
        let api_key = env::var(api_key_env)
            .map_err(|_| Error::Config(format!("{api_key_env} not set")))?;
        Ok(Self::new(api_key))
    }

    fn encode_messages(request: &LlmRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }

        for msg in &request.messages {
            match (&msg.role, &msg.content) {
                (ChatRole::User, MessageContent::Text(text)) => {
                    messages.push(json!({"role": "user", "content": text}));
                }
                (role, MessageContent::Blocks(blocks)) => {
                    encode_blocks(&mut messages, *role, blocks);
                }
                (ChatRole::Assistant, MessageContent::Text(text)) => {
                    messages.push(json!({"role": "assistant", "content": text}));
                }
            }
        }
        messages
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::encode_messages(request),
            "stream": stream,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    }))
                    .collect::<Vec<_>>()
            );
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("network error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!(
                "OpenAI API error ({status}): {error_text}"
            )));
        }
        Ok(response)
    }
}

/// Tool results become `tool` role messages; assistant tool calls become
/// `tool_calls` entries on the assistant message.
fn encode_blocks(messages: &mut Vec<serde_json::Value>, role: ChatRole, blocks: &[ContentBlock]) {
    match role {
        ChatRole::Assistant => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": input.to_string(),
                        }
                    })),
                    ContentBlock::Thinking { .. } | ContentBlock::ToolResult { .. } => {}
                }
            }
            let mut msg = json!({"role": "assistant"});
            if !text.is_empty() {
                msg["content"] = json!(text);
            }
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            messages.push(msg);
        }
        ChatRole::User => {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    _ => {}
                }
            }
            if !texts.is_empty() {
                messages.push(json!({"role": "user", "content": texts.join("\n")}));
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.request_body(request, false);
        let response = self.post(&body).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid OpenAI response: {e}")))?;

        let message = &raw["choices"][0]["message"];
        let mut content = Vec::new();
        if let Some(text) = message["content"].as_str() {
            if !text.is_empty() {
                content.push(ContentBlock::Text {
                    text: text.to_string(),
                });
            }
        }
        if let Some(tool_calls) = message["tool_calls"].as_array() {
            for call in tool_calls {
                let args = call["function"]["arguments"].as_str().unwrap_or("{}");
                content.push(ContentBlock::ToolUse {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                    input: serde_json::from_str(args).unwrap_or_default(),
                });
            }
        }

        let usage = raw["usage"].as_object().map(|u| Usage {
            input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            output_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        });

        Ok(LlmResponse {
            content,
            model: raw["model"].as_str().unwrap_or_default().to_string(),
            usage,
            stop_reason: raw["choices"][0]["finish_reason"].as_str().map(|s| s.to_string()),
        })
    }

    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let body = self.request_body(request, true);
        let response = self.post(&body).await?;

        let bytes = response.bytes_stream().fuse().boxed();
        let state = SseState {
            buffer: Vec::new(),
            started: false,
            tool_index: 0,
            pending_stop: None,
        };

        let events = stream::try_unfold(
            (bytes, state),
            |(mut bytes, mut state): (BoxStream<'static, reqwest::Result<Bytes>>, SseState)| async move {
                loop {
                    if let Some(i) = state.buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = state.buffer.drain(0..=i).collect();
                        let line = String::from_utf8_lossy(&line_bytes).trim().to_string();

                        if let Some(data) = line.strip_prefix("data: ") {
                            if data == "[DONE]" {
                                return Ok(state
                                    .end_of_stream()
                                    .map(|event| (event, (bytes, state))));
                            }
                            if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                                if let Some(event) = state.next_event(&json) {
                                    return Ok(Some((event, (bytes, state))));
                                }
                            }
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => return Err(Error::Agent(format!("network error: {e}"))),
                        None => {
                            return Ok(state
                                .end_of_stream()
                                .map(|event| (event, (bytes, state))));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

struct SseState {
    buffer: Vec<u8>,
    started: bool,
    tool_index: u32,
    pending_stop: Option<String>,
}

impl SseState {
    /// Map one OpenAI chunk to a normalized event. Tool-call starts and
    /// argument fragments arrive on the same `tool_calls` delta path.
    fn next_event(&mut self, json: &serde_json::Value) -> Option<LlmStreamEvent> {
        if !self.started {
            self.started = true;
            let usage = usage_from_chunk(json);
            if json["choices"][0].is_null() && usage.is_none() {
                return None;
            }
            return Some(LlmStreamEvent::MessageStart {
                id: json["id"].as_str().map(|s| s.to_string()),
                usage,
            });
        }

        // With include_usage the totals arrive in an extra chunk after
        // finish_reason; a held stop is released once usage lands.
        if self.pending_stop.is_some() {
            if let Some(usage) = usage_from_chunk(json) {
                return Some(LlmStreamEvent::MessageStop {
                    stop_reason: self.pending_stop.take(),
                    usage: Some(usage),
                });
            }
        }

        let choice = &json["choices"][0];
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                return Some(LlmStreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentBlockDelta::Text {
                        text: text.to_string(),
                    },
                });
            }
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            let call = calls.first()?;
            if let Some(name) = call["function"]["name"].as_str() {
                self.tool_index += 1;
                return Some(LlmStreamEvent::ContentBlockStart {
                    index: self.tool_index,
                    content_block: ContentBlock::ToolUse {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: name.to_string(),
                        input: json!({}),
                    },
                });
            }
            if let Some(args) = call["function"]["arguments"].as_str() {
                return Some(LlmStreamEvent::ContentBlockDelta {
                    index: self.tool_index,
                    delta: ContentBlockDelta::InputJson {
                        partial_json: args.to_string(),
                    },
                });
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            match usage_from_chunk(json) {
                Some(usage) => {
                    return Some(LlmStreamEvent::MessageStop {
                        stop_reason: Some(reason.to_string()),
                        usage: Some(usage),
                    });
                }
                None => {
                    self.pending_stop = Some(reason.to_string());
                    return None;
                }
            }
        }

        None
    }

    /// Stop event for a stream that ended without a usage chunk.
    fn end_of_stream(&mut self) -> Option<LlmStreamEvent> {
        self.pending_stop
            .take()
            .map(|reason| LlmStreamEvent::MessageStop {
                stop_reason: Some(reason),
                usage: None,
            })
    }
}

fn usage_from_chunk(json: &serde_json::Value) -> Option<Usage> {
    json["usage"].as_object().map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_become_tool_role_messages() {
        let request = LlmRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "call-1".to_string(),
                    content: "sunny".to_string(),
                }]),
            }],
            system: None,
            max_tokens: None,
            temperature: None,
            tools: vec![],
        };
        let messages = OpenAiProvider::encode_messages(&request);
        assert_eq!(messages[0]["role"], "tool");
        assert_eq!(messages[0]["tool_call_id"], "call-1");
    }

    fn fresh_state() -> SseState {
        SseState {
            buffer: Vec::new(),
            started: false,
            tool_index: 0,
            pending_stop: None,
        }
    }

    #[test]
    fn stream_state_emits_start_then_deltas() {
        let mut state = fresh_state();
        let chunk = json!({"id": "chatcmpl-1", "choices": [{"delta": {"content": "Hi"}}]});

        match state.next_event(&chunk) {
            Some(LlmStreamEvent::MessageStart { id, .. }) => {
                assert_eq!(id.as_deref(), Some("chatcmpl-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            state.next_event(&chunk),
            Some(LlmStreamEvent::ContentBlockDelta {
                delta: ContentBlockDelta::Text { .. },
                ..
            })
        ));
    }

    #[test]
    fn stop_waits_for_the_trailing_usage_chunk() {
        let mut state = fresh_state();
        state.next_event(&json!({"choices": [{"delta": {"content": "Hi"}}]}));

        let finish = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        assert!(state.next_event(&finish).is_none());

        let usage = json!({
            "choices": [],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        match state.next_event(&usage) {
            Some(LlmStreamEvent::MessageStop { stop_reason, usage }) => {
                assert_eq!(stop_reason.as_deref(), Some("stop"));
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stop_without_usage_chunk_is_released_at_stream_end() {
        let mut state = fresh_state();
        state.next_event(&json!({"choices": [{"delta": {"content": "Hi"}}]}));
        state.next_event(&json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}));

        match state.end_of_stream() {
            Some(LlmStreamEvent::MessageStop { stop_reason, usage }) => {
                assert_eq!(stop_reason.as_deref(), Some("stop"));
                assert!(usage.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(state.end_of_stream().is_none());
    }
}
