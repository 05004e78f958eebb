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

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: ANTHROPIC_API_URL.to_string(),
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

    fn encode_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                let content = match &msg.content {
                    MessageContent::Text(text) => json!(text),
                    MessageContent::Blocks(blocks) => {
                        json!(blocks.iter().map(encode_block).collect::<Vec<_>>())
                    }
                };
                json!({
                    "role": match msg.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": content,
                })
            })
            .collect()
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::encode_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "stream": stream,
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
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
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    }))
                    .collect::<Vec<_>>()
            );
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("network error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!(
                "Anthropic API error ({status}): {error_text}"
            )));
        }
        Ok(response)
    }
}

fn encode_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Thinking { thinking } => {
            json!({"type": "thinking", "thinking": thinking})
        }
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => {
            json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content})
        }
    }
}

fn decode_block(block: &serde_json::Value) -> Result<ContentBlock> {
    match block["type"].as_str().unwrap_or_default() {
        "text" => Ok(ContentBlock::Text {
            text: block["text"].as_str().unwrap_or_default().to_string(),
        }),
        "thinking" => Ok(ContentBlock::Thinking {
            thinking: block["thinking"].as_str().unwrap_or_default().to_string(),
        }),
        "tool_use" => Ok(ContentBlock::ToolUse {
            id: block["id"].as_str().unwrap_or_default().to_string(),
            name: block["name"].as_str().unwrap_or_default().to_string(),
            input: block["input"].clone(),
        }),
        other => Err(Error::Agent(format!("unknown content block type: {other}"))),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.request_body(request, false);
        let response = self.post(&body).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("invalid Anthropic response: {e}")))?;

        let content = raw["content"]
            .as_array()
            .ok_or_else(|| Error::Agent("missing content in response".to_string()))?
            .iter()
            .map(decode_block)
            .collect::<Result<Vec<_>>>()?;

        Ok(LlmResponse {
            content,
            model: raw["model"].as_str().unwrap_or_default().to_string(),
            usage: parse_usage(&raw["usage"]),
            stop_reason: raw["stop_reason"].as_str().map(|s| s.to_string()),
        })
    }

    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let body = self.request_body(request, true);
        let response = self.post(&body).await?;

        let bytes = response.bytes_stream().boxed();
        let buffer = Vec::new();

        let events = stream::try_unfold(
            (bytes, buffer),
            |(mut bytes, mut buffer): (BoxStream<'static, reqwest::Result<Bytes>>, Vec<u8>)| async move {
                loop {
                    if let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=i).collect();
                        let line = String::from_utf8_lossy(&line_bytes).trim().to_string();

                        if let Some(data) = line.strip_prefix("data: ") {
                            if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
                                if let Some(event) = parse_stream_event(&json) {
                                    return Ok(Some((event, (bytes, buffer))));
                                }
                            }
                        }
                        // non-data SSE lines (event:, comments) are skipped
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => return Err(Error::Agent(format!("network error: {e}"))),
                        None => return Ok(None),
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    async fn health_check(&self) -> Result<bool> {
        let body = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}]
        });

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn parse_usage(value: &serde_json::Value) -> Option<Usage> {
    value.as_object().map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    })
}

fn parse_stream_event(json: &serde_json::Value) -> Option<LlmStreamEvent> {
    match json["type"].as_str().unwrap_or_default() {
        "message_start" => Some(LlmStreamEvent::MessageStart {
            id: json["message"]["id"].as_str().map(|s| s.to_string()),
            usage: parse_usage(&json["message"]["usage"]),
        }),
        "content_block_start" => {
            let index = json["index"].as_u64().unwrap_or(0) as u32;
            let block = decode_block(&json["content_block"]).ok()?;
            Some(LlmStreamEvent::ContentBlockStart {
                index,
                content_block: block,
            })
        }
        "content_block_delta" => {
            let index = json["index"].as_u64().unwrap_or(0) as u32;
            let delta = &json["delta"];
            let delta = match delta["type"].as_str().unwrap_or_default() {
                "text_delta" => ContentBlockDelta::Text {
                    text: delta["text"].as_str().unwrap_or_default().to_string(),
                },
                "thinking_delta" => ContentBlockDelta::Thinking {
                    thinking: delta["thinking"].as_str().unwrap_or_default().to_string(),
                },
                "input_json_delta" => ContentBlockDelta::InputJson {
                    partial_json: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                },
                _ => return None,
            };
            Some(LlmStreamEvent::ContentBlockDelta { index, delta })
        }
        "content_block_stop" => Some(LlmStreamEvent::ContentBlockStop {
            index: json["index"].as_u64().unwrap_or(0) as u32,
        }),
        "message_delta" => Some(LlmStreamEvent::MessageStop {
            stop_reason: json["delta"]["stop_reason"].as_str().map(|s| s.to_string()),
            usage: json["usage"]["output_tokens"].as_u64().map(|t| Usage {
                input_tokens: 0,
                output_tokens: t as u32,
            }),
        }),
        "ping" => Some(LlmStreamEvent::Ping),
        _ => None,
    }
}
