use std::sync::Arc;

use futures::StreamExt;
use parley_common::{Attachment, ContentPart, Error, Identity, MessageRole, Result, TokenUsage};
use parley_db::{Conversation, NewConversation, NewMessage, UsageKey};
use tracing::{error, info, instrument, warn};

use crate::events::{ChatEvent, EventSink};
use crate::providers::{
    ChatMessage, ChatRole, ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest,
    LlmStreamEvent, MessageContent, extract_text,
};
use crate::resolver::{ResolvedModel, resolve_model};
use crate::store::ConversationStore;
use crate::tools::{ToolContext, ToolOutput};
use crate::toolset::{ToolEntry, ToolRegistry};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const TITLE_MAX_CHARS: usize = 80;

const TITLE_PROMPT: &str = "Summarize the user's message as a short conversation title. At most \
     six words, no quotes, no trailing punctuation.";

/// One incoming chat turn, already validated by the HTTP layer.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub messages: Vec<IncomingMessage>,
    pub selected_model: String,
    pub supports_tools: bool,
    pub selected_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Option<String>,
    pub role: MessageRole,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// What a finished (or aborted) turn produced.
#[derive(Debug)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub assistant_message_id: Option<String>,
    pub cancelled: bool,
    pub usage: TokenUsage,
}

pub struct ChatPipeline {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    core_tools: Vec<String>,
    max_tool_steps: u32,
    default_temperature: f64,
    default_context_window: u32,
}

impl ChatPipeline {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        core_tools: Vec<String>,
        max_tool_steps: u32,
        default_temperature: f64,
        default_context_window: u32,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            core_tools,
            max_tool_steps,
            default_temperature,
            default_context_window,
        }
    }

    /// Run everything that must succeed before the response stream opens:
    /// model resolution, conversation resolution and ownership, tool set
    /// construction, and persisting the user message. Errors here map to
    /// HTTP statuses; once this returns Ok the turn can only be streamed.
    #[instrument(skip(self, request, identity), fields(conversation_id = %request.conversation_id, model = %request.selected_model))]
    pub async fn prepare(&self, request: ChatRequest, identity: &Identity) -> Result<PreparedTurn> {
        let user_message = request
            .messages
            .last()
            .filter(|m| m.role == MessageRole::User && !m.text.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidRequest("last message must be a non-empty user message".to_string())
            })?
            .clone();

        let resolved = resolve_model(
            self.store.as_ref(),
            &request.selected_model,
            self.default_temperature,
            self.default_context_window,
        )
        .await?;

        let (conversation, needs_title) = self
            .resolve_conversation(&request, identity, &resolved, &user_message.text)
            .await?;

        let tools = self.registry.active_toolset(
            request.supports_tools,
            &self.core_tools,
            &request.selected_tools,
        );

        let mut history = Vec::new();
        for stored in self.store.load_messages(&conversation.id).await? {
            replay_message(&mut history, &stored.role, &stored.parts);
        }

        // The user message is durable before any generation traffic.
        self.store
            .append_message(&NewMessage {
                id: user_message
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                conversation_id: conversation.id.clone(),
                role: MessageRole::User,
                parts: vec![ContentPart::text(&user_message.text)],
                attachments: user_message.attachments.clone(),
                model: None,
                response_id: None,
            })
            .await?;

        history.push(ChatMessage::user_text(&user_message.text));

        Ok(PreparedTurn {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            conversation,
            resolved,
            tools,
            history,
            user_text: user_message.text,
            identity: identity.clone(),
            needs_title,
            max_tool_steps: self.max_tool_steps,
        })
    }

    async fn resolve_conversation(
        &self,
        request: &ChatRequest,
        identity: &Identity,
        resolved: &ResolvedModel,
        user_text: &str,
    ) -> Result<(Conversation, bool)> {
        if let Some(existing) = self.store.get_conversation(&request.conversation_id).await? {
            if existing.owner_id != identity.user_id {
                return Err(Error::Auth(
                    "conversation belongs to another user".to_string(),
                ));
            }
            return Ok((existing, false));
        }

        let conversation = self
            .store
            .create_conversation(&NewConversation {
                id: request.conversation_id.clone(),
                owner_id: identity.user_id.clone(),
                workspace_id: identity.workspace_id.as_str().to_string(),
                title: fallback_title(user_text),
                model: request.selected_model.clone(),
                system_prompt: resolved.system_prompt.clone(),
                temperature: resolved.temperature,
                context_window: resolved.context_window,
                agent_id: resolved.agent_id.clone(),
            })
            .await?;
        info!("created conversation {}", conversation.id);
        Ok((conversation, true))
    }
}

/// A turn past the point of no return: every pre-stream check has passed and
/// the user message is persisted. `stream` cannot fail outward; provider
/// errors become error events on the sink.
pub struct PreparedTurn {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    conversation: Conversation,
    resolved: ResolvedModel,
    tools: Vec<ToolEntry>,
    history: Vec<ChatMessage>,
    user_text: String,
    identity: Identity,
    needs_title: bool,
    max_tool_steps: u32,
}

impl std::fmt::Debug for PreparedTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTurn")
            .field("conversation", &self.conversation)
            .field("resolved", &self.resolved)
            .field("history", &self.history)
            .field("user_text", &self.user_text)
            .field("identity", &self.identity)
            .field("needs_title", &self.needs_title)
            .field("max_tool_steps", &self.max_tool_steps)
            .finish_non_exhaustive()
    }
}

impl PreparedTurn {
    pub fn conversation_id(&self) -> &str {
        &self.conversation.id
    }

    #[instrument(skip(self, sink), fields(conversation_id = %self.conversation.id, model = %self.resolved.model))]
    pub async fn stream(mut self, mut sink: EventSink) -> TurnOutcome {
        if self.needs_title {
            self.update_title().await;
        }

        let tool_defs: Vec<_> = self.tools.iter().map(|e| e.definition()).collect();
        let mut parts: Vec<ContentPart> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut response_id: Option<String> = None;

        // One extra pass over the budget for the terminal text-only response.
        for step in 0..=self.max_tool_steps {
            let request = LlmRequest {
                model: self.resolved.model.clone(),
                messages: self.history.clone(),
                system: Some(self.resolved.system_prompt.clone()),
                max_tokens: Some(DEFAULT_MAX_TOKENS),
                temperature: Some(self.resolved.temperature),
                tools: tool_defs.clone(),
            };

            let mut events = match self.provider.stream(&request).await {
                Ok(events) => events,
                Err(e) => {
                    error!("provider stream failed: {e}");
                    sink.send(ChatEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                    return self.finalize(sink, parts, usage, response_id).await;
                }
            };

            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool_calls: Vec<(String, String, String)> = Vec::new();
            let mut current_tool: Option<(String, String, String)> = None;
            let mut failed = false;

            while let Some(event) = events.next().await {
                if sink.is_closed() {
                    // Dropping the provider stream aborts the request.
                    return self.cancelled(usage);
                }
                match event {
                    Ok(LlmStreamEvent::MessageStart { id, usage: u }) => {
                        // The terminal response wins; earlier ids belong to
                        // tool-call rounds.
                        if id.is_some() {
                            response_id = id;
                        }
                        if let Some(u) = u {
                            usage.add(TokenUsage {
                                input_tokens: u.input_tokens,
                                output_tokens: u.output_tokens,
                            });
                        }
                    }
                    Ok(LlmStreamEvent::ContentBlockStart { content_block, .. }) => {
                        match content_block {
                            ContentBlock::ToolUse { id, name, .. } => {
                                current_tool = Some((id, name, String::new()));
                            }
                            ContentBlock::Text { text: t } if !t.is_empty() => {
                                sink.text_delta(&t).await;
                                text.push_str(&t);
                            }
                            ContentBlock::Thinking { thinking: t } if !t.is_empty() => {
                                sink.reasoning_delta(&t).await;
                                thinking.push_str(&t);
                            }
                            _ => {}
                        }
                    }
                    Ok(LlmStreamEvent::ContentBlockDelta { delta, .. }) => match delta {
                        ContentBlockDelta::Text { text: t } => {
                            sink.text_delta(&t).await;
                            text.push_str(&t);
                        }
                        ContentBlockDelta::Thinking { thinking: t } => {
                            sink.reasoning_delta(&t).await;
                            thinking.push_str(&t);
                        }
                        ContentBlockDelta::InputJson { partial_json } => {
                            if let Some((_, _, input)) = current_tool.as_mut() {
                                input.push_str(&partial_json);
                            }
                        }
                    },
                    Ok(LlmStreamEvent::ContentBlockStop { .. }) => {
                        if let Some(call) = current_tool.take() {
                            tool_calls.push(call);
                        }
                    }
                    Ok(LlmStreamEvent::MessageStop { usage: u, .. }) => {
                        if let Some(u) = u {
                            usage.add(TokenUsage {
                                input_tokens: u.input_tokens,
                                output_tokens: u.output_tokens,
                            });
                        }
                        break;
                    }
                    Ok(LlmStreamEvent::Ping) => {}
                    Err(e) => {
                        warn!("stream interrupted: {e}");
                        sink.send(ChatEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                        failed = true;
                        break;
                    }
                }
            }

            if sink.is_closed() {
                return self.cancelled(usage);
            }

            if !thinking.is_empty() {
                parts.push(ContentPart::Reasoning { text: thinking });
            }
            if !text.is_empty() {
                parts.push(ContentPart::text(&text));
            }

            if failed || tool_calls.is_empty() {
                return self.finalize(sink, parts, usage, response_id).await;
            }

            if step == self.max_tool_steps {
                warn!(
                    "tool step budget of {} exhausted for conversation {}",
                    self.max_tool_steps, self.conversation.id
                );
                sink.send(ChatEvent::Error {
                    message: format!("tool step budget of {} exceeded", self.max_tool_steps),
                })
                .await;
                return self.finalize(sink, parts, usage, response_id).await;
            }

            // Run the requested tools and feed results back for the next step.
            let mut assistant_blocks = Vec::new();
            if !text.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: text.clone() });
            }
            let mut result_blocks = Vec::new();

            for (id, name, input_json) in tool_calls {
                let input: serde_json::Value =
                    serde_json::from_str(&input_json).unwrap_or_default();
                sink.send(ChatEvent::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                })
                .await;

                let output = self.run_tool(&name, &input).await;
                sink.send(ChatEvent::ToolResult {
                    id: id.clone(),
                    output: output.content.clone(),
                })
                .await;

                parts.push(ContentPart::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                parts.push(ContentPart::ToolResult {
                    id: id.clone(),
                    output: output.content.clone(),
                });

                assistant_blocks.push(ContentBlock::ToolUse { id: id.clone(), name, input });
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: output.content,
                });
            }

            self.history.push(ChatMessage::assistant_blocks(assistant_blocks));
            self.history.push(ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Blocks(result_blocks),
            });
        }

        // Unreachable: the loop always returns through finalize or cancelled.
        self.cancelled(usage)
    }

    async fn run_tool(&self, name: &str, input: &serde_json::Value) -> ToolOutput {
        let context = ToolContext {
            conversation_id: self.conversation.id.clone(),
            user_id: self.identity.user_id.clone(),
            workspace_id: self.identity.workspace_id.as_str().to_string(),
        };
        match self.tools.iter().find(|e| e.name == name) {
            Some(entry) => entry
                .tool
                .execute(&context, input.clone())
                .await
                .unwrap_or_else(|e| ToolOutput::error(e.to_string())),
            None => ToolOutput::error(format!("unknown tool: {name}")),
        }
    }

    /// Post-stream writes. All best-effort: the response already reached the
    /// client, so failures here are logged and never surfaced.
    async fn finalize(
        self,
        mut sink: EventSink,
        parts: Vec<ContentPart>,
        usage: TokenUsage,
        response_id: Option<String>,
    ) -> TurnOutcome {
        sink.flush_text().await;

        if parts.is_empty() {
            warn!(
                "turn in conversation {} produced no assistant output",
                self.conversation.id
            );
            sink.send(ChatEvent::Finish {
                conversation_id: self.conversation.id.clone(),
                message_id: None,
            })
            .await;
            return TurnOutcome {
                conversation_id: self.conversation.id,
                assistant_message_id: None,
                cancelled: false,
                usage,
            };
        }

        let message_id = match self
            .store
            .append_message(&NewMessage {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: self.conversation.id.clone(),
                role: MessageRole::Assistant,
                parts,
                attachments: vec![],
                model: Some(self.resolved.model.clone()),
                response_id,
            })
            .await
        {
            Ok(message) => Some(message.id),
            Err(e) => {
                warn!("failed to persist assistant message: {e}");
                None
            }
        };

        let key = UsageKey::today(
            &self.identity.user_id,
            &self.resolved.model,
            self.identity.workspace_id.as_str(),
        );
        if let Err(e) = self
            .store
            .record_usage(&key, 1, usage.input_tokens, usage.output_tokens)
            .await
        {
            warn!("failed to record usage: {e}");
        }

        sink.send(ChatEvent::Finish {
            conversation_id: self.conversation.id.clone(),
            message_id: message_id.clone(),
        })
        .await;

        TurnOutcome {
            conversation_id: self.conversation.id,
            assistant_message_id: message_id,
            cancelled: false,
            usage,
        }
    }

    fn cancelled(self, usage: TokenUsage) -> TurnOutcome {
        info!(
            "client disconnected, aborting turn in conversation {}",
            self.conversation.id
        );
        TurnOutcome {
            conversation_id: self.conversation.id,
            assistant_message_id: None,
            cancelled: true,
            usage,
        }
    }

    async fn update_title(&self) {
        let request = LlmRequest {
            model: self.resolved.model.clone(),
            messages: vec![ChatMessage::user_text(&self.user_text)],
            system: Some(TITLE_PROMPT.to_string()),
            max_tokens: Some(64),
            temperature: Some(0.3),
            tools: vec![],
        };

        let title = match self.provider.complete(&request).await {
            Ok(response) => {
                let title = extract_text(&response.content)
                    .trim()
                    .trim_matches('"')
                    .to_string();
                if title.is_empty() { None } else { Some(title) }
            }
            Err(e) => {
                warn!("title summarization failed, keeping fallback title: {e}");
                None
            }
        };

        if let Some(title) = title {
            if let Err(e) = self.store.set_title(&self.conversation.id, &title).await {
                warn!("failed to store conversation title: {e}");
            }
        }
    }
}

/// Truncated first line of the user text, used until summarization lands.
fn fallback_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= TITLE_MAX_CHARS {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{truncated}…")
    }
}

/// Re-encode a stored message for the provider. Assistant tool results are
/// split into the follow-up user message the wire format expects.
fn replay_message(history: &mut Vec<ChatMessage>, role: &MessageRole, parts: &[ContentPart]) {
    match role {
        MessageRole::User => {
            let text = ContentPart::joined_text(parts);
            if !text.is_empty() {
                history.push(ChatMessage::user_text(text));
            }
        }
        MessageRole::Assistant => {
            let mut blocks = Vec::new();
            let mut results = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => blocks.push(ContentBlock::Text {
                        text: text.clone(),
                    }),
                    ContentPart::Reasoning { text } => blocks.push(ContentBlock::Thinking {
                        thinking: text.clone(),
                    }),
                    ContentPart::ToolCall { id, name, input } => {
                        blocks.push(ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    ContentPart::ToolResult { id, output } => {
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id.clone(),
                            content: output.clone(),
                        });
                    }
                }
            }
            if !blocks.is_empty() {
                history.push(ChatMessage::assistant_blocks(blocks));
            }
            if !results.is_empty() {
                history.push(ChatMessage {
                    role: ChatRole::User,
                    content: MessageContent::Blocks(results),
                });
            }
        }
    }
}
