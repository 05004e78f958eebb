pub mod events;
pub mod pipeline;
pub mod providers;
pub mod resolver;
pub mod store;
pub mod tools;
pub mod toolset;

#[cfg(feature = "mcp")]
pub mod mcp;

pub use events::{ChatEvent, EventSink};
pub use pipeline::{ChatPipeline, ChatRequest, IncomingMessage, PreparedTurn, TurnOutcome};
pub use providers::{AnthropicProvider, LlmProvider, OpenAiProvider};
pub use resolver::{AGENT_PREFIX, ResolvedModel, resolve_model};
pub use store::ConversationStore;
pub use tools::{Tool, ToolContext, ToolOutput};
pub use toolset::{NAMESPACE_SEPARATOR, ToolEntry, ToolRegistry, ToolSource};
