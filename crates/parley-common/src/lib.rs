pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{Attachment, ContentPart, MessageRole, TokenUsage};
pub use types::{ConversationId, Identity, MessageId, Visibility, WorkspaceId};
