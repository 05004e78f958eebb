use async_trait::async_trait;
use parley_common::Result;
use parley_db::{Agent, ChatStore, Conversation, NewConversation, NewMessage, StoredMessage, UsageKey};

/// The slice of persistence the pipeline depends on. Lets tests substitute
/// an instrumented store without a real database.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn create_conversation(&self, new: &NewConversation) -> Result<Conversation>;

    async fn set_title(&self, id: &str, title: &str) -> Result<()>;

    async fn append_message(&self, new: &NewMessage) -> Result<StoredMessage>;

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;

    async fn record_usage(
        &self,
        key: &UsageKey,
        messages: u32,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<()>;
}

#[async_trait]
impl ConversationStore for ChatStore {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        ChatStore::get_conversation(self, id)
    }

    async fn create_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        ChatStore::create_conversation(self, new)
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<()> {
        ChatStore::set_title(self, id, title)
    }

    async fn append_message(&self, new: &NewMessage) -> Result<StoredMessage> {
        ChatStore::append_message(self, new)
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        ChatStore::load_messages(self, conversation_id)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        ChatStore::get_agent(self, id)
    }

    async fn record_usage(
        &self,
        key: &UsageKey,
        messages: u32,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<()> {
        ChatStore::record_usage(self, key, messages, input_tokens, output_tokens)
    }
}
