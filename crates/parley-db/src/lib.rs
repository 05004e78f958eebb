pub mod chat_store;

pub use chat_store::{
    Agent, ChatStore, Conversation, NewConversation, NewMessage, StoredMessage, UsageKey,
    UsageTotals, Vote, VoteKind,
};
