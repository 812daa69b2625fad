//! Services consumed by the coordinator: page context packing and the
//! durable conversation record.

pub mod conversation_store;
pub mod page_context;

pub use conversation_store::{
    list_archived, search, ConversationMessage, ConversationRecord, ConversationStore,
    InMemoryConversationStore, JsonDirConversationStore, SearchHit,
};
pub use page_context::{chunk_context, DEFAULT_CONTEXT_BUDGET};
