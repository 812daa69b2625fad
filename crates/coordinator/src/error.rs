use shared::error::DeliveryError;
use shared::ids::ConversationKey;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// A generation for this key is already in flight
    #[error("Conversation {0} is currently streaming")]
    CurrentlyStreaming(ConversationKey),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Worker rejected {action}: {reason}")]
    Rejected { action: &'static str, reason: String },

    #[error("Conversation record {0} not found")]
    RecordNotFound(String),

    #[error("Conversation store error: {0}")]
    Store(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
