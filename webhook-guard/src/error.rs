use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    /// A live record already exists for this event id.
    #[error("event already processed: {0}")]
    DuplicateEvent(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("event store unavailable: {0}")]
    Storage(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GuardError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent(_))
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
