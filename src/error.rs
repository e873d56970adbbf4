//! Error types for the banter pipeline.

/// Top-level error type for the chat bot.
#[derive(Debug, thiserror::Error)]
pub enum BanterError {
    /// Configuration load or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Language-model call error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Embedding engine error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Memory storage error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Discord transport error (REST or gateway).
    #[error("discord error: {0}")]
    Discord(String),

    /// Background task queue error.
    #[error("background error: {0}")]
    Background(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::memory::MemoryError> for BanterError {
    fn from(e: crate::memory::MemoryError) -> Self {
        Self::Memory(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BanterError>;
