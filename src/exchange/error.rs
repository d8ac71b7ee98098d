//! Error types for the inter-agent exchange layer.

/// Result type alias
pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Payload could not be deserialized
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame exceeds the configured size limit
    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// No route to the named agent
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Outgoing queue for the agent is full
    #[error("Outgoing queue full for agent {0}")]
    Backpressure(String),

    /// A broadcast reached no peer
    #[error("No peer accepted the message")]
    NotDelivered,

    /// The peer side of a channel is gone
    #[error("Channel disconnected")]
    Disconnected,
}
