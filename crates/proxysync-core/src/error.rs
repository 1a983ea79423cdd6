//! Error types for the proxysync system
//!
//! This module defines all error types used throughout the crate.
//!
//! None of these are fatal: the sync hub converts transport and decoding
//! failures into per-source fallback values, the probe manager turns them
//! into terminal probe states, and the event bridge only logs them.

use thiserror::Error;

/// Result type alias for proxysync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the proxysync system
#[derive(Error, Debug)]
pub enum Error {
    /// Backend unreachable or answering with an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A timed request exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The backend answered with an unexpected shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Subscribing to a push channel failed
    #[error("Subscription setup failed ({channel}): {message}")]
    SubscriptionSetup {
        /// Channel name
        channel: String,
        /// Error message
        message: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend does not offer this command
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a malformed response error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Create a subscription setup error
    pub fn subscription(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscriptionSetup {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unsupported-command error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Whether this error means the request ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
