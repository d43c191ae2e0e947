use serde_json::Value;
use thiserror::Error;

/// Result type for Bravia Quad operations
pub type Result<T> = std::result::Result<T, BraviaError>;

/// Errors that can occur when talking to a Bravia Quad
#[derive(Error, Debug)]
pub enum BraviaError {
    /// The TCP session could not be established (refused, timed out, DNS failure)
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A request was attempted while the session is not connected
    #[error("Not connected")]
    NotConnected,

    /// No result arrived for a request before its deadline
    #[error("Request for {feature} timed out")]
    Timeout {
        /// Feature the request was issued for
        feature: String,
    },

    /// The session dropped while the request was outstanding
    #[error("Connection lost")]
    ConnectionLost,

    /// An inbound line could not be interpreted as a result or notification
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Subwoofer detection is already running and the policy rejects overlap
    #[error("Subwoofer detection already in progress")]
    DetectionBusy,

    /// Subwoofer detection could not complete
    #[error("Subwoofer detection failed: {0}")]
    DetectionFailed(String),

    /// A typed setter was given a value outside the feature's domain
    #[error("{feature} value {value} outside {min}..={max}")]
    OutOfRange {
        feature: String,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A typed setter was given a value the feature does not accept
    #[error("{feature} cannot be set to {value}")]
    InvalidValue { feature: String, value: Value },

    /// The device answered a set with something other than an ACK
    #[error("{feature} set rejected: {reply}")]
    Rejected { feature: String, reply: Value },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
