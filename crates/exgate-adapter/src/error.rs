/*
[INPUT]:  Error sources (dial, transport, frame decoding, API payloads, registry)
[OUTPUT]: Structured error type with stable numeric codes
[POS]:    Error handling layer - unified error type for entire crate
[UPDATE]: When adding new error sources or changing error codes
*/

use thiserror::Error;

/// Main error type for the exgate stream core
#[derive(Error, Debug)]
pub enum ExgateError {
    /// Dial or handshake failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Handshake did not finish in time
    #[error("Connect timeout after {duration}s")]
    Timeout { duration: u64 },

    /// Transport failed while reading
    #[error("WebSocket read failed: {0}")]
    ReadFail(String),

    /// Transport failed while writing or closing
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Frame is neither a JSON object nor a JSON array
    #[error("Invalid ws message: {0}")]
    InvalidMessage(String),

    /// Frame looked like JSON but failed to decode
    #[error("Unmarshal failed: {0}")]
    Unmarshal(String),

    /// Outbound payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server answered with an error or non-200 status payload
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Required parameter missing
    #[error("Parameter required: {0}")]
    ParamRequired(String),

    /// Client write loop has exited
    #[error("Client closed: {url}")]
    Closed { url: String },

    /// Output channel was registered with another element type
    #[error("Channel {key} holds a different element type")]
    ChanTypeMismatch { key: String },

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExgateError {
    /// Numeric error code, stable across releases
    pub fn code(&self) -> i32 {
        match self {
            ExgateError::Connect(_) => -2,
            ExgateError::Timeout { .. } => -3,
            ExgateError::ReadFail(_) => -4,
            ExgateError::WebSocket(_) => -5,
            ExgateError::InvalidMessage(_) => -6,
            ExgateError::Unmarshal(_) => -7,
            ExgateError::Serialization(_) => -8,
            ExgateError::Api { code, .. } => *code,
            ExgateError::ParamRequired(_) => -9,
            ExgateError::Closed { .. } => -10,
            ExgateError::ChanTypeMismatch { .. } => -11,
            ExgateError::UrlParse(_) => -12,
            ExgateError::Config(_) => -13,
        }
    }

    /// Check if the error terminates a connection (or prevents one)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ExgateError::Connect(_)
                | ExgateError::Timeout { .. }
                | ExgateError::ReadFail(_)
                | ExgateError::Closed { .. }
        )
    }

    /// Create an API error from code and message
    pub fn api_error(code: i32, message: impl Into<String>) -> Self {
        ExgateError::Api {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for exgate operations
pub type Result<T> = std::result::Result<T, ExgateError>;
