use thiserror::Error;

/// Secure communications error types
#[derive(Error, Debug)]
pub enum CommsError {
    /// Malformed inbound/outbound tag
    #[error("Tag error: {0}")]
    TagError(String),

    /// Configuration error (missing secret, bad option)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Unparsable or missing key material
    #[error("Key error: {0}")]
    KeyError(String),

    /// Dial or broken-channel failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// SSH handshake or authentication failure
    #[error("Handshake error: {0}")]
    HandshakeError(String),

    /// Phase mismatch, rejected upgrade, unknown request or channel
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// KBS answered with a non-200 status
    #[error("KBS error: {status} - {message}")]
    KbsError { status: u16, message: String },

    /// JWT signing or host-key authorization failure
    #[error("Authorization error: {0}")]
    AuthorizationError(String),

    /// Kubernetes secret store failure
    #[error("Secret store error: {0}")]
    SecretStoreError(String),

    /// Network namespace could not be opened or entered
    #[error("Namespace error: {namespace} - {message}")]
    NamespaceError { namespace: String, message: String },

    /// HTTP client/server failure
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Operation cancelled through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for CommsError {
    fn from(err: serde_json::Error) -> Self {
        CommsError::SerializationError(err.to_string())
    }
}

impl From<russh_keys::Error> for CommsError {
    fn from(err: russh_keys::Error) -> Self {
        CommsError::KeyError(err.to_string())
    }
}

impl CommsError {
    /// Whether a retry loop should try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommsError::TransportError(_)
                | CommsError::HandshakeError(_)
                | CommsError::TimeoutError(_)
                | CommsError::IoError(_)
        )
    }
}

/// Result type alias for secure communications operations
pub type Result<T> = std::result::Result<T, CommsError>;
