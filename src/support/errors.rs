use thiserror::Error;

use super::envelope::{ErrorPayload, MessageError};

/// Protocol-level error taxonomy shared by both roles.
///
/// Variants map 1:1 to the `error_code` strings carried in CallError frames,
/// so an error can cross the wire and be reconstructed on the other side.
#[derive(Debug, Clone, Error)]
pub enum OcppError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization refused: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("action not supported: {0}")]
    NotSupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    /// An error code we do not recognize, received from a peer.
    #[error("{code}: {description}")]
    Generic { code: String, description: String },
}

impl OcppError {
    /// The wire `error_code` for this error.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Protocol(_) => "ProtocolError",
            Self::Message(_) => "MessageError",
            Self::Authentication(_) => "AuthenticationError",
            Self::Authorization(_) => "AuthorizationError",
            Self::Validation(_) => "ValidationError",
            Self::NotSupported(_) => "NotSupportedError",
            Self::Internal(_) => "InternalError",
            Self::Timeout => "TimeoutError",
            Self::Connection(_) => "ConnectionError",
            Self::Transaction(_) => "TransactionError",
            Self::Generic { code, .. } => code,
        }
    }

    /// Reconstruct an error from a CallError payload received off the wire.
    pub fn from_wire(error: &ErrorPayload) -> Self {
        let description = error.error_description.clone();
        match error.error_code.as_str() {
            "ProtocolError" => Self::Protocol(description),
            "AuthenticationError" => Self::Authentication(description),
            "AuthorizationError" => Self::Authorization(description),
            "ValidationError" => Self::Validation(description),
            "NotSupportedError" => Self::NotSupported(description),
            "InternalError" => Self::Internal(description),
            "TimeoutError" => Self::Timeout,
            "ConnectionError" => Self::Connection(description),
            "TransactionError" => Self::Transaction(description),
            code => Self::Generic {
                code: code.to_string(),
                description,
            },
        }
    }

    /// Convert into a CallError payload for transmission.
    pub fn to_wire(&self) -> ErrorPayload {
        ErrorPayload::new(self.error_code(), self.to_string())
    }
}

/// Result alias for protocol operations.
pub type OcppResult<T> = Result<T, OcppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            OcppError::NotSupported("Frobnicate".into()).error_code(),
            "NotSupportedError"
        );
        assert_eq!(OcppError::Timeout.error_code(), "TimeoutError");
    }

    #[test]
    fn wire_roundtrip() {
        let original = OcppError::Transaction("unknown reference".into());
        let rebuilt = OcppError::from_wire(&original.to_wire());
        assert_eq!(rebuilt.error_code(), "TransactionError");
    }

    #[test]
    fn unknown_code_preserved() {
        let error = OcppError::from_wire(&ErrorPayload::new("VendorSpecific", "oops"));
        assert_eq!(error.error_code(), "VendorSpecific");
    }
}
