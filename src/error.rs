//! Error types for fog-broker

use thiserror::Error;

/// Errors that can occur in the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Unknown client reference on an insert
    #[error("Invalid client: {0}")]
    InvalidClient(String),

    /// Client lookup miss
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Datatype lookup miss
    #[error("Unknown datatype: {0}")]
    UnknownDatatype(String),

    /// Malformed payload, type mismatch, out-of-bounds value, bad or missing timestamp
    #[error("{0}")]
    InvalidData(String),

    /// Integer epoch timestamp outside the representable range
    #[error("Timestamp {0} is out of range")]
    TimestampOutOfRange(i128),

    /// Registration conflict on a unique name
    #[error("Name '{0}' is already registered")]
    DuplicateName(String),

    /// Rejected datatype or alert specification
    #[error("Invalid schema for '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },

    /// Signature did not verify against the client's registered key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signed envelope shorter than its declared signature length
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Body was not valid gzip
    #[error("Bad GZIP compression")]
    BadCompression,

    /// Body was not JSON or had the wrong top-level shape
    #[error("{0}")]
    BadPayloadFormat(String),

    /// Unique index violation reported by a document store
    #[error("Duplicate value '{value}' for unique field '{field}' in '{collection}'")]
    DuplicateKey {
        collection: String,
        field: String,
        value: String,
    },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O failure outside the store (e.g. gzip encoding)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether the error was caused by the request rather than the broker.
    ///
    /// Client errors are reported verbatim; everything else is logged and
    /// surfaced as a generic internal error.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            BrokerError::Storage(_)
                | BrokerError::Config(_)
                | BrokerError::Serialization(_)
                | BrokerError::Io(_)
        )
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(BrokerError::InvalidData("bad".into()).is_client_error());
        assert!(BrokerError::InvalidSignature.is_client_error());
        assert!(BrokerError::BadCompression.is_client_error());
        assert!(!BrokerError::Storage("down".into()).is_client_error());
        assert!(!BrokerError::Config("bad".into()).is_client_error());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            BrokerError::DuplicateName("sensorA".into()).to_string(),
            "Name 'sensorA' is already registered"
        );
        assert_eq!(BrokerError::BadCompression.to_string(), "Bad GZIP compression");
        assert_eq!(
            BrokerError::InvalidData("Missing value".into()).to_string(),
            "Missing value"
        );
    }
}
