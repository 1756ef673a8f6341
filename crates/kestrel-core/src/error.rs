//! Error types for Kestrel

use thiserror::Error;

/// Result type alias using Kestrel's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Kestrel operations
#[derive(Error, Debug)]
pub enum Error {
    /// A constructor or setter was handed an unusable value
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Check if this error was caused by bad caller input
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_names_the_argument() {
        let err = Error::invalid_argument("queues", "at least one queue is required");
        assert!(err.is_invalid_argument());
        assert_eq!(
            err.to_string(),
            "invalid argument `queues`: at least one queue is required"
        );
    }

    #[test]
    fn test_json_errors_map_to_deserialization() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
