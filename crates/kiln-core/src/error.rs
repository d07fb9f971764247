//! Error types and result aliases shared by kiln crates.

/// The result type used by kiln primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while constructing or decoding kiln primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Creates a new serialization error wrapping a `serde_json` failure.
    #[must_use]
    pub fn serialization(message: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn serialization_error_keeps_source() {
        let source = serde_json::from_str::<u32>("not-json").unwrap_err();
        let err = Error::serialization("decode payload", source);

        assert!(err.to_string().contains("decode payload"));
        assert!(err.source().is_some());
    }

    #[test]
    fn invalid_id_renders_message() {
        let err = Error::InvalidId {
            message: "empty".into(),
        };
        assert_eq!(err.to_string(), "invalid identifier: empty");
    }
}
