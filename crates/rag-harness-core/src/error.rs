//! Typed failures surfaced by the build and query services.
//!
//! Adapters and trait seams work in `anyhow::Result`; anything that crosses
//! into a service call is folded into [`Error`] so callers can tell
//! "shorten your input" apart from "try a different engine or model".

use crate::filter::FilterParseError;

/// Service-level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced engine, document, chunk, or query does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate engine name, unsupported URL scheme, bad build parameter.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The assembled prompt still exceeds the model window after every
    /// mitigation stage.
    #[error("context window exceeded: ~{tokens} tokens against a limit of {limit}")]
    ContextWindowExceeded { tokens: usize, limit: usize },

    /// A build produced zero indexed documents.
    #[error("no documents indexed: {0}")]
    NoDocumentsIndexed(String),

    #[error(transparent)]
    FilterParse(#[from] FilterParseError),

    /// Embedding, LLM, storage, or record-store failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller can fix this by changing their input rather than
    /// retrying or switching engines.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::FilterParse(_)
                | Error::ContextWindowExceeded { .. }
                | Error::NoDocumentsIndexed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        assert!(Error::Validation("dup".into()).is_user_error());
        assert!(Error::ContextWindowExceeded {
            tokens: 10,
            limit: 5
        }
        .is_user_error());
        assert!(!Error::not_found("engine", "x").is_user_error());
        assert!(!Error::Internal(anyhow::anyhow!("boom")).is_user_error());
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("chunk", "42");
        assert_eq!(err.to_string(), "chunk not found: 42");
    }
}
