//! Error types for Phrasecut core operations.
//!
//! Library code returns [`PhrasecutError`]; the CLI wraps it in `anyhow`.
//! The external transcoding boundary (see [`crate::render::Transcoder`])
//! reports `anyhow::Error`, which the renderer folds into
//! [`PhrasecutError::Render`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using PhrasecutError
pub type Result<T> = std::result::Result<T, PhrasecutError>;

/// Core error types for Phrasecut operations.
#[derive(Error, Debug)]
pub enum PhrasecutError {
    // === Request Errors ===
    /// The request was rejected before any session was created
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    // === Transcript Errors ===
    /// No transcript could be located for a source file
    #[error("no transcript found for {path}")]
    TranscriptNotFound { path: PathBuf },

    /// A transcript file exists but could not be parsed
    #[error("failed to parse transcript {path}: {reason}")]
    TranscriptParse { path: PathBuf, reason: String },

    // === Render Errors ===
    /// Both the hardware and the software transcoding paths failed
    #[error("render failed for {source_file} [{start:.3}s..{end:.3}s]: {reason}")]
    Render {
        source_file: PathBuf,
        start: f64,
        end: f64,
        reason: String,
    },

    /// Concatenating rendered clips failed
    #[error("concat failed for {output}: {reason}")]
    Concat { output: PathBuf, reason: String },

    // === Session Errors ===
    /// Internal orchestration fault; aborts the session
    #[error("session {session} failed: {reason}")]
    Session { session: String, reason: String },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // === Internal Errors ===
    /// Internal error that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl PhrasecutError {
    /// Returns true if this error only affects one candidate and the
    /// surrounding session should keep going.
    pub fn is_per_candidate(&self) -> bool {
        matches!(self, PhrasecutError::Render { .. })
    }

    /// Returns true if the affected source file should be skipped rather
    /// than failing a multi-file search.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            PhrasecutError::TranscriptNotFound { .. } | PhrasecutError::TranscriptParse { .. }
        )
    }

    /// Create an invalid input error
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        PhrasecutError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Create a session error
    pub fn session(session: impl Into<String>, reason: impl Into<String>) -> Self {
        PhrasecutError::Session {
            session: session.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for PhrasecutError {
    fn from(err: serde_json::Error) -> Self {
        PhrasecutError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_skippable() {
        let err = PhrasecutError::TranscriptNotFound {
            path: PathBuf::from("/library/a.mp4"),
        };
        assert!(err.is_skippable());
        assert!(!err.is_per_candidate());

        let err = PhrasecutError::TranscriptParse {
            path: PathBuf::from("/library/a.json"),
            reason: "expected list".to_string(),
        };
        assert!(err.is_skippable());

        let err = PhrasecutError::invalid_input("empty query");
        assert!(!err.is_skippable());
    }

    #[test]
    fn test_render_is_per_candidate() {
        let err = PhrasecutError::Render {
            source_file: PathBuf::from("a.mp4"),
            start: 1.0,
            end: 2.5,
            reason: "encoder exited with 187".to_string(),
        };
        assert!(err.is_per_candidate());
        assert_eq!(
            err.to_string(),
            "render failed for a.mp4 [1.000s..2.500s]: encoder exited with 187"
        );

        let err = PhrasecutError::session("s-1", "worker panicked");
        assert!(!err.is_per_candidate());
    }
}
