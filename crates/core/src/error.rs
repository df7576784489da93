//! Error types for Histree
//!
//! One unified error enum covers every layer. Variants carry a
//! human-readable message; lower-level failures (I/O, serializer) are
//! wrapped into [`Error::Unknown`] with context so callers never lose the
//! reason a mutation failed.

use thiserror::Error;

/// Result type alias for Histree operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the history engine and its file formats
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unknown history root or missing file
    #[error("not found: {0}")]
    NotFound(String),

    /// Empty undo/redo stack, missing value, or missing telemetry field
    #[error("no object found: {0}")]
    NoObjectFound(String),

    /// Path fails canonicalization
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A single path component is malformed
    #[error("invalid path component: {0}")]
    InvalidPathComponent(String),

    /// Nested roots without opt-in, cross-thread transaction, or an
    /// operation attempted while a transaction is active
    #[error("invalid permissions: {0}")]
    InvalidPermissions(String),

    /// Telemetry read with a mismatched expected type
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Binary decode failure (journal, savefile, snapshot, metadata)
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Feature requested but not available for this root configuration
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Filesystem I/O failure, serializer failure, or other lower-level
    /// errors with a human-readable message
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Wrap an I/O error with context.
    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Error::Unknown(format!("{context}: {err}"))
    }

    /// The message carried by this error, as shown in operation telemetry.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Check whether this error means "the thing does not exist".
    ///
    /// Used by persistence restore, where a missing file means a fresh
    /// start rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_wrapping_keeps_context() {
        let err = Error::io(
            "failed to open journal file",
            &io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let msg = err.to_string();
        assert!(msg.contains("failed to open journal file"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::NotFound("journal file".into()).is_not_found());
        assert!(!Error::Unknown("disk on fire".into()).is_not_found());
    }

    #[test]
    fn test_display_carries_kind() {
        let err = Error::MalformedInput("journal entry truncated".into());
        assert!(err.to_string().contains("malformed input"));
        assert!(err.to_string().contains("journal entry truncated"));
    }
}
