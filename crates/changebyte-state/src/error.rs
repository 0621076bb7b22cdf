//! State backend error types.

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that raised it.
    #[error("sqlite error in {context}: {source}")]
    SqliteContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// A sequence does not fit the signed 64-bit column that stores it.
    #[error("sequence {0} is out of range")]
    SequenceOutOfRange(u64),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn backend(source: rusqlite::Error) -> Self {
        Self::Sqlite(source)
    }

    pub(crate) fn backend_context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::SqliteContext { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::backend_context("commit_apply: begin tx", inner);
        let msg = err.to_string();
        assert!(msg.contains("sqlite"), "got: {msg}");
        assert!(msg.contains("commit_apply"), "got: {msg}");
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "state backend lock poisoned");
    }

    #[test]
    fn sequence_out_of_range_displays_value() {
        let err = StateError::SequenceOutOfRange(u64::MAX);
        assert!(err.to_string().contains(&u64::MAX.to_string()));
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }
}
