//! Durable relay state for the changebyte engine.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation for the dedup index, applied-sequence tracking, the apply
//! journal, the correlation store, the dead-letter channel, and run history.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use backend::StateBackend;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;

/// Common imports for state backend consumers.
pub mod prelude {
    pub use crate::backend::StateBackend;
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateBackend;
    pub use changebyte_types::envelope::{DeadLetterRecord, Timestamp};
    pub use changebyte_types::record::{ApplyResult, CorrelationRecord, DedupKey, SkipReason};
    pub use changebyte_types::state::{
        PendingApply, PipelineId, RunStats, RunStatus, StoredDeadLetter,
    };
}
