//! Bundled connectors and the source-side contract.
//!
//! | `use`    | role                    | type                              |
//! |----------|-------------------------|-----------------------------------|
//! | `jsonl`  | source + writeback      | [`jsonl::JsonlSource`], [`jsonl::JsonlWriteback`] |
//! | `memory` | source, writeback, dest | [`memory`]                        |
//! | `sqlite` | destination             | [`sqlite::SqliteDestination`]     |

pub mod jsonl;
pub mod memory;
pub mod sqlite;

/// Pull-based CDC stream. Calls may block.
pub trait ChangeSource: Send {
    /// Next raw event, or `None` once the stream is drained.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream cannot be read; the run fails.
    fn poll(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}
