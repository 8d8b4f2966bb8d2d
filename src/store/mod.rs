//! Store adapter contract.
//!
//! A channel needs four things from the storage engine behind it:
//! - create-if-absent of a bounded (capped) collection
//! - acknowledged inserts with store-assigned, strictly increasing ids
//! - "latest record" lookup in reverse insertion order
//! - a tailing cursor that blocks for new records instead of ending
//!
//! Two engines ship with the crate: [`MemoryStore`] for in-process use and
//! tests, and [`FileStore`] which persists each collection to an append-only
//! record log.

mod bounded;
mod file;
mod memory;

pub use bounded::{BoundedCollection, BoundedCursor};
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::CollectionOptions;
use crate::error::Result;
use crate::types::{Record, RecordId, RecordInput};
use std::sync::Arc;
use std::time::Duration;

/// Predicate a tailing cursor polls to learn its reader has stopped.
pub type HaltSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Options for opening a tailing cursor.
#[derive(Clone)]
pub struct TailOptions {
    /// How long a read waits for new data before re-checking.
    pub retry_interval: Duration,

    /// When this reports true the cursor ends at its next wake-up.
    pub halt: Option<HaltSignal>,
}

impl TailOptions {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            halt: None,
        }
    }

    pub fn with_halt(mut self, halt: HaltSignal) -> Self {
        self.halt = Some(halt);
        self
    }

    pub(crate) fn halted(&self) -> bool {
        self.halt.as_ref().is_some_and(|h| h())
    }
}

impl std::fmt::Debug for TailOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailOptions")
            .field("retry_interval", &self.retry_interval)
            .field("halt", &self.halt.is_some())
            .finish()
    }
}

/// A storage engine able to provision bounded collections.
pub trait StoreAdapter: Send + Sync {
    /// Create the collection if absent and return a handle to it.
    ///
    /// Engines may report `MqError::CollectionAlreadyExists` when a
    /// concurrent creator wins; callers retry.
    fn create_bounded_collection(
        &self,
        name: &str,
        options: &CollectionOptions,
    ) -> Result<Arc<dyn Collection>>;
}

/// Handle to one bounded collection.
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Append a record. `durable` asks the engine to persist before returning.
    fn insert(&self, input: RecordInput, durable: bool) -> Result<Record>;

    /// Most recently inserted record, or the record with exactly `at` if given.
    fn find_latest(&self, at: Option<RecordId>) -> Result<Option<Record>>;

    /// Open a blocking cursor over records with id greater than `after`.
    fn tail(&self, after: RecordId, options: TailOptions) -> Result<Box<dyn TailCursor>>;

    /// Number of records currently retained.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blocking read side of a tailing cursor.
pub trait TailCursor: Send {
    /// Block until the next record arrives.
    ///
    /// `Ok(None)` means the cursor ended: the collection was dropped, the
    /// halt signal fired, or the engine lost it.
    fn next(&mut self) -> Result<Option<Record>>;
}
