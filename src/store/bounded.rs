//! Bounded, tailable in-process collection.
//!
//! Records live in a `VecDeque` ordered by id. When the byte or count bound
//! is exceeded the oldest records are evicted. Tailing cursors park on a
//! condvar and are woken by every insert.

use crate::config::CollectionOptions;
use crate::error::{MqError, Result};
use crate::store::{TailCursor, TailOptions};
use crate::types::{Record, RecordId, RecordInput};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of record ids. May be shared by several collections.
pub type IdSource = Arc<AtomicU64>;

struct Window {
    records: VecDeque<Record>,
    bytes: u64,
    /// Bumped to end every open cursor without touching data.
    epoch: u64,
    dropped: bool,
}

impl Window {
    fn first_after(&self, after: RecordId) -> Option<&Record> {
        let idx = self.records.partition_point(|r| r.id <= after);
        self.records.get(idx)
    }
}

/// An append-only collection capped by bytes and record count.
pub struct BoundedCollection {
    name: String,
    options: CollectionOptions,
    ids: IdSource,
    window: Mutex<Window>,
    arrived: Condvar,
}

impl BoundedCollection {
    /// Create an empty collection with its own id sequence.
    pub fn new(name: impl Into<String>, options: CollectionOptions) -> Self {
        Self::with_id_source(name, options, Arc::new(AtomicU64::new(1)))
    }

    /// Create an empty collection drawing ids from `ids`.
    pub fn with_id_source(name: impl Into<String>, options: CollectionOptions, ids: IdSource) -> Self {
        Self {
            name: name.into(),
            options,
            ids,
            window: Mutex::new(Window {
                records: VecDeque::new(),
                bytes: 0,
                epoch: 0,
                dropped: false,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Rebuild a collection from previously stored records (oldest first).
    /// Ids continue after the largest one seen.
    pub fn from_records(
        name: impl Into<String>,
        options: CollectionOptions,
        records: impl IntoIterator<Item = Record>,
    ) -> Self {
        let collection = Self::new(name, options);
        {
            let mut window = collection.window.lock();
            let mut max_id = 0;
            for record in records {
                max_id = max_id.max(record.id.0);
                window.bytes += record.approximate_size() as u64;
                window.records.push_back(record);
                collection.evict(&mut window);
            }
            collection.ids.store(max_id + 1, Ordering::SeqCst);
        }
        collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> CollectionOptions {
        self.options
    }

    /// Insert a record, running `persist` on it before it becomes visible.
    ///
    /// The window lock is held across id assignment, `persist` and the push,
    /// so ids reach readers in the order they were assigned.
    pub fn insert_with<F>(&self, input: RecordInput, persist: F) -> Result<Record>
    where
        F: FnOnce(&Record) -> Result<()>,
    {
        let mut window = self.window.lock();
        if window.dropped {
            return Err(MqError::CollectionDropped(self.name.clone()));
        }

        let id = RecordId(self.ids.fetch_add(1, Ordering::SeqCst));
        let record = input.into_record(id);
        persist(&record)?;

        window.bytes += record.approximate_size() as u64;
        window.records.push_back(record.clone());
        self.evict(&mut window);
        drop(window);

        self.arrived.notify_all();
        Ok(record)
    }

    /// Insert without extra persistence.
    pub fn insert(&self, input: RecordInput) -> Result<Record> {
        self.insert_with(input, |_| Ok(()))
    }

    /// Latest record, or the record with exactly `at`.
    pub fn find_latest(&self, at: Option<RecordId>) -> Result<Option<Record>> {
        let window = self.window.lock();
        if window.dropped {
            return Err(MqError::CollectionDropped(self.name.clone()));
        }
        let found = match at {
            Some(id) => window
                .records
                .binary_search_by_key(&id, |r| r.id)
                .ok()
                .and_then(|idx| window.records.get(idx)),
            None => window.records.back(),
        };
        Ok(found.cloned())
    }

    /// Open a tailing cursor over records with id greater than `after`.
    pub fn cursor(self: &Arc<Self>, after: RecordId, options: TailOptions) -> Result<BoundedCursor> {
        let window = self.window.lock();
        if window.dropped {
            return Err(MqError::CollectionDropped(self.name.clone()));
        }
        Ok(BoundedCursor {
            collection: Arc::clone(self),
            after,
            epoch: window.epoch,
            options,
        })
    }

    /// Snapshot of retained records, oldest first.
    pub fn records(&self) -> Vec<Record> {
        self.window.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.window.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the capacity.
    pub fn size_bytes(&self) -> u64 {
        self.window.lock().bytes
    }

    /// End every open cursor. Data and new cursors are unaffected.
    pub fn break_cursors(&self) {
        self.window.lock().epoch += 1;
        self.arrived.notify_all();
    }

    /// Drop the collection: discard data, end cursors, reject further use.
    pub fn drop_collection(&self) {
        {
            let mut window = self.window.lock();
            window.dropped = true;
            window.records.clear();
            window.bytes = 0;
        }
        self.arrived.notify_all();
    }

    pub fn is_dropped(&self) -> bool {
        self.window.lock().dropped
    }

    /// Evict oldest records until both bounds hold. The newest record is
    /// always kept so a tailing cursor has a position to resume from.
    fn evict(&self, window: &mut Window) {
        loop {
            let over_count = self
                .options
                .max_count
                .is_some_and(|max| window.records.len() as u64 > max);
            let over_bytes = window.bytes > self.options.capacity_bytes;
            if !(over_count || over_bytes) || window.records.len() <= 1 {
                break;
            }
            if let Some(old) = window.records.pop_front() {
                window.bytes = window.bytes.saturating_sub(old.approximate_size() as u64);
            }
        }
    }
}

/// Tailing cursor over a [`BoundedCollection`].
pub struct BoundedCursor {
    collection: Arc<BoundedCollection>,
    after: RecordId,
    epoch: u64,
    options: TailOptions,
}

impl BoundedCursor {
    /// Id of the last record this cursor yielded (or its start position).
    pub fn position(&self) -> RecordId {
        self.after
    }
}

impl TailCursor for BoundedCursor {
    fn next(&mut self) -> Result<Option<Record>> {
        let mut window = self.collection.window.lock();
        loop {
            if window.dropped || window.epoch != self.epoch {
                return Ok(None);
            }
            if let Some(record) = window.first_after(self.after) {
                self.after = record.id;
                return Ok(Some(record.clone()));
            }
            if self.options.halted() {
                return Ok(None);
            }
            self.collection
                .arrived
                .wait_for(&mut window, self.options.retry_interval);
        }
    }
}
