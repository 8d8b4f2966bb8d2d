//! Durable store adapter: one record log per collection.

use crate::config::CollectionOptions;
use crate::error::{MqError, Result};
use crate::records::RecordLog;
use crate::store::bounded::BoundedCollection;
use crate::store::{Collection, StoreAdapter, TailCursor, TailOptions};
use crate::types::{Record, RecordId, RecordInput};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"MQS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Logs shorter than this are never compacted.
const MIN_COMPACT_FRAMES: u64 = 64;

/// Store adapter persisting collections under a directory.
///
/// Layout: `MANIFEST`, `LOCK`, and `<collection>.log` per collection. The
/// directory is locked exclusively for the lifetime of the store.
pub struct FileStore {
    path: PathBuf,
    _lock_file: File,
    collections: RwLock<HashMap<String, Arc<FileCollection>>>,
}

impl FileStore {
    /// Open an existing store directory or create a new one.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            fs::create_dir_all(&path)?;
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;
        tracing::debug!(path = %path.display(), "opened file store");

        Ok(Self {
            path,
            _lock_file: lock_file,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force sync every open collection log.
    pub fn sync(&self) -> Result<()> {
        for collection in self.collections.read().values() {
            collection.log.sync()?;
        }
        Ok(())
    }

    fn collection_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(MqError::Provisioning(format!(
                "invalid collection name: {:?}",
                name
            )));
        }
        Ok(self.path.join(format!("{}.log", name)))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(MqError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(MqError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| MqError::Locked)?;
        Ok(lock_file)
    }
}

impl StoreAdapter for FileStore {
    fn create_bounded_collection(
        &self,
        name: &str,
        options: &CollectionOptions,
    ) -> Result<Arc<dyn Collection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn Collection>);
        }

        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn Collection>);
        }

        let log = RecordLog::open(self.collection_path(name)?)?;
        let records = log.read_all()?;
        let replayed = records.len();
        let window = Arc::new(BoundedCollection::from_records(name, *options, records));
        tracing::debug!(
            collection = name,
            replayed,
            retained = window.len(),
            "opened durable collection"
        );

        let collection = Arc::new(FileCollection {
            window,
            log,
            write_lock: Mutex::new(()),
        });
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }
}

/// A bounded window over a record log.
struct FileCollection {
    window: Arc<BoundedCollection>,
    log: RecordLog,
    /// Serializes appends with compaction.
    write_lock: Mutex<()>,
}

impl FileCollection {
    /// Rewrite the log down to the retained window once evicted frames
    /// outnumber retained ones.
    fn maybe_compact(&self) -> Result<()> {
        let frames = self.log.frame_count();
        let retained = self.window.len() as u64;
        if frames < MIN_COMPACT_FRAMES || frames <= retained.saturating_mul(2) {
            return Ok(());
        }

        let records = self.window.records();
        self.log.rewrite(&records)?;
        tracing::debug!(
            collection = self.window.name(),
            before = frames,
            after = records.len(),
            "compacted record log"
        );
        Ok(())
    }
}

impl Collection for FileCollection {
    fn name(&self) -> &str {
        self.window.name()
    }

    fn insert(&self, input: RecordInput, durable: bool) -> Result<Record> {
        let _lock = self.write_lock.lock();
        let record = self
            .window
            .insert_with(input, |record| self.log.append(record, durable).map(|_| ()))?;

        if let Err(e) = self.maybe_compact() {
            tracing::warn!(collection = self.window.name(), error = %e, "log compaction failed");
        }
        Ok(record)
    }

    fn find_latest(&self, at: Option<RecordId>) -> Result<Option<Record>> {
        self.window.find_latest(at)
    }

    fn tail(&self, after: RecordId, options: TailOptions) -> Result<Box<dyn TailCursor>> {
        Ok(Box::new(self.window.cursor(after, options)?))
    }

    fn len(&self) -> usize {
        self.window.len()
    }
}
