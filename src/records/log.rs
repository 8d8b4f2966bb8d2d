//! Append-only record log backing one durable collection.

use crate::error::{MqError, Result};
use crate::types::{Record, RecordId, Timestamp};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes opening every frame.
const LOG_MAGIC: &[u8; 4] = b"MQR\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// magic + body length.
const FRAME_HEADER_SIZE: usize = 4 + 4;

/// Trailing CRC32 of the body.
const FRAME_TRAILER_SIZE: usize = 4;

const FLAG_MARKER: u8 = 0b01;
const FLAG_HAS_EVENT: u8 = 0b10;

/// Append-only log of framed records.
///
/// Frame layout: `magic | body_len:u32 | body | crc32(body):u32`, body is
/// `version | flags | id:u64 | timestamp:i64 | event_len:u16 | event |
/// payload_len:u32 | payload (msgpack)`. All integers little-endian.
pub struct RecordLog {
    path: PathBuf,
    file: Mutex<File>,
    /// Frames currently in the file.
    frames: Mutex<u64>,
}

impl RecordLog {
    /// Open or create a log. Call [`RecordLog::read_all`] to replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            frames: Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. With `durable` the file is synced before returning.
    pub fn append(&self, record: &Record, durable: bool) -> Result<u64> {
        let frame = encode_frame(record)?;

        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        if durable {
            file.sync_all()?;
        }
        *self.frames.lock() += 1;

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Replay every record in the log, oldest first.
    ///
    /// A torn frame at the end of the file (crash mid-append) is cut off.
    /// Damage anywhere else is reported as an error.
    pub fn read_all(&self) -> Result<Vec<Record>> {
        let mut file = self.file.lock();
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match decode_frame(&bytes[offset..]) {
                Ok(Some((record, used))) => {
                    records.push(record);
                    offset += used;
                }
                Ok(None) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset,
                        "truncating torn frame at end of record log"
                    );
                    file.set_len(offset as u64)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        *self.frames.lock() = records.len() as u64;
        Ok(records)
    }

    /// Replace the log contents with `records`.
    ///
    /// Writes a sibling file, syncs it and renames it over the log.
    pub fn rewrite<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut count = 0u64;
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for record in records {
                writer.write_all(&encode_frame(record)?)?;
                count += 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let mut file = self.file.lock();
        fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *self.frames.lock() = count;
        Ok(())
    }

    /// Number of frames in the file.
    pub fn frame_count(&self) -> u64 {
        *self.frames.lock()
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

fn encode_frame(record: &Record) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(&record.payload)?;
    let event = record.event.as_deref().unwrap_or("").as_bytes();
    if event.len() > u16::MAX as usize {
        return Err(MqError::Serialization("event name too long".into()));
    }

    let mut flags = 0u8;
    if record.bootstrap_marker {
        flags |= FLAG_MARKER;
    }
    if record.event.is_some() {
        flags |= FLAG_HAS_EVENT;
    }

    let mut body = Vec::with_capacity(1 + 1 + 8 + 8 + 2 + event.len() + 4 + payload.len());
    body.push(LOG_VERSION);
    body.push(flags);
    body.extend_from_slice(&record.id.0.to_le_bytes());
    body.extend_from_slice(&record.timestamp.0.to_le_bytes());
    body.extend_from_slice(&(event.len() as u16).to_le_bytes());
    body.extend_from_slice(event);
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(LOG_MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Decode one frame from the front of `bytes`.
///
/// Returns `Ok(None)` if `bytes` ends before the frame does.
fn decode_frame(bytes: &[u8]) -> Result<Option<(Record, usize)>> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    if &bytes[0..4] != LOG_MAGIC {
        return Err(MqError::InvalidFormat("Invalid record magic".into()));
    }
    let body_len = u32::from_le_bytes(read_array(&bytes[4..8])) as usize;
    let total = FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE;
    if bytes.len() < total {
        return Ok(None);
    }

    let body = &bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len];
    let stored = u32::from_le_bytes(read_array(&bytes[FRAME_HEADER_SIZE + body_len..total]));
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(MqError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(Some((decode_body(body)?, total)))
}

fn decode_body(body: &[u8]) -> Result<Record> {
    let mut reader = BodyReader { bytes: body, pos: 0 };

    let version = reader.take(1)?[0];
    if version != LOG_VERSION {
        return Err(MqError::InvalidFormat(format!(
            "Unsupported log version: {}",
            version
        )));
    }
    let flags = reader.take(1)?[0];
    let id = RecordId(u64::from_le_bytes(read_array(reader.take(8)?)));
    let timestamp = Timestamp(i64::from_le_bytes(read_array(reader.take(8)?)));

    let event_len = u16::from_le_bytes(read_array(reader.take(2)?)) as usize;
    let event_bytes = reader.take(event_len)?;
    let event = if flags & FLAG_HAS_EVENT != 0 {
        let event = String::from_utf8(event_bytes.to_vec()).map_err(|_| {
            MqError::Corruption(format!("record {} has a non-UTF-8 event name", id))
        })?;
        Some(event)
    } else {
        None
    };

    let payload_len = u32::from_le_bytes(read_array(reader.take(4)?)) as usize;
    let payload = rmp_serde::from_slice(reader.take(payload_len)?)?;

    Ok(Record {
        id,
        timestamp,
        event,
        payload,
        bootstrap_marker: flags & FLAG_MARKER != 0,
    })
}

struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(MqError::Corruption("record body shorter than its fields".into()));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(&slice[..N]);
    arr
}
