//! Durable record storage.
//!
//! Records are framed and checksummed in an append-only log, one file per
//! collection.

mod log;

pub use log::RecordLog;
