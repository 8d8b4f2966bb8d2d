//! # Capped Pub/Sub
//!
//! Publish/subscribe channels layered on a bounded, append-only record store
//! that supports tailing reads.
//!
//! ## Core Concepts
//!
//! - **Collections**: capped, insertion-ordered record stores with a
//!   blocking tail cursor (see [`store`])
//! - **Channels**: one collection each; a background thread tails it and
//!   fans new records out to subscribers
//! - **Connections**: registries handing out one live channel per name
//!
//! ## Example
//!
//! ```ignore
//! use capped_pubsub::{ChannelOptions, Connection};
//! use serde_json::json;
//!
//! let conn = Connection::memory();
//! let channel = conn.channel_with("news", ChannelOptions::default().with_max_count(3))?;
//!
//! let sub = channel.subscribe("baz", |payload| println!("{payload}"));
//! channel.publish("baz", json!("hello"))?;
//!
//! sub.unsubscribe();
//! channel.close();
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod records;
pub mod store;
pub mod types;

// Re-exports
pub use channel::{
    Channel, ChannelState, ChannelSubscription, DOCUMENT_EVENT, ERROR_EVENT, MESSAGE_EVENT,
};
pub use config::{ChannelOptions, CollectionOptions, ConnectionConfig, DEFAULT_CHANNEL_NAME};
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{EventDispatcher, ListenerId, Subscription};
pub use error::{MqError, Result};
pub use records::RecordLog;
pub use store::{
    BoundedCollection, Collection, FileStore, HaltSignal, MemoryStore, StoreAdapter, TailCursor,
    TailOptions,
};
pub use types::*;
