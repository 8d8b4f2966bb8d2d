//! Connection: a registry of named channels over one store.

use crate::channel::Channel;
use crate::config::{ChannelOptions, ConnectionConfig};
use crate::error::{MqError, Result};
use crate::store::{MemoryStore, StoreAdapter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observable connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Destroyed,
}

/// Owns named channels over a shared store.
///
/// Channels hold only a read-only view of the `destroyed` flag; the registry
/// never leaks to them.
pub struct Connection {
    store: Arc<dyn StoreAdapter>,
    config: ConnectionConfig,
    destroyed: Arc<AtomicBool>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Connection {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self::with_config(store, ConnectionConfig::default())
    }

    pub fn with_config(store: Arc<dyn StoreAdapter>, config: ConnectionConfig) -> Self {
        Self {
            store,
            config,
            destroyed: Arc::new(AtomicBool::new(false)),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Connection over a fresh [`MemoryStore`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    /// Channel `name` with the connection's default options.
    pub fn channel(&self, name: &str) -> Result<Channel> {
        self.channel_with(name, self.config.channel_defaults.clone())
    }

    /// The channel named by `config.default_channel`.
    pub fn default_channel(&self) -> Result<Channel> {
        let name = self.config.default_channel.clone();
        self.channel(&name)
    }

    /// Return the live channel `name`, or open a new one with `options`.
    ///
    /// `options` only apply when a channel is created. A closed channel is
    /// replaced by a new instance.
    pub fn channel_with(&self, name: &str, options: ChannelOptions) -> Result<Channel> {
        if self.is_destroyed() {
            return Err(MqError::ConnectionDestroyed);
        }

        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(name) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            tracing::debug!(channel = name, "replacing closed channel");
        }

        let channel = Channel::open(
            name,
            options,
            Arc::clone(&self.store),
            Arc::clone(&self.destroyed),
        )?;
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Names of registered channels, live or closed.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_destroyed() {
            ConnectionState::Destroyed
        } else {
            ConnectionState::Connected
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Mark the connection destroyed.
    ///
    /// Channels are not closed here; each stops dispatching when its tail
    /// thread next checks the flag.
    pub fn close(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in self.channels.lock().values() {
            channel.notify_shutdown();
        }
        tracing::info!("connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("channels", &self.channel_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_same_channel() {
        let conn = Connection::memory();
        let a = conn.channel("news").unwrap();
        let b = conn.channel("news").unwrap();
        let c = conn.channel("other").unwrap();

        assert!(Channel::ptr_eq(&a, &b));
        assert!(!Channel::ptr_eq(&a, &c));
    }

    #[test]
    fn test_concurrent_first_creation_shares_one_channel() {
        use std::sync::Barrier;
        use std::thread;
        use std::time::Duration;

        let store = Arc::new(MemoryStore::new());
        let conn = Arc::new(Connection::new(Arc::clone(&store) as Arc<dyn StoreAdapter>));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    conn.channel("x").unwrap()
                })
            })
            .collect();
        let channels: Vec<Channel> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for channel in &channels[1..] {
            assert!(Channel::ptr_eq(&channels[0], channel));
        }
        assert_eq!(conn.channel_names(), vec!["x".to_string()]);

        channels[0].wait_ready(Duration::from_secs(2)).unwrap();
        let records = store.collection("x").unwrap().records();
        assert_eq!(records.iter().filter(|r| r.bootstrap_marker).count(), 1);
    }

    #[test]
    fn test_closed_channel_replaced() {
        let conn = Connection::memory();
        let a = conn.channel("news").unwrap();
        a.close();
        let b = conn.channel("news").unwrap();

        assert!(!Channel::ptr_eq(&a, &b));
        assert!(!b.is_closed());
        assert_eq!(conn.channel_names(), vec!["news".to_string()]);
    }

    #[test]
    fn test_close_marks_destroyed() {
        let conn = Connection::memory();
        assert_eq!(conn.state(), ConnectionState::Connected);
        let channel = conn.channel("news").unwrap();

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Destroyed);
        // Children observe the flag; they are not closed explicitly.
        assert!(!channel.is_closed());
        assert!(matches!(conn.channel("x"), Err(MqError::ConnectionDestroyed)));
    }

    #[test]
    fn test_default_channel_name() {
        let conn = Connection::memory();
        let channel = conn.default_channel().unwrap();
        assert_eq!(channel.name(), crate::config::DEFAULT_CHANNEL_NAME);
    }
}
