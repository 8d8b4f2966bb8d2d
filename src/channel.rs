//! Publish/subscribe channel over one bounded collection.
//!
//! Each channel runs a single background thread:
//!
//! ```text
//! provision -> bootstrap -> tail --(record)--> dispatch --> tail
//!                              \--(cursor ended)--> broken --> recreate? --> provision
//! ```
//!
//! The only place the thread blocks is inside the tailing cursor. A record is
//! fully dispatched to every matching listener before the next one is read.

use crate::config::ChannelOptions;
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::{MqError, Result};
use crate::store::{Collection, HaltSignal, StoreAdapter, TailCursor, TailOptions};
use crate::types::{Record, RecordId, RecordInput};
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Generic event fired for every message record, whatever its name.
///
/// A record published under this name is delivered to its listeners once,
/// not once as the named event and again as the generic one.
pub const MESSAGE_EVENT: &str = "message";

/// Generic event fired with the raw record.
pub const DOCUMENT_EVENT: &str = "document";

/// Event fired for provisioning and tailing errors.
pub const ERROR_EVENT: &str = "error";

/// Where a channel is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Creating (or re-creating) the collection.
    Provisioning,
    /// Finding the cursor start position.
    Bootstrapping,
    /// Cursor open, dispatching records.
    Tailing,
    /// Cursor lost, waiting to recreate.
    Broken,
    /// Cursor lost and recreate disabled. No further dispatch.
    Dormant,
    /// Provisioning or bootstrap failed.
    Failed,
    /// Closed, or its connection was destroyed.
    Stopped,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Dormant | ChannelState::Failed | ChannelState::Stopped)
    }
}

/// How a tailing pass ended.
enum TailExit {
    Broken,
    Stopped,
}

struct Lifecycle {
    state: ChannelState,
    /// Set once the first cursor is open; publishes wait for it.
    collection: Option<Arc<dyn Collection>>,
    /// Provisioning failure message, kept for late error listeners.
    failure: Option<String>,
}

struct ChannelInner {
    name: String,
    options: ChannelOptions,
    store: Arc<dyn StoreAdapter>,
    closed: Arc<AtomicBool>,
    /// Owning connection's flag. Read, never written.
    destroyed: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    last_seen: Mutex<Option<RecordId>>,
    messages: EventDispatcher<Value>,
    documents: EventDispatcher<Record>,
    errors: EventDispatcher<MqError>,
    /// Orders a failure report against `on_error` registrations.
    failure_gate: ReentrantMutex<()>,
}

/// A named publish/subscribe channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel and start its tail thread.
    ///
    /// `destroyed` is the owning connection's shutdown flag; once it reads
    /// true the channel stops dispatching.
    pub fn open(
        name: impl Into<String>,
        options: ChannelOptions,
        store: Arc<dyn StoreAdapter>,
        destroyed: Arc<AtomicBool>,
    ) -> Result<Self> {
        options.validate()?;
        let name = name.into();

        let inner = Arc::new(ChannelInner {
            name: name.clone(),
            options,
            store,
            closed: Arc::new(AtomicBool::new(false)),
            destroyed,
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Provisioning,
                collection: None,
                failure: None,
            }),
            changed: Condvar::new(),
            last_seen: Mutex::new(None),
            messages: EventDispatcher::new(),
            documents: EventDispatcher::new(),
            errors: EventDispatcher::new(),
            failure_gate: ReentrantMutex::new(()),
        });

        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("tail-{}", name))
            .spawn(move || worker.run())?;

        tracing::info!(channel = %name, "channel opened");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lifecycle.lock().state
    }

    /// True once a collection handle is available for publishing.
    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle.lock().collection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Id of the last record the tail loop consumed (the resume point).
    pub fn last_seen_id(&self) -> Option<RecordId> {
        *self.inner.last_seen.lock()
    }

    /// True if both handles refer to the same channel.
    pub fn ptr_eq(a: &Channel, b: &Channel) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Stop dispatching. Terminal.
    ///
    /// The tail thread notices at its next wake-up; an in-flight read is not
    /// interrupted. Publishers still waiting for readiness get `ChannelClosed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.set_state(ChannelState::Stopped);
        tracing::info!(channel = %self.inner.name, "channel closed");
    }

    /// Wake threads blocked on this channel so they re-check shutdown flags.
    pub(crate) fn notify_shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.changed.notify_all();
    }

    // --- Publishing ---

    /// Publish `payload` under `event`.
    ///
    /// Waits for the channel to become ready, then inserts and returns the
    /// stored record with its assigned id. Store failures are returned here
    /// and never broadcast.
    pub fn publish(&self, event: &str, payload: Value) -> Result<Record> {
        let collection = self.inner.wait_collection(None)?;
        collection.insert(
            RecordInput::message(event, payload),
            self.inner.options.durable_publish,
        )
    }

    /// Publish any serializable payload.
    pub fn publish_json(&self, event: &str, payload: &impl Serialize) -> Result<Record> {
        self.publish(event, serde_json::to_value(payload)?)
    }

    /// Block until the channel is ready to publish, or `timeout` passes.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.inner.wait_collection(Some(timeout)).map(|_| ())
    }

    // --- Subscribing ---

    /// Call `callback` with the payload of every record published under `event`.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(event, callback)
    }

    /// Call `callback` with the payload of every message record.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(MESSAGE_EVENT, callback)
    }

    /// Call `callback` with every raw record except bootstrap markers.
    pub fn on_document<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.inner.documents.subscribe(DOCUMENT_EVENT, callback)
    }

    /// Call `callback` with provisioning and tailing errors.
    ///
    /// If provisioning already failed, `callback` is called with that failure
    /// before this returns, so a listener registered after `open` still sees it.
    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MqError) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let _gate = self.inner.failure_gate.lock();
        let listener = Arc::clone(&callback);
        let subscription = self
            .inner
            .errors
            .subscribe(ERROR_EVENT, move |error| listener(error));

        let failure = self.inner.lifecycle.lock().failure.clone();
        if let Some(message) = failure {
            if !self.inner.halted() {
                callback(&MqError::Provisioning(message));
            }
        }
        subscription
    }

    /// Receive payloads for `event` through a bounded queue.
    ///
    /// A full queue drops the payload rather than stall the tail loop.
    pub fn subscribe_channel(&self, event: &str, buffer_size: usize) -> ChannelSubscription {
        let (sender, receiver) = bounded(buffer_size);
        let channel = self.inner.name.clone();
        let event_name = event.to_string();
        let subscription = self.subscribe(event, move |payload| {
            match sender.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(channel = %channel, event = %event_name, "subscriber queue full, dropping message");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        });
        ChannelSubscription {
            subscription,
            receiver,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.messages.listener_count(event)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelInner {
    fn halted(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst)
    }

    /// Move to `state` unless already stopped.
    fn set_state(&self, state: ChannelState) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ChannelState::Stopped {
            return;
        }
        tracing::debug!(channel = %self.name, from = ?lifecycle.state, to = ?state, "state change");
        lifecycle.state = state;
        self.changed.notify_all();
    }

    fn mark_ready(&self, collection: Arc<dyn Collection>) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.collection = Some(collection);
        lifecycle.failure = None;
        if lifecycle.state != ChannelState::Stopped {
            lifecycle.state = ChannelState::Tailing;
        }
        self.changed.notify_all();
    }

    /// Record a provisioning failure and report it exactly once to every
    /// error listener, whether it registered before or after.
    fn fail(&self, error: MqError) {
        let message = match error {
            MqError::Provisioning(message) => message,
            other => other.to_string(),
        };
        let _gate = self.failure_gate.lock();
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ChannelState::Stopped {
                lifecycle.state = ChannelState::Failed;
            }
            lifecycle.failure = Some(message.clone());
            self.changed.notify_all();
        }
        tracing::error!(channel = %self.name, error = %message, "channel failed");
        self.report(MqError::Provisioning(message));
    }

    /// Deliver an error to `error` listeners. Silent once halted.
    fn report(&self, error: MqError) {
        if self.halted() {
            return;
        }
        if self.errors.emit(ERROR_EVENT, &error) == 0 {
            tracing::warn!(channel = %self.name, error = %error, "unhandled channel error");
        }
    }

    fn wait_collection(&self, timeout: Option<Duration>) -> Result<Arc<dyn Collection>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lifecycle = self.lifecycle.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(MqError::ChannelClosed(self.name.clone()));
            }
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(MqError::ConnectionDestroyed);
            }
            if let Some(failure) = &lifecycle.failure {
                return Err(MqError::Provisioning(failure.clone()));
            }
            if let Some(collection) = &lifecycle.collection {
                return Ok(Arc::clone(collection));
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut lifecycle, deadline).timed_out() {
                        return Err(MqError::Timeout(self.name.clone()));
                    }
                }
                None => self.changed.wait(&mut lifecycle),
            }
        }
    }

    /// Sleep for `delay`, waking early if the channel halts.
    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut lifecycle = self.lifecycle.lock();
        while !self.halted() {
            if self.changed.wait_until(&mut lifecycle, deadline).timed_out() {
                break;
            }
        }
    }

    // --- Tail thread ---

    fn run(self: Arc<Self>) {
        let mut resume: Option<RecordId> = None;
        loop {
            let Some(collection) = self.provision() else {
                return;
            };

            let start = match self.bootstrap(collection.as_ref(), resume) {
                Ok(start) => start,
                Err(e) => {
                    if !self.halted() {
                        self.fail(e);
                    }
                    return;
                }
            };

            match self.tail(collection, start) {
                TailExit::Stopped => {
                    self.set_state(ChannelState::Stopped);
                    tracing::debug!(channel = %self.name, "tail loop stopped");
                    return;
                }
                TailExit::Broken => {}
            }

            self.set_state(ChannelState::Broken);
            let last_seen = *self.last_seen.lock();
            tracing::warn!(channel = %self.name, last_seen = ?last_seen, "broken cursor");
            self.report(MqError::BrokenCursor(self.name.clone()));

            self.pause(self.options.recreate_delay());
            if self.halted() {
                self.set_state(ChannelState::Stopped);
                return;
            }
            if !self.options.recreate {
                self.set_state(ChannelState::Dormant);
                tracing::info!(channel = %self.name, "recreate disabled, channel dormant");
                return;
            }

            resume = *self.last_seen.lock();
            tracing::info!(channel = %self.name, resume = ?resume, "recreating cursor");
        }
    }

    /// Create-if-absent the collection, retrying the already-exists race.
    fn provision(&self) -> Option<Arc<dyn Collection>> {
        self.set_state(ChannelState::Provisioning);
        let options = self.options.collection_options();
        let mut attempts = 0u32;
        loop {
            if self.halted() {
                self.set_state(ChannelState::Stopped);
                return None;
            }
            match self.store.create_bounded_collection(&self.name, &options) {
                Ok(collection) => {
                    tracing::debug!(channel = %self.name, attempts, "collection provisioned");
                    return Some(collection);
                }
                Err(e) if e.is_already_exists() => {
                    attempts += 1;
                    tracing::debug!(channel = %self.name, attempts, "collection already exists, retrying create");
                    thread::yield_now();
                }
                Err(e) => {
                    self.fail(MqError::Provisioning(e.to_string()));
                    return None;
                }
            }
        }
    }

    /// Find the position to tail from without scanning the collection.
    ///
    /// Fresh start: the latest record, or a bootstrap marker written into an
    /// empty collection so the cursor can block instead of poll. Resume: the
    /// last consumed id, so nothing is redelivered and nothing inserted while
    /// the cursor was down is skipped.
    fn bootstrap(&self, collection: &dyn Collection, resume: Option<RecordId>) -> Result<RecordId> {
        self.set_state(ChannelState::Bootstrapping);

        let start = match resume {
            Some(id) => {
                if collection.find_latest(Some(id))?.is_none() {
                    tracing::warn!(channel = %self.name, id = %id, "resume record no longer retained");
                    if collection.is_empty() {
                        let marker = collection.insert(RecordInput::bootstrap_marker(), true)?;
                        tracing::debug!(channel = %self.name, marker = %marker.id, "seeded empty collection");
                    }
                }
                id
            }
            None => match collection.find_latest(None)? {
                Some(latest) => latest.id,
                None => {
                    let marker = collection.insert(RecordInput::bootstrap_marker(), true)?;
                    tracing::debug!(channel = %self.name, marker = %marker.id, "seeded empty collection");
                    marker.id
                }
            },
        };

        *self.last_seen.lock() = Some(start);
        tracing::debug!(channel = %self.name, start = %start, "bootstrap complete");
        Ok(start)
    }

    /// Open a cursor after `start` and dispatch until it ends or we halt.
    fn tail(&self, collection: Arc<dyn Collection>, start: RecordId) -> TailExit {
        let closed = Arc::clone(&self.closed);
        let destroyed = Arc::clone(&self.destroyed);
        let halt: HaltSignal =
            Arc::new(move || closed.load(Ordering::SeqCst) || destroyed.load(Ordering::SeqCst));
        let options = TailOptions::new(self.options.retry_interval()).with_halt(halt);

        let mut cursor: Box<dyn TailCursor> = match collection.tail(start, options) {
            Ok(cursor) => cursor,
            Err(e) => {
                if self.halted() {
                    return TailExit::Stopped;
                }
                self.report(e);
                return TailExit::Broken;
            }
        };
        self.mark_ready(collection);

        loop {
            let next = cursor.next();
            if self.halted() {
                return TailExit::Stopped;
            }
            match next {
                Ok(Some(record)) => self.dispatch(&record),
                Ok(None) => return TailExit::Broken,
                Err(e) => {
                    self.report(e);
                    return TailExit::Broken;
                }
            }
        }
    }

    fn dispatch(&self, record: &Record) {
        if !record.bootstrap_marker {
            if record.is_message() {
                if let Some(event) = record.event.as_deref() {
                    if event != MESSAGE_EVENT {
                        self.messages.emit(event, &record.payload);
                    }
                }
                self.messages.emit(MESSAGE_EVENT, &record.payload);
            }
            self.documents.emit(DOCUMENT_EVENT, record);
        }
        *self.last_seen.lock() = Some(record.id);
    }
}

/// Queue-backed subscription returned by [`Channel::subscribe_channel`].
pub struct ChannelSubscription {
    subscription: Subscription,
    receiver: Receiver<Value>,
}

impl ChannelSubscription {
    /// Receive the next payload (blocking).
    pub fn recv(&self) -> std::result::Result<Value, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a payload (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Value, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Value, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn receiver(&self) -> &Receiver<Value> {
        &self.receiver
    }

    /// Stop receiving. Already queued payloads stay readable.
    pub fn unsubscribe(&self) -> bool {
        self.subscription.unsubscribe()
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_options() -> ChannelOptions {
        ChannelOptions::default()
            .with_retry_interval(Duration::from_millis(10))
            .with_recreate_delay(Duration::from_millis(20))
    }

    fn open(store: &Arc<MemoryStore>, name: &str) -> Channel {
        let channel = Channel::open(
            name,
            fast_options(),
            Arc::clone(store) as Arc<dyn StoreAdapter>,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        channel.wait_ready(Duration::from_secs(2)).unwrap();
        channel
    }

    #[test]
    fn test_bootstrap_seeds_empty_collection() {
        let store = Arc::new(MemoryStore::new());
        let channel = open(&store, "fresh");

        let collection = store.collection("fresh").unwrap();
        let records = collection.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].bootstrap_marker);
        assert_eq!(channel.last_seen_id(), Some(records[0].id));
        assert_eq!(channel.state(), ChannelState::Tailing);
    }

    #[test]
    fn test_bootstrap_starts_after_existing_records() {
        let store = Arc::new(MemoryStore::new());
        let existing = store
            .create_bounded_collection("old", &fast_options().collection_options())
            .unwrap();
        let latest = existing
            .insert(RecordInput::message("e", json!("before")), true)
            .unwrap();

        let channel = open(&store, "old");
        assert_eq!(channel.last_seen_id(), Some(latest.id));
        // No marker needed when data already exists.
        assert_eq!(existing.len(), 1);
    }

    #[test]
    fn test_publish_and_receive() {
        let store = Arc::new(MemoryStore::new());
        let channel = open(&store, "news");
        let sub = channel.subscribe_channel("baz", 16);

        let record = channel.publish("baz", json!("hello")).unwrap();
        assert_eq!(record.event.as_deref(), Some("baz"));

        let payload = sub.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, json!("hello"));
    }

    #[test]
    fn test_message_event_not_doubled() {
        let store = Arc::new(MemoryStore::new());
        let channel = open(&store, "news");
        let sub = channel.subscribe_channel(MESSAGE_EVENT, 16);

        channel.publish(MESSAGE_EVENT, json!(1)).unwrap();
        channel.publish("other", json!(2)).unwrap();

        assert_eq!(sub.recv_timeout(Duration::from_secs(2)).unwrap(), json!(1));
        assert_eq!(sub.recv_timeout(Duration::from_secs(2)).unwrap(), json!(2));
        assert!(sub.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_dropped_queue_subscription_is_removed() {
        let store = Arc::new(MemoryStore::new());
        let channel = open(&store, "news");
        let kept = channel.subscribe_channel("e", 4);

        for _ in 0..100 {
            drop(channel.subscribe_channel("e", 4));
        }
        assert_eq!(channel.listener_count("e"), 1);

        channel.publish("e", json!("still here")).unwrap();
        assert_eq!(kept.recv_timeout(Duration::from_secs(2)).unwrap(), json!("still here"));
        assert_eq!(channel.listener_count("e"), 1);

        drop(kept);
        assert_eq!(channel.listener_count("e"), 0);
    }

    #[test]
    fn test_close_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let channel = open(&store, "news");
        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(matches!(
            channel.publish("e", json!(1)),
            Err(MqError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let store: Arc<dyn StoreAdapter> = Arc::new(MemoryStore::new());
        let result = Channel::open(
            "bad",
            ChannelOptions::default().with_capacity_bytes(0),
            store,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(MqError::InvalidConfig(_))));
    }

    #[test]
    fn test_state_terminal_flags() {
        assert!(ChannelState::Stopped.is_terminal());
        assert!(ChannelState::Dormant.is_terminal());
        assert!(!ChannelState::Broken.is_terminal());
        assert!(!ChannelState::Tailing.is_terminal());
    }
}
