//! In-process event dispatcher.
//!
//! Maps event names to ordered listener lists. Listeners are identified by
//! a generated id rather than by the callback itself, so the same closure can
//! be registered twice and removed once.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    id: ListenerId,
    callback: Callback<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

struct Registry<T> {
    listeners: RwLock<HashMap<String, Vec<Listener<T>>>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    fn remove(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event);
        }
        removed
    }
}

/// Registry of named events and their listeners.
pub struct EventDispatcher<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> EventDispatcher<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `event`. Listeners run in registration order.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::SeqCst));
        self.registry
            .listeners
            .write()
            .entry(event.clone())
            .or_default()
            .push(Listener {
                id,
                callback: Arc::new(callback),
            });

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            event: event.clone(),
            remove: Box::new(move || {
                weak.upgrade()
                    .map(|registry| registry.remove(&event, id))
                    .unwrap_or(false)
            }),
        }
    }

    /// Invoke every listener of `event` with `arg`. Returns how many ran.
    ///
    /// The listener list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe without deadlocking; such changes apply from the next emit.
    pub fn emit(&self, event: &str, arg: &T) -> usize {
        let snapshot: Vec<Listener<T>> = match self.registry.listeners.read().get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for listener in &snapshot {
            (listener.callback)(arg);
        }
        snapshot.len()
    }

    /// Remove a listener by id.
    pub fn unsubscribe(&self, event: &str, id: ListenerId) -> bool {
        self.registry.remove(event, id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .listeners
            .read()
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.registry.listeners.write().clear();
    }
}

impl<T: 'static> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Token returned by `subscribe`. Dropping it does not unsubscribe.
pub struct Subscription {
    id: ListenerId,
    event: String,
    remove: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove this listener. Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}
