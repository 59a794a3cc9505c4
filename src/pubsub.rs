//! In-process publish/subscribe bus.
//!
//! Event names are case-insensitive. Listeners see every event under its
//! original name, subscribers only the names they registered. Callbacks run
//! on the triggering task, outside the registry lock, so a callback may
//! trigger or register further events.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Callback for one named event.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback for every event: `(name, data)`.
pub type ListenerCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    events: BTreeMap<String, Vec<(SubscriptionId, EventCallback)>>,
    listeners: Vec<(SubscriptionId, ListenerCallback)>,
}

impl Registry {
    fn allocate(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Shared event bus. Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct PubSub {
    registry: Arc<Mutex<Registry>>,
}

impl PubSub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for each event named in `names`.
    pub fn register_event<I, N, F>(&self, names: I, callback: F) -> SubscriptionId
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        for name in names {
            registry
                .events
                .entry(name.as_ref().to_lowercase())
                .or_default()
                .push((id, Arc::clone(&callback)));
        }
        id
    }

    /// Remove subscription `id` from the events in `names`. Returns true if
    /// anything was removed.
    pub fn unregister_event<I, N>(&self, names: I, id: SubscriptionId) -> bool
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let mut registry = self.registry.lock();
        let mut removed = false;
        for name in names {
            let key = name.as_ref().to_lowercase();
            if let Some(callbacks) = registry.events.get_mut(&key) {
                let before = callbacks.len();
                callbacks.retain(|(existing, _)| *existing != id);
                removed |= callbacks.len() != before;
                if callbacks.is_empty() {
                    registry.events.remove(&key);
                }
            }
        }
        removed
    }

    /// Call `callback` for every event.
    pub fn register_listener<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry.listeners.push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_listener(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    /// Deliver `data` to every listener, then to the subscribers of `name`.
    pub fn trigger(&self, name: &str, data: impl Into<Value>) {
        let data = data.into();
        let (listeners, callbacks) = {
            let registry = self.registry.lock();
            let listeners: Vec<ListenerCallback> =
                registry.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            let callbacks: Vec<EventCallback> = registry
                .events
                .get(&name.to_lowercase())
                .map(|cbs| cbs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            (listeners, callbacks)
        };
        trace!(event = name, listeners = listeners.len(), subscribers = callbacks.len(), "trigger");

        for listener in listeners {
            listener(name, &data);
        }
        for callback in callbacks {
            callback(&data);
        }
    }

    /// Names with at least one subscriber, lowercased.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        self.registry.lock().events.keys().cloned().collect()
    }
}

impl fmt::Debug for PubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let counts: HashMap<&str, usize> = registry
            .events
            .iter()
            .map(|(name, cbs)| (name.as_str(), cbs.len()))
            .collect();
        f.debug_struct("PubSub")
            .field("events", &counts)
            .field("listeners", &registry.listeners.len())
            .finish()
    }
}
