//! Event module - Delivers server-pushed events and session lifecycle notices
//!
//! Listeners are registered per event name and invoked in registration
//! order. A failing or panicking listener is logged and skipped; it never
//! reaches the frame-processing loop.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Event names emitted by the session itself
pub mod lifecycle {
    pub const CONNECTION_OPENED: &str = "ConnectionOpened";
    pub const CONNECTION_CLOSED: &str = "ConnectionClosed";
    pub const CONNECTION_ERROR: &str = "ConnectionError";
    pub const HELLO: &str = "Hello";
    pub const IDENTIFIED: &str = "Identified";
    pub const PARSE_ERROR: &str = "ParseError";
    pub const RECONNECT_REQUESTED: &str = "ReconnectRequested";
}

/// Error a listener may return
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(Option<&Value>) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned on registration, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration {
    callback: Callback,
    once: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    // ListenerIds grow monotonically, so BTreeMap order is registration order
    listeners: HashMap<String, BTreeMap<ListenerId, Registration>>,
}

/// Registry of named-event listeners
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, name: String, callback: Callback, once: bool) -> ListenerId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry
            .listeners
            .entry(name)
            .or_default()
            .insert(id, Registration { callback, once });
        id
    }

    /// Register a listener for `name`
    pub fn on<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Option<&Value>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(name.into(), Arc::new(listener), false)
    }

    /// Register a listener removed right before its first invocation
    pub fn once<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Option<&Value>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(name.into(), Arc::new(listener), true)
    }

    /// Remove a single listener. Returns false if it was not registered.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let Some(set) = registry.listeners.get_mut(name) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            registry.listeners.remove(name);
        }
        removed
    }

    /// Remove every listener for `name`, or every listener if `name` is None
    pub fn remove_all_listeners(&self, name: Option<&str>) {
        let mut registry = self.lock();
        match name {
            Some(name) => {
                registry.listeners.remove(name);
            }
            None => registry.listeners.clear(),
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.lock().listeners.get(name).map_or(0, BTreeMap::len)
    }

    /// Names with at least one registered listener
    pub fn event_names(&self) -> Vec<String> {
        self.lock().listeners.keys().cloned().collect()
    }

    /// Deliver `data` to every listener of `name`. Returns how many ran.
    pub fn emit(&self, name: &str, data: Option<&Value>) -> usize {
        let callbacks: Vec<Callback> = {
            let mut registry = self.lock();
            let Some(set) = registry.listeners.get_mut(name) else {
                return 0;
            };
            let callbacks = set.values().map(|r| r.callback.clone()).collect();
            set.retain(|_, r| !r.once);
            if set.is_empty() {
                registry.listeners.remove(name);
            }
            callbacks
        };

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Listener for {} failed: {}", name, e),
                Err(_) => tracing::warn!("Listener for {} panicked", name),
            }
        }

        callbacks.len()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let counts: BTreeMap<&str, usize> = registry
            .listeners
            .iter()
            .map(|(name, set)| (name.as_str(), set.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}
