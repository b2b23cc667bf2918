use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifetime of a stored value. `Durable` survives across sessions (the
/// visitor identity, the operator opt-out flag); `Session` lasts until the
/// session scope is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScope {
    Durable,
    Session,
}

/// Client-side key-value storage as the classifier sees it. `put` returns
/// false when the backing storage refused the write; callers degrade
/// instead of failing.
pub trait ClientStorage: Send + Sync {
    fn get(&self, scope: StorageScope, key: &str) -> Option<String>;
    fn put(&self, scope: StorageScope, key: &str, value: &str) -> bool;
    fn remove(&self, scope: StorageScope, key: &str);
}

/// In-process implementation: one durable map, one clearable session map.
/// `set_available(false)` simulates a client whose storage is blocked.
#[derive(Default)]
pub struct MemoryClientStorage {
    durable: Mutex<HashMap<String, String>>,
    session: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryClientStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Ends the current session: session-scoped values are gone, durable
    /// ones stay.
    pub fn clear_session(&self) {
        self.session.lock().clear();
    }

    fn map(&self, scope: StorageScope) -> &Mutex<HashMap<String, String>> {
        match scope {
            StorageScope::Durable => &self.durable,
            StorageScope::Session => &self.session,
        }
    }
}

impl ClientStorage for MemoryClientStorage {
    fn get(&self, scope: StorageScope, key: &str) -> Option<String> {
        if self.unavailable.load(Ordering::Relaxed) {
            return None;
        }
        self.map(scope).lock().get(key).cloned()
    }

    fn put(&self, scope: StorageScope, key: &str, value: &str) -> bool {
        if self.unavailable.load(Ordering::Relaxed) {
            return false;
        }
        self.map(scope)
            .lock()
            .insert(key.to_string(), value.to_string());
        true
    }

    fn remove(&self, scope: StorageScope, key: &str) {
        if self.unavailable.load(Ordering::Relaxed) {
            return;
        }
        self.map(scope).lock().remove(key);
    }
}
