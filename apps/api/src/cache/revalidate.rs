use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Keys with a background refresh currently running.
///
/// Each claim carries a cancellation flag. Invalidating a key raises it so a
/// refresh that started before the invalidation does not resurrect the entry.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    keys: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl InFlight {
    /// Claims `key`. Returns `None` if a refresh for it is already running.
    pub fn begin(&self, key: &str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock();
        if keys.contains_key(key) {
            return None;
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        keys.insert(key.to_string(), Arc::clone(&cancelled));
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
            cancelled,
        })
    }

    /// Marks the running refresh of `key`, if any, as cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        match self.keys.lock().get(key) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.keys.lock().len()
    }
}

/// Releases the claim when the background task finishes, panics included.
pub struct InFlightGuard {
    keys: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    key: String,
    cancelled: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}
