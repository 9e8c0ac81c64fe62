//! Per-target exclusive locks for steps executing in this process.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct ResourceLocks {
    held: Mutex<BTreeSet<String>>,
}

impl ResourceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock on `target`, or `None` if another step holds it.
    pub fn try_acquire(self: &Arc<Self>, target: &str) -> Option<ResourceGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(target.to_string()) {
            return None;
        }
        Some(ResourceGuard {
            locks: Arc::clone(self),
            target: target.to_string(),
        })
    }

    pub fn is_held(&self, target: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(target)
    }
}

/// Releases its target when dropped.
#[derive(Debug)]
pub struct ResourceGuard {
    locks: Arc<ResourceLocks>,
    target: String,
}

impl ResourceGuard {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.target);
    }
}
