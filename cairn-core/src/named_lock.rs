use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Non-blocking per-name lock: at most one holder per name, others skip.
#[derive(Clone, Default)]
pub struct NamedLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl NamedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, name: &str) -> Option<NamedLockGuard> {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(NamedLockGuard {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }
}

pub struct NamedLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.name);
    }
}
