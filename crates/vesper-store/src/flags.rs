//! Session-scoped flags with optional expiry.
//!
//! Stands in for per-tab session storage: a flag lives until it is
//! cleared, its TTL elapses, or the process exits.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Default)]
pub struct SessionFlags {
    entries: Mutex<HashMap<String, Option<Instant>>>,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`. `None`, or a TTL too large to represent, never expires.
    pub fn set(&self, key: &str, ttl: Option<Duration>) {
        let expires = expiry(Instant::now(), ttl);
        self.entries.lock().insert(key.to_string(), expires);
    }

    /// Set `key` only if it is not already live. Returns true if this call set it.
    pub fn set_if_absent(&self, key: &str, ttl: Option<Duration>) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some(expires) = entries.get(key) {
            if expires.map_or(true, |at| at > now) {
                return false;
            }
        }
        entries.insert(key.to_string(), expiry(now, ttl));
        true
    }

    pub fn is_set(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(Some(at)) if *at <= Instant::now() => {
                entries.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }
}

fn expiry(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|t| now.checked_add(t))
}
