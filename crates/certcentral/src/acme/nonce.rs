//! Replay-nonce cache.
//!
//! The one legitimate singleton inside the ACME client: every response's
//! `Replay-Nonce` header refreshes it, every POST consumes it. Single slot
//! under a mutex; when empty, the client fetches a fresh nonce from
//! `newNonce`.

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct NonceCache {
    slot: Mutex<Option<String>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the cached nonce, if any.
    pub fn take(&self) -> Option<String> {
        self.slot.lock().take()
    }

    /// Cache the nonce from a `Replay-Nonce` header, replacing any older
    /// one.
    pub fn store(&self, nonce: impl Into<String>) {
        *self.slot.lock() = Some(nonce.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty() {
        let cache = NonceCache::new();
        assert_eq!(cache.take(), None);
    }

    #[test]
    fn test_take_consumes() {
        let cache = NonceCache::new();
        cache.store("abc");
        assert_eq!(cache.take(), Some("abc".to_string()));
        assert_eq!(cache.take(), None);
    }

    #[test]
    fn test_store_replaces() {
        let cache = NonceCache::new();
        cache.store("old");
        cache.store("new");
        assert_eq!(cache.take(), Some("new".to_string()));
    }
}
