//! Reference-data cache for the dashboard bootstrap payload.
//!
//! An explicit cache object with a time-based expiry and an injected clock,
//! owned by the app state. Reference-data writes invalidate it; nothing in
//! here is a module-level global.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct TtlCache<V> {
    ttl: Duration,
    clock: Box<dyn Clock>,
    entries: HashMap<String, (Instant, V)>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: HashMap::new(),
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Box::new(SystemClock))
    }

    /// Returns the cached value if it has not outlived the TTL. Expired
    /// entries are dropped on access.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some((stored_at, value)) if now.duration_since(*stored_at) < self.ttl => {
                Some(value.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: V) {
        let now = self.clock.now();
        self.entries.insert(key.into(), (now, value));
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct ManualClock {
        base: Instant,
        offset: Cell<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Cell::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }
    }

    impl Clock for Rc<ManualClock> {
        fn now(&self) -> Instant {
            (**self).now()
        }
    }

    #[test]
    fn serves_fresh_entries_and_expires_stale_ones() {
        let clock = Rc::new(ManualClock::new());
        let mut cache: TtlCache<String> =
            TtlCache::new(Duration::from_secs(60), Box::new(clock.clone()));

        cache.put("bootstrap", "v1".to_string());
        assert_eq!(cache.get("bootstrap").as_deref(), Some("v1"));

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("bootstrap").as_deref(), Some("v1"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("bootstrap"), None, "entry past TTL is dropped");
        assert_eq!(cache.get("bootstrap"), None);
    }

    #[test]
    fn put_refreshes_the_expiry() {
        let clock = Rc::new(ManualClock::new());
        let mut cache: TtlCache<i64> =
            TtlCache::new(Duration::from_secs(30), Box::new(clock.clone()));

        cache.put("k", 1);
        clock.advance(Duration::from_secs(20));
        cache.put("k", 2);
        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.get("k"), Some(2), "rewrite restarts the clock");
    }

    #[test]
    fn invalidate_and_clear_remove_entries() {
        let mut cache: TtlCache<i64> = TtlCache::with_system_clock(Duration::from_secs(300));
        cache.put("a", 1);
        cache.put("b", 2);

        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.clear();
        assert_eq!(cache.get("b"), None);
    }
}
