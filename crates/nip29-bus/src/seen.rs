//! Bounded, time-expiring tracker of recently processed event IDs.
//!
//! Relays may redeliver the same event (reconnects, overlapping `since`
//! windows). The tracker gives at-most-once local delivery within its
//! window: capacity eviction drops the oldest-inserted IDs first, and
//! entries older than the TTL are treated as absent and swept.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Default maximum number of tracked IDs.
pub const SEEN_MAX_ENTRIES: usize = 100_000;

/// Default time-to-live for a tracked ID.
pub const SEEN_TTL: Duration = Duration::from_secs(60 * 60);

/// How often the dispatch loop sweeps expired entries.
pub const SEEN_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
pub struct SeenConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for SeenConfig {
    fn default() -> Self {
        Self {
            max_entries: SEEN_MAX_ENTRIES,
            ttl: SEEN_TTL,
        }
    }
}

pub struct SeenTracker {
    // Values are insertion instants; `peek` never touches recency, so the
    // LRU order is insertion order.
    entries: LruCache<String, Instant>,
    ttl: Duration,
    stopped: bool,
}

impl SeenTracker {
    pub fn new(config: SeenConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl: config.ttl,
            stopped: false,
        }
    }

    /// Record an ID as processed. Re-adding refreshes its insertion time.
    pub fn add(&mut self, id: &str) {
        self.entries.put(id.to_string(), Instant::now());
    }

    /// Non-mutating membership test; expired entries read as absent.
    pub fn peek(&self, id: &str) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|inserted| inserted.elapsed() < self.ttl)
    }

    /// Bulk-insert IDs restored from persisted state.
    pub fn seed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.add(id.as_ref());
        }
    }

    /// Drop expired entries from the oldest end. Returns how many were removed.
    /// No-op once the tracker is stopped.
    pub fn sweep(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        let mut removed = 0;
        while let Some((_, inserted)) = self.entries.peek_lru() {
            if inserted.elapsed() < self.ttl {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }

    /// Stop background sweeping.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
