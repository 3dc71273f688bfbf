//! Request-id allocation and correlation for the streaming connection.
//!
//! # Why correlate at all? (for beginners)
//!
//! Every outbound frame carries a `req_id`, and the simulator later
//! acknowledges it with a `result` frame naming the same id. The protocol
//! is fire-and-forget — nothing is retried on failure — so the only job
//! of correlation is observability: when a `result` arrives seconds after
//! the request that caused it, the log line can still say *which*
//! subscribe or write succeeded or failed.
//!
//! [`RequestCounter`] hands out the ids. It uses an `AtomicU64` so the
//! receiver loop, the scheduler tick, and user-facing calls can all stamp
//! requests without taking a lock: `fetch_add` reads, increments, and
//! writes back as one indivisible step, so two threads can never get the
//! same id.
//!
//! [`RequestLog`] remembers what each in-flight id asked for, with a
//! small bounded window — an acknowledgment that never arrives must not
//! leak an entry forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

/// Largest number of unacknowledged requests remembered at once. When the
/// window is full, the oldest entry is evicted.
const MAX_TRACKED: usize = 256;

// ── Counter ───────────────────────────────────────────────────────────────────

/// Thread-safe allocator of request ids.
///
/// Ids start at 1 — the simulator treats 0 as "no request" — and
/// increment by 1 per call, wrapping at `u64::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use xplink_core::protocol::RequestCounter;
///
/// let counter = RequestCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
pub struct RequestCounter {
    inner: AtomicU64,
}

impl RequestCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next request id.
    ///
    /// `Ordering::Relaxed` is enough: ids only need to be unique, they
    /// carry no cross-thread memory synchronization.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next`](RequestCounter::next) would
    /// return. Diagnostic only; another thread may claim it first.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Log ───────────────────────────────────────────────────────────────────────

/// Bounded record of in-flight requests, keyed by id.
///
/// `record` notes what an id asked for when the request goes out;
/// `resolve` consumes the note when the matching `result` frame arrives
/// and emits the success/failure log line.
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Mutex<BTreeMap<u64, String>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers what `req_id` asked for. Evicts the oldest entries once
    /// the window is full.
    pub fn record(&self, req_id: u64, what: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= MAX_TRACKED {
            entries.pop_first();
        }
        entries.insert(req_id, what.into());
    }

    /// Consumes the entry for `req_id` and logs the outcome: `debug` for
    /// success, `warn` for failure. Unknown ids (already evicted, or sent
    /// before a reconnect) are logged at `debug`.
    pub fn resolve(&self, req_id: u64, success: bool, error: Option<&str>) {
        let what = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&req_id);
        match (what, success) {
            (Some(what), true) => debug!(req_id, %what, "request acknowledged"),
            (Some(what), false) => warn!(
                req_id,
                %what,
                error = error.unwrap_or("unspecified"),
                "request failed"
            ),
            (None, true) => debug!(req_id, "acknowledgment for untracked request"),
            (None, false) => warn!(
                req_id,
                error = error.unwrap_or("unspecified"),
                "failure for untracked request"
            ),
        }
    }

    /// Whether `req_id` is still awaiting its acknowledgment.
    pub fn contains(&self, req_id: u64) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&req_id)
    }

    /// Number of unacknowledged requests currently tracked.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every tracked entry, e.g. when the connection they were sent
    /// on is gone.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_one() {
        // Arrange
        let counter = RequestCounter::new();

        // Act / Assert
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn test_counter_wraps_at_u64_max() {
        // Arrange – one step before overflow
        let counter = RequestCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 0, "counter must wrap without panicking");
    }

    #[test]
    fn test_counter_ids_are_unique_across_threads() {
        // Arrange
        let counter = Arc::new(RequestCounter::new());
        let thread_count = 8;
        let ids_per_thread = 1000;

        // Act
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..ids_per_thread).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all_ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two threads got the same id
        all_ids.sort_unstable();
        all_ids.dedup();
        assert_eq!(all_ids.len(), thread_count * ids_per_thread);
    }

    #[test]
    fn test_current_does_not_advance() {
        let counter = RequestCounter::new();
        assert_eq!(counter.current(), 1);
        counter.next();
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_resolve_consumes_the_entry() {
        let log = RequestLog::new();
        log.record(5, "dataref_subscribe_values");
        assert!(log.contains(5));
        log.resolve(5, true, None);
        assert!(!log.contains(5));
        assert!(log.is_empty());
    }

    #[test]
    fn test_resolve_of_untracked_id_is_harmless() {
        let log = RequestLog::new();
        log.resolve(42, false, Some("dataref not found"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_window_evicts_oldest_entries() {
        // Arrange
        let log = RequestLog::new();

        // Act – overfill the window
        for req_id in 1..=300u64 {
            log.record(req_id, "dataref_set_values");
        }

        // Assert – the oldest ids fell out, the newest are still there
        assert_eq!(log.len(), MAX_TRACKED);
        assert!(!log.contains(1));
        assert!(!log.contains(44));
        assert!(log.contains(45));
        assert!(log.contains(300));
    }

    #[test]
    fn test_clear_drops_all_entries() {
        let log = RequestLog::new();
        log.record(1, "a");
        log.record(2, "b");
        log.clear();
        assert!(log.is_empty());
        assert!(!log.contains(1));
    }
}
