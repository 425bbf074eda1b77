//! Time-windowed duplicate suppression with a hard entry cap.
//!
//! Callers pass the current instant in, so the engine task stays the only
//! clock reader and tests run without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Age-based cleanup runs at most this often.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Set of recently seen identifiers, bounded by age and size.
pub struct Deduplicator {
    window: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    last_cleanup: Instant,
}

impl Deduplicator {
    pub fn new(window: Duration, max_entries: usize, now: Instant) -> Self {
        Self {
            window,
            max_entries,
            seen: HashMap::new(),
            last_cleanup: now,
        }
    }

    /// Whether `id` is still in the window. Piggybacks the periodic cleanup
    /// so a quiet mesh does not hold entries past their window forever.
    pub fn is_duplicate(&mut self, id: &str, now: Instant) -> bool {
        self.maybe_cleanup(now);
        self.seen.contains_key(id)
    }

    /// Record `id` as seen at `now`.
    pub fn mark_processed(&mut self, id: impl Into<String>, now: Instant) {
        self.maybe_cleanup(now);
        self.seen.insert(id.into(), now);

        if self.seen.len() > self.max_entries {
            // Emergency eviction: shed the oldest half by insertion time.
            let mut entries: Vec<(String, Instant)> = self.seen.drain().collect();
            entries.sort_by_key(|(_, at)| *at);
            let keep_from = entries.len() / 2;
            self.seen.extend(entries.drain(keep_from..));
        }
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_cleanup(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        self.last_cleanup = now;
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(window_s: u64, cap: usize) -> (Deduplicator, Instant) {
        let now = Instant::now();
        (Deduplicator::new(Duration::from_secs(window_s), cap, now), now)
    }

    #[test]
    fn marks_and_detects() {
        let (mut dedup, now) = dedup(30, 100);
        assert!(!dedup.is_duplicate("a", now));
        dedup.mark_processed("a", now);
        assert!(dedup.is_duplicate("a", now));
        assert!(!dedup.is_duplicate("b", now));
    }

    #[test]
    fn window_expiry_on_cleanup() {
        let (mut dedup, now) = dedup(30, 100);
        dedup.mark_processed("old", now);

        // Within the window and before the cleanup interval: still a dup.
        assert!(dedup.is_duplicate("old", now + Duration::from_secs(5)));

        // Past the window; the next call that crosses the cleanup interval
        // sweeps it out.
        assert!(!dedup.is_duplicate("old", now + Duration::from_secs(31)));
        assert_eq!(dedup.len(), 0);
    }

    #[test]
    fn entry_within_window_survives_cleanup() {
        let (mut dedup, now) = dedup(30, 100);
        dedup.mark_processed("keep", now + Duration::from_secs(20));
        assert!(dedup.is_duplicate("keep", now + Duration::from_secs(25)));
    }

    #[test]
    fn cap_evicts_oldest_half() {
        let (mut dedup, now) = dedup(300, 10);
        for i in 0..11 {
            dedup.mark_processed(format!("id-{i}"), now + Duration::from_millis(i));
        }
        assert!(dedup.len() <= 10);
        // The newest insertion always survives the purge.
        assert!(dedup.is_duplicate("id-10", now + Duration::from_millis(20)));
        // The oldest went with the evicted half.
        assert!(!dedup.is_duplicate("id-0", now + Duration::from_millis(20)));
    }

    #[test]
    fn never_exceeds_cap() {
        let (mut dedup, now) = dedup(300, 50);
        for i in 0..500u32 {
            dedup.mark_processed(format!("id-{i}"), now + Duration::from_millis(i as u64));
            assert!(dedup.len() <= 50, "cap breached at {i}");
        }
    }

    #[test]
    fn reset_clears() {
        let (mut dedup, now) = dedup(30, 100);
        dedup.mark_processed("a", now);
        dedup.reset();
        assert!(dedup.is_empty());
        assert!(!dedup.is_duplicate("a", now));
    }
}
