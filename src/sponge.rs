//! Per-source reorder buffer ("sponge").
//!
//! Completion order upstream is unconstrained; the sponge soaks up
//! out-of-order arrivals and releases them strictly by sequence number.
//! It is the only place in the pipeline where per-source ordering is
//! enforced. Memory and added latency are bounded: when the cache
//! overflows its capacity the whole cache is force-flushed oldest-first
//! and the expected cursor is reset past the highest flushed sequence.
//! Bounded resources are preferred over perfect ordering under
//! pathological gaps.
//!
//! Sequence numbers are treated as a wrapping `u64` space. Two named
//! windows replace the original magic thresholds:
//!
//! * [`LOOKAHEAD_WINDOW`]: an arrival may run ahead of the expected
//!   cursor by at most this much and still be cached. Anything further
//!   ahead in wrapped distance is stale (from the far past) or garbage
//!   and is rejected back to the caller.
//! * [`WRAP_GUARD`]: a cached entry whose wrapped distance from the
//!   cursor exceeds this is a leftover from just behind the cursor or
//!   from before a counter wrap; it is drained without waiting so it can
//!   never dam the queue.

use std::collections::VecDeque;

/// Default bound on cached out-of-order records per source.
pub const DEFAULT_CAPACITY: usize = 128;

/// Maximum wrapped distance ahead of the cursor an arrival may be cached.
pub const LOOKAHEAD_WINDOW: u64 = 1 << 16;

/// Wrapped distances beyond this mark an entry as stale or pre-wrap.
pub const WRAP_GUARD: u64 = 1 << 48;

/// Outcome of feeding one arrival into the sponge.
#[derive(Debug)]
pub enum Admission<T> {
    /// Items now releasable, in release order. Includes the arrival
    /// itself when it was in sequence, and the entire cache after a
    /// force-flush.
    Ready(Vec<T>),
    /// The arrival was cached; nothing is releasable yet.
    Held,
    /// The arrival is stale or implausibly far ahead and was refused.
    /// The caller decides how to surface it; it must not be silently
    /// dropped or the frame it belongs to never completes.
    Rejected(T),
}

/// Bounded sequence-reassembly buffer for one source.
#[derive(Debug)]
pub struct Sponge<T> {
    capacity: usize,
    expected: u64,
    started: bool,
    cache: VecDeque<(u64, T)>,
}

impl<T> Default for Sponge<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> Sponge<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            expected: 0,
            started: false,
            cache: VecDeque::new(),
        }
    }

    /// Next sequence number due for release.
    #[must_use]
    pub fn expected(&self) -> u64 {
        self.expected
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Feed one arrival. See [`Admission`] for the outcomes.
    pub fn accept(&mut self, seq: u64, item: T) -> Admission<T> {
        if !self.started {
            self.started = true;
            self.expected = 0;
        }

        if seq == self.expected {
            let mut ready = vec![item];
            self.expected = self.expected.wrapping_add(1);
            self.drain_front(&mut ready);
            return Admission::Ready(ready);
        }

        let ahead = seq.wrapping_sub(self.expected);
        if ahead >= LOOKAHEAD_WINDOW {
            return Admission::Rejected(item);
        }

        // Insert sorted by wrapped distance from the cursor, so pre-wrap
        // sequence numbers keep their place ahead of post-wrap ones.
        let pos = self
            .cache
            .iter()
            .position(|(cached, _)| cached.wrapping_sub(self.expected) > ahead)
            .unwrap_or(self.cache.len());
        self.cache.insert(pos, (seq, item));

        if self.cache.len() > self.capacity {
            // Force-flush: release everything oldest-first and restart
            // past the highest flushed sequence.
            let flushed: Vec<(u64, T)> = self.cache.drain(..).collect();
            self.expected = flushed
                .last()
                .map(|(seq, _)| seq.wrapping_add(1))
                .unwrap_or(self.expected);
            return Admission::Ready(flushed.into_iter().map(|(_, item)| item).collect());
        }
        Admission::Held
    }

    /// Pop cache entries that are releasable now: the next expected
    /// sequence, and anything stale or pre-wrap that would otherwise
    /// block forever.
    fn drain_front(&mut self, ready: &mut Vec<T>) {
        while let Some((front_seq, _)) = self.cache.front() {
            let ahead = front_seq.wrapping_sub(self.expected);
            if ahead == 0 {
                let (_, item) = self.cache.pop_front().expect("front checked");
                ready.push(item);
                self.expected = self.expected.wrapping_add(1);
            } else if ahead > WRAP_GUARD {
                // Just behind the cursor, or left over from before a
                // counter wrap. Release without advancing the cursor.
                let (_, item) = self.cache.pop_front().expect("front checked");
                ready.push(item);
            } else {
                break;
            }
        }
    }
}
