//! Hashed timing wheel for per-record timeout callbacks.
//!
//! Classic five-level layout: a near ring of 256 one-millisecond slots and
//! four coarser rings of 64 slots each, every level 64 times coarser than
//! the one before. Entries land in the finest ring that can represent
//! their remaining delay and cascade inward as their expiry approaches. A
//! dedicated driver thread wakes on a fixed short period and advances the
//! tick cursor to the current monotonic time, so a burst of missed ticks
//! is caught up in one pass.
//!
//! Guarantees: amortized O(1) schedule and cancel, no timer fires early,
//! firing order within one tick is unspecified. Timers may fire up to one
//! drive period late; the scheduler only uses the wheel to bound how long
//! a node waits for a method result, where that slack is immaterial.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

const NEAR_BITS: u32 = 8;
const NEAR_SLOTS: u64 = 1 << NEAR_BITS; // 256
const NEAR_MASK: u64 = NEAR_SLOTS - 1;
const LEVEL_BITS: u32 = 6;
const LEVEL_SLOTS: u64 = 1 << LEVEL_BITS; // 64
const LEVEL_MASK: u64 = LEVEL_SLOTS - 1;
const LEVELS: usize = 4;

/// How often the driver thread wakes to advance the cursor.
pub const DRIVE_PERIOD: Duration = Duration::from_millis(8);

fn level_offset(level: usize) -> usize {
    NEAR_SLOTS as usize + level * LEVEL_SLOTS as usize
}

fn level_index(expires: u64, level: usize) -> usize {
    ((expires >> (NEAR_BITS + level as u32 * LEVEL_BITS)) & LEVEL_MASK) as usize
}

/// Whether a timer fires once or re-arms itself after each firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    Once,
    Repeating,
}

/// Handle returned by [`TimingWheel::schedule`]; pass to
/// [`TimingWheel::cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    expires: u64,
    interval: u64,
    mode: TimerMode,
    callback: TimerCallback,
}

struct WheelInner {
    buckets: Vec<Vec<u64>>,
    entries: FxHashMap<u64, TimerEntry>,
    next_token: u64,
    cursor: u64,
    epoch: Instant,
}

impl WheelInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Hash a token into the ring that covers its remaining delay.
    fn place(&mut self, token: u64, expires: u64) {
        let bucket = if expires <= self.cursor {
            // Already due (or overdue): fire on the next tick.
            (self.cursor & NEAR_MASK) as usize
        } else {
            let delta = expires - self.cursor;
            if delta < NEAR_SLOTS {
                (expires & NEAR_MASK) as usize
            } else if delta < 1 << (NEAR_BITS + LEVEL_BITS) {
                level_offset(0) + level_index(expires, 0)
            } else if delta < 1 << (NEAR_BITS + 2 * LEVEL_BITS) {
                level_offset(1) + level_index(expires, 1)
            } else if delta < 1 << (NEAR_BITS + 3 * LEVEL_BITS) {
                level_offset(2) + level_index(expires, 2)
            } else {
                // Clamp absurd delays to the range of the outermost ring.
                let expires = expires.min(self.cursor + u64::from(u32::MAX));
                if let Some(entry) = self.entries.get_mut(&token) {
                    entry.expires = expires;
                }
                level_offset(3) + level_index(expires, 3)
            }
        };
        self.buckets[bucket].push(token);
    }

    /// Redistribute one coarse bucket into finer rings. Returns the bucket
    /// index within its ring, so the caller can chain cascades while it
    /// keeps hitting index zero.
    fn cascade(&mut self, level: usize) -> usize {
        let index = level_index(self.cursor, level);
        let tokens = std::mem::take(&mut self.buckets[level_offset(level) + index]);
        for token in tokens {
            if let Some(entry) = self.entries.get(&token) {
                let expires = entry.expires;
                self.place(token, expires);
            }
        }
        index
    }
}

/// The timer wheel plus its driver thread.
///
/// Constructed once per flow and injected by reference into the scheduler
/// and nodes; there is no process-wide instance. `start` and `stop`
/// bracket the driver thread's lifetime.
pub struct TimingWheel {
    inner: Mutex<WheelInner>,
    stop: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimingWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingWheel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                buckets: vec![Vec::new(); NEAR_SLOTS as usize + LEVELS * LEVEL_SLOTS as usize],
                entries: FxHashMap::default(),
                next_token: 1,
                cursor: 0,
                epoch: Instant::now(),
            }),
            stop: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    /// Spawn the driver thread. Timers scheduled before `start` fire once
    /// the driver is running. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut driver = self.driver.lock().expect("wheel driver poisoned");
        if driver.is_some() {
            return;
        }
        let wheel = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("weft-timer".into())
            .spawn(move || {
                while !wheel.stop.load(Ordering::Acquire) {
                    wheel.advance();
                    std::thread::sleep(DRIVE_PERIOD);
                }
            })
            .expect("failed to spawn timer thread");
        *driver = Some(handle);
    }

    /// Stop and join the driver thread. Pending entries are discarded with
    /// the wheel. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.driver.lock().expect("wheel driver poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Register `callback` to fire after `interval` (and every `interval`
    /// thereafter for [`TimerMode::Repeating`]).
    pub fn schedule(
        &self,
        interval: Duration,
        mode: TimerMode,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerToken {
        let mut inner = self.inner.lock().expect("wheel poisoned");
        let token = inner.next_token;
        inner.next_token += 1;
        let interval_ms = (interval.as_millis() as u64).max(1);
        let expires = inner.now_ms() + interval_ms;
        inner.entries.insert(
            token,
            TimerEntry {
                expires,
                interval: interval_ms,
                mode,
                callback: Arc::new(callback),
            },
        );
        inner.place(token, expires);
        TimerToken(token)
    }

    /// Cancel a pending timer. A no-op for tokens that already fired
    /// (once-mode) or were cancelled before.
    pub fn cancel(&self, token: TimerToken) {
        let mut inner = self.inner.lock().expect("wheel poisoned");
        inner.entries.remove(&token.0);
    }

    /// Advance the cursor to the current time, cascading and firing every
    /// bucket it passes. Callbacks run after the lock is released.
    fn advance(&self) {
        let mut due: Vec<TimerCallback> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("wheel poisoned");
            let now = inner.now_ms();
            while inner.cursor <= now {
                let slot = (inner.cursor & NEAR_MASK) as usize;
                if slot == 0 {
                    let mut level = 0;
                    while level < LEVELS && inner.cascade(level) == 0 {
                        level += 1;
                    }
                }
                inner.cursor += 1;
                let tokens = std::mem::take(&mut inner.buckets[slot]);
                for token in tokens {
                    let Some(entry) = inner.entries.get(&token) else {
                        continue; // cancelled; bucket slot was stale
                    };
                    due.push(Arc::clone(&entry.callback));
                    match entry.mode {
                        TimerMode::Once => {
                            inner.entries.remove(&token);
                        }
                        TimerMode::Repeating => {
                            let next = now + entry.interval;
                            if let Some(entry) = inner.entries.get_mut(&token) {
                                entry.expires = next;
                            }
                            inner.place(token, next);
                        }
                    }
                }
            }
        }
        for callback in due {
            callback();
        }
    }
}

impl Drop for TimingWheel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.driver.lock().expect("wheel driver poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
