// =============================================================================
// Live capture queue — bounded, aggregating fan-in from the UDP reader
// =============================================================================
//
// Samples are grouped into fixed wall-clock aggregation windows (50 ms by
// default). A sample lands in the current window while time is inside it;
// otherwise the window is sealed and enqueued and a fresh one begins. The
// ring of sealed windows is bounded: at capacity the oldest window is dropped
// and its samples are accounted as dropped. Appending never blocks.
//
// Accounting identity, maintained at all times:
//   samples_received == samples_enqueued + samples_dropped
// where "enqueued" means accepted and not (yet) evicted.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::transport::wire::Sample;

/// Default aggregation window width.
pub const DEFAULT_WINDOW_MS: u64 = 50;
/// Default ring capacity in windows.
pub const DEFAULT_CAPACITY: usize = 256;

/// One sealed slice of samples covering `[start_ms, start_ms + window_ms)`.
/// Intra-window sample order is arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationWindow {
    pub start_ms: u64,
    pub samples: Vec<Sample>,
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LiveQueueStats {
    pub samples_received: u64,
    pub windows_emitted: u64,
    pub samples_enqueued: u64,
    pub samples_dropped: u64,
    pub queue_depth: usize,
    /// Milliseconds since queue creation when the last window sealed.
    pub last_flush_ms: Option<u64>,
}

struct Inner {
    current: Option<AggregationWindow>,
    ring: VecDeque<AggregationWindow>,
    samples_received: u64,
    samples_enqueued: u64,
    windows_emitted: u64,
    last_flush_ms: Option<u64>,
}

/// Bounded ring of aggregation windows decoupling the UDP reader from
/// downstream consumers.
pub struct LiveCaptureQueue {
    window_ms: u64,
    capacity: usize,
    inner: Mutex<Inner>,
    samples_dropped: AtomicU64,
    epoch: Instant,
}

impl LiveCaptureQueue {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            window_ms: window_ms.max(1),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                current: None,
                ring: VecDeque::new(),
                samples_received: 0,
                samples_enqueued: 0,
                windows_emitted: 0,
                last_flush_ms: None,
            }),
            samples_dropped: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since queue creation.
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Append a sample using the wall clock.
    pub fn push(&self, sample: Sample) {
        self.push_at(sample, self.now_ms());
    }

    /// Append a sample at an explicit queue-relative time (exposed for
    /// deterministic tests and replay).
    pub fn push_at(&self, sample: Sample, now_ms: u64) {
        let mut inner = self.inner.lock();
        inner.samples_received += 1;
        inner.samples_enqueued += 1;

        let needs_seal = match &inner.current {
            Some(w) => now_ms >= w.start_ms + self.window_ms,
            None => false,
        };
        if needs_seal {
            self.seal_locked(&mut inner, now_ms);
        }

        match &mut inner.current {
            Some(w) => w.samples.push(sample),
            None => {
                inner.current = Some(AggregationWindow {
                    start_ms: now_ms,
                    samples: vec![sample],
                });
            }
        }
    }

    /// Seal the current window regardless of time. A no-op when the current
    /// window is empty or absent.
    pub fn force_flush(&self) {
        let now = self.now_ms();
        let mut inner = self.inner.lock();
        if inner.current.is_some() {
            self.seal_locked(&mut inner, now);
        }
    }

    /// Pop the oldest sealed window, if any.
    pub fn pop_window(&self) -> Option<AggregationWindow> {
        self.inner.lock().ring.pop_front()
    }

    /// Drain every sealed window, oldest first.
    pub fn drain(&self) -> Vec<AggregationWindow> {
        self.inner.lock().ring.drain(..).collect()
    }

    pub fn stats(&self) -> LiveQueueStats {
        let inner = self.inner.lock();
        LiveQueueStats {
            samples_received: inner.samples_received,
            windows_emitted: inner.windows_emitted,
            samples_enqueued: inner.samples_enqueued,
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            queue_depth: inner.ring.len(),
            last_flush_ms: inner.last_flush_ms,
        }
    }

    /// Move the current window into the ring, evicting the oldest window
    /// when the ring is full. Caller holds the lock.
    fn seal_locked(&self, inner: &mut Inner, now_ms: u64) {
        let Some(window) = inner.current.take() else {
            return;
        };

        if inner.ring.len() >= self.capacity {
            if let Some(evicted) = inner.ring.pop_front() {
                let lost = evicted.samples.len() as u64;
                inner.samples_enqueued -= lost;
                let total = self.samples_dropped.fetch_add(lost, Ordering::Relaxed) + lost;
                warn!(
                    evicted_samples = lost,
                    total_dropped = total,
                    "live queue full, oldest window dropped"
                );
            }
        }

        debug!(
            start_ms = window.start_ms,
            samples = window.samples.len(),
            "aggregation window sealed"
        );
        inner.ring.push_back(window);
        inner.windows_emitted += 1;
        inner.last_flush_ms = Some(now_ms);
    }
}

impl Default for LiveCaptureQueue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_CAPACITY)
    }
}
