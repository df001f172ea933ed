//! Fixed-window admission control
//!
//! One [`Throttler`] per partition, owned by that partition's decoder worker,
//! so the window state needs no synchronization. Only the drop counters are
//! shared, for observability.
//!
//! Within each window the first `quota` records pass; the rest are dropped and
//! counted. Unused quota does not carry over into the next window.

use crate::message::MessageType;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared counters of one throttler
#[derive(Debug, Default)]
pub struct ThrottleStats {
    admitted: AtomicU64,
    dropped: AtomicU64,
}

impl ThrottleStats {
    /// Records admitted since start
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Records dropped since start
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-partition fixed-window rate gate
pub struct Throttler {
    msg_type: MessageType,
    partition: usize,
    /// Records per window; `None` disables admission control
    quota: Option<u64>,
    window: Duration,
    window_start: Option<Instant>,
    admitted_in_window: u64,
    dropped_in_window: u64,
    stats: Arc<ThrottleStats>,
}

impl Throttler {
    /// Create a throttler admitting `quota` records per `window`
    ///
    /// A quota of zero disables admission control.
    pub fn new(msg_type: MessageType, partition: usize, quota: u64, window: Duration) -> Self {
        Self {
            msg_type,
            partition,
            quota: (quota > 0).then_some(quota),
            window,
            window_start: None,
            admitted_in_window: 0,
            dropped_in_window: 0,
            stats: Arc::new(ThrottleStats::default()),
        }
    }

    /// Configured quota, `None` when unlimited
    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    /// Handle to the shared counters
    pub fn stats(&self) -> Arc<ThrottleStats> {
        Arc::clone(&self.stats)
    }

    /// Decide whether a record arriving at `now` is admitted
    pub fn admit(&mut self, now: Instant) -> bool {
        self.roll_window(now);

        let admitted = match self.quota {
            None => true,
            Some(quota) => self.admitted_in_window < quota,
        };

        if admitted {
            self.admitted_in_window += 1;
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_in_window += 1;
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::try_record_throttled(self.msg_type.as_str(), self.partition, 1);
        }
        admitted
    }

    /// Records admitted in the current window
    pub fn admitted_in_window(&self) -> u64 {
        self.admitted_in_window
    }

    fn roll_window(&mut self, now: Instant) {
        let start = match self.window_start {
            None => {
                self.window_start = Some(now);
                return;
            }
            Some(start) => start,
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.window {
            return;
        }

        if self.dropped_in_window > 0 {
            debug!(
                msg_type = %self.msg_type,
                partition = self.partition,
                admitted = self.admitted_in_window,
                dropped = self.dropped_in_window,
                "Throttle window closed with drops"
            );
        }

        // windows stay on the grid anchored at the first arrival; only the
        // offset into the current window matters, however long the gap
        let window_nanos = self.window.as_nanos().max(1);
        let into_window = (elapsed.as_nanos() % window_nanos) as u64;
        self.window_start = Some(now - Duration::from_nanos(into_window));
        self.admitted_in_window = 0;
        self.dropped_in_window = 0;
    }
}
