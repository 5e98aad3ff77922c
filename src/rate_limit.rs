//! Rate-limited protocol warnings

use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::Ticks;

/// Interval between repeated "signal index cache missing" warnings.
pub const MISSING_CACHE_WARNING_INTERVAL: Ticks = Ticks(20_000_000);

/// Lets one caller through per interval, however many race for it.
#[derive(Debug)]
pub struct WarningGate {
    interval: i64,
    /// Tick time of the last warning, `i64::MIN` before the first.
    last: AtomicI64,
}

impl WarningGate {
    pub fn new(interval: Ticks) -> Self {
        Self { interval: interval.0, last: AtomicI64::new(i64::MIN) }
    }

    /// Returns true when a warning should be emitted at `now`.
    pub fn should_warn(&self, now: Ticks) -> bool {
        let last = self.last.load(Ordering::Acquire);
        if last != i64::MIN && now.0.saturating_sub(last) < self.interval {
            return false;
        }
        self.last.compare_exchange(last, now.0, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Forgets the last warning so the next one is emitted immediately.
    pub fn reset(&self) {
        self.last.store(i64::MIN, Ordering::Release);
    }
}

impl Default for WarningGate {
    fn default() -> Self {
        Self::new(MISSING_CACHE_WARNING_INTERVAL)
    }
}
