//! Data-loss watchdog
//!
//! Armed lazily by the first data packet. On each period, if no bytes were
//! observed since the previous period, the monitor disarms itself and reports
//! the loss once; the session reconnects and re-arms it on the next data.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct DataLossMonitor {
    interval: Mutex<Duration>,
    armed: AtomicBool,
    bytes: AtomicU64,
    changed: Notify,
}

impl DataLossMonitor {
    /// `Duration::ZERO` disables the monitor.
    pub fn new(interval: Duration) -> Self {
        Self { interval: Mutex::new(interval), ..Default::default() }
    }

    /// Period for a subscription; throttled publishers may stay quiet for up
    /// to a lag time, so the period is at least twice that.
    pub fn effective_interval(
        configured: Duration,
        throttled: bool,
        lag_time_secs: f64,
    ) -> Duration {
        let lagging = lag_time_secs.is_finite() && lag_time_secs > 0.0;
        if configured.is_zero() || !throttled || !lagging {
            return configured;
        }
        configured.max(Duration::from_secs_f64(lag_time_secs * 2.0))
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
        self.changed.notify_waiters();
    }

    pub fn record_bytes(&self, count: usize) {
        self.bytes.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Arms the monitor. Returns true if it was not armed before.
    pub fn arm(&self) -> bool {
        if self.interval().is_zero() {
            return false;
        }
        let newly = !self.armed.swap(true, Ordering::AcqRel);
        if newly {
            debug!(interval = ?self.interval(), "Data loss monitor armed");
        }
        newly
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Evaluates one period. Returns true exactly when data loss is detected.
    pub fn tick(&self) -> bool {
        let observed = self.bytes.swap(0, Ordering::AcqRel);
        if !self.is_armed() {
            return false;
        }
        trace!(observed, "Data loss monitor tick");
        observed == 0 && self.armed.swap(false, Ordering::AcqRel)
    }

    /// Runs the periodic check until `cancel` fires. `on_loss` must not block.
    pub fn spawn<F>(self: Arc<Self>, cancel: CancellationToken, on_loss: F) -> JoinHandle<()>
    where
        F: Fn(Duration) + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let period = self.interval();
                let elapsed = async {
                    if period.is_zero() {
                        std::future::pending::<()>().await;
                    } else {
                        tokio::time::sleep(period).await;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.changed.notified() => continue,
                    _ = elapsed => {}
                }
                if self.tick() {
                    on_loss(period);
                }
            }
            debug!("Data loss monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn disabled_monitor_never_arms() {
        let monitor = DataLossMonitor::new(Duration::ZERO);
        assert!(!monitor.arm());
        assert!(!monitor.tick());
    }

    #[test]
    fn quiet_period_after_arming_reports_once() {
        let monitor = DataLossMonitor::new(Duration::from_secs(2));
        monitor.record_bytes(10);
        assert!(monitor.arm());
        assert!(!monitor.arm());

        assert!(!monitor.tick());
        assert!(monitor.tick());
        assert!(!monitor.is_armed());
        assert!(!monitor.tick());
    }

    #[test]
    fn throttled_interval_is_at_least_twice_the_lag() {
        let configured = Duration::from_secs(2);
        assert_eq!(DataLossMonitor::effective_interval(configured, false, 5.0), configured);
        let throttled = DataLossMonitor::effective_interval(configured, true, 5.0);
        assert_eq!(throttled, Duration::from_secs(10));
        assert_eq!(DataLossMonitor::effective_interval(configured, true, 0.5), configured);
        assert_eq!(DataLossMonitor::effective_interval(Duration::ZERO, true, 5.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_schedules_a_single_reconnect() {
        let monitor = Arc::new(DataLossMonitor::new(Duration::from_secs(2)));
        let losses = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&losses);
        let handle = Arc::clone(&monitor).spawn(cancel.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Not armed yet: silence is expected during the handshake.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(losses.load(Ordering::SeqCst), 0);

        monitor.record_bytes(64);
        monitor.arm();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(losses.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_armed());

        cancel.cancel();
        handle.await.unwrap();
    }
}
