//! Throughput and latency accounting

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Measurement, Ticks};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub lifetime_measurements: u64,
    pub lifetime_buffer_blocks: u64,
    pub total_bytes_received: u64,
    pub minimum_measurements_per_second: u64,
    pub maximum_measurements_per_second: u64,
    pub average_measurements_per_second: f64,
    /// Ticks; may be negative for senders whose clocks run ahead.
    pub minimum_latency: i64,
    pub maximum_latency: i64,
    pub average_latency: f64,
    pub latency_samples: u64,
}

#[derive(Debug, Default)]
struct Counters {
    lifetime_measurements: u64,
    lifetime_buffer_blocks: u64,
    total_bytes_received: u64,

    last_second: i64,
    measurements_in_second: u64,
    mps_min: u64,
    mps_max: u64,
    mps_total: u64,
    mps_count: u64,

    latency_min: i64,
    latency_max: i64,
    latency_total: i64,
    latency_count: u64,
}

/// Running totals updated on every delivered batch.
#[derive(Debug, Default)]
pub struct StatisticsTracker {
    counters: Mutex<Counters>,
}

impl StatisticsTracker {
    /// Samples further than this from the local clock are ignored for latency.
    pub const MAX_LATENCY_SAMPLE: i64 = Ticks::PER_HOUR;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_bytes(&self, count: usize) {
        self.counters.lock().total_bytes_received += count as u64;
    }

    pub fn record_buffer_blocks(&self, count: usize) {
        self.counters.lock().lifetime_buffer_blocks += count as u64;
    }

    /// Accounts one decoded batch received at `now`.
    pub fn record_batch(&self, now: Ticks, measurements: &[Measurement]) {
        let mut c = self.counters.lock();
        c.lifetime_measurements += measurements.len() as u64;

        let second = now.whole_seconds();
        if c.last_second == 0 {
            c.last_second = second;
        } else if second > c.last_second {
            let in_second = c.measurements_in_second;
            if in_second < c.mps_min || c.mps_min == 0 {
                c.mps_min = in_second;
            }
            if in_second > c.mps_max || c.mps_max == 0 {
                c.mps_max = in_second;
            }
            c.mps_total += in_second;
            c.mps_count += 1;
            c.measurements_in_second = 0;
            c.last_second = second;
        }
        c.measurements_in_second += measurements.len() as u64;

        for measurement in measurements {
            let latency = now.0.saturating_sub(measurement.timestamp.0);
            if latency.saturating_abs() > Self::MAX_LATENCY_SAMPLE {
                continue;
            }
            // A zero bound means "unset", so the first sample sets both bounds.
            if c.latency_min > latency || c.latency_min == 0 {
                c.latency_min = latency;
            }
            if c.latency_max < latency || c.latency_max == 0 {
                c.latency_max = latency;
            }
            c.latency_total = c.latency_total.saturating_add(latency);
            c.latency_count += 1;
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let c = self.counters.lock();
        StatisticsSnapshot {
            lifetime_measurements: c.lifetime_measurements,
            lifetime_buffer_blocks: c.lifetime_buffer_blocks,
            total_bytes_received: c.total_bytes_received,
            minimum_measurements_per_second: c.mps_min,
            maximum_measurements_per_second: c.mps_max,
            average_measurements_per_second: average(c.mps_total as f64, c.mps_count),
            minimum_latency: c.latency_min,
            maximum_latency: c.latency_max,
            average_latency: average(c.latency_total as f64, c.latency_count),
            latency_samples: c.latency_count,
        }
    }

    /// Clears the per-session byte counter; lifetime totals are kept.
    pub fn reset_session(&self) {
        self.counters.lock().total_bytes_received = 0;
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 { 0.0 } else { total / count as f64 }
}
