//! Downstream measurement sinks
//!
//! A locally synchronized subscription hands every decoded batch to a
//! [`MeasurementSink`] instead of publishing `NewMeasurements` events. The sink
//! performs its own time alignment; the engine only feeds it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Measurement, Ticks};

/// How a concentrator picks one value when several arrive for the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DownsamplingMethod {
    #[default]
    LastReceived,
    Closest,
    Filtered,
    BestQuality,
}

impl fmt::Display for DownsamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame alignment parameters handed to a sink when a subscription starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAlignmentSettings {
    pub frames_per_second: u32,
    /// Seconds to wait for late measurements.
    pub lag_time: f64,
    /// Seconds a measurement may be ahead of real time.
    pub lead_time: f64,
    pub use_local_clock_as_real_time: bool,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    pub time_resolution: Ticks,
    pub allow_preemptive_publishing: bool,
    pub downsampling_method: DownsamplingMethod,
    pub perform_timestamp_reasonability_check: bool,
    pub processing_interval: i32,
}

/// Consumer of decoded measurement batches.
///
/// Implementations must be cheap to call from the receive path; heavy work
/// belongs on the sink's own task.
pub trait MeasurementSink: Send + Sync + 'static {
    /// Called once when a locally synchronized subscription is accepted.
    /// An error rejects the subscription before it is sent.
    fn start(&self, settings: &TimeAlignmentSettings) -> anyhow::Result<()> {
        let _ = settings;
        Ok(())
    }

    /// Receives one decoded batch, in arrival order, never split.
    fn accept(&self, measurements: &[Measurement]);

    /// Called when the subscription ends or the session stops.
    fn stop(&self) {}
}
