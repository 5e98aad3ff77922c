//! Decoded measurements and buffer blocks

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::Ticks;

/// Quality and state flags attached to every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MeasurementStateFlags(pub u32);

impl MeasurementStateFlags {
    pub const NORMAL: u32 = 0x0000_0000;
    pub const BAD_DATA: u32 = 0x0000_0001;
    pub const SUSPECT_DATA: u32 = 0x0000_0002;
    pub const OVER_RANGE_ERROR: u32 = 0x0000_0004;
    pub const UNDER_RANGE_ERROR: u32 = 0x0000_0008;
    pub const ALARM_HIGH: u32 = 0x0000_0010;
    pub const ALARM_LOW: u32 = 0x0000_0020;
    pub const WARNING_HIGH: u32 = 0x0000_0040;
    pub const WARNING_LOW: u32 = 0x0000_0080;
    pub const FLATLINE_ALARM: u32 = 0x0000_0100;
    pub const COMPARISON_ALARM: u32 = 0x0000_0200;
    pub const ROC_ALARM: u32 = 0x0000_0400;
    pub const RECEIVED_AS_BAD: u32 = 0x0000_0800;
    pub const CALCULATED_VALUE: u32 = 0x0000_1000;
    pub const CALCULATION_ERROR: u32 = 0x0000_2000;
    pub const CALCULATION_WARNING: u32 = 0x0000_4000;
    pub const RESERVED_QUALITY_FLAG: u32 = 0x0000_8000;
    pub const BAD_TIME: u32 = 0x0001_0000;
    pub const SUSPECT_TIME: u32 = 0x0002_0000;
    pub const LATE_TIME_ALARM: u32 = 0x0004_0000;
    pub const FUTURE_TIME_ALARM: u32 = 0x0008_0000;
    pub const UP_SAMPLED: u32 = 0x0010_0000;
    pub const DOWN_SAMPLED: u32 = 0x0020_0000;
    pub const DISCARDED_VALUE: u32 = 0x0040_0000;
    pub const RESERVED_TIME_FLAG: u32 = 0x0080_0000;
    pub const SYSTEM_ERROR: u32 = 0x2000_0000;
    pub const SYSTEM_WARNING: u32 = 0x4000_0000;
    pub const MEASUREMENT_ERROR: u32 = 0x8000_0000;

    pub const DATA_RANGE_MASK: u32 = Self::OVER_RANGE_ERROR
        | Self::UNDER_RANGE_ERROR
        | Self::ALARM_HIGH
        | Self::ALARM_LOW
        | Self::WARNING_HIGH
        | Self::WARNING_LOW;
    pub const DATA_QUALITY_MASK: u32 = Self::BAD_DATA
        | Self::SUSPECT_DATA
        | Self::FLATLINE_ALARM
        | Self::COMPARISON_ALARM
        | Self::ROC_ALARM
        | Self::RECEIVED_AS_BAD
        | Self::CALCULATION_ERROR
        | Self::CALCULATION_WARNING
        | Self::RESERVED_QUALITY_FLAG;
    pub const TIME_QUALITY_MASK: u32 = Self::BAD_TIME
        | Self::SUSPECT_TIME
        | Self::LATE_TIME_ALARM
        | Self::FUTURE_TIME_ALARM
        | Self::UP_SAMPLED
        | Self::DOWN_SAMPLED
        | Self::RESERVED_TIME_FLAG;
    pub const SYSTEM_ISSUE_MASK: u32 =
        Self::SYSTEM_ERROR | Self::SYSTEM_WARNING | Self::MEASUREMENT_ERROR;

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Single-byte state flags of the compact record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompactStateFlags(pub u8);

impl CompactStateFlags {
    pub const DATA_RANGE: u8 = 0x01;
    pub const DATA_QUALITY: u8 = 0x02;
    pub const TIME_QUALITY: u8 = 0x04;
    pub const SYSTEM_ISSUE: u8 = 0x08;
    pub const CALCULATED_VALUE: u8 = 0x10;
    pub const DISCARDED_VALUE: u8 = 0x20;
    /// Timestamp is an offset from the active base time.
    pub const BASE_TIME_OFFSET: u8 = 0x40;
    /// Base time slot 1 rather than slot 0.
    pub const TIME_INDEX: u8 = 0x80;

    pub fn has_flag(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn time_index(&self) -> usize {
        usize::from(self.has_flag(Self::TIME_INDEX))
    }

    /// Expands the compact groups into full state flags.
    pub fn to_state_flags(self) -> MeasurementStateFlags {
        const GROUPS: [(u8, u32); 6] = [
            (CompactStateFlags::DATA_RANGE, MeasurementStateFlags::DATA_RANGE_MASK),
            (CompactStateFlags::DATA_QUALITY, MeasurementStateFlags::DATA_QUALITY_MASK),
            (CompactStateFlags::TIME_QUALITY, MeasurementStateFlags::TIME_QUALITY_MASK),
            (CompactStateFlags::SYSTEM_ISSUE, MeasurementStateFlags::SYSTEM_ISSUE_MASK),
            (CompactStateFlags::CALCULATED_VALUE, MeasurementStateFlags::CALCULATED_VALUE),
            (CompactStateFlags::DISCARDED_VALUE, MeasurementStateFlags::DISCARDED_VALUE),
        ];

        let bits = GROUPS
            .iter()
            .filter(|(compact, _)| self.has_flag(*compact))
            .fold(0u32, |acc, (_, full)| acc | full);
        MeasurementStateFlags(bits)
    }

    /// Collapses full state flags into the compact groups (no timing bits).
    pub fn from_state_flags(flags: MeasurementStateFlags) -> Self {
        let mut bits = 0u8;
        if flags.has_flag(MeasurementStateFlags::DATA_RANGE_MASK) {
            bits |= Self::DATA_RANGE;
        }
        if flags.has_flag(MeasurementStateFlags::DATA_QUALITY_MASK) {
            bits |= Self::DATA_QUALITY;
        }
        if flags.has_flag(MeasurementStateFlags::TIME_QUALITY_MASK) {
            bits |= Self::TIME_QUALITY;
        }
        if flags.has_flag(MeasurementStateFlags::SYSTEM_ISSUE_MASK) {
            bits |= Self::SYSTEM_ISSUE;
        }
        if flags.has_flag(MeasurementStateFlags::CALCULATED_VALUE) {
            bits |= Self::CALCULATED_VALUE;
        }
        if flags.has_flag(MeasurementStateFlags::DISCARDED_VALUE) {
            bits |= Self::DISCARDED_VALUE;
        }
        Self(bits)
    }
}

/// A single decoded time-series value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub signal_id: Uuid,
    /// Historian or device source name of the point.
    pub source: Arc<str>,
    pub point_id: u32,
    /// Free-form tag, only carried by the full-fidelity format.
    pub tag: Option<String>,
    pub timestamp: Ticks,
    pub value: f64,
    pub flags: MeasurementStateFlags,
    pub adder: Option<f64>,
    pub multiplier: Option<f64>,
}

impl Measurement {
    /// Value with the optional linear adjustment applied.
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier.unwrap_or(1.0) + self.adder.unwrap_or(0.0)
    }
}

/// Opaque, sequence-numbered blob delivered in strict order.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferBlock {
    pub signal_id: Uuid,
    pub source: Arc<str>,
    pub point_id: u32,
    /// Arrival time at the subscriber.
    pub timestamp: Ticks,
    pub payload: Bytes,
    pub sequence_number: u32,
}
