//! Compact measurement records and base-time offsets
//!
//! `flags u8 | runtime index u16 | value f32 | [time]`
//!
//! When the session includes time, the time field is either an `i64`
//! timestamp, or, with the base-time-offset flag, a `u16` millisecond or `u32`
//! tick offset from one of the two base times distributed by `UpdateBaseTimes`.

use bytes::{BufMut, BytesMut};

use crate::signal_index::SignalIndexCache;
use crate::types::{CompactStateFlags, Measurement, Ticks};
use crate::wire::PacketReader;
use crate::{Result, SubscriberError};

/// Size of a compact record without its time field.
pub const COMPACT_RECORD_FIXED_SIZE: usize = 7;

/// Base times used to reconstruct offset timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BaseTimeOffsets {
    /// Slot the publisher currently offsets from.
    pub time_index: usize,
    pub offsets: [i64; 2],
}

impl BaseTimeOffsets {
    /// Parses `i32 time index | i64 offset 0 | i64 offset 1`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload, "base times");
        let time_index = reader.read_i32()?;
        let offsets = [reader.read_i64()?, reader.read_i64()?];
        let time_index = usize::try_from(time_index)
            .ok()
            .filter(|index| *index < 2)
            .ok_or_else(|| {
                SubscriberError::decode_error("base times", format!("time index {time_index}"))
            })?;
        Ok(Self { time_index, offsets })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_i32(self.time_index as i32);
        buf.put_i64(self.offsets[0]);
        buf.put_i64(self.offsets[1]);
        buf.to_vec()
    }
}

/// Session state a compact record needs to be interpreted.
#[derive(Debug, Clone, Copy)]
pub struct CompactContext<'a> {
    pub cache: &'a SignalIndexCache,
    pub base_times: &'a BaseTimeOffsets,
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    /// Timestamp for records that carry none.
    pub frame_timestamp: Option<Ticks>,
}

pub fn decode_compact(
    reader: &mut PacketReader<'_>,
    ctx: &CompactContext<'_>,
) -> Result<Measurement> {
    let flags = CompactStateFlags(reader.read_u8()?);
    let runtime_index = reader.read_u16()?;
    let value = reader.read_f32()?;

    let timestamp = if !ctx.include_time {
        ctx.frame_timestamp.unwrap_or_default()
    } else if flags.has_flag(CompactStateFlags::BASE_TIME_OFFSET) {
        let offset = if ctx.use_millisecond_resolution {
            i64::from(reader.read_u16()?) * Ticks::PER_MILLISECOND
        } else {
            i64::from(reader.read_u32()?)
        };
        let base = ctx.base_times.offsets[flags.time_index()];
        if base <= 0 {
            return Err(SubscriberError::decode_error(
                "compact record",
                "base time offset used before base times arrived",
            ));
        }
        let ticks = base.checked_add(offset).ok_or_else(|| {
            SubscriberError::decode_error(
                "compact record",
                "base time offset overflows the timestamp range",
            )
        })?;
        Ticks(ticks)
    } else {
        Ticks(reader.read_i64()?)
    };

    let entry = ctx.cache.lookup(runtime_index).ok_or_else(|| {
        SubscriberError::decode_error(
            "compact record",
            format!("runtime index {runtime_index} not in cache"),
        )
    })?;

    Ok(Measurement {
        signal_id: entry.signal_id,
        source: entry.source.clone(),
        point_id: entry.point_id,
        tag: None,
        timestamp,
        value: f64::from(value),
        flags: flags.to_state_flags(),
        adder: None,
        multiplier: None,
    })
}

/// Writes a compact record the way a publisher would.
///
/// Uses a base-time offset when the timestamp fits after the active base time.
pub fn encode_compact(
    buf: &mut BytesMut,
    runtime_index: u16,
    measurement: &Measurement,
    ctx: &CompactContext<'_>,
) {
    let mut flags = CompactStateFlags::from_state_flags(measurement.flags).0;

    let time: Option<Vec<u8>> = if !ctx.include_time {
        None
    } else {
        let index = ctx.base_times.time_index;
        let base = ctx.base_times.offsets[index];
        let delta = measurement.timestamp.0 - base;
        let offset = if base <= 0 || delta < 0 {
            None
        } else if ctx.use_millisecond_resolution {
            u16::try_from(delta / Ticks::PER_MILLISECOND).ok().map(|ms| ms.to_be_bytes().to_vec())
        } else {
            u32::try_from(delta).ok().map(|ticks| ticks.to_be_bytes().to_vec())
        };

        match offset {
            Some(bytes) => {
                flags |= CompactStateFlags::BASE_TIME_OFFSET;
                if index == 1 {
                    flags |= CompactStateFlags::TIME_INDEX;
                }
                Some(bytes)
            }
            None => Some(measurement.timestamp.0.to_be_bytes().to_vec()),
        }
    };

    buf.put_u8(flags);
    buf.put_u16(runtime_index);
    buf.put_f32(measurement.value as f32);
    if let Some(time) = time {
        buf.put_slice(&time);
    }
}
