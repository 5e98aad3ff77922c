//! Measurement record codecs
//!
//! - [`full`]: self-describing records carrying the complete identity
//! - [`compact`]: records resolved through the signal index cache
//! - [`CompactCodec`]: whole-packet decompression of compact payloads

pub mod compact;
pub mod full;

pub use compact::{
    BaseTimeOffsets, COMPACT_RECORD_FIXED_SIZE, CompactContext, decode_compact, encode_compact,
};
pub use full::{FULL_RECORD_FIXED_SIZE, decode_full, encode_full};

use crate::compression::{decompress_pattern, encode_literal_pattern};
use crate::signal_index::SignalIndexCache;
use crate::types::{CompactStateFlags, DataPacketFlags, Measurement, Ticks};
use crate::wire::PacketReader;
use crate::{Result, SubscriberError};

/// Decodes a compressed block of compact measurements.
///
/// Returned measurements that carry no embedded time have a default
/// timestamp; the caller substitutes the frame timestamp.
pub trait CompactCodec: Send + Sync + 'static {
    fn decompress(
        &self,
        buffer: &[u8],
        cache: &SignalIndexCache,
        include_time: bool,
        flags: DataPacketFlags,
    ) -> Result<Vec<Measurement>>;
}

/// Columnar compact payload compressed with the 32-bit pattern scheme.
///
/// Decompressed layout, little-endian: `count` words of
/// `(flags << 16) | runtime index`, `count` `f32` values, and with time
/// `count` `i64` timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternCompactCodec;

impl PatternCompactCodec {
    /// Builds a compressed block for `(runtime index, measurement)` pairs.
    pub fn compress(&self, records: &[(u16, Measurement)], include_time: bool) -> Vec<u8> {
        let mut words: Vec<u32> = Vec::with_capacity(records.len() * 4);
        for (index, measurement) in records {
            let flags = CompactStateFlags::from_state_flags(measurement.flags).0;
            words.push((u32::from(flags) << 16) | u32::from(*index));
        }
        for (_, measurement) in records {
            words.push((measurement.value as f32).to_bits());
        }
        if include_time {
            for (_, measurement) in records {
                let ticks = measurement.timestamp.0 as u64;
                words.push(ticks as u32);
                words.push((ticks >> 32) as u32);
            }
        }
        encode_literal_pattern(&words, 31)
    }
}

impl CompactCodec for PatternCompactCodec {
    fn decompress(
        &self,
        buffer: &[u8],
        cache: &SignalIndexCache,
        include_time: bool,
        flags: DataPacketFlags,
    ) -> Result<Vec<Measurement>> {
        if !flags.is_little_endian_compression() {
            return Err(SubscriberError::decompression_failed(
                "big-endian pattern compression is not supported",
                None,
            ));
        }

        let data = decompress_pattern(buffer)?;
        let record_size = if include_time { 16 } else { 8 };
        if data.len() % record_size != 0 {
            return Err(SubscriberError::decompression_failed(
                format!("{} decompressed bytes is not a multiple of {record_size}", data.len()),
                None,
            ));
        }
        let count = data.len() / record_size;

        let mut ids = PacketReader::new(&data[..count * 4], "compressed ids");
        let mut values = PacketReader::new(&data[count * 4..count * 8], "compressed values");
        let mut times = PacketReader::new(&data[count * 8..], "compressed timestamps");

        let mut measurements = Vec::with_capacity(count);
        for _ in 0..count {
            let word = ids.read_u32_le()?;
            let runtime_index = (word & 0xFFFF) as u16;
            let state = CompactStateFlags((word >> 16) as u8);
            let value = values.read_f32_le()?;
            let timestamp =
                if include_time { Ticks(times.read_i64_le()?) } else { Ticks::default() };

            let entry = cache.lookup(runtime_index).ok_or_else(|| {
                SubscriberError::decode_error(
                    "compressed payload",
                    format!("runtime index {runtime_index} not in cache"),
                )
            })?;

            measurements.push(Measurement {
                signal_id: entry.signal_id,
                source: entry.source.clone(),
                point_id: entry.point_id,
                tag: None,
                timestamp,
                value: f64::from(value),
                flags: state.to_state_flags(),
                adder: None,
                multiplier: None,
            });
        }

        Ok(measurements)
    }
}
