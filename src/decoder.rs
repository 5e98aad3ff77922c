//! Data packet decoding
//!
//! `flags u8 | [frame timestamp i64] | count u32 | records...`
//!
//! Everything after the flags byte is encrypted when a cipher key set is
//! active. Records are full-fidelity, compact, or one compressed compact
//! block depending on the flags.
//!
//! The session state a decode depends on (signal index cache, cipher keys,
//! base times, negotiated settings) is swapped as whole objects. Each decode
//! works from one [`DecodeSnapshot`] taken at entry, so a replacement that
//! lands mid-decode only affects the next packet.

use arc_swap::ArcSwap;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::trace;

use crate::cipher::{CipherKeyManager, CipherKeySet};
use crate::codec::{
    BaseTimeOffsets, CompactCodec, CompactContext, PatternCompactCodec, decode_compact, decode_full,
};
use crate::rate_limit::WarningGate;
use crate::signal_index::{SignalIndexCache, SignalIndexCacheHandle};
use crate::types::{CompressionModes, DataPacketFlags, Measurement, OperationalEncoding, Ticks};
use crate::wire::PacketReader;
use crate::{Result, SubscriberError};

/// Warning raised while compact data arrives ahead of its signal index cache.
pub const MISSING_CACHE_WARNING: &str =
    "Signal index cache has not arrived. No compact measurements can be parsed.";

/// Negotiated options that shape how records are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSettings {
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub encoding: OperationalEncoding,
    pub compression: CompressionModes,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            include_time: true,
            use_millisecond_resolution: false,
            encoding: OperationalEncoding::Utf8,
            compression: CompressionModes(CompressionModes::GZIP),
        }
    }
}

/// Result of decoding one data packet.
#[derive(Debug, Default)]
pub struct DecodedPacket {
    pub flags: DataPacketFlags,
    pub frame_timestamp: Option<Ticks>,
    /// Complete batch; a failed packet never yields a partial one.
    pub measurements: Vec<Measurement>,
    /// Compact records were dropped because no cache was present.
    pub cache_missing: bool,
    /// Set on the first dropped packet of each warning interval.
    pub warning: Option<&'static str>,
}

/// Fixed view of decode state for one packet.
#[derive(Clone)]
pub struct DecodeSnapshot {
    pub cache: Option<Arc<SignalIndexCache>>,
    pub keys: Option<Arc<CipherKeySet>>,
    pub base_times: Arc<BaseTimeOffsets>,
    pub settings: Arc<DecodeSettings>,
    codec: Arc<dyn CompactCodec>,
}

impl DecodeSnapshot {
    /// Decodes `payload`; the missing-cache warning is left to the caller.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedPacket> {
        let (&flags, rest) = payload
            .split_first()
            .ok_or_else(|| SubscriberError::truncated("data packet flags", 1, 0))?;
        let flags = DataPacketFlags::new(flags);

        let body: Cow<'_, [u8]> = match &self.keys {
            Some(keys) => Cow::Owned(keys.decrypt(rest, flags.cipher_index())?),
            None => Cow::Borrowed(rest),
        };

        let mut reader = PacketReader::new(&body, "data packet");
        let frame_timestamp =
            if flags.is_synchronized() { Some(Ticks(reader.read_i64()?)) } else { None };
        let count = reader.read_u32()? as usize;

        let mut packet = DecodedPacket { flags, frame_timestamp, ..Default::default() };

        if (flags.is_compact() || flags.is_compressed()) && self.cache.is_none() {
            packet.cache_missing = true;
            return Ok(packet);
        }

        if flags.is_compressed() {
            packet.measurements = self.decompress(reader.rest(), flags, frame_timestamp)?;
            return Ok(packet);
        }

        let settings = &self.settings;
        let mut measurements = Vec::with_capacity(count.min(reader.remaining()));
        match self.cache.as_deref().filter(|_| flags.is_compact()) {
            Some(cache) => {
                let ctx = CompactContext {
                    cache,
                    base_times: &self.base_times,
                    include_time: settings.include_time,
                    use_millisecond_resolution: settings.use_millisecond_resolution,
                    frame_timestamp,
                };
                for _ in 0..count {
                    measurements.push(decode_compact(&mut reader, &ctx)?);
                }
            }
            None => {
                for _ in 0..count {
                    measurements.push(decode_full(&mut reader, settings.encoding)?);
                }
            }
        }

        if !reader.is_empty() {
            trace!(trailing = reader.remaining(), "Data packet has trailing bytes");
        }
        packet.measurements = measurements;
        Ok(packet)
    }

    fn decompress(
        &self,
        block: &[u8],
        flags: DataPacketFlags,
        frame_timestamp: Option<Ticks>,
    ) -> Result<Vec<Measurement>> {
        if self.settings.compression.tssc() {
            return Err(SubscriberError::decompression_failed(
                "TSSC payload compression is not supported",
                None,
            ));
        }
        let cache = self
            .cache
            .as_deref()
            .ok_or_else(|| {
                SubscriberError::decode_error("compressed payload", "no signal index cache")
            })?;

        let include_time = self.settings.include_time;
        let mut measurements = self.codec.decompress(block, cache, include_time, flags)?;
        if !include_time {
            let timestamp = frame_timestamp.unwrap_or_default();
            for measurement in &mut measurements {
                measurement.timestamp = timestamp;
            }
        }
        Ok(measurements)
    }
}

/// Owns the swappable decode state for a session.
pub struct MeasurementDecoder {
    cache: SignalIndexCacheHandle,
    keys: CipherKeyManager,
    base_times: ArcSwap<BaseTimeOffsets>,
    settings: ArcSwap<DecodeSettings>,
    codec: Arc<dyn CompactCodec>,
    missing_cache: WarningGate,
}

impl MeasurementDecoder {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(PatternCompactCodec))
    }

    pub fn with_codec(codec: Arc<dyn CompactCodec>) -> Self {
        Self {
            cache: SignalIndexCacheHandle::new(),
            keys: CipherKeyManager::new(),
            base_times: ArcSwap::from_pointee(BaseTimeOffsets::default()),
            settings: ArcSwap::from_pointee(DecodeSettings::default()),
            codec,
            missing_cache: WarningGate::default(),
        }
    }

    pub fn signal_index_cache(&self) -> &SignalIndexCacheHandle {
        &self.cache
    }

    pub fn cipher_keys(&self) -> &CipherKeyManager {
        &self.keys
    }

    pub fn base_times(&self) -> BaseTimeOffsets {
        **self.base_times.load()
    }

    pub fn set_base_times(&self, base_times: BaseTimeOffsets) {
        self.base_times.store(Arc::new(base_times));
    }

    pub fn settings(&self) -> DecodeSettings {
        **self.settings.load()
    }

    pub fn set_settings(&self, settings: DecodeSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn snapshot(&self) -> DecodeSnapshot {
        DecodeSnapshot {
            cache: self.cache.load(),
            keys: self.keys.snapshot(),
            base_times: self.base_times.load_full(),
            settings: self.settings.load_full(),
            codec: Arc::clone(&self.codec),
        }
    }

    /// Decodes one data packet received now.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedPacket> {
        self.decode_at(payload, Ticks::now())
    }

    /// Decodes one data packet, gating the missing-cache warning at `now`.
    pub fn decode_at(&self, payload: &[u8], now: Ticks) -> Result<DecodedPacket> {
        let mut packet = self.snapshot().decode(payload)?;
        if packet.cache_missing && self.missing_cache.should_warn(now) {
            packet.warning = Some(MISSING_CACHE_WARNING);
        }
        Ok(packet)
    }

    /// Forgets session-scoped keys, cache and base times.
    pub fn reset(&self) {
        self.cache.clear();
        self.keys.clear();
        self.base_times.store(Arc::new(BaseTimeOffsets::default()));
        self.missing_cache.reset();
    }
}

impl Default for MeasurementDecoder {
    fn default() -> Self {
        Self::new()
    }
}
