//! Bit-set types carried on the wire
//!
//! Each type wraps the raw integer and exposes named accessors while keeping
//! the exact bit positions the publisher uses.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, SubscriberError};

/// Flags byte leading every data packet (and the subscribe command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataPacketFlags(pub u8);

impl DataPacketFlags {
    pub const SYNCHRONIZED: u8 = 0x01;
    pub const COMPACT: u8 = 0x02;
    pub const COMPRESSED: u8 = 0x04;
    pub const CIPHER_INDEX: u8 = 0x08;
    pub const LITTLE_ENDIAN_COMPRESSION: u8 = 0x10;

    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_synchronized(&self) -> bool {
        self.has_flag(Self::SYNCHRONIZED)
    }

    pub fn is_compact(&self) -> bool {
        self.has_flag(Self::COMPACT)
    }

    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMPRESSED)
    }

    pub fn is_little_endian_compression(&self) -> bool {
        self.has_flag(Self::LITTLE_ENDIAN_COMPRESSION)
    }

    /// Key slot (0 = even, 1 = odd) the payload was encrypted with.
    pub fn cipher_index(&self) -> usize {
        usize::from(self.has_flag(Self::CIPHER_INDEX))
    }

    pub fn with(self, flag: u8, enabled: bool) -> Self {
        if enabled { Self(self.0 | flag) } else { Self(self.0 & !flag) }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Text encoding negotiated for every string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationalEncoding {
    /// UTF-16 little endian.
    Unicode,
    /// UTF-16 big endian.
    BigEndianUnicode,
    #[default]
    Utf8,
    /// Single-byte Latin-1.
    Ansi,
}

impl OperationalEncoding {
    pub fn bits(self) -> u32 {
        match self {
            Self::Unicode => 0x0000_0000,
            Self::BigEndianUnicode => 0x0000_0100,
            Self::Utf8 => 0x0000_0200,
            Self::Ansi => 0x0000_0300,
        }
    }

    /// Maps the encoding sub-field back to a variant.
    ///
    /// Anything outside the sub-field is rejected as a fatal configuration error.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            0x0000_0000 => Ok(Self::Unicode),
            0x0000_0100 => Ok(Self::BigEndianUnicode),
            0x0000_0200 => Ok(Self::Utf8),
            0x0000_0300 => Ok(Self::Ansi),
            other => Err(SubscriberError::configuration_error(format!(
                "unsupported operational encoding {other:#010x}"
            ))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "unicode" | "utf16" | "utf-16" | "utf16le" => Ok(Self::Unicode),
            "bigendianunicode" | "utf16be" | "utf-16be" => Ok(Self::BigEndianUnicode),
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "ansi" | "latin1" => Ok(Self::Ansi),
            other => Err(SubscriberError::configuration_error(format!(
                "unsupported operational encoding '{other}'"
            ))),
        }
    }
}

/// Compression algorithms the subscriber is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CompressionModes(pub u32);

impl CompressionModes {
    pub const NONE: u32 = 0x0000_0000;
    pub const GZIP: u32 = 0x0000_0020;
    pub const TSSC: u32 = 0x0000_0040;

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn gzip(&self) -> bool {
        self.has_flag(Self::GZIP)
    }

    pub fn tssc(&self) -> bool {
        self.has_flag(Self::TSSC)
    }
}

/// Operational modes sent with `DefineOperationalModes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationalModes(pub u32);

impl OperationalModes {
    pub const VERSION_MASK: u32 = 0x0000_001F;
    pub const COMPRESSION_MODE_MASK: u32 = 0x0000_00E0;
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    pub const USE_COMMON_SERIALIZATION_FORMAT: u32 = 0x0100_0000;
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    pub const RECEIVE_INTERNAL_METADATA: u32 = 0x0400_0000;
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn with(self, flag: u32, enabled: bool) -> Self {
        if enabled { Self(self.0 | flag) } else { Self(self.0 & !flag) }
    }

    pub fn version(&self) -> u8 {
        (self.0 & Self::VERSION_MASK) as u8
    }

    pub fn with_version(self, version: u8) -> Self {
        Self((self.0 & !Self::VERSION_MASK) | (u32::from(version) & Self::VERSION_MASK))
    }

    pub fn encoding(&self) -> OperationalEncoding {
        // Two-bit sub-field: every value is a defined variant.
        OperationalEncoding::from_bits(self.0 & Self::ENCODING_MASK).unwrap_or_default()
    }

    pub fn with_encoding(self, encoding: OperationalEncoding) -> Self {
        Self((self.0 & !Self::ENCODING_MASK) | encoding.bits())
    }

    pub fn compression_modes(&self) -> CompressionModes {
        CompressionModes(self.0 & Self::COMPRESSION_MODE_MASK)
    }

    pub fn with_compression_modes(self, modes: CompressionModes) -> Self {
        Self((self.0 & !Self::COMPRESSION_MODE_MASK) | (modes.0 & Self::COMPRESSION_MODE_MASK))
    }

    pub fn use_common_serialization_format(&self) -> bool {
        self.has_flag(Self::USE_COMMON_SERIALIZATION_FORMAT)
    }

    pub fn receive_external_metadata(&self) -> bool {
        self.has_flag(Self::RECEIVE_EXTERNAL_METADATA)
    }

    pub fn receive_internal_metadata(&self) -> bool {
        self.has_flag(Self::RECEIVE_INTERNAL_METADATA)
    }

    pub fn compress_payload(&self) -> bool {
        self.has_flag(Self::COMPRESS_PAYLOAD_DATA)
    }

    pub fn compress_signal_index_cache(&self) -> bool {
        self.has_flag(Self::COMPRESS_SIGNAL_INDEX_CACHE)
    }

    pub fn compress_metadata(&self) -> bool {
        self.has_flag(Self::COMPRESS_METADATA)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for OperationalModes {
    fn default() -> Self {
        Self(
            Self::COMPRESS_METADATA
                | Self::COMPRESS_SIGNAL_INDEX_CACHE
                | Self::RECEIVE_INTERNAL_METADATA
                | Self::USE_COMMON_SERIALIZATION_FORMAT
                | CompressionModes::GZIP,
        )
        .with_encoding(OperationalEncoding::Utf8)
    }
}

impl fmt::Display for OperationalModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
