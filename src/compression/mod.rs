//! Decompression of metadata, signal index caches and compact payloads

mod pattern;

pub use pattern::{decompress_pattern, encode_literal_pattern};

use flate2::read::GzDecoder;
use std::io::Read;

use crate::{Result, SubscriberError};

/// Inflates a gzip stream.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SubscriberError::decompression_failed("gzip stream", Some(e)))?;
    Ok(out)
}

/// Deflates into a gzip stream. Used to build compressed fixtures.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
