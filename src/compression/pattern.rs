//! 32-bit pattern decompression
//!
//! Stream layout: one header byte, then 32-bit little-endian words. A header
//! byte of `0xE0` or above means the rest is stored uncompressed. Otherwise
//! its low five bits give the compression strength (back-reference queue
//! length minus one), the first word is stored verbatim, and every following
//! word is a key byte plus up to four literal bytes:
//!
//! - `key >> 5`: number of low-order bytes that differ from the referenced word
//! - `key & 0x1F`: index of the referenced word in the queue

use crate::{Result, SubscriberError};

const UNCOMPRESSED_MARKER: u8 = 0xE0;
const MAX_STRENGTH: u8 = 31;

/// Expands a pattern-compressed buffer into its 32-bit little-endian words.
pub fn decompress_pattern(source: &[u8]) -> Result<Vec<u8>> {
    let Some((&header, body)) = source.split_first() else {
        return Err(SubscriberError::decompression_failed("empty pattern stream", None));
    };

    if header >= UNCOMPRESSED_MARKER {
        return Ok(body.to_vec());
    }

    let strength = header & 0x1F;
    let queue_length = usize::from(strength) + 1;

    let first = body
        .get(0..4)
        .ok_or_else(|| {
            SubscriberError::decompression_failed("pattern stream missing first word", None)
        })?;
    let mut queue: Vec<[u8; 4]> = Vec::with_capacity(queue_length);
    let mut queue_start = 0usize;
    let mut out = Vec::with_capacity(body.len() * 2);

    let first = [first[0], first[1], first[2], first[3]];
    out.extend_from_slice(&first);
    queue.push(first);

    let mut position = 4usize;
    while position < body.len() {
        let key = body[position];
        position += 1;

        let differing = usize::from(key >> 5);
        let back_reference = usize::from(key & 0x1F);

        if differing > 4 {
            return Err(SubscriberError::decompression_failed(
                format!("invalid pattern key {key:#04x}: {differing} literal bytes"),
                None,
            ));
        }
        if back_reference >= queue.len() {
            return Err(SubscriberError::decompression_failed(
                format!("back-reference {back_reference} beyond queue of {}", queue.len()),
                None,
            ));
        }

        let literal = body.get(position..position + differing).ok_or_else(|| {
            SubscriberError::decompression_failed("pattern stream ends inside a literal", None)
        })?;
        position += differing;

        let mut word = queue[back_reference];
        word[..differing].copy_from_slice(literal);
        out.extend_from_slice(&word);

        if queue.len() < queue_length {
            queue.push(word);
        } else {
            queue[queue_start] = word;
            queue_start = (queue_start + 1) % queue_length;
        }
    }

    Ok(out)
}

/// Encodes words without exploiting repetition: every word after the first
/// is a full four-byte literal referencing slot 0.
pub fn encode_literal_pattern(words: &[u32], strength: u8) -> Vec<u8> {
    let strength = strength.min(MAX_STRENGTH);
    let mut out = Vec::with_capacity(1 + words.len() * 5);
    out.push(strength);
    if let Some((first, rest)) = words.split_first() {
        out.extend_from_slice(&first.to_le_bytes());
        for word in rest {
            out.push(4 << 5);
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}
