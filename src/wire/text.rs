//! Encoding and decoding of wire strings

use bytes::{BufMut, BytesMut};

use crate::types::OperationalEncoding;
use crate::{Result, SubscriberError};

/// Encodes `text` with the negotiated encoding.
pub fn encode(text: &str, encoding: OperationalEncoding) -> Vec<u8> {
    match encoding {
        OperationalEncoding::Utf8 => text.as_bytes().to_vec(),
        OperationalEncoding::Unicode => {
            text.encode_utf16().flat_map(u16::to_le_bytes).collect()
        }
        OperationalEncoding::BigEndianUnicode => {
            text.encode_utf16().flat_map(u16::to_be_bytes).collect()
        }
        OperationalEncoding::Ansi => {
            text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')).collect()
        }
    }
}

/// Decodes `bytes` with the negotiated encoding.
pub fn decode(bytes: &[u8], encoding: OperationalEncoding) -> Result<String> {
    match encoding {
        OperationalEncoding::Utf8 => String::from_utf8(bytes.to_vec())
            .map_err(|e| SubscriberError::decode_error("utf-8 text", e.to_string())),
        OperationalEncoding::Unicode => decode_utf16(bytes, u16::from_le_bytes),
        OperationalEncoding::BigEndianUnicode => decode_utf16(bytes, u16::from_be_bytes),
        OperationalEncoding::Ansi => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(SubscriberError::decode_error(
            "utf-16 text",
            format!("odd byte length {}", bytes.len()),
        ));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]])).collect();
    String::from_utf16(&units)
        .map_err(|e| SubscriberError::decode_error("utf-16 text", e.to_string()))
}

/// Appends a 4-byte big-endian length followed by the encoded text.
pub fn put_sized_string(buf: &mut BytesMut, text: &str, encoding: OperationalEncoding) {
    let encoded = encode(text, encoding);
    buf.put_u32(encoded.len() as u32);
    buf.put_slice(&encoded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_variants_differ_in_byte_order() {
        let le = encode("A", OperationalEncoding::Unicode);
        let be = encode("A", OperationalEncoding::BigEndianUnicode);
        assert_eq!(le, vec![0x41, 0x00]);
        assert_eq!(be, vec![0x00, 0x41]);
        assert_eq!(decode(&le, OperationalEncoding::Unicode).unwrap(), "A");
        assert_eq!(decode(&be, OperationalEncoding::BigEndianUnicode).unwrap(), "A");
    }

    #[test]
    fn odd_length_utf16_is_rejected() {
        assert!(decode(&[0x41], OperationalEncoding::Unicode).is_err());
    }

    #[test]
    fn ansi_replaces_unrepresentable_characters() {
        assert_eq!(encode("a\u{2603}", OperationalEncoding::Ansi), vec![b'a', b'?']);
        assert_eq!(decode(&[0xE9], OperationalEncoding::Ansi).unwrap(), "\u{e9}");
    }

    #[test]
    fn sized_string_has_length_prefix() {
        let mut buf = BytesMut::new();
        put_sized_string(&mut buf, "abc", OperationalEncoding::Utf8);
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
