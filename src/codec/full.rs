//! Full-fidelity measurement records
//!
//! `point id u32 | source (i32 len + bytes) | signal id [16] | tag (i32 len +
//! bytes) | value f64 | adder f64 | multiplier f64 | timestamp i64 | flags u32`

use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use crate::types::{Measurement, MeasurementStateFlags, OperationalEncoding, Ticks};
use crate::wire::{PacketReader, text};
use crate::Result;

/// Fixed-size portion of a record, excluding the two string bodies.
pub const FULL_RECORD_FIXED_SIZE: usize = 64;

pub fn decode_full(
    reader: &mut PacketReader<'_>,
    encoding: OperationalEncoding,
) -> Result<Measurement> {
    let point_id = reader.read_u32()?;
    let source = text::decode(reader.read_sized_bytes()?, encoding)?;
    let signal_id = reader.read_guid()?;
    let tag = text::decode(reader.read_sized_bytes()?, encoding)?;
    let value = reader.read_f64()?;
    let adder = reader.read_f64()?;
    let multiplier = reader.read_f64()?;
    let timestamp = Ticks(reader.read_i64()?);
    let flags = MeasurementStateFlags(reader.read_u32()?);

    Ok(Measurement {
        signal_id,
        source: Arc::from(source),
        point_id,
        tag: (!tag.is_empty()).then_some(tag),
        timestamp,
        value,
        flags,
        adder: Some(adder),
        multiplier: Some(multiplier),
    })
}

pub fn encode_full(buf: &mut BytesMut, measurement: &Measurement, encoding: OperationalEncoding) {
    buf.put_u32(measurement.point_id);
    text::put_sized_string(buf, &measurement.source, encoding);
    buf.put_slice(measurement.signal_id.as_bytes());
    text::put_sized_string(buf, measurement.tag.as_deref().unwrap_or_default(), encoding);
    buf.put_f64(measurement.value);
    buf.put_f64(measurement.adder.unwrap_or(0.0));
    buf.put_f64(measurement.multiplier.unwrap_or(1.0));
    buf.put_i64(measurement.timestamp.0);
    buf.put_u32(measurement.flags.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        #[test]
        fn encoded_record_decodes_to_the_same_measurement(
            id in any::<u128>(),
            point_id in any::<u32>(),
            source in "[A-Z]{0,8}",
            tag in "[a-z_]{0,12}",
            value in any::<f64>().prop_filter("nan never compares equal", |v| !v.is_nan()),
            adder in -1e6f64..1e6,
            multiplier in -1e6f64..1e6,
            timestamp in any::<i64>(),
            flags in any::<u32>(),
        ) {
            let measurement = Measurement {
                signal_id: Uuid::from_u128(id),
                source: Arc::from(source.as_str()),
                point_id,
                tag: (!tag.is_empty()).then_some(tag),
                timestamp: Ticks(timestamp),
                value,
                flags: MeasurementStateFlags(flags),
                adder: Some(adder),
                multiplier: Some(multiplier),
            };

            let mut buf = BytesMut::new();
            encode_full(&mut buf, &measurement, OperationalEncoding::Utf8);
            let tag_length = measurement.tag.as_deref().map_or(0, str::len);
            prop_assert_eq!(
                buf.len(),
                FULL_RECORD_FIXED_SIZE + measurement.source.len() + tag_length
            );

            let mut reader = PacketReader::new(&buf, "full record");
            let decoded = decode_full(&mut reader, OperationalEncoding::Utf8).unwrap();
            prop_assert!(reader.is_empty());
            prop_assert_eq!(decoded, measurement);
        }
    }

    #[test]
    fn truncated_record_fails() {
        let measurement = Measurement {
            signal_id: Uuid::from_u128(1),
            source: Arc::from("PPA"),
            point_id: 1,
            tag: None,
            timestamp: Ticks(1),
            value: 60.0,
            flags: MeasurementStateFlags::default(),
            adder: Some(0.0),
            multiplier: Some(1.0),
        };
        let mut buf = BytesMut::new();
        encode_full(&mut buf, &measurement, OperationalEncoding::Utf8);
        let mut reader = PacketReader::new(&buf[..buf.len() - 1], "full record");
        assert!(decode_full(&mut reader, OperationalEncoding::Utf8).is_err());
    }
}
