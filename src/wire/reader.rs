//! Bounds-checked cursor over a received payload

use uuid::Uuid;

use crate::{Result, SubscriberError};

/// Big-endian cursor that never reads past the end of its slice.
///
/// Every read either returns the value and advances, or fails with
/// [`SubscriberError::Truncated`] and leaves the position untouched.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
    context: &'static str,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self { data, position: 0, context }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(len);
        let slice = end
            .and_then(|end| self.data.get(self.position..end))
            .ok_or_else(|| SubscriberError::truncated(self.context, len, self.remaining()))?;
        self.position += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_array().map(f32::from_be_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_array().map(f64::from_be_bytes)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// 16-byte identifier in RFC 4122 byte order.
    pub fn read_guid(&mut self) -> Result<Uuid> {
        self.read_array().map(Uuid::from_bytes)
    }

    /// Length-prefixed (`i32`) byte run. Negative lengths are rejected.
    pub fn read_sized_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| {
            SubscriberError::decode_error(self.context, format!("negative length prefix {len}"))
        })?;
        self.read_bytes(len)
    }
}
