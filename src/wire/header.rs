//! Response header parsing and command packet framing

use bytes::{BufMut, Bytes, BytesMut};

use super::PacketReader;
use crate::types::{ServerCommand, ServerResponse};
use crate::{Result, SubscriberError};

/// Size of the fixed header leading every response.
pub const RESPONSE_HEADER_SIZE: usize = 6;

/// Fixed header of an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub response: ServerResponse,
    /// Raw command code the response refers to.
    pub command_code: u8,
    pub payload_length: usize,
}

impl ResponseHeader {
    /// Command the response refers to, when the code is a known command.
    pub fn command(&self) -> Option<ServerCommand> {
        ServerCommand::from_code(self.command_code)
    }

    /// Reads the declared payload length from the first header bytes without
    /// validating the response code. Used by stream transports for framing.
    pub fn peek_payload_length(header: &[u8]) -> Result<usize> {
        let mut reader = PacketReader::new(header, "response header");
        reader.skip(2)?;
        let length = reader.read_u32()?;
        usize::try_from(length)
            .map_err(|_| {
                SubscriberError::protocol_violation(format!("payload length {length} too large"))
            })
    }
}

/// Splits a received frame into header and payload.
pub fn parse_response(frame: &[u8]) -> Result<(ResponseHeader, &[u8])> {
    let mut reader = PacketReader::new(frame, "response header");
    let code = reader.read_u8()?;
    let command_code = reader.read_u8()?;
    let payload_length = reader.read_u32()? as usize;

    let response = ServerResponse::from_code(code)
        .ok_or_else(|| {
            SubscriberError::protocol_violation(format!("unknown response code {code:#04x}"))
        })?;

    if payload_length > reader.remaining() {
        return Err(SubscriberError::protocol_violation(format!(
            "{response} declares {payload_length} payload bytes but frame carries {}",
            reader.remaining()
        )));
    }

    let payload = reader.read_bytes(payload_length)?;
    Ok((ResponseHeader { response, command_code, payload_length }, payload))
}

/// Builds an outbound command packet: command byte followed by payload.
pub fn encode_command(command: ServerCommand, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(command.code());
    buf.put_slice(payload);
    buf.freeze()
}

/// Builds an inbound response frame. Used by tests and in-memory channels.
pub fn encode_response(response: ServerResponse, command_code: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    buf.put_u8(response.code());
    buf.put_u8(command_code);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
