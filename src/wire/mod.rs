//! Binary framing shared by every channel
//!
//! All multi-byte integers on the wire are big-endian unless a codec states
//! otherwise.

mod header;
mod reader;
pub mod text;

pub use header::{
    RESPONSE_HEADER_SIZE, ResponseHeader, encode_command, encode_response, parse_response,
};
pub use reader::PacketReader;
