//! Core protocol types.
//!
//! This module holds the vocabulary shared by every layer of the engine:
//!
//! - [`Ticks`] timestamps (100ns resolution)
//! - [`ServerCommand`] / [`ServerResponse`] wire codes
//! - bit-set types such as [`DataPacketFlags`] and [`OperationalModes`]
//! - decoded payloads: [`Measurement`] and [`BufferBlock`]
//! - the session [`ConnectionState`]
//!
//! ```rust
//! use feedline::types::{DataPacketFlags, OperationalModes, OperationalEncoding};
//!
//! let flags = DataPacketFlags::new(DataPacketFlags::SYNCHRONIZED | DataPacketFlags::COMPACT);
//! assert!(flags.is_synchronized() && flags.is_compact());
//!
//! let modes = OperationalModes::default().with_encoding(OperationalEncoding::Unicode);
//! assert_eq!(modes.encoding(), OperationalEncoding::Unicode);
//! ```

mod codes;
mod flags;
mod measurement;
mod state;
mod ticks;

pub use codes::{ServerCommand, ServerResponse};
pub use flags::{CompressionModes, DataPacketFlags, OperationalEncoding, OperationalModes};
pub use measurement::{BufferBlock, CompactStateFlags, Measurement, MeasurementStateFlags};
pub use state::ConnectionState;
pub use ticks::Ticks;
