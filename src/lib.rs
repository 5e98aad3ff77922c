//! Client-side subscription engine for real-time time-series publishers.
//!
//! Feedline connects to a measurement publisher over a framed command
//! channel, negotiates operational modes, optionally authenticates with a
//! shared secret, subscribes to a filtered set of signals and decodes the
//! resulting data packets into [`Measurement`] batches.
//!
//! # Features
//!
//! - **Async session**: one Tokio task owns the connect cycle, reconnects and the data-loss monitor
//! - **Lock-free decoding**: signal index cache, cipher keys and base times are swapped atomically
//! - **Buffer blocks**: in-order delivery with acknowledgements and a reordering window capped at
//!   [`reassembly::MAX_PENDING_BLOCKS`]
//! - **Pluggable transport**: TCP command channel and UDP data channels by default
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use feedline::{DataSubscriber, SubscriberConfig, SubscriberEvent, SubscriptionDescriptor};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> feedline::Result<()> {
//!     let filter = "FILTER ActiveMeasurements WHERE SignalType='FREQ'";
//!     let config = SubscriberConfig::new("127.0.0.1:6165")
//!         .with_subscription(SubscriptionDescriptor::remotely_synchronized(filter, 30));
//!     let subscriber = DataSubscriber::tcp(config)?;
//!     let mut events = Box::pin(subscriber.events());
//!     subscriber.start()?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             SubscriberEvent::NewMeasurements(batch) => println!("{} measurements", batch.len()),
//!             SubscriberEvent::StatusMessage(message) => println!("{message}"),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;
pub mod wire;

// Decoding
pub mod cipher;
pub mod codec;
pub mod compression;
pub mod decoder;
pub mod signal_index;

// Session state
pub mod config;
pub mod events;
pub mod monitor;
pub mod pending;
pub mod rate_limit;
pub mod reassembly;
pub mod request;
pub mod sink;
pub mod statistics;

// Connection and transport
pub mod channel;
pub mod connection;
mod dispatcher;
mod driver;
mod session;
pub mod transport;

// Core exports
pub use error::*;
pub use types::*;

pub use channel::{Channel, ChannelHalves, ChannelReader, ChannelWriter, DataChannelFactory};
pub use cipher::{CipherKey, CipherKeyManager, CipherKeySet, SharedSecret};
pub use codec::{CompactCodec, PatternCompactCodec};
pub use config::{OperationalModesConfig, SecurityMode, SubscriberConfig};
pub use connection::{DataSubscriber, DataSubscriberBuilder};
pub use decoder::{DecodeSettings, DecodedPacket, MeasurementDecoder};
pub use events::SubscriberEvent;
pub use monitor::DataLossMonitor;
pub use request::{
    FrameSettings, SubscriptionDescriptor, SubscriptionRequest, SubscriptionRequestBuilder,
    Synchronization,
};
pub use signal_index::{SignalEntry, SignalIndexCache};
pub use sink::{DownsamplingMethod, MeasurementSink, TimeAlignmentSettings};
pub use statistics::{StatisticsSnapshot, StatisticsTracker};
pub use transport::{TcpChannel, UdpDataChannelFactory};
