//! Transport abstraction consumed by the engine
//!
//! A [`Channel`] knows how to connect; the connection it returns is split
//! into a [`ChannelReader`] owned by the session task and a shared
//! [`ChannelWriter`] used by command senders. Each `receive()` yields one
//! complete response frame (header plus payload).

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Reading half of a connected channel.
#[async_trait]
pub trait ChannelReader: Send + 'static {
    /// Next response frame.
    ///
    /// - `Ok(Some(frame))`: a frame arrived
    /// - `Ok(None)`: the remote side closed the channel
    /// - `Err(e)`: transport fault
    async fn receive(&mut self) -> Result<Option<Bytes>>;
}

/// Writing half of a connected channel.
#[async_trait]
pub trait ChannelWriter: Send + Sync + 'static {
    /// Sends one command packet.
    async fn send(&self, packet: Bytes) -> Result<()>;

    /// Closes the connection. Safe to call more than once.
    async fn disconnect(&self);
}

/// Both halves of a freshly connected channel.
pub struct ChannelHalves {
    pub reader: Box<dyn ChannelReader>,
    pub writer: Box<dyn ChannelWriter>,
}

/// Connection-oriented command channel.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn connect(&self) -> Result<ChannelHalves>;

    /// Human-readable endpoint for logs and status messages.
    fn describe(&self) -> String;
}

/// Opens the optional connectionless data channel.
#[async_trait]
pub trait DataChannelFactory: Send + Sync + 'static {
    async fn open(&self, port: u16) -> Result<Box<dyn ChannelReader>>;
}
