//! UDP data channel

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::info;

use crate::Result;
use crate::channel::{ChannelReader, DataChannelFactory};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Binds a local UDP port; one datagram carries one response frame.
#[derive(Debug, Clone)]
pub struct UdpDataChannelFactory {
    bind_host: String,
}

impl UdpDataChannelFactory {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self { bind_host: bind_host.into() }
    }
}

impl Default for UdpDataChannelFactory {
    fn default() -> Self {
        Self::new("0.0.0.0")
    }
}

#[async_trait]
impl DataChannelFactory for UdpDataChannelFactory {
    async fn open(&self, port: u16) -> Result<Box<dyn ChannelReader>> {
        let socket = UdpSocket::bind((self.bind_host.as_str(), port)).await?;
        info!(local = ?socket.local_addr().ok(), "Data channel listening");
        Ok(Box::new(UdpDataReader { socket, buffer: vec![0u8; MAX_DATAGRAM_SIZE] }))
    }
}

struct UdpDataReader {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

#[async_trait]
impl ChannelReader for UdpDataReader {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        let (len, _) = self.socket.recv_from(&mut self.buffer).await?;
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..len])))
    }
}
