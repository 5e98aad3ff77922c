//! TCP command channel

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelHalves, ChannelReader, ChannelWriter};
use crate::wire::{RESPONSE_HEADER_SIZE, ResponseHeader};
use crate::{Result, SubscriberError};

/// Largest response accepted from the publisher.
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Command channel to a publisher at `host:port`.
#[derive(Debug, Clone)]
pub struct TcpChannel {
    address: String,
    connect_timeout: Duration,
}

impl TcpChannel {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), connect_timeout: Duration::from_secs(5) }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn connect(&self) -> Result<ChannelHalves> {
        debug!(address = %self.address, "Connecting command channel");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| SubscriberError::Timeout { duration: self.connect_timeout })?
            .map_err(|e| {
                let reason = format!("connect to {}", self.address);
                SubscriberError::transport_failed_with_source(reason, Box::new(e))
            })?;
        stream.set_nodelay(true)?;

        let peer =
            stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| self.address.clone());
        info!(peer = %peer, "Command channel connected");

        let (read, write) = stream.into_split();
        Ok(ChannelHalves {
            reader: Box::new(TcpFrameReader {
                half: read,
                buffer: BytesMut::with_capacity(64 * 1024),
            }),
            writer: Box::new(TcpCommandWriter { half: Mutex::new(Some(write)) }),
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Splits the byte stream into frames using the response header length.
struct TcpFrameReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
}

impl TcpFrameReader {
    /// Reads until `len` bytes are buffered. Returns false on clean EOF
    /// before any byte of a new frame arrived.
    async fn fill(&mut self, len: usize) -> Result<bool> {
        while self.buffer.len() < len {
            let read = self.half.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                return Err(SubscriberError::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "command channel closed mid-frame",
                )));
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ChannelReader for TcpFrameReader {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        if !self.fill(RESPONSE_HEADER_SIZE).await? {
            return Ok(None);
        }
        let payload_length =
            ResponseHeader::peek_payload_length(&self.buffer[..RESPONSE_HEADER_SIZE])?;
        if payload_length > MAX_RESPONSE_SIZE {
            return Err(SubscriberError::protocol_violation(format!(
                "response of {payload_length} bytes exceeds {MAX_RESPONSE_SIZE}"
            )));
        }

        let frame_length = RESPONSE_HEADER_SIZE + payload_length;
        self.buffer.reserve(frame_length.saturating_sub(self.buffer.len()));
        self.fill(frame_length).await?;
        Ok(Some(self.buffer.split_to(frame_length).freeze()))
    }
}

struct TcpCommandWriter {
    half: Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl ChannelWriter for TcpCommandWriter {
    async fn send(&self, packet: Bytes) -> Result<()> {
        let mut guard = self.half.lock().await;
        let half = guard.as_mut().ok_or(SubscriberError::NotConnected)?;
        half.write_all(&packet).await?;
        half.flush().await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut half) = self.half.lock().await.take() {
            let _ = half.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ServerCommand, ServerResponse};
    use crate::wire::encode_response;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_split_across_writes_are_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let subscribe = ServerCommand::Subscribe.code();
            let first = encode_response(ServerResponse::Succeeded, subscribe, b"subscribed");
            let second = encode_response(ServerResponse::Notify, 0, &[1, 2, 3, 4]);
            socket.write_all(&first[..3]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut rest = first[3..].to_vec();
            rest.extend_from_slice(&second);
            socket.write_all(&rest).await.unwrap();

            let mut command = [0u8; 1];
            socket.read_exact(&mut command).await.unwrap();
            command[0]
        });

        let mut halves = TcpChannel::new(address).connect().await.unwrap();
        let first = halves.reader.receive().await.unwrap().unwrap();
        assert_eq!(&first[6..], b"subscribed");
        let second = halves.reader.receive().await.unwrap().unwrap();
        assert_eq!(second[0], ServerResponse::Notify.code());

        halves.writer.send(Bytes::from_static(&[0x03])).await.unwrap();
        assert_eq!(server.await.unwrap(), 0x03);

        assert!(halves.reader.receive().await.unwrap().is_none());
        halves.writer.disconnect().await;
        assert!(matches!(
            halves.writer.send(Bytes::from_static(&[0x03])).await,
            Err(SubscriberError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_retryable_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpChannel::new(address).connect().await.err().unwrap();
        assert!(err.is_retryable());
    }
}
