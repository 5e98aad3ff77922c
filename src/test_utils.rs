//! Test utilities: an in-memory publisher, a recording writer and packet builders
//!
//! These helpers are shared by unit tests, integration tests and benchmarks so
//! that every test speaks the same wire format the engine parses.

#![cfg(any(test, feature = "benchmark"))]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelHalves, ChannelReader, ChannelWriter};
use crate::{Result, SubscriberError};

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Writer that keeps every packet it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingWriter {
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingWriter {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChannelWriter for RecordingWriter {
    async fn send(&self, packet: Bytes) -> Result<()> {
        self.sent.lock().push(packet);
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Publisher side of one in-memory connection.
pub struct PublisherConnection {
    commands: mpsc::UnboundedReceiver<Bytes>,
    responses: Option<mpsc::UnboundedSender<Bytes>>,
}

impl PublisherConnection {
    /// Next command packet sent by the subscriber, `None` once it disconnected.
    pub async fn next_command(&mut self) -> Option<Bytes> {
        self.commands.recv().await
    }

    /// Delivers a response frame to the subscriber.
    pub fn respond(&self, frame: Bytes) {
        if let Some(responses) = &self.responses {
            let _ = responses.send(frame);
        }
    }

    /// Closes the connection from the publisher side.
    pub fn close(&mut self) {
        self.responses = None;
    }
}

/// Accepts connections made through the paired [`MemoryChannel`].
pub struct MemoryPublisher {
    connections: mpsc::UnboundedReceiver<PublisherConnection>,
}

impl MemoryPublisher {
    pub async fn accept(&mut self) -> Option<PublisherConnection> {
        self.connections.recv().await
    }
}

/// Scripted in-memory command channel.
#[derive(Clone)]
pub struct MemoryChannel {
    connections: mpsc::UnboundedSender<PublisherConnection>,
    refusals: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryChannel {
    pub fn pair() -> (Self, MemoryPublisher) {
        let (connections, accepted) = mpsc::unbounded_channel();
        let channel = Self {
            connections,
            refusals: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (channel, MemoryPublisher { connections: accepted })
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn connect(&self) -> Result<ChannelHalves> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SubscriberError::transport_failed("connection refused"));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        self.connections
            .send(PublisherConnection { commands: command_rx, responses: Some(response_tx) })
            .map_err(|_| SubscriberError::transport_failed("publisher is gone"))?;

        Ok(ChannelHalves {
            reader: Box::new(MemoryReader { responses: response_rx }),
            writer: Box::new(MemoryWriter { commands: Mutex::new(Some(command_tx)) }),
        })
    }

    fn describe(&self) -> String {
        "memory://publisher".to_string()
    }
}

struct MemoryReader {
    responses: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl ChannelReader for MemoryReader {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self.responses.recv().await)
    }
}

struct MemoryWriter {
    commands: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[async_trait]
impl ChannelWriter for MemoryWriter {
    async fn send(&self, packet: Bytes) -> Result<()> {
        let guard = self.commands.lock();
        let commands = guard.as_ref().ok_or(SubscriberError::NotConnected)?;
        commands.send(packet).map_err(|_| {
            let hangup = io::Error::new(io::ErrorKind::ConnectionReset, "publisher hung up");
            SubscriberError::from(hangup)
        })
    }

    async fn disconnect(&self) {
        self.commands.lock().take();
    }
}

/// Builders for every response kind, matching the publisher's encoding.
pub mod packets {
    use super::*;
    use crate::cipher::{CipherKey, CipherKeySet, SharedSecret};
    use crate::codec::{BaseTimeOffsets, CompactContext, encode_compact, encode_full};
    use crate::compression::gzip;
    use crate::signal_index::{SignalEntry, SignalIndexCache};
    use crate::types::{
        DataPacketFlags, Measurement, MeasurementStateFlags, OperationalEncoding, ServerCommand,
        ServerResponse, Ticks,
    };
    use crate::wire::{encode_command, encode_response};
    use uuid::Uuid;

    pub fn response(response: ServerResponse, command_code: u8, payload: &[u8]) -> Bytes {
        encode_response(response, command_code, payload)
    }

    /// Command packet as the subscriber sends it.
    pub fn command(command: ServerCommand, payload: &[u8]) -> Bytes {
        encode_command(command, payload)
    }

    pub fn succeeded(command: ServerCommand, message: &str) -> Bytes {
        succeeded_raw(command, message.as_bytes())
    }

    pub fn succeeded_raw(command: ServerCommand, payload: &[u8]) -> Bytes {
        response(ServerResponse::Succeeded, command.code(), payload)
    }

    pub fn failed(command: ServerCommand, message: &str) -> Bytes {
        response(ServerResponse::Failed, command.code(), message.as_bytes())
    }

    pub fn notify(hash: [u8; 4], message: &str) -> Bytes {
        let mut payload = hash.to_vec();
        payload.extend_from_slice(message.as_bytes());
        response(ServerResponse::Notify, 0, &payload)
    }

    pub fn buffer_block(sequence_number: u32, runtime_index: u16, data: &[u8]) -> Bytes {
        let mut payload = BytesMut::with_capacity(6 + data.len());
        payload.put_u32(sequence_number);
        payload.put_u16(runtime_index);
        payload.put_slice(data);
        response(ServerResponse::BufferBlock, 0, &payload)
    }

    pub fn base_times(base_times: &BaseTimeOffsets) -> Bytes {
        response(ServerResponse::UpdateBaseTimes, 0, &base_times.encode())
    }

    pub fn signal_index_cache(cache: &SignalIndexCache, compressed: bool) -> Bytes {
        let mut body = cache.encode(OperationalEncoding::Utf8);
        if compressed {
            body = gzip(&body).expect("gzip into memory");
        }
        response(ServerResponse::UpdateSignalIndexCache, ServerCommand::Subscribe.code(), &body)
    }

    /// Rotation payload; `secret` applies the outer encryption of an authenticated session.
    pub fn cipher_keys(keys: &CipherKeySet, secret: Option<&SharedSecret>) -> Bytes {
        let records = keys.encode();
        let mut payload = vec![0u8];
        match secret {
            Some(secret) => payload.extend(secret.encrypt(&records).expect("encrypt key records")),
            None => payload.extend(records),
        }
        response(ServerResponse::UpdateCipherKeys, 0, &payload)
    }

    /// Signal ids `0x1000 + index` for runtime indexes `0..3`.
    pub fn sample_cache() -> SignalIndexCache {
        SignalIndexCache::new(
            Uuid::from_u128(0xFEED),
            (0u16..3).map(|index| {
                (
                    index,
                    SignalEntry {
                        signal_id: sample_signal_id(index),
                        source: Arc::from("PPA"),
                        point_id: u32::from(index) + 1,
                    },
                )
            }),
            vec![Uuid::from_u128(0xDEAD)],
        )
    }

    pub fn sample_signal_id(index: u16) -> Uuid {
        Uuid::from_u128(0x1000 + u128::from(index))
    }

    pub fn sample_keys() -> CipherKeySet {
        CipherKeySet::new(
            CipherKey::new(vec![0x11; 32], vec![0x22; 16]).expect("valid even key"),
            CipherKey::new(vec![0x33; 32], vec![0x44; 16]).expect("valid odd key"),
        )
    }

    pub fn measurement(index: u16, value: f64, timestamp: Ticks) -> Measurement {
        Measurement {
            signal_id: sample_signal_id(index),
            source: Arc::from("PPA"),
            point_id: u32::from(index) + 1,
            tag: None,
            timestamp,
            value,
            flags: MeasurementStateFlags::default(),
            adder: None,
            multiplier: None,
        }
    }

    /// Synchronized compact packet: one frame timestamp, records without time.
    pub fn synchronized_compact_payload(frame_time: Ticks, values: &[(u16, f64)]) -> Vec<u8> {
        let cache = sample_cache();
        let base_times = BaseTimeOffsets::default();
        let ctx = CompactContext {
            cache: &cache,
            base_times: &base_times,
            include_time: false,
            use_millisecond_resolution: false,
            frame_timestamp: Some(frame_time),
        };

        let mut buf = BytesMut::new();
        buf.put_u8(DataPacketFlags::SYNCHRONIZED | DataPacketFlags::COMPACT);
        buf.put_i64(frame_time.0);
        buf.put_u32(values.len() as u32);
        for (index, value) in values {
            encode_compact(&mut buf, *index, &measurement(*index, *value, frame_time), &ctx);
        }
        buf.to_vec()
    }

    pub fn synchronized_compact_packet(frame_time: Ticks, values: &[(u16, f64)]) -> Bytes {
        response(ServerResponse::DataPacket, 0, &synchronized_compact_payload(frame_time, values))
    }

    /// Unsynchronized packet of full-fidelity records.
    pub fn full_packet(measurements: &[Measurement]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(measurements.len() as u32);
        for measurement in measurements {
            encode_full(&mut buf, measurement, OperationalEncoding::Utf8);
        }
        response(ServerResponse::DataPacket, 0, &buf)
    }
}
