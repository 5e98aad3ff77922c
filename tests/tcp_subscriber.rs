//! End-to-end session over a loopback TCP publisher.

use bytes::{BufMut, BytesMut};
use feedline::codec::{BaseTimeOffsets, CompactContext, encode_compact};
use feedline::compression::gzip;
use feedline::wire::encode_response;
use feedline::{
    ConnectionState, DataPacketFlags, DataSubscriber, Measurement, MeasurementStateFlags,
    OperationalEncoding, ServerCommand, ServerResponse, SignalEntry, SignalIndexCache,
    SubscriberConfig, SubscriptionDescriptor, TcpChannel, Ticks,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn cache() -> SignalIndexCache {
    SignalIndexCache::new(
        Uuid::from_u128(7),
        (0u16..2).map(|index| {
            (
                index,
                SignalEntry {
                    signal_id: Uuid::from_u128(0x2000 + u128::from(index)),
                    source: Arc::from("DEVARCHIVE"),
                    point_id: u32::from(index) + 100,
                },
            )
        }),
        Vec::new(),
    )
}

fn measurement(index: u16, value: f64, timestamp: Ticks) -> Measurement {
    Measurement {
        signal_id: Uuid::from_u128(0x2000 + u128::from(index)),
        source: Arc::from("DEVARCHIVE"),
        point_id: u32::from(index) + 100,
        tag: None,
        timestamp,
        value,
        flags: MeasurementStateFlags::default(),
        adder: None,
        multiplier: None,
    }
}

async fn read_command(socket: &mut TcpStream, payload_length: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 1 + payload_length];
    socket.read_exact(&mut packet).await.unwrap();
    packet
}

async fn read_subscribe(socket: &mut TcpStream) -> (u8, String) {
    let mut head = [0u8; 6];
    socket.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], ServerCommand::Subscribe.code());
    let length = u32::from_be_bytes([head[2], head[3], head[4], head[5]]) as usize;
    let mut text = vec![0u8; length];
    socket.read_exact(&mut text).await.unwrap();
    (head[1], String::from_utf8(text).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remotely_synchronized_subscription_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let frame_time = Ticks(638_500_000_000_000_000);

    let publisher = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let modes = read_command(&mut socket, 4).await;
        assert_eq!(modes[0], ServerCommand::DefineOperationalModes.code());

        let (flags, connection_string) = read_subscribe(&mut socket).await;
        assert!(DataPacketFlags::new(flags).is_synchronized());
        assert!(connection_string.contains("framesPerSecond=30"));

        let cache = cache();
        let sic = gzip(&cache.encode(OperationalEncoding::Utf8)).unwrap();

        let base_times = BaseTimeOffsets::default();
        let ctx = CompactContext {
            cache: &cache,
            base_times: &base_times,
            include_time: false,
            use_millisecond_resolution: false,
            frame_timestamp: Some(frame_time),
        };
        let mut packet = BytesMut::new();
        packet.put_u8(DataPacketFlags::SYNCHRONIZED | DataPacketFlags::COMPACT);
        packet.put_i64(frame_time.0);
        packet.put_u32(2);
        encode_compact(&mut packet, 0, &measurement(0, 59.95, frame_time), &ctx);
        encode_compact(&mut packet, 1, &measurement(1, 120.5, frame_time), &ctx);

        let subscribe = ServerCommand::Subscribe.code();
        let mut out = BytesMut::new();
        out.put_slice(&encode_response(ServerResponse::Succeeded, subscribe, b"subscribed"));
        out.put_slice(&encode_response(ServerResponse::UpdateSignalIndexCache, subscribe, &sic));
        out.put_slice(&encode_response(ServerResponse::DataPacket, 0, &packet));
        socket.write_all(&out).await.unwrap();

        // Hold the socket open until the subscriber hangs up.
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let filter = "FILTER ActiveMeasurements WHERE SignalType='FREQ'";
    let config = SubscriberConfig::new(address.clone())
        .with_subscription(SubscriptionDescriptor::remotely_synchronized(filter, 30));
    let subscriber = DataSubscriber::builder(config)
        .channel(TcpChannel::new(address))
        .without_data_channels()
        .build()
        .unwrap();
    let mut measurements = subscriber.measurements().boxed();
    subscriber.start().unwrap();

    let batch = tokio::time::timeout(WAIT, measurements.next()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|m| m.timestamp == frame_time));
    assert_eq!(batch[1].point_id, 101);
    assert!((batch[0].value - 59.95).abs() < 1e-4);

    assert_eq!(subscriber.state(), ConnectionState::Subscribed);
    assert_eq!(subscriber.signal_index_cache().unwrap().len(), 2);

    subscriber.stop().await;
    tokio::time::timeout(WAIT, publisher).await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_publisher_reports_and_gives_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut config = SubscriberConfig::new(address).with_reconnect_delay(Duration::from_millis(10));
    config.max_connection_attempts = Some(2);
    let subscriber = DataSubscriber::builder(config).without_data_channels().build().unwrap();
    let mut events = subscriber.events().boxed();
    subscriber.start().unwrap();

    let mut warnings = 0;
    let terminated = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.next().await {
            match event {
                feedline::SubscriberEvent::StatusMessage(message)
                    if message.contains("Connection attempt") =>
                {
                    warnings += 1;
                }
                feedline::SubscriberEvent::ConnectionTerminated => return true,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();

    assert!(terminated);
    assert_eq!(warnings, 2);
}
