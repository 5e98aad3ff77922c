//! Response routing
//!
//! Every inbound frame, from either channel, passes through
//! [`ResponseDispatcher::dispatch`]. Failures inside a handler are reported as
//! process exceptions and never end the read loop.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::codec::BaseTimeOffsets;
use crate::compression::gunzip;
use crate::events::SubscriberEvent;
use crate::session::Session;
use crate::signal_index::SignalIndexCache;
use crate::types::{BufferBlock, ServerCommand, ServerResponse, Ticks};
use crate::wire::{PacketReader, ResponseHeader, parse_response, text};
use crate::{Result, SubscriberError};

const RESPONSE_FAILURE_CONTEXT: &str = "Failed to process publisher response packet";

pub(crate) struct ResponseDispatcher {
    session: Arc<Session>,
}

impl ResponseDispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Handles one complete response frame.
    pub async fn dispatch(&self, frame: Bytes) {
        self.session.statistics.record_bytes(frame.len());
        self.session.monitor.record_bytes(frame.len());

        if let Err(error) = self.handle(frame).await {
            self.session.exception(RESPONSE_FAILURE_CONTEXT, error);
        }
    }

    async fn handle(&self, frame: Bytes) -> Result<()> {
        let (header, payload) = parse_response(&frame)?;
        let payload = frame.slice_ref(payload);
        let session = &self.session;

        let solicited = session.pending.resolve(header.response, header.command_code);
        let command = header.command();
        trace!(
            response = %header.response,
            command = header.command_code,
            solicited,
            "Publisher response"
        );

        if solicited
            && command == Some(ServerCommand::Unsubscribe)
            && header.response == ServerResponse::Succeeded
        {
            session.on_unsubscribed();
        }

        match (command, header.response) {
            (Some(ServerCommand::User(index)), response)
            | (_, response @ ServerResponse::User(index)) => {
                session.events.emit(SubscriberEvent::UserResponse {
                    index,
                    response,
                    solicited,
                    payload: payload.clone(),
                });
            }
            _ => session.events.emit(SubscriberEvent::ServerResponse {
                response: header.response,
                command_code: header.command_code,
            }),
        }

        match header.response {
            ServerResponse::Succeeded => self.succeeded(&header, command, solicited, payload).await,
            ServerResponse::Failed => self.failed(&header, solicited, &payload),
            ServerResponse::DataPacket => self.data_packet(&payload),
            ServerResponse::BufferBlock => self.buffer_block(&payload).await,
            ServerResponse::DataStartTime => {
                let start = PacketReader::new(&payload, "data start time").read_i64()?;
                session.events.emit(SubscriberEvent::DataStartTime(Ticks(start)));
                Ok(())
            }
            ServerResponse::ProcessingComplete => {
                let source = self.message(&payload);
                session.events.status(format!("Publisher processing complete: {source}"));
                session.events.emit(SubscriberEvent::ProcessingComplete(source));
                Ok(())
            }
            ServerResponse::UpdateSignalIndexCache => self.update_signal_index_cache(&payload),
            ServerResponse::UpdateBaseTimes => {
                let base_times = BaseTimeOffsets::parse(&payload)?;
                debug!(time_index = base_times.time_index, "Base time offsets updated");
                session.decoder.set_base_times(base_times);
                Ok(())
            }
            ServerResponse::UpdateCipherKeys => self.update_cipher_keys(&payload),
            ServerResponse::Notify => self.notify(&payload).await,
            ServerResponse::ConfigurationChanged => {
                session
                    .events
                    .status("Received notification from publisher that configuration has changed.");
                session.events.emit(SubscriberEvent::ServerConfigurationChanged);
                if session.config.auto_connect && session.config.auto_request_metadata {
                    session.refresh_metadata(session.config.metadata_filters.as_deref()).await?;
                }
                Ok(())
            }
            ServerResponse::User(_) | ServerResponse::NoOp => Ok(()),
        }
    }

    async fn succeeded(
        &self,
        header: &ResponseHeader,
        command: Option<ServerCommand>,
        solicited: bool,
        payload: Bytes,
    ) -> Result<()> {
        let session = &self.session;
        let label = command_label(header, command);

        if !solicited {
            return match command {
                Some(ServerCommand::MetadataRefresh) => {
                    session.events.status(format!(
                        "Received server confirmation for unsolicited request to \
                         \"{label}\" command: latest metadata received."
                    ));
                    self.metadata(&payload)
                }
                Some(ServerCommand::RotateCipherKeys) => {
                    session.events.status(format!(
                        "Received server confirmation for unsolicited request to \"{label}\" \
                         command: {}",
                        self.message(&payload)
                    ));
                    Ok(())
                }
                Some(ServerCommand::Subscribe) => {
                    session.events.status(format!(
                        "Received unsolicited response to \"{label}\" command: {}",
                        self.message(&payload)
                    ));
                    Ok(())
                }
                _ => Err(SubscriberError::protocol_violation(format!(
                    "Publisher sent a success code for an unsolicited server command: {label}"
                ))),
            };
        }

        if command == Some(ServerCommand::MetadataRefresh) {
            session.events.status(format!(
                "Success code received in response to server command \"{label}\": \
                 latest metadata received."
            ));
            return self.metadata(&payload);
        }

        session.events.status(format!(
            "Success code received in response to server command \"{label}\": {}",
            self.message(&payload)
        ));
        match command {
            Some(ServerCommand::Authenticate) => {
                session.set_authenticated(true);
                session.settle_state();
                session.events.emit(SubscriberEvent::ConnectionAuthenticated);
                if session.config.auto_connect {
                    session.start_subscription().await;
                }
            }
            Some(ServerCommand::Subscribe) => {
                session.set_subscribed(true);
                session.settle_state();
            }
            _ => {}
        }
        Ok(())
    }

    fn failed(&self, header: &ResponseHeader, solicited: bool, payload: &[u8]) -> Result<()> {
        let label = command_label(header, header.command());
        if !solicited {
            return Err(SubscriberError::protocol_violation(format!(
                "Publisher sent a failed code for an unsolicited server command: {label}"
            )));
        }
        self.session.events.status(format!(
            "Failure code received in response to server command \"{label}\": {}",
            self.message(payload)
        ));
        Ok(())
    }

    fn data_packet(&self, payload: &[u8]) -> Result<()> {
        let session = &self.session;
        session.monitor.arm();

        let packet = session.decoder.decode(payload)?;
        if let Some(warning) = packet.warning {
            session.events.warning(warning);
        }
        if packet.measurements.is_empty() {
            return Ok(());
        }

        session.statistics.record_batch(Ticks::now(), &packet.measurements);
        match &session.sink {
            Some(sink) if session.sink_active() => sink.accept(&packet.measurements),
            _ => session.events.emit(SubscriberEvent::NewMeasurements(packet.measurements.into())),
        }
        Ok(())
    }

    async fn buffer_block(&self, payload: &Bytes) -> Result<()> {
        let session = &self.session;
        let mut reader = PacketReader::new(payload, "buffer block");
        let sequence_number = reader.read_u32()?;
        let runtime_index = reader.read_u16()?;
        let data = payload.slice(reader.position()..);

        let outcome = session.reassembler.submit(sequence_number, || {
            let cache = session
                .decoder
                .signal_index_cache()
                .load()
                .ok_or_else(|| {
                    SubscriberError::decode_error("buffer block", "no signal index cache")
                })?;
            let entry = cache.lookup(runtime_index).ok_or_else(|| {
                SubscriberError::decode_error(
                    "buffer block",
                    format!(
                        "Failed to find associated signal identification for runtime ID \
                         {runtime_index}"
                    ),
                )
            })?;
            Ok(BufferBlock {
                signal_id: entry.signal_id,
                source: entry.source.clone(),
                point_id: entry.point_id,
                timestamp: Ticks::now(),
                payload: data,
                sequence_number,
            })
        })?;

        trace!(sequence_number, disposition = ?outcome.disposition, "Buffer block received");
        session
            .send_command(ServerCommand::ConfirmBufferBlock, &sequence_number.to_be_bytes())
            .await?;
        if !outcome.delivered.is_empty() {
            session.statistics.record_buffer_blocks(outcome.delivered.len());
            session.events.emit(SubscriberEvent::NewBufferBlocks(outcome.delivered.into()));
        }
        Ok(())
    }

    fn update_signal_index_cache(&self, payload: &[u8]) -> Result<()> {
        let session = &self.session;
        let modes = session.modes;
        let cache = if modes.compress_signal_index_cache() && modes.compression_modes().gzip() {
            SignalIndexCache::parse(&gunzip(payload)?, session.encoding())?
        } else {
            SignalIndexCache::parse(payload, session.encoding())?
        };
        debug!(
            entries = cache.len(),
            unauthorized = cache.unauthorized_signal_ids().len(),
            "Signal index cache received"
        );
        session.decoder.signal_index_cache().replace(cache);
        Ok(())
    }

    fn update_cipher_keys(&self, payload: &[u8]) -> Result<()> {
        let session = &self.session;
        // Leading byte is the publisher's active cipher index.
        let (_, records) = payload
            .split_first()
            .ok_or_else(|| SubscriberError::truncated("cipher keys", 1, 0))?;

        match session.rotation_secret() {
            Some(secret) => session.decoder.cipher_keys().rotate(&secret.decrypt(records)?)?,
            None => session.decoder.cipher_keys().rotate(records)?,
        }
        session
            .events
            .status("Successfully established new cipher keys for data packet transmissions.");
        Ok(())
    }

    async fn notify(&self, payload: &[u8]) -> Result<()> {
        let session = &self.session;
        let hash = payload
            .get(..4)
            .ok_or_else(|| SubscriberError::truncated("notification", 4, payload.len()))?;
        let message = text::decode(&payload[4..], session.encoding())?;

        session.events.status(format!("NOTIFICATION: {message}"));
        session.events.emit(SubscriberEvent::NotificationReceived(message));
        session.send_command(ServerCommand::ConfirmNotification, hash).await
    }

    fn metadata(&self, payload: &Bytes) -> Result<()> {
        let session = &self.session;
        let modes = session.modes;
        let metadata = if modes.compress_metadata() && modes.compression_modes().gzip() {
            Bytes::from(gunzip(payload)?)
        } else {
            payload.clone()
        };
        debug!(bytes = metadata.len(), "Metadata received");
        session.events.emit(SubscriberEvent::MetadataReceived(metadata));
        Ok(())
    }

    /// Best-effort text of a response payload.
    fn message(&self, payload: &[u8]) -> String {
        text::decode(payload, self.session.encoding())
            .unwrap_or_else(|_| format!("{} bytes", payload.len()))
    }
}

fn command_label(header: &ResponseHeader, command: Option<ServerCommand>) -> String {
    command.map_or_else(|| format!("0x{:02X}", header.command_code), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriberConfig;
    use crate::decoder::MeasurementDecoder;
    use crate::request::SubscriptionRequestBuilder;
    use crate::test_utils::{RecordingWriter, packets};
    use crate::types::{ConnectionState, OperationalModes};
    use futures::StreamExt;
    use std::time::Duration;

    fn session(config: SubscriberConfig) -> (Arc<Session>, Arc<RecordingWriter>) {
        let decoder = MeasurementDecoder::new();
        let requests = SubscriptionRequestBuilder::default();
        let session = Arc::new(Session::new(config, decoder, requests, None).unwrap());
        let writer = Arc::new(RecordingWriter::default());
        session.begin_connection(writer.clone());
        (session, writer)
    }

    fn plain_config() -> SubscriberConfig {
        let mut config = SubscriberConfig::new("127.0.0.1:6165");
        config.operational_modes.compress_metadata = false;
        config.operational_modes.compress_signal_index_cache = false;
        config
    }

    async fn next_matching<S, F>(events: &mut S, mut f: F) -> SubscriberEvent
    where
        S: futures::Stream<Item = SubscriberEvent> + Unpin,
        F: FnMut(&SubscriberEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = events.next().await.expect("event stream ended");
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn solicited_subscribe_success_moves_to_subscribed() {
        let (session, _) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());
        session.pending.register(ServerCommand::Subscribe);

        dispatcher.dispatch(packets::succeeded(ServerCommand::Subscribe, "ok")).await;
        assert!(session.is_subscribed());
        assert_eq!(session.state(), ConnectionState::Subscribed);
        assert!(!session.pending.is_pending(ServerCommand::Subscribe));
    }

    #[tokio::test]
    async fn unsolicited_success_for_other_commands_is_a_process_exception() {
        let (session, _) = session(plain_config());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        dispatcher.dispatch(packets::succeeded(ServerCommand::Authenticate, "")).await;
        let event = next_matching(&mut events, |e| {
            matches!(e, SubscriberEvent::ProcessException { .. })
        })
        .await;
        match event {
            SubscriberEvent::ProcessException { context, error } => {
                assert_eq!(context, RESPONSE_FAILURE_CONTEXT);
                assert!(matches!(*error, SubscriberError::ProtocolViolation { .. }));
            }
            _ => unreachable!(),
        }
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn unsolicited_metadata_is_accepted() {
        let (session, _) = session(plain_config());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        dispatcher
            .dispatch(packets::succeeded_raw(ServerCommand::MetadataRefresh, b"<metadata/>"))
            .await;
        let event =
            next_matching(&mut events, |e| matches!(e, SubscriberEvent::MetadataReceived(_))).await;
        assert!(matches!(event, SubscriberEvent::MetadataReceived(m) if &m[..] == b"<metadata/>"));
    }

    #[tokio::test]
    async fn compressed_metadata_is_inflated() {
        let mut config = plain_config();
        config.operational_modes.compress_metadata = true;
        let (session, _) = session(config);
        assert!(session.modes.has_flag(OperationalModes::COMPRESS_METADATA));
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());
        session.pending.register(ServerCommand::MetadataRefresh);

        let body = crate::compression::gzip(b"<DataSet/>").unwrap();
        dispatcher.dispatch(packets::succeeded_raw(ServerCommand::MetadataRefresh, &body)).await;
        let event =
            next_matching(&mut events, |e| matches!(e, SubscriberEvent::MetadataReceived(_))).await;
        assert!(matches!(event, SubscriberEvent::MetadataReceived(m) if &m[..] == b"<DataSet/>"));
    }

    #[tokio::test]
    async fn notification_is_emitted_and_acknowledged_with_its_hash() {
        let (session, writer) = session(plain_config());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        dispatcher.dispatch(packets::notify([9, 8, 7, 6], "maintenance at noon")).await;
        let event = next_matching(&mut events, |e| {
            matches!(e, SubscriberEvent::NotificationReceived(_))
        })
        .await;
        assert!(matches!(
            event,
            SubscriberEvent::NotificationReceived(m) if m == "maintenance at noon"
        ));
        assert_eq!(
            writer.sent(),
            vec![packets::command(ServerCommand::ConfirmNotification, &[9, 8, 7, 6])]
        );
    }

    #[tokio::test]
    async fn buffer_blocks_are_acknowledged_and_delivered_in_order() {
        let (session, writer) = session(plain_config());
        session.decoder.signal_index_cache().replace(packets::sample_cache());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        for sequence in [1u32, 0] {
            dispatcher.dispatch(packets::buffer_block(sequence, 2, &[0xAB; 3])).await;
        }
        let event =
            next_matching(&mut events, |e| matches!(e, SubscriberEvent::NewBufferBlocks(_))).await;
        match event {
            SubscriberEvent::NewBufferBlocks(blocks) => {
                let sequences: Vec<u32> = blocks.iter().map(|b| b.sequence_number).collect();
                assert_eq!(sequences, vec![0, 1]);
                assert_eq!(&blocks[0].payload[..], &[0xAB; 3]);
            }
            _ => unreachable!(),
        }
        assert_eq!(
            writer.sent(),
            vec![
                packets::command(ServerCommand::ConfirmBufferBlock, &1u32.to_be_bytes()),
                packets::command(ServerCommand::ConfirmBufferBlock, &0u32.to_be_bytes()),
            ]
        );

        dispatcher.dispatch(packets::buffer_block(0, 2, &[0xCD])).await;
        assert_eq!(writer.sent().len(), 3);
    }

    #[tokio::test]
    async fn unresolvable_buffer_block_is_not_acknowledged() {
        let (session, writer) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());
        dispatcher.dispatch(packets::buffer_block(0, 2, &[1])).await;
        assert!(writer.sent().is_empty());
        assert_eq!(session.reassembler.expected_sequence(), 0);
    }

    #[tokio::test]
    async fn far_ahead_buffer_block_is_dropped_unacknowledged() {
        let (session, writer) = session(plain_config());
        session.decoder.signal_index_cache().replace(packets::sample_cache());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        dispatcher.dispatch(packets::buffer_block(u32::MAX, 2, &[1])).await;
        next_matching(&mut events, |e| matches!(e, SubscriberEvent::ProcessException { .. })).await;
        assert!(writer.sent().is_empty());
        assert_eq!(session.reassembler.pending(), 0);

        dispatcher.dispatch(packets::buffer_block(0, 2, &[2])).await;
        assert_eq!(
            writer.sent(),
            vec![packets::command(ServerCommand::ConfirmBufferBlock, &0u32.to_be_bytes())]
        );
    }

    #[tokio::test]
    async fn signal_index_cache_and_base_times_replace_session_state() {
        let (session, _) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());

        dispatcher.dispatch(packets::signal_index_cache(&packets::sample_cache(), false)).await;
        assert_eq!(session.decoder.signal_index_cache().load().map(|c| c.len()), Some(3));

        let base_times = BaseTimeOffsets { time_index: 1, offsets: [100, 200] };
        dispatcher.dispatch(packets::base_times(&base_times)).await;
        assert_eq!(session.decoder.base_times(), base_times);
    }

    #[tokio::test]
    async fn cipher_rotation_installs_new_keys() {
        let (session, _) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());
        dispatcher.dispatch(packets::cipher_keys(&packets::sample_keys(), None)).await;
        assert!(session.decoder.cipher_keys().is_active());
    }

    #[tokio::test]
    async fn malformed_cipher_rotation_keeps_previous_keys() {
        let (session, _) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());
        session.decoder.cipher_keys().install(packets::sample_keys());
        let before = session.decoder.cipher_keys().snapshot();

        dispatcher
            .dispatch(packets::response(ServerResponse::UpdateCipherKeys, 0, &[0, 0, 0, 0, 9]))
            .await;
        let after = session.decoder.cipher_keys().snapshot();
        assert!(matches!((before, after), (Some(a), Some(b)) if Arc::ptr_eq(&a, &b)));
    }

    #[tokio::test]
    async fn solicited_unsubscribe_clears_subscription() {
        let (session, _) = session(plain_config());
        let dispatcher = ResponseDispatcher::new(session.clone());
        session.set_subscribed(true);
        session.monitor.set_interval(Duration::from_secs(1));
        session.monitor.arm();
        session.pending.register(ServerCommand::Unsubscribe);

        dispatcher.dispatch(packets::succeeded(ServerCommand::Unsubscribe, "")).await;
        assert!(!session.is_subscribed());
        assert!(!session.monitor.is_armed());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn user_responses_carry_their_payload() {
        let (session, _) = session(plain_config());
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());
        session.pending.register(ServerCommand::User(3));

        let user = ServerCommand::User(3).code();
        let pong = packets::response(ServerResponse::User(3), user, b"pong");
        dispatcher.dispatch(pong).await;
        let event =
            next_matching(&mut events, |e| matches!(e, SubscriberEvent::UserResponse { .. })).await;
        match event {
            SubscriberEvent::UserResponse { index, response, solicited, payload } => {
                assert_eq!(index, 3);
                assert_eq!(response, ServerResponse::User(3));
                assert!(!solicited);
                assert_eq!(&payload[..], b"pong");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn repeated_failures_exceed_the_parsing_threshold() {
        let mut config = plain_config();
        config.allowed_parsing_exceptions = 2;
        let (session, _) = session(config);
        let mut events = Box::pin(session.events.stream());
        let dispatcher = ResponseDispatcher::new(session.clone());

        for _ in 0..3 {
            dispatcher.dispatch(Bytes::from_static(&[0x82, 0x00, 0x00])).await;
        }
        next_matching(&mut events, |e| {
            matches!(e, SubscriberEvent::ExceededParsingExceptionThreshold)
        })
        .await;
    }
}
