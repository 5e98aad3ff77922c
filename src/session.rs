//! State shared by the connection task, the dispatcher and the public handle

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::ChannelWriter;
use crate::cipher::{SharedSecret, authentication_payload};
use crate::config::{SecurityMode, SubscriberConfig};
use crate::decoder::{DecodeSettings, MeasurementDecoder};
use crate::events::{EventBus, SubscriberEvent};
use crate::monitor::DataLossMonitor;
use crate::pending::PendingRequestTracker;
use crate::reassembly::BufferBlockReassembler;
use crate::request::{SubscriptionDescriptor, SubscriptionRequest, SubscriptionRequestBuilder};
use crate::sink::MeasurementSink;
use crate::statistics::StatisticsTracker;
use crate::types::{ConnectionState, OperationalEncoding, OperationalModes, ServerCommand};
use crate::wire::{encode_command, text};
use crate::{Result, SubscriberError};

/// Requests posted to the connection task.
#[derive(Debug)]
pub(crate) enum Control {
    /// Tear the connection down and run the connect cycle again.
    Restart { reason: String },
    OpenDataChannel(u16),
    CloseDataChannel,
}

#[derive(Debug, Default)]
struct ExceptionWindow {
    started: Option<Instant>,
    count: u32,
}

pub(crate) struct Session {
    pub config: SubscriberConfig,
    pub modes: OperationalModes,
    pub events: EventBus,
    pub decoder: MeasurementDecoder,
    pub pending: PendingRequestTracker,
    pub reassembler: BufferBlockReassembler,
    pub statistics: StatisticsTracker,
    pub monitor: Arc<DataLossMonitor>,
    pub sink: Option<Arc<dyn MeasurementSink>>,
    state: watch::Sender<ConnectionState>,
    builder: SubscriptionRequestBuilder,
    shared_secret: Option<SharedSecret>,
    writer: RwLock<Option<Arc<dyn ChannelWriter>>>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    authenticated: AtomicBool,
    subscribed: AtomicBool,
    sink_active: AtomicBool,
    active_request: Mutex<Option<SubscriptionRequest>>,
    exceptions: Mutex<ExceptionWindow>,
}

impl Session {
    pub fn new(
        config: SubscriberConfig,
        decoder: MeasurementDecoder,
        builder: SubscriptionRequestBuilder,
        sink: Option<Arc<dyn MeasurementSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let modes = config.operational_modes.to_modes()?;
        let shared_secret =
            config.shared_secret.as_deref().filter(|s| !s.is_empty()).map(SharedSecret::new);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            events: EventBus::new(config.event_capacity),
            monitor: Arc::new(DataLossMonitor::new(config.data_loss_interval())),
            modes,
            decoder,
            pending: PendingRequestTracker::new(),
            reassembler: BufferBlockReassembler::new(),
            statistics: StatisticsTracker::new(),
            sink,
            state,
            builder,
            shared_secret,
            writer: RwLock::new(None),
            control: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            sink_active: AtomicBool::new(false),
            active_request: Mutex::new(None),
            exceptions: Mutex::new(ExceptionWindow::default()),
            config,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Connected, Authenticated or Subscribed according to the session flags.
    pub fn settle_state(&self) {
        let next = if self.is_subscribed() {
            ConnectionState::Subscribed
        } else if self.is_authenticated() {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Connected
        };
        self.set_state(next);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn set_subscribed(&self, value: bool) {
        self.subscribed.store(value, Ordering::Release);
    }

    /// Outer key for cipher rotations; only a gateway-authenticated session has one.
    pub fn rotation_secret(&self) -> Option<&SharedSecret> {
        if self.config.security_mode == SecurityMode::Gateway && self.is_authenticated() {
            self.shared_secret.as_ref()
        } else {
            None
        }
    }

    pub fn encoding(&self) -> OperationalEncoding {
        self.modes.encoding()
    }

    pub fn install_control(&self, sender: mpsc::UnboundedSender<Control>) {
        *self.control.lock() = Some(sender);
    }

    fn post(&self, control: Control) {
        match self.control.lock().as_ref() {
            Some(sender) => {
                let _ = sender.send(control);
            }
            None => trace!(?control, "No connection task to receive control request"),
        }
    }

    pub fn request_restart(&self, reason: impl Into<String>) {
        self.post(Control::Restart { reason: reason.into() });
    }

    /// Clears everything scoped to one connection.
    pub fn begin_connection(&self, writer: Arc<dyn ChannelWriter>) {
        self.reassembler.reset();
        self.pending.clear();
        self.decoder.reset();
        self.statistics.reset_session();
        self.monitor.disarm();
        self.set_subscribed(false);
        self.set_authenticated(self.config.security_mode == SecurityMode::Tls);
        *self.exceptions.lock() = ExceptionWindow::default();
        *self.writer.write() = Some(writer);
    }

    /// Detaches the writer so later commands fail with `NotConnected`.
    pub fn end_connection(&self) -> Option<Arc<dyn ChannelWriter>> {
        self.monitor.disarm();
        self.set_subscribed(false);
        self.stop_sink();
        self.writer.write().take()
    }

    /// Reports a process exception and enforces the parsing-exception threshold.
    pub fn exception(&self, context: impl Into<String>, error: SubscriberError) {
        self.events.exception(context, error);

        let window = self.config.parsing_exception_window();
        let exceeded = {
            let mut exceptions = self.exceptions.lock();
            let now = Instant::now();
            if exceptions.started.is_none_or(|started| now.duration_since(started) > window) {
                exceptions.started = Some(now);
                exceptions.count = 0;
            }
            exceptions.count += 1;
            let exceeded = exceptions.count > self.config.allowed_parsing_exceptions;
            if exceeded {
                *exceptions = ExceptionWindow::default();
            }
            exceeded
        };

        if exceeded {
            self.events.emit(SubscriberEvent::ExceededParsingExceptionThreshold);
            self.request_restart("parsing exception threshold exceeded");
        }
    }

    /// Sends `command`, recording it as pending first so its reply cannot
    /// race ahead of the registration.
    pub async fn send_command(&self, command: ServerCommand, payload: &[u8]) -> Result<()> {
        let writer = self.writer.read().clone().ok_or(SubscriberError::NotConnected)?;
        let registered = command.expects_response() && self.pending.register(command);

        trace!(%command, payload = payload.len(), "Sending server command");
        if let Err(error) = writer.send(encode_command(command, payload)).await {
            if registered {
                self.pending.cancel(command);
            }
            if error.is_connection_reset() {
                self.request_restart(format!("connection reset while sending {command}"));
            }
            return Err(error);
        }
        Ok(())
    }

    pub async fn define_operational_modes(&self) -> Result<()> {
        debug!(modes = %self.modes, "Defining operational modes");
        let modes = self.modes.value().to_be_bytes();
        self.send_command(ServerCommand::DefineOperationalModes, &modes).await
    }

    pub async fn authenticate(&self) -> Result<()> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or_else(|| SubscriberError::misuse("authentication requires a shared secret"))?;
        let authentication_id = self.config.authentication_id.as_deref().unwrap_or_default();

        let payload = authentication_payload(secret, authentication_id, self.encoding())?;
        self.send_command(ServerCommand::Authenticate, &payload).await
    }

    pub async fn subscribe(&self, descriptor: &SubscriptionDescriptor) -> Result<()> {
        let request = self.builder.build(descriptor)?;
        if request.local_alignment.is_some() && self.sink.is_none() {
            return Err(SubscriberError::misuse(
                "locally synchronized subscriptions require a measurement sink",
            ));
        }
        if self.writer.read().is_none() {
            return Err(SubscriberError::NotConnected);
        }

        self.decoder.set_settings(DecodeSettings {
            include_time: request.include_time,
            use_millisecond_resolution: request.use_millisecond_resolution,
            encoding: self.encoding(),
            compression: self.modes.compression_modes(),
        });
        self.monitor.set_interval(DataLossMonitor::effective_interval(
            self.config.data_loss_interval(),
            request.throttled,
            request.lag_time,
        ));

        self.stop_sink();
        if let (Some(settings), Some(sink)) = (&request.local_alignment, &self.sink) {
            sink.start(settings).map_err(|source| SubscriberError::Sink { source })?;
            self.sink_active.store(true, Ordering::Release);
        }

        match request.data_channel_port {
            Some(port) => self.post(Control::OpenDataChannel(port)),
            None => self.post(Control::CloseDataChannel),
        }

        let payload = request.encode(self.encoding());
        *self.active_request.lock() = Some(request);
        self.send_command(ServerCommand::Subscribe, &payload).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.send_command(ServerCommand::Unsubscribe, &[]).await
    }

    /// Side effects of an acknowledged unsubscribe.
    pub fn on_unsubscribed(&self) {
        self.set_subscribed(false);
        self.monitor.disarm();
        self.stop_sink();
        self.post(Control::CloseDataChannel);
        self.settle_state();
    }

    pub async fn refresh_metadata(&self, filters: Option<&str>) -> Result<()> {
        let mut payload = BytesMut::new();
        if let Some(filters) = filters.filter(|f| !f.is_empty()) {
            text::put_sized_string(&mut payload, filters, self.encoding());
        }
        self.send_command(ServerCommand::MetadataRefresh, &payload).await
    }

    pub async fn rotate_cipher_keys(&self) -> Result<()> {
        self.send_command(ServerCommand::RotateCipherKeys, &[]).await
    }

    pub async fn update_processing_interval(&self, interval_ms: i32) -> Result<()> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_i32(interval_ms);
        self.send_command(ServerCommand::UpdateProcessingInterval, &payload).await
    }

    pub async fn send_user_command(&self, index: u8, payload: &[u8]) -> Result<()> {
        if index > 15 {
            return Err(SubscriberError::misuse(format!(
                "user command index {index} is outside 0..=15"
            )));
        }
        self.send_command(ServerCommand::User(index), payload).await
    }

    /// Starts the configured subscription and optional metadata request.
    pub async fn start_subscription(&self) {
        if self.config.auto_request_metadata {
            let filters = self.config.metadata_filters.as_deref();
            if let Err(error) = self.refresh_metadata(filters).await {
                self.exception("Failed to request metadata", error);
            }
        }
        if let Some(descriptor) = &self.config.subscription {
            if let Err(error) = self.subscribe(descriptor).await {
                self.exception("Failed to subscribe", error);
            }
        }
    }

    pub fn active_request(&self) -> Option<SubscriptionRequest> {
        self.active_request.lock().clone()
    }

    pub fn sink_active(&self) -> bool {
        self.sink_active.load(Ordering::Acquire)
    }

    fn stop_sink(&self) {
        if self.sink_active.swap(false, Ordering::AcqRel) {
            if let Some(sink) = &self.sink {
                sink.stop();
            }
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.config.reconnect_delay()
    }
}
