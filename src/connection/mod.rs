//! Public subscriber handle
//!
//! [`DataSubscriber`] owns the session state and starts or stops the
//! background connection task. Commands sent through it are only valid while
//! a command channel is connected.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::channel::{Channel, DataChannelFactory};
use crate::codec::CompactCodec;
use crate::config::SubscriberConfig;
use crate::decoder::MeasurementDecoder;
use crate::driver::{Driver, DriverHandle};
use crate::events::SubscriberEvent;
use crate::request::{SubscriptionDescriptor, SubscriptionRequestBuilder};
use crate::session::Session;
use crate::signal_index::SignalIndexCache;
use crate::sink::MeasurementSink;
use crate::statistics::StatisticsSnapshot;
use crate::transport::{TcpChannel, UdpDataChannelFactory};
use crate::types::{ConnectionState, Measurement};
use crate::{Result, SubscriberError};


/// Subscriber to a real-time measurement publisher.
///
/// # Example
///
/// ```rust,no_run
/// use feedline::{DataSubscriber, SubscriberConfig, SubscriptionDescriptor};
/// use futures::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> feedline::Result<()> {
///     let filter = "FILTER ActiveMeasurements WHERE SignalType='FREQ'";
///     let config = SubscriberConfig::new("127.0.0.1:6165")
///         .with_subscription(SubscriptionDescriptor::unsynchronized(filter));
///     let subscriber = DataSubscriber::tcp(config)?;
///     let mut measurements = Box::pin(subscriber.measurements());
///     subscriber.start()?;
///
///     while let Some(batch) = measurements.next().await {
///         println!("{} measurements", batch.len());
///     }
///     Ok(())
/// }
/// ```
pub struct DataSubscriber {
    session: Arc<Session>,
    channel: Arc<dyn Channel>,
    data_channels: Option<Arc<dyn DataChannelFactory>>,
    running: Mutex<Option<DriverHandle>>,
}

impl DataSubscriber {
    pub fn builder(config: SubscriberConfig) -> DataSubscriberBuilder {
        DataSubscriberBuilder::new(config)
    }

    /// TCP command channel to `config.connection_string` with UDP data channels.
    pub fn tcp(config: SubscriberConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts the connect cycle in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.session.config.connection_string.trim().is_empty() {
            return Err(SubscriberError::misuse("cannot start without a connection string"));
        }

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return Err(SubscriberError::misuse("subscriber is already running"));
        }

        info!(endpoint = %self.channel.describe(), "Starting subscriber");
        self.session.statistics.reset();
        *running = Some(Driver::spawn(
            Arc::clone(&self.session),
            Arc::clone(&self.channel),
            self.data_channels.clone(),
        ));
        Ok(())
    }

    /// Stops the connection task and suppresses reconnects. Idempotent.
    pub async fn stop(&self) {
        let handle = self.running.lock().take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
            info!("Subscriber stopped");
        }
        self.session.set_state(ConnectionState::Disconnected);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|handle| !handle.task.is_finished())
    }

    /// Sends `Authenticate` using the configured shared secret and id.
    pub async fn authenticate(&self) -> Result<()> {
        self.session.authenticate().await
    }

    pub async fn subscribe(&self, descriptor: &SubscriptionDescriptor) -> Result<()> {
        self.session.subscribe(descriptor).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.session.unsubscribe().await
    }

    /// Requests metadata, optionally restricted by filter expressions.
    pub async fn refresh_metadata(&self, filters: Option<&str>) -> Result<()> {
        self.session.refresh_metadata(filters).await
    }

    pub async fn rotate_cipher_keys(&self) -> Result<()> {
        self.session.rotate_cipher_keys().await
    }

    pub async fn update_processing_interval(&self, interval_ms: i32) -> Result<()> {
        self.session.update_processing_interval(interval_ms).await
    }

    /// Sends user-defined command `index` (`0..=15`).
    pub async fn send_user_command(&self, index: u8, payload: &[u8]) -> Result<()> {
        self.session.send_user_command(index, payload).await
    }

    pub fn events(&self) -> impl Stream<Item = SubscriberEvent> + Send + 'static {
        self.session.events.stream()
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.session.events.receiver()
    }

    /// Decoded measurement batches, one item per data packet.
    pub fn measurements(&self) -> impl Stream<Item = Arc<[Measurement]>> + Send + 'static {
        self.events().filter_map(|event| async move {
            match event {
                SubscriberEvent::NewMeasurements(batch) => Some(batch),
                _ => None,
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn is_subscribed(&self) -> bool {
        self.session.is_subscribed()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.session.statistics.snapshot()
    }

    pub fn signal_index_cache(&self) -> Option<Arc<SignalIndexCache>> {
        self.session.decoder.signal_index_cache().load()
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.session.config
    }
}

impl Drop for DataSubscriber {
    fn drop(&mut self) {
        if let Some(handle) = self.running.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

/// Assembles a [`DataSubscriber`] from its collaborators.
pub struct DataSubscriberBuilder {
    config: SubscriberConfig,
    channel: Option<Arc<dyn Channel>>,
    data_channels: Option<Arc<dyn DataChannelFactory>>,
    udp_data_channels: bool,
    sink: Option<Arc<dyn MeasurementSink>>,
    codec: Option<Arc<dyn CompactCodec>>,
    request_builder: SubscriptionRequestBuilder,
}

impl DataSubscriberBuilder {
    pub fn new(config: SubscriberConfig) -> Self {
        Self {
            config,
            channel: None,
            data_channels: None,
            udp_data_channels: true,
            sink: None,
            codec: None,
            request_builder: SubscriptionRequestBuilder::default(),
        }
    }

    /// Command channel; defaults to TCP to the configured connection string.
    pub fn channel(mut self, channel: impl Channel) -> Self {
        self.channel = Some(Arc::new(channel));
        self
    }

    /// Data channel factory; defaults to UDP.
    pub fn data_channels(mut self, factory: impl DataChannelFactory) -> Self {
        self.data_channels = Some(Arc::new(factory));
        self
    }

    pub fn without_data_channels(mut self) -> Self {
        self.data_channels = None;
        self.udp_data_channels = false;
        self
    }

    /// Time-alignment sink for locally synchronized subscriptions.
    pub fn sink(mut self, sink: impl MeasurementSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn codec(mut self, codec: impl CompactCodec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Overrides the assembly marker sent with every subscription.
    pub fn assembly_info(mut self, source: impl Into<String>, version: impl Into<String>) -> Self {
        self.request_builder = SubscriptionRequestBuilder::new(source, version);
        self
    }

    pub fn build(self) -> Result<DataSubscriber> {
        let decoder = match self.codec {
            Some(codec) => MeasurementDecoder::with_codec(codec),
            None => MeasurementDecoder::new(),
        };
        let channel = match self.channel {
            Some(channel) => channel,
            None => Arc::new(TcpChannel::new(self.config.connection_string.clone())),
        };
        let data_channels = match self.data_channels {
            Some(factory) => Some(factory),
            None if self.udp_data_channels => {
                Some(Arc::new(UdpDataChannelFactory::default()) as Arc<dyn DataChannelFactory>)
            }
            None => None,
        };

        let session = Session::new(self.config, decoder, self.request_builder, self.sink)?;
        Ok(DataSubscriber {
            session: Arc::new(session),
            channel,
            data_channels,
            running: Mutex::new(None),
        })
    }
}
