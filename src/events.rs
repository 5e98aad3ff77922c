//! Outbound notifications
//!
//! Every observable outcome of the engine is a [`SubscriberEvent`] published
//! on one broadcast channel. Consumers subscribe as many times as they like;
//! the engine never knows who is listening.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::SubscriberError;
use crate::types::{BufferBlock, Measurement, ServerResponse, Ticks};

/// Notifications emitted by a subscriber session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SubscriberEvent {
    ConnectionEstablished,
    /// The command channel closed; a reconnect follows unless stopped.
    ConnectionTerminated,
    ConnectionAuthenticated,
    /// Raised for every parsed response before it is handled.
    ServerResponse { response: ServerResponse, command_code: u8 },
    /// Decompressed metadata document.
    MetadataReceived(Bytes),
    DataStartTime(Ticks),
    NewMeasurements(Arc<[Measurement]>),
    NewBufferBlocks(Arc<[BufferBlock]>),
    /// Name of the adapter that finished a historical replay.
    ProcessingComplete(String),
    NotificationReceived(String),
    ServerConfigurationChanged,
    StatusMessage(String),
    ProcessException { context: String, error: Arc<SubscriberError> },
    ExceededParsingExceptionThreshold,
    /// Reply to one of the user-defined commands.
    UserResponse { index: u8, response: ServerResponse, solicited: bool, payload: Bytes },
}

/// Sending side shared by every component.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SubscriberEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event`; having no listeners is not an error.
    pub fn emit(&self, event: SubscriberEvent) {
        let _ = self.sender.send(event);
    }

    /// Informational message, also logged.
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!(status = %message, "Subscriber status");
        self.emit(SubscriberEvent::StatusMessage(message));
    }

    /// Status message that also warrants a warning in the log.
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(status = %message, "Subscriber warning");
        self.emit(SubscriberEvent::StatusMessage(message));
    }

    /// Actionable failure, also logged.
    pub fn exception(&self, context: impl Into<String>, error: SubscriberError) {
        let context = context.into();
        warn!(context = %context, error = %error, "Subscriber process exception");
        self.emit(SubscriberEvent::ProcessException { context, error: Arc::new(error) });
    }

    pub fn receiver(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.sender.subscribe()
    }

    /// Event stream that skips over messages dropped by slow consumers.
    pub fn stream(&self) -> impl Stream<Item = SubscriberEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(lagged) => {
                    debug!("Event consumer lagged: {}", lagged);
                    None
                }
            }
        })
    }
}
