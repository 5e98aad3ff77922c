//! Driver spawns and runs the connection task
//!
//! One task owns the command channel reader, the optional data channel
//! reader and the data-loss monitor. It loops through the connect cycle until
//! cancelled or out of attempts.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::channel::{Channel, ChannelHalves, ChannelReader, ChannelWriter, DataChannelFactory};
use crate::config::SecurityMode;
use crate::dispatcher::ResponseDispatcher;
use crate::events::SubscriberEvent;
use crate::session::{Control, Session};
use crate::types::ConnectionState;

/// Handle to a running connection task.
pub(crate) struct DriverHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    /// The channel closed or failed.
    Lost,
    Restart(String),
}

enum Step {
    Cancelled,
    Control(Control),
    Command(Result<Option<Bytes>>),
    Data(Result<Option<Bytes>>),
}

pub(crate) struct Driver;

impl Driver {
    /// Spawn the connection task for `session`.
    pub fn spawn(
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        data_channels: Option<Arc<dyn DataChannelFactory>>,
    ) -> DriverHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        session.install_control(control_tx);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            Self::connection_task(session, channel, data_channels, control_rx, task_cancel).await;
        });

        DriverHandle { cancel, task }
    }

    async fn connection_task(
        session: Arc<Session>,
        channel: Arc<dyn Channel>,
        data_channels: Option<Arc<dyn DataChannelFactory>>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        cancel: CancellationToken,
    ) {
        let endpoint = channel.describe();
        info!(endpoint = %endpoint, "Connection task started");
        let mut failed_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            session.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = channel.connect() => result,
            };

            let halves = match connected {
                Ok(halves) => {
                    failed_attempts = 0;
                    halves
                }
                Err(error) => {
                    failed_attempts += 1;
                    session.set_state(ConnectionState::Disconnected);
                    session.events.warning(format!(
                        "Connection attempt {failed_attempts} to {endpoint} failed: {error}"
                    ));
                    let limit = session.config.max_connection_attempts;
                    if limit.is_some_and(|max| failed_attempts >= max) {
                        warn!(attempts = failed_attempts, "Maximum connection attempts reached");
                        session.events.emit(SubscriberEvent::ConnectionTerminated);
                        break;
                    }
                    if !Self::pause(&cancel, session.reconnect_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let end = Self::run_connection(
                &session,
                halves,
                data_channels.as_deref(),
                &mut control_rx,
                &cancel,
            )
            .await;
            session.set_state(ConnectionState::Disconnected);
            debug!(?end, "Connection ended");

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Lost => {
                    session.events.emit(SubscriberEvent::ConnectionTerminated);
                    session
                        .events
                        .status(format!("Connection to {endpoint} terminated, reconnecting..."));
                }
                SessionEnd::Restart(reason) => {
                    session.events.status(format!("Restarting connection to {endpoint}: {reason}"));
                }
            }

            if !Self::pause(&cancel, session.reconnect_delay()).await {
                break;
            }
        }

        session.set_state(ConnectionState::Disconnected);
        info!(endpoint = %endpoint, "Connection task stopped");
    }

    /// Sleeps between attempts. Returns false when cancelled.
    async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run_connection(
        session: &Arc<Session>,
        halves: ChannelHalves,
        data_channels: Option<&dyn DataChannelFactory>,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let ChannelHalves { mut reader, writer } = halves;
        let writer: Arc<dyn ChannelWriter> = Arc::from(writer);

        // Requests queued by a previous connection no longer apply.
        while control_rx.try_recv().is_ok() {}

        session.begin_connection(Arc::clone(&writer));
        session.settle_state();
        session.events.emit(SubscriberEvent::ConnectionEstablished);

        let monitor_cancel = cancel.child_token();
        let monitor_events = session.events.clone();
        let monitor_session = Arc::downgrade(session);
        Arc::clone(&session.monitor).spawn(monitor_cancel.clone(), move |period| {
            monitor_events.status(format!(
                "No data received in {} seconds, restarting connect cycle...",
                period.as_secs_f64()
            ));
            if let Some(session) = monitor_session.upgrade() {
                session.request_restart("data loss detected");
            }
        });

        let end = Self::serve(session, &mut *reader, data_channels, control_rx, cancel).await;

        monitor_cancel.cancel();
        if let Some(writer) = session.end_connection() {
            writer.disconnect().await;
        }
        end
    }

    async fn serve(
        session: &Arc<Session>,
        reader: &mut dyn ChannelReader,
        data_channels: Option<&dyn DataChannelFactory>,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        if let Err(error) = session.define_operational_modes().await {
            session.exception("Failed to define operational modes", error);
            return SessionEnd::Lost;
        }

        if session.config.auto_connect {
            if session.config.security_mode == SecurityMode::Gateway {
                if let Err(error) = session.authenticate().await {
                    session.exception("Failed to authenticate", error);
                }
            } else {
                session.start_subscription().await;
            }
        }

        let dispatcher = ResponseDispatcher::new(Arc::clone(session));
        let mut data_reader: Option<Box<dyn ChannelReader>> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                Some(control) = control_rx.recv() => Step::Control(control),
                frame = reader.receive() => Step::Command(frame),
                frame = receive_optional(&mut data_reader) => Step::Data(frame),
            };

            match step {
                Step::Cancelled => return SessionEnd::Cancelled,
                Step::Control(Control::Restart { reason }) => return SessionEnd::Restart(reason),
                Step::Control(Control::OpenDataChannel(port)) => {
                    data_reader = None;
                    match data_channels {
                        Some(factory) => match factory.open(port).await {
                            Ok(opened) => data_reader = Some(opened),
                            Err(error) => session.exception(
                                format!("Failed to open data channel on port {port}"),
                                error,
                            ),
                        },
                        None => warn!(
                            port,
                            "Data channel requested but no data channel factory is configured"
                        ),
                    }
                }
                Step::Control(Control::CloseDataChannel) => {
                    if data_reader.take().is_some() {
                        debug!("Data channel closed");
                    }
                }
                Step::Command(Ok(Some(frame))) => dispatcher.dispatch(frame).await,
                Step::Command(Ok(None)) => {
                    debug!("Publisher closed the command channel");
                    return SessionEnd::Lost;
                }
                Step::Command(Err(error)) => {
                    if !error.is_connection_reset() {
                        session.exception("Command channel receive failed", error);
                    }
                    return SessionEnd::Lost;
                }
                Step::Data(Ok(Some(frame))) => dispatcher.dispatch(frame).await,
                Step::Data(Ok(None)) => data_reader = None,
                Step::Data(Err(error)) => {
                    data_reader = None;
                    session.exception("Data channel receive failed", error);
                }
            }
        }
    }
}

async fn receive_optional(reader: &mut Option<Box<dyn ChannelReader>>) -> Result<Option<Bytes>> {
    match reader {
        Some(reader) => reader.receive().await,
        None => std::future::pending().await,
    }
}
