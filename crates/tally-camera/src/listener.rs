//! Long-lived camera alarm listener.
//!
//! Holds a connection to the camera's event port, reconnecting with
//! exponential backoff forever. Each triggered alarm spawns a detached
//! capture task whose snapshot, if any, goes to the [`SnapshotSink`].

use crate::alarm::{AlarmEvent, MessageFramer, DEFAULT_END_MARKER};
use crate::backoff::Backoff;
use crate::capture::{capture_snapshot, CaptureLimits, FrameGrabber};
use crate::connector::{EventConnector, EventStream};
use crate::sink::SnapshotSink;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
    ParsingEvents,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Silence shorter than this is normal; the read is simply retried.
    pub idle_timeout: Duration,
    pub capture: CaptureLimits,
    /// `Alarm_flag` value that triggers a capture.
    pub alarm_flag: String,
    pub end_marker: Vec<u8>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            capture: CaptureLimits::default(),
            alarm_flag: "1".to_string(),
            end_marker: DEFAULT_END_MARKER.to_vec(),
        }
    }
}

struct Shared {
    config: ListenerConfig,
    connector: Arc<dyn EventConnector>,
    grabber: Arc<dyn FrameGrabber>,
    state: watch::Sender<ListenerState>,
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct CameraEventListener {
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl CameraEventListener {
    pub fn new(
        config: ListenerConfig,
        connector: Arc<dyn EventConnector>,
        grabber: Arc<dyn FrameGrabber>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                grabber,
                state,
            }),
            running: None,
        }
    }

    /// Spawn the listener task. No-op when already running or disabled.
    pub fn start(&mut self, sink: Arc<dyn SnapshotSink>) {
        if !self.shared.config.enabled {
            tracing::info!("camera listener disabled in config");
            return;
        }
        if self.running.is_some() {
            tracing::warn!("camera listener already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen(Arc::clone(&self.shared), sink, shutdown_rx));
        self.running = Some(Running { shutdown, task });

        tracing::info!(endpoint = %self.shared.connector.endpoint(), "camera listener started");
    }

    /// Stop the read loop and wait for it to exit. Capture tasks already
    /// spawned are left to finish on their own.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.send_replace(true);
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "camera listener task failed");
        }
        self.shared.set_state(ListenerState::Disconnected);
        tracing::info!("camera listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }
}

async fn listen(shared: Arc<Shared>, sink: Arc<dyn SnapshotSink>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(shared.config.reconnect_base, shared.config.reconnect_max);
    let endpoint = shared.connector.endpoint();

    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.set_state(ListenerState::Connecting);
        tracing::info!(%endpoint, "connecting to camera event stream");

        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = shared.connector.connect() => result,
        };

        match connected {
            Ok(stream) => {
                backoff.reset();
                shared.set_state(ListenerState::Connected);
                tracing::info!(%endpoint, "connected to camera event stream");

                let ended = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = read_events(&shared, &sink, stream) => result,
                };
                match ended {
                    Ok(()) => tracing::warn!(%endpoint, "camera closed the event stream"),
                    Err(e) => tracing::warn!(%endpoint, error = %e, "camera event stream failed"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::warn!(%endpoint, delay_ms = backoff.peek().as_millis() as u64, "camera connection refused");
            }
            Err(e) => {
                tracing::error!(%endpoint, error = %e, delay_ms = backoff.peek().as_millis() as u64, "camera connection failed");
            }
        }

        shared.set_state(ListenerState::Disconnected);
        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ListenerState::Disconnected);
}

/// Read until the camera closes the stream or an I/O error occurs.
async fn read_events(
    shared: &Shared,
    sink: &Arc<dyn SnapshotSink>,
    mut stream: EventStream,
) -> io::Result<()> {
    let mut framer = MessageFramer::new(shared.config.end_marker.clone());
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match tokio::time::timeout(shared.config.idle_timeout, stream.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!("no camera events within idle window");
                continue;
            }
        };
        if n == 0 {
            return Ok(());
        }

        framer.push(&chunk[..n]);
        shared.set_state(ListenerState::ParsingEvents);

        while let Some(message) = framer.next_message() {
            match AlarmEvent::parse(&message) {
                Some(event) if event.is_triggered(&shared.config.alarm_flag) => {
                    tracing::info!(code = ?event.code, data = ?event.data, "alarm event received");
                    spawn_capture(shared, sink);
                }
                Some(event) => tracing::debug!(flag = ?event.flag, "ignoring alarm with non-trigger flag"),
                None => tracing::trace!(bytes = message.len(), "discarding non-alarm record"),
            }
        }

        shared.set_state(ListenerState::Connected);
    }
}

/// Fire-and-forget: failures are logged here and never reach the listener.
fn spawn_capture(shared: &Shared, sink: &Arc<dyn SnapshotSink>) {
    let grabber = Arc::clone(&shared.grabber);
    let limits = shared.config.capture;
    let sink = Arc::clone(sink);

    tokio::spawn(async move {
        match capture_snapshot(grabber.as_ref(), limits).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "snapshot captured");
                sink.submit(path);
            }
            Err(e) => tracing::warn!(error = %e, "snapshot capture failed"),
        }
    });
}
