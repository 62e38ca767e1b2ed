//! Status reporting for session links
//!
//! Every link publishes its lifecycle transitions through a [`StatusBus`].
//! Observers are plain callbacks; a channel adapter is provided for tests and
//! for UIs that prefer polling a receiver over being called back.
//!
//! Ordering guarantee: statuses for one link are published by at most one
//! thread at a time, and the bus invokes observers inline on the publishing
//! thread, so observers see each link's statuses in emission order. No
//! ordering is promised across different links.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::RwLock;
use tracing::debug;

/// Identifies which part of the session a status refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkId {
    /// Remote microphone to local playback (port 8080 by default).
    Inbound,
    /// Local microphone to remote playback (port 8081 by default).
    Outbound,
    /// Command channel (port 8082 by default).
    Control,
    /// Clip playback over the outbound stream.
    Clip,
    /// The session as a whole.
    Session,
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkId::Inbound => "inbound",
            LinkId::Outbound => "outbound",
            LinkId::Control => "control",
            LinkId::Clip => "clip",
            LinkId::Session => "session",
        };
        f.write_str(name)
    }
}

/// Lifecycle states reported by links and by the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// TCP connect in progress.
    Connecting,
    /// Connected, before the first payload byte moves.
    Connected,
    /// Audio bytes are flowing.
    Streaming,
    /// Orderly end of the link (peer closed, or session stop).
    Disconnected,
    /// The link failed; the string describes the cause.
    Error(String),

    /// Clip transfer started.
    Playing,
    /// Clip transferred completely.
    Finished,
    /// Clip aborted by session stop.
    Cancelled,
    /// Clip rejected because one is already in flight.
    AlreadyPlaying,

    /// Nothing running.
    Idle,
    /// Session start in progress.
    Starting,
    /// All links launched.
    Active,
    /// Session stop in progress.
    Stopping,
    /// Start request ignored, a session is already running.
    AlreadyRunning,
    /// Stop request ignored, nothing is running.
    NotRunning,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Connecting => f.write_str("connecting"),
            LinkStatus::Connected => f.write_str("connected"),
            LinkStatus::Streaming => f.write_str("streaming"),
            LinkStatus::Disconnected => f.write_str("disconnected"),
            LinkStatus::Error(cause) => write!(f, "error: {}", cause),
            LinkStatus::Playing => f.write_str("playing"),
            LinkStatus::Finished => f.write_str("finished"),
            LinkStatus::Cancelled => f.write_str("cancelled"),
            LinkStatus::AlreadyPlaying => f.write_str("already playing"),
            LinkStatus::Idle => f.write_str("idle"),
            LinkStatus::Starting => f.write_str("starting"),
            LinkStatus::Active => f.write_str("active"),
            LinkStatus::Stopping => f.write_str("stopping"),
            LinkStatus::AlreadyRunning => f.write_str("already running"),
            LinkStatus::NotRunning => f.write_str("not running"),
        }
    }
}

impl LinkStatus {
    /// Terminal states end a link's run; at most one is emitted per run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkStatus::Disconnected
                | LinkStatus::Error(_)
                | LinkStatus::Finished
                | LinkStatus::Cancelled
        )
    }
}

/// One status transition of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub link: LinkId,
    pub status: LinkStatus,
}

type Observer = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Fan-out point for status events.
///
/// Delivery is best effort: a panicking or slow observer is the observer's
/// problem, the bus itself never fails a publish.
#[derive(Clone, Default)]
pub struct StatusBus {
    observers: Arc<RwLock<Vec<Observer>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every event published after this call.
    pub fn register<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Register a channel-backed observer and return its receiving end.
    ///
    /// Events published while the receiver is alive are queued without
    /// bound; once the receiver is dropped further events are discarded.
    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = unbounded();
        self.register(move |event: &StatusEvent| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Publish one status transition to all observers, inline.
    pub fn publish(&self, link: LinkId, status: LinkStatus) {
        debug!(link = %link, status = %status, "status");
        let event = StatusEvent { link, status };
        for observer in self.observers.read().iter() {
            observer(&event);
        }
    }
}

impl fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBus")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}
