//! # Event Bus System
//!
//! Broadcasts sync engine activity to any interested observer (tray UI, REST
//! status endpoint, tests) using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`ServerEvent`] for engine lifecycle, [`SyncEvent`] for
//!   loop iterations and individual transfers
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Receiver wrapper with optional filtering
//!
//! Emitting never blocks the engine. With no subscriber attached `emit`
//! returns an error that publishers ignore.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, ServerEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Server(ServerEvent::Started {
//!     local_site: "ws-01".to_string(),
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Sync server started");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Engine lifecycle events
    Server(ServerEvent),
    /// Loop and transfer events
    Sync(SyncEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Server(e) => e.description(),
            CoreEvent::Sync(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Server(ServerEvent::Crashed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::ProjectFailed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::TransferFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Server(_) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::TransferFinished { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Server Events
// ============================================================================

/// Sync engine lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// The coordinator task is up.
    Started {
        /// This machine's local site id.
        local_site: String,
    },
    /// The coordinator exited after a stop request.
    Stopped,
    /// The coordinator exited on an unexpected failure.
    Crashed {
        /// Human-readable failure description.
        message: String,
    },
    /// Transfers were paused or resumed for the whole server.
    PauseChanged {
        paused: bool,
    },
}

impl ServerEvent {
    fn description(&self) -> &str {
        match self {
            ServerEvent::Started { .. } => "Sync server started",
            ServerEvent::Stopped => "Sync server stopped",
            ServerEvent::Crashed { .. } => "Sync server crashed",
            ServerEvent::PauseChanged { .. } => "Sync server pause changed",
        }
    }
}

// ============================================================================
// Sync Events
// ============================================================================

/// Direction of a file transfer relative to this machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// Loop iteration and transfer events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// One project's iteration began.
    LoopStarted {
        project: String,
        active_site: String,
        remote_site: String,
    },
    /// One project's iteration finished and its results were persisted.
    LoopFinished {
        project: String,
        /// Transfers scheduled in this iteration.
        scheduled: usize,
        /// Transfers that failed.
        failed: usize,
        duration_ms: u64,
    },
    /// A file was transferred.
    TransferFinished {
        project: String,
        representation_id: String,
        file_id: String,
        site: String,
        direction: TransferDirection,
    },
    /// A file transfer failed and its retry counter was incremented.
    TransferFailed {
        project: String,
        representation_id: String,
        file_id: String,
        site: String,
        direction: TransferDirection,
        message: String,
    },
    /// Progress of a running transfer, throttled by the engine.
    TransferProgress {
        project: String,
        file_id: String,
        site: String,
        progress: f32,
    },
    /// One project's iteration failed; other projects continue.
    ProjectFailed {
        project: String,
        message: String,
        /// Whether the next iteration is expected to recover.
        retryable: bool,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::LoopStarted { .. } => "Sync iteration started",
            SyncEvent::LoopFinished { .. } => "Sync iteration finished",
            SyncEvent::TransferFinished { .. } => "File transferred",
            SyncEvent::TransferFailed { .. } => "File transfer failed",
            SyncEvent::TransferProgress { .. } => "File transfer in progress",
            SyncEvent::ProjectFailed { .. } => "Project sync failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to engine events.
///
/// Cloning the bus is cheap; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(16);
/// let failures = EventStream::new(bus.subscribe())
///     .filter(|event| event.severity() >= core_runtime::events::EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive a matching event without waiting.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(file_id: &str) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::TransferFinished {
            project: "P1".to_string(),
            representation_id: "r1".to_string(),
            file_id: file_id.to_string(),
            site: "gdrive".to_string(),
            direction: TransferDirection::Upload,
        })
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(CoreEvent::Server(ServerEvent::Stopped)).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = finished("f1");
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Server(_)));

        bus.emit(finished("f1")).ok();
        bus.emit(CoreEvent::Server(ServerEvent::Stopped)).ok();

        let received = stream.recv().await.unwrap();
        assert_eq!(received, CoreEvent::Server(ServerEvent::Stopped));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(finished(&format!("f{}", i))).ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Sync(SyncEvent::ProjectFailed {
            project: "P1".to_string(),
            message: "bad settings".to_string(),
            retryable: false,
        });
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(finished("f1").severity(), EventSeverity::Info);

        let progress = CoreEvent::Sync(SyncEvent::TransferProgress {
            project: "P1".to_string(),
            file_id: "f1".to_string(),
            site: "gdrive".to_string(),
            progress: 0.5,
        });
        assert_eq!(progress.severity(), EventSeverity::Debug);
        assert_eq!(progress.description(), "File transfer in progress");
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Sync(SyncEvent::TransferFailed {
            project: "P1".to_string(),
            representation_id: "r1".to_string(),
            file_id: "f1".to_string(),
            site: "gdrive".to_string(),
            direction: TransferDirection::Download,
            message: "timeout".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"direction\":\"download\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_try_recv() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe());
        assert!(stream.try_recv().is_none());

        bus.emit(finished("f1")).ok();
        let received = stream.try_recv().unwrap().unwrap();
        assert_eq!(received, finished("f1"));
    }
}
