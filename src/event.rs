//! Lifecycle event stream
//!
//! Every workspace owns an [`EventEmitter`]. Mutating operations emit a
//! [`WorkspaceEvent`] keyed by one of the [`events`] constants so hosts can
//! observe the engine without registering an extension. Emitting never
//! blocks and never fails; events sent while nobody listens are dropped.

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event fields
pub type EventFields = serde_json::Map<String, serde_json::Value>;

/// Workspace lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    /// Event key (e.g., "queue.opened", "helper.started")
    pub key: EventKey,

    /// Workspace the event happened in
    pub workspace_id: String,

    /// Structured details (queue_id, participant_id, ...)
    #[serde(default)]
    pub fields: EventFields,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl WorkspaceEvent {
    /// Create an event without fields
    pub fn new(key: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            workspace_id: workspace_id.into(),
            fields: EventFields::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add a field (builder pattern)
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Read a string field
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// Event emitter bound to one workspace
#[derive(Clone)]
pub struct EventEmitter {
    workspace_id: Arc<str>,
    sender: Arc<broadcast::Sender<WorkspaceEvent>>,
}

impl EventEmitter {
    pub fn new(workspace_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            workspace_id: Arc::from(workspace_id.into()),
            sender: Arc::new(sender),
        }
    }

    /// Start an event for this workspace; finish with [`EventEmitter::emit`]
    pub fn event(&self, key: &str) -> WorkspaceEvent {
        WorkspaceEvent::new(key, self.workspace_id.as_ref())
    }

    pub fn emit(&self, event: WorkspaceEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&WorkspaceEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<WorkspaceEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to every event of the workspace
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

/// Stream of workspace events.
///
/// Use `.next().await` via `StreamExt` from `tokio_stream` or `futures`, or
/// the convenience [`EventStream::recv`].
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = WorkspaceEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = WorkspaceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<WorkspaceEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Queue events
    pub const QUEUE_CREATED: &str = "queue.created";
    pub const QUEUE_DELETED: &str = "queue.deleted";
    pub const QUEUE_OPENED: &str = "queue.opened";
    pub const QUEUE_CLOSED: &str = "queue.closed";
    pub const QUEUE_CLEARED: &str = "queue.cleared";
    pub const PARTICIPANT_ENQUEUED: &str = "queue.participant.enqueued";
    pub const PARTICIPANT_LEFT: &str = "queue.participant.left";
    pub const PARTICIPANT_DEQUEUED: &str = "queue.participant.dequeued";

    // Helper events
    pub const HELPER_STARTED: &str = "helper.started";
    pub const HELPER_STOPPED: &str = "helper.stopped";
    pub const HELPER_PAUSED: &str = "helper.paused";
    pub const HELPER_RESUMED: &str = "helper.resumed";

    // Session presence events
    pub const SESSION_JOINED: &str = "session.participant.joined";
    pub const SESSION_LEFT: &str = "session.participant.left";

    // Display and side-channel events
    pub const DISPLAY_CLEANUP_REQUIRED: &str = "display.cleanup_required";
    pub const DISPLAY_CLEANED: &str = "display.cleaned";
    pub const EXTENSION_FAILED: &str = "extension.failed";
    pub const BACKUP_SAVED: &str = "backup.saved";
    pub const BACKUP_FAILED: &str = "backup.failed";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_fields() {
        let event = WorkspaceEvent::new(events::QUEUE_OPENED, "ws1")
            .with("queue_id", "chan-math")
            .with("position", 3);

        assert_eq!(event.key, "queue.opened");
        assert_eq!(event.workspace_id, "ws1");
        assert_eq!(event.field_str("queue_id"), Some("chan-math"));
        assert_eq!(event.fields["position"], serde_json::json!(3));
        assert!(event.field_str("missing").is_none());
    }

    #[test]
    fn test_event_timestamp() {
        let before = chrono::Utc::now();
        let event = WorkspaceEvent::new("test.event", "ws1");
        let after = chrono::Utc::now();

        assert!(event.timestamp >= before);
        assert!(event.timestamp <= after);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let emitter = EventEmitter::new("ws1", 4);
        emitter.emit(emitter.event(events::QUEUE_CREATED));
    }

    #[tokio::test]
    async fn test_emitter_stamps_workspace() {
        let emitter = EventEmitter::new("ws1", 16);
        let mut receiver = emitter.subscribe();

        emitter.emit(emitter.event(events::HELPER_STARTED).with("helper_id", "h1"));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.key, events::HELPER_STARTED);
        assert_eq!(event.workspace_id, "ws1");
        assert_eq!(event.field_str("helper_id"), Some("h1"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let emitter = EventEmitter::new("ws1", 16);
        let mut a = emitter.subscribe();
        let mut b = emitter.clone().subscribe();

        emitter.emit(emitter.event(events::QUEUE_CLOSED));

        assert_eq!(a.recv().await.unwrap().key, events::QUEUE_CLOSED);
        assert_eq!(b.recv().await.unwrap().key, events::QUEUE_CLOSED);
    }

    #[tokio::test]
    async fn test_filtered_stream() {
        let emitter = EventEmitter::new("ws1", 16);
        let mut stream = emitter.subscribe_filtered(|e| e.key.starts_with("helper."));

        emitter.emit(emitter.event(events::QUEUE_OPENED));
        emitter.emit(emitter.event(events::HELPER_STARTED));
        emitter.emit(emitter.event(events::PARTICIPANT_ENQUEUED));
        emitter.emit(emitter.event(events::HELPER_STOPPED));

        let first = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        assert_eq!(first.key, events::HELPER_STARTED);

        let second = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        assert_eq!(second.key, events::HELPER_STOPPED);
    }

    #[tokio::test]
    async fn test_stream_next() {
        use tokio_stream::StreamExt;

        let emitter = EventEmitter::new("ws1", 16);
        let mut stream = emitter.subscribe_stream();

        for key in [events::QUEUE_OPENED, events::PARTICIPANT_ENQUEUED] {
            emitter.emit(emitter.event(key));
        }
        for expected in [events::QUEUE_OPENED, events::PARTICIPANT_ENQUEUED] {
            let event = tokio::time::timeout(Duration::from_millis(200), stream.next())
                .await
                .expect("Timeout")
                .expect("Stream ended");
            assert_eq!(event.key, expected);
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkspaceEvent::new(events::SESSION_JOINED, "ws1").with("participant_id", "p1");
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("session.participant.joined"));
        assert!(json.contains("\"workspace_id\":\"ws1\""));
        assert!(json.contains("timestamp"));

        let parsed: WorkspaceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.field_str("participant_id"), Some("p1"));
    }

    #[test]
    fn test_event_catalog() {
        assert_eq!(events::QUEUE_OPENED, "queue.opened");
        assert_eq!(events::PARTICIPANT_DEQUEUED, "queue.participant.dequeued");
        assert_eq!(events::HELPER_STOPPED, "helper.stopped");
        assert_eq!(events::SESSION_LEFT, "session.participant.left");
        assert_eq!(events::DISPLAY_CLEANUP_REQUIRED, "display.cleanup_required");
        assert_eq!(events::EXTENSION_FAILED, "extension.failed");
    }
}
