//! Extension fan-out
//!
//! Extensions are best-effort observers (attendance logging, backups to a
//! document store, calendar refresh). They receive read-only snapshots and
//! can only do their own I/O. For each event every extension is called
//! concurrently; the broadcast waits for all of them and reports failures
//! instead of stopping at the first one. Nothing an extension does can undo
//! the engine mutation that produced the event.

use crate::error::{QueueError, Result};
use crate::helper::Helper;
use crate::queue::{QueueSnapshot, WaitingEntry};
use crate::stats::{AttendanceEntry, HelpSessionEntry};
use crate::workspace::WorkspaceSnapshot;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Lifecycle observer
///
/// Every hook defaults to a no-op so an extension only implements what it needs.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    async fn on_queue_create(&self, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_queue_delete(&self, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_queue_open(&self, _queue: &QueueSnapshot, _helper_id: &str) -> Result<()> {
        Ok(())
    }

    async fn on_queue_close(&self, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_enqueue(&self, _queue: &QueueSnapshot, _entry: &WaitingEntry) -> Result<()> {
        Ok(())
    }

    async fn on_dequeue(
        &self,
        _queue: &QueueSnapshot,
        _entry: &WaitingEntry,
        _helper_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_helper_start(&self, _helper: &Helper) -> Result<()> {
        Ok(())
    }

    async fn on_helper_stop(&self, _helper: &Helper, _attendance: &AttendanceEntry) -> Result<()> {
        Ok(())
    }

    async fn on_student_join_session(&self, _sessions: &[HelpSessionEntry]) -> Result<()> {
        Ok(())
    }

    async fn on_student_leave_session(&self, _sessions: &[HelpSessionEntry]) -> Result<()> {
        Ok(())
    }

    async fn on_display_unsafe(&self, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn on_tick(&self, _workspace: &WorkspaceSnapshot) -> Result<()> {
        Ok(())
    }
}

/// An event delivered to extensions
#[derive(Debug, Clone)]
pub enum ExtensionEvent {
    QueueCreate(QueueSnapshot),
    QueueDelete(QueueSnapshot),
    QueueOpen {
        queue: QueueSnapshot,
        helper_id: String,
    },
    QueueClose(QueueSnapshot),
    Enqueue {
        queue: QueueSnapshot,
        entry: WaitingEntry,
    },
    Dequeue {
        queue: QueueSnapshot,
        entry: WaitingEntry,
        helper_id: String,
    },
    HelperStart(Helper),
    HelperStop {
        helper: Helper,
        attendance: AttendanceEntry,
    },
    StudentJoinSession(Vec<HelpSessionEntry>),
    StudentLeaveSession(Vec<HelpSessionEntry>),
    DisplayUnsafe(QueueSnapshot),
    Tick(Arc<WorkspaceSnapshot>),
}

impl ExtensionEvent {
    /// Hook name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ExtensionEvent::QueueCreate(_) => "on_queue_create",
            ExtensionEvent::QueueDelete(_) => "on_queue_delete",
            ExtensionEvent::QueueOpen { .. } => "on_queue_open",
            ExtensionEvent::QueueClose(_) => "on_queue_close",
            ExtensionEvent::Enqueue { .. } => "on_enqueue",
            ExtensionEvent::Dequeue { .. } => "on_dequeue",
            ExtensionEvent::HelperStart(_) => "on_helper_start",
            ExtensionEvent::HelperStop { .. } => "on_helper_stop",
            ExtensionEvent::StudentJoinSession(_) => "on_student_join_session",
            ExtensionEvent::StudentLeaveSession(_) => "on_student_leave_session",
            ExtensionEvent::DisplayUnsafe(_) => "on_display_unsafe",
            ExtensionEvent::Tick(_) => "on_tick",
        }
    }

    async fn deliver(&self, extension: &dyn Extension) -> Result<()> {
        match self {
            ExtensionEvent::QueueCreate(q) => extension.on_queue_create(q).await,
            ExtensionEvent::QueueDelete(q) => extension.on_queue_delete(q).await,
            ExtensionEvent::QueueOpen { queue, helper_id } => {
                extension.on_queue_open(queue, helper_id).await
            }
            ExtensionEvent::QueueClose(q) => extension.on_queue_close(q).await,
            ExtensionEvent::Enqueue { queue, entry } => extension.on_enqueue(queue, entry).await,
            ExtensionEvent::Dequeue {
                queue,
                entry,
                helper_id,
            } => extension.on_dequeue(queue, entry, helper_id).await,
            ExtensionEvent::HelperStart(h) => extension.on_helper_start(h).await,
            ExtensionEvent::HelperStop { helper, attendance } => {
                extension.on_helper_stop(helper, attendance).await
            }
            ExtensionEvent::StudentJoinSession(s) => extension.on_student_join_session(s).await,
            ExtensionEvent::StudentLeaveSession(s) => {
                extension.on_student_leave_session(s).await
            }
            ExtensionEvent::DisplayUnsafe(q) => extension.on_display_unsafe(q).await,
            ExtensionEvent::Tick(w) => extension.on_tick(w).await,
        }
    }
}

/// One extension's failure while handling an event
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionFailure {
    pub extension: String,
    pub event: &'static str,
    pub error: QueueError,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failures: Vec<ExtensionFailure>,
}

impl FanOutReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse failures into a single error, if any
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let summary = self
            .failures
            .iter()
            .map(|f| format!("{}.{}: {}", f.extension, f.event, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(QueueError::Extension(summary))
    }
}

/// The extensions loaded for one workspace
#[derive(Clone, Default)]
pub struct ExtensionSet {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        tracing::debug!(extension = extension.name(), "extension registered");
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Deliver `event` to every extension concurrently and wait for all
    pub async fn broadcast(&self, event: &ExtensionEvent) -> FanOutReport {
        let calls = self.extensions.iter().map(|extension| async move {
            let outcome = event.deliver(extension.as_ref()).await;
            (extension.name().to_string(), outcome)
        });

        let mut report = FanOutReport::default();
        for (extension, outcome) in join_all(calls).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        extension = %extension,
                        event = event.name(),
                        error = %error,
                        "extension failed"
                    );
                    report.failures.push(ExtensionFailure {
                        extension,
                        event: event.name(),
                        error,
                    });
                }
            }
        }
        report
    }
}

/// Extension that writes every lifecycle event to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExtension;

#[async_trait]
impl Extension for LoggingExtension {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_queue_open(&self, queue: &QueueSnapshot, helper_id: &str) -> Result<()> {
        tracing::info!(queue = %queue.name, helper_id, "queue opened");
        Ok(())
    }

    async fn on_queue_close(&self, queue: &QueueSnapshot) -> Result<()> {
        tracing::info!(queue = %queue.name, waiting = queue.waiting.len(), "queue closed");
        Ok(())
    }

    async fn on_enqueue(&self, queue: &QueueSnapshot, entry: &WaitingEntry) -> Result<()> {
        tracing::info!(
            queue = %queue.name,
            participant_id = %entry.participant_id,
            position = queue.waiting.len(),
            "participant joined queue"
        );
        Ok(())
    }

    async fn on_dequeue(
        &self,
        queue: &QueueSnapshot,
        entry: &WaitingEntry,
        helper_id: &str,
    ) -> Result<()> {
        tracing::info!(
            queue = %queue.name,
            participant_id = %entry.participant_id,
            helper_id,
            "participant matched"
        );
        Ok(())
    }

    async fn on_helper_stop(&self, helper: &Helper, attendance: &AttendanceEntry) -> Result<()> {
        tracing::info!(
            helper_id = %helper.id,
            served = attendance.served.len(),
            active_time_ms = attendance.active_time_ms,
            "helper stopped"
        );
        Ok(())
    }
}
