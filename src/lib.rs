//! # Office Hours Queue
//!
//! A queue and helper matching engine for chat-hosted office hours.
//!
//! ## Core (always compiled)
//!
//! - Per-queue FIFO waiting lines with open/closed state and helper authorization
//! - Cross-queue matching: a helper is given whoever has waited longest across
//!   every open queue they may serve
//! - Helping sessions with pause/resume, attendance and help-session statistics
//! - Render-safe queue displays that refuse to edit over foreign messages
//! - Concurrent best-effort extension fan-out and a lifecycle event stream
//! - Backup/restore (pluggable `BackupStore`, `LocalBackupStore` included)
//! - A `DashMap` registry of live workspaces
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `monitoring` | ✅ | — | `WorkspaceMonitor` periodic ticks and health warnings |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use office_hours_queue::{WorkspaceBuilder, WorkspaceRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = WorkspaceRegistry::new();
//!     let ws = registry
//!         .join_workspace(WorkspaceBuilder::new("guild-1", Arc::new(MyTransport::new())))
//!         .await?;
//!
//!     ws.create_queue("chan-math", "Math").await?;
//!     ws.authorize_helper("chan-math", "helper-1").await?;
//!     ws.start_helping("helper-1").await?;
//!
//!     ws.enqueue("chan-math", "student-1").await?;
//!     let served = ws.serve_next("helper-1", None, None).await?;
//!     println!("{} is up next", served.entry.participant_id);
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod backup;
pub mod clock;
pub mod config;
pub mod display;
pub mod error;
pub mod event;
pub mod extension;
pub mod helper;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod transport;
pub mod workspace;

// Feature-gated modules
#[cfg(feature = "monitoring")]
pub mod monitor;

// Core re-exports
pub use backup::{BackupStore, LocalBackupStore, MemoryBackupStore, QueueBackup, WorkspaceBackup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WorkspaceConfig;
pub use display::{DisplayGuard, RenderOutcome};
pub use error::{ErrorKind, QueueError, Result};
pub use event::{events, EventEmitter, EventStream, WorkspaceEvent};
pub use extension::{
    Extension, ExtensionEvent, ExtensionFailure, ExtensionSet, FanOutReport, LoggingExtension,
};
pub use helper::{Helper, HelperRegistry, HelperState};
pub use queue::{EnqueueOutcome, HelpQueue, ParticipantId, QueueId, QueueSnapshot, WaitingEntry};
pub use registry::WorkspaceRegistry;
pub use stats::{AttendanceEntry, HelpSessionEntry, StatsCollector};
pub use transport::{
    ChannelId, MessageId, NoopNotifier, RecentMessage, RenderPayload, RenderTransport,
    SessionInvite, SessionNotifier,
};
pub use workspace::{
    HelpingStarted, HelpingStopped, ServedParticipant, Workspace, WorkspaceBuilder, WorkspaceId,
    WorkspaceSnapshot,
};

// Feature-gated re-exports
#[cfg(feature = "monitoring")]
pub use monitor::{MonitorConfig, WorkspaceMonitor};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Workspace statistics snapshot
///
/// Provides a point-in-time view of every queue in one workspace.
///
/// # Fields
///
/// * `total_waiting` - Participants waiting across all queues
/// * `open_queues` - Queues currently open
/// * `active_helpers` - Helpers with a running session (paused included)
/// * `open_sessions` - Help sessions in progress
/// * `queues` - Per-queue status keyed by queue id
///
/// # Example
///
/// ```rust,ignore
/// let stats = workspace.stats().await;
/// println!("{} waiting, {} helpers on duty", stats.total_waiting, stats.active_helpers);
///
/// for (queue_id, status) in &stats.queues {
///     println!("{} ({}): {} waiting, open={}", status.name, queue_id, status.waiting, status.is_open);
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceStats {
    pub total_waiting: usize,
    pub open_queues: usize,
    pub active_helpers: usize,
    pub open_sessions: usize,
    pub queues: HashMap<QueueId, QueueStatus>,
}

/// Status of one queue inside [`WorkspaceStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub is_open: bool,
    pub waiting: usize,
    pub hosts: usize,
    /// How long the head of the line has waited
    pub longest_wait_ms: Option<u64>,
}
