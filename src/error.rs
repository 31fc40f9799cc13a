//! Error types for the office-hours queue engine
//!
//! All errors implement `std::error::Error` via `thiserror::Error`.
//!
//! # Error Handling
//!
//! [`QueueError`] variants fall into four kinds (see [`ErrorKind`]):
//! - Usage errors: the caller asked for something the current state forbids
//!   (queue already open, not hosting, duplicate enqueue, ...). These are
//!   always raised before any state is mutated and are safe to show to users.
//! - Render-safety errors: the queue display cannot be edited in place and an
//!   explicit cleanup is needed.
//! - External errors: a collaborator (transport, backup, extension) failed.
//! - Internal errors: anything else.
//!
//! # Example
//!
//! ```rust,ignore
//! use office_hours_queue::{QueueError, ErrorKind};
//!
//! match workspace.serve_next("helper-1", None, None).await {
//!     Ok(served) => println!("next up: {}", served.entry.participant_id),
//!     Err(e) if e.kind() == ErrorKind::Usage => reply_to_user(&e.to_string()),
//!     Err(e) => tracing::error!(error = %e, "serve_next failed"),
//! }
//! ```

use thiserror::Error;

/// Office-hours queue error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No queue with this id exists in the workspace
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Another queue in the workspace already uses this name
    #[error("A queue named '{0}' already exists")]
    QueueNameTaken(String),

    /// Opening a queue that is already open
    #[error("Queue '{0}' is already open")]
    AlreadyOpen(String),

    /// Closing a queue that is already closed
    #[error("Queue '{0}' is already closed")]
    AlreadyClosed(String),

    /// Joining a closed queue
    #[error("Queue '{0}' is not open")]
    QueueNotOpen(String),

    /// Joining a queue the participant is already waiting in
    #[error("You are already in queue '{0}'")]
    AlreadyInQueue(String),

    /// Helper is not authorized for the queue
    #[error("You don't have permission to help in queue '{0}'")]
    NoPermission(String),

    /// Dequeue from an empty queue (or a targeted participant who is absent)
    #[error("Queue '{0}' has no one waiting")]
    EmptyQueue(String),

    /// The helper has no active session
    #[error("You are not currently hosting")]
    NotHosting,

    /// The helper's session is paused
    #[error("Your helping session is paused")]
    HelperPaused,

    /// The helper's session is already active
    #[error("Your helping session is not paused")]
    HelperNotPaused,

    /// None of the helper's open queues has anyone waiting
    #[error("There is no one left to help")]
    NoOneToHelp,

    /// The participant is not authorized for any queue
    #[error("You are not authorized to help in any queue")]
    NoAuthorizedQueues,

    /// Starting a second session without stopping the first
    #[error("You are already hosting")]
    AlreadyHosting,

    /// An active helper tried to join a queue
    #[error("Helpers cannot join a queue while hosting")]
    HelperCannotEnqueue,

    /// A waiting participant tried to start helping
    #[error("Leave queue '{0}' before you start helping")]
    HelperInQueue(String),

    /// Subscribing twice to the same queue's notifications
    #[error("You are already subscribed to queue '{0}'")]
    AlreadySubscribed(String),

    /// Unsubscribing from notifications the participant never subscribed to
    #[error("You are not subscribed to queue '{0}'")]
    NotSubscribed(String),

    /// The display panel cannot be edited in place; a cleanup is required
    #[error("Unsafe to render panel {panel} in channel {channel_id}; cleanup required")]
    UnsafeRender { channel_id: String, panel: usize },

    /// The panel index is outside the guard's panel range
    #[error("Panel {0} does not exist")]
    PanelOutOfRange(usize),

    /// The attendance record of this session was already exported
    #[error("Attendance for helper {0} was already exported")]
    AttendanceAlreadyExported(String),

    /// No workspace with this id is registered
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// A workspace with this id is already registered
    #[error("Workspace already registered: {0}")]
    WorkspaceExists(String),

    /// Render or notification transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backup collaborator failed
    #[error("Backup error: {0}")]
    Backup(String),

    /// One or more extensions failed while handling an event
    #[error("Extension error: {0}")]
    Extension(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Broad classification of a [`QueueError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-correctable; reported back as a message
    Usage,
    /// Display needs a manual cleanup before further edits
    RenderSafety,
    /// A best-effort collaborator failed
    External,
    /// Unexpected failure
    Internal,
}

impl QueueError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::UnsafeRender { .. } => ErrorKind::RenderSafety,
            QueueError::Transport(_) | QueueError::Backup(_) | QueueError::Extension(_) => {
                ErrorKind::External
            }
            QueueError::ConfigError(_) | QueueError::Other(_) => ErrorKind::Internal,
            _ => ErrorKind::Usage,
        }
    }

    /// True for errors that should be shown to the caller as-is
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_not_found_error() {
        let error = QueueError::QueueNotFound("math".to_string());
        assert_eq!(error.to_string(), "Queue not found: math");
    }

    #[test]
    fn test_already_open_error() {
        let error = QueueError::AlreadyOpen("Math".to_string());
        assert_eq!(error.to_string(), "Queue 'Math' is already open");
    }

    #[test]
    fn test_unsafe_render_error() {
        let error = QueueError::UnsafeRender {
            channel_id: "c1".to_string(),
            panel: 0,
        };
        assert_eq!(
            error.to_string(),
            "Unsafe to render panel 0 in channel c1; cleanup required"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(QueueError::NotHosting.kind(), ErrorKind::Usage);
        assert_eq!(QueueError::NoOneToHelp.kind(), ErrorKind::Usage);
        assert_eq!(
            QueueError::UnsafeRender {
                channel_id: "c".into(),
                panel: 1
            }
            .kind(),
            ErrorKind::RenderSafety
        );
        assert_eq!(
            QueueError::Backup("disk full".into()).kind(),
            ErrorKind::External
        );
        assert_eq!(QueueError::Other("boom".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_is_usage() {
        assert!(QueueError::AlreadyHosting.is_usage());
        assert!(!QueueError::Transport("timeout".into()).is_usage());
    }

    #[test]
    fn test_error_debug() {
        let error = QueueError::EmptyQueue("test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("EmptyQueue"));
    }
}
