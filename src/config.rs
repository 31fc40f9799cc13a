//! Workspace configuration types

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-workspace engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    /// Number of display panels per queue channel (panel 0 is the queue itself)
    pub panel_count: usize,
    /// Capacity of the lifecycle event broadcast channel
    pub event_capacity: usize,
    /// Interval between periodic backups; `None` disables tick backups
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde"
    )]
    pub backup_interval: Option<Duration>,
    /// Waiting longer than this is reported by the monitor
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde"
    )]
    pub long_wait_threshold: Option<Duration>,
    /// Notify queue subscribers when a helper starts a session
    #[serde(default = "default_notify_on_open")]
    pub notify_on_open: bool,
}

fn default_notify_on_open() -> bool {
    true
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            panel_count: 1,
            event_capacity: 256,
            backup_interval: Some(Duration::from_secs(30 * 60)),
            long_wait_threshold: None,
            notify_on_open: true,
        }
    }
}

impl WorkspaceConfig {
    /// Create a configuration with the given panel count
    pub fn new(panel_count: usize) -> Self {
        Self {
            panel_count,
            ..Self::default()
        }
    }

    /// Set the event channel capacity (builder pattern)
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the periodic backup interval (builder pattern)
    pub fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = Some(interval);
        self
    }

    /// Disable periodic backups (builder pattern)
    pub fn without_periodic_backup(mut self) -> Self {
        self.backup_interval = None;
        self
    }

    /// Set the long-wait warning threshold (builder pattern)
    pub fn with_long_wait_threshold(mut self, threshold: Duration) -> Self {
        self.long_wait_threshold = Some(threshold);
        self
    }

    /// Set whether starting a session notifies subscribers (builder pattern)
    pub fn with_notify_on_open(mut self, notify: bool) -> Self {
        self.notify_on_open = notify;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.panel_count == 0 {
            return Err(QueueError::ConfigError(
                "panel_count must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::ConfigError(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.backup_interval == Some(Duration::ZERO) {
            return Err(QueueError::ConfigError(
                "backup_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
