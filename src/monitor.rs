//! Workspace monitor driving periodic ticks and health logging

use crate::registry::WorkspaceRegistry;
use crate::WorkspaceStats;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Workspace monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick interval
    pub interval: Duration,
    /// Warning threshold for participants waiting in one workspace
    pub waiting_warning_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            waiting_warning_threshold: 50,
        }
    }
}

/// Ticks every registered workspace on an interval
pub struct WorkspaceMonitor {
    registry: Arc<WorkspaceRegistry>,
    config: MonitorConfig,
}

impl WorkspaceMonitor {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self::with_config(registry, MonitorConfig::default())
    }

    pub fn with_config(registry: Arc<WorkspaceRegistry>, config: MonitorConfig) -> Self {
        Self { registry, config }
    }

    /// Start ticking in the background
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.interval);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                self.tick_all().await;
            }
        })
    }

    /// Tick every workspace once and log its health
    pub async fn tick_all(&self) {
        for workspace in self.registry.all() {
            let report = workspace.tick().await;
            if !report.is_clean() {
                warn!(
                    "Workspace {}: {} extension failure(s) on tick",
                    workspace.id(),
                    report.failures.len()
                );
            }

            let stats = workspace.stats().await;
            debug!(
                "Workspace {}: waiting={}, open_queues={}, active_helpers={}",
                workspace.id(),
                stats.total_waiting,
                stats.open_queues,
                stats.active_helpers
            );
            self.check_health(workspace.id(), &stats);
        }
    }

    fn check_health(&self, workspace_id: &str, stats: &WorkspaceStats) {
        if stats.total_waiting > self.config.waiting_warning_threshold {
            warn!(
                "High number of waiting participants in {}: {} (threshold: {})",
                workspace_id, stats.total_waiting, self.config.waiting_warning_threshold
            );
        }

        for (queue_id, status) in &stats.queues {
            if status.waiting > 0 && !status.is_open {
                warn!(
                    "Queue {} in {} is closed with {} participant(s) waiting",
                    queue_id, workspace_id, status.waiting
                );
            }
        }
    }
}
