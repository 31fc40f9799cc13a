//! Workspace backup and restore
//!
//! A workspace hands a [`WorkspaceBackup`] to its [`BackupStore`] on demand,
//! on the periodic tick and right before it is removed from the registry. On
//! creation it asks the store for the last backup and restores queues from it.
//! Restored queues start closed; their waiting lists are kept.

use crate::config::WorkspaceConfig;
use crate::error::{QueueError, Result};
use crate::queue::{HelpQueue, ParticipantId, QueueId, WaitingEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

/// Persisted form of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBackup {
    pub id: QueueId,
    pub name: String,
    #[serde(default)]
    pub waiting: Vec<WaitingEntry>,
    #[serde(default)]
    pub authorized_helpers: Vec<ParticipantId>,
    #[serde(default)]
    pub notify_subscribers: Vec<ParticipantId>,
}

impl QueueBackup {
    pub fn from_queue(queue: &HelpQueue) -> Self {
        Self {
            id: queue.id().to_string(),
            name: queue.name().to_string(),
            waiting: queue.waiting().cloned().collect(),
            authorized_helpers: queue.authorized_helpers().cloned().collect(),
            notify_subscribers: queue.notify_subscribers().cloned().collect(),
        }
    }

    pub fn into_queue(self) -> HelpQueue {
        HelpQueue::restore(
            self.id,
            self.name,
            self.waiting,
            self.authorized_helpers.into_iter().collect(),
            self.notify_subscribers.into_iter().collect(),
        )
    }
}

/// Persisted form of a workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBackup {
    pub workspace_id: String,
    pub saved_at: DateTime<Utc>,
    /// Queues in creation order
    pub queues: Vec<QueueBackup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<WorkspaceConfig>,
}

/// Backup collaborator
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Last backup of a workspace, if any
    async fn load_backup(&self, workspace_id: &str) -> Result<Option<WorkspaceBackup>>;

    /// Replace the backup of `backup.workspace_id`
    async fn save_backup(&self, backup: &WorkspaceBackup) -> Result<()>;

    /// Forget a workspace's backup
    async fn delete_backup(&self, workspace_id: &str) -> Result<()>;
}

/// Backup store that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    backups: RwLock<HashMap<String, WorkspaceBackup>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn load_backup(&self, workspace_id: &str) -> Result<Option<WorkspaceBackup>> {
        Ok(self.backups.read().await.get(workspace_id).cloned())
    }

    async fn save_backup(&self, backup: &WorkspaceBackup) -> Result<()> {
        self.backups
            .write()
            .await
            .insert(backup.workspace_id.clone(), backup.clone());
        Ok(())
    }

    async fn delete_backup(&self, workspace_id: &str) -> Result<()> {
        self.backups.write().await.remove(workspace_id);
        Ok(())
    }
}

/// Backup store writing one JSON file per workspace
pub struct LocalBackupStore {
    backup_dir: PathBuf,
}

impl LocalBackupStore {
    /// Create a store under `backup_dir`, creating the directory if needed
    pub async fn new(backup_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&backup_dir)
            .await
            .map_err(|e| QueueError::Backup(format!("Failed to create backup directory: {}", e)))?;
        Ok(Self { backup_dir })
    }

    fn backup_path(&self, workspace_id: &str) -> PathBuf {
        let safe: String = workspace_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.backup_dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    async fn load_backup(&self, workspace_id: &str) -> Result<Option<WorkspaceBackup>> {
        let data = match fs::read_to_string(self.backup_path(workspace_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(QueueError::Backup(format!(
                    "Failed to read backup file: {}",
                    e
                )))
            }
        };
        let backup = serde_json::from_str(&data)
            .map_err(|e| QueueError::Backup(format!("Failed to parse backup: {}", e)))?;
        Ok(Some(backup))
    }

    async fn save_backup(&self, backup: &WorkspaceBackup) -> Result<()> {
        let json = serde_json::to_string_pretty(backup)
            .map_err(|e| QueueError::Backup(format!("Failed to serialize backup: {}", e)))?;
        let path = self.backup_path(&backup.workspace_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| QueueError::Backup(format!("Failed to write backup file: {}", e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| QueueError::Backup(format!("Failed to replace backup file: {}", e)))?;
        Ok(())
    }

    async fn delete_backup(&self, workspace_id: &str) -> Result<()> {
        match fs::remove_file(self.backup_path(workspace_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::Backup(format!(
                "Failed to delete backup file: {}",
                e
            ))),
        }
    }
}
