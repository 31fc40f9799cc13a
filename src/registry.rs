//! Workspace registry
//!
//! Maps workspace ids to live [`Workspace`] aggregates. The hosting bot
//! joins a workspace when it is added to a community and leaves it when it
//! is removed; leaving saves a final backup before the aggregate is dropped.

use crate::error::QueueError;
use crate::workspace::{Workspace, WorkspaceBuilder, WorkspaceId};
use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Live workspaces by id
#[derive(Default)]
pub struct WorkspaceRegistry {
    workspaces: DashMap<WorkspaceId, Arc<Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    pub fn contains(&self, workspace_id: &str) -> bool {
        self.workspaces.contains_key(workspace_id)
    }

    pub fn get(&self, workspace_id: &str) -> Option<Arc<Workspace>> {
        self.workspaces.get(workspace_id).map(|w| Arc::clone(w.value()))
    }

    /// Like [`WorkspaceRegistry::get`], failing with `WorkspaceNotFound`
    pub fn require(&self, workspace_id: &str) -> crate::Result<Arc<Workspace>> {
        self.get(workspace_id)
            .ok_or_else(|| QueueError::WorkspaceNotFound(workspace_id.to_string()))
    }

    /// Ids of every live workspace, sorted
    pub fn ids(&self) -> Vec<WorkspaceId> {
        let mut ids: Vec<WorkspaceId> = self.workspaces.iter().map(|w| w.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Every live workspace, sorted by id
    pub fn all(&self) -> Vec<Arc<Workspace>> {
        let mut all: Vec<Arc<Workspace>> = self
            .workspaces
            .iter()
            .map(|w| Arc::clone(w.value()))
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Build a workspace (restoring its backup) and register it
    pub async fn join_workspace(&self, builder: WorkspaceBuilder) -> anyhow::Result<Arc<Workspace>> {
        let workspace_id = builder.id().to_string();
        if self.contains(&workspace_id) {
            return Err(QueueError::WorkspaceExists(workspace_id).into());
        }
        let workspace = builder
            .build()
            .await
            .with_context(|| format!("failed to build workspace {}", workspace_id))?;
        Ok(self.insert(workspace)?)
    }

    /// Register an already built workspace
    pub fn insert(&self, workspace: Workspace) -> crate::Result<Arc<Workspace>> {
        match self.workspaces.entry(workspace.id().to_string()) {
            Entry::Occupied(entry) => Err(QueueError::WorkspaceExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                let workspace = Arc::new(workspace);
                entry.insert(Arc::clone(&workspace));
                tracing::info!(workspace_id = %workspace.id(), "workspace joined");
                Ok(workspace)
            }
        }
    }

    /// Save a last backup and drop the workspace. A failed backup is logged
    /// and the workspace is removed anyway.
    pub async fn leave_workspace(&self, workspace_id: &str) -> anyhow::Result<Arc<Workspace>> {
        let workspace = self
            .require(workspace_id)
            .context("cannot leave workspace")?;
        if let Err(e) = workspace.backup_now().await {
            tracing::warn!(workspace_id, error = %e, "final backup failed");
        }
        let (_, workspace) = self
            .workspaces
            .remove(workspace_id)
            .ok_or_else(|| QueueError::WorkspaceNotFound(workspace_id.to_string()))
            .context("workspace removed concurrently")?;
        tracing::info!(workspace_id, "workspace left");
        Ok(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupStore, MemoryBackupStore};
    use crate::transport::testing::MockTransport;

    fn builder(id: &str) -> WorkspaceBuilder {
        WorkspaceBuilder::new(id, Arc::new(MockTransport::new()))
    }

    #[tokio::test]
    async fn test_join_and_lookup() {
        let registry = WorkspaceRegistry::new();
        assert!(registry.is_empty());

        let ws = registry.join_workspace(builder("ws1")).await.unwrap();
        assert_eq!(ws.id(), "ws1");
        assert!(registry.contains("ws1"));
        assert_eq!(registry.get("ws1").unwrap().id(), "ws1");
        assert!(registry.get("ws2").is_none());
        assert!(matches!(
            registry.require("ws2"),
            Err(QueueError::WorkspaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_twice_fails() {
        let registry = WorkspaceRegistry::new();
        registry.join_workspace(builder("ws1")).await.unwrap();

        let err = match registry.join_workspace(builder("ws1")).await {
            Ok(_) => panic!("second join of ws1 succeeded"),
            Err(e) => e,
        };
        assert!(format!("{:?}", registry.require("ws1").unwrap()).contains("ws1"));
        assert_eq!(
            err.downcast_ref::<QueueError>(),
            Some(&QueueError::WorkspaceExists("ws1".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_ids_sorted() {
        let registry = WorkspaceRegistry::new();
        for id in ["b", "c", "a"] {
            registry.join_workspace(builder(id)).await.unwrap();
        }
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);
        let all: Vec<_> = registry.all().iter().map(|w| w.id().to_string()).collect();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_leave_saves_backup() {
        let store = Arc::new(MemoryBackupStore::new());
        let registry = WorkspaceRegistry::new();
        let ws = registry
            .join_workspace(builder("ws1").with_backup_store(store.clone()))
            .await
            .unwrap();
        ws.create_queue("q1", "Math").await.unwrap();

        registry.leave_workspace("ws1").await.unwrap();
        assert!(!registry.contains("ws1"));
        let backup = store.load_backup("ws1").await.unwrap().unwrap();
        assert_eq!(backup.queues[0].name, "Math");

        // rejoining restores the queue
        let ws = registry
            .join_workspace(builder("ws1").with_backup_store(store))
            .await
            .unwrap();
        assert_eq!(ws.queue("q1").await.unwrap().name, "Math");

        assert!(registry.leave_workspace("missing").await.is_err());
    }
}
