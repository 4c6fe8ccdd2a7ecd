//! Workspace registry
//!
//! Maps workspace ids to their hub, spawning a hub the first time a
//! workspace receives a connection.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::AppError;
use crate::hub::{Collaborators, Hub, HubHandle};
use crate::types::WorkspaceId;

pub struct Workspaces {
    hubs: RwLock<HashMap<WorkspaceId, HubHandle>>,
    backends: Collaborators,
    room_idle_grace: Duration,
}

impl Workspaces {
    pub fn new(backends: Collaborators, room_idle_grace: Duration) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            backends,
            room_idle_grace,
        }
    }

    pub async fn get(&self, workspace_id: &WorkspaceId) -> Option<HubHandle> {
        self.hubs.read().await.get(workspace_id).cloned()
    }

    /// Hub of `workspace_id`, started on first use
    pub async fn get_or_spawn(&self, workspace_id: &WorkspaceId) -> Result<HubHandle, AppError> {
        if let Some(hub) = self.get(workspace_id).await {
            return Ok(hub);
        }

        let mut hubs = self.hubs.write().await;
        // Another connection may have won the race for the write lock
        if let Some(hub) = hubs.get(workspace_id) {
            return Ok(hub.clone());
        }
        let hub = Hub::spawn(
            workspace_id.clone(),
            self.backends.clone(),
            self.room_idle_grace,
        )
        .await?;
        info!(workspace_id = %workspace_id, "Hub spawned");
        hubs.insert(workspace_id.clone(), hub.clone());
        Ok(hub)
    }

    pub async fn len(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pubsub::MemoryPubSub;
    use crate::store::{MemoryMessageStore, MemoryRoomStore};

    fn workspaces() -> Workspaces {
        let backends = Collaborators {
            pubsub: Arc::new(MemoryPubSub::new()),
            rooms: Arc::new(MemoryRoomStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
        };
        Workspaces::new(backends, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_one_hub_per_workspace() {
        let registry = workspaces();
        assert!(registry.is_empty().await);

        let w1 = WorkspaceId::new("w1");
        let first = registry.get_or_spawn(&w1).await.unwrap();
        let again = registry.get_or_spawn(&w1).await.unwrap();
        let other = registry.get_or_spawn(&WorkspaceId::new("w2")).await.unwrap();

        assert_eq!(first.workspace_id(), again.workspace_id());
        assert_eq!(other.workspace_id().as_str(), "w2");
        assert_eq!(registry.len().await, 2);
        assert!(registry.get(&WorkspaceId::new("w3")).await.is_none());
    }
}
