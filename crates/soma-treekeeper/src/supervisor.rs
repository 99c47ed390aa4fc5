//! Supervisor: registry of running tree keepers, one per repository.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use soma_state::{Repository, StateStore};

use crate::error::KeeperResult;
use crate::keeper::{TreeKeeper, TreeKeeperHandle};

/// How long a stopping keeper may take to drain its mailbox.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct KeeperSlot {
    handle: TreeKeeperHandle,
    task: JoinHandle<()>,
}

/// Owns the repository → keeper registry.
#[derive(Clone)]
pub struct Supervisor {
    store: StateStore,
    mailbox_capacity: usize,
    keepers: Arc<RwLock<HashMap<String, KeeperSlot>>>,
}

impl Supervisor {
    pub fn new(store: StateStore, mailbox_capacity: usize) -> Self {
        Self {
            store,
            mailbox_capacity,
            keepers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a keeper for `repository_id`, or return the running one.
    pub async fn register(&self, repository_id: &str) -> TreeKeeperHandle {
        let mut keepers = self.keepers.write().await;
        if let Some(slot) = keepers.get(repository_id) {
            if !slot.task.is_finished() {
                return slot.handle.clone();
            }
        }

        let (handle, task) =
            TreeKeeper::spawn(self.store.clone(), repository_id, self.mailbox_capacity);
        keepers.insert(
            repository_id.to_string(),
            KeeperSlot {
                handle: handle.clone(),
                task,
            },
        );
        info!(%repository_id, "tree keeper registered");
        handle
    }

    /// Register a keeper whose task was spawned elsewhere, replacing any
    /// keeper already registered for the repository.
    pub async fn attach(&self, handle: TreeKeeperHandle, task: JoinHandle<()>) {
        let repository_id = handle.repository_id().to_string();
        let previous = self
            .keepers
            .write()
            .await
            .insert(repository_id.clone(), KeeperSlot { handle, task });
        if let Some(previous) = previous {
            stop(&repository_id, previous).await;
        }
    }

    /// Handle of a registered keeper.
    pub async fn handle(&self, repository_id: &str) -> Option<TreeKeeperHandle> {
        let keepers = self.keepers.read().await;
        keepers.get(repository_id).map(|slot| slot.handle.clone())
    }

    /// Stop and forget a keeper. Returns false if none was registered.
    pub async fn deregister(&self, repository_id: &str) -> bool {
        let slot = self.keepers.write().await.remove(repository_id);
        match slot {
            Some(slot) => {
                stop(repository_id, slot).await;
                info!(%repository_id, "tree keeper deregistered");
                true
            }
            None => false,
        }
    }

    /// Start one keeper per stored repository.
    pub async fn start_all(&self) -> KeeperResult<usize> {
        let repositories = self.store.list::<Repository>()?;
        for repository in &repositories {
            self.register(&repository.id).await;
        }
        info!(count = repositories.len(), "tree keepers started");
        Ok(repositories.len())
    }

    /// Stop every keeper (for graceful shutdown).
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, KeeperSlot)> = self.keepers.write().await.drain().collect();
        for (repository_id, slot) in slots {
            stop(&repository_id, slot).await;
        }
        info!("all tree keepers stopped");
    }

    /// Ids of registered repositories.
    pub async fn repositories(&self) -> Vec<String> {
        let keepers = self.keepers.read().await;
        let mut ids: Vec<String> = keepers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn stop(repository_id: &str, mut slot: KeeperSlot) {
    slot.handle.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut slot.task)
        .await
        .is_err()
    {
        warn!(%repository_id, "tree keeper did not stop in time, aborting");
        slot.task.abort();
    } else {
        debug!(%repository_id, "tree keeper stopped");
    }
}
