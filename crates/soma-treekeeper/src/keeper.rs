//! Tree keeper: one actor per repository.
//!
//! The keeper loads its repository once at startup and then drains its
//! mailbox strictly in arrival order, so at most one tree mutation is in
//! flight per repository. Readiness is published through a `watch`
//! channel; a repository that fails to load is marked broken and stays
//! that way until the process restarts.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use soma_state::{
    Bucket, Check, CheckInstance, CheckInstanceConfiguration, Cluster, Group, Job, Membership,
    Node, ObjectType, Repository, StateStore,
};

use crate::actions::JobAction;
use crate::error::{KeeperError, KeeperResult};
use crate::inheritance::{RecomputeReport, recompute_instances};
use crate::ordering::{GroupAnomaly, GroupOrder, order_groups};

/// Counts gathered during the startup load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub buckets: usize,
    pub groups: usize,
    pub clusters: usize,
    pub nodes: usize,
    pub group_roots: usize,
    pub source_checks: usize,
    pub inherited_checks: usize,
    pub instances: usize,
    pub configurations: usize,
}

/// What a keeper publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeeperStatus {
    pub repository_id: String,
    pub ready: bool,
    pub broken: bool,
    pub error: Option<String>,
    pub summary: LoadSummary,
    pub anomalies: Vec<GroupAnomaly>,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

/// Result of one executed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub action: String,
    pub recompute: RecomputeReport,
}

/// Reply channel for one job.
pub type JobReply = oneshot::Receiver<KeeperResult<JobReport>>;

pub enum KeeperMessage {
    Job {
        job: Job,
        action: JobAction,
        reply: oneshot::Sender<KeeperResult<JobReport>>,
    },
    Shutdown,
}

/// Cheap, cloneable access to a running keeper.
#[derive(Clone)]
pub struct TreeKeeperHandle {
    repository_id: String,
    mailbox: mpsc::Sender<KeeperMessage>,
    status: watch::Receiver<KeeperStatus>,
}

impl TreeKeeperHandle {
    /// Assemble a handle around channels driven by something other than
    /// [`TreeKeeper`].
    pub fn from_parts(
        repository_id: &str,
        mailbox: mpsc::Sender<KeeperMessage>,
        status: watch::Receiver<KeeperStatus>,
    ) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            mailbox,
            status,
        }
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn status(&self) -> KeeperStatus {
        self.status.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    pub fn is_broken(&self) -> bool {
        self.status.borrow().broken
    }

    /// Wait until the startup load has finished, successfully or not.
    pub async fn wait_ready(&self) -> KeeperStatus {
        let mut status = self.status.clone();
        let loaded = match status.wait_for(|s| s.ready).await {
            Ok(current) => current.clone(),
            Err(_) => self.status(),
        };
        loaded
    }

    /// Queue a job. Blocks while the mailbox is full.
    pub async fn submit(&self, job: Job, action: JobAction) -> KeeperResult<JobReply> {
        let (reply, receiver) = oneshot::channel();
        self.mailbox
            .send(KeeperMessage::Job { job, action, reply })
            .await
            .map_err(|_| KeeperError::MailboxClosed(self.repository_id.clone()))?;
        Ok(receiver)
    }

    /// Ask the keeper to stop after the jobs already queued.
    pub async fn shutdown(&self) {
        let _ = self.mailbox.send(KeeperMessage::Shutdown).await;
    }
}

/// The repository actor itself.
pub struct TreeKeeper {
    repository_id: String,
    store: StateStore,
    mailbox: mpsc::Receiver<KeeperMessage>,
    status: watch::Sender<KeeperStatus>,
}

impl TreeKeeper {
    /// Spawn a keeper task for `repository_id`.
    pub fn spawn(
        store: StateStore,
        repository_id: &str,
        mailbox_capacity: usize,
    ) -> (TreeKeeperHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(KeeperStatus {
            repository_id: repository_id.to_string(),
            ..KeeperStatus::default()
        });

        let keeper = TreeKeeper {
            repository_id: repository_id.to_string(),
            store,
            mailbox: rx,
            status: status_tx,
        };
        let task = tokio::spawn(keeper.run());

        let handle = TreeKeeperHandle {
            repository_id: repository_id.to_string(),
            mailbox: tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        self.load();

        while let Some(message) = self.mailbox.recv().await {
            match message {
                KeeperMessage::Job { job, action, reply } => {
                    let result = self.process(&job, &action);
                    if reply.send(result).is_err() {
                        debug!(job_id = %job.id, "job submitter went away");
                    }
                }
                KeeperMessage::Shutdown => break,
            }
        }
        info!(repository_id = %self.repository_id, "tree keeper stopped");
    }

    fn load(&self) {
        match load_repository(&self.store, &self.repository_id) {
            Ok(loaded) => {
                info!(
                    repository_id = %self.repository_id,
                    summary = ?loaded.summary,
                    anomalies = loaded.order.anomalies.len(),
                    "repository loaded"
                );
                self.status.send_modify(|s| {
                    s.ready = true;
                    s.summary = loaded.summary;
                    s.anomalies = loaded.order.anomalies;
                });
            }
            Err(e) => {
                error!(repository_id = %self.repository_id, error = %e, "repository load failed, marking broken");
                self.status.send_modify(|s| {
                    s.ready = true;
                    s.broken = true;
                    s.error = Some(e.to_string());
                });
            }
        }
    }

    fn process(&self, job: &Job, action: &JobAction) -> KeeperResult<JobReport> {
        if self.status.borrow().broken {
            let err = KeeperError::RepositoryBroken(self.repository_id.clone());
            self.store.finish_job(&job.id, Some(err.to_string()))?;
            return Err(err);
        }

        self.store.start_job(&job.id)?;
        let repository_id = self.repository_id.clone();
        let result = self.store.write(|txn| {
            action.execute(txn, &repository_id)?;
            recompute_instances(txn, &repository_id)
        });

        match result {
            Ok(recompute) => {
                self.store.finish_job(&job.id, None)?;
                self.status.send_modify(|s| s.jobs_processed += 1);
                info!(job_id = %job.id, action = action.name(), ?recompute, "job processed");
                Ok(JobReport {
                    job_id: job.id.clone(),
                    action: action.name().to_string(),
                    recompute,
                })
            }
            Err(e) => {
                warn!(job_id = %job.id, action = action.name(), error = %e, "job failed");
                self.store.finish_job(&job.id, Some(e.to_string()))?;
                self.status.send_modify(|s| {
                    s.jobs_processed += 1;
                    s.jobs_failed += 1;
                });
                Err(e)
            }
        }
    }
}

/// Result of the startup load.
#[derive(Debug, Clone)]
pub struct LoadedTree {
    pub summary: LoadSummary,
    pub order: GroupOrder,
    /// Objects in load order: repository, buckets, ordered groups,
    /// clusters, nodes.
    pub objects: Vec<(ObjectType, String)>,
}

/// Load a repository without touching deployment state.
pub fn load_repository(store: &StateStore, repository_id: &str) -> KeeperResult<LoadedTree> {
    let repository = store
        .get::<Repository>(repository_id)?
        .ok_or_else(|| KeeperError::NotFound(format!("repository {repository_id}")))?;

    let mut bucket_ids: Vec<String> = store
        .list_where(|b: &Bucket| b.repository_id == repository.id)?
        .into_iter()
        .map(|b| b.id)
        .collect();
    bucket_ids.sort();
    let in_repository: BTreeSet<&str> = bucket_ids.iter().map(String::as_str).collect();

    let groups = store.list_where(|g: &Group| in_repository.contains(g.bucket_id.as_str()))?;
    let mut cluster_ids: Vec<String> = store
        .list_where(|c: &Cluster| in_repository.contains(c.bucket_id.as_str()))?
        .into_iter()
        .map(|c| c.id)
        .collect();
    cluster_ids.sort();
    let mut node_ids: Vec<String> = store
        .list_where(|n: &Node| in_repository.contains(n.bucket_id.as_str()))?
        .into_iter()
        .map(|n| n.id)
        .collect();
    node_ids.sort();

    let states: BTreeMap<String, soma_state::ObjectState> =
        groups.iter().map(|g| (g.id.clone(), g.state)).collect();
    let edges: BTreeMap<String, String> = store
        .list_where(|m: &Membership| {
            m.child_type == ObjectType::Group
                && m.parent_type == ObjectType::Group
                && (states.contains_key(&m.child_id) || states.contains_key(&m.parent_id))
        })?
        .into_iter()
        .map(|m| (m.child_id, m.parent_id))
        .collect();
    let order = order_groups(&states, &edges)?;

    let mut ordered_groups = order.flatten();
    let placed: BTreeSet<String> = ordered_groups.iter().cloned().collect();
    // Anomalous groups are still loaded, after the ordered ones.
    ordered_groups.extend(states.keys().filter(|id| !placed.contains(*id)).cloned());

    let mut objects: Vec<(ObjectType, String)> = Vec::new();
    for object_type in ObjectType::LOAD_ORDER {
        let ids: Vec<String> = match object_type {
            ObjectType::Repository => vec![repository.id.clone()],
            ObjectType::Bucket => bucket_ids.clone(),
            ObjectType::Group => ordered_groups.clone(),
            ObjectType::Cluster => cluster_ids.clone(),
            ObjectType::Node => node_ids.clone(),
        };
        objects.extend(ids.into_iter().map(|id| (object_type, id)));
    }

    let checks = store.list_where(|c: &Check| c.repository_id == repository.id && !c.deleted)?;
    let instances =
        store.list_where(|i: &CheckInstance| i.repository_id == repository.id && !i.deleted)?;
    let instance_ids: BTreeSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
    let configurations = store.list_where(|c: &CheckInstanceConfiguration| {
        instance_ids.contains(c.check_instance_id.as_str())
    })?;

    let mut summary = LoadSummary {
        buckets: bucket_ids.len(),
        groups: groups.len(),
        clusters: cluster_ids.len(),
        nodes: node_ids.len(),
        group_roots: order.order.len(),
        configurations: configurations.len(),
        ..LoadSummary::default()
    };

    // Source checks first for every object, then what was derived from them.
    for (object_type, id) in &objects {
        let count = checks
            .iter()
            .filter(|c| c.is_source() && &c.object_id == id)
            .count();
        if count > 0 {
            debug!(%object_type, object_id = %id, count, "source checks loaded");
        }
        summary.source_checks += count;
    }
    for (_, id) in &objects {
        summary.inherited_checks += checks
            .iter()
            .filter(|c| !c.is_source() && &c.object_id == id)
            .count();
        summary.instances += instances.iter().filter(|i| &i.object_id == id).count();
    }

    Ok(LoadedTree {
        summary,
        order,
        objects,
    })
}
