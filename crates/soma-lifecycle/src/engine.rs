//! Deployment engine: the periodic unblock / retire / poke cycle.
//!
//! There is exactly one engine loop per process. Each phase is a bounded
//! scan of the store, and every item is handled in its own transaction so
//! one failing row never rolls back its neighbours.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use soma_state::{
    CheckInstance, CheckInstanceConfiguration, CheckInstanceConfigurationDependency,
    DeploymentStatus, MonitoringSystem, Record, StateStore, epoch_secs,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::notify;

/// Engine timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Upper bound for one poke request.
    pub poke_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            poke_timeout: Duration::from_millis(500),
        }
    }
}

/// Counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub unblocked: usize,
    pub orphaned: usize,
    pub retired: usize,
    pub discarded: usize,
    pub poked: usize,
    pub poke_failures: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnblockOutcome {
    Waiting,
    Unblocked,
    Orphaned,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetireOutcome {
    Untouched,
    Retired,
    Discarded,
}

/// Drives configuration versions through the lifecycle.
pub struct DeploymentEngine {
    store: StateStore,
    config: EngineConfig,
}

impl DeploymentEngine {
    pub fn new(store: StateStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Run cycles until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.config.interval, "deployment engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report != CycleReport::default() {
                        debug!(?report, "deployment cycle finished");
                    }
                }
                _ = shutdown.changed() => {
                    info!("deployment engine shutting down");
                    break;
                }
            }
        }
    }

    /// One full cycle: unblock, retire, then poke.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        self.unblock_pass(&mut report);
        self.retire_pass(&mut report);
        self.poke_pass(&mut report).await;
        report
    }

    // ── Unblock ────────────────────────────────────────────────────

    /// Advance blocked versions whose dependency has been satisfied.
    pub fn unblock_pass(&self, report: &mut CycleReport) {
        let edges = match self.store.list::<CheckInstanceConfigurationDependency>() {
            Ok(edges) => edges,
            Err(e) => {
                error!(error = %e, "failed to scan dependencies");
                report.errors += 1;
                return;
            }
        };

        for edge in edges {
            match self.unblock_one(&edge) {
                Ok(UnblockOutcome::Unblocked) => report.unblocked += 1,
                Ok(UnblockOutcome::Orphaned) => {
                    report.orphaned += 1;
                    report.unblocked += 1;
                }
                Ok(UnblockOutcome::Waiting) | Ok(UnblockOutcome::Dropped) => {}
                Err(e) => {
                    error!(
                        blocked = %edge.blocked_instance_config_id,
                        blocking = %edge.blocking_instance_config_id,
                        error = %e,
                        "unblock failed, transaction rolled back"
                    );
                    report.errors += 1;
                }
            }
        }
    }

    fn unblock_one(
        &self,
        edge: &CheckInstanceConfigurationDependency,
    ) -> LifecycleResult<UnblockOutcome> {
        let key = edge.table_key();
        self.store.write(|txn| {
            // Re-read inside the transaction; the row may be gone by now.
            let Some(edge) = txn.get::<CheckInstanceConfigurationDependency>(&key)? else {
                return Ok(UnblockOutcome::Waiting);
            };

            let blocking =
                txn.get::<CheckInstanceConfiguration>(&edge.blocking_instance_config_id)?;
            let orphaned = match &blocking {
                None => true,
                Some(b) => b.status == DeploymentStatus::AwaitingDeletion,
            };
            let satisfied = orphaned
                || blocking
                    .as_ref()
                    .is_some_and(|b| b.status == edge.unblocking_state);
            if !satisfied {
                return Ok(UnblockOutcome::Waiting);
            }
            if orphaned {
                warn!(
                    blocked = %edge.blocked_instance_config_id,
                    blocking = %edge.blocking_instance_config_id,
                    "orphaned dependency treated as satisfied"
                );
            }

            txn.delete::<CheckInstanceConfigurationDependency>(&key)?;

            let Some(mut blocked) =
                txn.get::<CheckInstanceConfiguration>(&edge.blocked_instance_config_id)?
            else {
                return Ok(UnblockOutcome::Dropped);
            };
            if blocked.status != DeploymentStatus::Blocked {
                debug!(config_id = %blocked.id, status = %blocked.status, "dependency of unblocked version dropped");
                return Ok(UnblockOutcome::Dropped);
            }
            if !txn.dependencies_blocking(&blocked.id)?.is_empty() {
                // Still waiting on another edge.
                return Ok(UnblockOutcome::Waiting);
            }

            let target = blocked
                .next_status
                .filter(|next| blocked.status.can_transition(*next))
                .ok_or_else(|| LifecycleError::IllegalStateTransition {
                    from: blocked.status,
                    event: "unblock".to_string(),
                })?;
            blocked.set_status(target, epoch_secs());
            txn.put_instance_config(&blocked)?;

            let mut instance: CheckInstance = txn.require(&blocked.check_instance_id)?;
            instance.current_instance_config_id = Some(blocked.id.clone());
            instance.update_available = true;
            txn.put(&instance)?;

            info!(
                instance_id = %instance.id,
                config_id = %blocked.id,
                status = %target,
                "configuration unblocked"
            );
            Ok(if orphaned {
                UnblockOutcome::Orphaned
            } else {
                UnblockOutcome::Unblocked
            })
        })
    }

    // ── Retire ─────────────────────────────────────────────────────

    /// Start tearing down versions that are in the way.
    ///
    /// Live versions that block a newer one, or belong to a deleted
    /// instance, move to `awaiting_deprovision`. Failed rollouts in the
    /// same position are discarded.
    pub fn retire_pass(&self, report: &mut CycleReport) {
        let candidates = match self.retire_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "failed to scan retire candidates");
                report.errors += 1;
                return;
            }
        };

        for config_id in candidates {
            match self.retire_one(&config_id) {
                Ok(RetireOutcome::Retired) => report.retired += 1,
                Ok(RetireOutcome::Discarded) => report.discarded += 1,
                Ok(RetireOutcome::Untouched) => {}
                Err(e) => {
                    error!(%config_id, error = %e, "retire failed, transaction rolled back");
                    report.errors += 1;
                }
            }
        }
    }

    fn retire_candidates(&self) -> LifecycleResult<BTreeSet<String>> {
        let mut candidates: BTreeSet<String> = self
            .store
            .list::<CheckInstanceConfigurationDependency>()?
            .into_iter()
            .map(|edge| edge.blocking_instance_config_id)
            .collect();
        candidates.extend(
            self.store
                .list_where(|i: &CheckInstance| i.deleted)?
                .into_iter()
                .filter_map(|i| i.current_instance_config_id),
        );
        Ok(candidates)
    }

    fn retire_one(&self, config_id: &str) -> LifecycleResult<RetireOutcome> {
        self.store.write(|txn| {
            let Some(mut config) = txn.get::<CheckInstanceConfiguration>(config_id)? else {
                return Ok(RetireOutcome::Untouched);
            };
            let target = match config.status {
                DeploymentStatus::Active => DeploymentStatus::AwaitingDeprovision,
                DeploymentStatus::RolloutFailed => DeploymentStatus::AwaitingDeletion,
                _ => return Ok(RetireOutcome::Untouched),
            };

            let blocks_dependent = !txn
                .list_where(|d: &CheckInstanceConfigurationDependency| {
                    d.blocking_instance_config_id == config_id
                })?
                .is_empty();
            let mut instance: CheckInstance = txn.require(&config.check_instance_id)?;
            if !blocks_dependent && !instance.deleted {
                return Ok(RetireOutcome::Untouched);
            }

            config.set_status(target, epoch_secs());
            txn.put_instance_config(&config)?;
            instance.update_available = true;
            txn.put(&instance)?;

            info!(instance_id = %instance.id, %config_id, status = %target, "configuration retired");
            Ok(match target {
                DeploymentStatus::AwaitingDeprovision => RetireOutcome::Retired,
                _ => RetireOutcome::Discarded,
            })
        })
    }

    // ── Poke ───────────────────────────────────────────────────────

    /// Notify monitoring systems about instances waiting for them.
    ///
    /// A delivered poke clears `update_available`. Failures are logged and
    /// retried on the next cycle.
    pub async fn poke_pass(&self, report: &mut CycleReport) {
        let instances = match self
            .store
            .list_where(|i: &CheckInstance| i.update_available && i.current_instance_config_id.is_some())
        {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "failed to scan instances for poke");
                report.errors += 1;
                return;
            }
        };

        for instance in instances {
            let Some(config_id) = instance.current_instance_config_id.clone() else {
                continue;
            };
            let target = match self.poke_target(&config_id) {
                Ok(Some(target)) => target,
                Ok(None) => continue,
                Err(e) => {
                    error!(instance_id = %instance.id, error = %e, "failed to resolve poke target");
                    report.errors += 1;
                    continue;
                }
            };

            match notify::poke(&target, &instance.id, self.config.poke_timeout).await {
                Ok(status) => {
                    debug!(instance_id = %instance.id, %status, callback = %target, "poke delivered");
                    report.poked += 1;
                    if let Err(e) = self.acknowledge(&instance.id, &config_id) {
                        error!(instance_id = %instance.id, error = %e, "failed to clear update flag");
                        report.errors += 1;
                    }
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, callback = %target, error = %e, "poke failed");
                    report.poke_failures += 1;
                }
            }
        }
    }

    /// Callback to poke for a configuration, if it awaits action and its
    /// monitoring system has one.
    fn poke_target(&self, config_id: &str) -> LifecycleResult<Option<String>> {
        let Some(config) = self.store.get::<CheckInstanceConfiguration>(config_id)? else {
            return Ok(None);
        };
        if !config.status.awaits_action() {
            return Ok(None);
        }
        let callback = self
            .store
            .get::<MonitoringSystem>(&config.monitoring_id)?
            .and_then(|m| m.callback)
            .filter(|c| !c.trim().is_empty());
        Ok(callback)
    }

    /// Clear `update_available` unless the instance moved on meanwhile.
    fn acknowledge(&self, instance_id: &str, config_id: &str) -> LifecycleResult<()> {
        self.store.write(|txn| {
            let Some(mut instance) = txn.get::<CheckInstance>(instance_id)? else {
                return Ok(());
            };
            if instance.current_instance_config_id.as_deref() == Some(config_id) {
                instance.update_available = false;
                txn.put(&instance)?;
            }
            Ok(())
        })
    }
}
