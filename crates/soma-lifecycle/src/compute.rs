//! Configuration computation: turn a freshly built deployment-detail
//! document into a new version for its check instance.
//!
//! Every outcome is applied inside one store transaction. The comparison
//! is always against the latest version that has not been discarded.

use serde::Serialize;
use tracing::{debug, info};

use soma_state::{
    CheckInstance, CheckInstanceConfiguration, CheckInstanceConfigurationDependency,
    DeploymentDetails, DeploymentStatus, Record, StateError, StateStore, WriteTxn, epoch_secs,
    json_digest,
};

use crate::error::{LifecycleError, LifecycleResult};

/// What the computation step did with a new payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComputeOutcome {
    /// First live version for the instance; queued for rollout.
    Initial { config_id: String },
    /// Payload identical to the latest version; nothing stored.
    Unchanged { current_id: String },
    /// A version that never went live was replaced by the new one.
    Superseded { config_id: String, discarded_id: String },
    /// New version waits for `blocking_id` to be torn down.
    Blocked { config_id: String, blocking_id: String },
}

impl ComputeOutcome {
    /// Id of the version that now represents the instance's desired state.
    pub fn config_id(&self) -> &str {
        match self {
            ComputeOutcome::Initial { config_id }
            | ComputeOutcome::Superseded { config_id, .. }
            | ComputeOutcome::Blocked { config_id, .. } => config_id,
            ComputeOutcome::Unchanged { current_id } => current_id,
        }
    }
}

/// Store a new configuration version for `instance_id` in its own transaction.
pub fn compute_configuration(
    store: &StateStore,
    instance_id: &str,
    details: &DeploymentDetails,
) -> LifecycleResult<ComputeOutcome> {
    store.write(|txn| compute_in(txn, instance_id, details))
}

/// Store a new configuration version inside an open transaction.
pub fn compute_in(
    txn: &WriteTxn<'_>,
    instance_id: &str,
    details: &DeploymentDetails,
) -> LifecycleResult<ComputeOutcome> {
    let mut instance: CheckInstance = txn
        .get(instance_id)?
        .ok_or_else(|| LifecycleError::NotFound(format!("check instance {instance_id}")))?;

    let value = serde_json::to_value(details)
        .map_err(|e| StateError::Serialize(e.to_string()))?;
    let now = epoch_secs();

    let versions = txn.configs_for_instance(instance_id)?;
    let next_version = versions.last().map(|c| c.version + 1).unwrap_or(0);
    let latest = versions
        .iter()
        .rev()
        .find(|c| c.status != DeploymentStatus::AwaitingDeletion)
        .filter(|c| !c.status.is_terminal())
        .cloned();

    let mut candidate = CheckInstanceConfiguration {
        id: uuid::Uuid::new_v4().to_string(),
        check_instance_id: instance_id.to_string(),
        version: next_version,
        monitoring_id: details.monitoring.id.clone(),
        constraint_hash: json_digest(&details.constraints)?,
        value_hash: json_digest(&value)?,
        details: value,
        status: DeploymentStatus::AwaitingRollout,
        next_status: DeploymentStatus::AwaitingRollout.scheduled_next(),
        awaiting_deletion: false,
        created_at: now,
        activated_at: None,
        deprovisioned_at: None,
        status_updated_at: now,
    };

    let Some(mut latest) = latest else {
        txn.put_instance_config(&candidate)?;
        instance.current_instance_config_id = Some(candidate.id.clone());
        instance.update_available = true;
        txn.put(&instance)?;
        info!(%instance_id, config_id = %candidate.id, version = next_version, "initial configuration queued for rollout");
        return Ok(ComputeOutcome::Initial {
            config_id: candidate.id,
        });
    };

    if latest.details == candidate.details {
        // Duplicates are dropped before they reach the table.
        debug!(%instance_id, current = %latest.id, "configuration unchanged, duplicate discarded");
        return Ok(ComputeOutcome::Unchanged {
            current_id: latest.id,
        });
    }

    instance.update_available = true;
    let edges = match latest.status {
        DeploymentStatus::Blocked => txn.dependencies_blocking(&latest.id)?,
        _ => Vec::new(),
    };
    let outcome = match latest.status {
        // A blocked version without an edge has nothing left to wait for.
        DeploymentStatus::Blocked if !edges.is_empty() => {
            discard(txn, &mut latest, now)?;
            candidate.set_status(DeploymentStatus::Blocked, now);
            txn.put_instance_config(&candidate)?;
            let mut blocking_id = String::new();
            for edge in edges {
                txn.delete::<CheckInstanceConfigurationDependency>(&edge.table_key())?;
                blocking_id = edge.blocking_instance_config_id.clone();
                txn.put(&CheckInstanceConfigurationDependency {
                    blocked_instance_config_id: candidate.id.clone(),
                    ..edge
                })?;
            }
            info!(%instance_id, config_id = %candidate.id, discarded = %latest.id, "blocked version replaced");
            ComputeOutcome::Blocked {
                config_id: candidate.id.clone(),
                blocking_id,
            }
        }
        DeploymentStatus::Blocked
        | DeploymentStatus::AwaitingRollout
        | DeploymentStatus::RolloutFailed => {
            discard(txn, &mut latest, now)?;
            txn.put_instance_config(&candidate)?;
            instance.current_instance_config_id = Some(candidate.id.clone());
            info!(%instance_id, config_id = %candidate.id, discarded = %latest.id, "undeployed version superseded");
            ComputeOutcome::Superseded {
                config_id: candidate.id.clone(),
                discarded_id: latest.id.clone(),
            }
        }
        status => {
            if status == DeploymentStatus::Active {
                latest.set_status(DeploymentStatus::AwaitingDeprovision, now);
                txn.put_instance_config(&latest)?;
            }
            candidate.set_status(DeploymentStatus::Blocked, now);
            txn.put_instance_config(&candidate)?;
            txn.put(&CheckInstanceConfigurationDependency {
                blocked_instance_config_id: candidate.id.clone(),
                blocking_instance_config_id: latest.id.clone(),
                unblocking_state: DeploymentStatus::Deprovisioned,
            })?;
            info!(%instance_id, config_id = %candidate.id, blocking = %latest.id, %status, "new version blocked on predecessor");
            ComputeOutcome::Blocked {
                config_id: candidate.id.clone(),
                blocking_id: latest.id.clone(),
            }
        }
    };
    txn.put(&instance)?;
    Ok(outcome)
}

fn discard(
    txn: &WriteTxn<'_>,
    config: &mut CheckInstanceConfiguration,
    now: u64,
) -> LifecycleResult<()> {
    if !config.status.is_discardable() {
        return Err(LifecycleError::IllegalStateTransition {
            from: config.status,
            event: "discard".to_string(),
        });
    }
    config.set_status(DeploymentStatus::AwaitingDeletion, now);
    txn.put_instance_config(config)?;
    Ok(())
}

/// Retire every version of a deleted instance.
///
/// Versions that never went live are discarded along with their dependency
/// edges. A live version is moved to `awaiting_deprovision`.
pub fn retire_instance(
    txn: &WriteTxn<'_>,
    instance_id: &str,
) -> LifecycleResult<Vec<(String, DeploymentStatus)>> {
    let mut instance: CheckInstance = txn
        .get(instance_id)?
        .ok_or_else(|| LifecycleError::NotFound(format!("check instance {instance_id}")))?;
    let now = epoch_secs();
    let mut changed = Vec::new();

    for mut config in txn.configs_for_instance(instance_id)? {
        let target = match config.status {
            status if status.is_discardable() => DeploymentStatus::AwaitingDeletion,
            DeploymentStatus::Active => DeploymentStatus::AwaitingDeprovision,
            _ => continue,
        };
        if target == DeploymentStatus::AwaitingDeletion {
            for edge in txn.dependencies_blocking(&config.id)? {
                txn.delete::<CheckInstanceConfigurationDependency>(&edge.table_key())?;
            }
        }
        config.set_status(target, now);
        txn.put_instance_config(&config)?;
        changed.push((config.id.clone(), target));
    }

    // Point the instance at whatever still needs a monitoring system's attention.
    if let Some((id, _)) = changed
        .iter()
        .find(|(_, status)| *status == DeploymentStatus::AwaitingDeprovision)
    {
        instance.current_instance_config_id = Some(id.clone());
    }
    instance.deleted = true;
    instance.update_available = true;
    txn.put(&instance)?;
    info!(%instance_id, retired = changed.len(), "check instance retired");
    Ok(changed)
}
