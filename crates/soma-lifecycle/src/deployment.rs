//! Deployment query operations used by monitoring systems and hosts:
//! pull, feedback, pending lists and per-host bundles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use soma_state::{
    CheckInstance, CheckInstanceConfiguration, DeploymentDetails, DeploymentStatus,
    DeploymentTask, FeedbackResult, MonitoringSystem, Node, ObjectType, StateError, StateStore,
    WriteTxn, epoch_secs,
};

use crate::error::{LifecycleError, LifecycleResult};

/// One configuration version as handed to a monitoring system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentView {
    pub check_instance_id: String,
    pub config_id: String,
    pub version: u64,
    pub status: DeploymentStatus,
    pub next_status: Option<DeploymentStatus>,
    pub task: DeploymentTask,
    pub details: serde_json::Value,
}

impl DeploymentView {
    fn new(config: &CheckInstanceConfiguration, task: DeploymentTask) -> Self {
        Self {
            check_instance_id: config.check_instance_id.clone(),
            config_id: config.id.clone(),
            version: config.version,
            status: config.status,
            next_status: config.next_status,
            task,
            details: config.details.clone(),
        }
    }
}

/// Every deployment destined for one physical host and monitoring system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostBundle {
    pub system: String,
    pub asset_id: u64,
    pub deployments: Vec<DeploymentView>,
    /// Previously known instance ids the host should remove.
    #[serde(default)]
    pub delete: Vec<String>,
}

/// States whose payload belongs on a host.
fn is_deployed_state(status: DeploymentStatus) -> bool {
    matches!(
        status,
        DeploymentStatus::AwaitingRollout
            | DeploymentStatus::RolloutInProgress
            | DeploymentStatus::Active
            | DeploymentStatus::RolloutFailed
    )
}

fn current_config(
    txn: &WriteTxn<'_>,
    instance_id: &str,
) -> LifecycleResult<(CheckInstance, CheckInstanceConfiguration)> {
    let instance: CheckInstance = txn
        .get(instance_id)?
        .ok_or_else(|| LifecycleError::NotFound(format!("check instance {instance_id}")))?;
    let config_id = instance.current_instance_config_id.clone().ok_or_else(|| {
        LifecycleError::NotFound(format!("check instance {instance_id} has no configuration"))
    })?;
    let config: CheckInstanceConfiguration = txn.get(&config_id)?.ok_or_else(|| {
        LifecycleError::NotFound(format!("check instance configuration {config_id}"))
    })?;
    Ok((instance, config))
}

/// Hand the current configuration of an instance to a monitoring system.
///
/// Waiting and failed states move to the matching in-progress state; the
/// returned task tells the caller whether to roll out or tear down.
pub fn pull(store: &StateStore, instance_id: &str) -> LifecycleResult<DeploymentView> {
    store.write(|txn| {
        let (_, mut config) = current_config(txn, instance_id)?;
        let (to, task) = config.status.on_pull();
        if to != config.status {
            info!(%instance_id, config_id = %config.id, from = %config.status, %to, "deployment pulled");
            config.set_status(to, epoch_secs());
            txn.put_instance_config(&config)?;
        } else {
            debug!(%instance_id, status = %config.status, "deployment pulled without transition");
        }
        Ok(DeploymentView::new(&config, task))
    })
}

/// Record the result a monitoring system reports for the current configuration.
pub fn feedback(
    store: &StateStore,
    instance_id: &str,
    result: FeedbackResult,
) -> LifecycleResult<DeploymentView> {
    store.write(|txn| {
        let (_, mut config) = current_config(txn, instance_id)?;
        let to = config.status.on_feedback(result).ok_or_else(|| {
            LifecycleError::IllegalStateTransition {
                from: config.status,
                event: result.to_string(),
            }
        })?;
        info!(%instance_id, config_id = %config.id, from = %config.status, %to, "deployment feedback");
        config.set_status(to, epoch_secs());
        txn.put_instance_config(&config)?;
        Ok(DeploymentView::new(&config, DeploymentTask::None))
    })
}

/// Instance ids with work for a monitoring system.
///
/// Without `all`, only instances flagged `update_available` whose current
/// configuration is neither blocked nor terminal are returned. With `all`,
/// every instance with a non-terminal current configuration is returned.
/// Listed instances have `update_available` cleared.
pub fn list_instances(
    store: &StateStore,
    monitoring_id: &str,
    all: bool,
) -> LifecycleResult<Vec<String>> {
    store.write(|txn| {
        if txn.get::<MonitoringSystem>(monitoring_id)?.is_none() {
            return Err(LifecycleError::NotFound(format!(
                "monitoring system {monitoring_id}"
            )));
        }

        let mut listed = Vec::new();
        for mut instance in txn.list_where(|i: &CheckInstance| i.current_instance_config_id.is_some())? {
            let Some(config_id) = instance.current_instance_config_id.as_deref() else {
                continue;
            };
            let Some(config) = txn.get::<CheckInstanceConfiguration>(config_id)? else {
                continue;
            };
            if config.monitoring_id != monitoring_id || config.status.is_terminal() {
                continue;
            }
            let pending =
                instance.update_available && config.status != DeploymentStatus::Blocked;
            if !all && !pending {
                continue;
            }
            if instance.update_available {
                instance.update_available = false;
                txn.put(&instance)?;
            }
            listed.push(instance.id);
        }
        listed.sort();
        debug!(%monitoring_id, all, count = listed.len(), "instances listed");
        Ok(listed)
    })
}

/// Deployment details for every check instance on the host `asset_id`
/// handled by `system` (a monitoring system name or id). Credential
/// attributes are stripped.
pub fn host_bundle(store: &StateStore, system: &str, asset_id: u64) -> LifecycleResult<HostBundle> {
    let systems: BTreeSet<String> = store
        .list_where(|m: &MonitoringSystem| m.name == system || m.id == system)?
        .into_iter()
        .map(|m| m.id)
        .collect();
    if systems.is_empty() {
        return Err(LifecycleError::NotFound(format!("monitoring system {system}")));
    }

    let nodes: BTreeSet<String> = store
        .list_where(|n: &Node| n.asset_id == asset_id)?
        .into_iter()
        .map(|n| n.id)
        .collect();
    if nodes.is_empty() {
        return Err(LifecycleError::NotFound(format!("host with asset id {asset_id}")));
    }

    let instances = store.list_where(|i: &CheckInstance| {
        !i.deleted && i.object_type == ObjectType::Node && nodes.contains(&i.object_id)
    })?;

    let mut deployments = Vec::new();
    for instance in instances {
        let Some(config_id) = instance.current_instance_config_id.as_deref() else {
            continue;
        };
        let Some(config) = store.get::<CheckInstanceConfiguration>(config_id)? else {
            continue;
        };
        if !systems.contains(&config.monitoring_id) || !is_deployed_state(config.status) {
            continue;
        }
        let mut view = DeploymentView::new(&config, config.status.on_pull().1);
        view.details = strip_credentials(&config.details)?;
        deployments.push(view);
    }
    deployments.sort_by(|a, b| a.check_instance_id.cmp(&b.check_instance_id));

    Ok(HostBundle {
        system: system.to_string(),
        asset_id,
        deployments,
        delete: Vec::new(),
    })
}

/// Like [`host_bundle`], additionally listing which of the `known`
/// instance ids are no longer part of the bundle.
pub fn assemble_host_bundle(
    store: &StateStore,
    system: &str,
    asset_id: u64,
    known: &[String],
) -> LifecycleResult<HostBundle> {
    let mut bundle = host_bundle(store, system, asset_id)?;
    let present: BTreeSet<&str> = bundle
        .deployments
        .iter()
        .map(|d| d.check_instance_id.as_str())
        .collect();
    let mut delete: Vec<String> = known
        .iter()
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect();
    delete.sort();
    delete.dedup();
    bundle.delete = delete;
    Ok(bundle)
}

fn strip_credentials(details: &serde_json::Value) -> LifecycleResult<serde_json::Value> {
    let mut parsed: DeploymentDetails = serde_json::from_value(details.clone())
        .map_err(|e| StateError::Deserialize(e.to_string()))?;
    parsed.strip_credentials();
    Ok(serde_json::to_value(parsed).map_err(|e| StateError::Serialize(e.to_string()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use soma_state::{Constraint, ObjectState, ServiceAttribute, ServiceDetails};

    use crate::compute::compute_configuration;
    use crate::compute::tests::{details, seed_instance};

    fn setup() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&MonitoringSystem {
                id: "mon-1".to_string(),
                name: "icinga".to_string(),
                mode: "private".to_string(),
                contact: "ops".to_string(),
                team_id: "team-1".to_string(),
                callback: None,
            })
            .unwrap();
        store
            .put(&Node {
                id: "node-1".to_string(),
                name: "web01".to_string(),
                asset_id: 4711,
                bucket_id: "bucket-1".to_string(),
                state: ObjectState::Standalone,
                properties: BTreeMap::new(),
            })
            .unwrap();
        store
    }

    #[test]
    fn pull_advances_to_rollout_in_progress() {
        let store = setup();
        seed_instance(&store, "ci-1");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();

        let view = pull(&store, "ci-1").unwrap();

        assert_eq!(view.status, DeploymentStatus::RolloutInProgress);
        assert_eq!(view.task, DeploymentTask::Rollout);
        assert_eq!(view.details["interval"], 60);

        // A second pull is idempotent.
        let again = pull(&store, "ci-1").unwrap();
        assert_eq!(again.status, DeploymentStatus::RolloutInProgress);
    }

    #[test]
    fn pull_unknown_instance_is_not_found() {
        let store = setup();
        assert!(matches!(pull(&store, "ghost"), Err(LifecycleError::NotFound(_))));

        seed_instance(&store, "ci-empty");
        assert!(matches!(pull(&store, "ci-empty"), Err(LifecycleError::NotFound(_))));
    }

    #[test]
    fn feedback_success_activates() {
        let store = setup();
        seed_instance(&store, "ci-1");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();
        pull(&store, "ci-1").unwrap();

        let view = feedback(&store, "ci-1", FeedbackResult::Success).unwrap();

        assert_eq!(view.status, DeploymentStatus::Active);
        let config: CheckInstanceConfiguration = store.require(&view.config_id).unwrap();
        assert!(config.activated_at.is_some());
    }

    #[test]
    fn feedback_failed_marks_rollout_failed() {
        let store = setup();
        seed_instance(&store, "ci-1");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();
        pull(&store, "ci-1").unwrap();

        let view = feedback(&store, "ci-1", FeedbackResult::Failed).unwrap();
        assert_eq!(view.status, DeploymentStatus::RolloutFailed);

        // A pull is the explicit retry.
        assert_eq!(pull(&store, "ci-1").unwrap().status, DeploymentStatus::RolloutInProgress);
    }

    #[test]
    fn feedback_outside_progress_is_illegal() {
        let store = setup();
        seed_instance(&store, "ci-1");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();

        let err = feedback(&store, "ci-1", FeedbackResult::Success).unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::IllegalStateTransition {
                from: DeploymentStatus::AwaitingRollout,
                ..
            }
        ));
    }

    #[test]
    fn list_clears_update_flag() {
        let store = setup();
        seed_instance(&store, "ci-1");
        seed_instance(&store, "ci-2");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();
        compute_configuration(&store, "ci-2", &details("ci-2", 60)).unwrap();

        let listed = list_instances(&store, "mon-1", false).unwrap();
        assert_eq!(listed, vec!["ci-1".to_string(), "ci-2".to_string()]);
        assert!(!store.require::<CheckInstance>("ci-1").unwrap().update_available);

        // Acknowledged instances no longer show up as pending, but do in the full list.
        assert!(list_instances(&store, "mon-1", false).unwrap().is_empty());
        assert_eq!(list_instances(&store, "mon-1", true).unwrap().len(), 2);
    }

    #[test]
    fn list_unknown_monitoring_system_is_not_found() {
        let store = setup();
        assert!(matches!(
            list_instances(&store, "nope", true),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[test]
    fn host_bundle_strips_credentials() {
        let store = setup();
        seed_instance(&store, "ci-1");
        let mut doc = details("ci-1", 60);
        let attributes = vec![
            ServiceAttribute { name: "port".into(), value: "5432".into() },
            ServiceAttribute { name: "credential_password".into(), value: "hunter2".into() },
        ];
        doc.constraints = vec![Constraint::Service {
            name: "postgres".into(),
            attributes: attributes.clone(),
        }];
        doc.service = Some(ServiceDetails { name: "postgres".into(), attributes });
        compute_configuration(&store, "ci-1", &doc).unwrap();

        let bundle = host_bundle(&store, "icinga", 4711).unwrap();

        assert_eq!(bundle.deployments.len(), 1);
        let rendered = bundle.deployments[0].details.to_string();
        assert!(rendered.contains("port"));
        assert!(!rendered.contains("hunter2"));
        // The stored payload keeps the secret for the monitoring system pull.
        assert!(pull(&store, "ci-1").unwrap().details.to_string().contains("hunter2"));
    }

    #[test]
    fn assemble_reports_stale_instances() {
        let store = setup();
        seed_instance(&store, "ci-1");
        compute_configuration(&store, "ci-1", &details("ci-1", 60)).unwrap();

        let known = vec!["ci-1".to_string(), "ci-old".to_string()];
        let bundle = assemble_host_bundle(&store, "mon-1", 4711, &known).unwrap();

        assert_eq!(bundle.deployments.len(), 1);
        assert_eq!(bundle.delete, vec!["ci-old".to_string()]);
    }

    #[test]
    fn host_bundle_unknown_host_or_system() {
        let store = setup();
        assert!(matches!(host_bundle(&store, "icinga", 1), Err(LifecycleError::NotFound(_))));
        assert!(matches!(host_bundle(&store, "nagios", 4711), Err(LifecycleError::NotFound(_))));
    }
}
