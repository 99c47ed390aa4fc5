//! Check inheritance and check instance computation.
//!
//! A check configuration yields one source check on its object. When
//! inheritance is enabled, every descendant receives an inherited check
//! pointing back at the source. Each check on a group, cluster or node
//! is realized as one check instance, whose deployment payload is handed
//! to the lifecycle computation step.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use soma_lifecycle::{ComputeOutcome, compute_in, retire_instance};
use soma_state::{
    Capability, Check, CheckConfiguration, CheckInstance, Constraint, DeploymentDetails,
    MonitoringSystem, ServiceDetails, WriteTxn,
};

use crate::error::{KeeperError, KeeperResult};
use crate::tree::{ObjectRef, ancestors, descendants, object_info};

/// Create the source check for a configuration, plus inherited checks on
/// every descendant when inheritance is enabled.
pub fn attach_configuration(
    txn: &WriteTxn<'_>,
    config: &CheckConfiguration,
) -> KeeperResult<Check> {
    let object = ObjectRef::new(config.object_id.clone(), config.object_type);
    let source_id = uuid::Uuid::new_v4().to_string();
    let source = Check {
        id: source_id.clone(),
        repository_id: config.repository_id.clone(),
        bucket_id: config.bucket_id.clone(),
        source_check_id: source_id,
        source_object_id: config.object_id.clone(),
        check_config_id: config.id.clone(),
        object_id: config.object_id.clone(),
        object_type: config.object_type,
        children_only: config.children_only,
        deleted: false,
    };
    txn.put(&source)?;

    if config.inheritance_enabled {
        for target in descendants(txn, &object)? {
            ensure_inherited(txn, &source, &target)?;
        }
    }
    info!(check_id = %source.id, config_id = %config.id, object_id = %config.object_id, "source check created");
    Ok(source)
}

/// Pull inheritable checks from every ancestor of `object` onto `object`
/// and its descendants. Idempotent.
pub fn inherit_from_ancestors(txn: &WriteTxn<'_>, object: &ObjectRef) -> KeeperResult<usize> {
    let mut targets = vec![object.clone()];
    targets.extend(descendants(txn, object)?);

    let mut created = 0;
    for ancestor in ancestors(txn, object)? {
        for source in txn.list_where(|c: &Check| {
            c.is_source() && !c.deleted && c.object_id == ancestor.id
        })? {
            let inheritable = txn
                .get::<CheckConfiguration>(&source.check_config_id)?
                .is_some_and(|cfg| cfg.inheritance_enabled && !cfg.deleted);
            if !inheritable {
                continue;
            }
            for target in &targets {
                if ensure_inherited(txn, &source, target)? {
                    created += 1;
                }
            }
        }
    }
    if created > 0 {
        debug!(object_id = %object.id, created, "inherited checks propagated");
    }
    Ok(created)
}

/// Create the inherited check of `source` on `target` unless present.
fn ensure_inherited(txn: &WriteTxn<'_>, source: &Check, target: &ObjectRef) -> KeeperResult<bool> {
    let exists = !txn
        .list_where(|c: &Check| {
            c.source_check_id == source.id && c.object_id == target.id && !c.deleted
        })?
        .is_empty();
    if exists {
        return Ok(false);
    }
    let bucket_id = match target.object_type {
        soma_state::ObjectType::Repository => None,
        _ => object_info(txn, target)?.bucket_id,
    };
    txn.put(&Check {
        id: uuid::Uuid::new_v4().to_string(),
        repository_id: source.repository_id.clone(),
        bucket_id,
        source_check_id: source.id.clone(),
        source_object_id: source.source_object_id.clone(),
        check_config_id: source.check_config_id.clone(),
        object_id: target.id.clone(),
        object_type: target.object_type,
        children_only: false,
        deleted: false,
    })?;
    Ok(true)
}

/// Mark a configuration, its checks and their instances deleted, and
/// retire the instances' configuration versions.
pub fn delete_configuration(txn: &WriteTxn<'_>, config_id: &str) -> KeeperResult<usize> {
    let mut config: CheckConfiguration = txn
        .get(config_id)?
        .ok_or_else(|| KeeperError::NotFound(format!("check configuration {config_id}")))?;
    config.deleted = true;
    config.active = false;
    txn.put(&config)?;

    for mut check in txn.list_where(|c: &Check| c.check_config_id == config_id && !c.deleted)? {
        check.deleted = true;
        txn.put(&check)?;
    }

    let instances =
        txn.list_where(|i: &CheckInstance| i.check_config_id == config_id && !i.deleted)?;
    for instance in &instances {
        retire_instance(txn, &instance.id)?;
    }
    info!(%config_id, instances = instances.len(), "check configuration deleted");
    Ok(instances.len())
}

/// Counters from [`recompute_instances`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeReport {
    pub instances: usize,
    pub created: usize,
    pub new_versions: usize,
    pub unchanged: usize,
}

/// Recompute every check instance of a repository and feed the resulting
/// payloads to the lifecycle computation step.
pub fn recompute_instances(
    txn: &WriteTxn<'_>,
    repository_id: &str,
) -> KeeperResult<RecomputeReport> {
    let mut report = RecomputeReport::default();

    let mut existing: BTreeMap<(String, String), CheckInstance> = txn
        .list_where(|i: &CheckInstance| i.repository_id == repository_id && !i.deleted)?
        .into_iter()
        .map(|i| ((i.check_id.clone(), i.object_id.clone()), i))
        .collect();

    let mut checks = txn.list_where(|c: &Check| {
        c.repository_id == repository_id && c.applies_to_object()
    })?;
    checks.sort_by(|a, b| a.id.cmp(&b.id));

    for check in checks {
        let Some(config) = txn.get::<CheckConfiguration>(&check.check_config_id)? else {
            continue;
        };
        if config.deleted || !config.active || !config.enabled {
            continue;
        }

        let key = (check.id.clone(), check.object_id.clone());
        let instance = match existing.remove(&key) {
            Some(instance) => instance,
            None => {
                let instance = CheckInstance {
                    id: uuid::Uuid::new_v4().to_string(),
                    check_id: check.id.clone(),
                    check_config_id: config.id.clone(),
                    repository_id: repository_id.to_string(),
                    object_id: check.object_id.clone(),
                    object_type: check.object_type,
                    current_instance_config_id: None,
                    update_available: false,
                    deleted: false,
                };
                txn.put(&instance)?;
                report.created += 1;
                instance
            }
        };

        let details = build_details(txn, &instance, &check, &config)?;
        match compute_in(txn, &instance.id, &details)? {
            ComputeOutcome::Unchanged { .. } => report.unchanged += 1,
            _ => report.new_versions += 1,
        }
        report.instances += 1;
    }

    debug!(%repository_id, ?report, "check instances recomputed");
    Ok(report)
}

/// Assemble the deployment-detail document for one instance.
pub fn build_details(
    txn: &WriteTxn<'_>,
    instance: &CheckInstance,
    check: &Check,
    config: &CheckConfiguration,
) -> KeeperResult<DeploymentDetails> {
    let target = object_info(txn, &ObjectRef::new(check.object_id.clone(), check.object_type))?;
    let capability: Capability = txn.get(&config.capability_id)?.ok_or_else(|| {
        KeeperError::NotFound(format!("capability {}", config.capability_id))
    })?;
    let monitoring: MonitoringSystem = txn.get(&capability.monitoring_id)?.ok_or_else(|| {
        KeeperError::NotFound(format!("monitoring system {}", capability.monitoring_id))
    })?;
    let service = config.constraints.iter().find_map(|c| match c {
        Constraint::Service { name, attributes } => Some(ServiceDetails {
            name: name.clone(),
            attributes: attributes.clone(),
        }),
        _ => None,
    });

    Ok(DeploymentDetails {
        check_instance_id: instance.id.clone(),
        check_id: check.id.clone(),
        check_config_id: config.id.clone(),
        check_name: config.name.clone(),
        repository_id: config.repository_id.clone(),
        bucket_id: check.bucket_id.clone(),
        target: target.target(),
        capability,
        monitoring,
        interval: config.interval,
        thresholds: config.thresholds.clone(),
        constraints: config.constraints.clone(),
        service,
    })
}
