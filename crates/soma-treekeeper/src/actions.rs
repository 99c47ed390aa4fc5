//! Tree-mutating job actions.
//!
//! A job names its action and carries a JSON payload. Parsing happens at
//! admission so unknown actions and malformed payloads are rejected before
//! a job row exists; execution happens inside the repository's tree keeper.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use soma_state::{
    Bucket, CheckConfiguration, Cluster, Constraint, Group, Membership, Node, ObjectState,
    ObjectType, Threshold, WriteTxn, epoch_secs,
};

use crate::error::{KeeperError, KeeperResult};
use crate::inheritance::{attach_configuration, delete_configuration, inherit_from_ancestors};
use crate::tree::{ObjectRef, descendants, object_in_repository};

/// Every action name a tree keeper executes.
pub const ACTIONS: &[&str] = &[
    "create_bucket",
    "create_group",
    "create_cluster",
    "create_node",
    "add_group_to_group",
    "add_cluster_to_group",
    "add_node_to_group",
    "add_node_to_cluster",
    "set_property",
    "create_check_configuration",
    "delete_check_configuration",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBucket {
    pub id: Option<String>,
    pub name: String,
    pub environment: String,
}

/// Payload for groups and clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObject {
    pub id: Option<String>,
    pub name: String,
    pub bucket_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNode {
    pub id: Option<String>,
    pub name: String,
    pub asset_id: u64,
    pub bucket_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddMember {
    pub child_id: String,
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetProperty {
    pub object_id: String,
    pub object_type: ObjectType,
    pub key: String,
    pub value: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheckConfiguration {
    pub id: Option<String>,
    pub name: String,
    pub object_id: String,
    pub object_type: ObjectType,
    pub capability_id: String,
    pub interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub inheritance_enabled: bool,
    #[serde(default)]
    pub children_only: bool,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteCheckConfiguration {
    pub check_config_id: String,
}

/// A parsed tree-mutating action.
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    CreateBucket(CreateBucket),
    CreateGroup(CreateObject),
    CreateCluster(CreateObject),
    CreateNode(CreateNode),
    AddGroupToGroup(AddMember),
    AddClusterToGroup(AddMember),
    AddNodeToGroup(AddMember),
    AddNodeToCluster(AddMember),
    SetProperty(SetProperty),
    CreateCheckConfiguration(NewCheckConfiguration),
    DeleteCheckConfiguration(DeleteCheckConfiguration),
}

fn payload<T: DeserializeOwned>(action: &str, request: serde_json::Value) -> KeeperResult<T> {
    serde_json::from_value(request)
        .map_err(|e| KeeperError::InvalidRequest(format!("{action}: {e}")))
}

impl JobAction {
    /// Parse an action name and its payload.
    pub fn parse(action: &str, request: serde_json::Value) -> KeeperResult<Self> {
        let parsed = match action {
            "create_bucket" => JobAction::CreateBucket(payload(action, request)?),
            "create_group" => JobAction::CreateGroup(payload(action, request)?),
            "create_cluster" => JobAction::CreateCluster(payload(action, request)?),
            "create_node" => JobAction::CreateNode(payload(action, request)?),
            "add_group_to_group" => JobAction::AddGroupToGroup(payload(action, request)?),
            "add_cluster_to_group" => JobAction::AddClusterToGroup(payload(action, request)?),
            "add_node_to_group" => JobAction::AddNodeToGroup(payload(action, request)?),
            "add_node_to_cluster" => JobAction::AddNodeToCluster(payload(action, request)?),
            "set_property" => JobAction::SetProperty(payload(action, request)?),
            "create_check_configuration" => {
                JobAction::CreateCheckConfiguration(payload(action, request)?)
            }
            "delete_check_configuration" => {
                JobAction::DeleteCheckConfiguration(payload(action, request)?)
            }
            other => return Err(KeeperError::NotImplemented(other.to_string())),
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobAction::CreateBucket(_) => "create_bucket",
            JobAction::CreateGroup(_) => "create_group",
            JobAction::CreateCluster(_) => "create_cluster",
            JobAction::CreateNode(_) => "create_node",
            JobAction::AddGroupToGroup(_) => "add_group_to_group",
            JobAction::AddClusterToGroup(_) => "add_cluster_to_group",
            JobAction::AddNodeToGroup(_) => "add_node_to_group",
            JobAction::AddNodeToCluster(_) => "add_node_to_cluster",
            JobAction::SetProperty(_) => "set_property",
            JobAction::CreateCheckConfiguration(_) => "create_check_configuration",
            JobAction::DeleteCheckConfiguration(_) => "delete_check_configuration",
        }
    }

    /// Apply the action to `repository_id` inside `txn`.
    pub fn execute(&self, txn: &WriteTxn<'_>, repository_id: &str) -> KeeperResult<()> {
        match self {
            JobAction::CreateBucket(req) => create_bucket(txn, repository_id, req),
            JobAction::CreateGroup(req) => create_grouping(txn, repository_id, req, ObjectType::Group),
            JobAction::CreateCluster(req) => {
                create_grouping(txn, repository_id, req, ObjectType::Cluster)
            }
            JobAction::CreateNode(req) => create_node(txn, repository_id, req),
            JobAction::AddGroupToGroup(req) => {
                add_member(txn, repository_id, req, ObjectType::Group, ObjectType::Group)
            }
            JobAction::AddClusterToGroup(req) => {
                add_member(txn, repository_id, req, ObjectType::Cluster, ObjectType::Group)
            }
            JobAction::AddNodeToGroup(req) => {
                add_member(txn, repository_id, req, ObjectType::Node, ObjectType::Group)
            }
            JobAction::AddNodeToCluster(req) => {
                add_member(txn, repository_id, req, ObjectType::Node, ObjectType::Cluster)
            }
            JobAction::SetProperty(req) => set_property(txn, repository_id, req),
            JobAction::CreateCheckConfiguration(req) => {
                create_check_configuration(txn, repository_id, req)
            }
            JobAction::DeleteCheckConfiguration(req) => {
                let config: CheckConfiguration = txn.get(&req.check_config_id)?.ok_or_else(|| {
                    KeeperError::NotFound(format!("check configuration {}", req.check_config_id))
                })?;
                if config.repository_id != repository_id {
                    return Err(KeeperError::InvalidRequest(format!(
                        "check configuration {} belongs to repository {}",
                        config.id, config.repository_id
                    )));
                }
                delete_configuration(txn, &req.check_config_id).map(|_| ())
            }
        }
    }
}

fn new_id(requested: &Option<String>) -> String {
    requested
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn require_name(name: &str) -> KeeperResult<()> {
    if name.trim().is_empty() {
        return Err(KeeperError::InvalidRequest("name must not be empty".to_string()));
    }
    Ok(())
}

fn ensure_free<R: soma_state::Record>(txn: &WriteTxn<'_>, id: &str) -> KeeperResult<()> {
    if txn.get::<R>(id)?.is_some() {
        return Err(KeeperError::InvalidRequest(format!("id {id} already exists")));
    }
    Ok(())
}

/// Tree object ids share one namespace: memberships and checks refer to
/// objects by id alone.
fn ensure_object_id_free(txn: &WriteTxn<'_>, id: &str) -> KeeperResult<()> {
    ensure_free::<Bucket>(txn, id)?;
    ensure_free::<Group>(txn, id)?;
    ensure_free::<Cluster>(txn, id)?;
    ensure_free::<Node>(txn, id)
}

fn bucket_in_repository(
    txn: &WriteTxn<'_>,
    bucket_id: &str,
    repository_id: &str,
) -> KeeperResult<Bucket> {
    let bucket: Bucket = txn
        .get(bucket_id)?
        .ok_or_else(|| KeeperError::NotFound(format!("bucket {bucket_id}")))?;
    if bucket.repository_id != repository_id {
        return Err(KeeperError::InvalidRequest(format!(
            "bucket {bucket_id} belongs to repository {}",
            bucket.repository_id
        )));
    }
    Ok(bucket)
}

fn create_bucket(txn: &WriteTxn<'_>, repository_id: &str, req: &CreateBucket) -> KeeperResult<()> {
    require_name(&req.name)?;
    let id = new_id(&req.id);
    ensure_object_id_free(txn, &id)?;
    txn.put(&Bucket {
        id: id.clone(),
        name: req.name.clone(),
        repository_id: repository_id.to_string(),
        environment: req.environment.clone(),
        created_at: epoch_secs(),
    })?;
    inherit_from_ancestors(txn, &ObjectRef::new(id.clone(), ObjectType::Bucket))?;
    info!(%repository_id, bucket_id = %id, "bucket created");
    Ok(())
}

fn create_grouping(
    txn: &WriteTxn<'_>,
    repository_id: &str,
    req: &CreateObject,
    object_type: ObjectType,
) -> KeeperResult<()> {
    require_name(&req.name)?;
    bucket_in_repository(txn, &req.bucket_id, repository_id)?;
    let id = new_id(&req.id);
    match object_type {
        ObjectType::Group => {
            ensure_object_id_free(txn, &id)?;
            txn.put(&Group {
                id: id.clone(),
                name: req.name.clone(),
                bucket_id: req.bucket_id.clone(),
                state: ObjectState::Standalone,
                properties: req.properties.clone(),
            })?;
        }
        _ => {
            ensure_object_id_free(txn, &id)?;
            txn.put(&Cluster {
                id: id.clone(),
                name: req.name.clone(),
                bucket_id: req.bucket_id.clone(),
                state: ObjectState::Standalone,
                properties: req.properties.clone(),
            })?;
        }
    }
    inherit_from_ancestors(txn, &ObjectRef::new(id.clone(), object_type))?;
    info!(%repository_id, %object_type, object_id = %id, "object created");
    Ok(())
}

fn create_node(txn: &WriteTxn<'_>, repository_id: &str, req: &CreateNode) -> KeeperResult<()> {
    require_name(&req.name)?;
    bucket_in_repository(txn, &req.bucket_id, repository_id)?;
    let id = new_id(&req.id);
    ensure_object_id_free(txn, &id)?;
    txn.put(&Node {
        id: id.clone(),
        name: req.name.clone(),
        asset_id: req.asset_id,
        bucket_id: req.bucket_id.clone(),
        state: ObjectState::Standalone,
        properties: req.properties.clone(),
    })?;
    inherit_from_ancestors(txn, &ObjectRef::new(id.clone(), ObjectType::Node))?;
    info!(%repository_id, node_id = %id, asset_id = req.asset_id, "node created");
    Ok(())
}

fn set_state(txn: &WriteTxn<'_>, object: &ObjectRef, state: ObjectState) -> KeeperResult<()> {
    let missing = || KeeperError::NotFound(format!("{} {}", object.object_type, object.id));
    match object.object_type {
        ObjectType::Group => {
            let mut group: Group = txn.get(&object.id)?.ok_or_else(missing)?;
            group.state = state;
            txn.put(&group)?;
        }
        ObjectType::Cluster => {
            let mut cluster: Cluster = txn.get(&object.id)?.ok_or_else(missing)?;
            cluster.state = state;
            txn.put(&cluster)?;
        }
        ObjectType::Node => {
            let mut node: Node = txn.get(&object.id)?.ok_or_else(missing)?;
            node.state = state;
            txn.put(&node)?;
        }
        other => {
            return Err(KeeperError::InvalidRequest(format!("{other} has no placement state")));
        }
    }
    Ok(())
}

fn add_member(
    txn: &WriteTxn<'_>,
    repository_id: &str,
    req: &AddMember,
    child_type: ObjectType,
    parent_type: ObjectType,
) -> KeeperResult<()> {
    if req.child_id == req.parent_id {
        return Err(KeeperError::InvalidRequest(format!(
            "{} cannot contain itself",
            req.child_id
        )));
    }
    let child_ref = ObjectRef::new(req.child_id.clone(), child_type);
    let parent_ref = ObjectRef::new(req.parent_id.clone(), parent_type);
    let child = object_in_repository(txn, &child_ref, repository_id)?;
    let parent = object_in_repository(txn, &parent_ref, repository_id)?;

    if child.bucket_id != parent.bucket_id {
        return Err(KeeperError::InvalidRequest(format!(
            "{} and {} are in different buckets",
            child.id, parent.id
        )));
    }
    if child.state != Some(ObjectState::Standalone) {
        return Err(KeeperError::InvalidRequest(format!(
            "{child_type} {} is not standalone",
            child.id
        )));
    }
    if child_type == ObjectType::Group
        && descendants(txn, &child_ref)?
            .iter()
            .any(|d| d.id == parent.id)
    {
        return Err(KeeperError::InvalidRequest(format!(
            "group {} is a descendant of {}",
            parent.id, child.id
        )));
    }

    let child_state = match parent_type {
        ObjectType::Cluster => ObjectState::Clustered,
        _ => ObjectState::Grouped,
    };
    set_state(txn, &child_ref, child_state)?;
    txn.put(&Membership {
        child_id: child.id.clone(),
        child_type,
        parent_id: parent.id.clone(),
        parent_type,
    })?;
    inherit_from_ancestors(txn, &child_ref)?;
    info!(%repository_id, child = %child.id, parent = %parent.id, "membership added");
    Ok(())
}

fn set_property(txn: &WriteTxn<'_>, repository_id: &str, req: &SetProperty) -> KeeperResult<()> {
    let object = ObjectRef::new(req.object_id.clone(), req.object_type);
    object_in_repository(txn, &object, repository_id)?;
    let missing = || KeeperError::NotFound(format!("{} {}", req.object_type, req.object_id));
    match req.object_type {
        ObjectType::Group => {
            let mut group: Group = txn.get(&req.object_id)?.ok_or_else(missing)?;
            group.properties.insert(req.key.clone(), req.value.clone());
            txn.put(&group)?;
        }
        ObjectType::Cluster => {
            let mut cluster: Cluster = txn.get(&req.object_id)?.ok_or_else(missing)?;
            cluster.properties.insert(req.key.clone(), req.value.clone());
            txn.put(&cluster)?;
        }
        ObjectType::Node => {
            let mut node: Node = txn.get(&req.object_id)?.ok_or_else(missing)?;
            node.properties.insert(req.key.clone(), req.value.clone());
            txn.put(&node)?;
        }
        other => {
            return Err(KeeperError::InvalidRequest(format!("{other} carries no properties")));
        }
    }
    info!(%repository_id, object_id = %req.object_id, key = %req.key, "property set");
    Ok(())
}

fn create_check_configuration(
    txn: &WriteTxn<'_>,
    repository_id: &str,
    req: &NewCheckConfiguration,
) -> KeeperResult<()> {
    require_name(&req.name)?;
    if req.interval == 0 {
        return Err(KeeperError::InvalidRequest("interval must be positive".to_string()));
    }
    let object = ObjectRef::new(req.object_id.clone(), req.object_type);
    let target = object_in_repository(txn, &object, repository_id)?;
    if txn.get::<soma_state::Capability>(&req.capability_id)?.is_none() {
        return Err(KeeperError::NotFound(format!("capability {}", req.capability_id)));
    }
    let id = new_id(&req.id);
    ensure_free::<CheckConfiguration>(txn, &id)?;

    let config = CheckConfiguration {
        id,
        name: req.name.clone(),
        repository_id: repository_id.to_string(),
        bucket_id: target.bucket_id,
        object_id: req.object_id.clone(),
        object_type: req.object_type,
        capability_id: req.capability_id.clone(),
        interval: req.interval,
        active: true,
        enabled: req.enabled,
        inheritance_enabled: req.inheritance_enabled,
        children_only: req.children_only,
        thresholds: req.thresholds.clone(),
        constraints: req.constraints.clone(),
        deleted: false,
    };
    txn.put(&config)?;
    attach_configuration(txn, &config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use soma_state::{
        Capability, Check, CheckInstance, CheckInstanceConfiguration, DeploymentStatus,
        MonitoringSystem, Repository, StateStore,
    };

    use crate::inheritance::recompute_instances;

    fn store() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&Repository {
                id: "repo-1".into(),
                name: "infra".into(),
                team_id: "team-1".into(),
                created_at: 1,
            })
            .unwrap();
        store
            .put(&MonitoringSystem {
                id: "mon-1".into(),
                name: "icinga".into(),
                mode: "private".into(),
                contact: "ops".into(),
                team_id: "team-1".into(),
                callback: None,
            })
            .unwrap();
        store
            .put(&Capability {
                id: "cap-1".into(),
                monitoring_id: "mon-1".into(),
                metric: "cpu.load".into(),
                view: "local".into(),
            })
            .unwrap();
        store
    }

    fn run(store: &StateStore, action: &str, request: serde_json::Value) -> KeeperResult<()> {
        let action = JobAction::parse(action, request)?;
        store.write(|txn| {
            action.execute(txn, "repo-1")?;
            recompute_instances(txn, "repo-1").map(|_| ())
        })
    }

    fn seed_tree(store: &StateStore) {
        run(store, "create_bucket", json!({"id": "b1", "name": "live", "environment": "live"})).unwrap();
        run(store, "create_group", json!({"id": "g1", "name": "web", "bucket_id": "b1"})).unwrap();
        run(store, "create_group", json!({"id": "g2", "name": "web-eu", "bucket_id": "b1"})).unwrap();
        run(store, "create_node", json!({"id": "n1", "name": "web01", "asset_id": 4711, "bucket_id": "b1"})).unwrap();
        run(store, "add_group_to_group", json!({"child_id": "g2", "parent_id": "g1"})).unwrap();
        run(store, "add_node_to_group", json!({"child_id": "n1", "parent_id": "g2"})).unwrap();
    }

    fn check_config(id: &str, object_id: &str, object_type: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": "load",
            "object_id": object_id,
            "object_type": object_type,
            "capability_id": "cap-1",
            "interval": 60,
        })
    }

    #[test]
    fn unknown_action_is_not_implemented() {
        let err = JobAction::parse("launch_rocket", json!({})).unwrap_err();
        assert!(matches!(err, KeeperError::NotImplemented(name) if name == "launch_rocket"));
    }

    #[test]
    fn malformed_payload_is_invalid() {
        let err = JobAction::parse("create_group", json!({"name": 3})).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidRequest(_)));
    }

    #[test]
    fn every_listed_action_parses_by_name() {
        for name in ACTIONS {
            match JobAction::parse(name, json!({})) {
                Err(KeeperError::NotImplemented(_)) => panic!("{name} not dispatched"),
                Ok(action) => assert_eq!(action.name(), *name),
                Err(_) => {}
            }
        }
    }

    #[test]
    fn membership_sets_state_and_edge() {
        let store = store();
        seed_tree(&store);

        let g2: Group = store.require("g2").unwrap();
        assert_eq!(g2.state, ObjectState::Grouped);
        let edge: Membership = store.require("n1").unwrap();
        assert_eq!(edge.parent_id, "g2");
    }

    #[test]
    fn group_cycles_are_rejected() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_group", json!({"id": "g3", "name": "x", "bucket_id": "b1"})).unwrap();

        // g2 sits below g1.
        let err = run(&store, "add_group_to_group", json!({"child_id": "g1", "parent_id": "g2"}))
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidRequest(msg) if msg.contains("descendant")));

        let err = run(&store, "add_group_to_group", json!({"child_id": "g3", "parent_id": "g3"}))
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidRequest(_)));
    }

    #[test]
    fn grouped_child_cannot_join_twice() {
        let store = store();
        seed_tree(&store);
        let err = run(&store, "add_node_to_group", json!({"child_id": "n1", "parent_id": "g1"}))
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidRequest(msg) if msg.contains("not standalone")));
    }

    #[test]
    fn cross_bucket_membership_is_rejected() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_bucket", json!({"id": "b2", "name": "qa", "environment": "qa"})).unwrap();
        run(&store, "create_node", json!({"id": "n2", "name": "qa01", "asset_id": 1, "bucket_id": "b2"})).unwrap();

        let err = run(&store, "add_node_to_group", json!({"child_id": "n2", "parent_id": "g1"}))
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidRequest(msg) if msg.contains("different buckets")));
    }

    #[test]
    fn object_ids_are_unique_across_types() {
        let store = store();
        seed_tree(&store);

        for (action, request) in [
            ("create_node", json!({"id": "g2", "name": "x", "asset_id": 1, "bucket_id": "b1"})),
            ("create_cluster", json!({"id": "n1", "name": "x", "bucket_id": "b1"})),
            ("create_group", json!({"id": "b1", "name": "x", "bucket_id": "b1"})),
            ("create_bucket", json!({"id": "g1", "name": "x", "environment": "qa"})),
        ] {
            let err = run(&store, action, request).unwrap_err();
            assert!(matches!(err, KeeperError::InvalidRequest(msg) if msg.contains("already exists")));
        }

        let edge: Membership = store.require("g2").unwrap();
        assert_eq!(edge.child_type, ObjectType::Group);
        assert_eq!(edge.parent_id, "g1");
        assert!(store.get::<Node>("g2").unwrap().is_none());
    }

    #[test]
    fn failed_job_leaves_no_trace() {
        let store = store();
        seed_tree(&store);
        let err = run(&store, "create_node", json!({"id": "n9", "name": "x", "asset_id": 1, "bucket_id": "nope"}))
            .unwrap_err();
        assert!(matches!(err, KeeperError::NotFound(_)));
        assert!(store.get::<Node>("n9").unwrap().is_none());
    }

    #[test]
    fn inherited_checks_reach_every_descendant() {
        let store = store();
        seed_tree(&store);

        run(&store, "create_check_configuration", check_config("cfg-1", "g1", "group")).unwrap();

        let checks = store.list::<Check>().unwrap();
        let mut objects: Vec<&str> = checks.iter().map(|c| c.object_id.as_str()).collect();
        objects.sort();
        assert_eq!(objects, vec!["g1", "g2", "n1"]);
        assert_eq!(checks.iter().filter(|c| c.is_source()).count(), 1);

        let instances = store.list::<CheckInstance>().unwrap();
        assert_eq!(instances.len(), 3);
        for instance in instances {
            let config: CheckInstanceConfiguration = store
                .require(instance.current_instance_config_id.as_deref().unwrap())
                .unwrap();
            assert_eq!(config.status, DeploymentStatus::AwaitingRollout);
            assert_eq!(config.details["check_instance_id"], json!(instance.id));
        }
    }

    #[test]
    fn children_only_skips_the_source_object() {
        let store = store();
        seed_tree(&store);
        let mut request = check_config("cfg-1", "g1", "group");
        request["children_only"] = json!(true);

        run(&store, "create_check_configuration", request).unwrap();

        let mut objects: Vec<String> = store
            .list::<CheckInstance>()
            .unwrap()
            .into_iter()
            .map(|i| i.object_id)
            .collect();
        objects.sort();
        assert_eq!(objects, vec!["g2", "n1"]);
    }

    #[test]
    fn late_members_inherit_existing_checks() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_check_configuration", check_config("cfg-1", "b1", "bucket")).unwrap();
        assert_eq!(store.list::<CheckInstance>().unwrap().len(), 3);

        run(&store, "create_node", json!({"id": "n2", "name": "web02", "asset_id": 4712, "bucket_id": "b1"})).unwrap();

        let on_n2 = store
            .list_where(|i: &CheckInstance| i.object_id == "n2")
            .unwrap();
        assert_eq!(on_n2.len(), 1);
    }

    #[test]
    fn recompute_is_idempotent() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_check_configuration", check_config("cfg-1", "n1", "node")).unwrap();
        let before = store.list::<CheckInstanceConfiguration>().unwrap().len();

        let report = store.write(|txn| recompute_instances(txn, "repo-1")).unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(report.new_versions, 0);
        assert_eq!(store.list::<CheckInstanceConfiguration>().unwrap().len(), before);
    }

    #[test]
    fn property_change_produces_new_version() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_check_configuration", check_config("cfg-1", "n1", "node")).unwrap();

        run(
            &store,
            "set_property",
            json!({"object_id": "n1", "object_type": "node", "key": "dc", "value": "fra"}),
        )
        .unwrap();

        let configs = store.list::<CheckInstanceConfiguration>().unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(
            configs
                .iter()
                .filter(|c| c.status == DeploymentStatus::AwaitingRollout)
                .count(),
            1
        );
        assert!(configs.iter().any(|c| c.details["target"]["properties"]["dc"] == "fra"));
    }

    #[test]
    fn deleting_configuration_retires_instances() {
        let store = store();
        seed_tree(&store);
        run(&store, "create_check_configuration", check_config("cfg-1", "g1", "group")).unwrap();

        run(&store, "delete_check_configuration", json!({"check_config_id": "cfg-1"})).unwrap();

        assert!(store.list::<CheckInstance>().unwrap().iter().all(|i| i.deleted));
        assert!(store.list::<Check>().unwrap().iter().all(|c| c.deleted));
        assert!(
            store
                .list::<CheckInstanceConfiguration>()
                .unwrap()
                .iter()
                .all(|c| c.status == DeploymentStatus::AwaitingDeletion)
        );
    }

    #[test]
    fn check_configuration_needs_known_capability() {
        let store = store();
        seed_tree(&store);
        let mut request = check_config("cfg-1", "n1", "node");
        request["capability_id"] = json!("nope");

        let err = run(&store, "create_check_configuration", request).unwrap_err();
        assert!(matches!(err, KeeperError::NotFound(msg) if msg.contains("capability")));
    }
}
