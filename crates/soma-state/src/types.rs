//! Domain types for the Soma state store.
//!
//! These types represent the persisted inventory tree, the job ledger,
//! checks and the versioned deployment payloads derived from them. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::status::DeploymentStatus;
use crate::tables::*;

/// Identifiers are UUID strings.
pub type RecordId = String;

/// A value that lives in exactly one table under a stable key.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: RecordTable;

    /// Key under which this record is stored.
    fn table_key(&self) -> String;
}

macro_rules! record {
    ($ty:ty, $table:expr) => {
        impl Record for $ty {
            const TABLE: RecordTable = $table;

            fn table_key(&self) -> String {
                self.id.clone()
            }
        }
    };
}

// ── Inventory ─────────────────────────────────────────────────────

/// Kind of object in the inventory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Repository,
    Bucket,
    Group,
    Cluster,
    Node,
}

impl ObjectType {
    /// Load order for source checks: parents before children.
    pub const LOAD_ORDER: [ObjectType; 5] = [
        ObjectType::Repository,
        ObjectType::Bucket,
        ObjectType::Group,
        ObjectType::Cluster,
        ObjectType::Node,
    ];

    /// Object types that receive check instances.
    pub fn is_deployment_target(self) -> bool {
        matches!(self, ObjectType::Group | ObjectType::Cluster | ObjectType::Node)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Repository => "repository",
            ObjectType::Bucket => "bucket",
            ObjectType::Group => "group",
            ObjectType::Cluster => "cluster",
            ObjectType::Node => "node",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement state of a group, cluster or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Unassigned,
    Standalone,
    Grouped,
    Clustered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: RecordId,
    pub name: String,
    pub team_id: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
    pub id: RecordId,
    pub name: String,
    pub repository_id: RecordId,
    pub environment: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: RecordId,
    pub name: String,
    pub bucket_id: RecordId,
    pub state: ObjectState,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: RecordId,
    pub name: String,
    pub bucket_id: RecordId,
    pub state: ObjectState,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: RecordId,
    pub name: String,
    /// Physical host identifier.
    pub asset_id: u64,
    pub bucket_id: RecordId,
    pub state: ObjectState,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Child → parent edge. Stored under the child id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub child_id: RecordId,
    pub child_type: ObjectType,
    pub parent_id: RecordId,
    pub parent_type: ObjectType,
}

record!(Repository, REPOSITORIES);
record!(Bucket, BUCKETS);
record!(Group, GROUPS);
record!(Cluster, CLUSTERS);
record!(Node, NODES);

impl Record for Membership {
    const TABLE: RecordTable = MEMBERSHIPS;

    fn table_key(&self) -> String {
        self.child_id.clone()
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Pending,
    Success,
    Failed,
}

/// One admitted tree-mutating request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: RecordId,
    pub status: JobStatus,
    pub result: JobResult,
    /// Action name, e.g. `create_group`.
    pub job_type: String,
    pub repository_id: RecordId,
    pub user: String,
    pub team: String,
    /// Serialized request payload.
    pub request: serde_json::Value,
    pub error: Option<String>,
    /// Admission order within the ledger, assigned on insert.
    #[serde(default)]
    pub sequence: u64,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

record!(Job, JOBS);

// ── Monitoring ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringSystem {
    pub id: RecordId,
    pub name: String,
    pub mode: String,
    pub contact: String,
    pub team_id: String,
    /// Receives poke notifications when set.
    pub callback: Option<String>,
}

/// A metric a monitoring system can measure through a view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub id: RecordId,
    pub monitoring_id: RecordId,
    pub metric: String,
    pub view: String,
}

record!(MonitoringSystem, MONITORING_SYSTEMS);
record!(Capability, CAPABILITIES);

// ── Checks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub predicate: String,
    pub level: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceAttribute {
    pub name: String,
    pub value: String,
}

impl ServiceAttribute {
    /// Attributes carrying secrets are never handed out in host bundles.
    pub fn is_credential(&self) -> bool {
        self.name.starts_with("credential_")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    Native { property: String, value: String },
    System { property: String, value: String },
    Custom { property: String, value: String },
    Service { name: String, attributes: Vec<ServiceAttribute> },
    Attribute { name: String, value: String },
}

/// What to check, where, and how it propagates down the tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfiguration {
    pub id: RecordId,
    pub name: String,
    pub repository_id: RecordId,
    pub bucket_id: Option<RecordId>,
    pub object_id: RecordId,
    pub object_type: ObjectType,
    pub capability_id: RecordId,
    /// Check interval in seconds.
    pub interval: u64,
    pub active: bool,
    pub enabled: bool,
    pub inheritance_enabled: bool,
    pub children_only: bool,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub deleted: bool,
}

/// Attachment of a configuration to one tree object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Check {
    pub id: RecordId,
    pub repository_id: RecordId,
    pub bucket_id: Option<RecordId>,
    /// Equal to `id` for source checks.
    pub source_check_id: RecordId,
    pub source_object_id: RecordId,
    pub check_config_id: RecordId,
    pub object_id: RecordId,
    pub object_type: ObjectType,
    /// Source check that does not apply to its own object.
    #[serde(default)]
    pub children_only: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Check {
    pub fn is_source(&self) -> bool {
        self.id == self.source_check_id
    }

    /// Whether this check yields a check instance on its own object.
    pub fn applies_to_object(&self) -> bool {
        !self.deleted
            && self.object_type.is_deployment_target()
            && !(self.is_source() && self.children_only)
    }
}

/// The realized deployment target for one check on one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInstance {
    pub id: RecordId,
    pub check_id: RecordId,
    pub check_config_id: RecordId,
    pub repository_id: RecordId,
    pub object_id: RecordId,
    pub object_type: ObjectType,
    pub current_instance_config_id: Option<RecordId>,
    pub update_available: bool,
    pub deleted: bool,
}

/// One version of the deployment payload for a check instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInstanceConfiguration {
    pub id: RecordId,
    pub check_instance_id: RecordId,
    pub version: u64,
    pub monitoring_id: RecordId,
    pub constraint_hash: String,
    pub value_hash: String,
    pub details: serde_json::Value,
    pub status: DeploymentStatus,
    pub next_status: Option<DeploymentStatus>,
    pub awaiting_deletion: bool,
    pub created_at: u64,
    pub activated_at: Option<u64>,
    pub deprovisioned_at: Option<u64>,
    pub status_updated_at: u64,
}

impl CheckInstanceConfiguration {
    /// Move to `status`, recording the scheduled successor from the table.
    pub fn set_status(&mut self, status: DeploymentStatus, now: u64) {
        self.status = status;
        self.next_status = status.scheduled_next();
        self.awaiting_deletion = status == DeploymentStatus::AwaitingDeletion;
        self.status_updated_at = now;
        match status {
            DeploymentStatus::Active => self.activated_at = Some(now),
            DeploymentStatus::Deprovisioned => self.deprovisioned_at = Some(now),
            _ => {}
        }
    }
}

/// `blocked` may not proceed until `blocking` reaches `unblocking_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInstanceConfigurationDependency {
    pub blocked_instance_config_id: RecordId,
    pub blocking_instance_config_id: RecordId,
    pub unblocking_state: DeploymentStatus,
}

record!(CheckConfiguration, CHECK_CONFIGURATIONS);
record!(Check, CHECKS);
record!(CheckInstance, CHECK_INSTANCES);
record!(CheckInstanceConfiguration, CHECK_INSTANCE_CONFIGURATIONS);

impl Record for CheckInstanceConfigurationDependency {
    const TABLE: RecordTable = CHECK_INSTANCE_CONFIGURATION_DEPENDENCIES;

    fn table_key(&self) -> String {
        format!(
            "{}:{}",
            self.blocked_instance_config_id, self.blocking_instance_config_id
        )
    }
}

// ── Deployment details ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDetails {
    pub id: RecordId,
    pub object_type: ObjectType,
    pub name: String,
    pub asset_id: Option<u64>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDetails {
    pub name: String,
    pub attributes: Vec<ServiceAttribute>,
}

/// The document handed to monitoring systems for one check instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDetails {
    pub check_instance_id: RecordId,
    pub check_id: RecordId,
    pub check_config_id: RecordId,
    pub check_name: String,
    pub repository_id: RecordId,
    pub bucket_id: Option<RecordId>,
    pub target: TargetDetails,
    pub capability: Capability,
    pub monitoring: MonitoringSystem,
    pub interval: u64,
    pub thresholds: Vec<Threshold>,
    pub constraints: Vec<Constraint>,
    pub service: Option<ServiceDetails>,
}

impl DeploymentDetails {
    /// Remove credential-bearing service attributes in place.
    pub fn strip_credentials(&mut self) {
        if let Some(service) = self.service.as_mut() {
            service.attributes.retain(|a| !a.is_credential());
        }
        for constraint in &mut self.constraints {
            if let Constraint::Service { attributes, .. } = constraint {
                attributes.retain(|a| !a.is_credential());
            }
        }
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(id: &str, source: &str, object_type: ObjectType, children_only: bool) -> Check {
        Check {
            id: id.to_string(),
            repository_id: "repo".to_string(),
            bucket_id: None,
            source_check_id: source.to_string(),
            source_object_id: "obj".to_string(),
            check_config_id: "cfg".to_string(),
            object_id: "obj".to_string(),
            object_type,
            children_only,
            deleted: false,
        }
    }

    #[test]
    fn children_only_source_does_not_apply_to_itself() {
        assert!(!check("c1", "c1", ObjectType::Group, true).applies_to_object());
        assert!(check("c2", "c1", ObjectType::Node, true).applies_to_object());
    }

    #[test]
    fn buckets_receive_no_instances() {
        assert!(!check("c1", "c1", ObjectType::Bucket, false).applies_to_object());
    }

    #[test]
    fn set_status_records_timestamps() {
        let mut cfg = CheckInstanceConfiguration {
            id: "cic".to_string(),
            check_instance_id: "ci".to_string(),
            version: 0,
            monitoring_id: "mon".to_string(),
            constraint_hash: String::new(),
            value_hash: String::new(),
            details: serde_json::json!({}),
            status: DeploymentStatus::RolloutInProgress,
            next_status: Some(DeploymentStatus::Active),
            awaiting_deletion: false,
            created_at: 1,
            activated_at: None,
            deprovisioned_at: None,
            status_updated_at: 1,
        };
        cfg.set_status(DeploymentStatus::Active, 42);
        assert_eq!(cfg.activated_at, Some(42));
        assert_eq!(cfg.next_status, None);

        cfg.set_status(DeploymentStatus::AwaitingDeletion, 43);
        assert!(cfg.awaiting_deletion);
    }

    #[test]
    fn strip_credentials_keeps_plain_attributes() {
        let attrs = vec![
            ServiceAttribute { name: "port".into(), value: "5432".into() },
            ServiceAttribute { name: "credential_password".into(), value: "hunter2".into() },
        ];
        let mut details = DeploymentDetails {
            check_instance_id: "ci".into(),
            check_id: "c".into(),
            check_config_id: "cfg".into(),
            check_name: "db".into(),
            repository_id: "r".into(),
            bucket_id: None,
            target: TargetDetails {
                id: "n".into(),
                object_type: ObjectType::Node,
                name: "db01".into(),
                asset_id: Some(7),
                properties: BTreeMap::new(),
            },
            capability: Capability {
                id: "cap".into(),
                monitoring_id: "mon".into(),
                metric: "db.up".into(),
                view: "local".into(),
            },
            monitoring: MonitoringSystem {
                id: "mon".into(),
                name: "icinga".into(),
                mode: "private".into(),
                contact: "ops".into(),
                team_id: "t".into(),
                callback: None,
            },
            interval: 60,
            thresholds: vec![],
            constraints: vec![Constraint::Service {
                name: "postgres".into(),
                attributes: attrs.clone(),
            }],
            service: Some(ServiceDetails { name: "postgres".into(), attributes: attrs }),
        };

        details.strip_credentials();

        let service = details.service.unwrap();
        assert_eq!(service.attributes.len(), 1);
        assert_eq!(service.attributes[0].name, "port");
        match &details.constraints[0] {
            Constraint::Service { attributes, .. } => assert_eq!(attributes.len(), 1),
            other => panic!("unexpected constraint {other:?}"),
        }
    }
}
