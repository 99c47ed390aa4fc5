//! redb table definitions for the Soma state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Keys are record ids (UUID strings) except for `MEMBERSHIPS`, which is
//! keyed by the child object id so that every object has at most one parent.

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Repositories keyed by `{repository_id}`.
pub const REPOSITORIES: RecordTable = TableDefinition::new("repositories");

/// Buckets keyed by `{bucket_id}`.
pub const BUCKETS: RecordTable = TableDefinition::new("buckets");

/// Groups keyed by `{group_id}`.
pub const GROUPS: RecordTable = TableDefinition::new("groups");

/// Clusters keyed by `{cluster_id}`.
pub const CLUSTERS: RecordTable = TableDefinition::new("clusters");

/// Nodes keyed by `{node_id}`.
pub const NODES: RecordTable = TableDefinition::new("nodes");

/// Child → parent membership edges keyed by `{child_id}`.
pub const MEMBERSHIPS: RecordTable = TableDefinition::new("memberships");

/// Job ledger keyed by `{job_id}`.
pub const JOBS: RecordTable = TableDefinition::new("jobs");

/// Monitoring systems keyed by `{monitoring_id}`.
pub const MONITORING_SYSTEMS: RecordTable = TableDefinition::new("monitoring_systems");

/// Capabilities keyed by `{capability_id}`.
pub const CAPABILITIES: RecordTable = TableDefinition::new("capabilities");

/// Check configurations keyed by `{check_config_id}`.
pub const CHECK_CONFIGURATIONS: RecordTable = TableDefinition::new("check_configurations");

/// Checks keyed by `{check_id}`.
pub const CHECKS: RecordTable = TableDefinition::new("checks");

/// Check instances keyed by `{check_instance_id}`.
pub const CHECK_INSTANCES: RecordTable = TableDefinition::new("check_instances");

/// Versioned deployment payloads keyed by `{check_instance_config_id}`.
pub const CHECK_INSTANCE_CONFIGURATIONS: RecordTable =
    TableDefinition::new("check_instance_configurations");

/// Dependency edges keyed by `{blocked_id}:{blocking_id}`.
pub const CHECK_INSTANCE_CONFIGURATION_DEPENDENCIES: RecordTable =
    TableDefinition::new("check_instance_configuration_dependencies");

/// Monotonic counters keyed by counter name.
pub const COUNTERS: TableDefinition<'static, &'static str, u64> = TableDefinition::new("counters");

/// Counter that orders jobs by admission.
pub const JOB_SEQUENCE: &str = "jobs";

/// Every record table, for bootstrap.
pub const ALL_TABLES: [RecordTable; 14] = [
    REPOSITORIES,
    BUCKETS,
    GROUPS,
    CLUSTERS,
    NODES,
    MEMBERSHIPS,
    JOBS,
    MONITORING_SYSTEMS,
    CAPABILITIES,
    CHECK_CONFIGURATIONS,
    CHECKS,
    CHECK_INSTANCES,
    CHECK_INSTANCE_CONFIGURATIONS,
    CHECK_INSTANCE_CONFIGURATION_DEPENDENCIES,
];
