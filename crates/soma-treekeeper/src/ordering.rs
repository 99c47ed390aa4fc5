//! Topological ordering of nested groups.
//!
//! Groups may contain groups, so checks inherited through them must be
//! loaded parent before child. The result maps every standalone root group
//! to its descendants in that order.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use soma_state::ObjectState;

use crate::error::{KeeperError, KeeperResult};

/// Consecutive iterations without progress before giving up.
const MAX_IDLE_ITERATIONS: usize = 3;

/// Data-integrity findings that do not stop the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupAnomaly {
    /// Group state is neither standalone nor grouped.
    WeirdState { group_id: String, state: ObjectState },
    /// Standalone group that nonetheless has a parent edge.
    StandaloneWithParent { group_id: String, parent_id: String },
    /// Grouped group without a parent edge.
    GroupedWithoutParent { group_id: String },
    /// Edge naming a group that does not exist.
    UnknownChild { child_id: String, parent_id: String },
}

/// Output of [`order_groups`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupOrder {
    /// Root group id → descendants, each parent before its children.
    pub order: BTreeMap<String, Vec<String>>,
    pub anomalies: Vec<GroupAnomaly>,
}

impl GroupOrder {
    /// Every ordered group id: each root followed by its descendants.
    pub fn flatten(&self) -> Vec<String> {
        let mut all = Vec::new();
        for (root, descendants) in &self.order {
            all.push(root.clone());
            all.extend(descendants.iter().cloned());
        }
        all
    }
}

/// Order groups given their states and `child → parent` edges.
///
/// Fails with `OrderingFailed` when the remaining edges form a cycle or
/// point at a parent that never appears in the order.
pub fn order_groups(
    states: &BTreeMap<String, ObjectState>,
    edges: &BTreeMap<String, String>,
) -> KeeperResult<GroupOrder> {
    let mut result = GroupOrder::default();

    for (group_id, state) in states {
        match state {
            ObjectState::Standalone => {
                result.order.insert(group_id.clone(), Vec::new());
            }
            ObjectState::Grouped => {
                if !edges.contains_key(group_id) {
                    result.anomalies.push(GroupAnomaly::GroupedWithoutParent {
                        group_id: group_id.clone(),
                    });
                }
            }
            other => result.anomalies.push(GroupAnomaly::WeirdState {
                group_id: group_id.clone(),
                state: *other,
            }),
        }
    }

    let mut unresolved: BTreeMap<String, String> = BTreeMap::new();
    for (child, parent) in edges {
        match states.get(child) {
            None => result.anomalies.push(GroupAnomaly::UnknownChild {
                child_id: child.clone(),
                parent_id: parent.clone(),
            }),
            Some(ObjectState::Standalone) => {
                result.anomalies.push(GroupAnomaly::StandaloneWithParent {
                    group_id: child.clone(),
                    parent_id: parent.clone(),
                })
            }
            Some(ObjectState::Grouped) => {
                unresolved.insert(child.clone(), parent.clone());
            }
            // Already reported as a weird state.
            Some(_) => {}
        }
    }

    for anomaly in &result.anomalies {
        warn!(?anomaly, "group data anomaly");
    }

    // Pass 1: direct children of roots.
    unresolved.retain(|child, parent| match result.order.get_mut(parent) {
        Some(list) => {
            list.push(child.clone());
            false
        }
        None => true,
    });

    // Pass 2: attach children below groups that are already placed.
    let mut idle = 0;
    while !unresolved.is_empty() {
        let before = unresolved.len();
        let pending: Vec<(String, String)> = unresolved
            .iter()
            .map(|(c, p)| (c.clone(), p.clone()))
            .collect();

        for (child, parent) in pending {
            let root = result
                .order
                .iter()
                .find(|(_, list)| list.contains(&parent))
                .map(|(root, _)| root.clone());
            if let Some(root) = root {
                if let Some(list) = result.order.get_mut(&root) {
                    list.push(child.clone());
                }
                unresolved.remove(&child);
            }
        }

        if unresolved.len() == before {
            idle += 1;
            if idle >= MAX_IDLE_ITERATIONS {
                let stuck: Vec<String> = unresolved
                    .iter()
                    .map(|(c, p)| format!("{c}->{p}"))
                    .collect();
                return Err(KeeperError::OrderingFailed(format!(
                    "unresolvable group edges: {}",
                    stuck.join(", ")
                )));
            }
        } else {
            idle = 0;
        }
    }

    Ok(result)
}
