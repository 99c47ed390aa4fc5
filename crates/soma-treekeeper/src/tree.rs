//! Read helpers over the persisted inventory tree.
//!
//! Repositories contain buckets; buckets contain groups, clusters and
//! nodes. Below that, membership edges (keyed by child) nest objects:
//! groups hold groups, clusters and nodes; clusters hold nodes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use soma_state::{
    Bucket, Cluster, Group, Membership, Node, ObjectState, ObjectType, Repository, TargetDetails,
    WriteTxn,
};

use crate::error::{KeeperError, KeeperResult};

/// A tree object reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub id: String,
    pub object_type: ObjectType,
}

impl ObjectRef {
    pub fn new(id: impl Into<String>, object_type: ObjectType) -> Self {
        Self {
            id: id.into(),
            object_type,
        }
    }
}

/// Summary of one tree object, whatever its type.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub id: String,
    pub object_type: ObjectType,
    pub name: String,
    pub repository_id: String,
    pub bucket_id: Option<String>,
    pub state: Option<ObjectState>,
    pub asset_id: Option<u64>,
    pub properties: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn target(&self) -> TargetDetails {
        TargetDetails {
            id: self.id.clone(),
            object_type: self.object_type,
            name: self.name.clone(),
            asset_id: self.asset_id,
            properties: self.properties.clone(),
        }
    }
}

fn repository_of_bucket(txn: &WriteTxn<'_>, bucket_id: &str) -> KeeperResult<String> {
    let bucket: Bucket = txn
        .get(bucket_id)?
        .ok_or_else(|| KeeperError::NotFound(format!("bucket {bucket_id}")))?;
    Ok(bucket.repository_id)
}

/// Load any tree object by id and type.
pub fn object_info(txn: &WriteTxn<'_>, object: &ObjectRef) -> KeeperResult<ObjectInfo> {
    let missing = || KeeperError::NotFound(format!("{} {}", object.object_type, object.id));
    let info = match object.object_type {
        ObjectType::Repository => {
            let repo: Repository = txn.get(&object.id)?.ok_or_else(missing)?;
            ObjectInfo {
                id: repo.id.clone(),
                object_type: ObjectType::Repository,
                name: repo.name,
                repository_id: repo.id,
                bucket_id: None,
                state: None,
                asset_id: None,
                properties: BTreeMap::new(),
            }
        }
        ObjectType::Bucket => {
            let bucket: Bucket = txn.get(&object.id)?.ok_or_else(missing)?;
            ObjectInfo {
                id: bucket.id.clone(),
                object_type: ObjectType::Bucket,
                name: bucket.name,
                repository_id: bucket.repository_id,
                bucket_id: Some(bucket.id),
                state: None,
                asset_id: None,
                properties: BTreeMap::new(),
            }
        }
        ObjectType::Group => {
            let group: Group = txn.get(&object.id)?.ok_or_else(missing)?;
            ObjectInfo {
                repository_id: repository_of_bucket(txn, &group.bucket_id)?,
                id: group.id,
                object_type: ObjectType::Group,
                name: group.name,
                bucket_id: Some(group.bucket_id),
                state: Some(group.state),
                asset_id: None,
                properties: group.properties,
            }
        }
        ObjectType::Cluster => {
            let cluster: Cluster = txn.get(&object.id)?.ok_or_else(missing)?;
            ObjectInfo {
                repository_id: repository_of_bucket(txn, &cluster.bucket_id)?,
                id: cluster.id,
                object_type: ObjectType::Cluster,
                name: cluster.name,
                bucket_id: Some(cluster.bucket_id),
                state: Some(cluster.state),
                asset_id: None,
                properties: cluster.properties,
            }
        }
        ObjectType::Node => {
            let node: Node = txn.get(&object.id)?.ok_or_else(missing)?;
            ObjectInfo {
                repository_id: repository_of_bucket(txn, &node.bucket_id)?,
                id: node.id,
                object_type: ObjectType::Node,
                name: node.name,
                bucket_id: Some(node.bucket_id),
                state: Some(node.state),
                asset_id: Some(node.asset_id),
                properties: node.properties,
            }
        }
    };
    Ok(info)
}

/// Load an object and make sure it lives in `repository_id`.
pub fn object_in_repository(
    txn: &WriteTxn<'_>,
    object: &ObjectRef,
    repository_id: &str,
) -> KeeperResult<ObjectInfo> {
    let info = object_info(txn, object)?;
    if info.repository_id != repository_id {
        return Err(KeeperError::InvalidRequest(format!(
            "{} {} belongs to repository {}",
            object.object_type, object.id, info.repository_id
        )));
    }
    Ok(info)
}

/// Direct children via membership edges.
pub fn children(txn: &WriteTxn<'_>, parent_id: &str) -> KeeperResult<Vec<ObjectRef>> {
    let mut refs: Vec<ObjectRef> = txn
        .list_where(|m: &Membership| m.parent_id == parent_id)?
        .into_iter()
        .map(|m| ObjectRef::new(m.child_id, m.child_type))
        .collect();
    refs.sort();
    Ok(refs)
}

/// Everything below `object`, breadth first, parents before children.
pub fn descendants(txn: &WriteTxn<'_>, object: &ObjectRef) -> KeeperResult<Vec<ObjectRef>> {
    match object.object_type {
        ObjectType::Repository => {
            let mut all = Vec::new();
            let mut buckets = txn.list_where(|b: &Bucket| b.repository_id == object.id)?;
            buckets.sort_by(|a, b| a.id.cmp(&b.id));
            for bucket in buckets {
                let bucket_ref = ObjectRef::new(bucket.id, ObjectType::Bucket);
                let below = descendants(txn, &bucket_ref)?;
                all.push(bucket_ref);
                all.extend(below);
            }
            Ok(all)
        }
        ObjectType::Bucket => {
            // Top-level objects first, then whatever hangs below them.
            let mut top = Vec::new();
            for member in bucket_members(txn, &object.id)? {
                if txn.get::<Membership>(&member.id)?.is_none() {
                    top.push(member);
                }
            }
            let mut all = Vec::new();
            for member in top {
                let below = descendants(txn, &member)?;
                all.push(member);
                all.extend(below);
            }
            Ok(all)
        }
        ObjectType::Group | ObjectType::Cluster | ObjectType::Node => {
            let mut all = Vec::new();
            let mut seen = BTreeSet::new();
            let mut queue = VecDeque::from([object.id.clone()]);
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                for child in children(txn, &id)? {
                    queue.push_back(child.id.clone());
                    all.push(child);
                }
            }
            Ok(all)
        }
    }
}

/// Groups, clusters and nodes of a bucket.
pub fn bucket_members(txn: &WriteTxn<'_>, bucket_id: &str) -> KeeperResult<Vec<ObjectRef>> {
    let mut members = Vec::new();
    members.extend(
        txn.list_where(|g: &Group| g.bucket_id == bucket_id)?
            .into_iter()
            .map(|g| ObjectRef::new(g.id, ObjectType::Group)),
    );
    members.extend(
        txn.list_where(|c: &Cluster| c.bucket_id == bucket_id)?
            .into_iter()
            .map(|c| ObjectRef::new(c.id, ObjectType::Cluster)),
    );
    members.extend(
        txn.list_where(|n: &Node| n.bucket_id == bucket_id)?
            .into_iter()
            .map(|n| ObjectRef::new(n.id, ObjectType::Node)),
    );
    members.sort();
    Ok(members)
}

/// Everything above `object`, nearest first: membership parents, then
/// the bucket, then the repository.
pub fn ancestors(txn: &WriteTxn<'_>, object: &ObjectRef) -> KeeperResult<Vec<ObjectRef>> {
    let mut chain = Vec::new();
    match object.object_type {
        ObjectType::Repository => return Ok(chain),
        ObjectType::Bucket => {
            chain.push(ObjectRef::new(
                repository_of_bucket(txn, &object.id)?,
                ObjectType::Repository,
            ));
            return Ok(chain);
        }
        _ => {}
    }

    let mut seen = BTreeSet::from([object.id.clone()]);
    let mut current = object.id.clone();
    while let Some(edge) = txn.get::<Membership>(&current)? {
        if !seen.insert(edge.parent_id.clone()) {
            return Err(KeeperError::InvalidRequest(format!(
                "membership cycle through {}",
                edge.parent_id
            )));
        }
        chain.push(ObjectRef::new(edge.parent_id.clone(), edge.parent_type));
        current = edge.parent_id;
    }

    let info = object_info(txn, object)?;
    if let Some(bucket_id) = info.bucket_id {
        chain.push(ObjectRef::new(bucket_id, ObjectType::Bucket));
    }
    chain.push(ObjectRef::new(info.repository_id, ObjectType::Repository));
    Ok(chain)
}
