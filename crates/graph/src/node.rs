use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use slab::Slab;

use crate::NodeId;

/// Identifies a node by the same coordinates applications use: resource
/// name plus row id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    pub resource: String,
    pub id: String,
}

impl NodeKey {
    pub fn new(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.id)
    }
}

/// A per-node subscriber callback. Not `FnMut`: callbacks are expected to
/// be idempotent notifications ("something changed, go re-evaluate"), not
/// stateful handlers (spec.md §4.7).
pub type NodeSubscriber = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`crate::ObjectGraph::subscribe`]; pass back to
/// [`crate::ObjectGraph::unsubscribe`] to remove the callback.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionToken {
    pub(crate) node: NodeId,
    pub(crate) key: usize,
}

pub(crate) struct Node {
    pub key: NodeKey,
    pub references: BTreeMap<String, NodeId>,
    pub referenced_by: BTreeMap<String, BTreeSet<NodeId>>,
    pub subscribers: Slab<NodeSubscriber>,
}

impl Node {
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            references: BTreeMap::new(),
            referenced_by: BTreeMap::new(),
            subscribers: Slab::new(),
        }
    }
}
