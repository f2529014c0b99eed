//! The object graph (spec.md §4.7, §9 "Cyclic object graph"): an arena of
//! nodes keyed by `(resource, id)`, with per-relation edges and per-node
//! subscribers. Cycles (org ↔ posts ↔ comments ↔ author) are expected;
//! edges are plain references into the arena, never ownership, so the
//! arena itself owns every node's lifetime.

mod node;

pub use node::{NodeKey, NodeSubscriber, SubscriptionToken};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use errors::ErrorMetadata;
use slab::Slab;

use node::Node;

/// A stable handle to a node in the arena. Never reused while the node it
/// names is alive; cheap to copy and compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Default)]
pub struct ObjectGraph {
    nodes: Slab<Node>,
    index: HashMap<NodeKey, NodeId>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.index.contains_key(key)
    }

    /// `createNode(id, type, manyRelationNames)`. Fails if the node already
    /// exists; a node exists iff at least one field of the corresponding
    /// object has been seen (spec.md §3), so construction is the caller's
    /// responsibility at first-sight, not re-triggered on every mutation.
    pub fn create_node(&mut self, key: NodeKey) -> anyhow::Result<NodeId> {
        if self.index.contains_key(&key) {
            anyhow::bail!(ErrorMetadata::internal(format!(
                "Node {key:?} already exists in the object graph."
            )));
        }
        let id = NodeId(self.nodes.insert(Node::new(key.clone())));
        self.index.insert(key, id);
        Ok(id)
    }

    /// Returns the existing node for `key`, creating it if absent. This is
    /// the common case callers want: "ensure a node exists for this id"
    /// (spec.md §4.8 step 5).
    pub fn ensure_node(&mut self, key: NodeKey) -> NodeId {
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        self.create_node(key).expect("just checked absence")
    }

    /// `createLink(sourceId, targetId, relationName)`.
    pub fn create_link(&mut self, source: NodeId, target: NodeId, relation: &str) -> anyhow::Result<()> {
        self.require(source)?;
        self.require(target)?;
        self.nodes[source.0]
            .references
            .insert(relation.to_string(), target);
        self.nodes[target.0]
            .referenced_by
            .entry(relation.to_string())
            .or_default()
            .insert(source);
        self.notify_subscribers(target);
        Ok(())
    }

    /// `removeLink(sourceId, relationName)`.
    pub fn remove_link(&mut self, source: NodeId, relation: &str) -> anyhow::Result<()> {
        self.require(source)?;
        let target = self.nodes[source.0].references.remove(relation);
        if let Some(target) = target {
            if let Some(set) = self.nodes[target.0].referenced_by.get_mut(relation) {
                set.remove(&source);
            }
            self.notify_subscribers(target);
        }
        Ok(())
    }

    pub fn references(&self, node: NodeId) -> Option<&BTreeMap<String, NodeId>> {
        self.nodes.get(node.0).map(|n| &n.references)
    }

    pub fn referenced_by(&self, node: NodeId, relation: &str) -> BTreeSet<NodeId> {
        self.nodes
            .get(node.0)
            .and_then(|n| n.referenced_by.get(relation))
            .cloned()
            .unwrap_or_default()
    }

    pub fn key(&self, node: NodeId) -> Option<&NodeKey> {
        self.nodes.get(node.0).map(|n| &n.key)
    }

    /// `subscribe(id, cb) -> unsubscribe`. Subscribing to an unknown node
    /// fails, per spec.md §4.7.
    pub fn subscribe(&mut self, node: NodeId, callback: NodeSubscriber) -> anyhow::Result<SubscriptionToken> {
        self.require(node)?;
        let key = self.nodes[node.0].subscribers.insert(callback);
        Ok(SubscriptionToken { node, key })
    }

    pub fn unsubscribe(&mut self, token: SubscriptionToken) {
        if let Some(n) = self.nodes.get_mut(token.node.0) {
            if n.subscribers.contains(token.key) {
                n.subscribers.remove(token.key);
            }
        }
    }

    /// `updateNode(id, mutator)`: run `mutator` then notify, all under one
    /// call so there is no window where edges are mutated but subscribers
    /// see a stale notification (or none at all).
    pub fn update_node<F>(&mut self, node: NodeId, mutator: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut NodeEdges),
    {
        self.require(node)?;
        let mut edges = NodeEdges {
            references: std::mem::take(&mut self.nodes[node.0].references),
            referenced_by: std::mem::take(&mut self.nodes[node.0].referenced_by),
        };
        mutator(&mut edges);
        self.nodes[node.0].references = edges.references;
        self.nodes[node.0].referenced_by = edges.referenced_by;
        self.notify_subscribers(node);
        Ok(())
    }

    /// `notifySubscribers(id)`. Callbacks that panic are caught and logged,
    /// isolating one misbehaving subscriber from the rest (spec.md §4.7,
    /// §7 "Subscriber callback errors").
    pub fn notify_subscribers(&self, node: NodeId) {
        let Some(n) = self.nodes.get(node.0) else {
            return;
        };
        for (_, callback) in n.subscribers.iter() {
            let callback = callback.clone();
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback())) {
                tracing::error!(?panic, node = ?n.key, "object graph subscriber callback panicked; isolating it");
            }
        }
    }

    fn require(&self, node: NodeId) -> anyhow::Result<()> {
        if !self.nodes.contains(node.0) {
            anyhow::bail!(ErrorMetadata::internal(format!(
                "Node id {node:?} does not exist in the object graph."
            )));
        }
        Ok(())
    }

    /// `removeNode`: unlink all edges and notify every affected node,
    /// mirroring an application-layer delete. Not invoked by the core
    /// protocol itself (spec.md §9 "Open questions" / "Cyclic object
    /// graph").
    pub fn remove_node(&mut self, node: NodeId) {
        let Some(removed) = self.nodes.get(node.0) else {
            return;
        };
        let relations: Vec<String> = removed.references.keys().cloned().collect();
        for relation in relations {
            let _ = self.remove_link(node, &relation);
        }
        let inbound: Vec<(String, NodeId)> = removed
            .referenced_by
            .iter()
            .flat_map(|(relation, sources)| sources.iter().map(move |s| (relation.clone(), *s)))
            .collect();
        for (relation, source) in inbound {
            let _ = self.remove_link(source, &relation);
        }
        self.notify_subscribers(node);
        if let Some(n) = self.nodes.try_remove(node.0) {
            self.index.remove(&n.key);
        }
    }
}

/// The mutable view of a node's edges exposed to [`ObjectGraph::update_node`].
pub struct NodeEdges {
    pub references: BTreeMap<String, NodeId>,
    pub referenced_by: BTreeMap<String, BTreeSet<NodeId>>,
}
