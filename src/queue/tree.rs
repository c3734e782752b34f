use crate::error::{QueueError, QueueResult};
use crate::queue::cascade::CascadeSnapshot;
use crate::queue::path::PathTemplate;
use crate::queue::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Arena holding the canonical queue tree.
///
/// Every node lives in one map keyed by its id. Parent and child links are
/// ids, so a node's model data and its runtime entry can never drift apart.
/// The tree is cheap to clone, which lets compound control-plane operations
/// run against a draft and commit only on success.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueTree {
    nodes: HashMap<NodeId, QueueNode>,
    next_id: NodeId,
    /// Bumped by every structural or enable-state mutation
    version: u64,
    /// Per-sample enable flags saved when a sample is disabled
    #[serde(skip)]
    pub(crate) cascade_snapshots: HashMap<NodeId, CascadeSnapshot>,
}

impl Default for QueueTree {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueTree {
    /// Create a tree containing only the root
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, QueueNode::new(ROOT_ID, None, NodeKind::Root));

        Self {
            nodes,
            next_id: ROOT_ID + 1,
            version: 0,
            cascade_snapshots: HashMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> QueueResult<&QueueNode> {
        self.nodes.get(&id).ok_or(QueueError::NotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> QueueResult<&mut QueueNode> {
        self.nodes.get_mut(&id).ok_or(QueueError::NotFound(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &QueueNode> {
        self.nodes.values()
    }

    /// Attach a new node under `parent` with an enabled entry
    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind) -> QueueResult<NodeId> {
        self.add_child_with_entry(parent, kind, Entry::default())
    }

    /// Attach a new node under `parent` with the given entry flags
    pub fn add_child_with_entry(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        entry: Entry,
    ) -> QueueResult<NodeId> {
        let parent_kind = &self.get(parent)?.kind;
        Self::check_containment(parent_kind, &kind)?;

        let id = self.next_id;
        self.next_id += 1;

        let mut node = QueueNode::new(id, Some(parent), kind);
        node.entry = entry;

        debug!("Adding {} as node {} under {}", node.kind.describe(), id, parent);
        self.nodes.insert(id, node);
        self.get_mut(parent)?.children.push(id);
        self.touch();

        Ok(id)
    }

    fn check_containment(parent: &NodeKind, child: &NodeKind) -> QueueResult<()> {
        let allowed = matches!(
            (parent, child),
            (NodeKind::Root, NodeKind::Sample(_))
                | (NodeKind::Sample(_), NodeKind::TaskGroup(_))
                | (NodeKind::TaskGroup(_), NodeKind::Task(_))
        );

        if allowed {
            Ok(())
        } else {
            Err(QueueError::InvalidOperation(format!(
                "cannot place {} under {}",
                child.describe(),
                parent.describe()
            )))
        }
    }

    /// Remove a node and its whole subtree, returning the removed ids
    pub fn delete(&mut self, id: NodeId) -> QueueResult<Vec<NodeId>> {
        if id == ROOT_ID {
            return Err(QueueError::InvalidOperation(
                "the queue root cannot be deleted".to_string(),
            ));
        }

        let parent = self.get(id)?.parent;
        let mut removed = vec![id];
        removed.extend(self.descendants(id)?);

        if let Some(parent) = parent {
            self.get_mut(parent)?.children.retain(|child| *child != id);
        }

        for node_id in &removed {
            self.nodes.remove(node_id);
            self.cascade_snapshots.remove(node_id);
        }

        debug!("Deleted node {} with {} descendants", id, removed.len() - 1);
        self.touch();
        Ok(removed)
    }

    /// Remove everything but the root
    pub fn clear(&mut self) {
        self.nodes.retain(|id, _| *id == ROOT_ID);
        if let Some(root) = self.nodes.get_mut(&ROOT_ID) {
            root.children.clear();
            root.entry = Entry::default();
        }
        self.cascade_snapshots.clear();
        self.touch();
    }

    pub fn children(&self, id: NodeId) -> QueueResult<&[NodeId]> {
        Ok(&self.get(id)?.children)
    }

    pub fn parent(&self, id: NodeId) -> QueueResult<Option<NodeId>> {
        Ok(self.get(id)?.parent)
    }

    /// All descendants of a node in depth-first pre-order, the node excluded
    pub fn descendants(&self, id: NodeId) -> QueueResult<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.get(id)?.children.iter().rev().copied().collect();

        while let Some(current) = stack.pop() {
            result.push(current);
            stack.extend(self.get(current)?.children.iter().rev().copied());
        }

        Ok(result)
    }

    /// Move one child from `from` to `to`, shifting the siblings in between
    pub fn reindex(&mut self, parent: NodeId, from: usize, to: usize) -> QueueResult<()> {
        let children = &mut self.get_mut(parent)?.children;
        let len = children.len();

        for index in [from, to] {
            if index >= len {
                return Err(QueueError::InvalidIndex { index, len });
            }
        }

        let child = children.remove(from);
        children.insert(to, child);
        self.touch();
        Ok(())
    }

    /// Replace the child order of `parent` with a permutation of its children
    pub(crate) fn set_children_order(
        &mut self,
        parent: NodeId,
        order: Vec<NodeId>,
    ) -> QueueResult<()> {
        let current: HashSet<NodeId> = self.children(parent)?.iter().copied().collect();
        let proposed: HashSet<NodeId> = order.iter().copied().collect();

        if current != proposed || order.len() != current.len() {
            return Err(QueueError::InvalidOperation(format!(
                "new child order of node {} is not a permutation",
                parent
            )));
        }

        self.get_mut(parent)?.children = order;
        self.touch();
        Ok(())
    }

    pub fn entry(&self, id: NodeId) -> QueueResult<&Entry> {
        Ok(&self.get(id)?.entry)
    }

    /// Set a single enabled flag without cascading
    pub(crate) fn set_enabled_raw(&mut self, id: NodeId, enabled: bool) -> QueueResult<()> {
        let entry = &mut self.get_mut(id)?.entry;
        if entry.enabled != enabled {
            entry.enabled = enabled;
            self.touch();
        }
        Ok(())
    }

    pub fn set_executed(&mut self, id: NodeId, executed: bool) -> QueueResult<()> {
        self.get_mut(id)?.entry.executed = executed;
        Ok(())
    }

    pub fn set_status(&mut self, id: NodeId, status: EntryStatus) -> QueueResult<()> {
        self.get_mut(id)?.entry.status = status;
        Ok(())
    }

    pub fn progress_mut(&mut self, id: NodeId) -> QueueResult<&mut ProgressData> {
        Ok(&mut self.get_mut(id)?.progress)
    }

    /// Samples in queue order
    pub fn samples(&self) -> &[NodeId] {
        self.nodes
            .get(&ROOT_ID)
            .map(|root| root.children.as_slice())
            .unwrap_or(&[])
    }

    /// Find a sample node by its client-visible sample id
    pub fn find_sample(&self, sample_id: &str) -> Option<NodeId> {
        self.samples().iter().copied().find(|id| {
            self.nodes
                .get(id)
                .and_then(|node| node.kind.as_sample())
                .is_some_and(|sample| sample.sample_id == sample_id)
        })
    }

    pub fn sample_data(&self, id: NodeId) -> QueueResult<&SampleData> {
        self.get(id)?.kind.as_sample().ok_or_else(|| {
            QueueError::InvalidOperation(format!("node {} is not a sample", id))
        })
    }

    /// The sample a node belongs to, the node itself for samples
    pub fn sample_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);

        while let Some(node_id) = current {
            let node = self.nodes.get(&node_id)?;
            if node.kind.is_sample() {
                return Some(node_id);
            }
            current = node.parent;
        }

        None
    }

    /// Client-visible tasks of a sample in order.
    ///
    /// Ordinary groups contribute their children; an interleaved group is a
    /// single task. The position in this list is the client task index.
    pub fn sample_tasks(&self, sample: NodeId) -> QueueResult<Vec<NodeId>> {
        let mut tasks = Vec::new();

        for group_id in self.children(sample)? {
            let group = self.get(*group_id)?;
            if group.kind.is_interleaved() {
                tasks.push(*group_id);
            } else {
                tasks.extend(group.children.iter().copied());
            }
        }

        Ok(tasks)
    }

    /// Leaf tasks under a sample's groups, interleaved wedges included
    pub fn leaves_of(&self, sample: NodeId) -> QueueResult<Vec<NodeId>> {
        let mut leaves = Vec::new();
        for group_id in self.children(sample)? {
            leaves.extend(self.children(*group_id)?.iter().copied());
        }
        Ok(leaves)
    }

    /// Path templates of every task in the queue
    pub fn path_templates(&self) -> Vec<&PathTemplate> {
        self.nodes
            .values()
            .filter_map(|node| node.kind.as_task())
            .flat_map(|task| task.path_templates())
            .collect()
    }

    /// Check structural integrity, returning a description of each problem found
    pub fn validate_integrity(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut reachable = HashSet::new();
        let mut stack = vec![ROOT_ID];

        if !self.nodes.contains_key(&ROOT_ID) {
            issues.push("root node is missing".to_string());
            return issues;
        }

        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                issues.push(format!("node {} is reachable more than once", id));
                continue;
            }

            let Some(node) = self.nodes.get(&id) else {
                issues.push(format!("child {} does not exist", id));
                continue;
            };

            let mut seen = HashSet::new();
            for child_id in &node.children {
                if !seen.insert(*child_id) {
                    issues.push(format!("node {} lists child {} twice", id, child_id));
                    continue;
                }

                match self.nodes.get(child_id) {
                    Some(child) if child.parent != Some(id) => issues.push(format!(
                        "child {} of node {} points to parent {:?}",
                        child_id, id, child.parent
                    )),
                    _ => {}
                }
                stack.push(*child_id);
            }
        }

        for id in self.nodes.keys() {
            if !reachable.contains(id) {
                issues.push(format!("node {} is not reachable from the root", id));
            }
        }

        issues
    }
}
