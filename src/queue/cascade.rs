//! Enable-state propagation across the queue tree.
//!
//! Changing a node's enabled flag pushes the value down to every descendant
//! and then recomputes the containers above it one level at a time. A task
//! group is enabled iff at least one of its children is. Samples are never
//! switched off by their children, only switched back on.

use crate::error::QueueResult;
use crate::queue::tree::QueueTree;
use crate::queue::types::*;
use tracing::debug;

/// Descendant flags saved when a sample is disabled, valid only while the
/// tree version is unchanged
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeSnapshot {
    version: u64,
    flags: Vec<(NodeId, bool)>,
}

impl QueueTree {
    /// Set the enabled flag of a node and cascade it through the tree
    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> QueueResult<()> {
        let (is_root, is_sample) = {
            let kind = &self.get(id)?.kind;
            (matches!(kind, NodeKind::Root), kind.is_sample())
        };

        if is_root {
            for sample in self.samples().to_vec() {
                self.set_sample_enabled(sample, enabled)?;
            }
            return self.set_enabled_raw(ROOT_ID, enabled);
        }

        if is_sample {
            return self.set_sample_enabled(id, enabled);
        }

        self.set_enabled_raw(id, enabled)?;
        for descendant in self.descendants(id)? {
            self.set_enabled_raw(descendant, enabled)?;
        }
        self.recompute_ancestors(id)
    }

    /// Flip the enabled flag of a node, cascading like [`QueueTree::set_enabled`]
    pub fn toggle(&mut self, id: NodeId) -> QueueResult<bool> {
        let enabled = !self.entry(id)?.enabled;
        self.set_enabled(id, enabled)?;
        Ok(enabled)
    }

    fn set_sample_enabled(&mut self, sample: NodeId, enabled: bool) -> QueueResult<()> {
        let descendants = self.descendants(sample)?;

        if !enabled {
            // Only an enabled -> disabled change records flags to restore
            if !self.entry(sample)?.enabled {
                for id in &descendants {
                    self.set_enabled_raw(*id, false)?;
                }
                return Ok(());
            }

            let mut flags = Vec::with_capacity(descendants.len());
            for id in &descendants {
                flags.push((*id, self.entry(*id)?.enabled));
            }

            self.set_enabled_raw(sample, false)?;
            for id in &descendants {
                self.set_enabled_raw(*id, false)?;
            }

            debug!("Disabled sample {} and {} descendants", sample, descendants.len());
            let snapshot = CascadeSnapshot {
                version: self.version(),
                flags,
            };
            self.cascade_snapshots.insert(sample, snapshot);
            return Ok(());
        }

        let restore = self
            .cascade_snapshots
            .remove(&sample)
            .filter(|snapshot| snapshot.version == self.version());

        self.set_enabled_raw(sample, true)?;

        match restore {
            Some(snapshot) => {
                debug!("Restoring saved enable flags below sample {}", sample);
                for (id, flag) in snapshot.flags {
                    if self.contains(id) {
                        self.set_enabled_raw(id, flag)?;
                    }
                }
            }
            None => {
                for id in &descendants {
                    self.set_enabled_raw(*id, true)?;
                }
            }
        }

        Ok(())
    }

    /// Recompute the containers above `id`, stopping at its sample.
    ///
    /// Deterministic and idempotent: running it twice on an unchanged tree
    /// changes nothing the second time.
    pub fn recompute_ancestors(&mut self, id: NodeId) -> QueueResult<()> {
        let mut current = self.parent(id)?;

        while let Some(parent) = current {
            let node = self.get(parent)?;
            let is_group = node.kind.is_task_group();
            let is_sample = node.kind.is_sample();
            let parent_enabled = node.entry.enabled;

            let mut any_enabled = false;
            for child in &node.children {
                any_enabled |= self.entry(*child)?.enabled;
            }

            if is_group {
                self.set_enabled_raw(parent, any_enabled)?;
                current = self.parent(parent)?;
            } else {
                if is_sample && any_enabled && !parent_enabled {
                    self.cascade_snapshots.remove(&parent);
                    self.set_enabled_raw(parent, true)?;
                }
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> (QueueTree, NodeId, Vec<NodeId>) {
        let mut tree = QueueTree::new();
        let sample = tree
            .add_child(
                ROOT_ID,
                NodeKind::Sample(SampleData {
                    sample_id: "1:01".to_string(),
                    name: "x".to_string(),
                    location: SampleLocation::Manual,
                    code: String::new(),
                    protein_acronym: String::new(),
                    lims_id: None,
                }),
            )
            .unwrap();

        let mut leaves = Vec::new();
        for _ in 0..3 {
            let group = tree
                .add_child(sample, NodeKind::TaskGroup(TaskGroupData::default()))
                .unwrap();
            leaves.push(
                tree.add_child(
                    group,
                    NodeKind::Task(TaskPayload::DataCollection(DataCollectionData::default())),
                )
                .unwrap(),
            );
        }
        (tree, sample, leaves)
    }

    fn enabled(tree: &QueueTree, id: NodeId) -> bool {
        tree.entry(id).unwrap().enabled
    }

    #[test]
    fn test_disable_leaf_updates_group_not_sample() {
        let (mut tree, sample, leaves) = build();
        let group = tree.parent(leaves[0]).unwrap().unwrap();

        tree.set_enabled(leaves[0], false).unwrap();
        assert!(!enabled(&tree, group));
        assert!(enabled(&tree, sample));

        for leaf in &leaves {
            tree.set_enabled(*leaf, false).unwrap();
        }
        assert!(enabled(&tree, sample));
    }

    #[test]
    fn test_enabling_leaf_auto_enables_sample() {
        let (mut tree, sample, leaves) = build();
        tree.set_enabled(sample, false).unwrap();
        assert!(leaves.iter().all(|leaf| !enabled(&tree, *leaf)));

        tree.set_enabled(leaves[1], true).unwrap();
        assert!(enabled(&tree, sample));
        assert!(enabled(&tree, leaves[1]));
        assert!(!enabled(&tree, leaves[0]));
    }

    #[test]
    fn test_sample_reenable_restores_flags_when_untouched() {
        let (mut tree, sample, leaves) = build();
        tree.set_enabled(leaves[1], false).unwrap();

        tree.set_enabled(sample, false).unwrap();
        tree.set_enabled(sample, true).unwrap();

        assert!(enabled(&tree, leaves[0]));
        assert!(!enabled(&tree, leaves[1]));
        assert!(enabled(&tree, leaves[2]));
    }

    #[test]
    fn test_sample_reenable_after_mutation_enables_all() {
        let (mut tree, sample, leaves) = build();
        tree.set_enabled(leaves[1], false).unwrap();

        tree.set_enabled(sample, false).unwrap();
        tree.reindex(sample, 0, 2).unwrap();
        tree.set_enabled(sample, true).unwrap();

        assert!(leaves.iter().all(|leaf| enabled(&tree, *leaf)));
    }

    #[test]
    fn test_repeated_disable_keeps_first_snapshot() {
        let (mut tree, sample, leaves) = build();
        tree.set_enabled(sample, false).unwrap();
        tree.reindex(sample, 0, 1).unwrap();
        tree.set_enabled(sample, false).unwrap();

        tree.set_enabled(sample, true).unwrap();
        assert!(enabled(&tree, sample));
        assert!(leaves.iter().all(|leaf| enabled(&tree, *leaf)));
    }

    #[test]
    fn test_repeated_disable_on_untouched_tree_still_restores() {
        let (mut tree, sample, leaves) = build();
        tree.set_enabled(leaves[0], false).unwrap();
        tree.set_enabled(sample, false).unwrap();
        tree.set_enabled(sample, false).unwrap();

        tree.set_enabled(sample, true).unwrap();
        assert!(!enabled(&tree, leaves[0]));
        assert!(enabled(&tree, leaves[1]));
        assert!(enabled(&tree, leaves[2]));
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let (mut tree, _, leaves) = build();
        tree.set_enabled(leaves[2], false).unwrap();

        let version = tree.version();
        tree.recompute_ancestors(leaves[2]).unwrap();
        tree.recompute_ancestors(leaves[2]).unwrap();
        assert_eq!(tree.version(), version);
    }

    #[test]
    fn test_toggle_returns_new_state() {
        let (mut tree, _, leaves) = build();
        assert!(!tree.toggle(leaves[0]).unwrap());
        assert!(tree.toggle(leaves[0]).unwrap());
    }
}
