use crate::error::{QueueError, QueueResult};
use crate::queue::tree::QueueTree;
use crate::queue::types::*;
use std::collections::HashSet;
use tracing::{debug, info};

impl QueueTree {
    /// Exchange two children of `parent`
    pub fn swap(&mut self, parent: NodeId, i: usize, j: usize) -> QueueResult<()> {
        let children = &mut self.get_mut(parent)?.children;
        let len = children.len();

        for index in [i, j] {
            if index >= len {
                return Err(QueueError::InvalidIndex { index, len });
            }
        }

        children.swap(i, j);
        self.touch();
        debug!("Swapped children {} and {} of node {}", i, j, parent);
        Ok(())
    }

    /// Move the child at `from` to `to`
    pub fn move_child(&mut self, parent: NodeId, from: usize, to: usize) -> QueueResult<()> {
        self.reindex(parent, from, to)?;
        debug!("Moved child {} to {} under node {}", from, to, parent);
        Ok(())
    }

    /// Exchange two nodes, which must share a parent
    pub fn swap_nodes(&mut self, first: NodeId, second: NodeId) -> QueueResult<()> {
        let first_parent = self.parent(first)?;
        let second_parent = self.parent(second)?;

        let parent = match (first_parent, second_parent) {
            (Some(a), Some(b)) if a == b => a,
            _ => return Err(QueueError::CrossParentReorder { first, second }),
        };

        let children = self.children(parent)?;
        let position = |id: NodeId| {
            children
                .iter()
                .position(|child| *child == id)
                .ok_or(QueueError::NotFound(id))
        };
        let i = position(first)?;
        let j = position(second)?;

        self.swap(parent, i, j)
    }

    /// Reorder the samples to follow `order`.
    ///
    /// Unknown sample ids are ignored. Samples missing from `order` keep
    /// their relative order after the named ones.
    pub fn set_sample_order<S: AsRef<str>>(&mut self, order: &[S]) -> QueueResult<()> {
        let mut named = Vec::new();
        let mut seen = HashSet::new();

        for sample_id in order {
            if let Some(id) = self.find_sample(sample_id.as_ref())
                && seen.insert(id)
            {
                named.push(id);
            }
        }

        let rest: Vec<NodeId> = self
            .samples()
            .iter()
            .copied()
            .filter(|id| !seen.contains(id))
            .collect();
        named.extend(rest);

        if named.as_slice() == self.samples() {
            return Ok(());
        }

        self.set_children_order(ROOT_ID, named)
    }

    /// Fold existing sibling slots into a newly added interleaved group.
    ///
    /// `interleaved_index` is the group's slot under `sample`, and
    /// `absorbed` the slots of the tasks whose data became its wedges. The
    /// group is swapped into the lowest absorbed slot, then the remaining
    /// absorbed slots and the group's old slot are deleted from the highest
    /// index down. Returns the deleted node ids.
    pub fn merge_interleaved(
        &mut self,
        sample: NodeId,
        interleaved_index: usize,
        absorbed: &[usize],
    ) -> QueueResult<Vec<NodeId>> {
        let len = self.children(sample)?.len();

        if interleaved_index >= len {
            return Err(QueueError::InvalidIndex {
                index: interleaved_index,
                len,
            });
        }

        let mut sorted = absorbed.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        if sorted.len() != absorbed.len() {
            return Err(QueueError::InvalidOperation(
                "interleaved wedge list contains duplicates".to_string(),
            ));
        }

        for index in &sorted {
            if *index >= len {
                return Err(QueueError::InvalidIndex { index: *index, len });
            }
            if *index == interleaved_index {
                return Err(QueueError::InvalidOperation(
                    "an interleaved group cannot absorb itself".to_string(),
                ));
            }
        }

        let Some((&first, remaining)) = sorted.split_first() else {
            return Ok(Vec::new());
        };

        self.swap(sample, interleaved_index, first)?;

        let mut to_delete: Vec<usize> = remaining.to_vec();
        to_delete.push(interleaved_index);
        to_delete.sort_unstable();

        let mut deleted = Vec::new();
        for index in to_delete.into_iter().rev() {
            let id = self.children(sample)?[index];
            self.delete(id)?;
            deleted.push(id);
        }

        info!(
            "Merged {} tasks into interleaved group at slot {} of sample node {}",
            sorted.len(),
            first,
            sample
        );
        Ok(deleted)
    }
}
