//! Undo/Redo command stack.
//!
//! Every committed structural edit and every settled field batch is pushed
//! as a **snapshot command**: the MessagePack-encoded tree captured before
//! and after the edit. Undo/redo swap the whole tree in a single step, so
//! ids, order and field values come back exactly.

use bf_core::error::EditError;
use bf_core::model::BlockTree;

#[derive(Debug, Clone)]
pub struct Command {
    before: Vec<u8>,
    after: Vec<u8>,
    description: String,
}

impl Command {
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Bounded undo/redo stacks.
#[derive(Debug)]
pub struct CommandStack {
    undo_stack: Vec<Command>,
    redo_stack: Vec<Command>,
    /// Maximum undo depth.
    max_depth: usize,
}

impl CommandStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: Vec::with_capacity(max_depth.min(64)),
            redo_stack: Vec::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Push a step. Clears the redo stack and trims the oldest entry past
    /// `max_depth`.
    pub fn record(&mut self, before: Vec<u8>, after: Vec<u8>, description: &str) {
        self.undo_stack.push(Command {
            before,
            after,
            description: description.to_string(),
        });
        if self.undo_stack.len() > self.max_depth {
            self.undo_stack.remove(0);
        }
        self.redo_stack.clear();
    }

    /// Restore the tree to before the last step.
    pub fn undo(&mut self, tree: &mut BlockTree) -> Result<Option<String>, EditError> {
        let Some(cmd) = self.undo_stack.pop() else {
            return Ok(None);
        };
        match BlockTree::restore(&cmd.before) {
            Ok(restored) => {
                *tree = restored;
                let desc = cmd.description.clone();
                self.redo_stack.push(cmd);
                Ok(Some(desc))
            }
            Err(e) => {
                // Keep the entry so the stack stays consistent with the tree.
                self.undo_stack.push(cmd);
                Err(EditError::Snapshot(e))
            }
        }
    }

    /// Re-apply the last undone step.
    pub fn redo(&mut self, tree: &mut BlockTree) -> Result<Option<String>, EditError> {
        let Some(cmd) = self.redo_stack.pop() else {
            return Ok(None);
        };
        match BlockTree::restore(&cmd.after) {
            Ok(restored) => {
                *tree = restored;
                let desc = cmd.description.clone();
                self.undo_stack.push(cmd);
                Ok(Some(desc))
            }
            Err(e) => {
                self.redo_stack.push(cmd);
                Err(EditError::Snapshot(e))
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::id::BlockId;
    use bf_core::model::BlockNode;

    fn tree_with(ids: &[&str]) -> BlockTree {
        let mut tree = BlockTree::new();
        for id in ids {
            tree.push(BlockId::root(), BlockNode::new(BlockId::intern(id), "slate"))
                .unwrap();
        }
        tree
    }

    #[test]
    fn undo_redo_swaps_whole_tree() {
        let mut tree = tree_with(&["u_a", "u_b"]);
        let mut stack = CommandStack::new(100);

        let before = tree.snapshot().unwrap();
        tree.remove(BlockId::intern("u_a")).unwrap();
        stack.record(before, tree.snapshot().unwrap(), "delete a");

        assert_eq!(stack.undo(&mut tree).unwrap(), Some("delete a".to_string()));
        assert_eq!(
            tree.children(BlockId::root()),
            vec![BlockId::intern("u_a"), BlockId::intern("u_b")]
        );

        assert_eq!(stack.redo(&mut tree).unwrap(), Some("delete a".to_string()));
        assert_eq!(tree.children(BlockId::root()), vec![BlockId::intern("u_b")]);
    }

    #[test]
    fn redo_clears_on_new_action() {
        let mut tree = tree_with(&["u_c"]);
        let mut stack = CommandStack::new(100);
        let snap = tree.snapshot().unwrap();
        stack.record(snap.clone(), snap.clone(), "first");
        stack.undo(&mut tree).unwrap();
        assert!(stack.can_redo());

        stack.record(snap.clone(), snap, "second");
        assert!(!stack.can_redo());
    }

    #[test]
    fn max_depth_trims_oldest() {
        let mut tree = tree_with(&["u_d"]);
        let mut stack = CommandStack::new(3);
        let snap = tree.snapshot().unwrap();
        for i in 0..5 {
            stack.record(snap.clone(), snap.clone(), &format!("step {i}"));
        }
        let mut undo_count = 0;
        while stack.undo(&mut tree).unwrap().is_some() {
            undo_count += 1;
        }
        assert_eq!(undo_count, 3);
    }

    #[test]
    fn corrupt_snapshot_keeps_stack_intact() {
        let mut tree = tree_with(&["u_e"]);
        let mut stack = CommandStack::new(10);
        stack.record(vec![0xc1], tree.snapshot().unwrap(), "broken");
        assert!(matches!(stack.undo(&mut tree), Err(EditError::Snapshot(_))));
        assert!(stack.can_undo());
        assert_eq!(tree.children(BlockId::root()), vec![BlockId::intern("u_e")]);
    }
}
