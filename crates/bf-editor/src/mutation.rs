//! Structural mutation engine: the authority's sole committer of tree edits.
//!
//! Requests are described by [`StructuralOp`] and applied through
//! [`StructuralEngine::apply`]. Each successful edit becomes one
//! [`TreeCommit`] (the re-render instruction for the frame) and one undo
//! step. Results are cached by request id, so a replayed request gets the
//! original answer without touching the tree again.

use crate::bridge::{CommittedOp, ParentOrder, TreeCommit};
use crate::commands::CommandStack;
use bf_core::config::EditorConfig;
use bf_core::error::{EditError, TreeError};
use bf_core::id::BlockId;
use bf_core::model::{BlockNode, BlockSpec, BlockTree};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Request ids remembered for replay detection.
const REPLAY_WINDOW: usize = 256;

/// A structural edit request.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralOp {
    Add {
        parent: BlockId,
        before: Option<BlockId>,
        block_type: String,
        /// Proposed id; generated from the type when absent.
        id: Option<BlockId>,
        data: Value,
    },
    Delete {
        block: BlockId,
    },
    Move {
        block: BlockId,
        parent: BlockId,
        before: Option<BlockId>,
    },
}

impl StructuralOp {
    pub fn describe(&self) -> String {
        match self {
            Self::Add { block_type, .. } => format!("add {block_type}"),
            Self::Delete { block } => format!("delete {block}"),
            Self::Move { block, .. } => format!("move {block}"),
        }
    }
}

/// What a structural request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Applied now.
    Committed(TreeCommit),
    /// Valid but changed nothing (e.g. a move to the current slot).
    Unchanged,
    /// A replay of a request already answered.
    Replayed(Result<Option<BlockId>, String>),
}

// ─── Empty-container policy ──────────────────────────────────────────────

/// Picks the type of the child inserted when a container loses its last
/// child: declared default, else the sole allowed type, else the
/// placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct EmptyContainerPolicy {
    pub placeholder_type: String,
}

impl EmptyContainerPolicy {
    pub fn new(placeholder_type: impl Into<String>) -> Self {
        Self {
            placeholder_type: placeholder_type.into(),
        }
    }

    pub fn substitute_type(&self, container: &BlockNode) -> String {
        if let Some(default) = &container.default_type {
            return default.clone();
        }
        if let [only] = container.allowed_types.as_slice() {
            return only.clone();
        }
        self.placeholder_type.clone()
    }

    pub fn is_placeholder(&self, node: &BlockNode) -> bool {
        node.block_type == self.placeholder_type
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────

pub struct StructuralEngine {
    tree: BlockTree,
    policy: EmptyContainerPolicy,
    history: CommandStack,
    revision: u64,
    /// Request id → answer (`Ok(created block)` or rejection reason).
    answered: HashMap<String, Result<Option<BlockId>, String>>,
    answered_order: VecDeque<String>,
}

impl StructuralEngine {
    pub fn new(tree: BlockTree, config: &EditorConfig) -> Self {
        Self {
            tree,
            policy: EmptyContainerPolicy::new(config.placeholder_type.clone()),
            history: CommandStack::new(config.undo_depth),
            revision: 0,
            answered: HashMap::new(),
            answered_order: VecDeque::new(),
        }
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn policy(&self) -> &EmptyContainerPolicy {
        &self.policy
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn history(&self) -> &CommandStack {
        &self.history
    }

    /// The whole tree as a `Replace` commit (initial render).
    pub fn replace_commit(&mut self) -> TreeCommit {
        self.revision += 1;
        TreeCommit {
            revision: self.revision,
            op: CommittedOp::Replace {
                blocks: self.tree.to_specs(),
            },
            orders: Vec::new(),
        }
    }

    /// The cached answer for a request id, if it was already handled.
    pub fn replayed(&self, request_id: &str) -> Option<Result<Option<BlockId>, String>> {
        self.answered.get(request_id).cloned()
    }

    fn remember(&mut self, request_id: &str, answer: Result<Option<BlockId>, String>) {
        if self.answered.insert(request_id.to_string(), answer).is_none() {
            self.answered_order.push_back(request_id.to_string());
        }
        while self.answered_order.len() > REPLAY_WINDOW {
            if let Some(old) = self.answered_order.pop_front() {
                self.answered.remove(&old);
            }
        }
    }

    /// Apply a structural request. `request_id` enables replay detection.
    /// A failed request leaves the tree untouched.
    pub fn apply(&mut self, request_id: Option<&str>, op: StructuralOp) -> Result<Outcome, EditError> {
        if let Some(rid) = request_id
            && let Some(answer) = self.replayed(rid)
        {
            log::debug!("request {rid} replayed; returning cached answer");
            return Ok(Outcome::Replayed(answer));
        }

        let description = op.describe();
        let before = self.tree.snapshot().map_err(EditError::Snapshot)?;
        let result = self.apply_op(op);

        if let Some(rid) = request_id {
            let answer = match &result {
                Ok(Some(commit)) => Ok(created_block(commit)),
                Ok(None) => Ok(None),
                Err(e) => Err(e.reason().to_string()),
            };
            self.remember(rid, answer);
        }

        match result? {
            Some(commit) => {
                let after = self.tree.snapshot().map_err(EditError::Snapshot)?;
                self.history.record(before, after, &description);
                Ok(Outcome::Committed(commit))
            }
            None => Ok(Outcome::Unchanged),
        }
    }

    fn apply_op(&mut self, op: StructuralOp) -> Result<Option<TreeCommit>, EditError> {
        match op {
            StructuralOp::Add {
                parent,
                before,
                block_type,
                id,
                data,
            } => {
                let container = self.tree.get(parent).ok_or(TreeError::UnknownBlock(parent))?;
                if !container.accepts(&block_type) {
                    log::warn!("rejected add: {block_type} is not allowed in {parent}");
                    return Err(EditError::SchemaViolation { parent, block_type });
                }
                let id = id.unwrap_or_else(|| BlockId::with_prefix(&block_type));
                let mut node = BlockNode::new(id, block_type);
                if data.is_object() {
                    node.data = data;
                }
                let spec = BlockSpec::leaf(node.clone());
                self.tree.insert(parent, before, node)?;
                Ok(Some(self.commit(CommittedOp::Add { parent, spec }, &[parent])))
            }

            StructuralOp::Delete { block } => {
                if block.is_root() {
                    return Err(TreeError::RootImmutable.into());
                }
                let parent = self
                    .tree
                    .parent_id(block)
                    .ok_or(TreeError::UnknownBlock(block))?;
                let substitute = self.substitute_for(parent, block);
                self.tree.remove(block)?;
                if let Some(spec) = &substitute {
                    self.tree.push(parent, spec.node.clone())?;
                }
                Ok(Some(self.commit(
                    CommittedOp::Delete {
                        block,
                        parent,
                        substitute,
                    },
                    &[parent],
                )))
            }

            StructuralOp::Move {
                block,
                parent,
                before,
            } => {
                let node = self.tree.get(block).ok_or(TreeError::UnknownBlock(block))?;
                let target = self.tree.get(parent).ok_or(TreeError::UnknownBlock(parent))?;
                if !target.accepts(&node.block_type) {
                    log::warn!("rejected move: {} is not allowed in {parent}", node.block_type);
                    return Err(EditError::SchemaViolation {
                        parent,
                        block_type: node.block_type.clone(),
                    });
                }
                let from = self
                    .tree
                    .parent_id(block)
                    .ok_or(TreeError::RootImmutable)?;
                if !self.tree.move_block(block, parent, before)? {
                    return Ok(None);
                }
                let touched = if from == parent {
                    vec![parent]
                } else {
                    vec![from, parent]
                };
                Ok(Some(self.commit(
                    CommittedOp::Move {
                        block,
                        from,
                        parent,
                    },
                    &touched,
                )))
            }
        }
    }

    /// The child to insert when deleting `block` empties container `parent`.
    fn substitute_for(&self, parent: BlockId, block: BlockId) -> Option<BlockSpec> {
        if parent.is_root() {
            return None;
        }
        let container = self.tree.get(parent)?;
        if !container.is_container() || self.tree.children(parent) != [block] {
            return None;
        }
        let block_type = self.policy.substitute_type(container);
        let id = BlockId::with_prefix(&block_type);
        log::debug!("container {parent} emptied; substituting {block_type} {id}");
        Some(BlockSpec::leaf(BlockNode::new(id, block_type)))
    }

    fn commit(&mut self, op: CommittedOp, touched: &[BlockId]) -> TreeCommit {
        self.revision += 1;
        TreeCommit {
            revision: self.revision,
            op,
            orders: touched
                .iter()
                .map(|&parent| ParentOrder {
                    parent,
                    children: self.tree.children(parent),
                })
                .collect(),
        }
    }

    /// Write a field value into a block's data. Returns whether it changed.
    pub fn update_field(&mut self, block: BlockId, field: &str, value: &str) -> Result<bool, EditError> {
        let node = self
            .tree
            .get_mut(block)
            .ok_or(EditError::StaleSelection(block))?;
        if node.field(field) == Some(value) {
            return Ok(false);
        }
        node.set_field(field, value);
        Ok(true)
    }

    /// Record a settled field batch as one undo step.
    pub fn record_field_batch(&mut self, before: Vec<u8>, description: &str) -> Result<(), EditError> {
        let after = self.tree.snapshot().map_err(EditError::Snapshot)?;
        if before != after {
            self.history.record(before, after, description);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, EditError> {
        self.tree.snapshot().map_err(EditError::Snapshot)
    }

    pub fn undo(&mut self) -> Result<Option<TreeCommit>, EditError> {
        match self.history.undo(&mut self.tree)? {
            Some(description) => {
                log::info!("undo: {description}");
                Ok(Some(self.replace_commit()))
            }
            None => Ok(None),
        }
    }

    pub fn redo(&mut self) -> Result<Option<TreeCommit>, EditError> {
        match self.history.redo(&mut self.tree)? {
            Some(description) => {
                log::info!("redo: {description}");
                Ok(Some(self.replace_commit()))
            }
            None => Ok(None),
        }
    }
}

pub(crate) fn created_block(commit: &TreeCommit) -> Option<BlockId> {
    match &commit.op {
        CommittedOp::Add { spec, .. } => Some(spec.node.id),
        _ => None,
    }
}
