//! Authoritative block tree.
//!
//! Blocks live in a `StableDiGraph` with parent→child edges. The graph only
//! answers "who is my parent"; sibling order is kept in an explicit
//! per-parent list (`child_order`), which is the sole source of render and
//! storage order. Every structural edit validates completely before it
//! touches either structure, so a failed edit leaves the tree unchanged.

use crate::error::TreeError;
use crate::id::BlockId;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashMap;

// ─── Block ───────────────────────────────────────────────────────────────

/// How a block owns children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Plain leaf block.
    #[default]
    None,
    /// Declares its child list structurally (`data-block-container`).
    Explicit,
    /// Inferred from nested block markup (e.g. a row wrapper).
    Implicit,
}

/// Where the add-button of a block points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddDirection {
    Right,
    Bottom,
}

impl AddDirection {
    /// Parse the `data-block-add` attribute value. Anything else is ignored.
    pub fn from_attr(value: &str) -> Option<Self> {
        match value.trim() {
            "right" => Some(Self::Right),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Right => "right",
            Self::Bottom => "bottom",
        }
    }
}

/// A single block: id, type tag, opaque data and container policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNode {
    pub id: BlockId,

    #[serde(rename = "type")]
    pub block_type: String,

    /// Opaque payload. Field values live under `data[fieldName]`.
    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub container: ContainerKind,

    /// Types accepted as children. Empty means "anything".
    #[serde(default)]
    pub allowed_types: SmallVec<[String; 4]>,

    #[serde(default)]
    pub default_type: Option<String>,
}

impl BlockNode {
    pub fn new(id: BlockId, block_type: impl Into<String>) -> Self {
        Self {
            id,
            block_type: block_type.into(),
            data: Value::Object(Default::default()),
            container: ContainerKind::None,
            allowed_types: SmallVec::new(),
            default_type: None,
        }
    }

    /// Builder: turn this block into a container.
    pub fn container(
        mut self,
        kind: ContainerKind,
        allowed: &[&str],
        default_type: Option<&str>,
    ) -> Self {
        self.container = kind;
        self.allowed_types = allowed.iter().map(|s| s.to_string()).collect();
        self.default_type = default_type.map(str::to_string);
        self
    }

    /// Builder: set a string field.
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn is_container(&self) -> bool {
        self.container != ContainerKind::None
    }

    /// Whether a child of `block_type` may be placed in this block.
    pub fn accepts(&self, block_type: &str) -> bool {
        self.allowed_types.is_empty() || self.allowed_types.iter().any(|t| t == block_type)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<String>) {
        if !self.data.is_object() {
            self.data = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(name.to_string(), Value::String(value.into()));
        }
    }
}

// ─── Tree ────────────────────────────────────────────────────────────────

/// The block tree: a rooted forest of `BlockNode` values.
#[derive(Debug, Clone)]
pub struct BlockTree {
    /// The underlying directed graph (parent → child).
    pub graph: StableDiGraph<BlockNode, ()>,

    /// The synthetic root index.
    pub root: NodeIndex,

    /// BlockId → NodeIndex for O(1) lookup.
    id_index: HashMap<BlockId, NodeIndex>,

    /// Ordered children per parent. Sole source of sibling order.
    child_order: HashMap<NodeIndex, Vec<NodeIndex>>,
}

impl BlockTree {
    /// Create an empty tree with just the root.
    #[must_use]
    pub fn new() -> Self {
        let mut graph = StableDiGraph::new();
        let root_id = BlockId::root();
        let root = graph.add_node(BlockNode::new(root_id, "root"));

        let mut id_index = HashMap::new();
        id_index.insert(root_id, root);

        Self {
            graph,
            root,
            id_index,
            child_order: HashMap::new(),
        }
    }

    /// Number of blocks, excluding the root.
    pub fn len(&self) -> usize {
        self.id_index.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.id_index.contains_key(&id)
    }

    pub fn index_of(&self, id: BlockId) -> Option<NodeIndex> {
        self.id_index.get(&id).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockNode> {
        self.index_of(id).map(|idx| &self.graph[idx])
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut BlockNode> {
        self.index_of(id).map(|idx| &mut self.graph[idx])
    }

    pub fn root_node_mut(&mut self) -> &mut BlockNode {
        &mut self.graph[self.root]
    }

    fn parent_index(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .next()
    }

    /// Parent block id (the root for top-level blocks, `None` for the root).
    pub fn parent_id(&self, id: BlockId) -> Option<BlockId> {
        let idx = self.index_of(id)?;
        self.parent_index(idx).map(|p| self.graph[p].id)
    }

    /// Ordered child ids of `id`.
    pub fn children(&self, id: BlockId) -> Vec<BlockId> {
        self.index_of(id)
            .and_then(|idx| self.child_order.get(&idx))
            .map(|order| order.iter().map(|&c| self.graph[c].id).collect())
            .unwrap_or_default()
    }

    /// Position of `id` within its parent's child list.
    pub fn position(&self, id: BlockId) -> Option<usize> {
        let idx = self.index_of(id)?;
        let parent = self.parent_index(idx)?;
        self.child_order.get(&parent)?.iter().position(|&c| c == idx)
    }

    /// The sibling right after `id`, if any.
    pub fn next_sibling(&self, id: BlockId) -> Option<BlockId> {
        let parent = self.parent_id(id)?;
        let position = self.position(id)?;
        self.children(parent).get(position + 1).copied()
    }

    /// Nesting depth: top-level blocks are depth 0.
    pub fn depth(&self, id: BlockId) -> Option<usize> {
        let mut idx = self.index_of(id)?;
        let mut depth = 0;
        while let Some(parent) = self.parent_index(idx) {
            if parent == self.root {
                return Some(depth);
            }
            depth += 1;
            idx = parent;
        }
        // Only the root itself has no parent.
        None
    }

    /// Check if `ancestor` is a parent/grandparent/etc. of `descendant`.
    pub fn is_ancestor_of(&self, ancestor: BlockId, descendant: BlockId) -> bool {
        if ancestor == descendant {
            return false;
        }
        let Some(mut idx) = self.index_of(descendant) else {
            return false;
        };
        while let Some(parent) = self.parent_index(idx) {
            if self.graph[parent].id == ancestor {
                return true;
            }
            idx = parent;
        }
        false
    }

    /// Pre-order list of `id` and all of its descendants.
    pub fn subtree(&self, id: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        if self.contains(id) {
            self.collect_subtree(id, &mut out);
        }
        out
    }

    fn collect_subtree(&self, id: BlockId, out: &mut Vec<BlockId>) {
        out.push(id);
        for child in self.children(id) {
            self.collect_subtree(child, out);
        }
    }

    /// Every block in document order (pre-order), excluding the root.
    pub fn iter_ids(&self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(self.len());
        for child in self.children(BlockId::root()) {
            self.collect_subtree(child, &mut out);
        }
        out
    }

    /// Resolve `before` into an insertion index within `parent`'s list.
    fn slot_for(
        &self,
        parent: NodeIndex,
        before: Option<BlockId>,
        skip: Option<NodeIndex>,
    ) -> Result<usize, TreeError> {
        let siblings: Vec<NodeIndex> = self
            .child_order
            .get(&parent)
            .map(|order| order.iter().copied().filter(|&c| Some(c) != skip).collect())
            .unwrap_or_default();
        match before {
            None => Ok(siblings.len()),
            Some(anchor) => {
                let anchor_idx = self.index_of(anchor);
                siblings
                    .iter()
                    .position(|&c| Some(c) == anchor_idx)
                    .ok_or(TreeError::BadAnchor {
                        anchor,
                        parent: self.graph[parent].id,
                    })
            }
        }
    }

    /// Insert `node` under `parent`, before `before` (or at the end).
    pub fn insert(
        &mut self,
        parent: BlockId,
        before: Option<BlockId>,
        node: BlockNode,
    ) -> Result<(), TreeError> {
        if self.contains(node.id) {
            return Err(TreeError::DuplicateId(node.id));
        }
        let parent_idx = self
            .index_of(parent)
            .ok_or(TreeError::UnknownBlock(parent))?;
        let slot = self.slot_for(parent_idx, before, None)?;

        let id = node.id;
        let idx = self.graph.add_node(node);
        self.graph.add_edge(parent_idx, idx, ());
        self.id_index.insert(id, idx);
        self.child_order.entry(parent_idx).or_default().insert(slot, idx);
        Ok(())
    }

    /// Append a child at the end of `parent`.
    pub fn push(&mut self, parent: BlockId, node: BlockNode) -> Result<(), TreeError> {
        self.insert(parent, None, node)
    }

    /// Remove a block and its whole subtree. Returns the removed nodes in
    /// pre-order.
    pub fn remove(&mut self, id: BlockId) -> Result<Vec<BlockNode>, TreeError> {
        if id.is_root() {
            return Err(TreeError::RootImmutable);
        }
        let idx = self.index_of(id).ok_or(TreeError::UnknownBlock(id))?;
        let ids = self.subtree(id);

        if let Some(parent) = self.parent_index(idx)
            && let Some(order) = self.child_order.get_mut(&parent)
        {
            order.retain(|&c| c != idx);
        }

        let mut removed = Vec::with_capacity(ids.len());
        for block in ids {
            if let Some(node_idx) = self.id_index.remove(&block) {
                self.child_order.remove(&node_idx);
                if let Some(node) = self.graph.remove_node(node_idx) {
                    removed.push(node);
                }
            }
        }
        Ok(removed)
    }

    /// Atomically move `id` under `new_parent`, before `before` (or at the
    /// end). Returns `Ok(false)` when the block already sits in that slot.
    pub fn move_block(
        &mut self,
        id: BlockId,
        new_parent: BlockId,
        before: Option<BlockId>,
    ) -> Result<bool, TreeError> {
        if id.is_root() {
            return Err(TreeError::RootImmutable);
        }
        let idx = self.index_of(id).ok_or(TreeError::UnknownBlock(id))?;
        let parent_idx = self
            .index_of(new_parent)
            .ok_or(TreeError::UnknownBlock(new_parent))?;
        if new_parent == id || self.is_ancestor_of(id, new_parent) {
            return Err(TreeError::Cycle {
                block: id,
                parent: new_parent,
            });
        }
        let old_parent = self.parent_index(idx).ok_or(TreeError::RootImmutable)?;
        if before == Some(id) {
            // "Before myself" is only meaningful as the slot I already occupy.
            return if old_parent == parent_idx {
                Ok(false)
            } else {
                Err(TreeError::BadAnchor {
                    anchor: id,
                    parent: new_parent,
                })
            };
        }
        let slot = self.slot_for(parent_idx, before, Some(idx))?;

        if old_parent == parent_idx
            && self
                .child_order
                .get(&parent_idx)
                .and_then(|order| order.iter().position(|&c| c == idx))
                == Some(slot)
        {
            return Ok(false);
        }

        // All validation done; detach and attach as one edit.
        if let Some(order) = self.child_order.get_mut(&old_parent) {
            order.retain(|&c| c != idx);
        }
        if let Some(edge) = self.graph.find_edge(old_parent, idx) {
            self.graph.remove_edge(edge);
        }
        self.graph.add_edge(parent_idx, idx, ());
        self.child_order.entry(parent_idx).or_default().insert(slot, idx);
        Ok(true)
    }

    /// Reorder the children of `parent` to follow `order`. Every listed id
    /// must already be a child; unlisted children keep their relative order
    /// after the listed ones.
    pub fn reorder(&mut self, parent: BlockId, order: &[BlockId]) -> Result<(), TreeError> {
        let parent_idx = self
            .index_of(parent)
            .ok_or(TreeError::UnknownBlock(parent))?;
        let current = self.child_order.get(&parent_idx).cloned().unwrap_or_default();
        let mut listed = Vec::with_capacity(order.len());
        for &child in order {
            let idx = self.index_of(child).ok_or(TreeError::UnknownBlock(child))?;
            if !current.contains(&idx) {
                return Err(TreeError::BadAnchor {
                    anchor: child,
                    parent,
                });
            }
            if !listed.contains(&idx) {
                listed.push(idx);
            }
        }
        let rest: Vec<NodeIndex> = current
            .into_iter()
            .filter(|idx| !listed.contains(idx))
            .collect();
        listed.extend(rest);
        self.child_order.insert(parent_idx, listed);
        Ok(())
    }

    /// Load a tree from nested specs (host JSON or test fixtures).
    pub fn from_specs(specs: Vec<BlockSpec>) -> Result<Self, TreeError> {
        let mut tree = Self::new();
        let root = BlockId::root();
        for spec in specs {
            tree.insert_spec(root, spec)?;
        }
        Ok(tree)
    }

    /// Append a nested spec under `parent`, children included.
    pub fn insert_spec(&mut self, parent: BlockId, spec: BlockSpec) -> Result<(), TreeError> {
        let BlockSpec { node, children } = spec;
        let id = node.id;
        self.push(parent, node)?;
        for child in children {
            self.insert_spec(id, child)?;
        }
        Ok(())
    }

    /// Nested view of the whole tree, the inverse of `from_specs`.
    pub fn to_specs(&self) -> Vec<BlockSpec> {
        self.children(BlockId::root())
            .into_iter()
            .filter_map(|id| self.spec_of(id))
            .collect()
    }

    /// Nested view of one block and its descendants.
    pub fn spec_of(&self, id: BlockId) -> Option<BlockSpec> {
        let node = self.get(id)?.clone();
        let children = self
            .children(id)
            .into_iter()
            .filter_map(|c| self.spec_of(c))
            .collect();
        Some(BlockSpec { node, children })
    }

    /// Encode the tree as a compact MessagePack snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, String> {
        let snap = TreeSnapshot {
            root: self.graph[self.root].clone(),
            blocks: self.to_specs(),
        };
        rmp_serde::to_vec_named(&snap).map_err(|e| format!("snapshot encode: {e}"))
    }

    /// Rebuild a tree from `snapshot()` output.
    pub fn restore(bytes: &[u8]) -> Result<Self, String> {
        let snap: TreeSnapshot =
            rmp_serde::from_slice(bytes).map_err(|e| format!("snapshot decode: {e}"))?;
        let mut tree = Self::from_specs(snap.blocks).map_err(|e| e.to_string())?;
        let root = tree.root;
        tree.graph[root] = snap.root;
        Ok(tree)
    }
}

impl Default for BlockTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Nested block description used for loading and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    #[serde(flatten)]
    pub node: BlockNode,
    #[serde(default)]
    pub children: Vec<BlockSpec>,
}

impl BlockSpec {
    pub fn leaf(node: BlockNode) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }

    pub fn with_children(node: BlockNode, children: Vec<BlockSpec>) -> Self {
        Self { node, children }
    }
}

#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    root: BlockNode,
    blocks: Vec<BlockSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> BlockId {
        BlockId::intern(s)
    }

    fn sample() -> BlockTree {
        let mut tree = BlockTree::new();
        let root = BlockId::root();
        tree.push(root, BlockNode::new(id("m_title"), "title")).unwrap();
        tree.push(
            root,
            BlockNode::new(id("m_cols"), "columns").container(
                ContainerKind::Explicit,
                &["column"],
                None,
            ),
        )
        .unwrap();
        tree.push(id("m_cols"), BlockNode::new(id("m_c1"), "column"))
            .unwrap();
        tree.push(id("m_cols"), BlockNode::new(id("m_c2"), "column"))
            .unwrap();
        tree
    }

    #[test]
    fn tree_basics() {
        let tree = sample();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children(id("m_cols")), vec![id("m_c1"), id("m_c2")]);
        assert_eq!(tree.parent_id(id("m_c2")), Some(id("m_cols")));
        assert_eq!(tree.depth(id("m_title")), Some(0));
        assert_eq!(tree.depth(id("m_c1")), Some(1));
        assert!(tree.is_ancestor_of(id("m_cols"), id("m_c1")));
        assert!(!tree.is_ancestor_of(id("m_c1"), id("m_cols")));
        assert_eq!(tree.next_sibling(id("m_c1")), Some(id("m_c2")));
        assert_eq!(tree.next_sibling(id("m_c2")), None);
        assert_eq!(tree.spec_of(id("m_cols")).map(|s| s.children.len()), Some(2));
    }

    #[test]
    fn insert_before_anchor() {
        let mut tree = sample();
        tree.insert(
            id("m_cols"),
            Some(id("m_c2")),
            BlockNode::new(id("m_c_mid"), "column"),
        )
        .unwrap();
        assert_eq!(
            tree.children(id("m_cols")),
            vec![id("m_c1"), id("m_c_mid"), id("m_c2")]
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = sample();
        let err = tree
            .push(BlockId::root(), BlockNode::new(id("m_c1"), "column"))
            .unwrap_err();
        assert_eq!(err, TreeError::DuplicateId(id("m_c1")));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn remove_takes_subtree() {
        let mut tree = sample();
        let removed = tree.remove(id("m_cols")).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(id("m_c1")));
        assert_eq!(tree.children(BlockId::root()), vec![id("m_title")]);
    }

    #[test]
    fn move_across_parents_is_atomic() {
        let mut tree = sample();
        let moved = tree
            .move_block(id("m_title"), id("m_cols"), Some(id("m_c2")))
            .unwrap();
        assert!(moved);
        assert_eq!(tree.len(), 4);
        assert_eq!(
            tree.children(id("m_cols")),
            vec![id("m_c1"), id("m_title"), id("m_c2")]
        );
        assert_eq!(tree.children(BlockId::root()), vec![id("m_cols")]);
        assert_eq!(tree.parent_id(id("m_title")), Some(id("m_cols")));
    }

    #[test]
    fn move_into_own_descendant_fails_cleanly() {
        let mut tree = sample();
        let err = tree
            .move_block(id("m_cols"), id("m_c1"), None)
            .unwrap_err();
        assert!(matches!(err, TreeError::Cycle { .. }));
        assert_eq!(tree.children(id("m_cols")), vec![id("m_c1"), id("m_c2")]);
    }

    #[test]
    fn move_to_current_slot_is_noop() {
        let mut tree = sample();
        assert!(!tree.move_block(id("m_c1"), id("m_cols"), Some(id("m_c2"))).unwrap());
        assert!(!tree.move_block(id("m_c2"), id("m_cols"), None).unwrap());
        assert!(tree.move_block(id("m_c1"), id("m_cols"), None).unwrap());
        assert_eq!(tree.children(id("m_cols")), vec![id("m_c2"), id("m_c1")]);
    }

    #[test]
    fn bad_anchor_leaves_tree_unchanged() {
        let mut tree = sample();
        let err = tree
            .move_block(id("m_c1"), BlockId::root(), Some(id("m_c2")))
            .unwrap_err();
        assert!(matches!(err, TreeError::BadAnchor { .. }));
        assert_eq!(tree.parent_id(id("m_c1")), Some(id("m_cols")));
    }

    #[test]
    fn reorder_follows_listed_ids() {
        let mut tree = sample();
        tree.push(id("m_cols"), BlockNode::new(id("m_c3"), "column"))
            .unwrap();
        tree.reorder(id("m_cols"), &[id("m_c3"), id("m_c1")]).unwrap();
        assert_eq!(
            tree.children(id("m_cols")),
            vec![id("m_c3"), id("m_c1"), id("m_c2")]
        );
        let err = tree.reorder(id("m_cols"), &[id("m_title")]).unwrap_err();
        assert!(matches!(err, TreeError::BadAnchor { .. }));
        assert_eq!(
            tree.children(id("m_cols")),
            vec![id("m_c3"), id("m_c1"), id("m_c2")]
        );
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut tree = sample();
        tree.get_mut(id("m_title"))
            .unwrap()
            .set_field("title", "Welcome");
        let bytes = tree.snapshot().unwrap();
        let restored = BlockTree::restore(&bytes).unwrap();
        assert_eq!(restored.iter_ids(), tree.iter_ids());
        assert_eq!(
            restored.get(id("m_title")).unwrap().field("title"),
            Some("Welcome")
        );
        assert_eq!(
            restored.get(id("m_cols")).unwrap().allowed_types.as_slice(),
            &["column".to_string()]
        );
    }

    #[test]
    fn specs_from_json() {
        let json = r#"[
            {"id": "j_a", "type": "slate", "data": {"value": "<strong>x</strong>"}},
            {"id": "j_grid", "type": "gridBlock", "container": "explicit",
             "allowedTypes": ["teaser"], "defaultType": "teaser",
             "children": [{"id": "j_t1", "type": "teaser"}]}
        ]"#;
        let specs: Vec<BlockSpec> = serde_json::from_str(json).unwrap();
        let tree = BlockTree::from_specs(specs).unwrap();
        assert_eq!(tree.len(), 3);
        let grid = tree.get(id("j_grid")).unwrap();
        assert_eq!(grid.default_type.as_deref(), Some("teaser"));
        assert!(grid.accepts("teaser"));
        assert!(!grid.accepts("slate"));
        assert_eq!(
            tree.get(id("j_a")).unwrap().field("value"),
            Some("<strong>x</strong>")
        );
    }
}
