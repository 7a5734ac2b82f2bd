//! Frontend annotator: block topology from declarative markup, plus the
//! overlay layer.
//!
//! One depth-first pass over the frame DOM turns the `data-block-*` and
//! `data-edit-*` attributes into a [`Topology`]. Overlay chrome (outline,
//! add-button, drag handle, drop indicator) lives under its own root,
//! appended next to the content; content nodes are only ever read.

use bf_core::config::DirectionPolicy;
use bf_core::dom::{DomNodeId, DomTree};
use bf_core::id::BlockId;
use bf_core::model::{AddDirection, BlockTree};
use bf_core::schema::{FieldKind, SchemaResolver, attrs, resolve_field_kind};
use kurbo::{Point, Rect};
use std::collections::HashMap;

// ─── Topology ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    Leaf,
    /// Declares its child list with `data-block-container`.
    ExplicitContainer { list: DomNodeId },
    /// A non-block wrapper directly holds nested blocks.
    ImplicitContainer { wrapper: DomNodeId },
}

impl BlockShape {
    pub fn is_container(&self) -> bool {
        !matches!(self, BlockShape::Leaf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    pub name: String,
    pub kind: FieldKind,
    pub element: DomNodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedBlock {
    pub id: BlockId,
    pub element: DomNodeId,
    pub shape: BlockShape,
    /// Top-level blocks are depth 0.
    pub depth: usize,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    pub direction: AddDirection,
    pub fields: Vec<FieldBinding>,
    pub readonly: bool,
}

impl AnnotatedBlock {
    pub fn field(&self, name: &str) -> Option<&FieldBinding> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Resolved structure of the rendered document, rebuilt on every pass.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    blocks: HashMap<BlockId, AnnotatedBlock>,
    /// Document order.
    order: Vec<BlockId>,
    roots: Vec<BlockId>,
}

impl Topology {
    pub fn get(&self, id: BlockId) -> Option<&AnnotatedBlock> {
        self.blocks.get(&id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every block in document order.
    pub fn order(&self) -> &[BlockId] {
        &self.order
    }

    /// Top-level blocks.
    pub fn roots(&self) -> &[BlockId] {
        &self.roots
    }

    /// Child blocks of `parent` (`None` = top level), in document order.
    pub fn children_of(&self, parent: Option<BlockId>) -> &[BlockId] {
        match parent {
            None => &self.roots,
            Some(id) => self.get(id).map(|b| b.children.as_slice()).unwrap_or(&[]),
        }
    }

    pub fn rect(&self, dom: &DomTree, id: BlockId) -> Option<Rect> {
        dom.rect(self.get(id)?.element)
    }

    /// Whether `ancestor` strictly contains `id`.
    pub fn is_ancestor_of(&self, ancestor: BlockId, id: BlockId) -> bool {
        let mut cur = self.get(id).and_then(|b| b.parent);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.get(p).and_then(|b| b.parent);
        }
        false
    }

    /// Forget `id` and every block annotated beneath it.
    fn drop_subtree(&mut self, id: BlockId) {
        let stale: Vec<BlockId> = self
            .order
            .iter()
            .copied()
            .filter(|&b| b == id || self.is_ancestor_of(id, b))
            .collect();
        for block in &stale {
            self.blocks.remove(block);
        }
        self.order.retain(|b| !stale.contains(b));
        self.roots.retain(|b| !stale.contains(b));
        for block in self.blocks.values_mut() {
            block.children.retain(|b| !stale.contains(b));
        }
    }

    /// Block owning a DOM node (the closest block element around it).
    pub fn block_for_node(&self, dom: &DomTree, node: DomNodeId) -> Option<BlockId> {
        let element = dom.closest_with_attr(node, attrs::BLOCK_UID)?;
        let id = BlockId::intern(dom.attr(element, attrs::BLOCK_UID)?);
        self.get(id).filter(|b| b.element == element).map(|b| b.id)
    }

    /// Deepest block whose rect contains `point` (document coordinates).
    pub fn block_at(&self, dom: &DomTree, point: Point) -> Option<BlockId> {
        self.order
            .iter()
            .filter(|id| self.rect(dom, **id).is_some_and(|r| r.contains(point)))
            .max_by_key(|id| self.get(**id).map(|b| b.depth).unwrap_or(0))
            .copied()
    }

    /// Editable field of `block` under `point`, unless the block is readonly.
    pub fn field_at(&self, dom: &DomTree, block: BlockId, point: Point) -> Option<&FieldBinding> {
        let annotated = self.get(block)?;
        if annotated.readonly {
            return None;
        }
        annotated
            .fields
            .iter()
            .find(|f| dom.rect(f.element).is_some_and(|r| r.contains(point)))
    }
}

// ─── Annotation pass ─────────────────────────────────────────────────────

pub struct Annotator<'a> {
    policy: &'a DirectionPolicy,
    schema: &'a dyn SchemaResolver,
    /// Authoritative block types, for schema lookups.
    types: &'a BlockTree,
}

struct Walk {
    block: Option<BlockId>,
    depth: usize,
    readonly: bool,
}

impl<'a> Annotator<'a> {
    pub fn new(policy: &'a DirectionPolicy, schema: &'a dyn SchemaResolver, types: &'a BlockTree) -> Self {
        Self {
            policy,
            schema,
            types,
        }
    }

    pub fn annotate(&self, dom: &DomTree) -> Topology {
        let mut topo = Topology::default();
        let start = Walk {
            block: None,
            depth: 0,
            readonly: false,
        };
        for &child in dom.children(dom.root()) {
            self.visit(dom, child, &start, &mut topo);
        }
        topo
    }

    fn visit(&self, dom: &DomTree, node: DomNodeId, walk: &Walk, topo: &mut Topology) {
        if dom.tag(node).is_none() || dom.has_attr(node, attrs::OVERLAY) {
            return;
        }
        let readonly = walk.readonly || dom.has_attr(node, attrs::READONLY);

        if let Some(uid) = dom.attr(node, attrs::BLOCK_UID) {
            let id = BlockId::intern(uid);
            let depth = match walk.block {
                Some(_) => walk.depth + 1,
                None => 0,
            };
            if self.register(dom, node, id, walk.block, depth, readonly, topo) {
                let inner = Walk {
                    block: Some(id),
                    depth,
                    readonly,
                };
                for &child in dom.children(node) {
                    self.visit(dom, child, &inner, topo);
                }
                return;
            }
        }

        if let Some(owner) = walk.block {
            if dom.has_attr(node, attrs::CONTAINER) {
                self.mark_shape(topo, owner, BlockShape::ExplicitContainer { list: node });
            } else if directly_holds_blocks(dom, node) {
                self.mark_shape(topo, owner, BlockShape::ImplicitContainer { wrapper: node });
            }
            if !readonly {
                self.bind_fields(dom, node, owner, topo);
            }
        }
        for &child in dom.children(node) {
            self.visit(dom, child, walk, topo);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        dom: &DomTree,
        element: DomNodeId,
        id: BlockId,
        parent: Option<BlockId>,
        depth: usize,
        readonly: bool,
        topo: &mut Topology,
    ) -> bool {
        if topo.blocks.contains_key(&id) {
            if parent.is_some_and(|p| p == id || topo.is_ancestor_of(id, p)) {
                log::warn!("block id {id} repeated inside its own element; inner copy ignored");
                return false;
            }
            log::warn!("duplicate block id {id}; the later element wins");
            topo.drop_subtree(id);
        }

        let explicit = dom
            .attr(element, attrs::ADD_DIRECTION)
            .and_then(AddDirection::from_attr);
        let shape = if dom.has_attr(element, attrs::CONTAINER) {
            BlockShape::ExplicitContainer { list: element }
        } else if directly_holds_blocks(dom, element) {
            BlockShape::ImplicitContainer { wrapper: element }
        } else {
            BlockShape::Leaf
        };

        let mut annotated = AnnotatedBlock {
            id,
            element,
            shape,
            depth,
            parent,
            children: Vec::new(),
            direction: self.policy.resolve(explicit, depth),
            fields: Vec::new(),
            readonly,
        };
        if !readonly {
            annotated.fields = self.fields_on(dom, element, id);
        }

        topo.order.push(id);
        match parent {
            Some(p) => {
                if let Some(parent_block) = topo.blocks.get_mut(&p) {
                    parent_block.children.push(id);
                }
            }
            None => topo.roots.push(id),
        }
        topo.blocks.insert(id, annotated);
        true
    }

    /// Explicit declarations win over inferred ones.
    fn mark_shape(&self, topo: &mut Topology, owner: BlockId, shape: BlockShape) {
        let Some(block) = topo.blocks.get_mut(&owner) else {
            return;
        };
        let replace = match (block.shape, shape) {
            (BlockShape::ExplicitContainer { .. }, _) => false,
            (_, BlockShape::ExplicitContainer { .. }) => true,
            (BlockShape::Leaf, _) => true,
            _ => false,
        };
        if replace {
            block.shape = shape;
        }
    }

    fn fields_on(&self, dom: &DomTree, element: DomNodeId, block: BlockId) -> Vec<FieldBinding> {
        let block_type = self
            .types
            .get(block)
            .map(|n| n.block_type.as_str())
            .unwrap_or("");
        FieldKind::ATTRIBUTES
            .iter()
            .filter_map(|(attr, kind)| {
                let name = dom.attr(element, attr)?;
                Some(FieldBinding {
                    name: name.to_string(),
                    kind: resolve_field_kind(self.schema, block_type, name, *kind),
                    element,
                })
            })
            .collect()
    }

    fn bind_fields(&self, dom: &DomTree, node: DomNodeId, owner: BlockId, topo: &mut Topology) {
        let fields = self.fields_on(dom, node, owner);
        if let Some(block) = topo.blocks.get_mut(&owner) {
            for field in fields {
                if block.field(&field.name).is_none() {
                    block.fields.push(field);
                }
            }
        }
    }
}

fn directly_holds_blocks(dom: &DomTree, node: DomNodeId) -> bool {
    dom.children(node)
        .iter()
        .any(|&c| dom.has_attr(c, attrs::BLOCK_UID))
}

// ─── Overlay ─────────────────────────────────────────────────────────────

/// Overlay chrome nodes. All live under one root appended to `<body>`
/// after the content and carry `data-bf-overlay`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overlay {
    root: Option<DomNodeId>,
    outline: Option<DomNodeId>,
    add_button: Option<DomNodeId>,
    drag_handle: Option<DomNodeId>,
    drop_indicator: Option<DomNodeId>,
}

/// Size of the square add-button and drag handle.
pub const HANDLE_SIZE: f64 = 16.0;

impl Overlay {
    /// Create the overlay nodes if they are missing (first use, or the
    /// host replaced the document).
    pub fn ensure(&mut self, dom: &mut DomTree) {
        if self.root.is_some_and(|r| dom.is_attached(r)) {
            return;
        }
        let body = dom.root();
        let Some(root) = dom.append_element(body, "div", &[(attrs::OVERLAY, "root")]) else {
            return;
        };
        let part = |dom: &mut DomTree, name: &str| {
            dom.append_element(root, "div", &[(attrs::OVERLAY, name), ("hidden", "")])
        };
        *self = Self {
            root: Some(root),
            outline: part(dom, "outline"),
            add_button: part(dom, "add-button"),
            drag_handle: part(dom, "drag-handle"),
            drop_indicator: part(dom, "drop-indicator"),
        };
    }

    pub fn root(&self) -> Option<DomNodeId> {
        self.root
    }

    fn show(dom: &mut DomTree, node: Option<DomNodeId>, rect: Rect) {
        if let Some(node) = node {
            dom.set_rect(node, rect);
            dom.remove_attr(node, "hidden");
        }
    }

    fn hide(dom: &mut DomTree, node: Option<DomNodeId>) {
        if let Some(node) = node {
            dom.set_attr(node, "hidden", "");
        }
    }

    /// Outline the selected block and place its add-button and handle.
    pub fn show_selection(&mut self, dom: &mut DomTree, rect: Rect, direction: AddDirection) {
        self.ensure(dom);
        Self::show(dom, self.outline, rect);
        let button_center = match direction {
            AddDirection::Bottom => Point::new(rect.center().x, rect.y1),
            AddDirection::Right => Point::new(rect.x1, rect.center().y),
        };
        Self::show(
            dom,
            self.add_button,
            Rect::from_center_size(button_center, (HANDLE_SIZE, HANDLE_SIZE)),
        );
        if let Some(button) = self.add_button {
            dom.set_attr(button, "data-direction", direction.as_str());
        }
        Self::show(dom, self.drag_handle, Self::handle_rect(rect));
    }

    pub fn hide_selection(&mut self, dom: &mut DomTree) {
        Self::hide(dom, self.outline);
        Self::hide(dom, self.add_button);
        Self::hide(dom, self.drag_handle);
    }

    /// Drag handle sits inside the block's top-left corner.
    pub fn handle_rect(block: Rect) -> Rect {
        Rect::from_origin_size((block.x0, block.y0), (HANDLE_SIZE, HANDLE_SIZE))
    }

    pub fn show_drop_indicator(&mut self, dom: &mut DomTree, rect: Rect) {
        self.ensure(dom);
        Self::show(dom, self.drop_indicator, rect);
    }

    pub fn hide_drop_indicator(&mut self, dom: &mut DomTree) {
        Self::hide(dom, self.drop_indicator);
    }

    fn visible_rect(&self, dom: &DomTree, node: Option<DomNodeId>) -> Option<Rect> {
        let node = node?;
        if dom.has_attr(node, "hidden") || !dom.is_attached(node) {
            return None;
        }
        dom.rect(node)
    }

    pub fn outline_rect(&self, dom: &DomTree) -> Option<Rect> {
        self.visible_rect(dom, self.outline)
    }

    pub fn add_button_rect(&self, dom: &DomTree) -> Option<Rect> {
        self.visible_rect(dom, self.add_button)
    }

    pub fn drag_handle_rect(&self, dom: &DomTree) -> Option<Rect> {
        self.visible_rect(dom, self.drag_handle)
    }

    pub fn drop_indicator_rect(&self, dom: &DomTree) -> Option<Rect> {
        self.visible_rect(dom, self.drop_indicator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::schema::StaticSchema;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> BlockId {
        BlockId::intern(s)
    }

    fn annotate(dom: &DomTree) -> Topology {
        let policy = DirectionPolicy::default();
        let schema = StaticSchema::new();
        let types = BlockTree::new();
        Annotator::new(&policy, &schema, &types).annotate(dom)
    }

    /// `<div uid=page>` holding an explicit grid, an implicit row and a
    /// readonly listing.
    fn sample() -> DomTree {
        let mut dom = DomTree::new();
        let body = dom.root();
        let title = dom.append_element(body, "h1", &[("data-block-uid", "n_title")]).unwrap();
        dom.append_element(title, "span", &[("data-edit-text", "title")]);

        let grid = dom.append_element(body, "div", &[("data-block-uid", "n_grid")]).unwrap();
        let list = dom.append_element(grid, "div", &[("data-block-container", "blocks")]).unwrap();
        let cell = dom.append_element(list, "div", &[("data-block-uid", "n_cell")]).unwrap();
        dom.append_element(cell, "p", &[("data-edit-richtext", "value")]);

        let row = dom.append_element(body, "section", &[("data-block-uid", "n_row")]).unwrap();
        let wrapper = dom.append_element(row, "div", &[("class", "row")]).unwrap();
        dom.append_element(wrapper, "div", &[("data-block-uid", "n_left"), ("data-block-add", "bottom")]);
        dom.append_element(wrapper, "div", &[("data-block-uid", "n_right")]);

        let listing = dom
            .append_element(
                body,
                "div",
                &[("data-block-uid", "n_listing"), ("data-block-readonly", "")],
            )
            .unwrap();
        dom.append_element(listing, "a", &[("data-edit-link", "href")]);
        dom
    }

    #[test]
    fn shapes_and_depths() {
        let dom = sample();
        let topo = annotate(&dom);
        assert_eq!(topo.len(), 7);
        assert_eq!(
            topo.roots(),
            &[id("n_title"), id("n_grid"), id("n_row"), id("n_listing")]
        );
        let grid = topo.get(id("n_grid")).unwrap();
        assert!(matches!(grid.shape, BlockShape::ExplicitContainer { .. }));
        assert_eq!(grid.children, vec![id("n_cell")]);

        let row = topo.get(id("n_row")).unwrap();
        assert!(matches!(row.shape, BlockShape::ImplicitContainer { .. }));
        assert_eq!(row.children, vec![id("n_left"), id("n_right")]);

        assert_eq!(topo.get(id("n_cell")).unwrap().depth, 1);
        assert_eq!(topo.get(id("n_cell")).unwrap().parent, Some(id("n_grid")));
        assert_eq!(topo.get(id("n_title")).unwrap().shape, BlockShape::Leaf);
    }

    #[test]
    fn add_direction_priority() {
        let topo = annotate(&sample());
        // Depth 0 → bottom, depth 1 → right, explicit attribute wins.
        assert_eq!(topo.get(id("n_title")).unwrap().direction, AddDirection::Bottom);
        assert_eq!(topo.get(id("n_right")).unwrap().direction, AddDirection::Right);
        assert_eq!(topo.get(id("n_left")).unwrap().direction, AddDirection::Bottom);
    }

    #[test]
    fn fields_and_readonly() {
        let topo = annotate(&sample());
        let cell = topo.get(id("n_cell")).unwrap();
        assert_eq!(cell.fields.len(), 1);
        assert_eq!(cell.fields[0].kind, FieldKind::RichText);
        let title = topo.get(id("n_title")).unwrap();
        assert_eq!(title.field("title").unwrap().kind, FieldKind::Text);
        let listing = topo.get(id("n_listing")).unwrap();
        assert!(listing.readonly);
        assert!(listing.fields.is_empty());
    }

    #[test]
    fn schema_overrides_field_kind() {
        let dom = sample();
        let policy = DirectionPolicy::default();
        let schema = StaticSchema::new().with_field("heading", "title", FieldKind::RichText);
        let mut types = BlockTree::new();
        types
            .push(
                BlockId::root(),
                bf_core::model::BlockNode::new(id("n_title"), "heading"),
            )
            .unwrap();
        let topo = Annotator::new(&policy, &schema, &types).annotate(&dom);
        assert_eq!(
            topo.get(id("n_title")).unwrap().field("title").unwrap().kind,
            FieldKind::RichText
        );
    }

    #[test]
    fn duplicate_ids_last_wins() {
        let mut dom = DomTree::new();
        let body = dom.root();
        dom.append_element(body, "div", &[("data-block-uid", "n_dup")]);
        let second = dom.append_element(body, "div", &[("data-block-uid", "n_dup")]).unwrap();
        let topo = annotate(&dom);
        assert_eq!(topo.len(), 1);
        assert_eq!(topo.roots(), &[id("n_dup")]);
        assert_eq!(topo.get(id("n_dup")).unwrap().element, second);
    }

    #[test]
    fn duplicate_ids_drop_the_earlier_subtree() {
        let mut dom = DomTree::new();
        let body = dom.root();
        let first = dom.append_element(body, "div", &[("data-block-uid", "n_twin")]).unwrap();
        let list = dom.append_element(first, "div", &[("data-block-container", "")]).unwrap();
        dom.append_element(list, "div", &[("data-block-uid", "n_orphan")]);
        dom.append_element(body, "div", &[("data-block-uid", "n_mid")]);
        let second = dom.append_element(body, "div", &[("data-block-uid", "n_twin")]).unwrap();

        let topo = annotate(&dom);
        assert!(!topo.contains(id("n_orphan")));
        assert_eq!(topo.order(), &[id("n_mid"), id("n_twin")]);
        assert_eq!(topo.roots(), &[id("n_mid"), id("n_twin")]);
        let twin = topo.get(id("n_twin")).unwrap();
        assert_eq!(twin.element, second);
        assert!(twin.children.is_empty());
        assert_eq!(twin.shape, BlockShape::Leaf);
    }

    #[test]
    fn nested_repeat_of_an_id_is_ignored() {
        let mut dom = DomTree::new();
        let body = dom.root();
        let outer = dom.append_element(body, "div", &[("data-block-uid", "n_echo")]).unwrap();
        let inner = dom.append_element(outer, "div", &[("data-block-uid", "n_echo")]).unwrap();
        dom.append_element(inner, "p", &[("data-edit-text", "title")]);

        let topo = annotate(&dom);
        assert_eq!(topo.len(), 1);
        let echo = topo.get(id("n_echo")).unwrap();
        assert_eq!(echo.element, outer);
        assert_eq!(echo.parent, None);
        assert!(echo.field("title").is_some());
    }

    #[test]
    fn overlay_never_enters_content() {
        let mut dom = sample();
        let before = annotate(&dom);
        let mut overlay = Overlay::default();
        overlay.show_selection(
            &mut dom,
            Rect::new(0.0, 0.0, 100.0, 40.0),
            AddDirection::Bottom,
        );
        overlay.show_drop_indicator(&mut dom, Rect::new(0.0, 40.0, 100.0, 42.0));

        let root = overlay.root().unwrap();
        assert_eq!(dom.parent(root), Some(dom.root()));
        for block in before.order() {
            let element = before.get(*block).unwrap().element;
            assert!(!dom.is_descendant_of(element, root));
        }
        let after = annotate(&dom);
        assert_eq!(after.order(), before.order());
        assert_eq!(
            overlay.drag_handle_rect(&dom),
            Some(Rect::new(0.0, 0.0, HANDLE_SIZE, HANDLE_SIZE))
        );
        overlay.hide_drop_indicator(&mut dom);
        assert_eq!(overlay.drop_indicator_rect(&dom), None);
    }

    #[test]
    fn hit_testing_prefers_deepest_block() {
        let mut dom = sample();
        let grid = dom.find_by_attr("data-block-uid", "n_grid").unwrap();
        let cell = dom.find_by_attr("data-block-uid", "n_cell").unwrap();
        dom.set_rect(grid, Rect::new(0.0, 0.0, 400.0, 200.0));
        dom.set_rect(cell, Rect::new(10.0, 10.0, 390.0, 60.0));
        let topo = annotate(&dom);
        assert_eq!(topo.block_at(&dom, Point::new(20.0, 20.0)), Some(id("n_cell")));
        assert_eq!(topo.block_at(&dom, Point::new(20.0, 150.0)), Some(id("n_grid")));
        assert_eq!(topo.block_at(&dom, Point::new(900.0, 150.0)), None);
        assert!(topo.is_ancestor_of(id("n_grid"), id("n_cell")));
    }
}
