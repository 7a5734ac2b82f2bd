//! Selection & toolbar controller (authority side).
//!
//! `Idle → Selected(block) → Editing(block, field) → Idle`. Selecting another
//! block goes straight from one selection to the next. Entering a selection
//! issues a geometry query; until it resolves (or if it never does) the
//! controller keeps the last known rect and stays responsive.

use crate::bridge::FieldRef;
use crate::mutation::EmptyContainerPolicy;
use bf_core::error::EditError;
use bf_core::geometry::FrameTransform;
use bf_core::id::BlockId;
use bf_core::model::{AddDirection, BlockTree};
use bf_core::richtext::MarkKind;
use bf_core::schema::FieldKind;
use kurbo::{Point, Rect};

/// Height of the block toolbar, in host pixels.
pub const TOOLBAR_HEIGHT: f64 = 32.0;
/// Gap between the block outline and the toolbar.
pub const TOOLBAR_GAP: f64 = 4.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusedField {
    pub block: BlockId,
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionState {
    #[default]
    Idle,
    Selected {
        block: BlockId,
    },
    Editing {
        block: BlockId,
        field: FocusedField,
    },
}

impl SelectionState {
    pub fn block(&self) -> Option<BlockId> {
        match self {
            Self::Idle => None,
            Self::Selected { block } | Self::Editing { block, .. } => Some(*block),
        }
    }

    pub fn field(&self) -> Option<&FocusedField> {
        match self {
            Self::Editing { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// An outstanding geometry query.
#[derive(Debug, Clone, PartialEq)]
struct GeometryQuery {
    block: BlockId,
    request_id: String,
    issued_at: u64,
}

/// Host-space placement of the selection chrome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolbarLayout {
    pub outline: Rect,
    pub add_button: Point,
    pub direction: AddDirection,
    /// Top-left of the toolbar.
    pub toolbar: Point,
    /// The toolbar was flipped below the block to stay in view.
    pub toolbar_below: bool,
}

#[derive(Debug, Default)]
pub struct SelectionController {
    state: SelectionState,
    /// The selected block is a placeholder; selecting it opens the type
    /// chooser instead of editing.
    chooser_open: bool,
    readonly: bool,
    direction: Option<AddDirection>,
    /// Frame-space rect of the selected block, last known.
    rect: Option<Rect>,
    query: Option<GeometryQuery>,
    transform: FrameTransform,
    /// Marks active at the frame's text selection.
    active_marks: Vec<MarkKind>,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn selected(&self) -> Option<BlockId> {
        self.state.block()
    }

    pub fn chooser_open(&self) -> bool {
        self.chooser_open
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn active_marks(&self) -> &[MarkKind] {
        &self.active_marks
    }

    pub fn transform(&self) -> FrameTransform {
        self.transform
    }

    pub fn rect(&self) -> Option<Rect> {
        self.rect
    }

    /// Select `block`. Unknown blocks (removed by a concurrent edit) fall
    /// back to `Idle`. Returns whether the selection changed.
    pub fn select(
        &mut self,
        block: BlockId,
        tree: &BlockTree,
        policy: &EmptyContainerPolicy,
    ) -> Result<bool, EditError> {
        if block.is_root() {
            return Ok(false);
        }
        let Some(node) = tree.get(block) else {
            self.deselect();
            return Err(EditError::StaleSelection(block));
        };
        if self.state.block() == Some(block) {
            return Ok(false);
        }
        self.state = SelectionState::Selected { block };
        self.chooser_open = policy.is_placeholder(node);
        self.readonly = false;
        self.direction = None;
        self.rect = None;
        self.query = None;
        self.active_marks.clear();
        Ok(true)
    }

    /// Extra facts reported by the frame with a click.
    pub fn describe(&mut self, rect: Option<Rect>, direction: Option<AddDirection>, readonly: bool) {
        if rect.is_some() {
            self.rect = rect;
        }
        self.direction = direction.or(self.direction);
        self.readonly = readonly;
    }

    pub fn deselect(&mut self) {
        self.state = SelectionState::Idle;
        self.chooser_open = false;
        self.readonly = false;
        self.direction = None;
        self.rect = None;
        self.query = None;
        self.active_marks.clear();
    }

    /// Focus a field of the selected block. Refused (returns `false`) for
    /// placeholders, readonly blocks and blocks that are not selected.
    pub fn focus_field(&mut self, block: BlockId, field: &FieldRef) -> bool {
        if self.state.block() != Some(block) || self.chooser_open || self.readonly {
            return false;
        }
        self.state = SelectionState::Editing {
            block,
            field: FocusedField {
                block,
                name: field.name.clone(),
                kind: field.kind,
            },
        };
        true
    }

    pub fn blur_field(&mut self) {
        if let SelectionState::Editing { block, .. } = self.state {
            self.state = SelectionState::Selected { block };
            self.active_marks.clear();
        }
    }

    pub fn set_active_marks(&mut self, marks: Vec<MarkKind>) {
        self.active_marks = marks;
    }

    /// Drop the selection if its block no longer exists.
    pub fn validate(&mut self, tree: &BlockTree) -> bool {
        match self.state.block() {
            Some(block) if !tree.contains(block) => {
                log::debug!("selected block {block} was removed; deselecting");
                self.deselect();
                false
            }
            _ => true,
        }
    }

    // ─── Geometry ────────────────────────────────────────────────────────

    /// Note that a geometry query for the selected block went out.
    pub fn geometry_requested(&mut self, block: BlockId, request_id: String, now_ms: u64) {
        if self.state.block() == Some(block) {
            self.query = Some(GeometryQuery {
                block,
                request_id,
                issued_at: now_ms,
            });
        }
    }

    pub fn geometry_pending(&self) -> bool {
        self.query.is_some()
    }

    /// Fresh geometry from the frame. Answers for blocks that are no
    /// longer selected are ignored.
    pub fn on_geometry(&mut self, block: BlockId, rect: Option<Rect>) -> bool {
        if self.state.block() != Some(block) {
            log::debug!("ignoring stale geometry for {block}");
            return false;
        }
        if self.query.as_ref().is_some_and(|q| q.block == block) {
            self.query = None;
        }
        match rect {
            Some(rect) => {
                self.rect = Some(rect);
                true
            }
            None => false,
        }
    }

    /// Give up on a geometry query that has been outstanding too long;
    /// the last known rect stays in use.
    pub fn tick(&mut self, now_ms: u64, timeout_ms: u64) -> Option<String> {
        let expired = self
            .query
            .as_ref()
            .is_some_and(|q| now_ms.saturating_sub(q.issued_at) >= timeout_ms);
        if !expired {
            return None;
        }
        let query = self.query.take()?;
        log::debug!(
            "geometry query {} for {} timed out; keeping last known position",
            query.request_id,
            query.block
        );
        Some(query.request_id)
    }

    pub fn set_transform(&mut self, transform: FrameTransform) {
        self.transform = transform;
    }

    /// Place outline, add-button and toolbar in host coordinates.
    /// `host_viewport` bounds the visible host area (toolbar flipping).
    pub fn layout(&self, host_viewport: Rect) -> Option<ToolbarLayout> {
        self.state.block()?;
        let outline = self.transform.to_host(self.rect?);
        let direction = self.direction.unwrap_or(AddDirection::Bottom);
        let add_button = match direction {
            AddDirection::Bottom => Point::new(outline.center().x, outline.y1),
            AddDirection::Right => Point::new(outline.x1, outline.center().y),
        };
        let above = outline.y0 - TOOLBAR_GAP - TOOLBAR_HEIGHT;
        let toolbar_below = above < host_viewport.y0;
        let toolbar = if toolbar_below {
            Point::new(outline.x0, outline.y1 + TOOLBAR_GAP)
        } else {
            Point::new(outline.x0, above)
        };
        Some(ToolbarLayout {
            outline,
            add_button,
            direction,
            toolbar,
            toolbar_below,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::model::BlockNode;

    fn id(s: &str) -> BlockId {
        BlockId::intern(s)
    }

    fn tree() -> BlockTree {
        let mut tree = BlockTree::new();
        tree.push(BlockId::root(), BlockNode::new(id("l_a"), "slate"))
            .unwrap();
        tree.push(BlockId::root(), BlockNode::new(id("l_b"), "teaser"))
            .unwrap();
        tree.push(BlockId::root(), BlockNode::new(id("l_e"), "empty"))
            .unwrap();
        tree
    }

    fn policy() -> EmptyContainerPolicy {
        EmptyContainerPolicy::new("empty")
    }

    fn rich(name: &str) -> FieldRef {
        FieldRef {
            name: name.into(),
            kind: FieldKind::RichText,
        }
    }

    #[test]
    fn block_to_block_without_idle() {
        let tree = tree();
        let mut sel = SelectionController::new();
        assert!(sel.select(id("l_a"), &tree, &policy()).unwrap());
        assert!(sel.focus_field(id("l_a"), &rich("value")));
        assert!(matches!(sel.state(), SelectionState::Editing { .. }));
        assert!(sel.select(id("l_b"), &tree, &policy()).unwrap());
        assert_eq!(sel.state(), &SelectionState::Selected { block: id("l_b") });
        sel.deselect();
        assert_eq!(sel.state(), &SelectionState::Idle);
    }

    #[test]
    fn focus_requires_matching_selection() {
        let tree = tree();
        let mut sel = SelectionController::new();
        sel.select(id("l_a"), &tree, &policy()).unwrap();
        assert!(!sel.focus_field(id("l_b"), &rich("value")));
        sel.describe(None, None, true);
        assert!(!sel.focus_field(id("l_a"), &rich("value")));
    }

    #[test]
    fn placeholder_opens_chooser() {
        let tree = tree();
        let mut sel = SelectionController::new();
        sel.select(id("l_e"), &tree, &policy()).unwrap();
        assert!(sel.chooser_open());
        assert!(!sel.focus_field(id("l_e"), &rich("value")));
    }

    #[test]
    fn stale_selection_goes_idle() {
        let mut tree = tree();
        let mut sel = SelectionController::new();
        sel.select(id("l_b"), &tree, &policy()).unwrap();
        tree.remove(id("l_b")).unwrap();
        assert!(!sel.validate(&tree));
        assert_eq!(sel.selected(), None);
        let err = sel.select(id("l_b"), &tree, &policy()).unwrap_err();
        assert!(matches!(err, EditError::StaleSelection(_)));
    }

    #[test]
    fn geometry_timeout_keeps_last_rect() {
        let tree = tree();
        let mut sel = SelectionController::new();
        sel.select(id("l_a"), &tree, &policy()).unwrap();
        sel.describe(Some(Rect::new(0.0, 100.0, 200.0, 140.0)), None, false);
        sel.geometry_requested(id("l_a"), "a-1".into(), 1000);
        assert_eq!(sel.tick(1500, 1000), None);
        assert_eq!(sel.tick(2000, 1000), Some("a-1".to_string()));
        assert!(!sel.geometry_pending());
        assert_eq!(sel.rect(), Some(Rect::new(0.0, 100.0, 200.0, 140.0)));

        // Selection keeps working after the timeout.
        assert!(sel.select(id("l_b"), &tree, &policy()).unwrap());
        assert!(!sel.on_geometry(id("l_a"), Some(Rect::ZERO)));
    }

    #[test]
    fn toolbar_flips_below_near_top() {
        let tree = tree();
        let mut sel = SelectionController::new();
        sel.select(id("l_a"), &tree, &policy()).unwrap();
        sel.set_transform(FrameTransform {
            offset_x: 10.0,
            offset_y: 20.0,
            ..FrameTransform::default()
        });
        sel.on_geometry(id("l_a"), Some(Rect::new(0.0, 0.0, 100.0, 40.0)));
        let viewport = Rect::new(0.0, 0.0, 1280.0, 800.0);
        let layout = sel.layout(viewport).unwrap();
        assert_eq!(layout.outline, Rect::new(10.0, 20.0, 110.0, 60.0));
        assert!(layout.toolbar_below);
        assert_eq!(layout.toolbar, Point::new(10.0, 64.0));
        assert_eq!(layout.add_button, Point::new(60.0, 60.0));

        sel.describe(
            Some(Rect::new(0.0, 200.0, 100.0, 240.0)),
            Some(AddDirection::Right),
            false,
        );
        let layout = sel.layout(viewport).unwrap();
        assert!(!layout.toolbar_below);
        assert_eq!(layout.toolbar.y, 220.0 - TOOLBAR_GAP - TOOLBAR_HEIGHT);
        assert_eq!(layout.add_button, Point::new(110.0, 240.0));
    }
}
