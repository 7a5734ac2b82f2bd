//! Drag reorder controller.
//!
//! Pointer-driven state machine: `Idle → Armed → Dragging ⇄ Autoscrolling`,
//! ending in a drop (one atomic move request) or a cancel (no mutation).
//! The controller is back in `Idle` as soon as a drag ends, so the next
//! pointer-down on a handle re-arms from scratch.

use crate::annotator::Topology;
use bf_core::config::EditorConfig;
use bf_core::dom::DomTree;
use bf_core::geometry::Viewport;
use bf_core::id::BlockId;
use bf_core::model::{AddDirection, BlockTree};
use kurbo::{Point, Rect};

/// Thickness of the drop indicator line.
const INDICATOR: f64 = 2.0;

/// Where a drop would land.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropTarget {
    /// Receiving parent (`root` for top level).
    pub parent: BlockId,
    /// Sibling to insert before; `None` appends.
    pub before: Option<BlockId>,
    /// Indicator line, in document coordinates.
    pub indicator: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DragState {
    #[default]
    Idle,
    Armed {
        source: BlockId,
        origin: Point,
    },
    Dragging {
        source: BlockId,
        target: Option<DropTarget>,
    },
    Autoscrolling {
        source: BlockId,
        target: Option<DropTarget>,
        /// Signed scroll delta per tick.
        velocity: f64,
    },
}

impl DragState {
    pub fn source(&self) -> Option<BlockId> {
        match self {
            DragState::Idle => None,
            DragState::Armed { source, .. }
            | DragState::Dragging { source, .. }
            | DragState::Autoscrolling { source, .. } => Some(*source),
        }
    }

    pub fn target(&self) -> Option<DropTarget> {
        match self {
            DragState::Dragging { target, .. } | DragState::Autoscrolling { target, .. } => *target,
            _ => None,
        }
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self, DragState::Dragging { .. } | DragState::Autoscrolling { .. })
    }
}

/// End of a pointer gesture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragOutcome {
    /// Nothing happened (no drag in progress, or a plain click).
    None,
    Dropped {
        block: BlockId,
        parent: BlockId,
        before: Option<BlockId>,
    },
    Cancelled,
}

/// Read-only view of the frame needed for target resolution.
pub struct DragContext<'a> {
    pub dom: &'a DomTree,
    pub topology: &'a Topology,
    /// Mirror of the authoritative tree, for types and allowed types.
    pub tree: &'a BlockTree,
    pub viewport: &'a Viewport,
}

#[derive(Debug, Clone)]
pub struct DragController {
    state: DragState,
    /// Last pointer position, viewport coordinates.
    pointer: Point,
    threshold: f64,
    band: f64,
    max_speed: f64,
}

impl DragController {
    pub fn new(config: &EditorConfig) -> Self {
        Self {
            state: DragState::Idle,
            pointer: Point::ZERO,
            threshold: config.drag_threshold_px,
            band: config.autoscroll_band_px,
            max_speed: config.autoscroll_max_speed,
        }
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != DragState::Idle
    }

    /// Pointer went down on the drag handle of `source`.
    pub fn arm(&mut self, source: BlockId, at: Point) {
        self.pointer = at;
        self.state = DragState::Armed { source, origin: at };
    }

    /// Track the pointer; returns the current drop target while dragging.
    pub fn pointer_move(&mut self, at: Point, cx: &DragContext<'_>) -> Option<DropTarget> {
        self.pointer = at;
        let source = match self.state {
            DragState::Idle => return None,
            DragState::Armed { source, origin } => {
                if (at - origin).hypot() < self.threshold {
                    return None;
                }
                log::debug!("drag started for {source}");
                source
            }
            DragState::Dragging { source, .. } | DragState::Autoscrolling { source, .. } => source,
        };
        let target = resolve_target(source, cx.viewport.to_document(at), cx);
        log::trace!("drag {source} over {target:?}");
        let velocity = self.autoscroll_velocity(at, cx.viewport);
        self.state = if velocity == 0.0 {
            DragState::Dragging { source, target }
        } else {
            DragState::Autoscrolling {
                source,
                target,
                velocity,
            }
        };
        target
    }

    /// `max * ((band - distance) / band)^2`, negative near the top edge.
    fn autoscroll_velocity(&self, at: Point, viewport: &Viewport) -> f64 {
        let speed = |distance: f64| {
            let d = distance.clamp(0.0, self.band);
            self.max_speed * ((self.band - d) / self.band).powi(2)
        };
        if at.y < self.band {
            -speed(at.y)
        } else if at.y > viewport.height - self.band {
            speed(viewport.height - at.y)
        } else {
            0.0
        }
    }

    /// Advance autoscroll by one tick, scrolling `viewport` and resolving
    /// the target again against the scrolled layout. Returns whether the
    /// viewport moved.
    pub fn tick(&mut self, viewport: &mut Viewport, dom: &DomTree, topology: &Topology, tree: &BlockTree) -> bool {
        let DragState::Autoscrolling {
            source, velocity, ..
        } = self.state
        else {
            return false;
        };
        let max_scroll = dom
            .rect(dom.root())
            .map(|body| (body.y1 - viewport.height).max(0.0))
            .unwrap_or(f64::INFINITY);
        let next = (viewport.scroll_y + velocity).clamp(0.0, max_scroll);
        if next == viewport.scroll_y {
            return false;
        }
        viewport.scroll_y = next;
        let cx = DragContext {
            dom,
            topology,
            tree,
            viewport: &*viewport,
        };
        let target = resolve_target(source, viewport.to_document(self.pointer), &cx);
        self.state = DragState::Autoscrolling {
            source,
            target,
            velocity,
        };
        true
    }

    /// Release the pointer.
    pub fn pointer_up(&mut self, at: Point, cx: &DragContext<'_>) -> DragOutcome {
        let state = std::mem::take(&mut self.state);
        let source = match state {
            DragState::Idle => return DragOutcome::None,
            DragState::Armed { .. } => return DragOutcome::None,
            DragState::Dragging { source, .. } | DragState::Autoscrolling { source, .. } => source,
        };
        if !cx.viewport.contains(at) {
            log::debug!("drop of {source} outside the viewport; cancelled");
            return DragOutcome::Cancelled;
        }
        match resolve_target(source, cx.viewport.to_document(at), cx) {
            Some(target) => DragOutcome::Dropped {
                block: source,
                parent: target.parent,
                before: target.before,
            },
            None => DragOutcome::Cancelled,
        }
    }

    /// Explicit cancel (Escape).
    pub fn cancel(&mut self) -> DragOutcome {
        match std::mem::take(&mut self.state) {
            DragState::Idle => DragOutcome::None,
            _ => DragOutcome::Cancelled,
        }
    }
}

/// Nearest valid drop slot for `source` at document point `p`.
pub fn resolve_target(source: BlockId, p: Point, cx: &DragContext<'_>) -> Option<DropTarget> {
    let source_type = cx.tree.get(source)?.block_type.as_str();
    let accepts = |container: BlockId| {
        cx.tree
            .get(container)
            .is_none_or(|node| node.accepts(source_type))
    };

    // Deepest accepting container under the pointer; top level otherwise.
    let container = cx
        .topology
        .order()
        .iter()
        .copied()
        .filter(|&id| id != source && !cx.topology.is_ancestor_of(source, id))
        .filter(|&id| cx.topology.get(id).is_some_and(|b| b.shape.is_container()))
        .filter(|&id| cx.topology.rect(cx.dom, id).is_some_and(|r| r.contains(p)))
        .filter(|&id| accepts(id))
        .max_by_key(|&id| cx.topology.get(id).map(|b| b.depth).unwrap_or(0));

    if container.is_none() && !accepts(BlockId::root()) {
        return None;
    }
    let siblings: Vec<(BlockId, Rect)> = cx
        .topology
        .children_of(container)
        .iter()
        .copied()
        .filter(|&id| id != source)
        .filter_map(|id| Some((id, cx.topology.rect(cx.dom, id)?)))
        .collect();
    let parent = container.unwrap_or_else(BlockId::root);

    let horizontal = measured_axis(&siblings).unwrap_or_else(|| {
        siblings
            .first()
            .and_then(|(id, _)| cx.topology.get(*id))
            .is_some_and(|b| b.direction == AddDirection::Right)
    });
    let along = |pt: Point| if horizontal { pt.x } else { pt.y };
    let mid = |r: &Rect| if horizontal { r.center().x } else { r.center().y };

    // Overshoot on either end clamps to the first/last boundary.
    let slot = siblings.iter().position(|(_, r)| along(p) < mid(r));
    let before = slot.map(|i| siblings[i].0);
    let indicator = match (slot, siblings.last()) {
        (Some(i), _) => edge(&siblings[i].1, horizontal, true),
        (None, Some((_, last))) => edge(last, horizontal, false),
        (None, None) => {
            let area = container
                .and_then(|c| cx.topology.rect(cx.dom, c))
                .unwrap_or_else(|| cx.viewport.visible_rect());
            edge(&area, horizontal, true)
        }
    };
    Some(DropTarget {
        parent,
        before,
        indicator,
    })
}

/// Whether siblings are laid out left to right, judged from how far their
/// centers travel along each axis. Needs two siblings.
fn measured_axis(siblings: &[(BlockId, Rect)]) -> Option<bool> {
    if siblings.len() < 2 {
        return None;
    }
    let (dx, dy) = siblings.windows(2).fold((0.0, 0.0), |(dx, dy), pair| {
        let step = pair[1].1.center() - pair[0].1.center();
        (dx + step.x.abs(), dy + step.y.abs())
    });
    Some(dx > dy)
}

/// Indicator line along the leading (or trailing) edge of `r`.
fn edge(r: &Rect, horizontal: bool, leading: bool) -> Rect {
    let half = INDICATOR / 2.0;
    match (horizontal, leading) {
        (false, true) => Rect::new(r.x0, r.y0 - half, r.x1, r.y0 + half),
        (false, false) => Rect::new(r.x0, r.y1 - half, r.x1, r.y1 + half),
        (true, true) => Rect::new(r.x0 - half, r.y0, r.x0 + half, r.y1),
        (true, false) => Rect::new(r.x1 - half, r.y0, r.x1 + half, r.y1),
    }
}
