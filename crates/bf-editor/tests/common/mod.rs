//! Shared harness for the end-to-end tests: an authority and a frame
//! joined by a `MemoryTransport` pair, plus a reference renderer that lays
//! the mirror out as stacked boxes the way a host page would.

#![allow(dead_code)]

use bf_core::config::{DirectionPolicy, EditorConfig};
use bf_core::dom::{DomNodeId, DomTree};
use bf_core::html::parse_html;
use bf_core::id::BlockId;
use bf_core::model::{AddDirection, BlockNode, BlockSpec, BlockTree, ContainerKind};
use bf_core::schema::{StaticSchema, attrs};
use bf_editor::inline::write_dom;
use bf_editor::{
    AuthorityEvent, AuthorityRuntime, FrameEvent, FrameRuntime, InputEvent, MemoryTransport,
    Modifiers, ShortcutAction,
};
use kurbo::{Point, Rect};

pub const WIDTH: f64 = 800.0;
const ROW: f64 = 40.0;
const HEADER: f64 = 20.0;

pub fn id(s: &str) -> BlockId {
    BlockId::intern(s)
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The page in `fixtures/page.json`:
///
/// ```text
/// title · intro · grid[cell_a, cell_b] · columns[col1, col2] · outro
/// ```
pub fn page() -> BlockTree {
    let specs: Vec<BlockSpec> = serde_json::from_str(include_str!("../fixtures/page.json")).unwrap();
    BlockTree::from_specs(specs).unwrap()
}

/// `count` top-level slates named `{prefix}0..`.
pub fn slates(prefix: &str, count: usize) -> BlockTree {
    let specs = (0..count)
        .map(|i| {
            let uid = format!("{prefix}{i}");
            BlockSpec::leaf(BlockNode::new(id(&uid), "slate").with_field("value", uid.as_str()))
        })
        .collect();
    BlockTree::from_specs(specs).unwrap()
}

pub fn cmd() -> Modifiers {
    Modifiers {
        meta: true,
        ..Modifiers::NONE
    }
}

// ─── Reference renderer ──────────────────────────────────────────────────

/// Render the tree: every block is a `div[data-block-uid]`, leaves are one
/// row high with their field in a padded paragraph, containers have a
/// header strip above their child list. Children flow down or right by the
/// same depth rule the annotator uses.
pub fn render(tree: &BlockTree) -> DomTree {
    let mut dom = DomTree::new();
    let body = dom.root();
    let policy = DirectionPolicy::default();
    let mut y = 0.0;
    for block in tree.children(BlockId::root()) {
        y += place(tree, &policy, &mut dom, body, block, 0, Point::new(0.0, y), WIDTH);
    }
    dom.set_rect(body, Rect::new(0.0, 0.0, WIDTH, y));
    dom
}

#[allow(clippy::too_many_arguments)]
fn place(
    tree: &BlockTree,
    policy: &DirectionPolicy,
    dom: &mut DomTree,
    parent: DomNodeId,
    block: BlockId,
    depth: usize,
    origin: Point,
    width: f64,
) -> f64 {
    let Some(node) = tree.get(block) else {
        return 0.0;
    };
    let element = dom.append_element(parent, "div", &[(attrs::BLOCK_UID, block.as_str())]).unwrap();
    let height = if node.is_container() {
        let list = match node.container {
            ContainerKind::Explicit => dom.append_element(element, "div", &[(attrs::CONTAINER, "")]),
            _ => dom.append_element(element, "div", &[]),
        }
        .unwrap();
        let children = tree.children(block);
        let horizontal = policy.direction_for_depth(depth + 1) == AddDirection::Right;
        let slot = width / children.len().max(1) as f64;
        let top = origin.y + HEADER;
        let mut extent: f64 = 0.0;
        for (i, child) in children.into_iter().enumerate() {
            let (at, w) = if horizontal {
                (Point::new(origin.x + i as f64 * slot, top), slot)
            } else {
                (Point::new(origin.x, top + extent), width)
            };
            let h = place(tree, policy, dom, list, child, depth + 1, at, w);
            extent = if horizontal { extent.max(h) } else { extent + h };
        }
        let extent = extent.max(ROW);
        dom.set_rect(list, Rect::new(origin.x, top, origin.x + width, top + extent));
        HEADER + extent
    } else {
        render_field(dom, element, node, origin, width);
        ROW
    };
    dom.set_rect(
        element,
        Rect::new(origin.x, origin.y, origin.x + width, origin.y + height),
    );
    height
}

fn render_field(dom: &mut DomTree, element: DomNodeId, node: &BlockNode, origin: Point, width: f64) {
    let Some((name, value)) = node
        .data
        .as_object()
        .and_then(|m| m.iter().find_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string()))))
    else {
        return;
    };
    let attr = match name.as_str() {
        "value" => attrs::EDIT_RICHTEXT,
        "href" => attrs::EDIT_LINK,
        "url" => attrs::EDIT_MEDIA,
        _ => attrs::EDIT_TEXT,
    };
    let p = dom.append_element(element, "p", &[(attr, name.as_str())]).unwrap();
    dom.set_rect(
        p,
        Rect::new(origin.x + 20.0, origin.y + 10.0, origin.x + width - 20.0, origin.y + 30.0),
    );
    if attr == attrs::EDIT_RICHTEXT {
        write_dom(dom, p, &parse_html(&value));
    } else {
        dom.append_text(p, &value);
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub authority: AuthorityRuntime<MemoryTransport>,
    pub frame: FrameRuntime<MemoryTransport>,
    pub now: u64,
    pub frame_events: Vec<FrameEvent>,
    pub authority_events: Vec<AuthorityEvent>,
}

impl Harness {
    /// Both runtimes over `tree`, with the initial tree published and
    /// rendered.
    pub fn new(tree: BlockTree) -> Self {
        init_logging();
        let (a, f) = MemoryTransport::pair();
        let config = EditorConfig::default();
        let mut authority = AuthorityRuntime::new(a, tree, config.clone());
        let frame = FrameRuntime::new(f, config, StaticSchema::new());
        authority.publish_tree();
        let mut harness = Self {
            authority,
            frame,
            now: 0,
            frame_events: Vec::new(),
            authority_events: Vec::new(),
        };
        harness.settle();
        harness
    }

    /// Pump both sides until nothing moves. Plays the host's part: a
    /// `Rerender` renders the mirror again, forwarded undo/redo go to the
    /// authority.
    pub fn settle(&mut self) {
        for _ in 0..64 {
            let mut busy = self.authority.pump(self.now) + self.frame.pump(self.now);
            for event in self.frame.take_events() {
                match &event {
                    FrameEvent::Rerender { .. } => {
                        let dom = render(self.frame.mirror());
                        self.frame.load_dom(dom);
                    }
                    FrameEvent::Forward {
                        action: ShortcutAction::Undo,
                    } => {
                        self.authority.undo().unwrap();
                    }
                    FrameEvent::Forward {
                        action: ShortcutAction::Redo,
                    } => {
                        self.authority.redo().unwrap();
                    }
                    _ => {}
                }
                self.frame_events.push(event);
                busy += 1;
            }
            self.authority_events.extend(self.authority.take_events());
            if busy == 0 {
                return;
            }
        }
        panic!("runtimes never settled");
    }

    /// Let `ms` pass on both sides, then settle.
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        self.frame.tick(self.now);
        self.authority.tick(self.now);
        self.settle();
    }

    pub fn input(&mut self, event: InputEvent) -> bool {
        let consumed = self.frame.handle_input(event, self.now);
        self.settle();
        consumed
    }

    pub fn key(&mut self, key: &str, modifiers: Modifiers) -> bool {
        self.input(InputEvent::key(key, modifiers))
    }

    pub fn type_text(&mut self, text: &str) -> bool {
        self.input(InputEvent::Text { text: text.into() })
    }

    pub fn select_text(&mut self, start: usize, end: usize) -> bool {
        self.input(InputEvent::SelectText { start, end })
    }

    /// Block rect in frame viewport coordinates.
    pub fn rect(&self, block: BlockId) -> Rect {
        let rect = self.frame.topology().rect(self.frame.dom(), block).unwrap();
        rect - self.frame.viewport().scroll()
    }

    pub fn field_rect(&self, block: BlockId, field: &str) -> Rect {
        let element = self
            .frame
            .topology()
            .get(block)
            .and_then(|b| b.field(field))
            .map(|f| f.element)
            .unwrap();
        self.frame.dom().rect(element).unwrap() - self.frame.viewport().scroll()
    }

    /// Click a block off its fields (top strip, clear of the drag handle).
    pub fn click_block(&mut self, block: BlockId) {
        let r = self.rect(block);
        self.click(Point::new(r.x0 + 30.0, r.y0 + 4.0));
    }

    pub fn click_field(&mut self, block: BlockId, field: &str) {
        let at = self.field_rect(block, field).center();
        self.click(at);
    }

    pub fn click(&mut self, at: Point) {
        self.frame.handle_input(InputEvent::pointer_down(at.x, at.y), self.now);
        self.frame
            .handle_input(InputEvent::PointerUp { x: at.x, y: at.y }, self.now);
        self.settle();
    }

    /// Select `block` and press on its drag handle.
    pub fn grab(&mut self, block: BlockId) {
        self.click_block(block);
        self.press_handle();
    }

    /// Press on the drag handle of whatever is selected.
    pub fn press_handle(&mut self) {
        let handle = self
            .frame
            .overlay()
            .drag_handle_rect(self.frame.dom())
            .unwrap();
        let at = handle.center() - self.frame.viewport().scroll();
        assert!(
            self.frame
                .handle_input(InputEvent::pointer_down(at.x, at.y), self.now),
            "drag handle did not take the press"
        );
    }

    pub fn pointer_move(&mut self, x: f64, y: f64) {
        self.frame.handle_input(InputEvent::PointerMove { x, y }, self.now);
    }

    pub fn pointer_up(&mut self, x: f64, y: f64) -> bool {
        let consumed = self.frame.handle_input(InputEvent::PointerUp { x, y }, self.now);
        self.settle();
        consumed
    }

    /// Value of the field being edited in the frame.
    pub fn session_value(&self) -> String {
        self.frame.session().map(|s| s.value()).unwrap_or_default()
    }

    pub fn stored(&self, block: BlockId, field: &str) -> String {
        self.authority
            .tree()
            .get(block)
            .and_then(|n| n.field(field))
            .unwrap_or_default()
            .to_string()
    }

    pub fn top_level(&self) -> Vec<BlockId> {
        self.authority.tree().children(BlockId::root())
    }

    /// Authority tree and frame mirror describe the same document.
    pub fn assert_converged(&self) {
        pretty_assertions::assert_eq!(
            self.authority.tree().to_specs(),
            self.frame.mirror().to_specs(),
            "mirror diverged from the authority"
        );
    }
}
