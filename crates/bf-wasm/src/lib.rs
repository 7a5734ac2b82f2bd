//! WASM bridge for BF: exposes the authority and frame runtimes to
//! JavaScript.
//!
//! Compiled via `wasm-pack build --target web`. The host page owns a
//! `BfAuthority`, the iframe document owns a `BfFrame`; JavaScript relays
//! the JSON envelopes each side queues in `take_outgoing` through
//! `postMessage`. Everything crosses the boundary as JSON strings.

mod console;

use bf_core::config::EditorConfig;
use bf_core::dom::{DomNodeId, DomSnapshot, DomTree};
use bf_core::geometry::{Bounds, FrameTransform, Viewport};
use bf_core::html::{parse_html, to_html};
use bf_core::id::BlockId;
use bf_core::model::{BlockSpec, BlockTree};
use bf_core::richtext::MarkKind;
use bf_core::schema::StaticSchema;
use bf_editor::{AuthorityRuntime, FrameRuntime, InputEvent, MemoryTransport, Modifiers, PendingMark};
use kurbo::Rect;
use serde::Serialize;
use serde_json::json;
use wasm_bindgen::prelude::*;

// ─── Authority (host page) ───────────────────────────────────────────────

/// Authoring side: owns the block tree, commits edits, drives the toolbar.
#[wasm_bindgen]
pub struct BfAuthority {
    runtime: AuthorityRuntime<MemoryTransport>,
    /// Shared handle on the runtime's transport, drained by the host.
    wire: MemoryTransport,
}

impl BfAuthority {
    /// Build from a JSON block list (`BlockSpec[]`) and an optional JSON
    /// config (`""` for defaults).
    pub fn from_json(blocks_json: &str, config_json: &str) -> Result<Self, String> {
        let specs: Vec<BlockSpec> =
            serde_json::from_str(blocks_json).map_err(|e| format!("invalid blocks: {e}"))?;
        let tree = BlockTree::from_specs(specs).map_err(|e| e.to_string())?;
        let config = parse_config(config_json)?;
        let wire = MemoryTransport::new();
        let runtime = AuthorityRuntime::new(wire.clone(), tree, config);
        Ok(Self { runtime, wire })
    }
}

#[wasm_bindgen]
impl BfAuthority {
    #[wasm_bindgen(constructor)]
    pub fn new(blocks_json: &str, config_json: &str) -> Result<BfAuthority, JsValue> {
        console::init();
        Self::from_json(blocks_json, config_json).map_err(js_error)
    }

    /// Queue the whole tree for the frame. Call once the frame has loaded,
    /// and again after every reload.
    pub fn publish(&mut self) {
        self.runtime.publish_tree();
    }

    /// Handle one envelope posted by the frame.
    pub fn receive(&mut self, raw: &str, now_ms: f64) {
        self.runtime.handle_message(raw, millis(now_ms));
    }

    /// Envelopes for the frame, as a JSON array of envelope strings.
    pub fn take_outgoing(&mut self) -> String {
        drain(&self.wire)
    }

    /// Authority events since the last call, as a JSON array.
    pub fn take_events(&mut self) -> String {
        to_json(&self.runtime.take_events())
    }

    /// The committed tree as a `BlockSpec[]` JSON array.
    pub fn tree_json(&self) -> String {
        to_json(&self.runtime.tree().to_specs())
    }

    pub fn selected(&self) -> Option<String> {
        self.runtime.selection().selected().map(|b| b.as_str().to_string())
    }

    pub fn select_block(&mut self, block: &str, now_ms: f64) -> bool {
        let result = self.runtime.select_block(BlockId::intern(block), millis(now_ms));
        report(result, "select").unwrap_or(false)
    }

    pub fn deselect(&mut self) {
        self.runtime.deselect();
    }

    /// Add a block of `block_type` under `parent` (`""` for the top level)
    /// before `before` (`""` appends). Returns `{"ok":true,"block":id}` or
    /// `{"ok":false,"error":"..."}`.
    pub fn add_block(&mut self, parent: &str, before: &str, block_type: &str) -> String {
        match self
            .runtime
            .add_block(parent_id(parent), optional_id(before), block_type)
        {
            Ok(block) => json!({ "ok": true, "block": block.map(|b| b.as_str().to_string()) }).to_string(),
            Err(e) => error_json(&e.to_string()),
        }
    }

    pub fn delete_block(&mut self, block: &str) -> bool {
        report(self.runtime.delete_block(BlockId::intern(block)), "delete").unwrap_or(false)
    }

    pub fn move_block(&mut self, block: &str, parent: &str, before: &str) -> bool {
        let result = self
            .runtime
            .move_block(BlockId::intern(block), parent_id(parent), optional_id(before));
        report(result, "move").unwrap_or(false)
    }

    /// Field edit from a sidebar form.
    pub fn set_field(&mut self, block: &str, field: &str, value: &str) -> bool {
        let result = self.runtime.set_field(BlockId::intern(block), field, value);
        report(result, "set_field").unwrap_or(false)
    }

    /// Toolbar button: `mark` is `bold`, `italic` or `link`.
    pub fn format(&mut self, mark: &str, href: Option<String>) -> bool {
        match serde_json::from_value::<MarkKind>(serde_json::Value::String(mark.to_string())) {
            Ok(kind) => self.runtime.format(kind, href),
            Err(_) => {
                log::warn!("unknown mark {mark:?}");
                false
            }
        }
    }

    pub fn undo(&mut self) -> bool {
        report(self.runtime.undo(), "undo").unwrap_or(false)
    }

    pub fn redo(&mut self) -> bool {
        report(self.runtime.redo(), "redo").unwrap_or(false)
    }

    /// Shortcut pressed while the host has focus. Returns
    /// `{"action":"undo"}`, or `{"action":null}` when nothing happened.
    pub fn handle_key(&mut self, key: &str, ctrl: bool, shift: bool, alt: bool, meta: bool) -> String {
        let modifiers = Modifiers { ctrl, shift, alt, meta };
        let action = self.runtime.handle_key(key, modifiers);
        json!({ "action": action }).to_string()
    }

    /// The frame moved or resized in the host layout. `viewport_json` may
    /// be empty when only the transform changed.
    pub fn viewport_changed(&mut self, transform_json: &str, viewport_json: &str, now_ms: f64) -> bool {
        let transform: FrameTransform = match serde_json::from_str(transform_json) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("invalid transform: {e}");
                return false;
            }
        };
        let viewport = if viewport_json.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<Viewport>(viewport_json) {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!("invalid viewport: {e}");
                    return false;
                }
            }
        };
        self.runtime.viewport_changed(transform, viewport, millis(now_ms));
        true
    }

    /// Visible area of the host page, used to keep the toolbar on screen.
    pub fn set_host_viewport(&mut self, x: f64, y: f64, width: f64, height: f64) {
        self.runtime
            .set_host_viewport(Rect::new(x, y, x + width, y + height));
    }

    /// Toolbar placement in host coordinates, or `null` with nothing
    /// selected.
    pub fn toolbar(&self) -> String {
        let Some(layout) = self.runtime.toolbar() else {
            return "null".to_string();
        };
        json!({
            "outline": Bounds::from(layout.outline),
            "addButton": { "x": layout.add_button.x, "y": layout.add_button.y },
            "direction": layout.direction,
            "toolbar": { "x": layout.toolbar.x, "y": layout.toolbar.y },
            "toolbarBelow": layout.toolbar_below,
        })
        .to_string()
    }

    pub fn tick(&mut self, now_ms: f64) {
        self.runtime.tick(millis(now_ms));
    }
}

// ─── Frame (iframe document) ─────────────────────────────────────────────

/// Rendered side: annotates the document, handles pointer and keyboard
/// input, and proposes edits to the authority.
#[wasm_bindgen]
pub struct BfFrame {
    runtime: FrameRuntime<MemoryTransport>,
    wire: MemoryTransport,
}

impl BfFrame {
    /// Build from an optional JSON config and a JSON field schema
    /// (`{"slate":{"value":"richtext"}}`); either may be `""`.
    pub fn from_json(config_json: &str, schema_json: &str) -> Result<Self, String> {
        let config = parse_config(config_json)?;
        let schema = if schema_json.trim().is_empty() {
            StaticSchema::new()
        } else {
            serde_json::from_str(schema_json).map_err(|e| format!("invalid schema: {e}"))?
        };
        let wire = MemoryTransport::new();
        let runtime = FrameRuntime::new(wire.clone(), config, schema);
        Ok(Self { runtime, wire })
    }
}

#[wasm_bindgen]
impl BfFrame {
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str, schema_json: &str) -> Result<BfFrame, JsValue> {
        console::init();
        Self::from_json(config_json, schema_json).map_err(js_error)
    }

    /// Handle one envelope posted by the authority.
    pub fn receive(&mut self, raw: &str, now_ms: f64) {
        self.runtime.handle_message(raw, millis(now_ms));
    }

    pub fn take_outgoing(&mut self) -> String {
        drain(&self.wire)
    }

    /// Frame events since the last call, as a JSON array. A `rerender`
    /// event asks the host to render `mirror_json` and call `load_dom`.
    pub fn take_events(&mut self) -> String {
        to_json(&self.runtime.take_events())
    }

    /// Replace the frame document with a `DomSnapshot` JSON tree.
    pub fn load_dom(&mut self, snapshot_json: &str) -> bool {
        match serde_json::from_str::<DomSnapshot>(snapshot_json) {
            Ok(snapshot) => {
                self.runtime.load_dom(DomTree::from_snapshot(&snapshot));
                true
            }
            Err(e) => {
                log::warn!("invalid DOM snapshot: {e}");
                false
            }
        }
    }

    /// Feed one input event (`{"type":"pointerDown","x":..,"y":..}` and so
    /// on). Returns whether the editor consumed it.
    pub fn handle_input(&mut self, event_json: &str, now_ms: f64) -> bool {
        match serde_json::from_str::<InputEvent>(event_json) {
            Ok(event) => self.runtime.handle_input(event, millis(now_ms)),
            Err(e) => {
                log::warn!("invalid input event: {e}");
                false
            }
        }
    }

    /// The browser edited the focused field natively.
    pub fn field_edited(&mut self, html: &str, caret: usize, now_ms: f64) -> bool {
        self.runtime.field_edited(html, caret, millis(now_ms))
    }

    pub fn update_link(&mut self, href: &str) {
        self.runtime.update_link(href);
    }

    pub fn commit_link(&mut self, now_ms: f64) -> bool {
        self.runtime.commit_link(millis(now_ms))
    }

    pub fn cancel_link(&mut self) -> bool {
        self.runtime.cancel_link()
    }

    pub fn add_after(&mut self, block: &str, now_ms: f64) -> bool {
        self.runtime.add_after(BlockId::intern(block), millis(now_ms))
    }

    pub fn delete_selected(&mut self, now_ms: f64) -> bool {
        self.runtime.delete_selected(millis(now_ms))
    }

    pub fn move_block(&mut self, block: &str, parent: &str, before: &str, now_ms: f64) -> bool {
        self.runtime.move_block(
            BlockId::intern(block),
            parent_id(parent),
            optional_id(before),
            millis(now_ms),
        )
    }

    /// Whether a click on DOM node `node` must not follow its link.
    pub fn suppress_navigation(&self, node: usize) -> bool {
        self.runtime.suppress_navigation(DomNodeId(node))
    }

    pub fn selected(&self) -> Option<String> {
        self.runtime.selected().map(|b| b.as_str().to_string())
    }

    /// The frame's copy of the tree as a `BlockSpec[]` JSON array.
    pub fn mirror_json(&self) -> String {
        to_json(&self.runtime.mirror().to_specs())
    }

    /// The field being edited, or `null`.
    pub fn editing_json(&self) -> String {
        let Some(session) = self.runtime.session() else {
            return "null".to_string();
        };
        let selection = session.selection();
        json!({
            "block": session.block().as_str(),
            "field": session.field(),
            "value": session.value(),
            "start": selection.start,
            "end": selection.end,
            "dirty": session.is_dirty(),
            "armed": matches!(session.pending(), PendingMark::Armed { .. }),
        })
        .to_string()
    }

    /// Overlay rects in frame document coordinates; absent parts are
    /// `null`.
    pub fn overlay_json(&self) -> String {
        let dom = self.runtime.dom();
        let overlay = self.runtime.overlay();
        let bounds = |rect: Option<Rect>| rect.map(Bounds::from);
        json!({
            "outline": bounds(overlay.outline_rect(dom)),
            "addButton": bounds(overlay.add_button_rect(dom)),
            "dragHandle": bounds(overlay.drag_handle_rect(dom)),
            "dropIndicator": bounds(overlay.drop_indicator_rect(dom)),
        })
        .to_string()
    }

    pub fn tick(&mut self, now_ms: f64) {
        self.runtime.tick(millis(now_ms));
    }
}

// ─── Standalone functions ────────────────────────────────────────────────

/// Validate an editor config. Returns JSON: `{"ok":true}` or
/// `{"ok":false,"error":"..."}`.
#[wasm_bindgen]
pub fn validate_config(json: &str) -> String {
    match EditorConfig::from_json(json) {
        Ok(_) => r#"{"ok":true}"#.to_string(),
        Err(e) => error_json(&e.to_string()),
    }
}

/// Canonical form of a rich-text value: `<b>` becomes `<strong>`, unknown
/// tags are dropped, marks are nested in a fixed order.
#[wasm_bindgen]
pub fn normalize_html(html: &str) -> String {
    to_html(&parse_html(html))
}

// ─── Helpers ─────────────────────────────────────────────────────────────

fn parse_config(json: &str) -> Result<EditorConfig, String> {
    if json.trim().is_empty() {
        return Ok(EditorConfig::default());
    }
    EditorConfig::from_json(json).map_err(|e| e.to_string())
}

/// JavaScript timestamps are fractional milliseconds.
fn millis(now_ms: f64) -> u64 {
    if now_ms.is_finite() && now_ms > 0.0 {
        now_ms as u64
    } else {
        0
    }
}

fn parent_id(raw: &str) -> BlockId {
    optional_id(raw).unwrap_or_else(BlockId::root)
}

fn optional_id(raw: &str) -> Option<BlockId> {
    (!raw.is_empty()).then(|| BlockId::intern(raw))
}

fn drain(wire: &MemoryTransport) -> String {
    format!("[{}]", wire.take_outgoing().join(","))
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| error_json(&format!("serialization error: {e}")))
}

fn error_json(message: &str) -> String {
    json!({ "ok": false, "error": message }).to_string()
}

fn report<T, E: std::fmt::Display>(result: Result<T, E>, what: &str) -> Option<T> {
    result.map_err(|e| log::warn!("{what} failed: {e}")).ok()
}

fn js_error(message: String) -> JsValue {
    js_sys::Error::new(&message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    const BLOCKS: &str = r#"[
        {"id":"intro","type":"slate","data":{"value":"Hello"}},
        {"id":"outro","type":"slate","data":{"value":"Bye"}}
    ]"#;

    fn relay_to_frame(authority: &mut BfAuthority, frame: &mut BfFrame) {
        let out: Vec<Value> = serde_json::from_str(&authority.take_outgoing()).unwrap();
        for envelope in out {
            frame.receive(&envelope.to_string(), 0.0);
        }
    }

    fn relay_to_authority(frame: &mut BfFrame, authority: &mut BfAuthority) {
        let out: Vec<Value> = serde_json::from_str(&frame.take_outgoing()).unwrap();
        for envelope in out {
            authority.receive(&envelope.to_string(), 0.0);
        }
    }

    fn snapshot() -> String {
        json!({
            "tag": "body",
            "rect": {"x": 0, "y": 0, "width": 800, "height": 80},
            "children": [
                {"tag": "div", "attrs": {"data-block-uid": "intro"},
                 "rect": {"x": 0, "y": 0, "width": 800, "height": 40}},
                {"tag": "div", "attrs": {"data-block-uid": "outro"},
                 "rect": {"x": 0, "y": 40, "width": 800, "height": 40}}
            ]
        })
        .to_string()
    }

    #[test]
    fn published_tree_reaches_the_frame_mirror() {
        let mut authority = BfAuthority::from_json(BLOCKS, "").unwrap();
        let mut frame = BfFrame::from_json("", "").unwrap();
        authority.publish();
        relay_to_frame(&mut authority, &mut frame);

        let mirror: Value = serde_json::from_str(&frame.mirror_json()).unwrap();
        let tree: Value = serde_json::from_str(&authority.tree_json()).unwrap();
        assert_eq!(mirror, tree);
        assert_eq!(mirror.as_array().map(Vec::len), Some(2));
        assert!(frame.take_events().contains("rerender"));
    }

    #[test]
    fn clicking_a_block_selects_it_on_both_sides() {
        let mut authority = BfAuthority::from_json(BLOCKS, "").unwrap();
        let mut frame = BfFrame::from_json("", "").unwrap();
        authority.publish();
        relay_to_frame(&mut authority, &mut frame);
        assert!(frame.load_dom(&snapshot()));

        frame.handle_input(r#"{"type":"pointerDown","x":30,"y":50}"#, 0.0);
        frame.handle_input(r#"{"type":"pointerUp","x":30,"y":50}"#, 0.0);
        relay_to_authority(&mut frame, &mut authority);

        assert_eq!(frame.selected().as_deref(), Some("outro"));
        assert_eq!(authority.selected().as_deref(), Some("outro"));
        let overlay: Value = serde_json::from_str(&frame.overlay_json()).unwrap();
        assert_eq!(overlay["outline"]["y"], 40.0);
    }

    #[test]
    fn authority_edits_are_reported_as_json() {
        let mut authority = BfAuthority::from_json(BLOCKS, "").unwrap();
        let added: Value = serde_json::from_str(&authority.add_block("", "outro", "slate")).unwrap();
        assert_eq!(added["ok"], true);
        assert!(added["block"].is_string());

        assert!(authority.move_block("outro", "", "intro"));
        let tree: Value = serde_json::from_str(&authority.tree_json()).unwrap();
        assert_eq!(tree[0]["id"], "outro");

        assert!(!authority.delete_block("missing"));
        assert!(!authority.format("sparkle", None));
        let key: Value = serde_json::from_str(&authority.handle_key("z", true, false, false, false)).unwrap();
        assert_eq!(key["action"], "undo");
        assert_eq!(authority.toolbar(), "null");
    }

    #[test]
    fn malformed_inputs_are_refused() {
        assert!(BfAuthority::from_json("{not json", "").is_err());
        assert!(BfFrame::from_json("", "[1, 2]").is_err());

        let mut frame = BfFrame::from_json("", "").unwrap();
        assert!(!frame.load_dom("<div>"));
        assert!(!frame.handle_input(r#"{"type":"teleport"}"#, 0.0));
        assert_eq!(frame.editing_json(), "null");
    }

    #[test]
    fn standalone_helpers() {
        assert_eq!(validate_config("{}"), r#"{"ok":true}"#);
        let bad: Value = serde_json::from_str(&validate_config("[")).unwrap();
        assert_eq!(bad["ok"], false);
        assert_eq!(normalize_html("Hi <b>there</b>"), "Hi <strong>there</strong>");
        assert_eq!(millis(-5.0), 0);
        assert_eq!(millis(12.7), 12);
    }
}
