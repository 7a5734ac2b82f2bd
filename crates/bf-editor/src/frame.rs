//! Frame runtime: the side that renders the document.
//!
//! Keeps a mirror of the authority's tree for optimistic edits, the
//! annotated topology of the rendered DOM, the overlay chrome, the inline
//! editing sessions and the drag controller. Structural edits are applied
//! to the mirror at once and proposed to the authority; `TREE_COMMITTED`
//! is what makes them final, and a rejection rolls the mirror back.

use crate::annotator::{Annotator, FieldBinding, Overlay, Topology};
use crate::bridge::{
    AckPayload, AddPayload, Bridge, CommittedOp, FieldRef, FieldValue, FormatPayload, Message,
    MoveTarget, Packet, ParentOrder, SelectedInfo, SelectionReport, TextRange, Transport,
    TreeCommit,
};
use crate::drag::{DragContext, DragController, DragOutcome, DragState};
use crate::inline::{
    EditorRegistry, FieldFlush, InlineSession, read_dom, suppress_link_navigation, write_dom,
};
use crate::input::{InputEvent, Modifiers};
use crate::mutation::EmptyContainerPolicy;
use crate::shortcuts::{ShortcutAction, ShortcutMap};
use bf_core::config::EditorConfig;
use bf_core::dom::{DomNodeId, DomTree};
use bf_core::error::{EditError, TreeError};
use bf_core::geometry::{Bounds, FrameTransform, Viewport};
use bf_core::html::{parse_html, to_html};
use bf_core::id::BlockId;
use bf_core::model::{BlockNode, BlockSpec, BlockTree};
use bf_core::richtext::{MarkKind, RichTextDocument};
use bf_core::schema::{FieldKind, SchemaResolver, attrs};
use kurbo::{Point, Rect};
use serde::Serialize;
use std::collections::HashMap;

/// Notifications for the frame host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FrameEvent {
    /// The mirror changed: re-render the document, then call `load_dom`.
    Rerender { revision: u64 },
    /// Show the link/media overlay for the focused field.
    OpenLinkEditor {
        block: BlockId,
        field: String,
        href: String,
    },
    Copy { text: String, html: String },
    /// A shortcut only the authority can carry out.
    Forward { action: ShortcutAction },
    /// A field value changed from another view.
    FieldUpdated {
        block: BlockId,
        field: String,
        value: String,
    },
}

/// How to take back an optimistic edit if the authority refuses it. Only
/// the proposed edit is reverted; commits that arrived meanwhile stay.
#[derive(Debug)]
enum Rollback {
    Add {
        proposed: BlockId,
    },
    Delete {
        parent: BlockId,
        before: Option<BlockId>,
        spec: BlockSpec,
    },
    Move {
        block: BlockId,
        parent: BlockId,
        before: Option<BlockId>,
    },
}

pub struct FrameRuntime<T: Transport> {
    bridge: Bridge<T>,
    config: EditorConfig,
    policy: EmptyContainerPolicy,
    schema: Box<dyn SchemaResolver>,
    mirror: BlockTree,
    revision: u64,
    /// Revision of the last child order applied, per parent.
    parent_revisions: HashMap<BlockId, u64>,
    dom: DomTree,
    topology: Topology,
    overlay: Overlay,
    selected: Option<BlockId>,
    editing: Option<(BlockId, String)>,
    registry: EditorRegistry,
    drag: DragController,
    viewport: Viewport,
    transform: FrameTransform,
    optimistic: HashMap<String, Rollback>,
    /// Last batch number seen per field, so reopened sessions continue it.
    batches: HashMap<(BlockId, String), u64>,
    events: Vec<FrameEvent>,
}

impl<T: Transport> FrameRuntime<T> {
    pub fn new(transport: T, config: EditorConfig, schema: impl SchemaResolver + 'static) -> Self {
        Self {
            bridge: Bridge::new(transport, "frame"),
            policy: EmptyContainerPolicy::new(config.placeholder_type.clone()),
            drag: DragController::new(&config),
            config,
            schema: Box::new(schema),
            mirror: BlockTree::new(),
            revision: 0,
            parent_revisions: HashMap::new(),
            dom: DomTree::new(),
            topology: Topology::default(),
            overlay: Overlay::default(),
            selected: None,
            editing: None,
            registry: EditorRegistry::new(),
            viewport: Viewport::default(),
            transform: FrameTransform::default(),
            optimistic: HashMap::new(),
            batches: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn mirror(&self) -> &BlockTree {
        &self.mirror
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn dom(&self) -> &DomTree {
        &self.dom
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn selected(&self) -> Option<BlockId> {
        self.selected
    }

    pub fn editing(&self) -> Option<(BlockId, &str)> {
        self.editing.as_ref().map(|(b, f)| (*b, f.as_str()))
    }

    pub fn session(&self) -> Option<&InlineSession> {
        let (block, field) = self.editing.as_ref()?;
        self.registry.get(*block, field)
    }

    fn session_mut(&mut self) -> Option<&mut InlineSession> {
        let (block, field) = self.editing.as_ref()?;
        self.registry.get_mut(*block, field)
    }

    pub fn drag_state(&self) -> &DragState {
        self.drag.state()
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn transform(&self) -> FrameTransform {
        self.transform
    }

    pub fn bridge(&self) -> &Bridge<T> {
        &self.bridge
    }

    pub fn take_events(&mut self) -> Vec<FrameEvent> {
        std::mem::take(&mut self.events)
    }

    // ─── DOM ─────────────────────────────────────────────────────────────

    /// Take a freshly rendered document: annotate it, attach the overlay
    /// and put the open editor back into its field.
    pub fn load_dom(&mut self, dom: DomTree) {
        self.dom = dom;
        self.overlay = Overlay::default();
        self.reannotate();
    }

    fn reannotate(&mut self) {
        self.topology = Annotator::new(&self.config.direction_cycle, self.schema.as_ref(), &self.mirror)
            .annotate(&self.dom);
        self.overlay.ensure(&mut self.dom);
        if let Some((block, field)) = &self.editing
            && self.binding(*block, field).is_none()
        {
            log::debug!("{block}.{field} is no longer rendered; closing its editor");
            self.close_editing();
        }
        if let Some(block) = self.selected
            && !self.topology.contains(block)
            && !self.mirror.contains(block)
        {
            self.selected = None;
        }
        self.render_session();
        self.refresh_overlay();
    }

    fn binding(&self, block: BlockId, field: &str) -> Option<&FieldBinding> {
        self.topology.get(block)?.field(field)
    }

    fn render_session(&mut self) {
        let Some((block, field)) = &self.editing else {
            return;
        };
        let Some(element) = self
            .topology
            .get(*block)
            .and_then(|b| b.field(field))
            .map(|f| f.element)
        else {
            return;
        };
        if let Some(session) = self.registry.get(*block, field) {
            session.render(&mut self.dom, element);
        }
    }

    fn refresh_overlay(&mut self) {
        let shown = self.selected.and_then(|block| {
            let rect = self.topology.rect(&self.dom, block)?;
            Some((rect, self.topology.get(block)?.direction))
        });
        match shown {
            Some((rect, direction)) => self.overlay.show_selection(&mut self.dom, rect, direction),
            None => self.overlay.hide_selection(&mut self.dom),
        }
    }

    /// Block rect in frame viewport coordinates, as reported to the
    /// authority.
    fn block_bounds(&self, block: BlockId) -> Option<Bounds> {
        let rect = self.topology.rect(&self.dom, block)?;
        Some(Bounds::from(rect - self.viewport.scroll()))
    }

    /// Whether a click on `target` must not follow a link.
    pub fn suppress_navigation(&self, target: DomNodeId) -> bool {
        suppress_link_navigation(&self.dom, target, self.editing.as_ref().map(|(b, _)| *b))
    }

    // ─── Selection ───────────────────────────────────────────────────────

    fn selected_info(&self, block: BlockId) -> SelectedInfo {
        let annotated = self.topology.get(block);
        SelectedInfo {
            rect: self.block_bounds(block),
            direction: annotated.map(|b| b.direction),
            readonly: annotated.is_some_and(|b| b.readonly),
        }
    }

    fn selection_report(&self) -> Option<(BlockId, SelectionReport)> {
        let block = self.selected?;
        let mut report = SelectionReport {
            rect: self.block_bounds(block),
            ..SelectionReport::default()
        };
        if let Some((editing, field)) = &self.editing
            && let Some(session) = self.registry.get(*editing, field)
        {
            let range = session.selection();
            report.field = Some(FieldRef {
                name: field.clone(),
                kind: session.kind(),
            });
            report.range = Some(TextRange::new(range.start, range.end));
            report.active = session.active_marks().kinds();
        }
        Some((block, report))
    }

    fn report_selection(&mut self) {
        if let Some((block, report)) = self.selection_report() {
            self.bridge.post(Message::SelectionChanged { block, report });
        }
    }

    fn can_edit(&self, block: BlockId) -> bool {
        let readonly = self.topology.get(block).is_some_and(|b| b.readonly);
        let placeholder = self
            .mirror
            .get(block)
            .is_some_and(|n| self.policy.is_placeholder(n));
        !readonly && !placeholder
    }

    fn select_at(&mut self, block: BlockId, binding: Option<FieldBinding>) {
        if self.selected != Some(block) {
            self.close_editing();
            self.selected = Some(block);
            let info = self.selected_info(block);
            self.bridge.post(Message::BlockSelected {
                block: Some(block),
                info,
            });
        }
        match binding {
            Some(binding) if self.can_edit(block) => self.focus(block, binding),
            _ => self.close_editing(),
        }
        self.refresh_overlay();
        self.report_selection();
    }

    fn focus(&mut self, block: BlockId, binding: FieldBinding) {
        if self
            .editing
            .as_ref()
            .is_some_and(|(b, f)| *b == block && *f == binding.name)
        {
            return;
        }
        self.close_editing();
        let value = self.field_value(block, &binding);
        let batch = self
            .batches
            .get(&(block, binding.name.clone()))
            .copied()
            .unwrap_or(0);
        self.registry
            .open_at(block, &binding.name, binding.kind, &value, batch);
        self.editing = Some((block, binding.name.clone()));
        self.render_session();
        if matches!(binding.kind, FieldKind::Link | FieldKind::Media) {
            self.open_link_editor();
        }
    }

    /// Current value of a field: the mirror's, else what is rendered.
    fn field_value(&self, block: BlockId, binding: &FieldBinding) -> String {
        if let Some(value) = self.mirror.get(block).and_then(|n| n.field(&binding.name)) {
            return value.to_string();
        }
        match binding.kind {
            FieldKind::RichText => to_html(&read_dom(&self.dom, binding.element)),
            _ => self.dom.text_content(binding.element),
        }
    }

    fn close_editing(&mut self) {
        let Some((block, field)) = self.editing.take() else {
            return;
        };
        if let Some(flush) = self.registry.close(block, &field) {
            self.post_flush(flush);
        }
        if let Some(element) = self.binding(block, &field).map(|f| f.element) {
            self.dom.remove_attr(element, attrs::EDITING);
        }
    }

    fn deselect_local(&mut self, announce: bool) {
        self.close_editing();
        if self.selected.take().is_some() && announce {
            self.bridge.post(Message::BlockSelected {
                block: None,
                info: SelectedInfo::default(),
            });
        }
        self.refresh_overlay();
    }

    fn post_flush(&mut self, flush: FieldFlush) {
        let FieldFlush {
            block,
            field,
            value,
            batch,
        } = flush;
        if let Some(node) = self.mirror.get_mut(block) {
            node.set_field(&field, value.clone());
        }
        self.batches.insert((block, field.clone()), batch);
        self.bridge.post(Message::UpdateField {
            block,
            update: FieldValue {
                field,
                value,
                batch,
            },
        });
    }

    fn flush_all(&mut self) {
        let flushes: Vec<FieldFlush> = self.registry.iter_mut().filter_map(|s| s.flush()).collect();
        for flush in flushes {
            self.post_flush(flush);
        }
    }

    // ─── Input ───────────────────────────────────────────────────────────

    /// Handle one host input event. Returns whether the event was consumed
    /// (the host should prevent its default action).
    pub fn handle_input(&mut self, event: InputEvent, now_ms: u64) -> bool {
        match event {
            InputEvent::PointerDown { x, y, .. } => self.pointer_down(Point::new(x, y), now_ms),
            InputEvent::PointerMove { x, y } => self.pointer_move(Point::new(x, y)),
            InputEvent::PointerUp { x, y } => self.pointer_up(Point::new(x, y), now_ms),
            InputEvent::Scroll { scroll_x, scroll_y } => {
                self.viewport.scroll_x = scroll_x;
                self.viewport.scroll_y = scroll_y;
                self.report_selection();
                false
            }
            InputEvent::Resize { width, height } => {
                self.viewport.width = width;
                self.viewport.height = height;
                self.report_selection();
                false
            }
            InputEvent::Key { key, modifiers } => self.key(&key, modifiers, now_ms),
            InputEvent::Text { text } => self.edit(now_ms, |s, now| s.type_text(&text, now)),
            InputEvent::SelectText { start, end } => {
                let Some(session) = self.session_mut() else {
                    return false;
                };
                session.set_selection(start..end);
                self.render_session();
                self.report_selection();
                true
            }
            InputEvent::DomEdited { caret } => self.dom_edited(caret, now_ms),
        }
    }

    /// Run an edit on the focused session, then re-render and report.
    fn edit(
        &mut self,
        now_ms: u64,
        f: impl FnOnce(&mut InlineSession, u64) -> Result<(), EditError>,
    ) -> bool {
        let Some(session) = self.session_mut() else {
            return false;
        };
        if let Err(e) = f(session, now_ms) {
            log::debug!("edit refused: {e}");
            return false;
        }
        self.render_session();
        self.report_selection();
        true
    }

    fn pointer_down(&mut self, at: Point, now_ms: u64) -> bool {
        let p = self.viewport.to_document(at);
        if let Some(block) = self.selected {
            if self.overlay.drag_handle_rect(&self.dom).is_some_and(|r| r.contains(p)) {
                self.drag.arm(block, at);
                return true;
            }
            if self.overlay.add_button_rect(&self.dom).is_some_and(|r| r.contains(p)) {
                self.close_editing();
                return self.add_after(block, now_ms);
            }
        }
        match self.topology.block_at(&self.dom, p) {
            Some(block) => {
                let binding = self.topology.field_at(&self.dom, block, p).cloned();
                self.select_at(block, binding);
                true
            }
            None => {
                self.deselect_local(true);
                false
            }
        }
    }

    fn pointer_move(&mut self, at: Point) -> bool {
        if !self.drag.is_active() {
            return false;
        }
        let cx = DragContext {
            dom: &self.dom,
            topology: &self.topology,
            tree: &self.mirror,
            viewport: &self.viewport,
        };
        let target = self.drag.pointer_move(at, &cx);
        self.show_drop(target.map(|t| t.indicator));
        true
    }

    fn show_drop(&mut self, indicator: Option<Rect>) {
        match indicator {
            Some(rect) => self.overlay.show_drop_indicator(&mut self.dom, rect),
            None => self.overlay.hide_drop_indicator(&mut self.dom),
        }
    }

    fn pointer_up(&mut self, at: Point, now_ms: u64) -> bool {
        if !self.drag.is_active() {
            return false;
        }
        let cx = DragContext {
            dom: &self.dom,
            topology: &self.topology,
            tree: &self.mirror,
            viewport: &self.viewport,
        };
        let outcome = self.drag.pointer_up(at, &cx);
        self.overlay.hide_drop_indicator(&mut self.dom);
        match outcome {
            DragOutcome::Dropped {
                block,
                parent,
                before,
            } => self.move_block(block, parent, before, now_ms),
            DragOutcome::Cancelled | DragOutcome::None => false,
        }
    }

    fn key(&mut self, key: &str, modifiers: Modifiers, now_ms: u64) -> bool {
        let Some(action) =
            ShortcutMap::resolve(key, modifiers.ctrl, modifiers.shift, modifiers.alt, modifiers.meta)
        else {
            return false;
        };
        match action {
            ShortcutAction::Bold => self.edit(now_ms, |s, now| s.toggle_mark(MarkKind::Bold, now).map(|_| ())),
            ShortcutAction::Italic => {
                self.edit(now_ms, |s, now| s.toggle_mark(MarkKind::Italic, now).map(|_| ()))
            }
            ShortcutAction::Link => self.open_link_editor(),
            ShortcutAction::Undo | ShortcutAction::Redo => {
                // Settle typing first so it lands in history before the undo.
                self.flush_all();
                self.events.push(FrameEvent::Forward { action });
                true
            }
            ShortcutAction::Deselect => self.escape(),
            ShortcutAction::Delete => {
                if self.editing.is_some() {
                    let backward = key == "Backspace";
                    self.edit(now_ms, |s, now| {
                        if backward {
                            s.delete_backward(now)
                        } else {
                            s.delete_forward(now)
                        }
                    })
                } else {
                    self.delete_selected(now_ms)
                }
            }
            ShortcutAction::NewBlock => self.enter(now_ms),
            ShortcutAction::Copy => match self.session() {
                Some(session) => {
                    let payload = session.copy_payload();
                    self.events.push(FrameEvent::Copy {
                        text: payload.text,
                        html: payload.html,
                    });
                    true
                }
                None => false,
            },
        }
    }

    /// Escape peels one layer: link overlay, drag, field focus, selection.
    fn escape(&mut self) -> bool {
        if let Some(session) = self.session_mut()
            && session.cancel_link_editor()
        {
            return true;
        }
        if self.drag.is_active() {
            self.drag.cancel();
            self.overlay.hide_drop_indicator(&mut self.dom);
            return true;
        }
        if self.editing.is_some() {
            self.close_editing();
            self.report_selection();
            return true;
        }
        if self.selected.is_some() {
            self.deselect_local(true);
            return true;
        }
        false
    }

    /// Enter: a line break inside rich text, a new block at the end of a
    /// field.
    fn enter(&mut self, now_ms: u64) -> bool {
        let Some((block, _)) = self.editing.clone() else {
            return false;
        };
        let Some(session) = self.session() else {
            return false;
        };
        let at_end = session.caret() >= session.document().len();
        if session.kind() == FieldKind::RichText && !at_end {
            return self.edit(now_ms, |s, now| s.type_text("\n", now));
        }
        self.close_editing();
        self.add_after(block, now_ms)
    }

    // ─── Link overlay ────────────────────────────────────────────────────

    fn open_link_editor(&mut self) -> bool {
        let Some((block, field)) = self.editing.clone() else {
            return false;
        };
        let Some(session) = self.registry.get_mut(block, &field) else {
            return false;
        };
        let Some(draft) = session.open_link_editor() else {
            return false;
        };
        let href = draft.href.clone();
        self.events
            .push(FrameEvent::OpenLinkEditor { block, field, href });
        true
    }

    pub fn update_link(&mut self, href: &str) {
        if let Some(session) = self.session_mut() {
            session.update_link_draft(href);
        }
    }

    /// Apply the link overlay. Settles at once: a link change is one
    /// discrete edit.
    pub fn commit_link(&mut self, now_ms: u64) -> bool {
        if !self.edit(now_ms, |s, now| s.commit_link_editor(now).map(|_| ())) {
            return false;
        }
        if let Some(flush) = self.session_mut().and_then(InlineSession::flush) {
            self.post_flush(flush);
        }
        true
    }

    pub fn cancel_link(&mut self) -> bool {
        self.session_mut().is_some_and(InlineSession::cancel_link_editor)
    }

    // ─── Native edits ────────────────────────────────────────────────────

    fn dom_edited(&mut self, caret: usize, now_ms: u64) -> bool {
        let Some((block, field)) = self.editing.clone() else {
            return false;
        };
        let Some(element) = self.binding(block, &field).map(|f| f.element) else {
            return false;
        };
        let Some(session) = self.registry.get_mut(block, &field) else {
            return false;
        };
        session.sync_from_dom(&self.dom, element, caret, now_ms);
        self.report_selection();
        true
    }

    /// The host's editable element now holds `html` (native typing, paste,
    /// spellcheck). Read it back with the caret the host reports.
    pub fn field_edited(&mut self, html: &str, caret: usize, now_ms: u64) -> bool {
        let Some((block, field)) = self.editing.clone() else {
            return false;
        };
        let Some(binding) = self.binding(block, &field).cloned() else {
            return false;
        };
        let doc = match binding.kind {
            FieldKind::RichText => parse_html(html),
            _ => RichTextDocument::plain(html),
        };
        write_dom(&mut self.dom, binding.element, &doc);
        self.dom_edited(caret, now_ms)
    }

    // ─── Structural proposals ────────────────────────────────────────────

    /// Add a new block right after `block`, typed by its parent's policy.
    pub fn add_after(&mut self, block: BlockId, now_ms: u64) -> bool {
        let parent = self.mirror.parent_id(block).unwrap_or_else(BlockId::root);
        let siblings = self.mirror.children(parent);
        let before = siblings
            .iter()
            .position(|&c| c == block)
            .and_then(|i| siblings.get(i + 1).copied());
        let block_type = match self.mirror.get(parent) {
            Some(node) if !parent.is_root() => self.policy.substitute_type(node),
            _ => self.config.placeholder_type.clone(),
        };
        let id = BlockId::with_prefix(&block_type);
        if let Err(e) = self
            .mirror
            .insert(parent, before, BlockNode::new(id, block_type.clone()))
        {
            log::debug!("add after {block} refused locally: {e}");
            return false;
        }
        let add = AddPayload {
            before,
            block_type,
            id: Some(id),
            data: serde_json::Value::Null,
        };
        let rid = self.bridge.request(Message::AddBlock { parent, add }, now_ms);
        self.propose(rid, Rollback::Add { proposed: id });
        true
    }

    pub fn delete_selected(&mut self, now_ms: u64) -> bool {
        let Some(block) = self.selected else {
            return false;
        };
        self.close_editing();
        let (Some(parent), Some(spec)) = (self.mirror.parent_id(block), self.mirror.spec_of(block)) else {
            return false;
        };
        let before = self.mirror.next_sibling(block);
        if let Err(e) = self.mirror.remove(block) {
            log::debug!("delete of {block} refused locally: {e}");
            return false;
        }
        self.selected = None;
        self.refresh_overlay();
        let rid = self.bridge.request(Message::DeleteBlock { block }, now_ms);
        self.propose(rid, Rollback::Delete { parent, before, spec });
        true
    }

    pub fn move_block(
        &mut self,
        block: BlockId,
        parent: BlockId,
        before: Option<BlockId>,
        now_ms: u64,
    ) -> bool {
        let Some(from) = self.mirror.parent_id(block) else {
            return false;
        };
        let rollback = Rollback::Move {
            block,
            parent: from,
            before: self.mirror.next_sibling(block),
        };
        match self.mirror.move_block(block, parent, before) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                log::debug!("move of {block} refused locally: {e}");
                return false;
            }
        }
        let target = MoveTarget { parent, before };
        let rid = self.bridge.request(Message::MoveBlock { block, target }, now_ms);
        self.propose(rid, rollback);
        true
    }

    fn propose(&mut self, request_id: String, rollback: Rollback) {
        self.optimistic.insert(request_id, rollback);
        self.events.push(FrameEvent::Rerender {
            revision: self.revision,
        });
    }

    // ─── Incoming ────────────────────────────────────────────────────────

    pub fn pump(&mut self, now_ms: u64) -> usize {
        let packets = self.bridge.receive();
        let count = packets.len();
        for packet in packets {
            self.handle_packet(packet, now_ms);
        }
        count
    }

    pub fn handle_message(&mut self, raw: &str, now_ms: u64) {
        for packet in self.bridge.accept_raw(raw) {
            self.handle_packet(packet, now_ms);
        }
    }

    fn handle_packet(&mut self, packet: Packet, now_ms: u64) {
        let Packet {
            request_id,
            message,
            ..
        } = packet;
        match message {
            Message::SelectBlock { block: Some(block) } => {
                if !self.mirror.contains(block) {
                    log::debug!("authority selected unknown block {block}");
                    return;
                }
                if self.selected != Some(block) {
                    self.close_editing();
                    self.selected = Some(block);
                }
                self.refresh_overlay();
            }
            Message::SelectBlock { block: None } => self.deselect_local(false),
            Message::UpdateField { block, update } => self.on_field_update(block, update),
            Message::FormatApply { block, format } => self.on_format(block, format, now_ms),
            Message::Ack(ack) => {
                if let Some(rid) = request_id {
                    self.on_ack(&rid, ack);
                }
            }
            Message::TreeCommitted(commit) => self.on_commit(commit),
            Message::ViewportChanged(change) => {
                self.transform = change.transform;
                if let Some(viewport) = change.viewport {
                    self.viewport = viewport;
                }
                self.refresh_overlay();
            }
            Message::QueryGeometry { block } => {
                if let Some(rid) = request_id {
                    let rect = self.block_bounds(block);
                    self.bridge.reply(&rid, Message::Geometry { block, rect });
                }
            }
            other => log::debug!("frame ignores {}", other.kind().as_str()),
        }
    }

    fn on_field_update(&mut self, block: BlockId, update: FieldValue) {
        let key = (block, update.field.clone());
        let known = self.batches.get(&key).copied().unwrap_or(0);
        let applied = match self.registry.get_mut(block, &update.field) {
            Some(session) => session.apply_external(&update.value, update.batch),
            None => update.batch >= known,
        };
        if !applied {
            return;
        }
        self.batches.insert(key, known.max(update.batch));
        if let Some(node) = self.mirror.get_mut(block) {
            node.set_field(&update.field, update.value.clone());
        }
        if self
            .editing
            .as_ref()
            .is_some_and(|(b, f)| *b == block && *f == update.field)
        {
            self.render_session();
        }
        self.events.push(FrameEvent::FieldUpdated {
            block,
            field: update.field,
            value: update.value,
        });
    }

    fn on_format(&mut self, block: BlockId, format: FormatPayload, now_ms: u64) {
        let focused = self
            .editing
            .as_ref()
            .is_some_and(|(b, f)| *b == block && *f == format.field);
        if !focused {
            log::debug!("format for unfocused {block}.{} ignored", format.field);
            return;
        }
        self.edit(now_ms, |s, now| {
            if let Some(range) = format.range {
                s.set_selection(range.as_range());
            }
            match (format.mark, format.href.as_deref()) {
                (MarkKind::Link, Some(href)) if !href.is_empty() => s.set_link(href, now),
                (MarkKind::Link, _) => s.remove_link(now),
                (kind, _) => s.toggle_mark(kind, now).map(|_| ()),
            }
        });
    }

    fn on_ack(&mut self, request_id: &str, ack: AckPayload) {
        self.bridge.acknowledge(request_id);
        let Some(rollback) = self.optimistic.remove(request_id) else {
            return;
        };
        if ack.ok {
            // The authority kept the edit, possibly under another id.
            if let Rollback::Add { proposed } = rollback
                && ack.block.is_some_and(|b| b != proposed)
                && let Err(e) = self.roll_back(rollback)
            {
                log::debug!("could not drop proposed block: {e}");
            }
            return;
        }
        log::warn!(
            "request {request_id} rejected: {}; rolling back",
            ack.reason.as_deref().unwrap_or("unknown")
        );
        if let Err(e) = self.roll_back(rollback) {
            log::warn!("rollback of {request_id} failed: {e}");
        }
        self.prune();
        self.events.push(FrameEvent::Rerender {
            revision: self.revision,
        });
    }

    fn roll_back(&mut self, rollback: Rollback) -> Result<(), TreeError> {
        match rollback {
            Rollback::Add { proposed } => {
                if self.mirror.contains(proposed) {
                    self.mirror.remove(proposed)?;
                }
            }
            Rollback::Delete {
                parent,
                before,
                spec,
            } => {
                let block = spec.node.id;
                if self.mirror.contains(block) || !self.mirror.contains(parent) {
                    return Ok(());
                }
                self.mirror.insert_spec(parent, spec)?;
                let before = self.anchor(parent, before);
                self.mirror.move_block(block, parent, before)?;
            }
            Rollback::Move {
                block,
                parent,
                before,
            } => {
                if !self.mirror.contains(block) || !self.mirror.contains(parent) {
                    return Ok(());
                }
                let before = self.anchor(parent, before);
                self.mirror.move_block(block, parent, before)?;
            }
        }
        Ok(())
    }

    /// `before` if it is still a child of `parent`, else append.
    fn anchor(&self, parent: BlockId, before: Option<BlockId>) -> Option<BlockId> {
        before.filter(|&b| self.mirror.parent_id(b) == Some(parent))
    }

    /// Reconcile the mirror with a committed edit. Re-applying an edit the
    /// mirror already shows is a no-op; child orders are authoritative.
    fn on_commit(&mut self, commit: TreeCommit) {
        let TreeCommit {
            revision,
            op,
            orders,
        } = commit;
        match op {
            CommittedOp::Replace { blocks } => {
                if revision < self.revision {
                    log::debug!("stale tree {revision} < {}; ignored", self.revision);
                    return;
                }
                match BlockTree::from_specs(blocks) {
                    Ok(tree) => {
                        self.bridge.resync();
                        self.mirror = tree;
                        self.parent_revisions.clear();
                        self.optimistic.clear();
                        self.reset_sessions();
                    }
                    Err(e) => {
                        log::error!("tree {revision} could not be loaded: {e}");
                        return;
                    }
                }
            }
            CommittedOp::Add { parent, spec } => {
                if !self.mirror.contains(spec.node.id)
                    && let Err(e) = self.mirror.insert_spec(parent, spec)
                {
                    log::warn!("commit {revision}: add failed in mirror: {e}");
                }
            }
            CommittedOp::Delete {
                block,
                parent,
                substitute,
            } => {
                if self.mirror.contains(block)
                    && let Err(e) = self.mirror.remove(block)
                {
                    log::warn!("commit {revision}: delete failed in mirror: {e}");
                }
                if let Some(spec) = substitute
                    && !self.mirror.contains(spec.node.id)
                    && let Err(e) = self.mirror.insert_spec(parent, spec)
                {
                    log::warn!("commit {revision}: substitute failed in mirror: {e}");
                }
            }
            CommittedOp::Move { block, parent, .. } => {
                if self.mirror.contains(block)
                    && self.mirror.parent_id(block) != Some(parent)
                    && let Err(e) = self.mirror.move_block(block, parent, None)
                {
                    log::warn!("commit {revision}: move failed in mirror: {e}");
                }
            }
        }
        for order in orders {
            self.apply_order(revision, order);
        }
        self.revision = self.revision.max(revision);
        self.prune();
        self.refresh_overlay();
        self.events.push(FrameEvent::Rerender {
            revision: self.revision,
        });
    }

    fn apply_order(&mut self, revision: u64, order: ParentOrder) {
        let ParentOrder { parent, children } = order;
        let last = self.parent_revisions.get(&parent).copied().unwrap_or(0);
        if revision < last {
            log::debug!("order of {parent} at {revision} is older than {last}; skipped");
            return;
        }
        if !self.mirror.contains(parent) {
            return;
        }
        let children: Vec<BlockId> = children
            .into_iter()
            .filter(|&c| self.mirror.parent_id(c) == Some(parent))
            .collect();
        if let Err(e) = self.mirror.reorder(parent, &children) {
            log::warn!("order of {parent} could not be applied: {e}");
            return;
        }
        self.parent_revisions.insert(parent, revision);
    }

    /// Forget sessions and selection for blocks the mirror lost.
    fn prune(&mut self) {
        let mirror = &self.mirror;
        self.registry.retain_blocks(|b| mirror.contains(b));
        if let Some((block, _)) = &self.editing
            && !self.mirror.contains(*block)
        {
            self.editing = None;
        }
        if let Some(block) = self.selected
            && !self.mirror.contains(block)
        {
            self.selected = None;
        }
    }

    /// After undo/redo, open editors show the restored values.
    fn reset_sessions(&mut self) {
        let mirror = &self.mirror;
        for session in self.registry.iter_mut() {
            if let Some(value) = mirror.get(session.block()).and_then(|n| n.field(session.field())) {
                session.reset(value);
            }
        }
    }

    // ─── Time ────────────────────────────────────────────────────────────

    /// Settle debounced batches, advance autoscroll, forget overdue
    /// requests (the optimistic state stays) and release commits stuck
    /// behind a lost envelope.
    pub fn tick(&mut self, now_ms: u64) {
        for flush in self.registry.tick(now_ms, self.config.debounce_ms) {
            self.post_flush(flush);
        }
        if self
            .drag
            .tick(&mut self.viewport, &self.dom, &self.topology, &self.mirror)
        {
            let indicator = self.drag.state().target().map(|t| t.indicator);
            self.show_drop(indicator);
        }
        for (rid, _) in self.bridge.expire(now_ms, self.config.request_timeout_ms) {
            self.optimistic.remove(&rid);
        }
        for packet in self.bridge.skip_stalled(now_ms, self.config.request_timeout_ms) {
            self.handle_packet(packet, now_ms);
        }
    }
}
