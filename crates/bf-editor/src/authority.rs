//! Authority runtime: owns the block tree and the selection.
//!
//! Wraps the [`StructuralEngine`] and the [`SelectionController`] behind
//! one [`Bridge`]. Structural requests from the frame are applied, answered
//! with `ACK` and followed by a `TREE_COMMITTED` re-render instruction;
//! local edits (sidebar, toolbar, shortcuts) go through the same engine.
//! Every error is caught here, logged, and leaves the previous state.

use crate::bridge::{
    AckPayload, Bridge, FieldValue, FormatPayload, Message, Packet, TreeCommit,
    Transport, ViewportChange,
};
use crate::input::Modifiers;
use crate::mutation::{Outcome, StructuralEngine, StructuralOp, created_block};
use crate::selection::{SelectionController, SelectionState, ToolbarLayout};
use crate::shortcuts::{ShortcutAction, ShortcutMap};
use bf_core::config::EditorConfig;
use bf_core::error::EditError;
use bf_core::geometry::{FrameTransform, Viewport};
use bf_core::id::BlockId;
use bf_core::model::BlockTree;
use bf_core::richtext::MarkKind;
use kurbo::Rect;
use serde::Serialize;
use std::collections::HashMap;

/// Notifications for the hosting application (sidebar, toolbar chrome).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AuthorityEvent {
    Selected { block: Option<BlockId> },
    FieldChanged {
        block: BlockId,
        field: String,
        value: String,
    },
    TreeChanged { revision: u64 },
    #[serde(rename_all = "camelCase")]
    Rejected {
        request_id: Option<String>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    TimedOut { request_id: String },
}

pub struct AuthorityRuntime<T: Transport> {
    bridge: Bridge<T>,
    engine: StructuralEngine,
    selection: SelectionController,
    config: EditorConfig,
    /// Last accepted batch per field, from either side.
    batches: HashMap<(BlockId, String), u64>,
    /// Visible host area, for toolbar flipping.
    host_viewport: Rect,
    events: Vec<AuthorityEvent>,
}

impl<T: Transport> AuthorityRuntime<T> {
    pub fn new(transport: T, tree: BlockTree, config: EditorConfig) -> Self {
        let host_viewport = Rect::new(0.0, 0.0, f64::INFINITY, f64::INFINITY);
        Self {
            bridge: Bridge::new(transport, "authority"),
            engine: StructuralEngine::new(tree, &config),
            selection: SelectionController::new(),
            config,
            batches: HashMap::new(),
            host_viewport,
            events: Vec::new(),
        }
    }

    pub fn tree(&self) -> &BlockTree {
        self.engine.tree()
    }

    pub fn engine(&self) -> &StructuralEngine {
        &self.engine
    }

    pub fn selection(&self) -> &SelectionController {
        &self.selection
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Bridge<T> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge<T> {
        &mut self.bridge
    }

    pub fn take_events(&mut self) -> Vec<AuthorityEvent> {
        std::mem::take(&mut self.events)
    }

    /// Send the whole tree for the initial render, or to a frame that
    /// reloaded. Incoming sequence streams start over.
    pub fn publish_tree(&mut self) {
        self.bridge.resync();
        let commit = self.engine.replace_commit();
        self.broadcast(None, commit);
    }

    // ─── Incoming ────────────────────────────────────────────────────────

    /// Handle everything the transport has received. Returns the number of
    /// packets processed.
    pub fn pump(&mut self, now_ms: u64) -> usize {
        let packets = self.bridge.receive();
        let count = packets.len();
        for packet in packets {
            self.handle_packet(packet, now_ms);
        }
        count
    }

    /// Handle one envelope handed in directly by the host.
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
            Message::BlockSelected {
                block: Some(block),
                info,
            } => match self.selection.select(block, self.engine.tree(), self.engine.policy()) {
                Ok(changed) => {
                    self.selection
                        .describe(info.rect.map(Rect::from), info.direction, info.readonly);
                    if changed {
                        self.events.push(AuthorityEvent::Selected { block: Some(block) });
                        self.query_geometry(block, now_ms);
                    }
                }
                Err(e) => {
                    log::debug!("{e}; deselecting");
                    self.bridge.post(Message::SelectBlock { block: None });
                    self.events.push(AuthorityEvent::Selected { block: None });
                }
            },
            Message::BlockSelected { block: None, .. } => {
                if self.selection.selected().is_some() {
                    self.selection.deselect();
                    self.events.push(AuthorityEvent::Selected { block: None });
                }
            }
            Message::AddBlock { parent, add } => {
                let op = StructuralOp::Add {
                    parent,
                    before: add.before,
                    block_type: add.block_type,
                    id: add.id,
                    data: add.data,
                };
                self.on_structural_request(request_id, op, now_ms);
            }
            Message::DeleteBlock { block } => {
                self.on_structural_request(request_id, StructuralOp::Delete { block }, now_ms);
            }
            Message::MoveBlock { block, target } => {
                let op = StructuralOp::Move {
                    block,
                    parent: target.parent,
                    before: target.before,
                };
                self.on_structural_request(request_id, op, now_ms);
            }
            Message::UpdateField { block, update } => self.on_field_update(block, update),
            Message::SelectionChanged { block, report } => {
                if self.selection.selected() != Some(block) {
                    log::debug!("selection report for unselected {block} ignored");
                    return;
                }
                match &report.field {
                    Some(field) => {
                        if !self.selection.focus_field(block, field) {
                            log::debug!("focus on {block}.{} refused", field.name);
                        }
                    }
                    None => self.selection.blur_field(),
                }
                self.selection.set_active_marks(report.active);
                if let Some(rect) = report.rect {
                    self.selection.on_geometry(block, Some(rect.into()));
                }
            }
            Message::Geometry { block, rect } => {
                if let Some(rid) = &request_id {
                    self.bridge.acknowledge(rid);
                }
                self.selection.on_geometry(block, rect.map(Rect::from));
            }
            Message::Ack(_) => {
                if let Some(rid) = &request_id {
                    self.bridge.acknowledge(rid);
                }
            }
            other => log::debug!("authority ignores {}", other.kind().as_str()),
        }
    }

    fn on_structural_request(&mut self, request_id: Option<String>, op: StructuralOp, now_ms: u64) {
        let description = op.describe();
        let rid = request_id.as_deref();
        match self.engine.apply(rid, op) {
            Ok(Outcome::Committed(commit)) => {
                let created = created_block(&commit);
                self.answer(rid, AckPayload::ok(created));
                self.broadcast(rid, commit);
                if let Some(block) = created
                    && let Err(e) = self.select_block(block, now_ms)
                {
                    log::debug!("could not select new block: {e}");
                }
            }
            Ok(Outcome::Unchanged) => self.answer(rid, AckPayload::ok(None)),
            Ok(Outcome::Replayed(Ok(block))) => self.answer(rid, AckPayload::ok(block)),
            Ok(Outcome::Replayed(Err(reason))) => self.answer(rid, AckPayload::rejected(&reason)),
            Err(e) => {
                log::warn!("rejected {description}: {e}");
                self.answer(rid, AckPayload::rejected(e.reason()));
                self.events.push(AuthorityEvent::Rejected {
                    request_id: request_id.clone(),
                    reason: e.reason().to_string(),
                });
            }
        }
    }

    fn answer(&mut self, request_id: Option<&str>, ack: AckPayload) {
        if let Some(rid) = request_id {
            self.bridge.reply(rid, Message::Ack(ack));
        }
    }

    fn on_field_update(&mut self, block: BlockId, update: FieldValue) {
        let key = (block, update.field.clone());
        let last = self.batches.get(&key).copied().unwrap_or(0);
        if update.batch < last {
            log::debug!(
                "stale value for {block}.{} (batch {} < {last})",
                update.field,
                update.batch
            );
            return;
        }
        match self.write_field(block, &update.field, &update.value) {
            Ok(true) => {
                self.batches.insert(key, update.batch);
                self.events.push(AuthorityEvent::FieldChanged {
                    block,
                    field: update.field,
                    value: update.value,
                });
            }
            Ok(false) => {
                self.batches.insert(key, update.batch);
            }
            Err(e) => log::debug!("field update dropped: {e}"),
        }
    }

    /// Write one field as one undo step.
    fn write_field(&mut self, block: BlockId, field: &str, value: &str) -> Result<bool, EditError> {
        let before = self.engine.snapshot()?;
        if !self.engine.update_field(block, field, value)? {
            return Ok(false);
        }
        self.engine
            .record_field_batch(before, &format!("edit {block}.{field}"))?;
        Ok(true)
    }

    // ─── Outgoing ────────────────────────────────────────────────────────

    fn broadcast(&mut self, request_id: Option<&str>, commit: TreeCommit) {
        let revision = commit.revision;
        let message = Message::TreeCommitted(commit);
        match request_id {
            Some(rid) => self.bridge.reply(rid, message),
            None => self.bridge.post(message),
        }
        self.events.push(AuthorityEvent::TreeChanged { revision });
        if !self.selection.validate(self.engine.tree()) {
            self.bridge.post(Message::SelectBlock { block: None });
            self.events.push(AuthorityEvent::Selected { block: None });
        }
    }

    fn query_geometry(&mut self, block: BlockId, now_ms: u64) {
        let rid = self.bridge.request(Message::QueryGeometry { block }, now_ms);
        self.selection.geometry_requested(block, rid, now_ms);
    }

    /// Select a block programmatically (outline tree, new block).
    pub fn select_block(&mut self, block: BlockId, now_ms: u64) -> Result<bool, EditError> {
        match self.selection.select(block, self.engine.tree(), self.engine.policy()) {
            Ok(true) => {
                self.bridge.post(Message::SelectBlock { block: Some(block) });
                self.events.push(AuthorityEvent::Selected { block: Some(block) });
                self.query_geometry(block, now_ms);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.bridge.post(Message::SelectBlock { block: None });
                self.events.push(AuthorityEvent::Selected { block: None });
                Err(e)
            }
        }
    }

    pub fn deselect(&mut self) {
        if self.selection.selected().is_none() {
            return;
        }
        self.selection.deselect();
        self.bridge.post(Message::SelectBlock { block: None });
        self.events.push(AuthorityEvent::Selected { block: None });
    }

    fn commit_local(&mut self, op: StructuralOp) -> Result<Option<TreeCommit>, EditError> {
        let description = op.describe();
        match self.engine.apply(None, op) {
            Ok(Outcome::Committed(commit)) => {
                self.broadcast(None, commit.clone());
                Ok(Some(commit))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                log::warn!("rejected {description}: {e}");
                Err(e)
            }
        }
    }

    /// Add a block of `block_type` under `parent`. Returns the new id.
    pub fn add_block(
        &mut self,
        parent: BlockId,
        before: Option<BlockId>,
        block_type: &str,
    ) -> Result<Option<BlockId>, EditError> {
        let op = StructuralOp::Add {
            parent,
            before,
            block_type: block_type.to_string(),
            id: None,
            data: serde_json::Value::Null,
        };
        Ok(self.commit_local(op)?.as_ref().and_then(created_block))
    }

    pub fn delete_block(&mut self, block: BlockId) -> Result<bool, EditError> {
        Ok(self.commit_local(StructuralOp::Delete { block })?.is_some())
    }

    pub fn move_block(
        &mut self,
        block: BlockId,
        parent: BlockId,
        before: Option<BlockId>,
    ) -> Result<bool, EditError> {
        let op = StructuralOp::Move {
            block,
            parent,
            before,
        };
        Ok(self.commit_local(op)?.is_some())
    }

    /// Field edit from another view (sidebar form). Pushed to the frame
    /// under the next batch number for that field.
    pub fn set_field(&mut self, block: BlockId, field: &str, value: &str) -> Result<bool, EditError> {
        if !self.write_field(block, field, value)? {
            return Ok(false);
        }
        let slot = self.batches.entry((block, field.to_string())).or_insert(0);
        *slot += 1;
        let batch = *slot;
        self.bridge.post(Message::UpdateField {
            block,
            update: FieldValue {
                field: field.to_string(),
                value: value.to_string(),
                batch,
            },
        });
        Ok(true)
    }

    /// Toolbar formatting for the field being edited in the frame.
    pub fn format(&mut self, mark: MarkKind, href: Option<String>) -> bool {
        if self.selection.readonly() {
            return false;
        }
        let SelectionState::Editing { block, field } = self.selection.state() else {
            return false;
        };
        let message = Message::FormatApply {
            block: *block,
            format: FormatPayload {
                field: field.name.clone(),
                mark,
                href,
                range: None,
            },
        };
        self.bridge.post(message);
        true
    }

    /// The host layout moved the frame (side panel, zoom, resize).
    pub fn viewport_changed(&mut self, transform: FrameTransform, viewport: Option<Viewport>, now_ms: u64) {
        self.selection.set_transform(transform);
        self.bridge
            .post(Message::ViewportChanged(ViewportChange { transform, viewport }));
        if let Some(block) = self.selection.selected() {
            self.query_geometry(block, now_ms);
        }
    }

    pub fn set_host_viewport(&mut self, rect: Rect) {
        self.host_viewport = rect;
    }

    pub fn toolbar(&self) -> Option<ToolbarLayout> {
        self.selection.layout(self.host_viewport)
    }

    // ─── History & keys ──────────────────────────────────────────────────

    pub fn undo(&mut self) -> Result<bool, EditError> {
        match self.engine.undo()? {
            Some(commit) => {
                self.broadcast(None, commit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn redo(&mut self) -> Result<bool, EditError> {
        match self.engine.redo()? {
            Some(commit) => {
                self.broadcast(None, commit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shortcuts pressed while the host has focus. Returns the action
    /// taken, if any.
    pub fn handle_key(&mut self, key: &str, modifiers: Modifiers) -> Option<ShortcutAction> {
        let action = ShortcutMap::resolve(key, modifiers.ctrl, modifiers.shift, modifiers.alt, modifiers.meta)?;
        let handled = match action {
            ShortcutAction::Undo => self.undo(),
            ShortcutAction::Redo => self.redo(),
            ShortcutAction::Deselect => {
                self.deselect();
                Ok(true)
            }
            ShortcutAction::Delete => match self.selection.state() {
                SelectionState::Selected { block } => {
                    let block = *block;
                    self.delete_block(block)
                }
                _ => Ok(false),
            },
            ShortcutAction::Bold => Ok(self.format(MarkKind::Bold, None)),
            ShortcutAction::Italic => Ok(self.format(MarkKind::Italic, None)),
            ShortcutAction::Link | ShortcutAction::NewBlock | ShortcutAction::Copy => Ok(false),
        };
        match handled {
            Ok(true) => Some(action),
            Ok(false) => None,
            Err(e) => {
                log::warn!("{action:?} failed: {e}");
                None
            }
        }
    }

    /// Expire overdue requests and geometry queries, and release packets
    /// stuck behind a lost envelope.
    pub fn tick(&mut self, now_ms: u64) {
        for packet in self.bridge.skip_stalled(now_ms, self.config.request_timeout_ms) {
            self.handle_packet(packet, now_ms);
        }
        for (request_id, _) in self.bridge.expire(now_ms, self.config.request_timeout_ms) {
            self.events.push(AuthorityEvent::TimedOut { request_id });
        }
        if let Some(rid) = self.selection.tick(now_ms, self.config.geometry_timeout_ms) {
            self.bridge.acknowledge(&rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AddPayload, MemoryTransport, SelectedInfo, decode, encode};
    use bf_core::model::{BlockNode, BlockSpec, ContainerKind};
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> BlockId {
        BlockId::intern(s)
    }

    fn runtime() -> (AuthorityRuntime<MemoryTransport>, MemoryTransport) {
        let tree = BlockTree::from_specs(vec![
            BlockSpec::leaf(BlockNode::new(id("a_title"), "title").with_field("title", "Hi")),
            BlockSpec::with_children(
                BlockNode::new(id("a_grid"), "grid").container(ContainerKind::Explicit, &[], Some("slate")),
                vec![BlockSpec::leaf(BlockNode::new(id("a_cell"), "slate"))],
            ),
        ])
        .unwrap();
        let transport = MemoryTransport::new();
        let handle = transport.clone();
        (AuthorityRuntime::new(transport, tree, EditorConfig::default()), handle)
    }

    fn send(handle: &MemoryTransport, request_id: Option<&str>, sequence: Option<u64>, message: Message) {
        let packet = Packet {
            request_id: request_id.map(str::to_string),
            sequence,
            message,
        };
        handle.deliver(encode(&packet).unwrap());
    }

    fn outgoing(handle: &MemoryTransport) -> Vec<Packet> {
        handle
            .take_outgoing()
            .iter()
            .map(|raw| decode(raw).unwrap())
            .collect()
    }

    #[test]
    fn click_selects_and_queries_geometry() {
        let (mut rt, handle) = runtime();
        send(
            &handle,
            None,
            None,
            Message::BlockSelected {
                block: Some(id("a_title")),
                info: SelectedInfo::default(),
            },
        );
        rt.pump(0);
        assert_eq!(rt.selection().selected(), Some(id("a_title")));
        let out = outgoing(&handle);
        assert!(matches!(out[0].message, Message::QueryGeometry { block } if block == id("a_title")));
        assert!(rt.bridge().pending().len() == 1);
        assert_eq!(
            rt.take_events(),
            vec![AuthorityEvent::Selected {
                block: Some(id("a_title"))
            }]
        );
    }

    #[test]
    fn add_request_is_acked_committed_and_selected() {
        let (mut rt, handle) = runtime();
        let add = AddPayload {
            before: None,
            block_type: "slate".into(),
            id: Some(id("a_new")),
            data: serde_json::Value::Null,
        };
        send(
            &handle,
            Some("frame-1"),
            Some(1),
            Message::AddBlock {
                parent: BlockId::root(),
                add,
            },
        );
        rt.pump(0);
        let out = outgoing(&handle);
        assert!(matches!(&out[0].message, Message::Ack(ack) if ack.ok && ack.block == Some(id("a_new"))));
        assert_eq!(out[0].request_id.as_deref(), Some("frame-1"));
        assert!(matches!(&out[1].message, Message::TreeCommitted(_)));
        assert_eq!(out[1].sequence, Some(1));
        assert!(matches!(out[2].message, Message::SelectBlock { block: Some(b) } if b == id("a_new")));
        assert_eq!(rt.tree().len(), 4);
    }

    #[test]
    fn replayed_request_is_answered_once() {
        let (mut rt, handle) = runtime();
        // Same request id under a fresh sequence, as a resend would be.
        send(&handle, Some("frame-7"), Some(1), Message::DeleteBlock { block: id("a_title") });
        rt.pump(0);
        handle.take_outgoing();
        send(&handle, Some("frame-7"), Some(2), Message::DeleteBlock { block: id("a_title") });
        rt.pump(0);
        let out = outgoing(&handle);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].message, Message::Ack(ack) if ack.ok));
        assert_eq!(rt.tree().len(), 2);
    }

    #[test]
    fn rejected_requests_leave_the_tree() {
        let (mut rt, handle) = runtime();
        send(&handle, Some("frame-2"), Some(1), Message::DeleteBlock { block: id("a_ghost") });
        rt.pump(0);
        let out = outgoing(&handle);
        assert!(
            matches!(&out[0].message, Message::Ack(ack) if !ack.ok && ack.reason.as_deref() == Some("unknown-block"))
        );
        assert_eq!(rt.tree().len(), 3);
    }

    #[test]
    fn stale_field_batches_are_ignored() {
        let (mut rt, handle) = runtime();
        let update = |value: &str, batch| Message::UpdateField {
            block: id("a_title"),
            update: FieldValue {
                field: "title".into(),
                value: value.into(),
                batch,
            },
        };
        send(&handle, None, None, update("Two", 2));
        send(&handle, None, None, update("One", 1));
        rt.pump(0);
        assert_eq!(rt.tree().get(id("a_title")).unwrap().field("title"), Some("Two"));
        assert!(rt.undo().unwrap());
        assert_eq!(rt.tree().get(id("a_title")).unwrap().field("title"), Some("Hi"));
    }

    #[test]
    fn deleting_the_selection_deselects() {
        let (mut rt, handle) = runtime();
        rt.select_block(id("a_cell"), 0).unwrap();
        handle.take_outgoing();
        assert_eq!(
            rt.handle_key("Delete", Modifiers::NONE),
            Some(ShortcutAction::Delete)
        );
        assert_eq!(rt.selection().selected(), None);
        let grid = rt.tree().children(id("a_grid"));
        assert_eq!(grid.len(), 1);
        assert_eq!(rt.tree().get(grid[0]).unwrap().block_type, "slate");
        let out = outgoing(&handle);
        assert!(matches!(out.last().unwrap().message, Message::SelectBlock { block: None }));
    }

    #[test]
    fn geometry_timeout_is_not_fatal() {
        let (mut rt, _handle) = runtime();
        rt.select_block(id("a_title"), 0).unwrap();
        assert!(rt.selection().geometry_pending());
        rt.tick(5_000);
        assert!(!rt.selection().geometry_pending());
        assert!(rt.bridge().pending().is_empty());
        rt.select_block(id("a_cell"), 5_001).unwrap();
        assert_eq!(rt.selection().selected(), Some(id("a_cell")));
    }
}
