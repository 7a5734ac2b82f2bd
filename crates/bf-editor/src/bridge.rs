//! Bridge protocol: typed, ordered, correlated messages across the frame
//! boundary.
//!
//! On the wire every message is a JSON envelope
//! `{ "type", "requestId", "blockId", "sequence", "payload" }`. Incoming text
//! is decoded in two steps (raw envelope, then the kind-specific payload)
//! into a typed [`Message`]; anything that does not fit is a
//! [`ProtocolError`], logged and dropped. Structural messages carry a
//! per-block sequence number and are released strictly in order by the
//! [`ReorderBuffer`]. A whole-tree commit is unsequenced and restarts the
//! receiving streams; a gap that never fills is skipped after a timeout.

use bf_core::error::ProtocolError;
use bf_core::geometry::{Bounds, FrameTransform, Viewport};
use bf_core::id::BlockId;
use bf_core::model::{AddDirection, BlockSpec};
use bf_core::richtext::MarkKind;
use bf_core::schema::FieldKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

// ─── Message kinds ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    BlockSelected,
    SelectBlock,
    AddBlock,
    DeleteBlock,
    MoveBlock,
    UpdateField,
    FormatApply,
    SelectionChanged,
    Ack,
    TreeCommitted,
    ViewportChanged,
    Geometry,
    QueryGeometry,
}

impl MessageKind {
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| ProtocolError::UnknownType(s.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockSelected => "BLOCK_SELECTED",
            Self::SelectBlock => "SELECT_BLOCK",
            Self::AddBlock => "ADD_BLOCK",
            Self::DeleteBlock => "DELETE_BLOCK",
            Self::MoveBlock => "MOVE_BLOCK",
            Self::UpdateField => "UPDATE_FIELD",
            Self::FormatApply => "FORMAT_APPLY",
            Self::SelectionChanged => "SELECTION_CHANGED",
            Self::Ack => "ACK",
            Self::TreeCommitted => "TREE_COMMITTED",
            Self::ViewportChanged => "VIEWPORT_CHANGED",
            Self::Geometry => "GEOMETRY",
            Self::QueryGeometry => "QUERY_GEOMETRY",
        }
    }

    /// Structural kinds are sequenced per block and applied in order.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::AddBlock | Self::DeleteBlock | Self::MoveBlock | Self::TreeCommitted
        )
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────

/// Character range inside a field, in visible-character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn caret(at: usize) -> Self {
        Self::new(at, at)
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.start.min(self.end)..self.start.max(self.end)
    }
}

/// A field of the block named in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedInfo {
    #[serde(default)]
    pub rect: Option<Bounds>,
    #[serde(default)]
    pub direction: Option<AddDirection>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPayload {
    #[serde(default)]
    pub before: Option<BlockId>,
    #[serde(rename = "type")]
    pub block_type: String,
    /// Proposed id; the authority generates one when absent.
    #[serde(default)]
    pub id: Option<BlockId>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTarget {
    pub parent: BlockId,
    #[serde(default)]
    pub before: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: String,
    /// Settled-batch number of the sender's view of this field.
    #[serde(default)]
    pub batch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPayload {
    pub field: String,
    pub mark: MarkKind,
    #[serde(default)]
    pub href: Option<String>,
    /// Explicit range; the frame's current selection when absent.
    #[serde(default)]
    pub range: Option<TextRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    #[serde(default)]
    pub field: Option<FieldRef>,
    #[serde(default)]
    pub range: Option<TextRange>,
    /// Marks shared by the whole selection (or armed at the caret).
    #[serde(default)]
    pub active: Vec<MarkKind>,
    #[serde(default)]
    pub rect: Option<Bounds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Id of the block an add created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockId>,
}

impl AckPayload {
    pub fn ok(block: Option<BlockId>) -> Self {
        Self {
            ok: true,
            reason: None,
            block,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            ok: false,
            reason: Some(reason.to_string()),
            block: None,
        }
    }
}

/// The structural edit a commit performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CommittedOp {
    Add {
        parent: BlockId,
        spec: BlockSpec,
    },
    Delete {
        block: BlockId,
        parent: BlockId,
        /// Child inserted because the container became empty.
        #[serde(default)]
        substitute: Option<BlockSpec>,
    },
    Move {
        block: BlockId,
        from: BlockId,
        parent: BlockId,
    },
    /// Whole-tree replacement: initial load, undo and redo.
    Replace { blocks: Vec<BlockSpec> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentOrder {
    pub parent: BlockId,
    pub children: Vec<BlockId>,
}

/// Re-render instruction sent after every committed structural edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeCommit {
    pub revision: u64,
    #[serde(flatten)]
    pub op: CommittedOp,
    /// New child order of every parent the edit touched.
    #[serde(default)]
    pub orders: Vec<ParentOrder>,
}

impl TreeCommit {
    /// Ordering key: the same block the originating request was keyed on.
    pub fn key(&self) -> Option<BlockId> {
        match &self.op {
            CommittedOp::Add { parent, .. } => Some(*parent),
            CommittedOp::Delete { block, .. } | CommittedOp::Move { block, .. } => Some(*block),
            CommittedOp::Replace { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportChange {
    pub transform: FrameTransform,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct GeometryPayload {
    #[serde(default)]
    rect: Option<Bounds>,
}

// ─── Message ─────────────────────────────────────────────────────────────

/// A decoded bridge message. The block each variant names travels in the
/// envelope's `blockId`; the rest is the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Frame → authority: a block was clicked (`None` = deselect).
    BlockSelected {
        block: Option<BlockId>,
        info: SelectedInfo,
    },
    /// Authority → frame: programmatic selection (`None` = deselect).
    SelectBlock { block: Option<BlockId> },
    AddBlock { parent: BlockId, add: AddPayload },
    DeleteBlock { block: BlockId },
    MoveBlock { block: BlockId, target: MoveTarget },
    UpdateField { block: BlockId, update: FieldValue },
    FormatApply { block: BlockId, format: FormatPayload },
    SelectionChanged {
        block: BlockId,
        report: SelectionReport,
    },
    Ack(AckPayload),
    TreeCommitted(TreeCommit),
    ViewportChanged(ViewportChange),
    Geometry { block: BlockId, rect: Option<Bounds> },
    QueryGeometry { block: BlockId },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::BlockSelected { .. } => MessageKind::BlockSelected,
            Self::SelectBlock { .. } => MessageKind::SelectBlock,
            Self::AddBlock { .. } => MessageKind::AddBlock,
            Self::DeleteBlock { .. } => MessageKind::DeleteBlock,
            Self::MoveBlock { .. } => MessageKind::MoveBlock,
            Self::UpdateField { .. } => MessageKind::UpdateField,
            Self::FormatApply { .. } => MessageKind::FormatApply,
            Self::SelectionChanged { .. } => MessageKind::SelectionChanged,
            Self::Ack(_) => MessageKind::Ack,
            Self::TreeCommitted(_) => MessageKind::TreeCommitted,
            Self::ViewportChanged(_) => MessageKind::ViewportChanged,
            Self::Geometry { .. } => MessageKind::Geometry,
            Self::QueryGeometry { .. } => MessageKind::QueryGeometry,
        }
    }

    /// The envelope `blockId`.
    pub fn block(&self) -> Option<BlockId> {
        match self {
            Self::BlockSelected { block, .. } | Self::SelectBlock { block } => *block,
            Self::AddBlock { parent, .. } => Some(*parent),
            Self::DeleteBlock { block }
            | Self::MoveBlock { block, .. }
            | Self::UpdateField { block, .. }
            | Self::FormatApply { block, .. }
            | Self::SelectionChanged { block, .. }
            | Self::Geometry { block, .. }
            | Self::QueryGeometry { block } => Some(*block),
            Self::TreeCommitted(commit) => commit.key(),
            Self::Ack(_) | Self::ViewportChanged(_) => None,
        }
    }

    pub fn is_structural(&self) -> bool {
        self.kind().is_structural()
    }

    /// Structural messages travel with a sequence number, except a
    /// whole-tree commit, which supersedes every stream.
    pub fn is_sequenced(&self) -> bool {
        self.is_structural() && !self.is_tree_replace()
    }

    pub fn is_tree_replace(&self) -> bool {
        matches!(
            self,
            Self::TreeCommitted(TreeCommit {
                op: CommittedOp::Replace { .. },
                ..
            })
        )
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::BlockSelected { info, .. } => serde_json::to_value(info),
            Self::SelectBlock { .. } | Self::DeleteBlock { .. } | Self::QueryGeometry { .. } => {
                Ok(Value::Object(Default::default()))
            }
            Self::AddBlock { add, .. } => serde_json::to_value(add),
            Self::MoveBlock { target, .. } => serde_json::to_value(target),
            Self::UpdateField { update, .. } => serde_json::to_value(update),
            Self::FormatApply { format, .. } => serde_json::to_value(format),
            Self::SelectionChanged { report, .. } => serde_json::to_value(report),
            Self::Ack(ack) => serde_json::to_value(ack),
            Self::TreeCommitted(commit) => serde_json::to_value(commit),
            Self::ViewportChanged(change) => serde_json::to_value(change),
            Self::Geometry { rect, .. } => serde_json::to_value(GeometryPayload { rect: *rect }),
        }
    }

    fn from_parts(
        kind: MessageKind,
        block: Option<BlockId>,
        payload: Value,
    ) -> Result<Self, ProtocolError> {
        let required = || block.ok_or_else(|| ProtocolError::MissingBlock(kind.as_str().into()));
        Ok(match kind {
            MessageKind::BlockSelected => Self::BlockSelected {
                block,
                info: parse_payload(kind, payload)?,
            },
            MessageKind::SelectBlock => Self::SelectBlock { block },
            MessageKind::AddBlock => Self::AddBlock {
                parent: block.unwrap_or_else(BlockId::root),
                add: parse_payload(kind, payload)?,
            },
            MessageKind::DeleteBlock => Self::DeleteBlock { block: required()? },
            MessageKind::MoveBlock => Self::MoveBlock {
                block: required()?,
                target: parse_payload(kind, payload)?,
            },
            MessageKind::UpdateField => Self::UpdateField {
                block: required()?,
                update: parse_payload(kind, payload)?,
            },
            MessageKind::FormatApply => Self::FormatApply {
                block: required()?,
                format: parse_payload(kind, payload)?,
            },
            MessageKind::SelectionChanged => Self::SelectionChanged {
                block: required()?,
                report: parse_payload(kind, payload)?,
            },
            MessageKind::Ack => Self::Ack(parse_payload(kind, payload)?),
            MessageKind::TreeCommitted => Self::TreeCommitted(parse_payload(kind, payload)?),
            MessageKind::ViewportChanged => Self::ViewportChanged(parse_payload(kind, payload)?),
            MessageKind::Geometry => {
                let GeometryPayload { rect } = parse_payload(kind, payload)?;
                Self::Geometry {
                    block: required()?,
                    rect,
                }
            }
            MessageKind::QueryGeometry => Self::QueryGeometry { block: required()? },
        })
    }
}

fn parse_payload<T: DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T, ProtocolError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| ProtocolError::Payload {
        kind: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

// ─── Envelope ────────────────────────────────────────────────────────────

/// Raw wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// A message with its correlation and ordering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub request_id: Option<String>,
    pub sequence: Option<u64>,
    pub message: Message,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            request_id: None,
            sequence: None,
            message,
        }
    }
}

pub fn encode(packet: &Packet) -> Result<String, ProtocolError> {
    let payload = packet
        .message
        .payload()
        .map_err(|e| ProtocolError::Json(e.to_string()))?;
    let envelope = Envelope {
        kind: packet.message.kind().as_str().to_string(),
        request_id: packet.request_id.clone(),
        block_id: packet.message.block(),
        sequence: packet.sequence,
        payload,
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Json(e.to_string()))
}

pub fn decode(raw: &str) -> Result<Packet, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let kind = MessageKind::parse(&envelope.kind)?;
    let message = Message::from_parts(kind, envelope.block_id, envelope.payload)?;
    Ok(Packet {
        request_id: envelope.request_id,
        sequence: envelope.sequence,
        message,
    })
}

// ─── Ordering ────────────────────────────────────────────────────────────

/// Per-block monotonic sequence numbers for outgoing structural messages.
/// Blockless messages share the `None` stream.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: HashMap<Option<BlockId>, u64>,
}

impl Sequencer {
    pub fn next(&mut self, key: Option<BlockId>) -> u64 {
        let slot = self.next.entry(key).or_insert(0);
        *slot += 1;
        *slot
    }
}

/// Packets one stream may hold behind a gap before the gap is skipped.
pub const MAX_HELD: usize = 64;

#[derive(Debug)]
struct Stream {
    /// Next sequence to release.
    expected: u64,
    held: BTreeMap<u64, Packet>,
    /// First tick that saw this stream waiting on a gap.
    stalled_since: Option<u64>,
}

impl Stream {
    fn starting_at(expected: u64) -> Self {
        Self {
            expected,
            held: BTreeMap::new(),
            stalled_since: None,
        }
    }

    fn release(&mut self) -> Vec<Packet> {
        let mut released = Vec::new();
        while let Some(next) = self.held.remove(&self.expected) {
            released.push(next);
            self.expected += 1;
        }
        if self.held.is_empty() {
            self.stalled_since = None;
        }
        released
    }

    /// Give up on the missing sequences and resume at the oldest held one.
    fn skip_gap(&mut self, key: Option<BlockId>) -> Vec<Packet> {
        let Some(&first) = self.held.keys().next() else {
            return Vec::new();
        };
        log::warn!(
            "skipping sequences {}..{first} for {key:?}; {} packets were waiting",
            self.expected,
            self.held.len()
        );
        self.expected = first;
        self.stalled_since = None;
        self.release()
    }
}

/// Releases incoming structural packets per block strictly in sequence
/// order. Everything else passes straight through.
///
/// Streams start at sequence 1. After [`ReorderBuffer::resync`] the sender
/// may be a different peer, or the same peer mid-count, so each stream
/// adopts the first sequence it sees instead.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    streams: HashMap<Option<BlockId>, Stream>,
    adopt: bool,
}

impl ReorderBuffer {
    pub fn accept(&mut self, packet: Packet) -> Vec<Packet> {
        let Some(seq) = packet.sequence.filter(|_| packet.message.is_sequenced()) else {
            return vec![packet];
        };
        let key = packet.message.block();
        let first = if self.adopt { seq } else { 1 };
        let stream = self
            .streams
            .entry(key)
            .or_insert_with(|| Stream::starting_at(first));

        if seq < stream.expected || stream.held.contains_key(&seq) {
            log::debug!(
                "dropping duplicate {} seq {seq} for {key:?}",
                packet.message.kind().as_str()
            );
            return Vec::new();
        }
        if seq > stream.expected {
            log::debug!(
                "buffering {} seq {seq} for {key:?} (waiting for {})",
                packet.message.kind().as_str(),
                stream.expected
            );
        }
        stream.held.insert(seq, packet);

        let mut released = stream.release();
        if stream.held.len() > MAX_HELD {
            released.extend(stream.skip_gap(key));
        }
        released
    }

    /// Forget every stream, held packets included.
    pub fn resync(&mut self) {
        let dropped = self.held();
        if dropped > 0 {
            log::debug!("resync drops {dropped} held packets");
        }
        self.streams.clear();
        self.adopt = true;
    }

    /// Release streams that have waited on a gap for `timeout_ms`. A stream
    /// starts its clock on the first tick that finds it stalled.
    pub fn skip_stalled(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Packet> {
        let mut released = Vec::new();
        for (key, stream) in &mut self.streams {
            if stream.held.is_empty() {
                continue;
            }
            match stream.stalled_since {
                None => stream.stalled_since = Some(now_ms),
                Some(since) if now_ms.saturating_sub(since) >= timeout_ms => {
                    released.extend(stream.skip_gap(*key));
                }
                Some(_) => {}
            }
        }
        released
    }

    /// Number of packets waiting for an earlier sequence.
    pub fn held(&self) -> usize {
        self.streams.values().map(|s| s.held.len()).sum()
    }
}

// ─── Correlation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub kind: MessageKind,
    pub block: Option<BlockId>,
    pub issued_at: u64,
}

/// Outgoing requests awaiting an `ACK`.
#[derive(Debug, Default)]
pub struct PendingRequests {
    open: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn track(&mut self, request_id: &str, request: PendingRequest) {
        self.open.insert(request_id.to_string(), request);
    }

    pub fn resolve(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.open.remove(request_id)
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.open.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Forget every request issued more than `timeout_ms` before `now_ms`.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<(String, PendingRequest)> {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.issued_at) >= timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        let mut out: Vec<(String, PendingRequest)> = expired
            .into_iter()
            .filter_map(|id| self.open.remove(&id).map(|r| (id, r)))
            .collect();
        out.sort_by_key(|(_, r)| r.issued_at);
        out
    }
}

// ─── Transport ───────────────────────────────────────────────────────────

/// The platform's post-message primitive.
pub trait Transport {
    /// Send one encoded envelope to the other side.
    fn post(&mut self, message: String);

    /// Take every envelope received since the last call.
    fn drain(&mut self) -> Vec<String>;
}

type Queue = Rc<RefCell<VecDeque<String>>>;

/// In-process transport backed by shared queues. `pair()` connects two
/// runtimes; a lone transport is fed with `deliver` and read with
/// `take_outgoing`, which is how the wasm facade uses it.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inbox: Queue,
    outbox: Queue,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair() -> (Self, Self) {
        let a_to_b: Queue = Rc::default();
        let b_to_a: Queue = Rc::default();
        (
            Self {
                inbox: b_to_a.clone(),
                outbox: a_to_b.clone(),
            },
            Self {
                inbox: a_to_b,
                outbox: b_to_a,
            },
        )
    }

    /// Queue an envelope as if the other side had posted it.
    pub fn deliver(&self, raw: impl Into<String>) {
        self.inbox.borrow_mut().push_back(raw.into());
    }

    /// Take everything this side has posted and nobody has drained yet.
    pub fn take_outgoing(&self) -> Vec<String> {
        self.outbox.borrow_mut().drain(..).collect()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outbox.borrow().len()
    }

    pub fn incoming_len(&self) -> usize {
        self.inbox.borrow().len()
    }
}

impl Transport for MemoryTransport {
    fn post(&mut self, message: String) {
        self.outbox.borrow_mut().push_back(message);
    }

    fn drain(&mut self) -> Vec<String> {
        self.inbox.borrow_mut().drain(..).collect()
    }
}

// ─── Bridge ──────────────────────────────────────────────────────────────

/// One side of the channel: encodes, sequences and correlates outgoing
/// messages; decodes and orders incoming ones.
pub struct Bridge<T: Transport> {
    transport: T,
    /// Request-id prefix, distinct per side.
    origin: &'static str,
    next_request: u64,
    sequencer: Sequencer,
    reorder: ReorderBuffer,
    pending: PendingRequests,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: T, origin: &'static str) -> Self {
        Self {
            transport,
            origin,
            next_request: 0,
            sequencer: Sequencer::default(),
            reorder: ReorderBuffer::default(),
            pending: PendingRequests::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn send(&mut self, request_id: Option<String>, message: Message) {
        let sequence = message
            .is_sequenced()
            .then(|| self.sequencer.next(message.block()));
        let packet = Packet {
            request_id,
            sequence,
            message,
        };
        match encode(&packet) {
            Ok(raw) => self.transport.post(raw),
            Err(e) => log::error!("failed to encode {}: {e}", packet.message.kind().as_str()),
        }
    }

    /// Fire-and-forget.
    pub fn post(&mut self, message: Message) {
        self.send(None, message);
    }

    /// Send a request that expects an `ACK`. Returns its request id.
    pub fn request(&mut self, message: Message, now_ms: u64) -> String {
        self.next_request += 1;
        let request_id = format!("{}-{}", self.origin, self.next_request);
        self.pending.track(
            &request_id,
            PendingRequest {
                kind: message.kind(),
                block: message.block(),
                issued_at: now_ms,
            },
        );
        self.send(Some(request_id.clone()), message);
        request_id
    }

    /// Answer a request, echoing its id.
    pub fn reply(&mut self, request_id: &str, message: Message) {
        self.send(Some(request_id.to_string()), message);
    }

    /// Drain and decode everything the transport received, without
    /// ordering. Malformed envelopes are logged and dropped.
    pub fn decode_incoming(&mut self) -> Vec<Packet> {
        self.transport
            .drain()
            .iter()
            .filter_map(|raw| decode_logged(raw))
            .collect()
    }

    /// Pass a decoded packet through the reorder buffer.
    pub fn order(&mut self, packet: Packet) -> Vec<Packet> {
        self.reorder.accept(packet)
    }

    /// Drain, decode and order.
    pub fn receive(&mut self) -> Vec<Packet> {
        let decoded = self.decode_incoming();
        decoded.into_iter().flat_map(|p| self.order(p)).collect()
    }

    /// Decode and order one envelope handed in directly by a host.
    pub fn accept_raw(&mut self, raw: &str) -> Vec<Packet> {
        decode_logged(raw)
            .map(|p| self.order(p))
            .unwrap_or_default()
    }

    /// The peer was replaced or replayed a whole tree: let incoming streams
    /// restart wherever the sender's counters stand.
    pub fn resync(&mut self) {
        self.reorder.resync();
    }

    /// Packets released because their stream waited too long on a gap.
    pub fn skip_stalled(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Packet> {
        self.reorder.skip_stalled(now_ms, timeout_ms)
    }

    pub fn acknowledge(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.pending.resolve(request_id)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Incoming packets waiting for an earlier sequence.
    pub fn held(&self) -> usize {
        self.reorder.held()
    }

    /// Forget timed-out requests. Never fatal: editing continues
    /// optimistically.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<(String, PendingRequest)> {
        let expired = self.pending.expire(now_ms, timeout_ms);
        for (id, request) in &expired {
            log::warn!(
                "request {id} ({}) for {:?} timed out after {timeout_ms} ms",
                request.kind.as_str(),
                request.block
            );
        }
        expired
    }
}

fn decode_logged(raw: &str) -> Option<Packet> {
    match decode(raw) {
        Ok(packet) => Some(packet),
        Err(e) => {
            log::warn!("dropping envelope: {e}");
            None
        }
    }
}
