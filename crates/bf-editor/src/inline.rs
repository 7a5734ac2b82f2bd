//! Inline text editing engine.
//!
//! One [`InlineSession`] per focused field holds the [`RichTextDocument`],
//! the caret/selection in visible-character offsets, the prospective
//! formatting state and the batching counters. Rendering patches the
//! editable element's children in place; the element itself is never
//! replaced, so the host keeps native caret and composition state.

use bf_core::dom::{DomContent, DomNodeId, DomTree};
use bf_core::error::EditError;
use bf_core::html::{parse_html, to_html};
use bf_core::id::BlockId;
use bf_core::richtext::{Mark, MarkKind, MarkSet, RichTextDocument, SENTINEL, TextRun, strip_sentinel};
use bf_core::schema::{FieldKind, attrs};
use std::collections::HashMap;
use std::ops::Range;

/// Prospective formatting at a collapsed caret. The only owner of the
/// sentinel character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PendingMark {
    #[default]
    None,
    Armed { marks: MarkSet, at: usize },
}

/// Last toggle, so toggling the same kind over the same range back
/// restores the exact previous runs.
#[derive(Debug, Clone)]
struct ToggleMemo {
    range: Range<usize>,
    kind: MarkKind,
    before: RichTextDocument,
    after: RichTextDocument,
}

/// An open link/media overlay. Nothing touches the document until commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDraft {
    /// Text range for rich-text links; `None` edits the whole field value.
    pub range: Option<Range<usize>>,
    pub href: String,
}

/// A settled batch, ready to go out as `UPDATE_FIELD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFlush {
    pub block: BlockId,
    pub field: String,
    pub value: String,
    pub batch: u64,
}

/// Clipboard content for the selected range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPayload {
    pub text: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct InlineSession {
    block: BlockId,
    field: String,
    kind: FieldKind,
    doc: RichTextDocument,
    selection: Range<usize>,
    pending: PendingMark,
    dirty: bool,
    last_edit_ms: u64,
    /// Number of the last flushed (or accepted) batch.
    batch: u64,
    memo: Option<ToggleMemo>,
    draft: Option<LinkDraft>,
}

impl InlineSession {
    pub fn new(block: BlockId, field: &str, kind: FieldKind, value: &str) -> Self {
        let doc = Self::decode(kind, value);
        let end = doc.len();
        Self {
            block,
            field: field.to_string(),
            kind,
            doc,
            selection: end..end,
            pending: PendingMark::None,
            dirty: false,
            last_edit_ms: 0,
            batch: 0,
            memo: None,
            draft: None,
        }
    }

    /// Continue the batch numbering of an earlier session on this field.
    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch;
        self
    }

    fn decode(kind: FieldKind, value: &str) -> RichTextDocument {
        match kind {
            FieldKind::RichText => parse_html(value),
            _ => RichTextDocument::plain(&strip_sentinel(value)),
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn document(&self) -> &RichTextDocument {
        &self.doc
    }

    pub fn selection(&self) -> Range<usize> {
        self.selection.clone()
    }

    pub fn caret(&self) -> usize {
        self.selection.end
    }

    pub fn pending(&self) -> &PendingMark {
        &self.pending
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn draft(&self) -> Option<&LinkDraft> {
        self.draft.as_ref()
    }

    /// Serialized field value. Never contains the sentinel.
    pub fn value(&self) -> String {
        match self.kind {
            FieldKind::RichText => to_html(&self.doc),
            _ => self.doc.text(),
        }
    }

    fn touch(&mut self, now_ms: u64) {
        self.dirty = true;
        self.last_edit_ms = now_ms;
    }

    // ─── Selection ───────────────────────────────────────────────────────

    /// Move the caret/selection. Leaving the armed position disarms.
    pub fn set_selection(&mut self, range: Range<usize>) {
        let (lo, hi) = if range.start <= range.end {
            (range.start, range.end)
        } else {
            (range.end, range.start)
        };
        self.selection = self.doc.clamp_range(lo..hi);
        if let PendingMark::Armed { at, .. } = self.pending
            && (at != self.selection.start || !self.selection.is_empty())
        {
            self.pending = PendingMark::None;
        }
    }

    /// Formats active at the selection, pending marks included.
    pub fn active_marks(&self) -> MarkSet {
        match &self.pending {
            PendingMark::Armed { marks, .. } => marks.clone(),
            PendingMark::None => self.doc.marks_in(self.selection.clone()),
        }
    }

    // ─── Typing ──────────────────────────────────────────────────────────

    /// Type `text` at the selection, replacing any selected text.
    pub fn type_text(&mut self, text: &str, now_ms: u64) -> Result<(), EditError> {
        let text = match self.kind {
            FieldKind::RichText => strip_sentinel(text),
            _ => strip_sentinel(text).replace('\n', " "),
        };
        if text.is_empty() {
            return Ok(());
        }
        let range = self.doc.clamp_range(self.selection.clone());
        let marks = match std::mem::take(&mut self.pending) {
            PendingMark::Armed { marks, at } if at == range.start => marks,
            _ if self.kind.supports_marks() => self.doc.marks_at(range.start),
            _ => MarkSet::new(),
        };
        self.doc.delete(range.clone())?;
        self.doc.insert(range.start, &text, marks)?;
        let caret = range.start + text.chars().count();
        self.selection = caret..caret;
        self.memo = None;
        self.touch(now_ms);
        Ok(())
    }

    /// Backspace: delete the selection, or the character before the caret.
    pub fn delete_backward(&mut self, now_ms: u64) -> Result<(), EditError> {
        let range = self.doc.clamp_range(self.selection.clone());
        let target = if range.is_empty() {
            range.start.saturating_sub(1)..range.start
        } else {
            range
        };
        self.delete_range(target, now_ms)
    }

    /// Delete key: delete the selection, or the character after the caret.
    pub fn delete_forward(&mut self, now_ms: u64) -> Result<(), EditError> {
        let range = self.doc.clamp_range(self.selection.clone());
        let target = if range.is_empty() {
            range.start..(range.start + 1).min(self.doc.len())
        } else {
            range
        };
        self.delete_range(target, now_ms)
    }

    fn delete_range(&mut self, range: Range<usize>, now_ms: u64) -> Result<(), EditError> {
        self.pending = PendingMark::None;
        if range.is_empty() {
            return Ok(());
        }
        self.doc.delete(range.clone())?;
        self.selection = range.start..range.start;
        self.memo = None;
        self.touch(now_ms);
        Ok(())
    }

    // ─── Formatting ──────────────────────────────────────────────────────

    /// Clamp a possibly stale range onto the current document.
    fn resolve(&self, range: Range<usize>) -> Range<usize> {
        if let Err(e) = self.doc.check_range(&range) {
            log::debug!("{e}; retrying against the current document");
            return self.doc.clamp_range(range);
        }
        range
    }

    /// Toggle bold or italic over the selection. A collapsed selection arms
    /// (or disarms) prospective formatting and leaves the text untouched.
    /// Returns whether the mark is now active.
    pub fn toggle_mark(&mut self, kind: MarkKind, now_ms: u64) -> Result<bool, EditError> {
        let range = self.selection.clone();
        self.toggle_mark_in(range, kind, now_ms)
    }

    /// [`toggle_mark`](Self::toggle_mark) over an explicit range, as sent
    /// by `FORMAT_APPLY`.
    pub fn toggle_mark_in(&mut self, range: Range<usize>, kind: MarkKind, now_ms: u64) -> Result<bool, EditError> {
        if !self.kind.supports_marks() {
            return Ok(false);
        }
        let mark = match kind {
            MarkKind::Bold => Mark::Bold,
            MarkKind::Italic => Mark::Italic,
            MarkKind::Link => {
                // Links need an href; toggling one off is the only toggle.
                let range = self.resolve(range);
                return self.remove_link_in(range, now_ms).map(|_| false);
            }
        };
        let range = self.resolve(range);
        if range.is_empty() {
            return Ok(self.arm(range.start, &mark));
        }

        if let Some(memo) = &self.memo
            && memo.range == range
            && memo.kind == kind
            && memo.after == self.doc
        {
            self.doc = memo.before.clone();
            self.memo = None;
            self.touch(now_ms);
            return Ok(self.doc.marks_in(range).has_kind(kind));
        }

        let before = self.doc.clone();
        let applied = self.doc.toggle_mark(range.clone(), &mark)?;
        self.memo = Some(ToggleMemo {
            range,
            kind,
            before,
            after: self.doc.clone(),
        });
        self.touch(now_ms);
        Ok(applied)
    }

    fn arm(&mut self, at: usize, mark: &Mark) -> bool {
        let current = match &self.pending {
            PendingMark::Armed { marks, at: armed } if *armed == at => marks.clone(),
            _ => self.doc.marks_at(at),
        };
        let next = current.toggled(mark);
        let active = next.has_kind(mark.kind());
        self.pending = if next == self.doc.marks_at(at) {
            // Back to the surrounding run: nothing left to anchor.
            PendingMark::None
        } else {
            PendingMark::Armed { marks: next, at }
        };
        self.selection = at..at;
        active
    }

    /// Link the selection (or the link under the caret) to `href`.
    pub fn set_link(&mut self, href: &str, now_ms: u64) -> Result<(), EditError> {
        if !self.kind.supports_marks() {
            return Ok(());
        }
        let range = self.link_target(self.selection.clone());
        if range.is_empty() {
            return Ok(());
        }
        self.doc.apply_mark(range, &Mark::link(href))?;
        self.memo = None;
        self.touch(now_ms);
        Ok(())
    }

    /// Unlink the selection (or the whole link under the caret).
    pub fn remove_link(&mut self, now_ms: u64) -> Result<(), EditError> {
        let range = self.link_target(self.selection.clone());
        self.remove_link_in(range, now_ms)
    }

    fn remove_link_in(&mut self, range: Range<usize>, now_ms: u64) -> Result<(), EditError> {
        if range.is_empty() || !self.doc.marks_in(range.clone()).has_kind(MarkKind::Link) {
            return Ok(());
        }
        self.doc.remove_mark(range, MarkKind::Link)?;
        self.memo = None;
        self.touch(now_ms);
        Ok(())
    }

    fn link_target(&self, range: Range<usize>) -> Range<usize> {
        let range = self.resolve(range);
        if range.is_empty() {
            self.link_extent(range.start).unwrap_or(range)
        } else {
            range
        }
    }

    /// Full extent of the link touching `offset`.
    pub fn link_extent(&self, offset: usize) -> Option<Range<usize>> {
        let mut spans: Vec<(Range<usize>, &str)> = Vec::new();
        let mut pos = 0;
        for run in self.doc.runs() {
            let len = run.len();
            if let Some(href) = run.marks.link_href() {
                match spans.last_mut() {
                    Some((r, h)) if r.end == pos && *h == href => r.end = pos + len,
                    _ => spans.push((pos..pos + len, href)),
                }
            }
            pos += len;
        }
        spans
            .into_iter()
            .find(|(r, _)| r.start <= offset && offset <= r.end)
            .map(|(r, _)| r)
    }

    // ─── Link / media overlay ────────────────────────────────────────────

    /// Open the link (rich text) or value (link/media field) overlay.
    pub fn open_link_editor(&mut self) -> Option<&LinkDraft> {
        let draft = match self.kind {
            FieldKind::RichText => {
                let range = self.link_target(self.selection.clone());
                if range.is_empty() {
                    return None;
                }
                let href = self
                    .doc
                    .marks_in(range.clone())
                    .link_href()
                    .unwrap_or_default()
                    .to_string();
                LinkDraft {
                    range: Some(range),
                    href,
                }
            }
            FieldKind::Link | FieldKind::Media => LinkDraft {
                range: None,
                href: self.doc.text(),
            },
            FieldKind::Text => return None,
        };
        self.draft = Some(draft);
        self.draft.as_ref()
    }

    pub fn update_link_draft(&mut self, href: &str) {
        if let Some(draft) = &mut self.draft {
            draft.href = href.to_string();
        }
    }

    /// Apply the overlay. An empty href on a rich-text range unlinks it.
    pub fn commit_link_editor(&mut self, now_ms: u64) -> Result<bool, EditError> {
        let Some(draft) = self.draft.take() else {
            return Ok(false);
        };
        match draft.range {
            Some(range) => {
                let range = self.resolve(range);
                if draft.href.is_empty() {
                    self.remove_link_in(range, now_ms)?;
                } else if !range.is_empty() {
                    self.doc.apply_mark(range, &Mark::link(draft.href))?;
                    self.memo = None;
                    self.touch(now_ms);
                }
            }
            None => {
                self.doc = RichTextDocument::plain(&draft.href);
                let end = self.doc.len();
                self.selection = end..end;
                self.touch(now_ms);
            }
        }
        Ok(true)
    }

    /// Close the overlay without touching the document.
    pub fn cancel_link_editor(&mut self) -> bool {
        self.draft.take().is_some()
    }

    // ─── Batching ────────────────────────────────────────────────────────

    /// Flush once the debounce window has passed since the last edit.
    pub fn tick(&mut self, now_ms: u64, debounce_ms: u64) -> Option<FieldFlush> {
        if self.dirty && now_ms.saturating_sub(self.last_edit_ms) >= debounce_ms {
            return self.flush();
        }
        None
    }

    /// Flush immediately (blur, selection change). The selection is left
    /// exactly where it was.
    pub fn flush(&mut self) -> Option<FieldFlush> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.batch += 1;
        Some(FieldFlush {
            block: self.block,
            field: self.field.clone(),
            value: self.value(),
            batch: self.batch,
        })
    }

    /// Take a value from another view. Ignored when older than the local
    /// batch still being typed. Returns whether it was applied.
    pub fn apply_external(&mut self, value: &str, batch: u64) -> bool {
        let local = if self.dirty { self.batch + 1 } else { self.batch };
        if batch < local {
            log::debug!(
                "ignoring stale value for {}.{} (batch {batch} < {local})",
                self.block,
                self.field
            );
            return false;
        }
        let doc = Self::decode(self.kind, value);
        self.batch = self.batch.max(batch);
        self.dirty = false;
        if doc != self.doc {
            self.doc = doc;
            self.selection = self.doc.clamp_range(self.selection.clone());
            self.pending = PendingMark::None;
            self.memo = None;
        }
        true
    }

    /// Replace the content wholesale (undo, redo). Unsent edits and an
    /// open link overlay are dropped.
    pub fn reset(&mut self, value: &str) {
        let doc = Self::decode(self.kind, value);
        if doc != self.doc {
            self.doc = doc;
            self.selection = self.doc.clamp_range(self.selection.clone());
            self.pending = PendingMark::None;
            self.memo = None;
        }
        self.dirty = false;
        self.draft = None;
    }

    // ─── Clipboard ───────────────────────────────────────────────────────

    pub fn copy_payload(&self) -> CopyPayload {
        let slice = self.doc.slice(self.selection.clone());
        CopyPayload {
            text: slice.text(),
            html: match self.kind {
                FieldKind::RichText => to_html(&slice),
                _ => bf_core::html::escape_text(&slice.text()),
            },
        }
    }

    // ─── DOM ─────────────────────────────────────────────────────────────

    /// Bring the children of `element` in line with the document. Nodes
    /// whose shape still fits are patched in place, so a keystroke only
    /// rewrites the text node it lands in.
    pub fn render(&self, dom: &mut DomTree, element: DomNodeId) {
        dom.set_attr(element, attrs::EDITING, "");
        let shapes = if !self.kind.supports_marks() {
            let text = self.doc.text();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Shape::Text(text)]
            }
        } else {
            match &self.pending {
                PendingMark::Armed { marks, at } => {
                    let at = (*at).min(self.doc.len());
                    let anchor = TextRun::new(SENTINEL.to_string(), marks.clone());
                    let before = self.doc.slice(0..at);
                    let after = self.doc.slice(at..self.doc.len());
                    before
                        .runs()
                        .iter()
                        .chain(std::iter::once(&anchor))
                        .chain(after.runs())
                        .flat_map(run_shapes)
                        .collect()
                }
                PendingMark::None => self.doc.runs().iter().flat_map(run_shapes).collect(),
            }
        };
        patch_children(dom, element, &shapes);
    }

    /// Pick up native edits made directly in the editable element, with the
    /// caret reported by the host.
    pub fn sync_from_dom(&mut self, dom: &DomTree, element: DomNodeId, caret: usize, now_ms: u64) {
        let doc = match self.kind {
            FieldKind::RichText => read_dom(dom, element),
            _ => RichTextDocument::plain(&strip_sentinel(&dom.text_content(element))),
        };
        if doc != self.doc {
            self.doc = doc;
            self.pending = PendingMark::None;
            self.memo = None;
            self.touch(now_ms);
        }
        self.selection = self.doc.clamp_range(caret..caret);
    }
}

/// What a run renders to: `a > strong > em` wrappers around text and `<br>`.
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Text(String),
    Element {
        tag: &'static str,
        href: Option<String>,
        children: Vec<Shape>,
    },
}

fn run_shapes(run: &TextRun) -> Vec<Shape> {
    let mut inner = Vec::new();
    for (i, line) in run.text.split('\n').enumerate() {
        if i > 0 {
            inner.push(Shape::Element {
                tag: "br",
                href: None,
                children: Vec::new(),
            });
        }
        if !line.is_empty() {
            inner.push(Shape::Text(line.to_string()));
        }
    }
    let wrap = |tag: &'static str, href: Option<String>, children: Vec<Shape>| {
        vec![Shape::Element {
            tag,
            href,
            children,
        }]
    };
    if run.marks.has_kind(MarkKind::Italic) {
        inner = wrap("em", None, inner);
    }
    if run.marks.has_kind(MarkKind::Bold) {
        inner = wrap("strong", None, inner);
    }
    if let Some(href) = run.marks.link_href() {
        inner = wrap("a", Some(href.to_string()), inner);
    }
    inner
}

/// Reconcile the children of `parent` with `shapes` position by position.
/// A child of the right kind is reused; anything else is replaced, and
/// surplus children are removed.
fn patch_children(dom: &mut DomTree, parent: DomNodeId, shapes: &[Shape]) {
    for (i, shape) in shapes.iter().enumerate() {
        let existing = dom.children(parent).get(i).copied();
        match existing {
            Some(node) if fits(dom, node, shape) => patch_node(dom, node, shape),
            Some(node) => {
                build(dom, parent, Some(node), shape);
                dom.remove(node);
            }
            None => build(dom, parent, None, shape),
        }
    }
    let surplus: Vec<DomNodeId> = dom
        .children(parent)
        .iter()
        .skip(shapes.len())
        .copied()
        .collect();
    for node in surplus {
        dom.remove(node);
    }
}

fn fits(dom: &DomTree, node: DomNodeId, shape: &Shape) -> bool {
    match shape {
        Shape::Text(_) => dom.text(node).is_some(),
        Shape::Element { tag, .. } => dom.tag(node) == Some(*tag),
    }
}

fn patch_node(dom: &mut DomTree, node: DomNodeId, shape: &Shape) {
    match shape {
        Shape::Text(text) => {
            if dom.text(node) != Some(text.as_str()) {
                dom.set_text(node, text);
            }
        }
        Shape::Element { href, children, .. } => {
            if let Some(href) = href
                && dom.attr(node, "href") != Some(href.as_str())
            {
                dom.set_attr(node, "href", href);
            }
            patch_children(dom, node, children);
        }
    }
}

fn build(dom: &mut DomTree, parent: DomNodeId, before: Option<DomNodeId>, shape: &Shape) {
    match shape {
        Shape::Text(text) => {
            dom.insert_text_before(parent, before, text);
        }
        Shape::Element {
            tag,
            href,
            children,
        } => {
            let attrs: Vec<(&str, &str)> = href.as_deref().map(|h| ("href", h)).into_iter().collect();
            if let Some(node) = dom.insert_element_before(parent, before, tag, &attrs) {
                for child in children {
                    build(dom, node, None, child);
                }
            }
        }
    }
}

/// Bring an element's children in line with the runs of `doc`.
pub fn write_dom(dom: &mut DomTree, element: DomNodeId, doc: &RichTextDocument) {
    let shapes: Vec<Shape> = doc.runs().iter().flat_map(run_shapes).collect();
    patch_children(dom, element, &shapes);
}

/// Read an editable element's children back into a document.
pub fn read_dom(dom: &DomTree, element: DomNodeId) -> RichTextDocument {
    let mut runs = Vec::new();
    for &child in dom.children(element) {
        collect_runs(dom, child, &MarkSet::new(), &mut runs);
    }
    RichTextDocument::from_runs(runs)
}

fn collect_runs(dom: &DomTree, node: DomNodeId, marks: &MarkSet, runs: &mut Vec<TextRun>) {
    let Some(content) = dom.node(node).map(|n| &n.content) else {
        return;
    };
    match content {
        DomContent::Text(text) => runs.push(TextRun::new(text.clone(), marks.clone())),
        DomContent::Element { tag, .. } => {
            let mut inner = marks.clone();
            match tag.as_str() {
                "br" => {
                    runs.push(TextRun::new("\n", marks.clone()));
                    return;
                }
                "strong" | "b" => inner.insert(Mark::Bold),
                "em" | "i" => inner.insert(Mark::Italic),
                "a" => {
                    if let Some(href) = dom.attr(node, "href") {
                        inner.insert(Mark::link(href));
                    }
                }
                _ => {}
            }
            for &child in dom.children(node) {
                collect_runs(dom, child, &inner, runs);
            }
        }
    }
}

/// Whether a click on `target` should not follow a link: only inside the
/// block currently being edited.
pub fn suppress_link_navigation(dom: &DomTree, target: DomNodeId, editing: Option<BlockId>) -> bool {
    let Some(editing) = editing else {
        return false;
    };
    let mut cur = Some(target);
    let mut in_link = false;
    while let Some(node) = cur {
        if dom.tag(node) == Some("a") {
            in_link = true;
        }
        if let Some(uid) = dom.attr(node, attrs::BLOCK_UID) {
            return in_link && BlockId::intern(uid) == editing;
        }
        cur = dom.parent(node);
    }
    false
}

// ─── Registry ────────────────────────────────────────────────────────────

/// Sessions for the currently mounted field editors, keyed by block and
/// field. Owned by the frame runtime; lifetimes follow focus.
#[derive(Debug, Default)]
pub struct EditorRegistry {
    sessions: HashMap<(BlockId, String), InlineSession>,
}

impl EditorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a session, reusing one that is already open.
    pub fn open(&mut self, block: BlockId, field: &str, kind: FieldKind, value: &str) -> &mut InlineSession {
        self.open_at(block, field, kind, value, 0)
    }

    /// Mount a session whose batches continue after `batch`.
    pub fn open_at(
        &mut self,
        block: BlockId,
        field: &str,
        kind: FieldKind,
        value: &str,
        batch: u64,
    ) -> &mut InlineSession {
        self.sessions
            .entry((block, field.to_string()))
            .or_insert_with(|| InlineSession::new(block, field, kind, value).with_batch(batch))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InlineSession> {
        self.sessions.values_mut()
    }

    pub fn get(&self, block: BlockId, field: &str) -> Option<&InlineSession> {
        self.sessions.get(&(block, field.to_string()))
    }

    pub fn get_mut(&mut self, block: BlockId, field: &str) -> Option<&mut InlineSession> {
        self.sessions.get_mut(&(block, field.to_string()))
    }

    /// Unmount a session, returning its unsent edits.
    pub fn close(&mut self, block: BlockId, field: &str) -> Option<FieldFlush> {
        self.sessions
            .remove(&(block, field.to_string()))
            .and_then(|mut s| s.flush())
    }

    /// Unmount everything, returning all unsent edits.
    pub fn close_all(&mut self) -> Vec<FieldFlush> {
        self.sessions
            .drain()
            .filter_map(|(_, mut s)| s.flush())
            .collect()
    }

    /// Drop sessions whose block no longer exists. Unsent edits are lost
    /// with the block.
    pub fn retain_blocks(&mut self, mut exists: impl FnMut(BlockId) -> bool) {
        self.sessions.retain(|(block, _), _| exists(*block));
    }

    pub fn tick(&mut self, now_ms: u64, debounce_ms: u64) -> Vec<FieldFlush> {
        self.sessions
            .values_mut()
            .filter_map(|s| s.tick(now_ms, debounce_ms))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(html: &str) -> InlineSession {
        InlineSession::new(BlockId::intern("t_block"), "value", FieldKind::RichText, html)
    }

    #[test]
    fn bold_then_unbold_restores_plain_text() {
        let mut s = session("Hello world");
        s.set_selection(6..11);
        assert!(s.toggle_mark(MarkKind::Bold, 10).unwrap());
        assert_eq!(s.value(), "Hello <strong>world</strong>");
        assert!(!s.toggle_mark(MarkKind::Bold, 20).unwrap());
        assert_eq!(s.value(), "Hello world");
        assert_eq!(s.document().text(), "Hello world");
    }

    #[test]
    fn toggle_back_after_split_restores_runs() {
        let mut s = session("ab <em>cd</em> ef");
        let before = s.document().clone();
        s.set_selection(1..5);
        s.toggle_mark(MarkKind::Bold, 0).unwrap();
        // The toggle split runs at 1 and 5; toggling back still restores.
        s.toggle_mark(MarkKind::Bold, 0).unwrap();
        assert_eq!(s.document(), &before);
    }

    #[test]
    fn stale_range_is_clamped() {
        let mut s = session("short");
        assert!(s.toggle_mark_in(2..50, MarkKind::Italic, 0).unwrap());
        assert_eq!(s.value(), "sh<em>ort</em>");
    }

    #[test]
    fn prospective_bold_only_affects_new_text() {
        let mut s = session("Hello world");
        s.set_selection(5..5);
        assert!(s.toggle_mark(MarkKind::Bold, 0).unwrap());
        assert_eq!(s.value(), "Hello world");
        assert!(matches!(s.pending(), PendingMark::Armed { at: 5, .. }));
        s.type_text(" big", 1).unwrap();
        assert_eq!(s.value(), "Hello<strong> big</strong> world");
        assert_eq!(s.caret(), 9);
        assert_eq!(s.pending(), &PendingMark::None);
    }

    #[test]
    fn arm_disarm_cycles_keep_text() {
        let mut s = session("left right");
        s.set_selection(4..4);
        for _ in 0..3 {
            s.toggle_mark(MarkKind::Bold, 0).unwrap();
            s.toggle_mark(MarkKind::Bold, 0).unwrap();
        }
        assert_eq!(s.pending(), &PendingMark::None);
        s.toggle_mark(MarkKind::Italic, 0).unwrap();
        s.type_text("X", 0).unwrap();
        s.toggle_mark(MarkKind::Italic, 0).unwrap();
        s.type_text("y", 0).unwrap();
        assert_eq!(s.document().text(), "leftXy right");
        assert_eq!(s.value(), "left<em>X</em>y right");
    }

    #[test]
    fn sentinel_only_lives_in_the_dom() {
        let mut s = session("ab");
        s.set_selection(1..1);
        s.toggle_mark(MarkKind::Bold, 0).unwrap();

        let mut dom = DomTree::new();
        let p = dom.append_element(dom.root(), "p", &[]).unwrap();
        s.render(&mut dom, p);
        assert!(dom.text_content(p).contains(SENTINEL));
        assert!(!s.value().contains(SENTINEL));
        assert!(!s.copy_payload().text.contains(SENTINEL));
        assert_eq!(read_dom(&dom, p).text(), "ab");
    }

    #[test]
    fn typing_inside_the_sentinel_anchor_inherits_pending_marks() {
        let mut s = session("ab");
        s.set_selection(1..1);
        s.toggle_mark(MarkKind::Bold, 0).unwrap();
        let mut dom = DomTree::new();
        let p = dom.append_element(dom.root(), "p", &[]).unwrap();
        s.render(&mut dom, p);

        // The host types into the anchor's text node.
        let strong = dom.children(p)[1];
        let text = dom.children(strong)[0];
        dom.set_text(text, &format!("{SENTINEL}Z"));
        s.sync_from_dom(&dom, p, 2, 5);
        assert_eq!(s.value(), "a<strong>Z</strong>b");
        assert_eq!(s.caret(), 2);
    }

    #[test]
    fn render_keeps_the_element() {
        let mut s = session("x");
        let mut dom = DomTree::new();
        let p = dom.append_element(dom.root(), "p", &[("data-edit-richtext", "value")]).unwrap();
        s.render(&mut dom, p);
        s.set_selection(1..1);
        s.type_text("y", 0).unwrap();
        s.render(&mut dom, p);
        assert!(dom.is_attached(p));
        assert_eq!(dom.text_content(p), "xy");
        assert!(dom.has_attr(p, attrs::EDITING));
    }

    #[test]
    fn keystrokes_patch_text_nodes_in_place() {
        let mut s = session("a<strong>b</strong>c");
        let mut dom = DomTree::new();
        let p = dom.append_element(dom.root(), "p", &[]).unwrap();
        s.render(&mut dom, p);
        let children = dom.children(p).to_vec();
        let tail = children[2];
        let arena = dom.len();

        s.set_selection(3..3);
        for i in 0..200 {
            s.type_text("x", i).unwrap();
            s.render(&mut dom, p);
        }
        assert_eq!(dom.children(p), children.as_slice());
        assert_eq!(dom.text(tail), Some(format!("c{}", "x".repeat(200)).as_str()));
        assert_eq!(dom.len(), arena);
    }

    #[test]
    fn formatting_patches_the_changed_runs() {
        let mut s = session("Hello world");
        let mut dom = DomTree::new();
        let p = dom.append_element(dom.root(), "p", &[]).unwrap();
        s.render(&mut dom, p);

        s.set_selection(6..11);
        s.toggle_mark(MarkKind::Bold, 0).unwrap();
        s.render(&mut dom, p);
        let head = dom.children(p)[0];
        assert_eq!(dom.text(head), Some("Hello "));
        assert_eq!(dom.tag(dom.children(p)[1]), Some("strong"));
        assert_eq!(read_dom(&dom, p), *s.document());

        s.toggle_mark(MarkKind::Bold, 0).unwrap();
        s.render(&mut dom, p);
        assert_eq!(dom.children(p), &[head]);
        assert_eq!(dom.text_content(p), "Hello world");
    }

    #[test]
    fn cross_boundary_delete_merges_runs() {
        let mut s = session("a<strong>bc</strong>d<em>ef</em>");
        s.set_selection(2..5);
        s.delete_backward(0).unwrap();
        assert_eq!(s.value(), "a<strong>b</strong><em>f</em>");
        assert!(s.document().runs().iter().all(|r| !r.is_empty()));
    }

    #[test]
    fn batching_keeps_caret_and_numbers_batches() {
        let mut s = session("");
        s.type_text("abc", 100).unwrap();
        assert_eq!(s.tick(200, 300), None);
        let flush = s.tick(400, 300).unwrap();
        assert_eq!(flush.value, "abc");
        assert_eq!(flush.batch, 1);
        assert_eq!(s.caret(), 3);
        assert!(!s.is_dirty());
    }

    #[test]
    fn external_values_respect_batches() {
        let mut s = session("local");
        s.type_text("!", 0).unwrap();
        // Local unflushed batch is 1; an external batch 0 is stale.
        assert!(!s.apply_external("remote", 0));
        assert_eq!(s.document().text(), "local!");
        assert!(s.apply_external("remote", 1));
        assert_eq!(s.document().text(), "remote");
        assert_eq!(s.batch(), 1);
        assert!(!s.is_dirty());
    }

    #[test]
    fn link_overlay_commit_and_cancel() {
        let mut s = session("see docs");
        s.set_selection(4..8);
        let draft = s.open_link_editor().unwrap().clone();
        assert_eq!(draft.href, "");
        s.update_link_draft("/docs");
        assert!(s.cancel_link_editor());
        assert_eq!(s.value(), "see docs");
        assert!(!s.is_dirty());

        s.open_link_editor();
        s.update_link_draft("/docs");
        s.commit_link_editor(0).unwrap();
        assert_eq!(s.value(), "see <a href=\"/docs\">docs</a>");

        s.set_selection(6..6);
        assert_eq!(s.link_extent(6), Some(4..8));
        s.remove_link(0).unwrap();
        assert_eq!(s.value(), "see docs");
    }

    #[test]
    fn copy_payload_has_text_and_html() {
        let mut s = session("a <strong>bold</strong> move");
        s.set_selection(2..6);
        assert_eq!(
            s.copy_payload(),
            CopyPayload {
                text: "bold".into(),
                html: "<strong>bold</strong>".into(),
            }
        );
    }

    #[test]
    fn plain_text_fields_ignore_marks() {
        let mut s = InlineSession::new(BlockId::intern("t_title"), "title", FieldKind::Text, "Title");
        s.set_selection(0..5);
        assert!(!s.toggle_mark(MarkKind::Bold, 0).unwrap());
        s.type_text("New\ntitle", 0).unwrap();
        assert_eq!(s.value(), "New title");
    }

    #[test]
    fn link_navigation_is_suppressed_only_in_the_edited_block() {
        let mut dom = DomTree::new();
        let a_block = dom.append_element(dom.root(), "div", &[("data-block-uid", "t_a")]).unwrap();
        let link = dom.append_element(a_block, "a", &[("href", "/x")]).unwrap();
        let text = dom.append_text(link, "x").unwrap();
        assert!(suppress_link_navigation(&dom, text, Some(BlockId::intern("t_a"))));
        assert!(!suppress_link_navigation(&dom, text, Some(BlockId::intern("t_b"))));
        assert!(!suppress_link_navigation(&dom, text, None));
    }

    #[test]
    fn registry_flushes_on_close() {
        let mut reg = EditorRegistry::new();
        let block = BlockId::intern("t_reg");
        reg.open(block, "value", FieldKind::RichText, "x")
            .type_text("y", 0)
            .unwrap();
        let flush = reg.close(block, "value").unwrap();
        assert_eq!(flush.value, "xy");
        assert!(reg.is_empty());
    }
}
