//! Rich-text document model for a single editable field.
//!
//! A document is an ordered list of `TextRun`s, each carrying a set of
//! marks from a small closed set (bold, italic, link). Documents are kept
//! in canonical form at all times: no empty runs, no two adjacent runs with
//! the same mark set, and no sentinel characters. Because the form is
//! canonical, any sequence of edits that produces the same text with the
//! same marks produces the same run structure.
//!
//! All offsets are visible-character offsets (Unicode scalar values).

use crate::error::EditError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::ops::Range;

/// Zero-width caret anchor used for prospective formatting. It only ever
/// exists in the rendered DOM; the model strips it on every entry path.
pub const SENTINEL: char = '\u{200B}';

/// Remove every sentinel from `text`.
pub fn strip_sentinel(text: &str) -> String {
    text.chars().filter(|&c| c != SENTINEL).collect()
}

// ─── Marks ───────────────────────────────────────────────────────────────

/// A formatting mark. Derived ordering is the canonical nesting order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mark {
    Bold,
    Italic,
    Link { href: String },
}

/// Mark identity without payload, used for toggling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkKind {
    Bold,
    Italic,
    Link,
}

impl Mark {
    pub fn kind(&self) -> MarkKind {
        match self {
            Mark::Bold => MarkKind::Bold,
            Mark::Italic => MarkKind::Italic,
            Mark::Link { .. } => MarkKind::Link,
        }
    }

    pub fn link(href: impl Into<String>) -> Self {
        Mark::Link { href: href.into() }
    }
}

/// Sorted, duplicate-free set of marks with at most one link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkSet(SmallVec<[Mark; 2]>);

impl MarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_marks(marks: impl IntoIterator<Item = Mark>) -> Self {
        let mut set = Self::new();
        for mark in marks {
            set.insert(mark);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mark> {
        self.0.iter()
    }

    pub fn contains(&self, mark: &Mark) -> bool {
        self.0.contains(mark)
    }

    pub fn has_kind(&self, kind: MarkKind) -> bool {
        self.0.iter().any(|m| m.kind() == kind)
    }

    pub fn link_href(&self) -> Option<&str> {
        self.0.iter().find_map(|m| match m {
            Mark::Link { href } => Some(href.as_str()),
            _ => None,
        })
    }

    /// Insert a mark. A new link replaces any existing link.
    pub fn insert(&mut self, mark: Mark) {
        self.remove_kind(mark.kind());
        let pos = self.0.iter().position(|m| *m > mark).unwrap_or(self.0.len());
        self.0.insert(pos, mark);
    }

    pub fn remove_kind(&mut self, kind: MarkKind) {
        self.0.retain(|m| m.kind() != kind);
    }

    /// Set with `mark` flipped: removed if its kind is present, else added.
    pub fn toggled(&self, mark: &Mark) -> Self {
        let mut out = self.clone();
        if out.has_kind(mark.kind()) {
            out.remove_kind(mark.kind());
        } else {
            out.insert(mark.clone());
        }
        out
    }

    /// Marks present in both sets.
    pub fn intersect(&self, other: &MarkSet) -> MarkSet {
        MarkSet(self.0.iter().filter(|m| other.contains(m)).cloned().collect())
    }

    pub fn kinds(&self) -> Vec<MarkKind> {
        self.0.iter().map(Mark::kind).collect()
    }
}

// ─── Runs & document ─────────────────────────────────────────────────────

/// A maximal stretch of text sharing one mark set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub marks: MarkSet,
}

impl TextRun {
    pub fn new(text: impl Into<String>, marks: MarkSet) -> Self {
        Self {
            text: text.into(),
            marks,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, MarkSet::new())
    }

    /// Length in visible characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Byte index of the `n`th char of `s` (or `s.len()` past the end).
fn byte_at(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(b, _)| b).unwrap_or(s.len())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTextDocument {
    runs: Vec<TextRun>,
}

impl RichTextDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain(text: &str) -> Self {
        Self::from_runs(vec![TextRun::plain(text)])
    }

    /// Build from arbitrary runs, bringing them into canonical form.
    pub fn from_runs(runs: Vec<TextRun>) -> Self {
        let mut doc = Self { runs };
        doc.normalize();
        doc
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    /// Visible text: the concatenation of all run texts.
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }

    /// Length in visible characters.
    pub fn len(&self) -> usize {
        self.runs.iter().map(TextRun::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Restore canonical form: strip sentinels, drop empty runs, merge
    /// neighbours with equal mark sets.
    fn normalize(&mut self) {
        let mut out: Vec<TextRun> = Vec::with_capacity(self.runs.len());
        for mut run in self.runs.drain(..) {
            if run.text.contains(SENTINEL) {
                run.text = strip_sentinel(&run.text);
            }
            if run.text.is_empty() {
                continue;
            }
            match out.last_mut() {
                Some(prev) if prev.marks == run.marks => prev.text.push_str(&run.text),
                _ => out.push(run),
            }
        }
        self.runs = out;
    }

    /// Ensure a run boundary at `offset`; returns the index of the first
    /// run starting at or after it. Leaves the document non-canonical until
    /// the caller normalizes.
    fn split_at(&mut self, offset: usize) -> usize {
        let mut pos = 0;
        for i in 0..self.runs.len() {
            if offset == pos {
                return i;
            }
            let len = self.runs[i].len();
            if offset < pos + len {
                let byte = byte_at(&self.runs[i].text, offset - pos);
                let tail = self.runs[i].text.split_off(byte);
                let marks = self.runs[i].marks.clone();
                self.runs.insert(i + 1, TextRun::new(tail, marks));
                return i + 1;
            }
            pos += len;
        }
        self.runs.len()
    }

    /// Validate a range against the current shape.
    pub fn check_range(&self, range: &Range<usize>) -> Result<(), EditError> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(EditError::FormattingPath {
                start: range.start,
                end: range.end,
                len,
            });
        }
        Ok(())
    }

    /// Clamp a (possibly stale) range onto the current shape.
    pub fn clamp_range(&self, range: Range<usize>) -> Range<usize> {
        let len = self.len();
        let start = range.start.min(len);
        let end = range.end.clamp(start, len);
        start..end
    }

    /// Marks that apply at a collapsed caret: those of the character
    /// before it, or of the first character at offset 0.
    pub fn marks_at(&self, offset: usize) -> MarkSet {
        let probe = if offset == 0 { 0 } else { offset - 1 };
        let mut pos = 0;
        for run in &self.runs {
            let len = run.len();
            if probe < pos + len {
                return run.marks.clone();
            }
            pos += len;
        }
        self.runs.last().map(|r| r.marks.clone()).unwrap_or_default()
    }

    /// Marks shared by every character of `range` (the "active" formats).
    pub fn marks_in(&self, range: Range<usize>) -> MarkSet {
        if range.start >= range.end {
            return self.marks_at(range.start);
        }
        let mut common: Option<MarkSet> = None;
        let mut pos = 0;
        for run in &self.runs {
            let len = run.len();
            if pos < range.end && pos + len > range.start {
                common = Some(match common {
                    None => run.marks.clone(),
                    Some(c) => c.intersect(&run.marks),
                });
            }
            pos += len;
        }
        common.unwrap_or_default()
    }

    /// Copy of the runs covering `range`.
    pub fn slice(&self, range: Range<usize>) -> RichTextDocument {
        let range = self.clamp_range(range);
        let mut copy = self.clone();
        let end = copy.split_at(range.end);
        copy.runs.truncate(end);
        let start = copy.split_at(range.start);
        copy.runs.drain(..start);
        copy.normalize();
        copy
    }

    fn map_marks(&mut self, range: Range<usize>, mut f: impl FnMut(&mut MarkSet)) {
        let start = self.split_at(range.start);
        let end = self.split_at(range.end);
        for run in &mut self.runs[start..end] {
            f(&mut run.marks);
        }
        self.normalize();
    }

    pub fn apply_mark(&mut self, range: Range<usize>, mark: &Mark) -> Result<(), EditError> {
        self.check_range(&range)?;
        self.map_marks(range, |m| m.insert(mark.clone()));
        Ok(())
    }

    pub fn remove_mark(&mut self, range: Range<usize>, kind: MarkKind) -> Result<(), EditError> {
        self.check_range(&range)?;
        self.map_marks(range, |m| m.remove_kind(kind));
        Ok(())
    }

    /// Toggle `mark` over `range`: removed when every character already
    /// carries its kind, applied otherwise. Returns whether it was applied.
    pub fn toggle_mark(&mut self, range: Range<usize>, mark: &Mark) -> Result<bool, EditError> {
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(false);
        }
        let covered = self.marks_in(range.clone()).has_kind(mark.kind());
        if covered {
            self.remove_mark(range, mark.kind())?;
        } else {
            self.apply_mark(range, mark)?;
        }
        Ok(!covered)
    }

    /// Insert `text` at `offset` with the given marks.
    pub fn insert(&mut self, offset: usize, text: &str, marks: MarkSet) -> Result<(), EditError> {
        self.check_range(&(offset..offset))?;
        let text = strip_sentinel(text);
        if text.is_empty() {
            return Ok(());
        }
        let at = self.split_at(offset);
        self.runs.insert(at, TextRun::new(text, marks));
        self.normalize();
        Ok(())
    }

    /// Delete the characters in `range`, merging what remains.
    pub fn delete(&mut self, range: Range<usize>) -> Result<(), EditError> {
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        let start = self.split_at(range.start);
        let end = self.split_at(range.end);
        self.runs.drain(start..end);
        self.normalize();
        Ok(())
    }

    /// Replace `range` with the runs of `other`.
    pub fn splice(&mut self, range: Range<usize>, other: &RichTextDocument) -> Result<(), EditError> {
        self.check_range(&range)?;
        let start = self.split_at(range.start);
        let end = self.split_at(range.end);
        self.runs.splice(start..end, other.runs.iter().cloned());
        self.normalize();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bold() -> MarkSet {
        MarkSet::from_marks([Mark::Bold])
    }

    #[test]
    fn canonical_form_merges_and_drops() {
        let doc = RichTextDocument::from_runs(vec![
            TextRun::plain("Hel"),
            TextRun::plain(""),
            TextRun::plain("lo"),
            TextRun::new("\u{200B}", bold()),
        ]);
        assert_eq!(doc.runs(), &[TextRun::plain("Hello")]);
    }

    #[test]
    fn bold_then_unbold_restores_runs() {
        let mut doc = RichTextDocument::plain("Hello world");
        let original = doc.clone();
        assert!(doc.toggle_mark(6..11, &Mark::Bold).unwrap());
        assert_eq!(
            doc.runs(),
            &[TextRun::plain("Hello "), TextRun::new("world", bold())]
        );
        assert!(!doc.toggle_mark(6..11, &Mark::Bold).unwrap());
        assert_eq!(doc, original);
        assert_eq!(doc.text(), "Hello world");
    }

    #[test]
    fn mark_set_keeps_canonical_order_and_single_link() {
        let mut set = MarkSet::new();
        set.insert(Mark::link("/a"));
        set.insert(Mark::Italic);
        set.insert(Mark::Bold);
        set.insert(Mark::link("/b"));
        let marks: Vec<_> = set.iter().cloned().collect();
        assert_eq!(marks, vec![Mark::Bold, Mark::Italic, Mark::link("/b")]);
    }

    #[test]
    fn delete_across_mark_boundary_merges() {
        let mut doc = RichTextDocument::from_runs(vec![
            TextRun::plain("ab"),
            TextRun::new("cd", bold()),
            TextRun::plain("ef"),
        ]);
        doc.delete(1..5).unwrap();
        assert_eq!(doc.runs(), &[TextRun::plain("af")]);

        let mut doc = RichTextDocument::from_runs(vec![
            TextRun::plain("ab"),
            TextRun::new("cd", bold()),
            TextRun::plain("ef"),
        ]);
        doc.delete(1..3).unwrap();
        assert_eq!(
            doc.runs(),
            &[
                TextRun::plain("a"),
                TextRun::new("d", bold()),
                TextRun::plain("ef")
            ]
        );
    }

    #[test]
    fn insert_strips_sentinel_and_merges() {
        let mut doc = RichTextDocument::plain("ac");
        doc.insert(1, "\u{200B}b", MarkSet::new()).unwrap();
        assert_eq!(doc.runs(), &[TextRun::plain("abc")]);
    }

    #[test]
    fn offsets_are_characters_not_bytes() {
        let mut doc = RichTextDocument::plain("héllo wörld");
        doc.apply_mark(6..11, &Mark::Italic).unwrap();
        assert_eq!(doc.runs()[1].text, "wörld");
        assert_eq!(doc.len(), 11);
    }

    #[test]
    fn stale_range_is_reported() {
        let mut doc = RichTextDocument::plain("short");
        let err = doc.apply_mark(2..40, &Mark::Bold).unwrap_err();
        assert!(matches!(err, EditError::FormattingPath { len: 5, .. }));
        assert_eq!(doc.clamp_range(2..40), 2..5);
    }

    #[test]
    fn marks_in_is_the_intersection() {
        let doc = RichTextDocument::from_runs(vec![
            TextRun::new("ab", MarkSet::from_marks([Mark::Bold, Mark::Italic])),
            TextRun::new("cd", bold()),
        ]);
        assert_eq!(doc.marks_in(0..4), bold());
        assert_eq!(doc.marks_at(3), bold());
        assert!(doc.marks_at(1).has_kind(MarkKind::Italic));
    }

    #[test]
    fn slice_copies_partial_runs() {
        let doc = RichTextDocument::from_runs(vec![
            TextRun::plain("Hello "),
            TextRun::new("world", bold()),
        ]);
        let part = doc.slice(4..8);
        assert_eq!(
            part.runs(),
            &[TextRun::plain("o "), TextRun::new("wo", bold())]
        );
    }
}
