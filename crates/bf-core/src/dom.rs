//! Minimal model of the rendered frame's DOM.
//!
//! The frame host mirrors the real document into a `DomTree` (tags,
//! attributes, text and layout rects). The annotator reads it, the overlay
//! layer appends to it, and the inline editor patches the children of
//! editable regions in place. Node ids are arena indices and stay valid for
//! the lifetime of the tree; detached nodes are never reused.

use kurbo::Rect;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Arena index of a DOM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomNodeId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum DomContent {
    Element {
        tag: String,
        attrs: SmallVec<[(String, String); 4]>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct DomNode {
    pub content: DomContent,
    pub parent: Option<DomNodeId>,
    pub children: Vec<DomNodeId>,
    /// Layout box in frame document coordinates, when known.
    pub rect: Option<Rect>,
    attached: bool,
}

#[derive(Debug, Clone)]
pub struct DomTree {
    nodes: Vec<DomNode>,
    root: DomNodeId,
}

impl DomTree {
    /// A tree holding a single `<body>` element.
    pub fn new() -> Self {
        let body = DomNode {
            content: DomContent::Element {
                tag: "body".into(),
                attrs: SmallVec::new(),
            },
            parent: None,
            children: Vec::new(),
            rect: None,
            attached: true,
        };
        Self {
            nodes: vec![body],
            root: DomNodeId(0),
        }
    }

    pub fn root(&self) -> DomNodeId {
        self.root
    }

    pub fn node(&self, id: DomNodeId) -> Option<&DomNode> {
        self.nodes.get(id.0)
    }

    /// Whether `id` is still connected to the tree.
    pub fn is_attached(&self, id: DomNodeId) -> bool {
        self.node(id).is_some_and(|n| n.attached)
    }

    /// `None` when `parent` is not a node of this tree. A `before` that is
    /// not a child of `parent` appends.
    fn push_node(
        &mut self,
        parent: DomNodeId,
        content: DomContent,
        before: Option<DomNodeId>,
    ) -> Option<DomNodeId> {
        let id = DomNodeId(self.nodes.len());
        let attached = self.is_attached(parent);
        let siblings = &mut self.nodes.get_mut(parent.0)?.children;
        let slot = before
            .and_then(|b| siblings.iter().position(|&c| c == b))
            .unwrap_or(siblings.len());
        siblings.insert(slot, id);
        self.nodes.push(DomNode {
            content,
            parent: Some(parent),
            children: Vec::new(),
            rect: None,
            attached,
        });
        Some(id)
    }

    fn element(tag: &str, attrs: &[(&str, &str)]) -> DomContent {
        DomContent::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Append an element under `parent`.
    pub fn append_element(
        &mut self,
        parent: DomNodeId,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> Option<DomNodeId> {
        self.push_node(parent, Self::element(tag, attrs), None)
    }

    /// Insert an element under `parent`, before sibling `before` (appended
    /// when `None`).
    pub fn insert_element_before(
        &mut self,
        parent: DomNodeId,
        before: Option<DomNodeId>,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> Option<DomNodeId> {
        self.push_node(parent, Self::element(tag, attrs), before)
    }

    pub fn append_text(&mut self, parent: DomNodeId, text: &str) -> Option<DomNodeId> {
        self.push_node(parent, DomContent::Text(text.to_string()), None)
    }

    pub fn insert_text_before(
        &mut self,
        parent: DomNodeId,
        before: Option<DomNodeId>,
        text: &str,
    ) -> Option<DomNodeId> {
        self.push_node(parent, DomContent::Text(text.to_string()), before)
    }

    /// Arena size, detached nodes included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tag(&self, id: DomNodeId) -> Option<&str> {
        match &self.node(id)?.content {
            DomContent::Element { tag, .. } => Some(tag),
            DomContent::Text(_) => None,
        }
    }

    pub fn attr(&self, id: DomNodeId, name: &str) -> Option<&str> {
        match &self.node(id)?.content {
            DomContent::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            DomContent::Text(_) => None,
        }
    }

    pub fn has_attr(&self, id: DomNodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn set_attr(&mut self, id: DomNodeId, name: &str, value: &str) {
        if let Some(DomContent::Element { attrs, .. }) =
            self.nodes.get_mut(id.0).map(|n| &mut n.content)
        {
            match attrs.iter_mut().find(|(k, _)| k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, id: DomNodeId, name: &str) {
        if let Some(DomContent::Element { attrs, .. }) =
            self.nodes.get_mut(id.0).map(|n| &mut n.content)
        {
            attrs.retain(|(k, _)| k != name);
        }
    }

    pub fn children(&self, id: DomNodeId) -> &[DomNodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: DomNodeId) -> Option<DomNodeId> {
        self.node(id)?.parent
    }

    pub fn text(&self, id: DomNodeId) -> Option<&str> {
        match &self.node(id)?.content {
            DomContent::Text(t) => Some(t),
            DomContent::Element { .. } => None,
        }
    }

    pub fn set_text(&mut self, id: DomNodeId, text: &str) {
        if let Some(DomContent::Text(t)) = self.nodes.get_mut(id.0).map(|n| &mut n.content) {
            *t = text.to_string();
        }
    }

    /// Concatenated text of every descendant text node.
    pub fn text_content(&self, id: DomNodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: DomNodeId, out: &mut String) {
        match self.node(id).map(|n| &n.content) {
            Some(DomContent::Text(t)) => out.push_str(t),
            Some(DomContent::Element { .. }) => {
                for &child in self.children(id) {
                    self.collect_text(child, out);
                }
            }
            None => {}
        }
    }

    pub fn rect(&self, id: DomNodeId) -> Option<Rect> {
        self.node(id)?.rect
    }

    pub fn set_rect(&mut self, id: DomNodeId, rect: Rect) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.rect = Some(rect);
        }
    }

    /// Remove `id` (and its subtree) from its parent.
    pub fn remove(&mut self, id: DomNodeId) {
        if let Some(parent) = self.parent(id)
            && let Some(p) = self.nodes.get_mut(parent.0)
        {
            p.children.retain(|&c| c != id);
        }
        self.detach_subtree(id);
    }

    fn detach_subtree(&mut self, id: DomNodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(next.0) {
                node.attached = false;
                stack.extend(node.children.iter().copied());
            }
        }
    }

    /// Whether `ancestor` contains `id` (strictly).
    pub fn is_descendant_of(&self, id: DomNodeId, ancestor: DomNodeId) -> bool {
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    /// Closest inclusive ancestor of `id` carrying attribute `name`.
    pub fn closest_with_attr(&self, id: DomNodeId, name: &str) -> Option<DomNodeId> {
        let mut cur = Some(id);
        while let Some(node) = cur {
            if self.has_attr(node, name) {
                return Some(node);
            }
            cur = self.parent(node);
        }
        None
    }

    /// First attached element with `name="value"`, in document order.
    pub fn find_by_attr(&self, name: &str, value: &str) -> Option<DomNodeId> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if self.attr(id, name) == Some(value) {
                return Some(id);
            }
            stack.extend(self.children(id).iter().rev().copied());
        }
        None
    }

    /// Build a tree from a host snapshot of `<body>`.
    pub fn from_snapshot(snapshot: &DomSnapshot) -> Self {
        let mut tree = Self::new();
        let root = tree.root;
        if let DomContent::Element { attrs, .. } = &mut tree.nodes[0].content {
            attrs.extend(snapshot.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tree.nodes[0].rect = snapshot.rect.map(|r| r.into());
        for child in &snapshot.children {
            tree.load_snapshot(root, child);
        }
        tree
    }

    fn load_snapshot(&mut self, parent: DomNodeId, snap: &DomSnapshot) {
        let loaded = match &snap.text {
            Some(text) => self.append_text(parent, text),
            None => {
                let attrs: Vec<(&str, &str)> = snap
                    .attrs
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                self.append_element(parent, &snap.tag, &attrs)
            }
        };
        let Some(id) = loaded else {
            return;
        };
        if let Some(rect) = snap.rect {
            self.set_rect(id, rect.into());
        }
        for child in &snap.children {
            self.load_snapshot(id, child);
        }
    }
}

impl Default for DomTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable DOM description sent by JavaScript hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomSnapshot {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Set for text nodes.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rect: Option<crate::geometry::Bounds>,
    #[serde(default)]
    pub children: Vec<DomSnapshot>,
}
