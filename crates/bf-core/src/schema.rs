//! Field kinds and the markup attributes that declare them.
//!
//! The block-type schema itself belongs to the host. The engine only needs
//! one answer from it: what kind of field `data[name]` of a given block type
//! is. `SchemaResolver` is that seam; when it has no opinion, the kind implied
//! by the markup attribute is used.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Markup attributes the rendered document opts into.
pub mod attrs {
    pub const BLOCK_UID: &str = "data-block-uid";
    pub const CONTAINER: &str = "data-block-container";
    pub const ADD_DIRECTION: &str = "data-block-add";
    pub const READONLY: &str = "data-block-readonly";
    pub const EDIT_TEXT: &str = "data-edit-text";
    pub const EDIT_RICHTEXT: &str = "data-edit-richtext";
    pub const EDIT_LINK: &str = "data-edit-link";
    pub const EDIT_MEDIA: &str = "data-edit-media";
    /// Carried by every node the overlay layer creates.
    pub const OVERLAY: &str = "data-bf-overlay";
    /// Marks the editable element of the active inline session.
    pub const EDITING: &str = "data-bf-editing";
}

/// Kind of an editable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Plain text, no marks.
    Text,
    /// Inline HTML with bold/italic/link marks.
    RichText,
    /// A URL edited through the link overlay.
    Link,
    /// A media reference edited through the media overlay.
    Media,
}

impl FieldKind {
    /// Editable-field attributes in lookup order.
    pub const ATTRIBUTES: [(&'static str, FieldKind); 4] = [
        (attrs::EDIT_RICHTEXT, FieldKind::RichText),
        (attrs::EDIT_TEXT, FieldKind::Text),
        (attrs::EDIT_LINK, FieldKind::Link),
        (attrs::EDIT_MEDIA, FieldKind::Media),
    ];

    pub fn from_attr(name: &str) -> Option<Self> {
        Self::ATTRIBUTES
            .iter()
            .find(|(attr, _)| *attr == name)
            .map(|(_, kind)| *kind)
    }

    /// Whether inline text editing applies (as opposed to an overlay).
    pub fn is_inline(&self) -> bool {
        matches!(self, FieldKind::Text | FieldKind::RichText)
    }

    pub fn supports_marks(&self) -> bool {
        matches!(self, FieldKind::RichText)
    }
}

/// Host-supplied field-name → field-kind mapping.
pub trait SchemaResolver {
    /// Kind of `field` on blocks of `block_type`, if the schema knows it.
    fn field_kind(&self, block_type: &str, field: &str) -> Option<FieldKind>;
}

/// Table-backed resolver, loadable from JSON as
/// `{ "slate": { "value": "richtext" }, ... }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticSchema {
    types: HashMap<String, HashMap<String, FieldKind>>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, block_type: &str, field: &str, kind: FieldKind) -> Self {
        self.types
            .entry(block_type.to_string())
            .or_default()
            .insert(field.to_string(), kind);
        self
    }
}

impl SchemaResolver for StaticSchema {
    fn field_kind(&self, block_type: &str, field: &str) -> Option<FieldKind> {
        self.types.get(block_type)?.get(field).copied()
    }
}

/// Resolve a field kind: the schema wins, the markup attribute is the
/// fallback.
pub fn resolve_field_kind(
    schema: &dyn SchemaResolver,
    block_type: &str,
    field: &str,
    attr_kind: FieldKind,
) -> FieldKind {
    schema.field_kind(block_type, field).unwrap_or(attr_kind)
}
