//! Error taxonomy shared by both runtimes.
//!
//! Every variant is recoverable: callers log it and keep the previous valid
//! state. None of these are allowed to escape into the host page.

use crate::id::BlockId;
use thiserror::Error;

/// A malformed or unroutable bridge envelope.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("envelope is not valid JSON: {0}")]
    Json(String),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("payload for {kind} is malformed: {reason}")]
    Payload { kind: String, reason: String },

    #[error("{0} requires a blockId")]
    MissingBlock(String),
}

/// Structural tree errors raised by the block tree itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    #[error("block id {0} already exists")]
    DuplicateId(BlockId),

    #[error("moving {block} under {parent} would create a cycle")]
    Cycle { block: BlockId, parent: BlockId },

    #[error("the tree root cannot be moved or deleted")]
    RootImmutable,

    #[error("anchor {anchor} is not a child of {parent}")]
    BadAnchor { anchor: BlockId, parent: BlockId },
}

/// Umbrella error for editing operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("type `{block_type}` is not allowed in {parent}")]
    SchemaViolation { parent: BlockId, block_type: String },

    #[error("{0} no longer exists")]
    StaleSelection(BlockId),

    #[error("range {start}..{end} does not fit a document of length {len}")]
    FormattingPath { start: usize, end: usize, len: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tree snapshot failed: {0}")]
    Snapshot(String),
}

impl EditError {
    /// Short machine-readable reason, used in `ACK` rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            EditError::Protocol(_) => "protocol",
            EditError::Tree(TreeError::UnknownBlock(_)) => "unknown-block",
            EditError::Tree(TreeError::DuplicateId(_)) => "duplicate-id",
            EditError::Tree(TreeError::Cycle { .. }) => "cycle",
            EditError::Tree(TreeError::RootImmutable) => "root",
            EditError::Tree(TreeError::BadAnchor { .. }) => "bad-anchor",
            EditError::SchemaViolation { .. } => "schema-violation",
            EditError::StaleSelection(_) => "stale",
            EditError::FormattingPath { .. } => "formatting-path",
            EditError::Config(_) => "config",
            EditError::Snapshot(_) => "snapshot",
        }
    }
}
