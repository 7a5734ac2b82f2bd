pub mod config;
pub mod dom;
pub mod error;
pub mod geometry;
pub mod html;
pub mod id;
pub mod model;
pub mod richtext;
pub mod schema;

pub use config::{DirectionPolicy, EditorConfig};
pub use dom::{DomNodeId, DomSnapshot, DomTree};
pub use error::{EditError, ProtocolError, TreeError};
pub use geometry::{Bounds, FrameTransform, Viewport};
pub use html::{parse_html, to_html};
pub use id::BlockId;
pub use model::*;
pub use richtext::{Mark, MarkKind, MarkSet, RichTextDocument, TextRun};
pub use schema::{FieldKind, SchemaResolver, StaticSchema};

// Re-export petgraph types so downstream crates don't need a direct dependency
pub use petgraph::graph::NodeIndex;
