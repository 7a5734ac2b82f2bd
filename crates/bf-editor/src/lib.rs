pub mod annotator;
pub mod authority;
pub mod bridge;
pub mod commands;
pub mod drag;
pub mod frame;
pub mod inline;
pub mod input;
pub mod mutation;
pub mod selection;
pub mod shortcuts;

pub use annotator::{AnnotatedBlock, Annotator, BlockShape, FieldBinding, Overlay, Topology};
pub use authority::{AuthorityEvent, AuthorityRuntime};
pub use bridge::{Bridge, MemoryTransport, Message, MessageKind, Packet, TreeCommit, Transport};
pub use drag::{DragController, DragOutcome, DragState, DropTarget};
pub use frame::{FrameEvent, FrameRuntime};
pub use inline::{EditorRegistry, FieldFlush, InlineSession, PendingMark};
pub use input::{InputEvent, Modifiers};
pub use mutation::{EmptyContainerPolicy, Outcome, StructuralEngine, StructuralOp};
pub use selection::{SelectionController, SelectionState, ToolbarLayout};
pub use shortcuts::{ShortcutAction, ShortcutMap};
