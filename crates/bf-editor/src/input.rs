//! Input abstraction layer.
//!
//! Normalizes the frame host's DOM events into one `InputEvent` enum.
//! Pointer positions are viewport coordinates of the frame; text offsets
//! are visible-character offsets inside the focused field.

use crate::shortcuts::{ShortcutAction, ShortcutMap};
use kurbo::Point;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        shift: false,
        alt: false,
        meta: false,
    };

    /// ⌘ on macOS, Ctrl elsewhere.
    pub fn cmd(&self) -> bool {
        self.ctrl || self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputEvent {
    PointerDown {
        x: f64,
        y: f64,
        #[serde(default)]
        modifiers: Modifiers,
    },
    PointerMove {
        x: f64,
        y: f64,
    },
    PointerUp {
        x: f64,
        y: f64,
    },
    /// The frame document scrolled to an absolute offset.
    #[serde(rename_all = "camelCase")]
    Scroll {
        scroll_x: f64,
        scroll_y: f64,
    },
    /// The frame viewport was resized.
    Resize {
        width: f64,
        height: f64,
    },
    Key {
        key: String,
        #[serde(default)]
        modifiers: Modifiers,
    },
    /// Text typed into the focused field (engine-driven input path).
    Text {
        text: String,
    },
    /// Caret or selection moved inside the focused field.
    SelectText {
        start: usize,
        end: usize,
    },
    /// The host's editable element changed natively; re-read it.
    DomEdited {
        caret: usize,
    },
}

impl InputEvent {
    /// Extract position if this is a pointer event.
    pub fn position(&self) -> Option<Point> {
        match self {
            Self::PointerDown { x, y, .. } | Self::PointerMove { x, y } | Self::PointerUp { x, y } => {
                Some(Point::new(*x, *y))
            }
            _ => None,
        }
    }

    pub fn key(key: &str, modifiers: Modifiers) -> Self {
        Self::Key {
            key: key.to_string(),
            modifiers,
        }
    }

    pub fn pointer_down(x: f64, y: f64) -> Self {
        Self::PointerDown {
            x,
            y,
            modifiers: Modifiers::NONE,
        }
    }

    /// The shortcut bound to this key event, if any.
    pub fn shortcut(&self) -> Option<ShortcutAction> {
        match self {
            Self::Key { key, modifiers } => {
                ShortcutMap::resolve(key, modifiers.ctrl, modifiers.shift, modifiers.alt, modifiers.meta)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_from_host_json() {
        let ev: InputEvent = serde_json::from_str(r#"{"type":"pointerDown","x":4,"y":8}"#).unwrap();
        assert_eq!(ev.position(), Some(Point::new(4.0, 8.0)));

        let ev: InputEvent =
            serde_json::from_str(r#"{"type":"key","key":"b","modifiers":{"meta":true}}"#).unwrap();
        assert_eq!(ev.shortcut(), Some(ShortcutAction::Bold));

        let ev: InputEvent = serde_json::from_str(r#"{"type":"scroll","scrollX":0,"scrollY":120}"#).unwrap();
        assert_eq!(
            ev,
            InputEvent::Scroll {
                scroll_x: 0.0,
                scroll_y: 120.0
            }
        );
    }

    #[test]
    fn text_events_have_no_position() {
        assert_eq!(InputEvent::Text { text: "a".into() }.position(), None);
        assert_eq!(InputEvent::key("Escape", Modifiers::NONE).shortcut(), Some(ShortcutAction::Deselect));
    }
}
