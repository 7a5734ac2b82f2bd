//! Keyboard shortcut mapping.
//!
//! Maps key + modifier combos to semantic `ShortcutAction`s. The runtimes
//! decide what an action means in the current selection state (Escape
//! cancels a drag or link overlay before it deselects, Delete only removes
//! a block that is not being edited, and so on).

use serde::Serialize;

/// Actions that keyboard shortcuts can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ShortcutAction {
    // ── Formatting ──
    Bold,
    Italic,
    Link,

    // ── History ──
    Undo,
    Redo,

    // ── Blocks ──
    /// Escape: cancel the innermost interaction, else deselect.
    Deselect,
    Delete,
    /// Enter at the end of a text field.
    NewBlock,
    Copy,
}

/// Resolves key events into shortcut actions.
///
/// Platform-aware: on macOS `meta` is ⌘, elsewhere `ctrl` plays the
/// same role.
pub struct ShortcutMap;

impl ShortcutMap {
    /// Resolve a key event to an action.
    ///
    /// `key` is the `KeyboardEvent.key` value (e.g. `"b"`, `"Escape"`).
    /// Returns `None` if the combo has no binding.
    pub fn resolve(
        key: &str,
        ctrl: bool,
        shift: bool,
        _alt: bool,
        meta: bool,
    ) -> Option<ShortcutAction> {
        let cmd = ctrl || meta;

        if cmd && shift {
            return match key {
                "z" | "Z" => Some(ShortcutAction::Redo),
                _ => None,
            };
        }

        if cmd {
            return match key {
                "b" | "B" => Some(ShortcutAction::Bold),
                "i" | "I" => Some(ShortcutAction::Italic),
                "k" | "K" => Some(ShortcutAction::Link),
                "z" | "Z" => Some(ShortcutAction::Undo),
                "y" | "Y" => Some(ShortcutAction::Redo),
                "c" | "C" => Some(ShortcutAction::Copy),
                _ => None,
            };
        }

        match key {
            "Escape" => Some(ShortcutAction::Deselect),
            "Delete" | "Backspace" if !shift => Some(ShortcutAction::Delete),
            // Shift+Enter stays a line break inside rich text.
            "Enter" if !shift => Some(ShortcutAction::NewBlock),
            _ => None,
        }
    }
}
