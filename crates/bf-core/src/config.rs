//! Runtime configuration shared by the authority and the frame.

use crate::error::EditError;
use crate::model::AddDirection;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ─── Direction policy ─────────────────────────────────────────────────────

/// Add-button direction by nesting depth, used when a block carries no
/// explicit `data-block-add`. The cycle is indexed by depth modulo its
/// length; the default `[bottom, right]` is the depth-parity rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectionPolicy {
    cycle: SmallVec<[AddDirection; 2]>,
}

impl DirectionPolicy {
    /// An empty cycle falls back to the default.
    pub fn new(cycle: &[AddDirection]) -> Self {
        if cycle.is_empty() {
            return Self::default();
        }
        Self {
            cycle: cycle.iter().copied().collect(),
        }
    }

    pub fn direction_for_depth(&self, depth: usize) -> AddDirection {
        self.cycle
            .get(depth % self.cycle.len().max(1))
            .copied()
            .unwrap_or(AddDirection::Bottom)
    }

    /// Explicit attribute first, depth policy second.
    pub fn resolve(&self, explicit: Option<AddDirection>, depth: usize) -> AddDirection {
        explicit.unwrap_or_else(|| self.direction_for_depth(depth))
    }
}

impl Default for DirectionPolicy {
    fn default() -> Self {
        Self {
            cycle: SmallVec::from_slice(&[AddDirection::Bottom, AddDirection::Right]),
        }
    }
}

// ─── Editor config ────────────────────────────────────────────────────────

/// Tunables for both runtimes. Every field has a default, so `{}` is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorConfig {
    /// Text batch window. Not a correctness boundary.
    pub debounce_ms: u64,

    /// After this long an unacknowledged request is forgotten.
    pub request_timeout_ms: u64,

    /// After this long a geometry query falls back to the last known rect.
    pub geometry_timeout_ms: u64,

    /// Pointer travel before an armed drag starts.
    pub drag_threshold_px: f64,

    /// Width of the autoscroll band at each viewport edge.
    pub autoscroll_band_px: f64,

    /// Scroll per tick at the very edge.
    pub autoscroll_max_speed: f64,

    pub direction_cycle: DirectionPolicy,

    /// Maximum undo steps kept by the authority.
    pub undo_depth: usize,

    /// Block type inserted when a container loses its last child and
    /// declares neither a default nor a single allowed type.
    pub placeholder_type: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            request_timeout_ms: 5000,
            geometry_timeout_ms: 1000,
            drag_threshold_px: 4.0,
            autoscroll_band_px: 48.0,
            autoscroll_max_speed: 24.0,
            direction_cycle: DirectionPolicy::default(),
            undo_depth: 100,
            placeholder_type: "empty".to_string(),
        }
    }
}

impl EditorConfig {
    /// Parse and validate a JSON configuration. Missing fields default.
    pub fn from_json(json: &str) -> Result<Self, EditError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EditError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EditError> {
        if self.direction_cycle.cycle.is_empty() {
            return Err(EditError::Config("directionCycle must not be empty".into()));
        }
        if self.drag_threshold_px.is_nan() || self.drag_threshold_px < 0.0 {
            return Err(EditError::Config("dragThresholdPx must be >= 0".into()));
        }
        if self.autoscroll_band_px.is_nan() || self.autoscroll_band_px <= 0.0 {
            return Err(EditError::Config("autoscrollBandPx must be > 0".into()));
        }
        if self.undo_depth == 0 {
            return Err(EditError::Config("undoDepth must be at least 1".into()));
        }
        if self.placeholder_type.trim().is_empty() {
            return Err(EditError::Config("placeholderType must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = EditorConfig::from_json("{}").unwrap();
        assert_eq!(config, EditorConfig::default());
        assert_eq!(config.debounce_ms, 300);
        assert_eq!(config.placeholder_type, "empty");
    }

    #[test]
    fn partial_override() {
        let config =
            EditorConfig::from_json(r#"{"debounceMs": 50, "directionCycle": ["right"]}"#).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(
            config.direction_cycle.direction_for_depth(3),
            AddDirection::Right
        );
    }

    #[test]
    fn invalid_config_is_reported() {
        assert!(matches!(
            EditorConfig::from_json(r#"{"directionCycle": []}"#),
            Err(EditError::Config(_))
        ));
        assert!(matches!(
            EditorConfig::from_json(r#"{"debounceMs": "soon"}"#),
            Err(EditError::Config(_))
        ));
    }

    #[test]
    fn depth_parity_default() {
        let policy = DirectionPolicy::default();
        assert_eq!(policy.direction_for_depth(0), AddDirection::Bottom);
        assert_eq!(policy.direction_for_depth(1), AddDirection::Right);
        assert_eq!(policy.direction_for_depth(2), AddDirection::Bottom);
        assert_eq!(
            policy.resolve(Some(AddDirection::Right), 0),
            AddDirection::Right
        );
    }
}
