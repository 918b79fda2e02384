//! Session settings: the subset of the user-facing options that the core
//! actually consumes. Display-only knobs (panel layout, label sizes) stay
//! on the host side.

use onionskin_core::LayerFilter;
use serde::{Deserialize, Serialize};

/// How display frames are selected around the current one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnionMode {
    /// Every Nth frame before/after the current frame.
    #[default]
    EveryFrame,
    /// Only real keyframes.
    Keyframes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionSettings {
    pub enabled: bool,
    pub mode: OnionMode,
    pub frames_before: u32,
    pub frames_after: u32,
    pub frame_step: u32,
    pub opacity: f32,
    pub fill_opacity: f32,
    /// Fade for frames further from the current one, 0..1.
    pub falloff: f32,
    pub color_before: [f32; 3],
    pub color_after: [f32; 3],
    pub line_width: f32,
    /// Ignore layers whose name starts with `_` in anchor workflows.
    pub skip_underscore: bool,
    /// Substring filter on layer names for anchor workflows; empty means
    /// all layers.
    pub layer_filter: String,
    pub anchor_enabled: bool,
    /// New keyframes inherit the lock state of the preceding keyframe.
    pub world_lock_inherit: bool,
    /// Strokes follow scene surfaces below them via the baked offsets.
    pub depth_interaction_enabled: bool,
    /// Global Z lift for onion strokes, to keep them from clipping into
    /// geometry.
    pub stroke_z_offset: f32,
    pub motion_path_enabled: bool,
    /// Catmull-Rom subdivisions between motion path samples; 0 disables
    /// smoothing.
    pub motion_path_smoothing: u32,
    pub motion_path_show_points: bool,
}

impl Default for OnionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: OnionMode::EveryFrame,
            frames_before: 3,
            frames_after: 3,
            frame_step: 1,
            opacity: 0.5,
            fill_opacity: 0.25,
            falloff: 0.5,
            color_before: [1.0, 0.5, 0.5],
            color_after: [0.5, 0.8, 1.0],
            line_width: 2.0,
            skip_underscore: false,
            layer_filter: String::new(),
            anchor_enabled: false,
            world_lock_inherit: false,
            depth_interaction_enabled: false,
            stroke_z_offset: 0.0,
            motion_path_enabled: false,
            motion_path_smoothing: 0,
            motion_path_show_points: true,
        }
    }
}

impl OnionSettings {
    /// The layer filter for anchor workflows and keyframe-set tracking.
    pub fn filter(&self) -> LayerFilter {
        LayerFilter {
            skip_underscore: self.skip_underscore,
            name_contains: self.layer_filter.clone(),
        }
    }
}
