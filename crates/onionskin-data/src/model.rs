//! # Stroke Object Model
//!
//! Plain structs mirroring the host's drawing objects.
//!
//! ## Responsibilities
//! - **Drawing data**: flat per-point / per-stroke attribute arrays in the
//!   host's storage layout (`positions` + cumulative `stroke_offsets`).
//! - **Layers**: keyframe lists sorted by frame number, with the layer's
//!   own TRS offset.
//! - **Transforms**: the object's evaluated matrices for the current tick,
//!   including the parent-inverse slot the lock solver writes.
//! - **Metadata blobs**: the serialized anchor/lock tables persisted on
//!   the object, with a revision counter for deserialize caches.

use std::ops::Range;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::curve::PositionCurve;

/// A material slot on a stroke object. Only the fill flag matters here:
/// it decides whether a stroke's closed outline gets triangulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialSlot {
    pub name: String,
    pub show_fill: bool,
}

/// One keyframe's worth of stroke geometry, in the host's flat layout.
///
/// `positions` holds every point of every stroke in local space.
/// `stroke_offsets[i]` is the index of stroke `i`'s first point; the
/// stroke ends where the next one begins (or at the end of `positions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Drawing {
    pub positions: Vec<Vec3>,
    pub stroke_offsets: Vec<u32>,
    /// One material slot index per stroke. Empty means slot 0 everywhere.
    pub material_indices: Vec<u32>,
    /// Per-stroke selection state (edit mode). Empty means nothing selected.
    pub stroke_selected: Vec<bool>,
}

impl Drawing {
    pub fn stroke_count(&self) -> usize {
        self.stroke_offsets.len()
    }

    /// Point index range of stroke `i`, or `None` when the offsets are
    /// inconsistent (start past end, or out of bounds).
    pub fn stroke_range(&self, i: usize) -> Option<Range<usize>> {
        let start = *self.stroke_offsets.get(i)? as usize;
        let end = match self.stroke_offsets.get(i + 1) {
            Some(&next) => next as usize,
            None => self.positions.len(),
        };
        if start >= end || end > self.positions.len() {
            return None;
        }
        Some(start..end)
    }

    pub fn material_index(&self, stroke: usize) -> usize {
        self.material_indices.get(stroke).copied().unwrap_or(0) as usize
    }

    pub fn is_stroke_selected(&self, stroke: usize) -> bool {
        self.stroke_selected.get(stroke).copied().unwrap_or(false)
    }
}

/// A keyframe on a layer's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerKeyframe {
    pub frame_number: i32,
    pub drawing: Drawing,
    /// Dopesheet selection state, used by multi-frame lock toggling.
    #[serde(default)]
    pub selected: bool,
}

/// A drawing layer: its own transform offset plus a sorted keyframe list.
///
/// The host keeps `frames` sorted by `frame_number`; lookups here rely on
/// that and use binary search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrokeLayer {
    pub name: String,
    pub hidden: bool,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub frames: Vec<LayerKeyframe>,
}

impl StrokeLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hidden: false,
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            frames: Vec::new(),
        }
    }

    /// The keyframe exactly at `frame`, if any.
    pub fn keyframe_at(&self, frame: i32) -> Option<&LayerKeyframe> {
        let idx = self.frames.partition_point(|kf| kf.frame_number < frame);
        self.frames
            .get(idx)
            .filter(|kf| kf.frame_number == frame)
    }

    /// The keyframe visible at `frame`: the closest one at or before it.
    pub fn active_keyframe(&self, frame: i32) -> Option<&LayerKeyframe> {
        let idx = self.frames.partition_point(|kf| kf.frame_number <= frame);
        if idx == 0 {
            return None;
        }
        self.frames.get(idx - 1)
    }

    pub fn active_keyframe_mut(&mut self, frame: i32) -> Option<&mut LayerKeyframe> {
        let idx = self.frames.partition_point(|kf| kf.frame_number <= frame);
        if idx == 0 {
            return None;
        }
        self.frames.get_mut(idx - 1)
    }
}

/// The object's evaluated transform state for the current tick.
///
/// `world` is the fully evaluated matrix; `local` is the object's own
/// matrix relative to its parent slot; `parent_inverse` is the
/// parent-offset matrix the world-lock solver rewrites. When a parent
/// exists, `world = parent_world * parent_inverse * local`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObjectTransforms {
    pub world: Mat4,
    pub local: Mat4,
    pub parent_world: Option<Mat4>,
    pub parent_inverse: Mat4,
    /// Extra Z translation applied after everything else; written by the
    /// baked surface-offset driver.
    pub delta_z: f32,
}

impl Default for ObjectTransforms {
    fn default() -> Self {
        Self {
            world: Mat4::IDENTITY,
            local: Mat4::IDENTITY,
            parent_world: None,
            parent_inverse: Mat4::IDENTITY,
            delta_z: 0.0,
        }
    }
}

impl ObjectTransforms {
    /// Recompute `world` from the parent chain. Hosts do this themselves
    /// after the solver writes `parent_inverse`; tests use this directly.
    pub fn resolve_world(&mut self) {
        self.world = match self.parent_world {
            Some(parent) => parent * self.parent_inverse * self.local,
            None => self.local,
        };
    }
}

/// The serialized metadata blobs carried on the object, plus a revision
/// counter so in-memory deserialize caches can tell when they are stale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub anchors_json: Option<String>,
    pub locks_json: Option<String>,
    pub revision: u64,
}

impl ObjectMetadata {
    pub fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

/// A host stroke object mirrored into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrokeObject {
    pub name: String,
    /// Host identity of the drawing datablock, for change detection.
    pub data_id: u64,
    /// Host identity of the animation action, if the object is animated.
    pub action_id: Option<u64>,
    pub layers: Vec<StrokeLayer>,
    pub materials: Vec<MaterialSlot>,
    pub position_curve: Option<PositionCurve>,
    pub transforms: ObjectTransforms,
    pub metadata: ObjectMetadata,
    /// Name of the parent object, if parented (typically the camera rig).
    pub parent: Option<String>,
}

impl StrokeObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_id: 0,
            action_id: None,
            layers: Vec::new(),
            materials: Vec::new(),
            position_curve: None,
            transforms: ObjectTransforms::default(),
            metadata: ObjectMetadata::default(),
            parent: None,
        }
    }

    /// The object origin in world space.
    pub fn location(&self) -> Vec3 {
        self.transforms.world.w_axis.truncate()
    }

    pub fn layer(&self, name: &str) -> Option<&StrokeLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut StrokeLayer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }

    /// Whether a material slot is fill-enabled. Out-of-range slots are not.
    pub fn material_has_fill(&self, slot: usize) -> bool {
        self.materials.get(slot).map(|m| m.show_fill).unwrap_or(false)
    }
}
