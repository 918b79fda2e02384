//! # Host Seam
//!
//! The few things the engine consumes from the host application, as plain
//! values and one sampling trait. Everything is read-only from the
//! engine's point of view except what flows back through
//! [`onionskin_data::ObjectTransforms`].

use glam::{Mat4, Vec3};
use onionskin_data::ObjectTransforms;

/// Snapshot of scene-level state for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SceneContext {
    pub current_frame: i32,
    pub frame_start: i32,
    pub frame_end: i32,
    /// The 3D cursor, used as the default anchor for new keyframes.
    pub cursor: Vec3,
    pub camera_world: Option<Mat4>,
}

impl SceneContext {
    pub fn camera_forward(&self) -> Option<Vec3> {
        self.camera_world
            .as_ref()
            .map(onionskin_core::camera_forward)
    }
}

/// Whether the current evaluation context permits writes back into the
/// host (drivers, metadata). Dependency-graph callbacks during playback
/// and render evaluation are restricted; UI-triggered paths are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalContext {
    Interactive,
    Restricted,
}

impl EvalContext {
    pub fn allows_host_writes(self) -> bool {
        matches!(self, EvalContext::Interactive)
    }
}

/// What a dependency-graph update event touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    /// The drawing datablock itself (strokes edited, keyframes changed).
    DrawingData { id: u64 },
    /// The object's animation action (position keys changed).
    ActionCurve { id: u64 },
    Other,
}

/// One update event from the host's dependency graph. Identity is the
/// stable `id`; `name` is the fallback when identities are unavailable
/// (e.g. across an undo boundary).
#[derive(Debug, Clone)]
pub struct DepsgraphUpdate {
    pub target: UpdateTarget,
    pub name: String,
}

impl DepsgraphUpdate {
    pub fn drawing_data(id: u64, name: impl Into<String>) -> Self {
        Self {
            target: UpdateTarget::DrawingData { id },
            name: name.into(),
        }
    }

    pub fn action_curve(id: u64, name: impl Into<String>) -> Self {
        Self {
            target: UpdateTarget::ActionCurve { id },
            name: name.into(),
        }
    }
}

/// Host query for an object's transforms as evaluated at an arbitrary
/// frame. Needed wherever the engine works with frames other than the
/// current one: neighbor-frame extraction, full-cache builds, and lock
/// capture on non-current keyframes.
pub trait TransformSampler {
    fn transforms_at(&self, object: &str, frame: i32) -> anyhow::Result<ObjectTransforms>;
}

/// Sampler for hosts/tests where the object does not move: every frame
/// reports the mirrored transforms unchanged.
pub struct StaticSampler(pub ObjectTransforms);

impl TransformSampler for StaticSampler {
    fn transforms_at(&self, _object: &str, _frame: i32) -> anyhow::Result<ObjectTransforms> {
        Ok(self.0)
    }
}
