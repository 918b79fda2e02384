//! # Surface Offset Baker
//!
//! Precomputes a per-frame vertical correction so playback never has to
//! raycast. The bake walks the object's full animation range, evaluates
//! the raw position curve at each frame (never the constraint-resolved
//! world matrix, which would feed the correction back into itself), casts
//! a ray straight down from high above, and records how far the drawing
//! must be lifted to clear the surface.
//!
//! The table is either fully valid or not valid at all: the validity flag
//! drops at bake start and only returns once the whole range is written,
//! so readers never see partial data. A second bake attempted while one
//! is filling is skipped and logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use glam::Vec3;
use onionskin_data::StrokeObject;

use crate::transform::SURFACE_OFFSET;

/// How far above the evaluated position the probe ray starts.
pub const RAY_START_HEIGHT: f32 = 1000.0;

/// A surface hit from the host's ray query.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SurfaceHit {
    pub position: Vec3,
    pub normal: Vec3,
    /// Name of the hit object, so the baker can ignore self-hits.
    pub object: String,
}

/// Host seam: a single downward ray against the static scene geometry.
pub trait SurfaceRaycaster {
    fn cast_down(&self, origin: Vec3) -> Option<SurfaceHit>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeState {
    Invalid,
    Baking,
    Valid,
}

/// The baked frame -> z-offset table. Shared between the baker and the
/// offset driver behind `Arc<Mutex<..>>`.
#[derive(Debug)]
pub struct BakedOffsets {
    offsets: HashMap<i32, f32>,
    state: BakeState,
}

impl Default for BakedOffsets {
    fn default() -> Self {
        Self {
            offsets: HashMap::new(),
            state: BakeState::Invalid,
        }
    }
}

impl BakedOffsets {
    pub fn state(&self) -> BakeState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == BakeState::Valid
    }

    /// The baked offset for a frame. `None` while the table is not valid,
    /// or when the frame was never baked.
    pub fn get(&self, frame: i32) -> Option<f32> {
        if self.state != BakeState::Valid {
            return None;
        }
        self.offsets.get(&frame).copied()
    }

    /// Driver-facing read: missing data reads as zero correction.
    pub fn offset_or_zero(&self, frame: i32) -> f32 {
        self.get(frame).unwrap_or(0.0)
    }

    pub fn invalidate(&mut self) {
        self.state = BakeState::Invalid;
        self.offsets.clear();
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Probe one position: ray down from high above, lift to clear the
/// surface. Offsets only push upward; a surface below the path reads as
/// zero so dips (a jump's landing) are not flattened.
fn probe_offset(raycaster: &dyn SurfaceRaycaster, own_name: &str, pos: Vec3) -> f32 {
    let origin = pos + Vec3::Z * RAY_START_HEIGHT;
    match raycaster.cast_down(origin) {
        Some(hit) if hit.object != own_name => (hit.position.z + SURFACE_OFFSET - pos.z).max(0.0),
        _ => 0.0,
    }
}

/// Bake the full animation range into `table`.
///
/// Returns the number of frames baked; zero when skipped because a bake
/// is already in progress. Objects without a position curve bake a single
/// entry for `current_frame` from the object's evaluated location.
pub fn bake_offsets(
    table: &Arc<Mutex<BakedOffsets>>,
    obj: &StrokeObject,
    current_frame: i32,
    raycaster: &dyn SurfaceRaycaster,
) -> usize {
    {
        let Ok(mut guard) = table.lock() else {
            return 0;
        };
        if guard.state == BakeState::Baking {
            tracing::debug!(object = %obj.name, "offset bake already in progress, skipping");
            return 0;
        }
        guard.state = BakeState::Baking;
        guard.offsets.clear();
    }

    let mut offsets = HashMap::new();
    match obj
        .position_curve
        .as_ref()
        .and_then(|curve| curve.frame_range().map(|range| (curve, range)))
    {
        Some((curve, (start, end))) => {
            for frame in start..=end {
                let pos = curve.evaluate(frame as f32);
                offsets.insert(frame, probe_offset(raycaster, &obj.name, pos));
            }
        }
        None => {
            offsets.insert(
                current_frame,
                probe_offset(raycaster, &obj.name, obj.location()),
            );
        }
    }

    let count = offsets.len();
    if let Ok(mut guard) = table.lock() {
        guard.offsets = offsets;
        guard.state = BakeState::Valid;
    }
    tracing::debug!(object = %obj.name, frames = count, "baked surface offsets");
    count
}
