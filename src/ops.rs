//! # Operators
//!
//! The user-facing commands. Thin wrappers in the host UI call straight
//! into these; each returns an [`OpReport`] with the status message to
//! show, or an [`EngineError`] whose display string is the warning for a
//! cancelled operation.

use std::ops::Range;

use glam::{Mat3, Vec3};
use onionskin_core::{
    anchor_from_strokes, anchor_local_offset, apply_lock_for_frame, bake_offsets,
    extract_world_strokes, layer_matrix, reset_parent_inverse, visible_keyframe, SurfaceRaycaster,
};
use onionskin_data::StrokeObject;

use crate::error::{EngineError, EngineResult};
use crate::host::{EvalContext, SceneContext, TransformSampler};
use crate::session::OnionSession;
use crate::settings::OnionMode;

/// Outcome of a successful operator.
#[derive(Debug, Clone)]
pub struct OpReport {
    /// Status message for the host's info area.
    pub message: String,
    /// Where the host should move the 3D cursor, when an operator
    /// relocates it (auto-anchor).
    pub cursor_to: Option<Vec3>,
}

impl OpReport {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cursor_to: None,
        }
    }

    fn with_cursor(mut self, position: Vec3) -> Self {
        self.cursor_to = Some(position);
        self
    }
}

/// Drop every cached frame (and everything derived from them).
pub fn clear_cache(session: &mut OnionSession) -> OpReport {
    let count = session.stroke_cache.len();
    session.clear_caches();
    OpReport::new(format!("Cleared {count} cached frames"))
}

/// Sweep the scene range: create missing stroke-derived anchors and fill
/// the stroke cache for every displayable frame.
pub fn build_full_cache(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    sampler: &dyn TransformSampler,
) -> EngineResult<OpReport> {
    if !session.settings.enabled {
        return Err(EngineError::Disabled);
    }
    let obj = obj.ok_or(EngineError::NoActiveObject)?;

    let mut anchors_created = 0usize;
    if session.settings.anchor_enabled {
        let filter = session.settings.filter();
        let cam_dir = scene.camera_forward();
        let worklist: Vec<(String, i32)> = obj
            .layers
            .iter()
            .filter(|layer| filter.passes(layer))
            .flat_map(|layer| {
                layer
                    .frames
                    .iter()
                    .map(move |kf| (layer.name.clone(), kf.frame_number))
            })
            .collect();

        for (layer_name, frame) in worklist {
            if session.anchors.table(obj).anchor(&layer_name, frame).is_some() {
                continue;
            }
            let world = sampler
                .transforms_at(&obj.name, frame)
                .map(|t| t.world)
                .unwrap_or(obj.transforms.world);
            let Some(anchor) = obj
                .layer(&layer_name)
                .and_then(|layer| anchor_from_strokes(&world, layer, frame))
            else {
                continue;
            };
            session
                .anchors
                .update(obj, |t| t.set_anchor(&layer_name, frame, anchor, cam_dir));
            anchors_created += 1;
        }
    }

    for frame in scene.frame_start..=scene.frame_end {
        // The current frame stays out of the cache: it is drawn live.
        if frame == scene.current_frame {
            continue;
        }
        if session.settings.mode == OnionMode::Keyframes
            && !session.keyframe_index.is_keyframe(obj, frame)
        {
            continue;
        }
        if session.stroke_cache.contains(frame) {
            continue;
        }
        let world = sampler
            .transforms_at(&obj.name, frame)
            .map(|t| t.world)
            .unwrap_or(obj.transforms.world);
        session
            .stroke_cache
            .put(frame, extract_world_strokes(obj, frame, world));
    }

    let mut message = format!("Cached {} frames", session.stroke_cache.len());
    if anchors_created > 0 {
        message.push_str(&format!(", created {anchors_created} anchors"));
    }
    Ok(OpReport::new(message))
}

fn active_keyframe_number(
    obj: &StrokeObject,
    layer_name: &str,
    current_frame: i32,
) -> EngineResult<i32> {
    let layer = obj.layer(layer_name).ok_or(EngineError::NoActiveLayer)?;
    layer
        .active_keyframe(current_frame)
        .map(|kf| kf.frame_number)
        .ok_or(EngineError::NoKeyframe)
}

/// Shared tail of the anchor operators: persist the anchor, lock the
/// frame (or refresh an existing lock's anchor), and apply the solve.
fn anchor_and_lock(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &mut StrokeObject,
    layer_name: &str,
    frame: i32,
    anchor_world: Vec3,
) {
    let cam_dir = scene.camera_forward();
    session
        .anchors
        .update(obj, |t| t.set_anchor(layer_name, frame, anchor_world, cam_dir));

    let offset = anchor_local_offset(&obj.transforms.world, anchor_world);
    if session.locks.table(obj).is_locked(frame) {
        session
            .locks
            .update(obj, |t| t.update_anchor(frame, anchor_world, offset));
    } else {
        let original = obj.transforms.parent_inverse;
        let local = obj.transforms.local;
        session.locks.update(obj, |t| {
            t.set_lock(frame, anchor_world, offset, Some(original), Some(local))
        });
    }

    let locks = session.locks.table(obj);
    apply_lock_for_frame(obj, locks, scene.current_frame);
    session.motion_path.invalidate();
}

/// Anchor the visible keyframe of the active layer at the 3D cursor and
/// lock it there.
pub fn set_anchor(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    active_layer: Option<&str>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let layer_name = active_layer.ok_or(EngineError::NoActiveLayer)?.to_string();
    let frame = active_keyframe_number(obj, &layer_name, scene.current_frame)?;

    anchor_and_lock(session, scene, obj, &layer_name, frame, scene.cursor);
    Ok(OpReport::new(format!(
        "Anchor set and locked at frame {frame}"
    )))
}

/// Derive the anchor from the visible keyframe's strokes (XY center,
/// lowest Z), lock, and move the cursor there.
pub fn auto_anchor(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    active_layer: Option<&str>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let layer_name = active_layer.ok_or(EngineError::NoActiveLayer)?.to_string();
    let frame = active_keyframe_number(obj, &layer_name, scene.current_frame)?;

    let world = obj.transforms.world;
    let anchor = obj
        .layer(&layer_name)
        .and_then(|layer| anchor_from_strokes(&world, layer, frame))
        .ok_or(EngineError::NoStrokes)?;

    anchor_and_lock(session, scene, obj, &layer_name, frame, anchor);
    Ok(
        OpReport::new(format!("Anchor auto-set and locked at frame {frame}"))
            .with_cursor(anchor),
    )
}

/// Translate the selected strokes so their reference point (XY center,
/// lowest Z) lands on the cursor, then anchor and lock the frame there.
/// The stroke shapes are preserved.
pub fn snap_to_cursor(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    active_layer: Option<&str>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let layer_name = active_layer.ok_or(EngineError::NoActiveLayer)?.to_string();
    let frame = active_keyframe_number(obj, &layer_name, scene.current_frame)?;

    let layer_idx = obj
        .layers
        .iter()
        .position(|l| l.name == layer_name)
        .ok_or(EngineError::NoActiveLayer)?;
    let full = obj.transforms.world * layer_matrix(&obj.layers[layer_idx]);

    let kf_idx = obj.layers[layer_idx]
        .frames
        .iter()
        .position(|kf| kf.frame_number == frame)
        .ok_or(EngineError::NoKeyframe)?;

    let (selected_ranges, reference) = {
        let drawing = &obj.layers[layer_idx].frames[kf_idx].drawing;
        let ranges: Vec<Range<usize>> = (0..drawing.stroke_count())
            .filter(|&s| drawing.is_stroke_selected(s))
            .filter_map(|s| drawing.stroke_range(s))
            .collect();
        if ranges.is_empty() {
            return Err(EngineError::NoSelection);
        }

        let mut sum_x = 0.0f32;
        let mut sum_y = 0.0f32;
        let mut min_z = f32::INFINITY;
        let mut count = 0usize;
        for range in &ranges {
            for &p in &drawing.positions[range.clone()] {
                let w = full.transform_point3(p);
                sum_x += w.x;
                sum_y += w.y;
                min_z = min_z.min(w.z);
                count += 1;
            }
        }
        if count == 0 {
            return Err(EngineError::NoSelection);
        }
        let reference = Vec3::new(sum_x / count as f32, sum_y / count as f32, min_z);
        (ranges, reference)
    };

    let offset_world = scene.cursor - reference;
    let offset_local = Mat3::from_mat4(full).inverse() * offset_world;

    let stroke_count = selected_ranges.len();
    let drawing = &mut obj.layers[layer_idx].frames[kf_idx].drawing;
    for range in selected_ranges {
        for p in &mut drawing.positions[range] {
            *p += offset_local;
        }
    }

    // Moved geometry invalidates whatever the caches held for it.
    session.clear_caches();
    anchor_and_lock(session, scene, obj, &layer_name, frame, scene.cursor);

    Ok(OpReport::new(format!(
        "Snapped {stroke_count} strokes to cursor and locked at frame {frame}"
    )))
}

/// Remove the anchor of the visible keyframe on the active layer.
pub fn clear_anchor(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    active_layer: Option<&str>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let layer_name = active_layer.ok_or(EngineError::NoActiveLayer)?.to_string();
    let frame = active_keyframe_number(obj, &layer_name, scene.current_frame)?;

    session.anchors.update(obj, |t| t.remove(&layer_name, frame));
    Ok(OpReport::new(format!("Anchor cleared for frame {frame}")))
}

/// Remove every anchor on the object.
pub fn clear_all_anchors(
    session: &mut OnionSession,
    obj: Option<&mut StrokeObject>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    session.anchors.update(obj, |t| t.clear());
    Ok(OpReport::new("All anchors cleared"))
}

/// Unique frame numbers of dopesheet-selected keyframes, across layers.
fn selected_keyframe_frames(obj: &StrokeObject) -> Vec<i32> {
    let mut frames: Vec<i32> = obj
        .layers
        .iter()
        .flat_map(|layer| {
            layer
                .frames
                .iter()
                .filter(|kf| kf.selected)
                .map(|kf| kf.frame_number)
        })
        .collect();
    frames.sort_unstable();
    frames.dedup();
    frames
}

/// Toggle the world lock. With dopesheet-selected keyframes the toggle
/// applies to all of them (any unlocked → lock all, each with its own
/// anchor); otherwise it applies to the keyframe visible at the current
/// frame.
pub fn toggle_world_lock(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    active_layer: Option<&str>,
    sampler: &dyn TransformSampler,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let selected = selected_keyframe_frames(obj);
    if selected.is_empty() {
        toggle_single(session, scene, obj, active_layer, sampler)
    } else {
        toggle_multi(session, scene, obj, active_layer, sampler, &selected)
    }
}

fn toggle_single(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &mut StrokeObject,
    active_layer: Option<&str>,
    sampler: &dyn TransformSampler,
) -> EngineResult<OpReport> {
    let visible = visible_keyframe(obj, scene.current_frame).ok_or(EngineError::NoKeyframe)?;

    if session.locks.table(obj).is_locked(visible) {
        session.locks.update(obj, |t| t.unlock(visible));
        let original = session
            .locks
            .table(obj)
            .entry(visible)
            .and_then(|e| e.original_parent_inverse);
        reset_parent_inverse(obj, original);
        return Ok(OpReport::new(format!("World lock OFF for frame {visible}")));
    }

    if obj.parent.is_none() {
        return Err(EngineError::NoParent);
    }

    // A previously unlocked frame keeps its captured data; re-locking
    // restores it instead of recomputing.
    let mut relocked = false;
    session.locks.update(obj, |t| relocked = t.relock(visible));

    if !relocked {
        // World/local state is captured at the visible keyframe's frame;
        // the parent-inverse to restore on unlock is whatever the object
        // carries right now.
        let original = obj.transforms.parent_inverse;
        let capture = if visible == scene.current_frame {
            obj.transforms
        } else {
            sampler.transforms_at(&obj.name, visible)?
        };
        let anchor = active_layer
            .and_then(|name| obj.layer(name))
            .and_then(|layer| anchor_from_strokes(&capture.world, layer, visible))
            .unwrap_or_else(|| capture.world.w_axis.truncate());
        let offset = anchor_local_offset(&capture.world, anchor);
        session.locks.update(obj, |t| {
            t.set_lock(visible, anchor, offset, Some(original), Some(capture.local))
        });
    }

    let locks = session.locks.table(obj);
    apply_lock_for_frame(obj, locks, scene.current_frame);
    Ok(OpReport::new(format!("World lock ON for frame {visible}")))
}

fn toggle_multi(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &mut StrokeObject,
    active_layer: Option<&str>,
    sampler: &dyn TransformSampler,
    selected: &[i32],
) -> EngineResult<OpReport> {
    let any_unlocked = {
        let locks = session.locks.table(obj);
        selected.iter().any(|&f| !locks.is_locked(f))
    };

    if any_unlocked {
        if obj.parent.is_none() {
            return Err(EngineError::NoParent);
        }
        let original = obj.transforms.parent_inverse;

        let mut locked = 0usize;
        for &frame in selected {
            if session.locks.table(obj).is_locked(frame) {
                continue;
            }
            // Each frame gets its own anchor from its own strokes.
            let capture = if frame == scene.current_frame {
                obj.transforms
            } else {
                sampler.transforms_at(&obj.name, frame)?
            };
            let anchor = active_layer
                .and_then(|name| obj.layer(name))
                .and_then(|layer| anchor_from_strokes(&capture.world, layer, frame))
                .unwrap_or_else(|| capture.world.w_axis.truncate());
            let offset = anchor_local_offset(&capture.world, anchor);
            session.locks.update(obj, |t| {
                t.set_lock(frame, anchor, offset, Some(original), Some(capture.local))
            });
            locked += 1;
        }

        let locks = session.locks.table(obj);
        apply_lock_for_frame(obj, locks, scene.current_frame);
        Ok(OpReport::new(format!("World lock ON for {locked} frames")))
    } else {
        for &frame in selected {
            session.locks.update(obj, |t| t.unlock(frame));
        }
        let original = {
            let visible = visible_keyframe(obj, scene.current_frame);
            let locks = session.locks.table(obj);
            visible
                .and_then(|f| locks.entry(f))
                .and_then(|e| e.original_parent_inverse)
        };
        reset_parent_inverse(obj, original);
        Ok(OpReport::new(format!(
            "World lock OFF for {} frames",
            selected.len()
        )))
    }
}

/// Remove every lock and return to plain parent-following.
pub fn clear_all_locks(
    session: &mut OnionSession,
    obj: Option<&mut StrokeObject>,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    session.locks.update(obj, |t| t.clear());
    reset_parent_inverse(obj, None);
    Ok(OpReport::new("All world locks cleared"))
}

/// Re-bake the surface offset table and (re)wire the driver.
pub fn bake_surface_offsets(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: Option<&mut StrokeObject>,
    raycaster: &dyn SurfaceRaycaster,
    ctx: EvalContext,
) -> EngineResult<OpReport> {
    let obj = obj.ok_or(EngineError::NoActiveObject)?;
    let count = bake_offsets(&session.baked, obj, scene.current_frame, raycaster);
    session.driver.request_wiring();
    session.driver.flush_wiring(ctx);
    session.motion_path.invalidate();
    Ok(OpReport::new(format!(
        "Baked surface offsets for {count} frames"
    )))
}
