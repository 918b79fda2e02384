//! # World-Lock Transform Solver
//!
//! Keeps a chosen anchor point world-fixed while the object's parent (the
//! camera rig) moves, and lets the object keep the full parent rotation
//! so the drawing always faces the camera (billboard). The solve rewrites
//! the object's parent-inverse matrix instead of touching layer
//! transforms, so layer effects keep working.
//!
//! The pivot is the *anchor*, not the object origin:
//!
//! 1. `desired_rot = parent_rot * captured_local_rot`
//! 2. `child_origin = anchor_world - desired_rot * anchor_local_offset`
//! 3. `desired_world = T(child_origin) * R(desired_rot)`
//! 4. `parent_inverse = parent_world⁻¹ * desired_world * captured_local⁻¹`

use glam::{Mat3, Mat4, Vec3};
use onionskin_data::{LockTable, StrokeObject};

/// Offset from the object origin to a world-space anchor, expressed in
/// the object's local axes. This is the pivot arm the solver rotates.
pub fn anchor_local_offset(world: &Mat4, anchor_world: Vec3) -> Vec3 {
    let origin = world.w_axis.truncate();
    Mat3::from_mat4(*world).inverse() * (anchor_world - origin)
}

/// Parent-inverse matrix that pins the anchor at `anchor_world` while the
/// object billboards with its parent.
pub fn solve_parent_inverse(
    parent_world: Mat4,
    captured_local: Mat4,
    anchor_world: Vec3,
    anchor_local_offset: Vec3,
) -> Mat4 {
    let (_, parent_rot, _) = parent_world.to_scale_rotation_translation();
    let (_, local_rot, _) = captured_local.to_scale_rotation_translation();

    let desired_rot = parent_rot * local_rot;
    let child_origin = anchor_world - desired_rot * anchor_local_offset;
    let desired_world = Mat4::from_rotation_translation(desired_rot, child_origin);

    parent_world.inverse() * desired_world * captured_local.inverse()
}

/// Fallback for unparented objects: place the origin so the anchor lands
/// at `anchor_world`, keeping the captured orientation. No rotation solve
/// is needed without a parent.
pub fn solve_unparented_world(
    captured_local: Mat4,
    anchor_world: Vec3,
    anchor_local_offset: Vec3,
) -> Mat4 {
    let (scale, rot, _) = captured_local.to_scale_rotation_translation();
    let origin = anchor_world - rot * anchor_local_offset;
    Mat4::from_scale_rotation_translation(scale, rot, origin)
}

/// The keyframe visible at `current_frame`: the greatest keyframe number
/// at or before it, across all layers.
pub fn visible_keyframe(obj: &StrokeObject, current_frame: i32) -> Option<i32> {
    obj.layers
        .iter()
        .filter_map(|layer| layer.active_keyframe(current_frame))
        .map(|kf| kf.frame_number)
        .max()
}

/// Which locked frame governs `current_frame`, if any: the visible
/// keyframe, when it carries a lock.
pub fn visible_locked_frame(
    obj: &StrokeObject,
    locks: &LockTable,
    current_frame: i32,
) -> Option<i32> {
    let visible = visible_keyframe(obj, current_frame)?;
    locks.is_locked(visible).then_some(visible)
}

/// Apply the lock governing `current_frame`, rewriting the object's
/// parent-inverse (or, without a parent, its world matrix directly).
/// Returns whether a lock was applied.
///
/// Must run for every locked object on every frame change while its
/// parent animates, not just the active one.
pub fn apply_lock_for_frame(obj: &mut StrokeObject, locks: &LockTable, current_frame: i32) -> bool {
    let Some(frame) = visible_locked_frame(obj, locks, current_frame) else {
        return false;
    };
    let Some(entry) = locks.lock(frame) else {
        return false;
    };

    // Legacy migrated entries only carry a position.
    let Some(anchor_world) = entry.anchor_world.or(entry.lock_position) else {
        return false;
    };
    let offset = entry.anchor_local_offset.unwrap_or(Vec3::ZERO);
    let captured_local = entry.matrix_local.unwrap_or(obj.transforms.local);

    match obj.transforms.parent_world {
        Some(parent_world) => {
            obj.transforms.parent_inverse =
                solve_parent_inverse(parent_world, captured_local, anchor_world, offset);
            obj.transforms.resolve_world();
        }
        None => {
            obj.transforms.world = solve_unparented_world(captured_local, anchor_world, offset);
        }
    }
    true
}

/// Restore unconstrained parent-following: the captured original
/// parent-inverse when one was stored, identity otherwise.
pub fn reset_parent_inverse(obj: &mut StrokeObject, original: Option<Mat4>) {
    obj.transforms.parent_inverse = original.unwrap_or(Mat4::IDENTITY);
    obj.transforms.resolve_world();
}
