//! Matrix and spline utilities shared across the core.

use glam::{Mat3, Mat4, Vec3};
use onionskin_data::StrokeLayer;

/// Small lift applied on top of raycast hits so strokes sit visibly on a
/// surface instead of z-fighting with it.
pub const SURFACE_OFFSET: f32 = 0.01;

/// The layer's own offset transform: translation, rotation, then scale.
pub fn layer_matrix(layer: &StrokeLayer) -> Mat4 {
    Mat4::from_translation(layer.translation)
        * Mat4::from_quat(layer.rotation)
        * Mat4::from_scale(layer.scale)
}

/// Forward direction of a camera given its world matrix. Cameras look
/// down their local -Z.
pub fn camera_forward(camera_world: &Mat4) -> Vec3 {
    -(Mat3::from_mat4(*camera_world) * Vec3::Z)
}

/// A point on a Catmull-Rom spline segment between `p1` and `p2`,
/// `t` in [0, 1]. Used for motion-path smoothing.
pub fn catmull_rom_point(p0: Vec3, p1: Vec3, p2: Vec3, p3: Vec3, t: f32) -> Vec3 {
    let t2 = t * t;
    let t3 = t2 * t;

    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}
