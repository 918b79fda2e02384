//! # Overlay Assembly
//!
//! The engine half of the draw callbacks: everything up to (but not
//! including) GPU submission. Resolves which frames to ghost, lazily
//! extracts and caches missing ones, fetches or builds their batches,
//! and computes per-frame colors with distance falloff. The host walks
//! the returned [`OverlayFrame`] and issues the actual draws.

use glam::Vec3;
use onionskin_core::{
    build_batches, catmull_rom_point, every_frame_window, extract_world_strokes, BatchEntry,
    BatchKey,
};
use onionskin_data::StrokeObject;
use std::sync::Arc;

use crate::host::{SceneContext, TransformSampler};
use crate::session::OnionSession;
use crate::settings::OnionMode;

/// One ghosted frame ready to draw: bind the colors, submit the batches.
#[derive(Debug, Clone)]
pub struct OnionPass {
    pub frame: i32,
    /// Signed distance from the current frame in window steps.
    pub offset: i32,
    pub stroke_color: [f32; 4],
    pub fill_color: [f32; 4],
    pub line_width: f32,
    pub batches: Arc<BatchEntry>,
}

/// An anchor indicator for the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorMarker {
    pub position: Vec3,
    pub is_current_frame: bool,
}

/// The sampled (and optionally smoothed) motion path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionPath {
    /// Line-strip points, smoothed when smoothing is on.
    pub line: Vec<Vec3>,
    /// Raw sample positions for keyframe markers.
    pub keys: Vec<Vec3>,
}

/// Everything the host draws for one viewport redraw.
#[derive(Debug, Clone, Default)]
pub struct OverlayFrame {
    pub onion: Vec<OnionPass>,
    pub anchors: Vec<AnchorMarker>,
    pub motion_path: Option<MotionPath>,
}

/// Which object and base Z offset the batch cache was built for; a change
/// in either means every cached batch is for the wrong geometry.
#[derive(Debug, Default)]
pub(crate) struct BatchSource {
    object: Option<String>,
    z_offset: Option<f32>,
}

/// Cached motion path, rebuilt on demand after invalidation.
#[derive(Debug)]
pub(crate) struct MotionPathCache {
    dirty: bool,
    object: Option<String>,
    path: Option<MotionPath>,
}

impl Default for MotionPathCache {
    fn default() -> Self {
        Self {
            dirty: true,
            object: None,
            path: None,
        }
    }
}

impl MotionPathCache {
    pub(crate) fn invalidate(&mut self) {
        self.dirty = true;
        self.path = None;
    }
}

/// Assemble the overlay draw lists for one redraw of `obj`.
pub fn assemble_overlays(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &StrokeObject,
    sampler: &dyn TransformSampler,
) -> OverlayFrame {
    let mut overlay = OverlayFrame::default();
    if !session.settings.enabled {
        return overlay;
    }

    // Batch cache only ever serves one object at one base offset.
    if session.batch_source.object.as_deref() != Some(obj.name.as_str()) {
        session.batch_cache.invalidate();
        session.batch_source.object = Some(obj.name.clone());
    }
    let base_z = session.settings.stroke_z_offset.max(0.0);
    if session.batch_source.z_offset != Some(base_z) {
        session.batch_cache.invalidate();
        session.batch_source.z_offset = Some(base_z);
    }

    let window = match session.settings.mode {
        OnionMode::Keyframes => session.keyframe_index.keyframe_window(
            obj,
            scene.current_frame,
            session.settings.frames_before,
            session.settings.frames_after,
        ),
        OnionMode::EveryFrame => every_frame_window(
            scene.current_frame,
            session.settings.frames_before,
            session.settings.frames_after,
            session.settings.frame_step,
        ),
    };

    let max_offset = session
        .settings
        .frames_before
        .max(session.settings.frames_after)
        .max(1) as f32;

    for (offset, frame) in window {
        // The current frame is drawn live by the host, never ghosted.
        if frame == scene.current_frame {
            continue;
        }

        let strokes = match session.stroke_cache.get(frame) {
            Some(strokes) => strokes,
            None => {
                // Lazy fill: extract with the object's transform at that
                // frame, falling back to the current one.
                let world = sampler
                    .transforms_at(&obj.name, frame)
                    .map(|t| t.world)
                    .unwrap_or(obj.transforms.world);
                session
                    .stroke_cache
                    .put(frame, extract_world_strokes(obj, frame, world));
                match session.stroke_cache.get(frame) {
                    Some(strokes) => strokes,
                    None => continue,
                }
            }
        };
        if strokes.is_empty() {
            continue;
        }

        let mut z_offset = base_z;
        if session.settings.depth_interaction_enabled {
            if let Ok(table) = session.baked.lock() {
                if let Some(baked) = table.get(frame) {
                    z_offset += baked;
                }
            }
        }

        let key = BatchKey::new(frame, z_offset);
        let batches = session
            .batch_cache
            .get_or_build(key, || build_batches(&strokes, z_offset));

        let base_color = if frame < scene.current_frame {
            session.settings.color_before
        } else {
            session.settings.color_after
        };
        let falloff_factor = if session.settings.falloff > 0.0 {
            1.0 - (offset.abs() as f32 / max_offset) * session.settings.falloff
        } else {
            1.0
        };
        let fill_alpha = session.settings.fill_opacity * falloff_factor.max(0.1);
        let stroke_alpha = session.settings.opacity * falloff_factor.max(0.1);

        overlay.onion.push(OnionPass {
            frame,
            offset,
            stroke_color: [base_color[0], base_color[1], base_color[2], stroke_alpha],
            fill_color: [base_color[0], base_color[1], base_color[2], fill_alpha],
            line_width: session.settings.line_width,
            batches,
        });
    }

    if session.settings.anchor_enabled {
        overlay.anchors = anchor_markers(session, scene, obj);
    }

    if session.settings.motion_path_enabled {
        overlay.motion_path = motion_path(session, obj);
    }

    overlay
}

fn anchor_markers(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &StrokeObject,
) -> Vec<AnchorMarker> {
    let filter = session.settings.filter();
    let mut markers = Vec::new();
    for (layer_name, frames) in session.anchors.table(obj).layers() {
        let Some(layer) = obj.layer(layer_name) else {
            continue;
        };
        if !filter.passes(layer) {
            continue;
        }
        for (&frame, entry) in frames {
            if let Some(position) = entry.pos {
                markers.push(AnchorMarker {
                    position,
                    is_current_frame: frame == scene.current_frame,
                });
            }
        }
    }
    markers
}

fn motion_path(session: &mut OnionSession, obj: &StrokeObject) -> Option<MotionPath> {
    let stale = session.motion_path.dirty
        || session.motion_path.object.as_deref() != Some(obj.name.as_str());
    if stale {
        let rebuilt = build_motion_path(session, obj);
        session.motion_path.path = rebuilt;
        session.motion_path.object = Some(obj.name.clone());
        session.motion_path.dirty = false;
    }
    session.motion_path.path.clone()
}

fn build_motion_path(session: &OnionSession, obj: &StrokeObject) -> Option<MotionPath> {
    let curve = obj.position_curve.as_ref()?;
    let (start, end) = curve.frame_range()?;
    if start == end {
        return None;
    }

    // Bound the sample count; long shots step coarser.
    let duration = (end - start) as usize;
    let step = (duration / 100).max(1);

    let mut points = Vec::new();
    let mut frame = start;
    while frame <= end {
        let mut pos = curve.evaluate(frame as f32);
        if session.settings.depth_interaction_enabled {
            if let Ok(table) = session.baked.lock() {
                if let Some(offset) = table.get(frame) {
                    pos.z += offset;
                }
            }
        }
        points.push(pos);
        frame += step as i32;
    }
    if points.len() < 2 {
        return None;
    }

    let line = if session.settings.motion_path_smoothing > 0 && points.len() >= 4 {
        smooth_path(&points, session.settings.motion_path_smoothing)
    } else {
        points.clone()
    };

    let keys = if session.settings.motion_path_show_points {
        points
    } else {
        Vec::new()
    };

    Some(MotionPath { line, keys })
}

/// Catmull-Rom subdivision between consecutive samples, endpoints
/// clamped.
fn smooth_path(points: &[Vec3], subdivisions: u32) -> Vec<Vec3> {
    let mut smoothed = Vec::new();
    let last = points.len() - 1;
    for i in 0..last {
        let p0 = points[i.saturating_sub(1)];
        let p1 = points[i];
        let p2 = points[(i + 1).min(last)];
        let p3 = points[(i + 2).min(last)];

        smoothed.push(p1);
        for j in 1..=subdivisions {
            let t = j as f32 / (subdivisions + 1) as f32;
            smoothed.push(catmull_rom_point(p0, p1, p2, p3, t));
        }
    }
    smoothed.push(points[last]);
    smoothed
}

/// Frame spans each world-locked keyframe effectively covers: from the
/// locked keyframe up to the frame before the next keyframe (or the
/// scene end). Used for timeline lane display.
pub fn locked_frame_spans(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &StrokeObject,
) -> Vec<(i32, i32)> {
    let locked = session.locks.table(obj).locked_frames();
    if locked.is_empty() {
        return Vec::new();
    }

    let keyframes = session.keyframe_index.frames(obj).to_vec();
    locked
        .into_iter()
        .map(|frame| {
            let next = keyframes
                .iter()
                .copied()
                .find(|&k| k > frame)
                .map(|k| k - 1)
                .unwrap_or(scene.frame_end);
            (frame, next.max(frame))
        })
        .collect()
}
