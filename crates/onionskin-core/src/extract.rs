//! # World-Space Stroke Extraction
//!
//! Reads one stroke object's drawing data at a target frame and converts
//! local-space stroke points into world-space point lists, tagged with
//! fill-triangulation data.
//!
//! ## Responsibilities
//! - **Keyframe resolve**: binary search for the active keyframe at or
//!   before the target frame, per layer.
//! - **Point transform**: `object world matrix * layer matrix` applied to
//!   every point; results are baked into the record, never re-derived at
//!   draw time (a draw-time Z offset is the only later adjustment).
//! - **Fill triangulation**: closed outlines of fill-enabled materials are
//!   tessellated; degenerate or self-intersecting outlines degrade to an
//!   empty fill list with the stroke outline still drawn.
//!
//! Extraction never fails: bad input degrades to "no geometry here".

use std::cell::Cell;
use std::rc::Rc;

use glam::{Mat4, Vec3};
use lyon::lyon_tessellation::{
    BuffersBuilder, FillOptions, FillTessellator, FillVertex, FillVertexConstructor, VertexBuffers,
};
use lyon::math::point;
use lyon::path::Path;
use onionskin_data::{StrokeLayer, StrokeObject};

use crate::transform::layer_matrix;

/// One extracted stroke: world-space points plus fill triangles indexing
/// into them. Immutable once built for a given frame.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StrokeRecord {
    pub points: Vec<Vec3>,
    pub layer_name: String,
    /// The keyframe the geometry actually came from (at or before the
    /// requested frame).
    pub source_frame: i32,
    pub fill_triangles: Vec<[usize; 3]>,
}

/// Layer eligibility filter used by the anchor workflow and keyframe-set
/// tracking. Hidden layers never pass.
#[derive(Debug, Clone, Default)]
pub struct LayerFilter {
    pub skip_underscore: bool,
    pub name_contains: String,
}

impl LayerFilter {
    pub fn passes(&self, layer: &StrokeLayer) -> bool {
        if layer.hidden {
            return false;
        }
        if self.skip_underscore && layer.name.starts_with('_') {
            return false;
        }
        if !self.name_contains.is_empty() && !layer.name.contains(&self.name_contains) {
            return false;
        }
        true
    }
}

/// Extract world-space stroke records for `frame`.
///
/// Every visible layer contributes the drawing of its active keyframe at
/// or before `frame`; layers with no keyframe yet are silently skipped.
/// `world` is the object's world matrix at that frame; for neighbor
/// frames of an animated object the caller samples it from the host
/// rather than reusing the current one.
pub fn extract_world_strokes(obj: &StrokeObject, frame: i32, world: Mat4) -> Vec<StrokeRecord> {
    let mut records = Vec::new();

    for layer in &obj.layers {
        if layer.hidden {
            continue;
        }

        let Some(active) = layer.active_keyframe(frame) else {
            continue;
        };
        let drawing = &active.drawing;
        if drawing.positions.is_empty() || drawing.stroke_offsets.is_empty() {
            continue;
        }

        let full = world * layer_matrix(layer);

        for stroke in 0..drawing.stroke_count() {
            let Some(range) = drawing.stroke_range(stroke) else {
                continue;
            };

            let points: Vec<Vec3> = drawing.positions[range]
                .iter()
                .map(|&p| full.transform_point3(p))
                .collect();
            if points.len() < 2 {
                continue;
            }

            let has_fill = obj.material_has_fill(drawing.material_index(stroke));
            let fill_triangles = if has_fill && points.len() >= 3 {
                triangulate_fill(&points)
            } else {
                Vec::new()
            };

            records.push(StrokeRecord {
                points,
                layer_name: layer.name.clone(),
                source_frame: active.frame_number,
                fill_triangles,
            });
        }
    }

    records
}

/// Maps tessellator vertices back to indices into the input point list.
/// A vertex lyon had to synthesize (self-intersection) marks the outline
/// as untriangulatable.
struct OriginalIndex {
    synthesized: Rc<Cell<bool>>,
}

impl FillVertexConstructor<u32> for OriginalIndex {
    fn new_vertex(&mut self, vertex: FillVertex) -> u32 {
        match vertex.as_endpoint_id() {
            Some(id) => id.to_usize() as u32,
            None => {
                self.synthesized.set(true);
                0
            }
        }
    }
}

/// Triangulate a closed polygon for fill rendering.
///
/// The outline is treated as implicitly closed. Returns triangles as
/// index triples into `points`, or an empty list when the polygon cannot
/// be triangulated (fewer than 3 points, near-zero area, or
/// self-intersecting).
pub fn triangulate_fill(points: &[Vec3]) -> Vec<[usize; 3]> {
    if points.len() < 3 {
        return Vec::new();
    }

    // Newell normal picks the dominant projection plane for the (mostly
    // planar) world-space outline.
    let mut normal = Vec3::ZERO;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        normal += Vec3::new(
            (a.y - b.y) * (a.z + b.z),
            (a.z - b.z) * (a.x + b.x),
            (a.x - b.x) * (a.y + b.y),
        );
    }
    if normal.length_squared() < 1e-12 {
        return Vec::new();
    }

    let abs = normal.abs();
    let project = |p: Vec3| -> (f32, f32) {
        if abs.z >= abs.x && abs.z >= abs.y {
            (p.x, p.y)
        } else if abs.x >= abs.y {
            (p.y, p.z)
        } else {
            (p.x, p.z)
        }
    };

    let mut builder = Path::builder();
    let (x0, y0) = project(points[0]);
    builder.begin(point(x0, y0));
    for &p in &points[1..] {
        let (x, y) = project(p);
        builder.line_to(point(x, y));
    }
    builder.end(true);
    let path = builder.build();

    let synthesized = Rc::new(Cell::new(false));
    let mut buffers: VertexBuffers<u32, u32> = VertexBuffers::new();
    let mut tessellator = FillTessellator::new();
    let result = tessellator.tessellate_path(
        &path,
        &FillOptions::default(),
        &mut BuffersBuilder::new(
            &mut buffers,
            OriginalIndex {
                synthesized: Rc::clone(&synthesized),
            },
        ),
    );

    if result.is_err() || synthesized.get() {
        return Vec::new();
    }

    let mut triangles = Vec::with_capacity(buffers.indices.len() / 3);
    for tri in buffers.indices.chunks_exact(3) {
        let mut mapped = [0usize; 3];
        for (slot, &idx) in mapped.iter_mut().zip(tri) {
            let original = buffers.vertices[idx as usize] as usize;
            if original >= points.len() {
                return Vec::new();
            }
            *slot = original;
        }
        triangles.push(mapped);
    }
    triangles
}

/// Anchor position derived from a keyframe's strokes: XY centroid at the
/// lowest Z.
///
/// Takes the raw object world matrix without the layer offset: the layer
/// offset carries world-lock compensation, which must not feed back into
/// the anchor it was computed from.
pub fn anchor_from_strokes(world: &Mat4, layer: &StrokeLayer, frame_number: i32) -> Option<Vec3> {
    let keyframe = layer.keyframe_at(frame_number)?;
    let positions = &keyframe.drawing.positions;
    if positions.is_empty() {
        return None;
    }

    let mut sum_x = 0.0f32;
    let mut sum_y = 0.0f32;
    let mut min_z = f32::INFINITY;
    for &p in positions {
        let w = world.transform_point3(p);
        sum_x += w.x;
        sum_y += w.y;
        min_z = min_z.min(w.z);
    }

    let count = positions.len() as f32;
    Some(Vec3::new(sum_x / count, sum_y / count, min_z))
}
