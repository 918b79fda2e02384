//! Upload-ready draw batches built from cached stroke records.
//!
//! The engine does not own a GPU device; a batch here is the finished
//! vertex data (triangle soup for fills, line strips for outlines) that
//! the host uploads once and redraws from. The draw-time Z offset is
//! folded into the coordinates, which is why batches are keyed by
//! `(frame, z offset)` in the cache.

use crate::extract::StrokeRecord;

/// Triangle-soup vertices for a stroke's fill: three positions per
/// triangle, already in draw order.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleBatch {
    pub positions: Vec<[f32; 3]>,
}

/// Line-strip vertices for a stroke outline.
#[derive(Debug, Clone, PartialEq)]
pub struct PolylineBatch {
    pub positions: Vec<[f32; 3]>,
}

/// All batches for one onion-skin frame at one resolved Z offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEntry {
    pub fill_batches: Vec<TriangleBatch>,
    pub stroke_batches: Vec<PolylineBatch>,
}

/// Build the batches for one frame's stroke records, lifting everything
/// by `z_offset`.
pub fn build_batches(strokes: &[StrokeRecord], z_offset: f32) -> BatchEntry {
    let mut entry = BatchEntry::default();

    for stroke in strokes {
        if stroke.points.len() < 2 {
            continue;
        }

        let coords: Vec<[f32; 3]> = stroke
            .points
            .iter()
            .map(|p| [p.x, p.y, p.z + z_offset])
            .collect();

        if !stroke.fill_triangles.is_empty() {
            let mut tri_coords = Vec::with_capacity(stroke.fill_triangles.len() * 3);
            for &[i, j, k] in &stroke.fill_triangles {
                if i < coords.len() && j < coords.len() && k < coords.len() {
                    tri_coords.push(coords[i]);
                    tri_coords.push(coords[j]);
                    tri_coords.push(coords[k]);
                }
            }
            if !tri_coords.is_empty() {
                entry.fill_batches.push(TriangleBatch {
                    positions: tri_coords,
                });
            }
        }

        entry.stroke_batches.push(PolylineBatch { positions: coords });
    }

    entry
}
