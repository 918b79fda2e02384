//! # Onionskin Core
//!
//! The hard parts of world-space onion skinning for camera-parented
//! stroke animation:
//!
//! - per-frame world-space stroke extraction with fill triangulation,
//! - the bounded stroke/batch caches and the keyframe index,
//! - the billboard world-lock transform solver,
//! - the surface-offset baker and its raycast seam.
//!
//! Everything here is engine-agnostic: the host hands in mirrored
//! [`onionskin_data`] structs and gets back plain geometry and matrices.

pub mod bake;
pub mod batch;
pub mod cache;
pub mod extract;
pub mod lock;
pub mod transform;

pub use bake::{
    bake_offsets, BakeState, BakedOffsets, SurfaceHit, SurfaceRaycaster, RAY_START_HEIGHT,
};
pub use batch::{build_batches, BatchEntry, PolylineBatch, TriangleBatch};
pub use cache::{
    every_frame_window, keyframe_set, BatchKey, KeyframeIndex, RenderBatchCache, StrokeWorldCache,
    BATCH_CACHE_CAPACITY, STROKE_CACHE_CAPACITY,
};
pub use extract::{
    anchor_from_strokes, extract_world_strokes, triangulate_fill, LayerFilter, StrokeRecord,
};
pub use lock::{
    anchor_local_offset, apply_lock_for_frame, reset_parent_inverse, solve_parent_inverse,
    solve_unparented_world, visible_keyframe, visible_locked_frame,
};
pub use transform::{camera_forward, catmull_rom_point, layer_matrix, SURFACE_OFFSET};
