//! # Onionskin Data
//!
//! Host-mirrored data model for the onionskin engine.
//!
//! The engine never talks to a host application's scene API directly; the
//! host mirrors the active stroke object into these plain structs once per
//! evaluation and hands them to the engine. This crate also owns the
//! persisted anchor/world-lock metadata format, including tolerant parsing
//! of legacy shapes written by earlier versions.

pub mod curve;
pub mod metadata;
pub mod model;

pub use curve::{Channel, CurveKey, PositionCurve};
pub use metadata::{
    mat4_from_rows, mat4_to_rows, AnchorEntry, AnchorTable, LockEntry, LockTable, ANCHORS_KEY,
    LOCKS_KEY,
};
pub use model::{
    Drawing, LayerKeyframe, MaterialSlot, ObjectMetadata, ObjectTransforms, StrokeLayer,
    StrokeObject,
};
