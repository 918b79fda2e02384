//! Operator-level errors.
//!
//! Only operator preconditions surface to the user; everything else in
//! the engine degrades locally (empty tables, zero offsets, skipped
//! geometry). The display strings double as the user-facing warning
//! messages.

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("no active stroke object")]
    NoActiveObject,

    #[error("no active layer")]
    NoActiveLayer,

    #[error("no keyframe found at or before the current frame")]
    NoKeyframe,

    #[error("cannot lock: object has no parent")]
    NoParent,

    #[error("no strokes found to calculate an anchor")]
    NoStrokes,

    #[error("no strokes selected")]
    NoSelection,

    #[error("enable onion skinning first")]
    Disabled,

    #[error(transparent)]
    Host(#[from] anyhow::Error),
}
