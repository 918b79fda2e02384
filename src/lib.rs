//! # Onionskin Engine
//!
//! Host-facing layer of the world-space onion skin and world-lock system
//! for frame-by-frame stroke animation parented to a moving camera.
//!
//! The host application (scene graph, timeline UI, GPU device) stays on
//! its side of a narrow seam: it mirrors the active stroke object into
//! [`onionskin_data`] structs, forwards its evaluation events
//! ([`OnionSession::on_frame_change`], [`OnionSession::on_depsgraph_tick`]),
//! runs user commands through [`ops`], and draws whatever
//! [`OnionSession::assemble_overlays`] returns.
//!
//! All state lives in an [`OnionSession`], so hosts and tests construct
//! as many independent instances as they like.

pub mod detect;
pub mod draw;
pub mod driver;
pub mod error;
pub mod host;
pub mod ops;
pub mod session;
pub mod settings;
pub mod store;

pub use draw::{AnchorMarker, MotionPath, OnionPass, OverlayFrame};
pub use driver::{OffsetDriver, OFFSET_EXPRESSION};
pub use error::{EngineError, EngineResult};
pub use host::{DepsgraphUpdate, EvalContext, SceneContext, TransformSampler, UpdateTarget};
pub use ops::OpReport;
pub use session::OnionSession;
pub use settings::{OnionMode, OnionSettings};
pub use store::{AnchorStore, LockStore};
