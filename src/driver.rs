//! # Baked Offset Driver
//!
//! The declarative coupling between the baked offset table and the
//! object's displayed position. A rhai function `surface_offset(frame)`
//! reads the shared table, and the expression below is evaluated once per
//! frame to produce the object's Z delta: a table read on the playback
//! path instead of a raycast.
//!
//! Wiring the expression into the host is only legal from some contexts,
//! so installation is two-phase: [`OffsetDriver::request_wiring`] always
//! succeeds and marks the wiring pending; [`OffsetDriver::flush_wiring`]
//! completes it when the host reports a safe context, and is retried from
//! the next safe tick otherwise. That way the baked data can never exist
//! without eventually being connected to the displayed value.

use std::sync::{Arc, Mutex};

use onionskin_core::BakedOffsets;
use onionskin_data::StrokeObject;

use crate::host::EvalContext;

/// The driver expression installed on the object's Z delta channel.
pub const OFFSET_EXPRESSION: &str = "surface_offset(frame)";

pub struct OffsetDriver {
    engine: rhai::Engine,
    installed: bool,
    pending: bool,
}

impl std::fmt::Debug for OffsetDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetDriver")
            .field("installed", &self.installed)
            .field("pending", &self.pending)
            .finish()
    }
}

impl OffsetDriver {
    /// Build the driver around the shared baked table. The lookup reads
    /// zero whenever the table is invalid or the frame was never baked.
    pub fn new(table: Arc<Mutex<BakedOffsets>>) -> Self {
        let mut engine = rhai::Engine::new();
        engine.register_fn("surface_offset", move |frame: i64| -> f64 {
            match table.lock() {
                Ok(t) => t.offset_or_zero(frame as i32) as f64,
                Err(_) => 0.0,
            }
        });
        Self {
            engine,
            installed: false,
            pending: false,
        }
    }

    /// Ask for the expression to be wired. Always succeeds; actual
    /// installation happens on the next safe [`flush_wiring`] call.
    ///
    /// [`flush_wiring`]: OffsetDriver::flush_wiring
    pub fn request_wiring(&mut self) {
        if !self.installed {
            self.pending = true;
        }
    }

    /// Complete a pending wiring if the context allows host writes.
    /// Returns whether the driver got installed by this call.
    pub fn flush_wiring(&mut self, ctx: EvalContext) -> bool {
        if !self.pending {
            return false;
        }
        if !ctx.allows_host_writes() {
            tracing::debug!("offset driver wiring deferred: restricted evaluation context");
            return false;
        }
        self.pending = false;
        self.installed = true;
        tracing::debug!(expression = OFFSET_EXPRESSION, "offset driver wired");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Remove the driver and clear any offset it left behind.
    pub fn uninstall(&mut self, obj: &mut StrokeObject) {
        self.installed = false;
        self.pending = false;
        obj.transforms.delta_z = 0.0;
    }

    /// Evaluate the driver expression for `frame`. Script errors read as
    /// zero correction.
    pub fn evaluate(&self, frame: i32) -> f32 {
        let mut scope = rhai::Scope::new();
        scope.push("frame", frame as i64);
        match self
            .engine
            .eval_expression_with_scope::<f64>(&mut scope, OFFSET_EXPRESSION)
        {
            Ok(v) => v as f32,
            Err(err) => {
                tracing::warn!("offset expression failed: {err}");
                0.0
            }
        }
    }

    /// Apply the per-frame correction to the object, when installed.
    pub fn apply(&self, obj: &mut StrokeObject, frame: i32) {
        if self.installed {
            obj.transforms.delta_z = self.evaluate(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use onionskin_core::{bake_offsets, SurfaceHit, SurfaceRaycaster};
    use onionskin_data::{Channel, CurveKey, PositionCurve};

    struct Ground;

    impl SurfaceRaycaster for Ground {
        fn cast_down(&self, origin: Vec3) -> Option<SurfaceHit> {
            Some(SurfaceHit {
                position: Vec3::new(origin.x, origin.y, 0.0),
                normal: Vec3::Z,
                object: "ground".into(),
            })
        }
    }

    fn baked_table() -> Arc<Mutex<BakedOffsets>> {
        let table = Arc::new(Mutex::new(BakedOffsets::default()));
        let mut obj = StrokeObject::new("board");
        obj.position_curve = Some(PositionCurve {
            x: Channel::new(vec![CurveKey::linear(1.0, 0.0), CurveKey::linear(5.0, 0.0)]),
            y: Channel::new(vec![CurveKey::linear(1.0, 0.0), CurveKey::linear(5.0, 0.0)]),
            z: Channel::new(vec![
                CurveKey::linear(1.0, -1.0),
                CurveKey::linear(5.0, -1.0),
            ]),
        });
        bake_offsets(&table, &obj, 1, &Ground);
        table
    }

    #[test]
    fn expression_reads_the_baked_table() {
        let driver = OffsetDriver::new(baked_table());
        let expected = 1.0 + onionskin_core::SURFACE_OFFSET;
        assert!((driver.evaluate(3) - expected).abs() < 1e-5);
        // Frames outside the baked range read zero.
        assert_eq!(driver.evaluate(99), 0.0);
    }

    #[test]
    fn invalid_table_reads_zero() {
        let table = baked_table();
        table.lock().unwrap().invalidate();
        let driver = OffsetDriver::new(table);
        assert_eq!(driver.evaluate(3), 0.0);
    }

    #[test]
    fn wiring_defers_in_restricted_context() {
        let mut driver = OffsetDriver::new(baked_table());
        driver.request_wiring();
        assert!(driver.is_pending());

        assert!(!driver.flush_wiring(EvalContext::Restricted));
        assert!(driver.is_pending());
        assert!(!driver.is_installed());

        assert!(driver.flush_wiring(EvalContext::Interactive));
        assert!(driver.is_installed());
        assert!(!driver.is_pending());

        // Flushing again is a no-op.
        assert!(!driver.flush_wiring(EvalContext::Interactive));
    }

    #[test]
    fn apply_writes_delta_z_only_when_installed() {
        let mut driver = OffsetDriver::new(baked_table());
        let mut obj = StrokeObject::new("board");

        driver.apply(&mut obj, 3);
        assert_eq!(obj.transforms.delta_z, 0.0);

        driver.request_wiring();
        driver.flush_wiring(EvalContext::Interactive);
        driver.apply(&mut obj, 3);
        assert!(obj.transforms.delta_z > 1.0);

        driver.uninstall(&mut obj);
        assert_eq!(obj.transforms.delta_z, 0.0);
    }
}
