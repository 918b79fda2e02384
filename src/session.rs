//! # Onion Session
//!
//! Owns every piece of engine state: settings, the three caches, the
//! anchor/lock stores, the baked offset table, the driver, and the change
//! detector. Hosts keep one session per open file (or per viewport) and
//! construct fresh ones in tests; nothing here is process-global.

use std::sync::{Arc, Mutex};

use onionskin_core::{
    bake_offsets, BakedOffsets, KeyframeIndex, RenderBatchCache, StrokeWorldCache,
    SurfaceRaycaster,
};
use onionskin_data::StrokeObject;

use crate::detect::{self, ChangeDetector};
use crate::draw::{self, BatchSource, MotionPathCache, OverlayFrame};
use crate::driver::OffsetDriver;
use crate::host::{DepsgraphUpdate, EvalContext, SceneContext, TransformSampler};
use crate::settings::OnionSettings;
use crate::store::{AnchorStore, LockStore};

pub struct OnionSession {
    pub settings: OnionSettings,
    pub stroke_cache: StrokeWorldCache,
    pub batch_cache: RenderBatchCache,
    pub keyframe_index: KeyframeIndex,
    pub anchors: AnchorStore,
    pub locks: LockStore,
    pub driver: OffsetDriver,
    pub(crate) baked: Arc<Mutex<BakedOffsets>>,
    pub(crate) detector: ChangeDetector,
    pub(crate) motion_path: MotionPathCache,
    pub(crate) batch_source: BatchSource,
}

impl Default for OnionSession {
    fn default() -> Self {
        Self::new(OnionSettings::default())
    }
}

impl OnionSession {
    pub fn new(settings: OnionSettings) -> Self {
        let baked = Arc::new(Mutex::new(BakedOffsets::default()));
        Self {
            settings,
            stroke_cache: StrokeWorldCache::default(),
            batch_cache: RenderBatchCache::default(),
            keyframe_index: KeyframeIndex::default(),
            anchors: AnchorStore::default(),
            locks: LockStore::default(),
            driver: OffsetDriver::new(Arc::clone(&baked)),
            baked,
            detector: ChangeDetector::default(),
            motion_path: MotionPathCache::default(),
            batch_source: BatchSource::default(),
        }
    }

    /// Shared handle to the baked offset table.
    pub fn baked_offsets(&self) -> Arc<Mutex<BakedOffsets>> {
        Arc::clone(&self.baked)
    }

    /// Clear everything derived from stroke data: the stroke cache, the
    /// batch cache, the keyframe index, and the motion path.
    pub fn clear_caches(&mut self) {
        self.stroke_cache.clear();
        self.batch_cache.invalidate();
        self.keyframe_index.invalidate();
        self.motion_path.invalidate();
    }

    pub fn invalidate_motion_path(&mut self) {
        self.motion_path.invalidate();
    }

    /// File-load hook: everything cached belongs to the previous file.
    /// Loading is a safe context, so pending driver wiring completes too.
    pub fn on_file_load(&mut self) {
        self.clear_caches();
        self.detector.reset();
        self.driver.flush_wiring(EvalContext::Interactive);
    }

    /// Undo hook: stroke data was rewound under the caches, so visual
    /// state must be rebuilt from the restored data.
    pub fn on_undo(&mut self) {
        self.clear_caches();
        tracing::debug!("undo detected, caches cleared");
    }

    /// One dependency-graph evaluation tick. See [`crate::detect`].
    pub fn on_depsgraph_tick(
        &mut self,
        scene: &SceneContext,
        active: Option<&mut StrokeObject>,
        updates: &[DepsgraphUpdate],
        ctx: EvalContext,
        raycaster: &dyn SurfaceRaycaster,
    ) {
        detect::depsgraph_tick(self, scene, active, updates, ctx, raycaster);
    }

    /// Frame-change hook: upholds the live-frame cache invariant, applies
    /// the lock solver to every locked object, and refreshes the driver
    /// offset on the active one.
    pub fn on_frame_change(
        &mut self,
        scene: &SceneContext,
        objects: &mut [StrokeObject],
        active: Option<usize>,
    ) {
        detect::frame_change(self, scene, objects, active);
    }

    /// Assemble the overlay draw lists for the host. See [`crate::draw`].
    pub fn assemble_overlays(
        &mut self,
        scene: &SceneContext,
        obj: &StrokeObject,
        sampler: &dyn TransformSampler,
    ) -> OverlayFrame {
        draw::assemble_overlays(self, scene, obj, sampler)
    }

    /// Frame spans covered by each world-locked keyframe, for timeline
    /// lane display.
    pub fn locked_frame_spans(
        &mut self,
        scene: &SceneContext,
        obj: &StrokeObject,
    ) -> Vec<(i32, i32)> {
        draw::locked_frame_spans(self, scene, obj)
    }

    /// Toggle the surface-following feature. Enabling bakes immediately
    /// and wires the driver (UI toggles are a safe context); disabling
    /// invalidates the table and removes the driver.
    pub fn set_depth_interaction(
        &mut self,
        enabled: bool,
        obj: &mut StrokeObject,
        scene: &SceneContext,
        raycaster: &dyn SurfaceRaycaster,
        ctx: EvalContext,
    ) {
        self.settings.depth_interaction_enabled = enabled;
        self.batch_cache.invalidate();
        if enabled {
            bake_offsets(&self.baked, obj, scene.current_frame, raycaster);
            self.driver.request_wiring();
            self.driver.flush_wiring(ctx);
            self.driver.apply(obj, scene.current_frame);
        } else {
            if let Ok(mut table) = self.baked.lock() {
                table.invalidate();
            }
            self.driver.uninstall(obj);
        }
        self.motion_path.invalidate();
    }

    /// Change the global stroke Z lift. Stroke data is untouched (the
    /// offset is applied at batch build), but cached batches embed it.
    pub fn set_stroke_z_offset(&mut self, z_offset: f32) {
        if self.settings.stroke_z_offset != z_offset {
            self.settings.stroke_z_offset = z_offset;
            self.batch_cache.invalidate();
        }
    }
}
