//! # Change Detector / Invalidation Orchestrator
//!
//! Runs once per dependency-graph evaluation tick and decides, in order:
//!
//! 1. did the active object switch? → clear the session caches;
//! 2. did the drawing data or its animation change (identity check, name
//!    fallback)? → invalidate derived caches, re-bake offsets when the
//!    surface feature is on (wiring deferred out of restricted contexts);
//! 3. did keyframes move? → migrate anchor/lock records to the new frame
//!    numbers (before step 4, so a moved keyframe is never mistaken for a
//!    new one);
//! 4. are there genuinely new keyframes at the current frame? → capture
//!    the cursor as their anchor, optionally inheriting the previous
//!    keyframe's lock.
//!
//! The tick can re-enter itself when its own side effects (metadata
//! writes) trigger another evaluation; an explicit Idle/Running state
//! machine turns that into a logged skip.

use std::collections::{HashMap, HashSet};

use onionskin_core::{
    anchor_from_strokes, anchor_local_offset, apply_lock_for_frame, bake_offsets, keyframe_set,
    SurfaceRaycaster,
};
use onionskin_data::StrokeObject;

use crate::host::{DepsgraphUpdate, EvalContext, SceneContext, UpdateTarget};
use crate::session::OnionSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DetectorState {
    #[default]
    Idle,
    Running,
}

/// Tick guard plus the snapshots the diff steps compare against.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    state: DetectorState,
    last_keyframes: HashSet<(String, i32)>,
    last_active: Option<String>,
}

impl ChangeDetector {
    /// Enter the tick. Returns false when a tick is already running.
    pub(crate) fn begin(&mut self) -> bool {
        if self.state == DetectorState::Running {
            return false;
        }
        self.state = DetectorState::Running;
        true
    }

    pub(crate) fn finish(&mut self) {
        self.state = DetectorState::Idle;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == DetectorState::Running
    }

    pub(crate) fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.last_keyframes.clear();
        self.last_active = None;
    }
}

/// One dependency-graph evaluation tick.
pub fn depsgraph_tick(
    session: &mut OnionSession,
    scene: &SceneContext,
    active: Option<&mut StrokeObject>,
    updates: &[DepsgraphUpdate],
    ctx: EvalContext,
    raycaster: &dyn SurfaceRaycaster,
) {
    if !session.detector.begin() {
        tracing::trace!("depsgraph tick re-entered, skipping");
        return;
    }
    tick_impl(session, scene, active, updates, ctx, raycaster);
    session.detector.finish();
}

fn tick_impl(
    session: &mut OnionSession,
    scene: &SceneContext,
    active: Option<&mut StrokeObject>,
    updates: &[DepsgraphUpdate],
    ctx: EvalContext,
    raycaster: &dyn SurfaceRaycaster,
) {
    if !session.settings.enabled {
        return;
    }

    // (1) Active object switch clears everything scoped to it.
    let active_name = active.as_ref().map(|o| o.name.clone());
    if active_name != session.detector.last_active {
        if session.detector.last_active.is_some() {
            session.clear_caches();
            session.detector.last_keyframes.clear();
        }
        session.detector.last_active = active_name;
    }

    let Some(obj) = active else {
        return;
    };

    // Writable contexts are the chance to persist a pending legacy lock
    // migration and to complete driver wiring deferred from a restricted
    // tick.
    if ctx.allows_host_writes() {
        session.locks.migrate_legacy(obj);
        session.driver.flush_wiring(ctx);
    }

    // (2) Identity checks with name fallback, early exit once both found.
    let mut data_changed = false;
    let mut animation_changed = false;
    for update in updates {
        if data_changed && animation_changed {
            break;
        }
        match update.target {
            UpdateTarget::DrawingData { id } => {
                if id == obj.data_id || update.name == obj.name {
                    data_changed = true;
                }
            }
            UpdateTarget::ActionCurve { id } => {
                if let Some(action) = obj.action_id {
                    if id == action || update.name == obj.name {
                        animation_changed = true;
                    }
                }
            }
            UpdateTarget::Other => {}
        }
    }

    if data_changed || animation_changed {
        session.batch_cache.invalidate();
        session.keyframe_index.invalidate();
        session.motion_path.invalidate();

        // Cached neighbor frames hold stale strokes once the drawing
        // itself changed.
        if data_changed {
            session.stroke_cache.clear();
        }

        // The baked table is read through a driver, so stale data would
        // persist silently; re-bake now. Wiring itself stays deferred in
        // restricted contexts.
        if animation_changed && session.settings.depth_interaction_enabled {
            bake_offsets(&session.baked, obj, scene.current_frame, raycaster);
            session.driver.request_wiring();
            session.driver.flush_wiring(ctx);
        }
    }

    // (3) + (4) only when the drawing data itself changed.
    if data_changed {
        let filter = session.settings.filter();
        let current = keyframe_set(obj, &filter);
        let last = std::mem::take(&mut session.detector.last_keyframes);

        // First tick for this object just primes the snapshot.
        if !last.is_empty() {
            migrate_moved_keyframes(session, obj, &last, &current);
            if session.settings.anchor_enabled {
                capture_new_keyframes(session, scene, obj, &last, &current);
            }
        }
        session.detector.last_keyframes = current;
    }
}

/// Pair up equal-size removed/added keyframe groups per layer and move
/// the anchor and lock records along with them.
fn migrate_moved_keyframes(
    session: &mut OnionSession,
    obj: &mut StrokeObject,
    last: &HashSet<(String, i32)>,
    current: &HashSet<(String, i32)>,
) {
    let mut removed: HashMap<&str, Vec<i32>> = HashMap::new();
    for (layer, frame) in last.difference(current) {
        removed.entry(layer.as_str()).or_default().push(*frame);
    }
    let mut added: HashMap<&str, Vec<i32>> = HashMap::new();
    for (layer, frame) in current.difference(last) {
        added.entry(layer.as_str()).or_default().push(*frame);
    }

    for (layer, mut old_frames) in removed {
        let Some(new_frames) = added.get(layer) else {
            continue;
        };
        if old_frames.len() != new_frames.len() {
            continue;
        }
        let mut new_frames = new_frames.clone();
        old_frames.sort_unstable();
        new_frames.sort_unstable();

        let layer = layer.to_string();
        for (&old_frame, &new_frame) in old_frames.iter().zip(new_frames.iter()) {
            session
                .anchors
                .update(obj, |t| t.migrate_frame(&layer, old_frame, new_frame));
            session
                .locks
                .update(obj, |t| t.migrate_frame(old_frame, new_frame));
        }
    }
}

/// Capture the cursor as the anchor of keyframes that appeared at the
/// current frame, and inherit the preceding keyframe's lock when
/// configured.
fn capture_new_keyframes(
    session: &mut OnionSession,
    scene: &SceneContext,
    obj: &mut StrokeObject,
    last: &HashSet<(String, i32)>,
    current: &HashSet<(String, i32)>,
) {
    let cursor = scene.cursor;
    let cam_dir = scene.camera_forward();

    let new_pairs: Vec<(String, i32)> = current.difference(last).cloned().collect();
    for (layer_name, frame) in new_pairs {
        if frame != scene.current_frame {
            continue;
        }

        if session.anchors.table(obj).anchor(&layer_name, frame).is_none() {
            session
                .anchors
                .update(obj, |t| t.set_anchor(&layer_name, frame, cursor, cam_dir));
        }

        if session.settings.world_lock_inherit {
            inherit_lock(session, obj, &layer_name, frame);
        }
    }
}

/// Lock a brand-new keyframe the way its predecessor was locked, with an
/// anchor re-derived from the new keyframe's own stroke geometry.
fn inherit_lock(session: &mut OnionSession, obj: &mut StrokeObject, layer_name: &str, frame: i32) {
    let Some(prev) = obj.layer(layer_name).and_then(|layer| {
        layer
            .frames
            .iter()
            .map(|kf| kf.frame_number)
            .filter(|&f| f < frame)
            .max()
    }) else {
        return;
    };

    {
        let locks = session.locks.table(obj);
        if !locks.is_locked(prev) || locks.is_locked(frame) {
            return;
        }
    }

    let world = obj.transforms.world;
    let Some(anchor) = obj
        .layer(layer_name)
        .and_then(|layer| anchor_from_strokes(&world, layer, frame))
    else {
        return;
    };

    let offset = anchor_local_offset(&world, anchor);
    let original = obj.transforms.parent_inverse;
    let local = obj.transforms.local;
    session.locks.update(obj, |t| {
        t.set_lock(frame, anchor, offset, Some(original), Some(local))
    });
    tracing::debug!(frame, from = prev, "inherited world lock");
}

/// Frame-change hook.
///
/// Evicts the new current frame from the stroke cache (the current frame
/// is drawn live, never from cache), re-solves every locked object so
/// nothing comes visually unstuck while a different object is active, and
/// refreshes the active object's driver offset.
pub fn frame_change(
    session: &mut OnionSession,
    scene: &SceneContext,
    objects: &mut [StrokeObject],
    active: Option<usize>,
) {
    if !session.settings.enabled {
        return;
    }

    session.stroke_cache.remove(scene.current_frame);

    for obj in objects.iter_mut() {
        let locks = session.locks.table(obj);
        apply_lock_for_frame(obj, locks, scene.current_frame);
    }

    if let Some(idx) = active {
        if session.settings.depth_interaction_enabled {
            if let Some(obj) = objects.get_mut(idx) {
                session.driver.apply(obj, scene.current_frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Quat, Vec3};
    use onionskin_core::SurfaceHit;
    use onionskin_data::{Drawing, LayerKeyframe, StrokeLayer};

    struct NoSurface;

    impl SurfaceRaycaster for NoSurface {
        fn cast_down(&self, _origin: Vec3) -> Option<SurfaceHit> {
            None
        }
    }

    fn scene(current_frame: i32) -> SceneContext {
        SceneContext {
            current_frame,
            frame_start: 1,
            frame_end: 100,
            cursor: Vec3::new(1.0, 2.0, 3.0),
            camera_world: None,
        }
    }

    fn object_with_keyframes(frames: &[i32]) -> StrokeObject {
        let mut obj = StrokeObject::new("board");
        obj.data_id = 7;
        obj.action_id = Some(8);
        let mut layer = StrokeLayer::new("ink");
        layer.frames = frames
            .iter()
            .map(|&f| LayerKeyframe {
                frame_number: f,
                drawing: Drawing {
                    positions: vec![Vec3::ZERO, Vec3::X],
                    stroke_offsets: vec![0],
                    material_indices: vec![0],
                    stroke_selected: vec![],
                },
                selected: false,
            })
            .collect();
        obj.layers.push(layer);
        obj
    }

    fn enabled_session() -> OnionSession {
        let mut session = OnionSession::default();
        session.settings.enabled = true;
        session.settings.anchor_enabled = true;
        session
    }

    fn data_update() -> Vec<DepsgraphUpdate> {
        vec![DepsgraphUpdate::drawing_data(7, "board")]
    }

    #[test]
    fn moved_keyframe_migrates_anchor_and_lock_records() {
        let mut session = enabled_session();
        let mut obj = object_with_keyframes(&[1, 20]);

        // Prime the snapshot.
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );

        session.anchors.update(&mut obj, |t| {
            t.set_anchor("ink", 20, Vec3::splat(2.0), None)
        });
        session
            .locks
            .update(&mut obj, |t| t.set_lock(20, Vec3::ONE, Vec3::Z, None, None));

        // Move keyframe 20 to 25.
        obj.layers[0].frames[1].frame_number = 25;
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );

        let anchors = session.anchors.table(&obj);
        assert!(anchors.anchor("ink", 20).is_none());
        assert_eq!(anchors.anchor("ink", 25), Some(Vec3::splat(2.0)));

        let locks = session.locks.table(&obj);
        assert!(locks.entry(20).is_none());
        assert!(locks.is_locked(25));
    }

    #[test]
    fn new_keyframe_at_current_frame_captures_cursor_anchor() {
        let mut session = enabled_session();
        let mut obj = object_with_keyframes(&[1]);

        session.on_depsgraph_tick(
            &scene(10),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );

        // Artist draws on frame 10: a new keyframe appears there.
        obj.layers[0].frames.push(LayerKeyframe {
            frame_number: 10,
            drawing: Drawing::default(),
            selected: false,
        });
        session.on_depsgraph_tick(
            &scene(10),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );

        assert_eq!(
            session.anchors.table(&obj).anchor("ink", 10),
            Some(Vec3::new(1.0, 2.0, 3.0))
        );
        // The pre-existing keyframe got no anchor.
        assert!(session.anchors.table(&obj).anchor("ink", 1).is_none());
    }

    #[test]
    fn lock_inherit_locks_new_keyframe_from_predecessor() {
        let mut session = enabled_session();
        session.settings.world_lock_inherit = true;
        let mut obj = object_with_keyframes(&[1]);
        obj.parent = Some("camera_rig".into());
        obj.transforms.parent_world = Some(Mat4::from_quat(Quat::from_rotation_z(0.5)));

        session.on_depsgraph_tick(
            &scene(10),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );
        session
            .locks
            .update(&mut obj, |t| t.set_lock(1, Vec3::ZERO, Vec3::ZERO, None, None));

        obj.layers[0].frames.push(LayerKeyframe {
            frame_number: 10,
            drawing: Drawing {
                positions: vec![Vec3::new(2.0, 0.0, 0.0), Vec3::new(4.0, 2.0, 1.0)],
                stroke_offsets: vec![0],
                material_indices: vec![0],
                stroke_selected: vec![],
            },
            selected: false,
        });
        session.on_depsgraph_tick(
            &scene(10),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );

        let locks = session.locks.table(&obj);
        assert!(locks.is_locked(10));
        // Anchor was re-derived from the new keyframe's own strokes:
        // centroid XY, lowest Z.
        assert_eq!(
            locks.lock(10).unwrap().anchor_world,
            Some(Vec3::new(3.0, 1.0, 0.0))
        );
    }

    #[test]
    fn active_object_switch_clears_caches() {
        let mut session = enabled_session();
        let mut a = object_with_keyframes(&[1]);
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut a),
            &[],
            EvalContext::Interactive,
            &NoSurface,
        );
        session.stroke_cache.put(3, vec![]);

        let mut b = object_with_keyframes(&[1]);
        b.name = "other".into();
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut b),
            &[],
            EvalContext::Interactive,
            &NoSurface,
        );
        assert!(session.stroke_cache.is_empty());
    }

    #[test]
    fn reentrant_tick_is_skipped() {
        let mut session = enabled_session();
        let mut obj = object_with_keyframes(&[1]);

        assert!(session.detector.begin());
        assert!(session.detector.is_running());

        // A nested tick must not touch anything.
        session.stroke_cache.put(3, vec![]);
        let mut other = object_with_keyframes(&[1]);
        other.name = "other".into();
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut other),
            &[],
            EvalContext::Interactive,
            &NoSurface,
        );
        assert!(session.stroke_cache.contains(3));

        session.detector.finish();
        assert!(!session.detector.is_running());

        // After finishing, ticks run again.
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut obj),
            &data_update(),
            EvalContext::Interactive,
            &NoSurface,
        );
    }

    #[test]
    fn animation_change_rebakes_when_surface_following_enabled() {
        let mut session = enabled_session();
        session.settings.depth_interaction_enabled = true;
        let mut obj = object_with_keyframes(&[1]);

        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut obj),
            &[DepsgraphUpdate::action_curve(8, "board")],
            EvalContext::Restricted,
            &NoSurface,
        );

        assert!(session.baked_offsets().lock().unwrap().is_valid());
        // Restricted context: wiring stays pending.
        assert!(session.driver.is_pending());
        assert!(!session.driver.is_installed());

        // Next safe tick completes it.
        session.on_depsgraph_tick(
            &scene(1),
            Some(&mut obj),
            &[],
            EvalContext::Interactive,
            &NoSurface,
        );
        assert!(session.driver.is_installed());
    }

    #[test]
    fn frame_change_upholds_live_frame_invariant_and_applies_locks() {
        let mut session = enabled_session();
        let mut obj = object_with_keyframes(&[1]);
        obj.parent = Some("camera_rig".into());
        obj.transforms.parent_world =
            Some(Mat4::from_quat(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2)));
        session.locks.update(&mut obj, |t| {
            t.set_lock(
                1,
                Vec3::ZERO,
                Vec3::Z,
                Some(Mat4::IDENTITY),
                Some(Mat4::IDENTITY),
            )
        });

        session.stroke_cache.put(5, vec![]);
        let mut objects = vec![obj];
        session.on_frame_change(&scene(5), &mut objects, Some(0));

        // The new current frame's entry is gone.
        assert!(!session.stroke_cache.contains(5));

        // The lock was applied: the anchor sits at the stored world spot.
        let world = objects[0].transforms.world;
        let (_, rot, origin) = world.to_scale_rotation_translation();
        assert!(((origin + rot * Vec3::Z) - Vec3::ZERO).length() < 1e-5);
    }
}
