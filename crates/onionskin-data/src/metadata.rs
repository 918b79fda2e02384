//! # Persisted Anchor & Lock Metadata
//!
//! The anchor and world-lock tables are persisted as JSON blobs on the
//! stroke object, next to the host project's own save data. Files written
//! by older versions are still around, so parsing is deliberately
//! tolerant: every unexpected shape degrades to "no data" for that entry
//! rather than failing the whole table, and legacy shapes are upgraded on
//! read.
//!
//! Legacy shapes handled:
//! - an anchor entry that is a bare `[x, y, z]` array instead of an object
//!   (upgraded to `{ "pos": [...] }`),
//! - a layer-keyed lock table embedded in the anchors blob (migrated once
//!   into the object-level lock table, keyed by frame alone).

use std::collections::BTreeMap;

use glam::{Mat4, Vec3, Vec4};
use serde_json::{json, Map, Value};

/// Object property key holding the anchor table.
pub const ANCHORS_KEY: &str = "world_onion_anchors";
/// Object property key holding the world-lock table.
pub const LOCKS_KEY: &str = "world_onion_locks";

/// Per-layer, per-frame anchor data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorEntry {
    /// User-placed anchor position (cursor workflow).
    pub pos: Option<Vec3>,
    /// Camera forward direction captured when the anchor was set.
    pub cam_dir: Option<Vec3>,
    /// Stroke-derived anchor used as the world-lock rotation pivot.
    pub lock_anchor: Option<Vec3>,
}

impl AnchorEntry {
    pub fn is_empty(&self) -> bool {
        self.pos.is_none() && self.cam_dir.is_none() && self.lock_anchor.is_none()
    }
}

/// The anchor table: `layer name -> frame -> entry`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorTable {
    layers: BTreeMap<String, BTreeMap<i32, AnchorEntry>>,
}

impl AnchorTable {
    /// Parse the persisted blob. Corrupt or unexpected data yields an
    /// empty table; a legacy bare-position entry becomes `pos`.
    pub fn parse(json_blob: &str) -> Self {
        let root: Value = match serde_json::from_str(json_blob) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("anchor table unreadable, starting empty: {err}");
                return Self::default();
            }
        };

        let mut table = Self::default();
        let Value::Object(layers) = root else {
            return table;
        };

        for (layer_name, frames_value) in layers {
            let Value::Object(frames) = frames_value else {
                continue;
            };
            for (frame_key, entry_value) in frames {
                let Ok(frame) = frame_key.parse::<i32>() else {
                    continue;
                };
                if let Some(entry) = anchor_entry_from_value(&entry_value) {
                    table
                        .layers
                        .entry(layer_name.clone())
                        .or_default()
                        .insert(frame, entry);
                }
            }
        }
        table
    }

    /// Serialize back to the persisted shape (frame numbers as string
    /// keys; only present fields emitted).
    pub fn to_json(&self) -> String {
        let mut layers = Map::new();
        for (layer_name, frames) in &self.layers {
            let mut frames_obj = Map::new();
            for (frame, entry) in frames {
                let mut obj = Map::new();
                if let Some(pos) = entry.pos {
                    obj.insert("pos".into(), vec3_to_value(pos));
                }
                if let Some(dir) = entry.cam_dir {
                    obj.insert("cam_dir".into(), vec3_to_value(dir));
                }
                if let Some(anchor) = entry.lock_anchor {
                    obj.insert("lock_anchor".into(), vec3_to_value(anchor));
                }
                frames_obj.insert(frame.to_string(), Value::Object(obj));
            }
            layers.insert(layer_name.clone(), Value::Object(frames_obj));
        }
        Value::Object(layers).to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.values().all(|frames| frames.is_empty())
    }

    pub fn entry(&self, layer: &str, frame: i32) -> Option<&AnchorEntry> {
        self.layers.get(layer)?.get(&frame)
    }

    pub fn anchor(&self, layer: &str, frame: i32) -> Option<Vec3> {
        self.entry(layer, frame)?.pos
    }

    pub fn camera_dir(&self, layer: &str, frame: i32) -> Option<Vec3> {
        self.entry(layer, frame)?.cam_dir
    }

    /// The world-lock rotation pivot: the stroke-derived anchor when
    /// present, the user anchor otherwise.
    pub fn lock_anchor(&self, layer: &str, frame: i32) -> Option<Vec3> {
        let entry = self.entry(layer, frame)?;
        entry.lock_anchor.or(entry.pos)
    }

    /// Set the user anchor, preserving whatever else the entry holds.
    pub fn set_anchor(&mut self, layer: &str, frame: i32, pos: Vec3, cam_dir: Option<Vec3>) {
        let entry = self
            .layers
            .entry(layer.to_string())
            .or_default()
            .entry(frame)
            .or_default();
        entry.pos = Some(pos);
        if cam_dir.is_some() {
            entry.cam_dir = cam_dir;
        }
    }

    pub fn set_lock_anchor(&mut self, layer: &str, frame: i32, pos: Vec3) {
        self.layers
            .entry(layer.to_string())
            .or_default()
            .entry(frame)
            .or_default()
            .lock_anchor = Some(pos);
    }

    pub fn remove(&mut self, layer: &str, frame: i32) {
        if let Some(frames) = self.layers.get_mut(layer) {
            frames.remove(&frame);
        }
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Re-key an entry when the owning keyframe moved in the timeline.
    pub fn migrate_frame(&mut self, layer: &str, old_frame: i32, new_frame: i32) {
        if let Some(frames) = self.layers.get_mut(layer) {
            if let Some(entry) = frames.remove(&old_frame) {
                frames.insert(new_frame, entry);
                tracing::debug!(layer, old_frame, new_frame, "migrated anchor entry");
            }
        }
    }

    pub fn layers(&self) -> impl Iterator<Item = (&String, &BTreeMap<i32, AnchorEntry>)> {
        self.layers.iter()
    }
}

fn anchor_entry_from_value(value: &Value) -> Option<AnchorEntry> {
    // Legacy shape: a bare position array.
    if let Some(pos) = vec3_from_value(value) {
        return Some(AnchorEntry {
            pos: Some(pos),
            ..Default::default()
        });
    }

    let Value::Object(obj) = value else {
        return None;
    };
    Some(AnchorEntry {
        pos: obj.get("pos").and_then(vec3_from_value),
        cam_dir: obj.get("cam_dir").and_then(vec3_from_value),
        lock_anchor: obj.get("lock_anchor").and_then(vec3_from_value),
    })
}

/// Per-frame world-lock data, keyed by frame at the object level.
///
/// Unlocking flips `world_locked` off but keeps the rest of the entry, so
/// re-locking the same frame restores the prior anchor and matrices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockEntry {
    pub world_locked: bool,
    /// World position of the anchor that stays fixed while locked.
    pub anchor_world: Option<Vec3>,
    /// Offset from the object origin to the anchor, in local coordinates.
    pub anchor_local_offset: Option<Vec3>,
    /// The object's local matrix captured at lock time.
    pub matrix_local: Option<Mat4>,
    /// The parent-inverse matrix to restore on unlock.
    pub original_parent_inverse: Option<Mat4>,
    /// Anchor recovered from a legacy layer-level lock, position only.
    pub lock_position: Option<Vec3>,
}

/// The object-level world-lock table: `frame -> entry`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockTable {
    frames: BTreeMap<i32, LockEntry>,
}

impl LockTable {
    pub fn parse(json_blob: &str) -> Self {
        let root: Value = match serde_json::from_str(json_blob) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("lock table unreadable, starting empty: {err}");
                return Self::default();
            }
        };

        let mut table = Self::default();
        let Value::Object(frames) = root else {
            return table;
        };
        for (frame_key, entry_value) in frames {
            let Ok(frame) = frame_key.parse::<i32>() else {
                continue;
            };
            let Value::Object(obj) = entry_value else {
                continue;
            };
            table.frames.insert(
                frame,
                LockEntry {
                    world_locked: obj
                        .get("world_locked")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    anchor_world: obj.get("anchor_world").and_then(vec3_from_value),
                    anchor_local_offset: obj.get("anchor_local_offset").and_then(vec3_from_value),
                    matrix_local: obj.get("matrix_local").and_then(mat4_from_value),
                    original_parent_inverse: obj
                        .get("original_parent_inverse")
                        .and_then(mat4_from_value),
                    lock_position: obj.get("lock_position").and_then(vec3_from_value),
                },
            );
        }
        table
    }

    /// One-shot migration of the legacy layer-level lock data that older
    /// versions embedded in the anchors blob. A frame is considered locked
    /// if any layer locked it; the anchor degrades to the lock matrix's
    /// translation. Returns `None` when the blob carries no lock data.
    pub fn from_legacy_anchors(anchors_blob: &str) -> Option<Self> {
        let root: Value = serde_json::from_str(anchors_blob).ok()?;
        let Value::Object(layers) = root else {
            return None;
        };

        let mut table = Self::default();
        for (_layer, frames_value) in layers {
            let Value::Object(frames) = frames_value else {
                continue;
            };
            for (frame_key, entry_value) in frames {
                let Ok(frame) = frame_key.parse::<i32>() else {
                    continue;
                };
                let Value::Object(obj) = entry_value else {
                    continue;
                };
                if !obj
                    .get("world_locked")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    continue;
                }
                if table.frames.contains_key(&frame) {
                    continue;
                }
                if let Some(matrix) = obj.get("lock_matrix").and_then(mat4_from_value) {
                    table.frames.insert(
                        frame,
                        LockEntry {
                            world_locked: true,
                            lock_position: Some(matrix.w_axis.truncate()),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        if table.frames.is_empty() {
            None
        } else {
            tracing::debug!(
                frames = table.frames.len(),
                "migrated legacy layer locks to object locks"
            );
            Some(table)
        }
    }

    pub fn to_json(&self) -> String {
        let mut frames = Map::new();
        for (frame, entry) in &self.frames {
            let mut obj = Map::new();
            obj.insert("world_locked".into(), Value::Bool(entry.world_locked));
            if let Some(v) = entry.anchor_world {
                obj.insert("anchor_world".into(), vec3_to_value(v));
            }
            if let Some(v) = entry.anchor_local_offset {
                obj.insert("anchor_local_offset".into(), vec3_to_value(v));
            }
            if let Some(m) = entry.matrix_local {
                obj.insert("matrix_local".into(), mat4_to_value(&m));
            }
            if let Some(m) = entry.original_parent_inverse {
                obj.insert("original_parent_inverse".into(), mat4_to_value(&m));
            }
            if let Some(v) = entry.lock_position {
                obj.insert("lock_position".into(), vec3_to_value(v));
            }
            frames.insert(frame.to_string(), Value::Object(obj));
        }
        Value::Object(frames).to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn entry(&self, frame: i32) -> Option<&LockEntry> {
        self.frames.get(&frame)
    }

    /// The entry for `frame` when it is actually locked.
    pub fn lock(&self, frame: i32) -> Option<&LockEntry> {
        self.frames.get(&frame).filter(|e| e.world_locked)
    }

    pub fn is_locked(&self, frame: i32) -> bool {
        self.lock(frame).is_some()
    }

    pub fn locked_frames(&self) -> Vec<i32> {
        self.frames
            .iter()
            .filter(|(_, e)| e.world_locked)
            .map(|(&f, _)| f)
            .collect()
    }

    pub fn set_lock(
        &mut self,
        frame: i32,
        anchor_world: Vec3,
        anchor_local_offset: Vec3,
        original_parent_inverse: Option<Mat4>,
        matrix_local: Option<Mat4>,
    ) {
        let entry = self.frames.entry(frame).or_default();
        entry.world_locked = true;
        entry.anchor_world = Some(anchor_world);
        entry.anchor_local_offset = Some(anchor_local_offset);
        if original_parent_inverse.is_some() {
            entry.original_parent_inverse = original_parent_inverse;
        }
        if matrix_local.is_some() {
            entry.matrix_local = matrix_local;
        }
    }

    /// Refresh the anchor of an existing lock without touching the
    /// captured matrices.
    pub fn update_anchor(&mut self, frame: i32, anchor_world: Vec3, anchor_local_offset: Vec3) {
        if let Some(entry) = self.frames.get_mut(&frame) {
            entry.anchor_world = Some(anchor_world);
            entry.anchor_local_offset = Some(anchor_local_offset);
        }
    }

    /// Re-lock a frame from its retained entry, restoring the anchor and
    /// matrices captured before the last unlock. Returns false when no
    /// reusable entry exists (the caller captures fresh data instead).
    pub fn relock(&mut self, frame: i32) -> bool {
        match self.frames.get_mut(&frame) {
            Some(entry) if entry.anchor_world.is_some() || entry.lock_position.is_some() => {
                entry.world_locked = true;
                true
            }
            _ => false,
        }
    }

    /// Unlock a frame. The entry is kept (minus the locked flag) so a
    /// later re-lock restores the prior geometry.
    pub fn unlock(&mut self, frame: i32) {
        if let Some(entry) = self.frames.get_mut(&frame) {
            entry.world_locked = false;
        }
    }

    pub fn remove(&mut self, frame: i32) {
        self.frames.remove(&frame);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn migrate_frame(&mut self, old_frame: i32, new_frame: i32) {
        if let Some(entry) = self.frames.remove(&old_frame) {
            self.frames.insert(new_frame, entry);
            tracing::debug!(old_frame, new_frame, "migrated lock entry");
        }
    }
}

/// Matrix rows as persisted: row-major 4x4, `rows[r][c]`.
pub fn mat4_to_rows(m: &Mat4) -> [[f32; 4]; 4] {
    let cols = m.to_cols_array_2d();
    let mut rows = [[0.0f32; 4]; 4];
    for (c, col) in cols.iter().enumerate() {
        for (r, v) in col.iter().enumerate() {
            rows[r][c] = *v;
        }
    }
    rows
}

pub fn mat4_from_rows(rows: [[f32; 4]; 4]) -> Mat4 {
    Mat4::from_cols(
        Vec4::new(rows[0][0], rows[1][0], rows[2][0], rows[3][0]),
        Vec4::new(rows[0][1], rows[1][1], rows[2][1], rows[3][1]),
        Vec4::new(rows[0][2], rows[1][2], rows[2][2], rows[3][2]),
        Vec4::new(rows[0][3], rows[1][3], rows[2][3], rows[3][3]),
    )
}

fn vec3_from_value(value: &Value) -> Option<Vec3> {
    let arr = value.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    let x = arr[0].as_f64()? as f32;
    let y = arr[1].as_f64()? as f32;
    let z = arr[2].as_f64()? as f32;
    Some(Vec3::new(x, y, z))
}

fn vec3_to_value(v: Vec3) -> Value {
    json!([v.x, v.y, v.z])
}

fn mat4_from_value(value: &Value) -> Option<Mat4> {
    let rows_value = value.as_array()?;
    if rows_value.len() != 4 {
        return None;
    }
    let mut rows = [[0.0f32; 4]; 4];
    for (r, row_value) in rows_value.iter().enumerate() {
        let row = row_value.as_array()?;
        if row.len() != 4 {
            return None;
        }
        for (c, v) in row.iter().enumerate() {
            rows[r][c] = v.as_f64()? as f32;
        }
    }
    Some(mat4_from_rows(rows))
}

fn mat4_to_value(m: &Mat4) -> Value {
    let rows = mat4_to_rows(m);
    json!(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_blob_degrades_to_empty() {
        assert!(AnchorTable::parse("not json {").is_empty());
        assert!(LockTable::parse("[1, 2, 3]").is_empty());
    }

    #[test]
    fn legacy_bare_position_upgrades_to_pos() {
        let table = AnchorTable::parse(r#"{"ink": {"5": [1.0, 2.0, 3.0]}}"#);
        assert_eq!(table.anchor("ink", 5), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(table.camera_dir("ink", 5), None);

        // Serializing writes the structured shape back out.
        let reparsed = AnchorTable::parse(&table.to_json());
        assert_eq!(reparsed.anchor("ink", 5), Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn anchor_round_trip_preserves_all_fields() {
        let mut table = AnchorTable::default();
        table.set_anchor("ink", 5, Vec3::new(1.0, 2.0, 3.0), Some(Vec3::NEG_Z));
        table.set_lock_anchor("ink", 5, Vec3::new(0.5, 0.5, 0.0));
        table.set_anchor("rough", 12, Vec3::ONE, None);

        let reparsed = AnchorTable::parse(&table.to_json());
        assert_eq!(reparsed, table);
    }

    #[test]
    fn lock_anchor_falls_back_to_user_anchor() {
        let mut table = AnchorTable::default();
        table.set_anchor("ink", 5, Vec3::X, None);
        assert_eq!(table.lock_anchor("ink", 5), Some(Vec3::X));

        table.set_lock_anchor("ink", 5, Vec3::Y);
        assert_eq!(table.lock_anchor("ink", 5), Some(Vec3::Y));
    }

    #[test]
    fn lock_round_trip_preserves_matrices() {
        let mut table = LockTable::default();
        let local = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        table.set_lock(
            42,
            Vec3::new(4.0, 5.0, 6.0),
            Vec3::new(0.0, 0.0, 1.0),
            Some(Mat4::IDENTITY),
            Some(local),
        );

        let reparsed = LockTable::parse(&table.to_json());
        assert_eq!(reparsed, table);
        let entry = reparsed.lock(42).unwrap();
        assert_eq!(entry.matrix_local, Some(local));
    }

    #[test]
    fn unlock_preserves_entry_for_relock() {
        let mut table = LockTable::default();
        table.set_lock(10, Vec3::X, Vec3::Z, None, None);
        table.unlock(10);

        assert!(!table.is_locked(10));
        let entry = table.entry(10).unwrap();
        assert_eq!(entry.anchor_world, Some(Vec3::X));
        assert_eq!(entry.anchor_local_offset, Some(Vec3::Z));
    }

    #[test]
    fn migrate_frame_rekeys_and_removes_old_entry() {
        let mut anchors = AnchorTable::default();
        anchors.set_anchor("ink", 20, Vec3::ONE, None);
        anchors.migrate_frame("ink", 20, 25);
        assert!(anchors.anchor("ink", 20).is_none());
        assert_eq!(anchors.anchor("ink", 25), Some(Vec3::ONE));

        let mut locks = LockTable::default();
        locks.set_lock(20, Vec3::X, Vec3::Y, None, None);
        locks.migrate_frame(20, 25);
        assert!(locks.entry(20).is_none());
        assert!(locks.is_locked(25));
    }

    #[test]
    fn legacy_layer_locks_migrate_to_object_locks() {
        let blob = r#"{
            "ink": {
                "3": {"pos": [0, 0, 0], "world_locked": true,
                      "lock_matrix": [[1,0,0,7],[0,1,0,8],[0,0,1,9],[0,0,0,1]]},
                "9": {"pos": [1, 1, 1]}
            }
        }"#;
        let table = LockTable::from_legacy_anchors(blob).unwrap();
        assert!(table.is_locked(3));
        assert!(table.entry(9).is_none());
        assert_eq!(
            table.entry(3).unwrap().lock_position,
            Some(Vec3::new(7.0, 8.0, 9.0))
        );
    }

    #[test]
    fn legacy_migration_skips_blobs_without_locks() {
        let blob = r#"{"ink": {"3": {"pos": [0, 0, 0]}}}"#;
        assert!(LockTable::from_legacy_anchors(blob).is_none());
    }

    #[test]
    fn matrix_rows_round_trip() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))
            * Mat4::from_rotation_z(std::f32::consts::FRAC_PI_3);
        let rows = mat4_to_rows(&m);
        // Translation lands in the last column of the row representation.
        assert_eq!(rows[0][3], 1.0);
        assert_eq!(rows[1][3], 2.0);
        assert_eq!(rows[2][3], 3.0);
        assert_eq!(mat4_from_rows(rows), m);
    }
}
