//! # Caches
//!
//! The three bounded stores between extraction and the GPU:
//!
//! - **StrokeWorldCache**: frame-keyed world-space stroke lists.
//! - **RenderBatchCache**: derived draw batches keyed by
//!   `(frame, quantized z offset)`; losing an entry is a performance cost,
//!   never a correctness bug.
//! - **KeyframeIndex**: lazily rebuilt sorted keyframe list with
//!   at-or-before lookup and display-window selection.
//!
//! Both caches evict in pure insertion order (FIFO): frames are visited
//! in roughly chronological sweeps during playback and scrubbing, so
//! recency tracking buys nothing here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use onionskin_data::StrokeObject;

use crate::batch::BatchEntry;
use crate::extract::{LayerFilter, StrokeRecord};

/// Stroke cache bound. At typical scene sizes this covers a few minutes
/// of animation.
pub const STROKE_CACHE_CAPACITY: usize = 2000;

/// Batch cache bound; batches are much heavier than stroke lists.
pub const BATCH_CACHE_CAPACITY: usize = 100;

/// Frame-keyed store of extracted world-space strokes.
///
/// The currently displayed frame is never cached: it is drawn live by the
/// host, and a cached copy would go stale the moment the artist edits it.
/// Callers keep it out; `remove` exists so a frame change can evict an
/// entry that was cached earlier as a neighbor.
#[derive(Debug)]
pub struct StrokeWorldCache {
    capacity: usize,
    order: VecDeque<i32>,
    entries: HashMap<i32, Arc<Vec<StrokeRecord>>>,
}

impl Default for StrokeWorldCache {
    fn default() -> Self {
        Self::with_capacity(STROKE_CACHE_CAPACITY)
    }
}

impl StrokeWorldCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Insert strokes for a frame. Re-inserting an existing frame replaces
    /// its strokes without refreshing its eviction position.
    pub fn put(&mut self, frame: i32, strokes: Vec<StrokeRecord>) {
        let strokes = Arc::new(strokes);
        if self.entries.insert(frame, strokes).is_none() {
            self.order.push_back(frame);
        }

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn get(&self, frame: i32) -> Option<Arc<Vec<StrokeRecord>>> {
        self.entries.get(&frame).cloned()
    }

    pub fn contains(&self, frame: i32) -> bool {
        self.entries.contains_key(&frame)
    }

    pub fn remove(&mut self, frame: i32) {
        if self.entries.remove(&frame).is_some() {
            self.order.retain(|&f| f != frame);
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(frames = self.entries.len(), "stroke cache cleared");
        }
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frames currently held, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = i32> + '_ {
        self.order.iter().copied()
    }

    pub fn stats(&self) -> String {
        format!("{} frames cached", self.entries.len())
    }
}

/// Key for a cached batch: the frame plus the resolved Z offset quantized
/// to 1e-4, so float jitter doesn't fragment the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub frame: i32,
    z_quantized: i32,
}

impl BatchKey {
    pub fn new(frame: i32, z_offset: f32) -> Self {
        Self {
            frame,
            z_quantized: (z_offset * 1e4).round() as i32,
        }
    }

    pub fn z_offset(&self) -> f32 {
        self.z_quantized as f32 * 1e-4
    }
}

/// Pure derived cache of draw batches.
///
/// Never invalidated by stroke-data changes on its own: callers clear it
/// whenever underlying geometry might have changed. No dependency
/// tracking, at the cost of disciplined invalidation at every
/// geometry-mutating call site.
#[derive(Debug)]
pub struct RenderBatchCache {
    capacity: usize,
    order: VecDeque<BatchKey>,
    entries: HashMap<BatchKey, Arc<BatchEntry>>,
}

impl Default for RenderBatchCache {
    fn default() -> Self {
        Self::with_capacity(BATCH_CACHE_CAPACITY)
    }
}

impl RenderBatchCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Fetch the batches for `key`, building and caching them on a miss.
    pub fn get_or_build(
        &mut self,
        key: BatchKey,
        builder: impl FnOnce() -> BatchEntry,
    ) -> Arc<BatchEntry> {
        if let Some(entry) = self.entries.get(&key) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(builder());
        self.entries.insert(key, Arc::clone(&entry));
        self.order.push_back(key);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        entry
    }

    pub fn contains(&self, key: &BatchKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Full clear; the only invalidation this cache supports.
    pub fn invalidate(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(batches = self.entries.len(), "batch cache invalidated");
        }
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sorted, de-duplicated union of all visible layers' keyframe numbers.
/// Rebuilt lazily after `invalidate`.
#[derive(Debug, Default)]
pub struct KeyframeIndex {
    frames: Option<Vec<i32>>,
}

impl KeyframeIndex {
    pub fn invalidate(&mut self) {
        self.frames = None;
    }

    pub fn frames(&mut self, obj: &StrokeObject) -> &[i32] {
        self.frames.get_or_insert_with(|| {
            let mut set = HashSet::new();
            for layer in &obj.layers {
                if layer.hidden {
                    continue;
                }
                for kf in &layer.frames {
                    set.insert(kf.frame_number);
                }
            }
            let mut frames: Vec<i32> = set.into_iter().collect();
            frames.sort_unstable();
            frames
        })
    }

    /// Whether `frame` is an actual keyframe on any visible layer.
    pub fn is_keyframe(&mut self, obj: &StrokeObject, frame: i32) -> bool {
        self.frames(obj).binary_search(&frame).is_ok()
    }

    /// Display window in keyframes mode: up to `before` real keyframes
    /// behind the active one and `after` ahead of it, as
    /// `(signed step offset, frame)` pairs.
    pub fn keyframe_window(
        &mut self,
        obj: &StrokeObject,
        current_frame: i32,
        before: u32,
        after: u32,
    ) -> Vec<(i32, i32)> {
        let frames = self.frames(obj);
        if frames.is_empty() {
            return Vec::new();
        }

        let idx = frames.partition_point(|&f| f <= current_frame);
        let current_idx = if idx > 0 { idx - 1 } else { 0 };

        let mut window = Vec::new();
        for i in 1..=before as usize {
            if let Some(rewound) = current_idx.checked_sub(i) {
                window.push((-(i as i32), frames[rewound]));
            }
        }
        for i in 1..=after as usize {
            if let Some(&frame) = frames.get(current_idx + i) {
                window.push((i as i32, frame));
            }
        }
        window
    }
}

/// Display window in every-frame mode: fixed steps either side of the
/// current frame, regardless of where keyframes sit.
pub fn every_frame_window(current_frame: i32, before: u32, after: u32, step: u32) -> Vec<(i32, i32)> {
    let step = step.max(1) as i32;
    let mut window = Vec::new();
    for i in 1..=before as i32 {
        window.push((-i, current_frame - i * step));
    }
    for i in 1..=after as i32 {
        window.push((i, current_frame + i * step));
    }
    window
}

/// All `(layer name, frame number)` pairs of keyframes on layers passing
/// the filter. The change detector diffs consecutive snapshots of this to
/// spot added, removed, and moved keyframes.
pub fn keyframe_set(obj: &StrokeObject, filter: &LayerFilter) -> HashSet<(String, i32)> {
    let mut set = HashSet::new();
    for layer in &obj.layers {
        if !filter.passes(layer) {
            continue;
        }
        for kf in &layer.frames {
            set.insert((layer.name.clone(), kf.frame_number));
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use onionskin_data::{Drawing, LayerKeyframe, StrokeLayer};

    fn record() -> StrokeRecord {
        StrokeRecord {
            points: vec![Vec3::ZERO, Vec3::X],
            layer_name: "ink".into(),
            source_frame: 1,
            fill_triangles: vec![],
        }
    }

    #[test]
    fn stroke_cache_evicts_oldest_beyond_capacity() {
        let mut cache = StrokeWorldCache::with_capacity(3);
        for frame in 1..=5 {
            cache.put(frame, vec![record()]);
        }
        assert_eq!(cache.len(), 3);
        // Exactly the three most recent insertions survive.
        assert!(!cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
        assert!(cache.contains(5));
        assert_eq!(cache.frames().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn stroke_cache_overwrite_keeps_eviction_position() {
        let mut cache = StrokeWorldCache::with_capacity(2);
        cache.put(1, vec![]);
        cache.put(2, vec![record()]);
        cache.put(1, vec![record()]);
        // Frame 1 is still oldest; inserting 3 evicts it.
        cache.put(3, vec![]);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn stroke_cache_remove_and_stats() {
        let mut cache = StrokeWorldCache::default();
        cache.put(7, vec![record()]);
        assert_eq!(cache.stats(), "1 frames cached");
        cache.remove(7);
        assert!(cache.is_empty());
        assert_eq!(cache.frames().count(), 0);
    }

    #[test]
    fn batch_key_quantizes_z() {
        assert_eq!(BatchKey::new(5, 0.12341), BatchKey::new(5, 0.12339));
        assert_ne!(BatchKey::new(5, 0.1234), BatchKey::new(5, 0.1236));
        assert_ne!(BatchKey::new(5, 0.0), BatchKey::new(6, 0.0));
    }

    #[test]
    fn batch_cache_builds_once_per_key() {
        let mut cache = RenderBatchCache::default();
        let mut builds = 0;
        let key = BatchKey::new(3, 0.5);
        for _ in 0..3 {
            cache.get_or_build(key, || {
                builds += 1;
                BatchEntry::default()
            });
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn batch_cache_respects_bound_and_invalidate() {
        let mut cache = RenderBatchCache::with_capacity(2);
        for frame in 0..4 {
            cache.get_or_build(BatchKey::new(frame, 0.0), BatchEntry::default);
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&BatchKey::new(0, 0.0)));
        assert!(cache.contains(&BatchKey::new(3, 0.0)));

        cache.invalidate();
        assert!(cache.is_empty());
    }

    fn object_with_keyframes(frames: &[&[i32]]) -> StrokeObject {
        let mut obj = StrokeObject::new("board");
        for (i, layer_frames) in frames.iter().enumerate() {
            let mut layer = StrokeLayer::new(format!("layer{i}"));
            layer.frames = layer_frames
                .iter()
                .map(|&f| LayerKeyframe {
                    frame_number: f,
                    drawing: Drawing::default(),
                    selected: false,
                })
                .collect();
            obj.layers.push(layer);
        }
        obj
    }

    #[test]
    fn keyframe_index_unions_layers_sorted() {
        let obj = object_with_keyframes(&[&[10, 1], &[5, 10]]);
        let mut index = KeyframeIndex::default();
        assert_eq!(index.frames(&obj), &[1, 5, 10]);
        assert!(index.is_keyframe(&obj, 5));
        assert!(!index.is_keyframe(&obj, 6));
    }

    #[test]
    fn keyframe_window_walks_neighbors() {
        let obj = object_with_keyframes(&[&[1, 5, 10, 20, 30]]);
        let mut index = KeyframeIndex::default();
        let mut window = index.keyframe_window(&obj, 12, 2, 1);
        window.sort_by_key(|&(offset, _)| offset);
        assert_eq!(window, vec![(-2, 1), (-1, 5), (1, 20)]);
    }

    #[test]
    fn every_frame_window_steps_symmetrically() {
        let mut window = every_frame_window(5, 2, 2, 1);
        window.sort_by_key(|&(_, frame)| frame);
        let frames: Vec<i32> = window.iter().map(|&(_, f)| f).collect();
        assert_eq!(frames, vec![3, 4, 6, 7]);

        let stepped = every_frame_window(10, 1, 1, 5);
        let frames: Vec<i32> = stepped.iter().map(|&(_, f)| f).collect();
        assert_eq!(frames, vec![5, 15]);
    }

    #[test]
    fn keyframe_set_honors_filter() {
        let mut obj = object_with_keyframes(&[&[1], &[2]]);
        obj.layers[1].name = "_guide".into();
        let filter = LayerFilter {
            skip_underscore: true,
            name_contains: String::new(),
        };
        let set = keyframe_set(&obj, &filter);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&("layer0".to_string(), 1)));
    }
}
