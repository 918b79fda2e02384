//! # Position Curve
//!
//! Per-axis animated channels for an object's location, mirrored from the
//! host's animation curves. The surface-offset baker evaluates these
//! directly (never the constraint-resolved world matrix) to avoid feeding
//! its own correction back into the input.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// One key on a channel. `ease_out` shapes the segment leaving this key,
/// `ease_in` the segment arriving at the next one, as normalized cubic
/// bezier control points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurveKey {
    pub frame: f32,
    pub value: f32,
    #[serde(default = "default_ease_out")]
    pub ease_out: [f32; 2],
    #[serde(default = "default_ease_in")]
    pub ease_in: [f32; 2],
}

fn default_ease_out() -> [f32; 2] {
    [0.0, 0.0]
}

fn default_ease_in() -> [f32; 2] {
    [1.0, 1.0]
}

impl CurveKey {
    pub fn linear(frame: f32, value: f32) -> Self {
        Self {
            frame,
            value,
            ease_out: default_ease_out(),
            ease_in: default_ease_in(),
        }
    }
}

/// A single scalar channel. Keys are kept sorted by frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    keys: Vec<CurveKey>,
}

impl Channel {
    pub fn new(mut keys: Vec<CurveKey>) -> Self {
        keys.sort_by(|a, b| a.frame.total_cmp(&b.frame));
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[CurveKey] {
        &self.keys
    }

    pub fn first_frame(&self) -> Option<f32> {
        self.keys.first().map(|k| k.frame)
    }

    pub fn last_frame(&self) -> Option<f32> {
        self.keys.last().map(|k| k.frame)
    }

    /// Evaluate the channel at `frame`. Outside the keyed range the end
    /// values hold; between keys the segment is eased through the keys'
    /// bezier handles.
    pub fn evaluate(&self, frame: f32) -> f32 {
        if self.keys.is_empty() {
            return 0.0;
        }

        // First key whose frame is > `frame`; the segment is [idx-1, idx].
        let idx = self.keys.partition_point(|k| k.frame <= frame);

        if idx == 0 {
            return self.keys[0].value;
        }
        if idx >= self.keys.len() {
            return self.keys[self.keys.len() - 1].value;
        }

        let k0 = &self.keys[idx - 1];
        let k1 = &self.keys[idx];

        let duration = k1.frame - k0.frame;
        if duration <= 0.0 {
            return k0.value;
        }

        let local_t = (frame - k0.frame) / duration;
        let p1 = Vec2::new(k0.ease_out[0], k0.ease_out[1]);
        let p2 = Vec2::new(k1.ease_in[0], k1.ease_in[1]);
        let eased = solve_cubic_bezier(p1, p2, local_t);

        k0.value + (k1.value - k0.value) * eased
    }
}

/// Solve a normalized cubic bezier easing curve for `x` via Newton-Raphson.
pub fn solve_cubic_bezier(p1: Vec2, p2: Vec2, x: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let mut t = x;
    for _ in 0..8 {
        let one_minus_t = 1.0 - t;
        let x_est = 3.0 * one_minus_t * one_minus_t * t * p1.x
            + 3.0 * one_minus_t * t * t * p2.x
            + t * t * t;

        let err = x_est - x;
        if err.abs() < 1e-4 {
            break;
        }

        let dx_dt = 3.0 * one_minus_t * one_minus_t * p1.x
            + 6.0 * one_minus_t * t * (p2.x - p1.x)
            + 3.0 * t * t * (1.0 - p2.x);

        if dx_dt.abs() < 1e-6 {
            break;
        }
        t -= err / dx_dt;
    }

    let one_minus_t = 1.0 - t;
    3.0 * one_minus_t * one_minus_t * t * p1.y + 3.0 * one_minus_t * t * t * p2.y + t * t * t
}

/// The object's animated location: one channel per axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionCurve {
    pub x: Channel,
    pub y: Channel,
    pub z: Channel,
}

impl PositionCurve {
    pub fn evaluate(&self, frame: f32) -> Vec3 {
        Vec3::new(
            self.x.evaluate(frame),
            self.y.evaluate(frame),
            self.z.evaluate(frame),
        )
    }

    /// Union of the channels' keyed ranges, as whole frames. `None` when
    /// no channel has keys.
    pub fn frame_range(&self) -> Option<(i32, i32)> {
        let firsts = [&self.x, &self.y, &self.z]
            .iter()
            .filter_map(|c| c.first_frame())
            .collect::<Vec<_>>();
        let lasts = [&self.x, &self.y, &self.z]
            .iter()
            .filter_map(|c| c.last_frame())
            .collect::<Vec<_>>();
        if firsts.is_empty() || lasts.is_empty() {
            return None;
        }
        let start = firsts.iter().fold(f32::INFINITY, |a, &b| a.min(b));
        let end = lasts.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        Some((start.floor() as i32, end.ceil() as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_channel(pairs: &[(f32, f32)]) -> Channel {
        Channel::new(pairs.iter().map(|&(f, v)| CurveKey::linear(f, v)).collect())
    }

    #[test]
    fn evaluate_holds_outside_keyed_range() {
        let ch = linear_channel(&[(10.0, 1.0), (20.0, 3.0)]);
        assert_eq!(ch.evaluate(0.0), 1.0);
        assert_eq!(ch.evaluate(25.0), 3.0);
    }

    #[test]
    fn evaluate_interpolates_between_keys() {
        let ch = linear_channel(&[(0.0, 0.0), (10.0, 10.0), (20.0, 30.0)]);
        assert_eq!(ch.evaluate(0.0), 0.0);
        assert!((ch.evaluate(5.0) - 5.0).abs() < 1e-4);
        assert!((ch.evaluate(15.0) - 20.0).abs() < 1e-4);
        assert_eq!(ch.evaluate(20.0), 30.0);
    }

    #[test]
    fn keys_are_sorted_on_construction() {
        let ch = linear_channel(&[(20.0, 2.0), (0.0, 0.0)]);
        assert!((ch.evaluate(10.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn frame_range_spans_all_channels() {
        let curve = PositionCurve {
            x: linear_channel(&[(1.0, 0.0), (50.0, 5.0)]),
            y: linear_channel(&[(5.0, 0.0), (30.0, 1.0)]),
            z: Channel::default(),
        };
        assert_eq!(curve.frame_range(), Some((1, 50)));
    }

    #[test]
    fn empty_curve_has_no_range() {
        assert_eq!(PositionCurve::default().frame_range(), None);
    }
}
