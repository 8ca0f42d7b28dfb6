//! Sensor rig seam: everything the collector needs from the live simulation.

pub mod synthetic;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use synthetic::SyntheticRig;

/// Below this distance the bearing is undefined and reported as zero.
pub const MIN_BEARING_DISTANCE: f32 = 1e-4;

/// Distance reported when the target range is unknown.
pub const UNKNOWN_DISTANCE: f32 = -1.0;

/// One row-major depth image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl SensorFrame {
    /// Builds a frame, rejecting buffers that do not match the shape.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        if width.checked_mul(height)? != data.len() {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Agent position and orientation (roll, pitch, yaw in radians).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: [f64; 3],
}

impl Pose {
    pub fn yaw(&self) -> f64 {
        self.orientation[2]
    }
}

/// Direction to the target in the agent frame plus its range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bearing {
    pub direction: [f32; 3],
    pub distance: f32,
}

/// Failures reported by a sensor rig.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no target present in the scene")]
    NoTarget,

    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

/// Access to the live simulation's sensors.
///
/// Methods are called from the tick path only.
pub trait SensorRig: Send {
    /// Returns `None` when the sensor produced no image this frame.
    fn capture_frame(&mut self) -> Option<SensorFrame>;

    fn capture_pose(&mut self) -> Pose;

    /// Coarse range to the target, or a non-positive value if unknown.
    fn distance_to_target(&mut self) -> f32;

    fn target_bearing(&mut self) -> Result<Bearing, CaptureError>;

    /// Hides the target from the sensor so it never appears in captures.
    fn enforce_target_invisible(&mut self) -> Result<(), CaptureError>;

    fn target_visible(&mut self) -> Result<bool, CaptureError>;
}

/// Rotates the world offset to `target` into the agent's yaw frame.
///
/// The returned direction is unit length, or zero when the target is closer
/// than [`MIN_BEARING_DISTANCE`].
pub fn bearing_to_target(agent_position: [f64; 3], agent_yaw: f64, target: [f64; 3]) -> Bearing {
    let wx = target[0] - agent_position[0];
    let wy = target[1] - agent_position[1];
    let wz = target[2] - agent_position[2];

    let (sin, cos) = agent_yaw.sin_cos();
    let dx = -wx * sin + wy * cos;
    let dy = -wx * cos - wy * sin;
    let dz = wz;

    let distance = (dx * dx + dy * dy + dz * dz).sqrt();
    if distance < f64::from(MIN_BEARING_DISTANCE) {
        return Bearing {
            direction: [0.0; 3],
            distance: distance as f32,
        };
    }

    Bearing {
        direction: [
            (dx / distance) as f32,
            (dy / distance) as f32,
            (dz / distance) as f32,
        ],
        distance: distance as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_frame_shape_checked() {
        assert!(SensorFrame::new(2, 3, vec![0.0; 6]).is_some());
        assert!(SensorFrame::new(2, 3, vec![0.0; 5]).is_none());
        assert!(SensorFrame::new(usize::MAX, 2, Vec::new()).is_none());
    }

    #[test]
    fn test_bearing_zero_yaw() {
        let b = bearing_to_target([0.0; 3], 0.0, [0.0, 5.0, 0.0]);
        assert!(approx(b.direction, [1.0, 0.0, 0.0]), "{:?}", b.direction);
        assert!((b.distance - 5.0).abs() < 1e-6);

        let b = bearing_to_target([1.0, 1.0, 1.0], 0.0, [4.0, 1.0, 1.0]);
        assert!(approx(b.direction, [0.0, -1.0, 0.0]), "{:?}", b.direction);
    }

    #[test]
    fn test_bearing_follows_yaw() {
        let yaw = std::f64::consts::FRAC_PI_2;
        let b = bearing_to_target([0.0; 3], yaw, [3.0, 0.0, 0.0]);
        assert!(approx(b.direction, [-1.0, 0.0, 0.0]), "{:?}", b.direction);
    }

    #[test]
    fn test_bearing_vertical_component_untouched() {
        let b = bearing_to_target([0.0; 3], 1.3, [0.0, 0.0, -2.0]);
        assert!(approx(b.direction, [0.0, 0.0, -1.0]), "{:?}", b.direction);
    }

    #[test]
    fn test_bearing_degenerate_distance() {
        let b = bearing_to_target([1.0, 2.0, 3.0], 0.4, [1.0, 2.0, 3.00001]);
        assert_eq!(b.direction, [0.0; 3]);
    }
}
