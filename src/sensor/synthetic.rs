use super::{
    bearing_to_target, Bearing, CaptureError, Pose, SensorFrame, SensorRig, UNKNOWN_DISTANCE,
};

const DEFAULT_TARGET: [f64; 3] = [10.0, 0.0, 2.0];

/// Deterministic rig that flies a straight line past a fixed target.
///
/// Used by `depthcap simulate`, the scenario tests and the benches.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    width: usize,
    height: usize,
    target: Option<[f64; 3]>,
    target_hidden: bool,
    drop_every: Option<u64>,
    /// Number of frame requests so far; drives the trajectory.
    step: u64,
}

impl SyntheticRig {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            target: Some(DEFAULT_TARGET),
            target_hidden: false,
            drop_every: None,
            step: 0,
        }
    }

    pub fn with_target(mut self, target: [f64; 3]) -> Self {
        self.target = Some(target);
        self
    }

    pub fn without_target(mut self) -> Self {
        self.target = None;
        self
    }

    /// Makes every `n`th frame request come back empty.
    pub fn drop_every(mut self, n: u64) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn frames_requested(&self) -> u64 {
        self.step
    }

    fn pose_at(&self, step: u64) -> Pose {
        let t = step as f64;
        Pose {
            position: [0.05 * t, 0.0, 1.5],
            orientation: [0.0, 0.0, 0.01 * t],
        }
    }
}

impl SensorRig for SyntheticRig {
    fn capture_frame(&mut self) -> Option<SensorFrame> {
        self.step += 1;
        if let Some(n) = self.drop_every {
            if self.step % n == 0 {
                return None;
            }
        }

        let phase = (self.step % 10) as f32 * 0.1;
        let rows = self.height.max(1) as f32;
        let mut data = Vec::with_capacity(self.width * self.height);
        for row in 0..self.height {
            let depth = 1.0 + row as f32 / rows + phase;
            data.extend(std::iter::repeat(depth).take(self.width));
        }
        SensorFrame::new(self.width, self.height, data)
    }

    fn capture_pose(&mut self) -> Pose {
        self.pose_at(self.step)
    }

    fn distance_to_target(&mut self) -> f32 {
        let Some(target) = self.target else {
            return UNKNOWN_DISTANCE;
        };
        let pose = self.pose_at(self.step);
        let d: f64 = target
            .iter()
            .zip(pose.position.iter())
            .map(|(t, p)| (t - p) * (t - p))
            .sum();
        d.sqrt() as f32
    }

    fn target_bearing(&mut self) -> Result<Bearing, CaptureError> {
        let target = self.target.ok_or(CaptureError::NoTarget)?;
        let pose = self.pose_at(self.step);
        Ok(bearing_to_target(pose.position, pose.yaw(), target))
    }

    fn enforce_target_invisible(&mut self) -> Result<(), CaptureError> {
        if self.target.is_none() {
            return Err(CaptureError::NoTarget);
        }
        self.target_hidden = true;
        Ok(())
    }

    fn target_visible(&mut self) -> Result<bool, CaptureError> {
        match self.target {
            Some(_) => Ok(!self.target_hidden),
            None => Err(CaptureError::NoTarget),
        }
    }
}
