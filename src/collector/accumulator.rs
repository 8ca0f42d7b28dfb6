use serde::{Deserialize, Serialize};

use super::action::ActionLabel;
use super::split::Split;
use crate::sensor::{Pose, SensorFrame};

/// One synchronized sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub frame: SensorFrame,
    pub pose: Pose,
    pub frame_index: u64,
    pub distance: f32,
    pub action: ActionLabel,
    pub direction: [f32; 3],
}

/// Stacked sensor frames of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum FrameStack {
    /// Every frame shares one shape; `data` is `len * height * width` values.
    Uniform {
        len: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    },
    Ragged { frames: Vec<SensorFrame> },
}

impl FrameStack {
    /// Stacks frames into one contiguous buffer when their shapes agree.
    pub fn stack(frames: Vec<SensorFrame>) -> Self {
        let Some(first) = frames.first() else {
            return Self::Uniform {
                len: 0,
                height: 0,
                width: 0,
                data: Vec::new(),
            };
        };
        let shape = first.shape();

        if let Some(other) = frames.iter().find(|f| f.shape() != shape) {
            tracing::warn!(
                expected = ?shape,
                found = ?other.shape(),
                frames = frames.len(),
                "inconsistent frame shapes, keeping frames unstacked",
            );
            return Self::Ragged { frames };
        }

        let (height, width) = shape;
        let len = frames.len();
        let mut data = Vec::with_capacity(len * height * width);
        for frame in frames {
            data.extend_from_slice(&frame.data);
        }
        Self::Uniform {
            len,
            height,
            width,
            data,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Uniform { len, .. } => *len,
            Self::Ragged { frames } => frames.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ragged(&self) -> bool {
        matches!(self, Self::Ragged { .. })
    }
}

/// A completed set of observations bound for one split.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub split: Split,
    pub frames: FrameStack,
    pub poses: Vec<Pose>,
    pub frame_indices: Vec<u64>,
    pub distances: Vec<f32>,
    pub actions: Vec<ActionLabel>,
    pub directions: Vec<[f32; 3]>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frame_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_indices.is_empty()
    }
}

/// Column-wise in-flight observations.
///
/// All columns always have the same length.
#[derive(Debug, Default)]
pub struct Accumulator {
    frames: Vec<SensorFrame>,
    poses: Vec<Pose>,
    frame_indices: Vec<u64>,
    distances: Vec<f32>,
    actions: Vec<ActionLabel>,
    directions: Vec<[f32; 3]>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            poses: Vec::with_capacity(capacity),
            frame_indices: Vec::with_capacity(capacity),
            distances: Vec::with_capacity(capacity),
            actions: Vec::with_capacity(capacity),
            directions: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, obs: Observation) {
        self.frames.push(obs.frame);
        self.poses.push(obs.pose);
        self.frame_indices.push(obs.frame_index);
        self.distances.push(obs.distance);
        self.actions.push(obs.action);
        self.directions.push(obs.direction);
    }

    pub fn len(&self) -> usize {
        self.frame_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_indices.is_empty()
    }

    /// Drops everything in flight.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.poses.clear();
        self.frame_indices.clear();
        self.distances.clear();
        self.actions.clear();
        self.directions.clear();
    }

    /// Moves the in-flight columns into a batch, leaving the accumulator empty.
    pub fn take_batch(&mut self, split: Split) -> Batch {
        Batch {
            split,
            frames: FrameStack::stack(std::mem::take(&mut self.frames)),
            poses: std::mem::take(&mut self.poses),
            frame_indices: std::mem::take(&mut self.frame_indices),
            distances: std::mem::take(&mut self.distances),
            actions: std::mem::take(&mut self.actions),
            directions: std::mem::take(&mut self.directions),
        }
    }
}
