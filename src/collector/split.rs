use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::SplitRatio;

/// Dataset partition a batch is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    /// Directory name under the dataset root.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    pub const fn all() -> [Self; 3] {
        [Self::Train, Self::Val, Self::Test]
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a uniform draw in `[0, 1)` onto a split.
///
/// Ratios are used as cumulative thresholds and need not sum to one; any
/// remainder falls to test.
pub fn split_for(p: f64, ratio: &SplitRatio) -> Split {
    if p < ratio.train {
        Split::Train
    } else if p < ratio.train + ratio.val {
        Split::Val
    } else {
        Split::Test
    }
}

/// Draws a split for each completed batch.
#[derive(Debug)]
pub struct SplitAssigner {
    ratio: SplitRatio,
    rng: StdRng,
}

impl SplitAssigner {
    pub fn new(ratio: SplitRatio) -> Self {
        Self {
            ratio,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic assigner for reproducible runs.
    pub fn seeded(ratio: SplitRatio, seed: u64) -> Self {
        Self {
            ratio,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn assign(&mut self) -> Split {
        let p: f64 = self.rng.gen();
        split_for(p, &self.ratio)
    }
}
