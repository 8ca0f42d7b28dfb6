use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::accumulator::{Batch, FrameStack};
use crate::collector::action::ActionLabel;
use crate::collector::split::Split;
use crate::dataset::write_atomic;
use crate::sensor::Pose;

/// Errors from encoding or writing a batch file.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serializing batch {batch_id}: {source}")]
    Serialize {
        batch_id: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("compressing batch {batch_id}: {source}")]
    Compress {
        batch_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch {batch_id} has non-finite values in {field}")]
    NonFinite { batch_id: u64, field: &'static str },

    #[error("decoding {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
}

/// Serializes batches to files.
///
/// Implementations must never leave a partially written file at `path`.
pub trait BatchCodec: Send + Sync {
    /// File extension without the leading dot.
    fn extension(&self) -> &str;

    fn write_batch(&self, path: &Path, batch_id: u64, batch: &Batch) -> Result<(), CodecError>;
}

#[derive(Serialize)]
struct BatchRecordRef<'a> {
    batch_id: u64,
    split: Split,
    created_at: DateTime<Utc>,
    count: usize,
    frames: &'a FrameStack,
    poses: &'a [Pose],
    frame_indices: &'a [u64],
    distances: &'a [f32],
    actions: &'a [ActionLabel],
    directions: &'a [[f32; 3]],
}

/// A batch file read back from disk.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredBatch {
    pub batch_id: u64,
    pub split: Split,
    pub created_at: DateTime<Utc>,
    pub count: usize,
    pub frames: FrameStack,
    pub poses: Vec<Pose>,
    pub frame_indices: Vec<u64>,
    pub distances: Vec<f32>,
    pub actions: Vec<ActionLabel>,
    pub directions: Vec<[f32; 3]>,
}

/// Names the first column holding a NaN or infinity. JSON has no encoding
/// for them.
fn non_finite_field(batch: &Batch) -> Option<&'static str> {
    let frames_ok = match &batch.frames {
        FrameStack::Uniform { data, .. } => data.iter().all(|v| v.is_finite()),
        FrameStack::Ragged { frames } => frames
            .iter()
            .all(|f| f.data.iter().all(|v| v.is_finite())),
    };
    if !frames_ok {
        return Some("frames");
    }
    if !batch.poses.iter().all(|p| {
        p.position
            .iter()
            .chain(p.orientation.iter())
            .all(|v| v.is_finite())
    }) {
        return Some("poses");
    }
    if !batch.distances.iter().all(|v| v.is_finite()) {
        return Some("distances");
    }
    if !batch.directions.iter().flatten().all(|v| v.is_finite()) {
        return Some("directions");
    }
    None
}

/// Gzip-compressed JSON, one document per batch (`.json.gz`).
#[derive(Debug, Clone)]
pub struct GzipJsonCodec {
    level: Compression,
}

impl Default for GzipJsonCodec {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl GzipJsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Encodes a batch into the compressed document.
    ///
    /// Batches containing NaN or infinite values are rejected.
    pub fn encode(&self, batch_id: u64, batch: &Batch) -> Result<Vec<u8>, CodecError> {
        if let Some(field) = non_finite_field(batch) {
            return Err(CodecError::NonFinite { batch_id, field });
        }

        let record = BatchRecordRef {
            batch_id,
            split: batch.split,
            created_at: Utc::now(),
            count: batch.len(),
            frames: &batch.frames,
            poses: &batch.poses,
            frame_indices: &batch.frame_indices,
            distances: &batch.distances,
            actions: &batch.actions,
            directions: &batch.directions,
        };
        let json = serde_json::to_vec(&record)
            .map_err(|source| CodecError::Serialize { batch_id, source })?;

        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), self.level);
        encoder
            .write_all(&json)
            .map_err(|source| CodecError::Compress { batch_id, source })?;
        encoder
            .finish()
            .map_err(|source| CodecError::Compress { batch_id, source })
    }

    /// Reads a batch file written by this codec.
    pub fn read(path: &Path) -> Result<StoredBatch, CodecError> {
        let file = fs::File::open(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut json = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut json)
            .map_err(|e| CodecError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        serde_json::from_slice(&json).map_err(|e| CodecError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl BatchCodec for GzipJsonCodec {
    fn extension(&self) -> &str {
        "json.gz"
    }

    fn write_batch(&self, path: &Path, batch_id: u64, batch: &Batch) -> Result<(), CodecError> {
        let body = self.encode(batch_id, batch)?;
        write_atomic(path, &body).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
