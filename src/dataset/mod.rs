//! On-disk dataset layout and offline maintenance.
//!
//! ```text
//! <root>/
//!   train/ val/ test/      batch_{id:06}.{ext}
//!   config/                configuration snapshots
//!   batch_counter.txt      last allocated batch id
//!   scene_batch_number.txt counter value when the current scene started
//! ```

pub mod counter;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub use counter::BatchCounter;

use crate::collector::split::Split;

pub const COUNTER_FILE: &str = "batch_counter.txt";
pub const SCENE_CHECKPOINT_FILE: &str = "scene_batch_number.txt";
pub const CONFIG_DIR: &str = "config";

const BATCH_PREFIX: &str = "batch_";

/// Paths of one dataset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.as_str())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn counter_path(&self) -> PathBuf {
        self.root.join(COUNTER_FILE)
    }

    pub fn scene_checkpoint_path(&self) -> PathBuf {
        self.root.join(SCENE_CHECKPOINT_FILE)
    }

    pub fn batch_path(&self, split: Split, batch_id: u64, ext: &str) -> PathBuf {
        self.split_dir(split).join(batch_file_name(batch_id, ext))
    }

    /// Creates the root and its split and config directories.
    pub fn ensure_skeleton(&self) -> Result<()> {
        for split in Split::all() {
            let dir = self.split_dir(split);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating split directory {}", dir.display()))?;
        }
        let config = self.config_dir();
        fs::create_dir_all(&config)
            .with_context(|| format!("creating config directory {}", config.display()))?;
        Ok(())
    }

    /// True if any split already holds `batch_id` with this extension.
    pub fn batch_id_taken(&self, batch_id: u64, ext: &str) -> bool {
        Split::all()
            .iter()
            .any(|split| self.batch_path(*split, batch_id, ext).exists())
    }
}

pub fn batch_file_name(batch_id: u64, ext: &str) -> String {
    format!("{BATCH_PREFIX}{batch_id:06}.{ext}")
}

/// Extracts the id from `batch_<digits>.<ext>`; any non-empty extension.
pub fn parse_batch_number(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(BATCH_PREFIX)?;
    let (digits, ext) = rest.split_once('.')?;
    if digits.is_empty() || ext.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Batch ids found in one split directory. A missing directory is empty.
fn batch_ids_in(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_batch_number) {
            ids.push((id, entry.path()));
        }
    }
    Ok(ids)
}

/// Highest batch id present in any split directory, 0 if none.
pub fn scan_latest_batch_number(layout: &DatasetLayout) -> Result<u64> {
    let mut latest = 0;
    for split in Split::all() {
        for (id, _) in batch_ids_in(&layout.split_dir(split))? {
            latest = latest.max(id);
        }
    }
    Ok(latest)
}

/// Reads a single decimal integer file. `Ok(None)` if it does not exist.
pub(crate) fn read_u64_file(path: &Path) -> Result<Option<u64>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let value = text
        .trim()
        .parse::<u64>()
        .with_context(|| format!("parsing {}: {:?}", path.display(), text.trim()))?;
    Ok(Some(value))
}

/// Writes `bytes` to a hidden sibling and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// `dir/.name.tmp`; the leading dot keeps it out of batch scans.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

pub fn read_scene_checkpoint(layout: &DatasetLayout) -> Result<Option<u64>> {
    read_u64_file(&layout.scene_checkpoint_path())
}

pub fn write_scene_checkpoint(layout: &DatasetLayout, value: u64) -> Result<()> {
    let path = layout.scene_checkpoint_path();
    write_atomic(&path, value.to_string().as_bytes())
        .with_context(|| format!("writing {}", path.display()))
}

/// Outcome of [`remove_scene_batches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    pub checkpoint: u64,
    pub previous_counter: u64,
}

/// Deletes every batch written since the scene checkpoint and rolls the
/// counter back to it.
pub fn remove_scene_batches(
    layout: &DatasetLayout,
    counter: &mut BatchCounter,
) -> Result<RemovalReport> {
    let Some(checkpoint) = read_scene_checkpoint(layout)? else {
        bail!(
            "no scene checkpoint at {}",
            layout.scene_checkpoint_path().display()
        );
    };
    let previous_counter = counter.value();

    let mut removed = 0;
    if checkpoint < previous_counter {
        for split in Split::all() {
            for (id, path) in batch_ids_in(&layout.split_dir(split))? {
                if id > checkpoint && id <= previous_counter {
                    fs::remove_file(&path)
                        .with_context(|| format!("removing {}", path.display()))?;
                    tracing::debug!(batch_id = id, path = %path.display(), "removed batch");
                    removed += 1;
                }
            }
        }
    }

    counter.reset_to(checkpoint)?;

    tracing::info!(
        removed,
        checkpoint,
        previous_counter,
        "removed scene batches",
    );

    Ok(RemovalReport {
        removed,
        checkpoint,
        previous_counter,
    })
}

/// Snapshot of a dataset root for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStatus {
    /// Value of the counter file, if readable.
    pub counter: Option<u64>,
    pub scene_checkpoint: Option<u64>,
    pub latest_on_disk: u64,
    /// Batch files per split, in train/val/test order.
    pub per_split: [(Split, usize); 3],
}

impl DatasetStatus {
    pub fn read(layout: &DatasetLayout) -> Result<Self> {
        let counter = match read_u64_file(&layout.counter_path()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "counter file unreadable");
                None
            }
        };
        let scene_checkpoint = read_scene_checkpoint(layout).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "scene checkpoint unreadable");
            None
        });

        let mut per_split = Split::all().map(|split| (split, 0usize));
        let mut latest_on_disk = 0;
        for (split, count) in per_split.iter_mut() {
            let ids = batch_ids_in(&layout.split_dir(*split))?;
            *count = ids.len();
            if let Some(max) = ids.iter().map(|(id, _)| *id).max() {
                latest_on_disk = latest_on_disk.max(max);
            }
        }

        Ok(Self {
            counter,
            scene_checkpoint,
            latest_on_disk,
            per_split,
        })
    }

    pub fn total_batches(&self) -> usize {
        self.per_split.iter().map(|(_, n)| n).sum()
    }
}

/// File name for a configuration snapshot.
///
/// `None` and `current_config` map to `current_config.json`; other names are
/// reduced to alphanumerics and `._- ` and get a `.json` suffix if missing.
pub fn snapshot_file_name(name: Option<&str>) -> String {
    let name = match name {
        None | Some("current_config") => return "current_config.json".to_string(),
        Some("initial_config") => return "initial_config.json".to_string(),
        Some(name) => name,
    };

    let mut clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    let trimmed = clean.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        clean = "current_config".to_string();
    }
    if !clean.ends_with(".json") {
        clean.push_str(".json");
    }
    clean
}

/// Writes `value` as pretty JSON under `config/` and returns the path.
pub fn save_config_snapshot(
    layout: &DatasetLayout,
    value: &serde_json::Value,
    name: Option<&str>,
) -> Result<PathBuf> {
    let dir = layout.config_dir();
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join(snapshot_file_name(name));
    let body = serde_json::to_vec_pretty(value).context("serializing config snapshot")?;
    write_atomic(&path, &body).with_context(|| format!("writing {}", path.display()))?;

    tracing::info!(path = %path.display(), "saved config snapshot");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::write(path, b"x").expect("write file");
    }

    #[test]
    fn test_batch_file_name() {
        assert_eq!(batch_file_name(1, "npz"), "batch_000001.npz");
        assert_eq!(batch_file_name(1_234_567, "json.gz"), "batch_1234567.json.gz");
    }

    #[test]
    fn test_parse_batch_number() {
        assert_eq!(parse_batch_number("batch_000042.npz"), Some(42));
        assert_eq!(parse_batch_number("batch_7.json.gz"), Some(7));
        assert_eq!(parse_batch_number("batch_.npz"), None);
        assert_eq!(parse_batch_number("batch_12"), None);
        assert_eq!(parse_batch_number("batch_12."), None);
        assert_eq!(parse_batch_number("batch_1a.npz"), None);
        assert_eq!(parse_batch_number(".batch_000003.npz.tmp"), None);
        assert_eq!(parse_batch_number("notes.txt"), None);
    }

    #[test]
    fn test_ensure_skeleton() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path().join("nested/root"));
        layout.ensure_skeleton().expect("skeleton");
        for split in Split::all() {
            assert!(layout.split_dir(split).is_dir());
        }
        assert!(layout.config_dir().is_dir());
        layout.ensure_skeleton().expect("idempotent");
    }

    #[test]
    fn test_scan_latest_any_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_skeleton().expect("skeleton");
        assert_eq!(scan_latest_batch_number(&layout).expect("scan"), 0);

        touch(&layout.batch_path(Split::Train, 3, "npz"));
        touch(&layout.batch_path(Split::Val, 11, "json.gz"));
        touch(&layout.split_dir(Split::Test).join("readme.md"));
        assert_eq!(scan_latest_batch_number(&layout).expect("scan"), 11);
    }

    #[test]
    fn test_scan_missing_root_is_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path().join("absent"));
        assert_eq!(scan_latest_batch_number(&layout).expect("scan"), 0);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value.txt");
        write_atomic(&path, b"12").expect("write");
        write_atomic(&path, b"13").expect("overwrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "13");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn test_remove_scene_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_skeleton().expect("skeleton");
        for (split, id) in [
            (Split::Train, 1),
            (Split::Train, 2),
            (Split::Val, 3),
            (Split::Train, 4),
            (Split::Test, 5),
        ] {
            touch(&layout.batch_path(split, id, "json.gz"));
        }
        write_scene_checkpoint(&layout, 2).expect("checkpoint");
        let mut counter = BatchCounter::load_or_recover(&layout, false);
        assert_eq!(counter.value(), 5);

        let report = remove_scene_batches(&layout, &mut counter).expect("remove");
        assert_eq!(report.removed, 3);
        assert_eq!(report.checkpoint, 2);
        assert_eq!(report.previous_counter, 5);
        assert_eq!(counter.value(), 2);
        assert_eq!(scan_latest_batch_number(&layout).expect("scan"), 2);
        assert_eq!(
            read_u64_file(&layout.counter_path()).expect("read"),
            Some(2)
        );
    }

    #[test]
    fn test_remove_scene_batches_requires_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_skeleton().expect("skeleton");
        let mut counter = BatchCounter::load_or_recover(&layout, false);
        assert!(remove_scene_batches(&layout, &mut counter).is_err());
    }

    #[test]
    fn test_status_counts_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_skeleton().expect("skeleton");
        touch(&layout.batch_path(Split::Train, 1, "npz"));
        touch(&layout.batch_path(Split::Train, 2, "npz"));
        touch(&layout.batch_path(Split::Test, 9, "npz"));
        fs::write(layout.counter_path(), "9\n").expect("counter");

        let status = DatasetStatus::read(&layout).expect("status");
        assert_eq!(status.counter, Some(9));
        assert_eq!(status.scene_checkpoint, None);
        assert_eq!(status.latest_on_disk, 9);
        assert_eq!(status.per_split[0], (Split::Train, 2));
        assert_eq!(status.per_split[1], (Split::Val, 0));
        assert_eq!(status.total_batches(), 3);
    }

    #[test]
    fn test_snapshot_file_names() {
        assert_eq!(snapshot_file_name(None), "current_config.json");
        assert_eq!(
            snapshot_file_name(Some("current_config")),
            "current_config.json"
        );
        assert_eq!(
            snapshot_file_name(Some("initial_config")),
            "initial_config.json"
        );
        assert_eq!(snapshot_file_name(Some("run 1")), "run 1.json");
        assert_eq!(snapshot_file_name(Some("a/b:c.json")), "abc.json");
        assert_eq!(snapshot_file_name(Some("../..")), "current_config.json");
    }

    #[test]
    fn test_save_config_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        let value = serde_json::json!({ "batch_size": 500, "verbose": false });

        let path = save_config_snapshot(&layout, &value, Some("initial_config")).expect("save");
        assert_eq!(path, layout.config_dir().join("initial_config.json"));

        let text = fs::read_to_string(&path).expect("read");
        let back: serde_json::Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, value);
    }
}
