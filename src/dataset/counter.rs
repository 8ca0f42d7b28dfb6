use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use super::{read_u64_file, scan_latest_batch_number, write_atomic, DatasetLayout};

/// Durable id of the last allocated batch under one dataset root.
#[derive(Debug)]
pub struct BatchCounter {
    path: PathBuf,
    value: u64,
}

impl BatchCounter {
    /// Reads the counter file, falling back to a directory rescan when the
    /// file is missing or unparsable. Never fails; an unreadable root yields 0.
    pub fn load_or_recover(layout: &DatasetLayout, verbose: bool) -> Self {
        let path = layout.counter_path();
        match read_u64_file(&path) {
            Ok(Some(value)) => {
                if verbose {
                    tracing::debug!(path = %path.display(), value, "loaded batch counter");
                }
                return Self { path, value };
            }
            Ok(None) => {
                if verbose {
                    tracing::debug!(path = %path.display(), "no batch counter, rescanning");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch counter unreadable, rescanning");
            }
        }
        Self::recover(layout)
    }

    /// Rebuilds the counter from the batch files on disk and persists it.
    pub fn recover(layout: &DatasetLayout) -> Self {
        let value = match scan_latest_batch_number(layout) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "batch rescan failed, starting from 0");
                0
            }
        };
        let counter = Self {
            path: layout.counter_path(),
            value,
        };
        counter.store_or_warn();
        tracing::info!(value, root = %layout.root().display(), "recovered batch counter");
        counter
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Allocates the next batch id and persists it.
    ///
    /// A failed write is logged; the in-memory value still advances so ids
    /// stay unique for the life of the process. Fails only when the id
    /// space is exhausted.
    pub fn advance(&mut self) -> Result<u64> {
        self.value = self
            .value
            .checked_add(1)
            .ok_or_else(|| anyhow!("batch counter exhausted at {}", self.value))?;
        self.store_or_warn();
        Ok(self.value)
    }

    /// Moves the counter to an explicit value. Only scene rollback uses this.
    pub fn reset_to(&mut self, value: u64) -> Result<()> {
        self.value = value;
        self.store()
    }

    fn store(&self) -> Result<()> {
        write_atomic(&self.path, self.value.to_string().as_bytes())
            .with_context(|| format!("writing {}", self.path.display()))
    }

    fn store_or_warn(&self) {
        if let Err(e) = self.store() {
            tracing::warn!(error = %e, value = self.value, "persisting batch counter failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::collector::split::Split;

    fn layout() -> (tempfile::TempDir, DatasetLayout) {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_skeleton().expect("skeleton");
        (dir, layout)
    }

    #[test]
    fn test_fresh_root_starts_at_zero() {
        let (_dir, layout) = layout();
        let counter = BatchCounter::load_or_recover(&layout, true);
        assert_eq!(counter.value(), 0);
        assert_eq!(
            fs::read_to_string(layout.counter_path()).expect("read"),
            "0"
        );
    }

    #[test]
    fn test_advance_persists() {
        let (_dir, layout) = layout();
        let mut counter = BatchCounter::load_or_recover(&layout, false);
        assert_eq!(counter.advance().expect("advance"), 1);
        assert_eq!(counter.advance().expect("advance"), 2);

        let reloaded = BatchCounter::load_or_recover(&layout, false);
        assert_eq!(reloaded.value(), 2);
    }

    #[test]
    fn test_advance_at_max_fails_without_wrapping() {
        let (_dir, layout) = layout();
        fs::write(layout.counter_path(), u64::MAX.to_string()).expect("counter");

        let mut counter = BatchCounter::load_or_recover(&layout, false);
        let err = counter.advance().expect_err("exhausted");
        assert!(err.to_string().contains("exhausted"), "{err}");
        assert_eq!(counter.value(), u64::MAX);
        assert_eq!(
            fs::read_to_string(layout.counter_path()).expect("read"),
            u64::MAX.to_string()
        );
    }

    #[test]
    fn test_existing_file_wins_over_scan() {
        let (_dir, layout) = layout();
        fs::write(layout.batch_path(Split::Train, 4, "npz"), b"x").expect("batch");
        fs::write(layout.counter_path(), "17\n").expect("counter");
        assert_eq!(BatchCounter::load_or_recover(&layout, false).value(), 17);
    }

    #[test]
    fn test_corrupt_file_triggers_rescan() {
        let (_dir, layout) = layout();
        fs::write(layout.batch_path(Split::Val, 8, "npz"), b"x").expect("batch");
        fs::write(layout.counter_path(), "eight").expect("counter");

        let counter = BatchCounter::load_or_recover(&layout, false);
        assert_eq!(counter.value(), 8);
        assert_eq!(
            fs::read_to_string(layout.counter_path()).expect("read"),
            "8"
        );
    }

    #[test]
    fn test_reset_to() {
        let (_dir, layout) = layout();
        let mut counter = BatchCounter::load_or_recover(&layout, false);
        counter.advance().expect("advance");
        counter.advance().expect("advance");
        counter.reset_to(1).expect("reset");
        assert_eq!(BatchCounter::load_or_recover(&layout, false).value(), 1);
    }
}
