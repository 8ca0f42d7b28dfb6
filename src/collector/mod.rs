//! The capture side of the pipeline.
//!
//! [`DatasetCollector`] is driven synchronously by the host's event loop via
//! [`DatasetCollector::handle_event`]. It owns the activation state, the
//! sampling gate, the action label and the in-flight observations; completed
//! batches are moved onto the persistence queue and never touch the disk from
//! the tick path.

pub mod accumulator;
pub mod action;
pub mod split;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use accumulator::{Accumulator, Batch, FrameStack, Observation};
pub use action::{ActionLabel, ActionTracker};
pub use split::{Split, SplitAssigner};

use crate::bus::{CollectorEvent, EventSink, Notification};
use crate::config::{Config, SplitRatio};
use crate::dataset::{self, BatchCounter, DatasetLayout};
use crate::export::health::HealthMetrics;
use crate::persist::{BatchCodec, GzipJsonCodec, PersistHandle, PersistStats, WorkItem};
use crate::sensor::SensorRig;

/// Whether ticks produce observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Inactive,
    Active,
}

/// Collector tunables, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub batch_size: usize,
    pub sample_stride: u64,
    pub visibility_check_interval: u64,
    pub shutdown_timeout: Duration,
    pub split_ratio: SplitRatio,
}

impl CollectorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.dataset.batch_size.max(1),
            sample_stride: cfg.dataset.sample_stride.max(1),
            visibility_check_interval: cfg.capture.visibility_check_interval.max(1),
            shutdown_timeout: cfg.persist.shutdown_timeout,
            split_ratio: cfg.dataset.split_ratio.clone(),
        }
    }
}

/// Samples observations from a [`SensorRig`] and hands completed batches to
/// the persistence worker.
pub struct DatasetCollector<R: SensorRig> {
    settings: CollectorSettings,
    layout: DatasetLayout,
    rig: R,
    events: Arc<dyn EventSink>,
    health: Arc<HealthMetrics>,
    codec: Arc<dyn BatchCodec>,
    tracker: ActionTracker,
    accumulator: Accumulator,
    splits: SplitAssigner,
    activation: Activation,
    frame_counter: u64,
    verbose: bool,
    closed: bool,
    persist: PersistHandle,
}

impl<R: SensorRig> std::fmt::Debug for DatasetCollector<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetCollector")
            .field("root", &self.layout.root())
            .field("activation", &self.activation)
            .field("frame_counter", &self.frame_counter)
            .field("pending", &self.accumulator.len())
            .field("action", &self.tracker.current())
            .finish_non_exhaustive()
    }
}

impl<R: SensorRig> DatasetCollector<R> {
    /// Creates the dataset skeleton and loads or recovers the batch counter.
    ///
    /// The persistence worker is not running until [`start`](Self::start).
    pub fn new(
        cfg: &Config,
        rig: R,
        events: Arc<dyn EventSink>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let settings = CollectorSettings::from_config(cfg);
        let layout = DatasetLayout::new(&cfg.dataset.root);
        layout
            .ensure_skeleton()
            .with_context(|| format!("preparing dataset root {}", layout.root().display()))?;

        let counter = BatchCounter::load_or_recover(&layout, cfg.verbose);
        tracing::info!(
            root = %layout.root().display(),
            counter = counter.value(),
            batch_size = settings.batch_size,
            sample_stride = settings.sample_stride,
            "dataset collector ready",
        );

        let persist = PersistHandle::new(layout.clone(), counter, Arc::clone(&health));
        persist.stats().set_verbose(cfg.verbose);
        health.active.set(0.0);

        Ok(Self {
            splits: SplitAssigner::new(settings.split_ratio.clone()),
            settings,
            layout,
            rig,
            events,
            health,
            codec: Arc::new(GzipJsonCodec::new()),
            tracker: ActionTracker::new(),
            accumulator: Accumulator::new(),
            activation: Activation::Inactive,
            frame_counter: 0,
            verbose: cfg.verbose,
            closed: false,
            persist,
        })
    }

    /// Replaces the batch codec. Must be called before `start`.
    pub fn with_codec(mut self, codec: Arc<dyn BatchCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Makes split assignment reproducible.
    pub fn with_split_seed(mut self, seed: u64) -> Self {
        self.splits = SplitAssigner::seeded(self.settings.split_ratio.clone(), seed);
        self
    }

    /// Spawns the persistence worker on the current runtime.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        self.persist.start(
            Arc::clone(&self.codec),
            Arc::clone(&self.events),
            ctx,
        )
    }

    /// Dispatches one bus event. Never blocks on I/O and never fails.
    pub fn handle_event(&mut self, event: CollectorEvent) {
        match event {
            CollectorEvent::Tick => self.on_tick(),
            CollectorEvent::SceneCreated => self.on_scene_created(),
            CollectorEvent::SceneCleared => self.on_scene_cleared(),
            CollectorEvent::Move(cmd) => {
                if self.tracker.on_move(&cmd) && self.verbose {
                    tracing::debug!(action = %self.tracker.current(), "action label changed");
                }
            }
            CollectorEvent::Rotate(cmd) => {
                if self.tracker.on_rotate(&cmd) && self.verbose {
                    tracing::debug!(action = %self.tracker.current(), "action label changed");
                }
            }
            CollectorEvent::DirectoryChanged { root } => self.on_directory_changed(root),
            CollectorEvent::ConfigChanged { verbose } => self.set_verbose(verbose),
        }
    }

    fn on_tick(&mut self) {
        if self.activation != Activation::Active {
            return;
        }

        self.frame_counter += 1;
        self.health.ticks.inc();
        let frame = self.frame_counter;

        if frame % self.settings.visibility_check_interval == 0 {
            self.check_visibility(frame);
        }

        if frame % self.settings.sample_stride != 0 {
            return;
        }

        self.sample(frame);

        if self.accumulator.len() >= self.settings.batch_size {
            self.flush();
        }
    }

    fn check_visibility(&mut self, frame: u64) {
        if let Err(e) = self.rig.enforce_target_invisible() {
            tracing::debug!(frame, error = %e, "enforcing target invisibility failed");
        }
        match self.rig.target_visible() {
            Ok(visible) => tracing::debug!(frame, visible, "target visibility check"),
            Err(e) => tracing::debug!(frame, error = %e, "target visibility unknown"),
        }
    }

    fn sample(&mut self, frame: u64) {
        if let Err(e) = self.rig.enforce_target_invisible() {
            tracing::debug!(frame, error = %e, "enforcing target invisibility failed");
        }

        let mut distance = self.rig.distance_to_target();
        let mut direction = [0.0f32; 3];
        if distance > 0.0 {
            match self.rig.target_bearing() {
                Ok(bearing) => {
                    direction = bearing.direction;
                    if bearing.distance > 0.0 {
                        distance = bearing.distance;
                        self.health.targets_located.inc();
                        self.events.publish(Notification::TargetLocated {
                            frame,
                            distance,
                            direction,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(frame, error = %e, "target bearing unavailable");
                }
            }
        }

        let Some(image) = self.rig.capture_frame() else {
            self.health.observations_dropped.inc();
            tracing::debug!(frame, "no sensor frame, observation dropped");
            return;
        };
        let pose = self.rig.capture_pose();
        let action = self.tracker.current();

        self.accumulator.append(Observation {
            frame: image,
            pose,
            frame_index: frame,
            distance,
            action,
            direction,
        });
        self.health.observations_captured.inc();
        self.health.accumulator_len.set(self.accumulator.len() as f64);

        self.events.publish(Notification::CaptureComplete {
            frame,
            distance,
            action,
            direction,
        });
    }

    fn on_scene_created(&mut self) {
        if self.closed {
            tracing::warn!("scene created after shutdown, ignoring");
            return;
        }

        self.accumulator.clear();
        self.frame_counter = 0;
        self.activation = Activation::Active;
        self.health.active.set(1.0);
        self.health.accumulator_len.set(0.0);

        if let Err(e) = self.persist.enqueue(WorkItem::SceneStarted) {
            tracing::error!(error = %e, "scene checkpoint not recorded");
        }
        tracing::info!(root = %self.layout.root().display(), "scene created, collection active");
    }

    fn on_scene_cleared(&mut self) {
        let discarded = self.accumulator.len();
        self.accumulator.clear();
        self.activation = Activation::Inactive;
        self.health.active.set(0.0);
        self.health.accumulator_len.set(0.0);
        tracing::info!(discarded, "scene cleared, collection inactive");
    }

    fn on_directory_changed(&mut self, root: PathBuf) {
        tracing::info!(
            from = %self.layout.root().display(),
            to = %root.display(),
            "dataset directory changing",
        );

        // Whatever is in flight belongs to the old root.
        self.flush();

        self.layout = DatasetLayout::new(root);
        let item = WorkItem::Retarget {
            layout: self.layout.clone(),
            verbose: self.verbose,
        };
        if let Err(e) = self.persist.enqueue(item) {
            tracing::error!(error = %e, "dataset root change not applied by worker");
        }
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        self.persist.stats().set_verbose(verbose);
        tracing::info!(verbose, "collector configuration updated");
    }

    /// Moves the in-flight observations onto the persistence queue.
    ///
    /// Returns false if there was nothing to flush or the worker is gone.
    /// The accumulator is empty afterwards in every case.
    pub fn flush(&mut self) -> bool {
        if self.accumulator.is_empty() {
            return false;
        }

        let split = self.splits.assign();
        let batch = self.accumulator.take_batch(split);
        let count = batch.len();
        self.health.accumulator_len.set(0.0);

        match self.persist.enqueue(WorkItem::Persist(batch)) {
            Ok(()) => {
                self.health.batches_queued.inc();
                tracing::debug!(count, split = %split, "batch queued");
                true
            }
            Err(e) => {
                self.health.batch_errors.inc();
                tracing::error!(error = %e, count, split = %split, "batch lost");
                false
            }
        }
    }

    /// Asks the worker to delete this scene's batches and roll the counter
    /// back to the scene checkpoint.
    pub fn remove_scene_batches(&self) -> Result<()> {
        self.persist.enqueue(WorkItem::RemoveSceneBatches)
    }

    /// Writes a JSON configuration snapshot under the current root.
    pub fn save_config_snapshot(
        &self,
        value: &serde_json::Value,
        name: Option<&str>,
    ) -> Result<PathBuf> {
        dataset::save_config_snapshot(&self.layout, value, name)
    }

    /// Resolves once the worker has handled everything queued so far.
    pub async fn wait_idle(&self) -> Result<()> {
        self.persist.wait_idle().await
    }

    /// Deactivates, flushes, and waits for the worker within the configured
    /// timeout. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.activation = Activation::Inactive;
        self.health.active.set(0.0);

        let pending = self.accumulator.len();
        if pending > 0 {
            if self.flush() {
                tracing::info!(count = pending, "flushed partial batch on shutdown");
            } else {
                tracing::warn!(count = pending, "partial batch lost on shutdown");
            }
        }

        self.persist.shutdown(self.settings.shutdown_timeout).await;

        tracing::info!(
            counter = self.persist.stats().counter(),
            saved = self.persist.stats().batches_saved(),
            "dataset collector stopped",
        );
    }

    pub fn is_active(&self) -> bool {
        self.activation == Activation::Active
    }

    /// Ticks seen since the current scene became active.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn pending_observations(&self) -> usize {
        self.accumulator.len()
    }

    pub fn current_action(&self) -> ActionLabel {
        self.tracker.current()
    }

    /// Last batch id allocated by the worker.
    pub fn batch_counter(&self) -> u64 {
        self.persist.stats().counter()
    }

    pub fn stats(&self) -> &Arc<PersistStats> {
        self.persist.stats()
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn rig(&self) -> &R {
        &self.rig
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelSink, MoveCommand};
    use crate::config::DatasetConfig;
    use crate::sensor::{Bearing, CaptureError, Pose, SensorFrame};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Rig with call counters and scriptable failures.
    #[derive(Default)]
    struct ScriptedRig {
        frame_calls: u64,
        enforce_calls: u64,
        visible_calls: u64,
        bearing_calls: u64,
        /// 1-based frame requests that return no image.
        missing: Vec<u64>,
        distance: f32,
        bearing: Option<Bearing>,
    }

    impl SensorRig for ScriptedRig {
        fn capture_frame(&mut self) -> Option<SensorFrame> {
            self.frame_calls += 1;
            if self.missing.contains(&self.frame_calls) {
                return None;
            }
            SensorFrame::new(2, 2, vec![self.frame_calls as f32; 4])
        }

        fn capture_pose(&mut self) -> Pose {
            Pose::default()
        }

        fn distance_to_target(&mut self) -> f32 {
            self.distance
        }

        fn target_bearing(&mut self) -> Result<Bearing, CaptureError> {
            self.bearing_calls += 1;
            self.bearing
                .ok_or_else(|| CaptureError::Unavailable("ray cast failed".to_string()))
        }

        fn enforce_target_invisible(&mut self) -> Result<(), CaptureError> {
            self.enforce_calls += 1;
            Ok(())
        }

        fn target_visible(&mut self) -> Result<bool, CaptureError> {
            self.visible_calls += 1;
            Ok(false)
        }
    }

    fn collector(
        root: &Path,
        batch_size: usize,
        sample_stride: u64,
        rig: ScriptedRig,
    ) -> (DatasetCollector<ScriptedRig>, UnboundedReceiver<Notification>) {
        let cfg = Config {
            dataset: DatasetConfig {
                root: root.to_path_buf(),
                batch_size,
                sample_stride,
                ..Default::default()
            },
            ..Default::default()
        };
        let (sink, rx) = ChannelSink::new();
        let health = HealthMetrics::unserved().expect("metrics");
        let c = DatasetCollector::new(&cfg, rig, Arc::new(sink), health)
            .expect("collector")
            .with_split_seed(1);
        (c, rx)
    }

    fn ticks<R: SensorRig>(c: &mut DatasetCollector<R>, n: u64) {
        for _ in 0..n {
            c.handle_event(CollectorEvent::Tick);
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_new_builds_skeleton() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("ds");
        let (c, _rx) = collector(&root, 10, 1, ScriptedRig::default());
        assert!(root.join("train").is_dir());
        assert!(root.join("config").is_dir());
        assert!(root.join("batch_counter.txt").is_file());
        assert_eq!(c.batch_counter(), 0);
        assert!(!c.is_active());
    }

    #[test]
    fn test_inactive_ticks_touch_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, mut rx) = collector(dir.path(), 10, 1, ScriptedRig::default());
        ticks(&mut c, 100);
        assert_eq!(c.frame_counter(), 0);
        assert_eq!(c.rig().frame_calls, 0);
        assert_eq!(c.rig().enforce_calls, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_sampling_stride() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, _rx) = collector(dir.path(), 100, 10, ScriptedRig::default());
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 35);
        assert_eq!(c.frame_counter(), 35);
        assert_eq!(c.rig().frame_calls, 3);
        assert_eq!(c.pending_observations(), 3);
    }

    #[test]
    fn test_visibility_check_runs_independently_of_sampling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, _rx) = collector(dir.path(), 100, 1000, ScriptedRig::default());
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 120);
        assert_eq!(c.rig().frame_calls, 0);
        assert_eq!(c.rig().visible_calls, 2);
        assert_eq!(c.rig().enforce_calls, 2);
    }

    #[test]
    fn test_missing_frame_drops_observation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rig = ScriptedRig {
            missing: vec![1],
            ..Default::default()
        };
        let (mut c, mut rx) = collector(dir.path(), 100, 10, rig);
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 20);
        assert_eq!(c.pending_observations(), 1);

        let captures: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                Notification::CaptureComplete { frame, .. } => Some(frame),
                _ => None,
            })
            .collect();
        assert_eq!(captures, vec![20]);
    }

    #[test]
    fn test_refined_distance_overrides_and_publishes_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rig = ScriptedRig {
            distance: 9.0,
            bearing: Some(Bearing {
                direction: [0.0, 1.0, 0.0],
                distance: 7.5,
            }),
            ..Default::default()
        };
        let (mut c, mut rx) = collector(dir.path(), 100, 1, rig);
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 1);

        let notes = drain(&mut rx);
        assert_eq!(
            notes,
            vec![
                Notification::TargetLocated {
                    frame: 1,
                    distance: 7.5,
                    direction: [0.0, 1.0, 0.0],
                },
                Notification::CaptureComplete {
                    frame: 1,
                    distance: 7.5,
                    action: ActionLabel::Hover,
                    direction: [0.0, 1.0, 0.0],
                },
            ]
        );
    }

    #[test]
    fn test_bearing_failure_keeps_tick_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rig = ScriptedRig {
            distance: 3.0,
            bearing: None,
            ..Default::default()
        };
        let (mut c, mut rx) = collector(dir.path(), 100, 1, rig);
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 2);

        assert_eq!(c.pending_observations(), 2);
        assert_eq!(c.rig().bearing_calls, 2);
        let notes = drain(&mut rx);
        assert!(notes.iter().all(|n| matches!(
            n,
            Notification::CaptureComplete {
                distance,
                direction: [0.0, 0.0, 0.0],
                ..
            } if *distance == 3.0
        )));
    }

    #[test]
    fn test_unknown_distance_skips_bearing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rig = ScriptedRig {
            distance: -1.0,
            ..Default::default()
        };
        let (mut c, _rx) = collector(dir.path(), 100, 1, rig);
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 3);
        assert_eq!(c.rig().bearing_calls, 0);
        assert_eq!(c.pending_observations(), 3);
    }

    #[test]
    fn test_label_attached_to_observation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, mut rx) = collector(dir.path(), 100, 1, ScriptedRig::default());
        c.handle_event(CollectorEvent::SceneCreated);
        c.handle_event(CollectorEvent::Move(MoveCommand {
            dx: 0.0,
            dy: -0.8,
            dz: 0.0,
            label: None,
        }));
        ticks(&mut c, 1);
        assert!(drain(&mut rx).contains(&Notification::CaptureComplete {
            frame: 1,
            distance: 0.0,
            action: ActionLabel::Backward,
            direction: [0.0; 3],
        }));
    }

    #[test]
    fn test_scene_clear_discards_partial_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, _rx) = collector(dir.path(), 100, 1, ScriptedRig::default());
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 5);
        c.handle_event(CollectorEvent::SceneCleared);
        assert_eq!(c.pending_observations(), 0);
        assert!(!c.is_active());
        assert!(!c.flush());
    }

    #[test]
    fn test_scene_created_resets_frame_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, _rx) = collector(dir.path(), 100, 1, ScriptedRig::default());
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 7);
        c.handle_event(CollectorEvent::SceneCreated);
        assert_eq!(c.frame_counter(), 0);
        assert_eq!(c.pending_observations(), 0);
    }

    #[test]
    fn test_full_accumulator_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let health = HealthMetrics::unserved().expect("metrics");
        let cfg = Config {
            dataset: DatasetConfig {
                root: dir.path().to_path_buf(),
                batch_size: 2,
                sample_stride: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut c = DatasetCollector::new(
            &cfg,
            ScriptedRig::default(),
            Arc::new(crate::bus::NullSink),
            Arc::clone(&health),
        )
        .expect("collector");
        c.handle_event(CollectorEvent::SceneCreated);
        ticks(&mut c, 5);
        assert_eq!(c.pending_observations(), 1);
        assert_eq!(health.batches_queued.get(), 2.0);
        assert_eq!(health.observations_captured.get(), 5.0);
    }

    #[test]
    fn test_config_changed_updates_verbose() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut c, _rx) = collector(dir.path(), 100, 1, ScriptedRig::default());
        c.handle_event(CollectorEvent::ConfigChanged { verbose: true });
        assert!(c.verbose);
    }
}
