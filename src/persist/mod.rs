//! Background persistence worker.
//!
//! A single tokio task owns the work queue. Items are handled strictly in
//! enqueue order, which is what keeps batch numbering FIFO and lets scene
//! checkpoints and directory retargets land behind every earlier batch.
//! Filesystem work runs on the blocking pool.

pub mod codec;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use codec::{BatchCodec, CodecError, GzipJsonCodec, StoredBatch};

use crate::bus::{EventSink, Notification};
use crate::collector::accumulator::Batch;
use crate::collector::split::Split;
use crate::dataset::{self, BatchCounter, DatasetLayout, RemovalReport};
use crate::export::health::HealthMetrics;

/// Unit of work for the persistence worker.
#[derive(Debug)]
pub enum WorkItem {
    /// Number, encode and write one batch.
    Persist(Batch),
    /// Resynchronize the counter and record the scene checkpoint.
    SceneStarted,
    /// Switch to a new dataset root.
    Retarget { layout: DatasetLayout, verbose: bool },
    /// Delete the batches written since the scene checkpoint.
    RemoveSceneBatches,
    /// Completes once every earlier item has been handled.
    Barrier(oneshot::Sender<()>),
    /// Stop after everything queued before it.
    Shutdown,
}

impl WorkItem {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Persist(_) => "persist",
            Self::SceneStarted => "scene_started",
            Self::Retarget { .. } => "retarget",
            Self::RemoveSceneBatches => "remove_scene_batches",
            Self::Barrier(_) => "barrier",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Worker state readable from the tick context.
#[derive(Debug, Default)]
pub struct PersistStats {
    counter: AtomicU64,
    saved: AtomicU64,
    errors: AtomicU64,
    verbose: AtomicBool,
}

impl PersistStats {
    /// Last allocated batch id under the current root.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Batches written by this process.
    pub fn batches_saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    pub fn batch_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }
}

/// Result of a successful batch write.
#[derive(Debug, Clone)]
struct SavedBatch {
    batch_id: u64,
    split: Split,
    count: usize,
    path: PathBuf,
}

/// Filesystem-side state, touched only from blocking tasks.
struct WorkerState {
    layout: DatasetLayout,
    counter: BatchCounter,
    codec: Arc<dyn BatchCodec>,
}

impl WorkerState {
    fn persist(&mut self, batch: &Batch) -> Result<SavedBatch> {
        let ext = self.codec.extension().to_string();
        let split_dir = self.layout.split_dir(batch.split);
        std::fs::create_dir_all(&split_dir)
            .with_context(|| format!("creating split directory {}", split_dir.display()))?;

        let mut batch_id = self.counter.advance()?;
        while self.layout.batch_id_taken(batch_id, &ext) {
            tracing::warn!(batch_id, "batch file already exists, skipping id");
            batch_id = self.counter.advance()?;
        }

        let path = self.layout.batch_path(batch.split, batch_id, &ext);
        self.codec
            .write_batch(&path, batch_id, batch)
            .with_context(|| format!("saving batch {batch_id}"))?;

        Ok(SavedBatch {
            batch_id,
            split: batch.split,
            count: batch.len(),
            path,
        })
    }

    fn scene_started(&mut self, verbose: bool) -> Result<u64> {
        self.counter = BatchCounter::load_or_recover(&self.layout, verbose);
        let value = self.counter.value();
        dataset::write_scene_checkpoint(&self.layout, value)?;
        Ok(value)
    }

    fn retarget(&mut self, layout: DatasetLayout, verbose: bool) -> Result<()> {
        let built = layout.ensure_skeleton();
        self.counter = BatchCounter::load_or_recover(&layout, verbose);
        self.layout = layout;
        built
    }

    fn remove_scene_batches(&mut self) -> Result<RemovalReport> {
        dataset::remove_scene_batches(&self.layout, &mut self.counter)
    }
}

/// Collaborators the worker publishes to.
struct WorkerContext {
    events: Arc<dyn EventSink>,
    health: Arc<HealthMetrics>,
    stats: Arc<PersistStats>,
}

/// Worker not yet spawned; keeps the queue receiver and the root the
/// collector was constructed with.
struct PendingWorker {
    rx: mpsc::UnboundedReceiver<WorkItem>,
    layout: DatasetLayout,
    counter: BatchCounter,
}

/// Producer side of the persistence queue plus the worker's lifecycle.
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<WorkItem>,
    pending: Option<PendingWorker>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    stats: Arc<PersistStats>,
    health: Arc<HealthMetrics>,
}

impl std::fmt::Debug for PersistHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistHandle")
            .field("started", &self.task.is_some())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PersistHandle {
    /// Creates the queue. Items enqueued before [`start`](Self::start) wait
    /// in the channel.
    pub fn new(layout: DatasetLayout, counter: BatchCounter, health: Arc<HealthMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PersistStats::default());
        stats.counter.store(counter.value(), Ordering::Release);
        health.batch_counter.set(counter.value() as f64);

        Self {
            tx,
            pending: Some(PendingWorker {
                rx,
                layout,
                counter,
            }),
            task: None,
            cancel: CancellationToken::new(),
            stats,
            health,
        }
    }

    pub fn stats(&self) -> &Arc<PersistStats> {
        &self.stats
    }

    /// Spawns the worker task. `ctx` cancels it from outside.
    pub fn start(
        &mut self,
        codec: Arc<dyn BatchCodec>,
        events: Arc<dyn EventSink>,
        ctx: CancellationToken,
    ) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            bail!("persistence worker already started");
        };

        self.cancel = ctx;
        let state = Arc::new(Mutex::new(WorkerState {
            layout: pending.layout,
            counter: pending.counter,
            codec,
        }));
        let wctx = WorkerContext {
            events,
            health: Arc::clone(&self.health),
            stats: Arc::clone(&self.stats),
        };

        let task = tokio::spawn(run(pending.rx, self.cancel.clone(), state, wctx));
        self.task = Some(task);

        tracing::debug!("persistence worker started");
        Ok(())
    }

    /// Queues an item. Fails only once the worker has exited.
    pub fn enqueue(&self, item: WorkItem) -> Result<()> {
        let kind = item.kind();
        self.health.queue_depth.inc();
        if self.tx.send(item).is_err() {
            self.health.queue_depth.dec();
            bail!("persistence worker stopped, {kind} item dropped");
        }
        Ok(())
    }

    /// Resolves once everything enqueued so far has been handled.
    pub async fn wait_idle(&self) -> Result<()> {
        if self.task.is_none() {
            bail!("persistence worker not running");
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(WorkItem::Barrier(tx))?;
        rx.await.context("persistence worker exited before barrier")
    }

    /// Sends the shutdown sentinel and waits up to `timeout` for the worker.
    ///
    /// On timeout the worker is cancelled and left to finish on its own.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if let Some(pending) = self.pending.take() {
            let queued = pending.rx.len();
            if queued > 0 {
                tracing::warn!(queued, "persistence worker never started, discarding queue");
            }
            return;
        }

        if let Err(e) = self.enqueue(WorkItem::Shutdown) {
            tracing::debug!(error = %e, "shutdown sentinel not delivered");
        }

        let Some(task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => tracing::debug!("persistence worker stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "persistence task join failed"),
            Err(_) => {
                tracing::warn!(
                    timeout = ?timeout,
                    "persistence worker did not finish in time, cancelling",
                );
                self.cancel.cancel();
            }
        }
    }
}

/// Runs `f` against the worker state on the blocking pool.
async fn blocking<T, F>(state: &Arc<Mutex<WorkerState>>, f: F) -> Result<T>
where
    F: FnOnce(&mut WorkerState) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        let mut guard = state.lock();
        f(&mut *guard)
    })
    .await
    .context("persistence task panicked")?
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    ctx: CancellationToken,
    state: Arc<Mutex<WorkerState>>,
    wctx: WorkerContext,
) {
    loop {
        tokio::select! {
            biased;

            item = rx.recv() => {
                match item {
                    Some(WorkItem::Shutdown) => {
                        wctx.health.queue_depth.dec();
                        break;
                    }
                    Some(item) => handle(item, &state, &wctx).await,
                    None => break,
                }
            }
            _ = ctx.cancelled() => {
                // Drain what is already queued before exiting.
                while let Ok(item) = rx.try_recv() {
                    if matches!(item, WorkItem::Shutdown) {
                        break;
                    }
                    handle(item, &state, &wctx).await;
                }
                break;
            }
        }
    }

    tracing::debug!(
        saved = wctx.stats.batches_saved(),
        errors = wctx.stats.batch_errors(),
        "persistence worker exiting",
    );
}

async fn handle(item: WorkItem, state: &Arc<Mutex<WorkerState>>, wctx: &WorkerContext) {
    wctx.health.queue_depth.dec();
    let verbose = wctx.stats.verbose();

    match item {
        WorkItem::Persist(batch) => {
            let started = Instant::now();
            let result = blocking(state, move |st| {
                let saved = st.persist(&batch);
                Ok((saved, st.counter.value()))
            })
            .await;
            wctx.health
                .persist_duration
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok((Ok(saved), counter)) => on_saved(wctx, saved, counter),
                Ok((Err(e), counter)) => {
                    publish_counter(wctx, counter);
                    on_error(wctx, e);
                }
                Err(e) => on_error(wctx, e),
            }
        }
        WorkItem::SceneStarted => {
            match blocking(state, move |st| st.scene_started(verbose)).await {
                Ok(counter) => {
                    publish_counter(wctx, counter);
                    tracing::info!(checkpoint = counter, "scene checkpoint recorded");
                }
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "recording scene checkpoint failed");
                }
            }
        }
        WorkItem::Retarget { layout, verbose } => {
            let root = layout.root().to_path_buf();
            let result = blocking(state, move |st| {
                let built = st.retarget(layout, verbose);
                Ok((built, st.counter.value()))
            })
            .await;

            match result {
                Ok((built, counter)) => {
                    if let Err(e) = built {
                        tracing::error!(
                            error = %format!("{e:#}"),
                            root = %root.display(),
                            "building dataset directories failed",
                        );
                    }
                    publish_counter(wctx, counter);
                    tracing::info!(root = %root.display(), counter, "dataset root changed");
                    wctx.events.publish(Notification::ConfigUpdated { root, verbose });
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "retargeting dataset root failed");
                }
            }
        }
        WorkItem::RemoveSceneBatches => {
            match blocking(state, |st| st.remove_scene_batches()).await {
                Ok(report) => {
                    publish_counter(wctx, report.checkpoint);
                    wctx.events.publish(Notification::SceneBatchesRemoved {
                        removed: report.removed,
                        counter: report.checkpoint,
                    });
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "removing scene batches failed");
                }
            }
        }
        WorkItem::Barrier(done) => {
            let _ = done.send(());
        }
        WorkItem::Shutdown => {}
    }
}

fn publish_counter(wctx: &WorkerContext, counter: u64) {
    wctx.stats.counter.store(counter, Ordering::Release);
    wctx.health.batch_counter.set(counter as f64);
}

fn on_saved(wctx: &WorkerContext, saved: SavedBatch, counter: u64) {
    publish_counter(wctx, counter);
    wctx.stats.saved.fetch_add(1, Ordering::Relaxed);
    wctx.health
        .batches_saved
        .with_label_values(&[saved.split.as_str()])
        .inc();

    tracing::info!(
        batch_id = saved.batch_id,
        split = %saved.split,
        count = saved.count,
        path = %saved.path.display(),
        "batch saved",
    );

    wctx.events.publish(Notification::BatchSaved {
        batch_id: saved.batch_id,
        split: saved.split,
        count: saved.count,
        total_saved: counter,
    });
}

fn on_error(wctx: &WorkerContext, e: anyhow::Error) {
    wctx.stats.errors.fetch_add(1, Ordering::Relaxed);
    wctx.health.batch_errors.inc();
    let error = format!("{e:#}");
    tracing::error!(error = %error, "saving batch failed");
    wctx.events.publish(Notification::BatchError { error });
}
