use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use depthcap::bus::{ChannelSink, CollectorEvent, MoveCommand, Notification, RotateCommand};
use depthcap::collector::{ActionLabel, DatasetCollector};
use depthcap::config::Config;
use depthcap::dataset::{self, BatchCounter, DatasetLayout, DatasetStatus};
use depthcap::export::health::HealthMetrics;
use depthcap::sensor::SyntheticRig;

/// Sensor dataset capture and maintenance.
#[derive(Parser)]
#[command(name = "depthcap", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root, overriding `dataset.root` from the config.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config's `log_level`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Show the batch counter, scene checkpoint and per-split batch counts.
    Status,
    /// Rebuild the batch counter from the batch files on disk.
    Recover,
    /// Delete the batches written since the last scene checkpoint.
    PruneScene,
    /// Run the pipeline end to end against a synthetic sensor rig.
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of simulation frames to run.
    #[arg(long, default_value_t = 10_000)]
    ticks: u64,

    /// Delay between frames (e.g. "16ms"); 0 runs as fast as possible.
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    tick_interval: Duration,

    /// Sensor frame width.
    #[arg(long, default_value_t = 64)]
    width: usize,

    /// Sensor frame height.
    #[arg(long, default_value_t = 48)]
    height: usize,

    /// Seed for reproducible split assignment.
    #[arg(long)]
    seed: Option<u64>,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = cli.command {
        println!("depthcap {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::parse_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(root) = cli.root.clone() {
        cfg.dataset.root = root;
    }

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    match cli.command {
        Command::Version => Ok(()),
        Command::Status => status(&cfg),
        Command::Recover => recover(&cfg),
        Command::PruneScene => prune_scene(&cfg),
        Command::Simulate(args) => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting depthcap simulation",
            );

            // Build and run the tokio runtime.
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;

            rt.block_on(async { simulate(cfg, args).await })
        }
    }
}

fn status(cfg: &Config) -> Result<()> {
    let layout = DatasetLayout::new(&cfg.dataset.root);
    let status = DatasetStatus::read(&layout)
        .with_context(|| format!("reading dataset {}", layout.root().display()))?;

    let show = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| v.to_string());

    println!("root:             {}", layout.root().display());
    println!("batch counter:    {}", show(status.counter));
    println!("scene checkpoint: {}", show(status.scene_checkpoint));
    println!("latest on disk:   {}", status.latest_on_disk);
    for (split, count) in status.per_split {
        println!("{:<17} {count}", format!("{split}:"));
    }
    println!("total batches:    {}", status.total_batches());

    if let Some(counter) = status.counter {
        if counter < status.latest_on_disk {
            tracing::warn!(
                counter,
                latest_on_disk = status.latest_on_disk,
                "counter is behind the files on disk, run `depthcap recover`",
            );
        }
    }
    Ok(())
}

fn recover(cfg: &Config) -> Result<()> {
    let layout = DatasetLayout::new(&cfg.dataset.root);
    layout.ensure_skeleton()?;
    let counter = BatchCounter::recover(&layout);
    println!("batch counter: {}", counter.value());
    Ok(())
}

fn prune_scene(cfg: &Config) -> Result<()> {
    let layout = DatasetLayout::new(&cfg.dataset.root);
    let mut counter = BatchCounter::load_or_recover(&layout, cfg.verbose);
    let report = dataset::remove_scene_batches(&layout, &mut counter)?;
    println!(
        "removed {} batches, counter {} -> {}",
        report.removed, report.previous_counter, report.checkpoint,
    );
    Ok(())
}

/// Control input played back during a simulation, one every 100 frames.
fn scripted_input(tick: u64) -> Option<CollectorEvent> {
    if tick % 100 != 0 {
        return None;
    }
    let event = match (tick / 100) % 4 {
        0 => CollectorEvent::Move(MoveCommand {
            dx: 0.0,
            dy: 1.0,
            dz: 0.0,
            label: None,
        }),
        1 => CollectorEvent::Rotate(RotateCommand {
            delta: 0.3,
            label: None,
        }),
        2 => CollectorEvent::Move(MoveCommand {
            dx: 0.0,
            dy: 0.0,
            dz: 0.0,
            label: Some(ActionLabel::Hover),
        }),
        _ => CollectorEvent::Move(MoveCommand {
            dx: -0.5,
            dy: 0.0,
            dz: 0.2,
            label: None,
        }),
    };
    Some(event)
}

async fn simulate(cfg: Config, args: SimulateArgs) -> Result<()> {
    // Set up signal handling.
    let stop = CancellationToken::new();
    tokio::spawn(watch_signals(stop.clone()));

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    if cfg.health.enabled {
        health.start().await?;
    }

    let (sink, mut notifications) = ChannelSink::new();
    let logger = tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            match &n {
                Notification::BatchSaved { .. } | Notification::ConfigUpdated { .. } => {
                    tracing::debug!(topic = n.topic(), event = ?n, "notification");
                }
                Notification::BatchError { error } => {
                    tracing::warn!(topic = n.topic(), error = %error, "notification");
                }
                _ => tracing::trace!(topic = n.topic(), event = ?n, "notification"),
            }
        }
    });

    let rig = SyntheticRig::new(args.width, args.height);
    let mut collector = DatasetCollector::new(&cfg, rig, Arc::new(sink), Arc::clone(&health))?;
    if let Some(seed) = args.seed {
        collector = collector.with_split_seed(seed);
    }

    let worker_ctx = CancellationToken::new();
    collector.start(worker_ctx.clone())?;
    collector.handle_event(CollectorEvent::SceneCreated);

    let mut interval = (!args.tick_interval.is_zero()).then(|| {
        let mut interval = tokio::time::interval(args.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    let mut ran = 0u64;
    for tick in 1..=args.ticks {
        if stop.is_cancelled() {
            break;
        }
        if let Some(event) = scripted_input(tick) {
            collector.handle_event(event);
        }
        collector.handle_event(CollectorEvent::Tick);
        ran = tick;

        match interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None if tick % 1024 == 0 => tokio::task::yield_now().await,
            None => {}
        }
    }

    tracing::info!(
        ticks = ran,
        pending = collector.pending_observations(),
        "simulation finished",
    );

    // Graceful shutdown.
    collector.shutdown().await;
    let saved = collector.stats().batches_saved();
    let counter = collector.batch_counter();
    drop(collector);

    if tokio::time::timeout(Duration::from_secs(1), logger)
        .await
        .is_err()
    {
        tracing::debug!("notification logger still busy, detaching");
    }
    health.stop();

    println!(
        "saved {saved} batches to {} (counter {counter})",
        cfg.dataset.root.display(),
    );

    tracing::info!("depthcap stopped");

    Ok(())
}

async fn watch_signals(stop: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                if ctrl_c.await.is_ok() {
                    tracing::info!("received SIGINT, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    if ctrl_c.await.is_ok() {
        tracing::info!("received SIGINT, shutting down");
    }

    stop.cancel();
}
