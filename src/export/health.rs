use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for the capture pipeline.
///
/// All metrics use the "depthcap" namespace. Tick-path metrics are plain
/// atomics so updating them never allocates.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Capture ===
    /// Simulation frames seen while active.
    pub ticks: Counter,
    /// Observations appended to the accumulator.
    pub observations_captured: Counter,
    /// Sampling attempts dropped because the sensor returned no frame.
    pub observations_dropped: Counter,
    /// Sampling attempts where the target bearing was resolved.
    pub targets_located: Counter,
    /// Observations currently held in memory.
    pub accumulator_len: Gauge,
    /// Whether sampling is live (1=active, 0=inactive).
    pub active: Gauge,

    // === Persistence ===
    /// Batches handed to the persistence worker.
    pub batches_queued: Counter,
    /// Batches written, by split.
    pub batches_saved: CounterVec,
    /// Batches lost to codec or write failures.
    pub batch_errors: Counter,
    /// Work items waiting for the persistence worker.
    pub queue_depth: Gauge,
    /// Last allocated batch id.
    pub batch_counter: Gauge,
    /// Time to number, encode and write one batch (1ms-10s buckets).
    pub persist_duration: Histogram,
}

impl std::fmt::Debug for HealthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMetrics")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Capture ===
        let ticks = Counter::with_opts(
            Opts::new("ticks_total", "Simulation frames seen while active.").namespace("depthcap"),
        )?;
        let observations_captured = Counter::with_opts(
            Opts::new(
                "observations_captured_total",
                "Observations appended to the accumulator.",
            )
            .namespace("depthcap"),
        )?;
        let observations_dropped = Counter::with_opts(
            Opts::new(
                "observations_dropped_total",
                "Sampling attempts dropped because no sensor frame was available.",
            )
            .namespace("depthcap"),
        )?;
        let targets_located = Counter::with_opts(
            Opts::new(
                "targets_located_total",
                "Sampling attempts where the target bearing was resolved.",
            )
            .namespace("depthcap"),
        )?;
        let accumulator_len = Gauge::with_opts(
            Opts::new(
                "accumulator_observations",
                "Observations currently held in memory.",
            )
            .namespace("depthcap"),
        )?;
        let active = Gauge::with_opts(
            Opts::new(
                "active",
                "Whether sampling is live (1=active, 0=inactive).",
            )
            .namespace("depthcap"),
        )?;

        // === Persistence ===
        let batches_queued = Counter::with_opts(
            Opts::new(
                "batches_queued_total",
                "Batches handed to the persistence worker.",
            )
            .namespace("depthcap"),
        )?;
        let batches_saved = CounterVec::new(
            Opts::new("batches_saved_total", "Batches written, by split.").namespace("depthcap"),
            &["split"],
        )?;
        let batch_errors = Counter::with_opts(
            Opts::new(
                "batch_errors_total",
                "Batches lost to codec or write failures.",
            )
            .namespace("depthcap"),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new(
                "persist_queue_depth",
                "Work items waiting for the persistence worker.",
            )
            .namespace("depthcap"),
        )?;
        let batch_counter = Gauge::with_opts(
            Opts::new("batch_counter", "Last allocated batch id.").namespace("depthcap"),
        )?;
        let persist_duration = Histogram::with_opts(
            HistogramOpts::new(
                "persist_duration_seconds",
                "Time to number, encode and write one batch.",
            )
            .namespace("depthcap")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]),
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(observations_captured.clone()))?;
        registry.register(Box::new(observations_dropped.clone()))?;
        registry.register(Box::new(targets_located.clone()))?;
        registry.register(Box::new(accumulator_len.clone()))?;
        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(batches_queued.clone()))?;
        registry.register(Box::new(batches_saved.clone()))?;
        registry.register(Box::new(batch_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(batch_counter.clone()))?;
        registry.register(Box::new(persist_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ticks,
            observations_captured,
            observations_dropped,
            targets_located,
            accumulator_len,
            active,
            batches_queued,
            batches_saved,
            batch_errors,
            queue_depth,
            batch_counter,
            persist_duration,
        })
    }

    /// Metrics without a listen address, for embedding and tests.
    pub fn unserved() -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new("")?))
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        response
    }

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let metrics = HealthMetrics::new("").expect("metrics");
        metrics.ticks.inc();
        metrics.batches_saved.with_label_values(&["train"]).inc();

        let text = metrics.render().expect("render");
        assert!(text.contains("depthcap_ticks_total 1"), "{text}");
        assert!(
            text.contains("depthcap_batches_saved_total{split=\"train\"} 1"),
            "{text}"
        );
        assert!(text.contains("depthcap_persist_duration_seconds_bucket"));
    }

    #[tokio::test]
    async fn test_server_serves_health_and_metrics() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.batch_counter.set(12.0);
        let addr = metrics.start().await.expect("start");

        let health = http_get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.ends_with("ok"), "{health}");

        let body = http_get(addr, "/metrics").await;
        assert!(body.contains("depthcap_batch_counter 12"), "{body}");

        metrics.stop();
    }
}
