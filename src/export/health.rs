use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerClient;
use crate::reconcile::ReconciledState;
use crate::store::{ConnectionStatus, StateStore, Versioned};

const NAMESPACE: &str = "connscope";

/// Prometheus metrics for the monitor, plus the local HTTP surface.
///
/// All metrics use the "connscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Snapshot frames parsed successfully.
    pub snapshots_received: Counter,
    /// Snapshots overwritten in the throttle before being reconciled.
    pub snapshots_coalesced: Counter,
    /// Completed reconciliations.
    pub reconciliations: Counter,
    /// Frames rejected as malformed.
    pub parse_errors: Counter,
    /// Sessions ended by a transport failure or remote close.
    pub transport_errors: Counter,
    /// Connection attempts by result (ok/error).
    pub connect_attempts: CounterVec,
    /// Consumer-initiated closed history clears.
    pub history_clears: Counter,

    // === Controller ===
    /// Requests to the core controller by operation and status.
    pub controller_requests: CounterVec,
    /// Controller request latency by operation.
    pub controller_request_duration: HistogramVec,

    // === State ===
    /// Whether the snapshot source is connected (1=yes, 0=no).
    pub source_connected: Gauge,
    /// Gauges mirroring the latest published state.
    pub state: StateGauges,

    /// Time spent in a single reconciliation (10us-50ms buckets).
    pub reconcile_duration: Histogram,
}

/// Gauges describing the published connection table.
#[derive(Clone)]
pub struct StateGauges {
    pub active_connections: Gauge,
    pub closed_connections: Gauge,
    pub upload_total: Gauge,
    pub download_total: Gauge,
    /// Sum of per-connection upload rates.
    pub upload_rate: Gauge,
    /// Sum of per-connection download rates.
    pub download_rate: Gauge,
}

impl StateGauges {
    pub fn observe(&self, state: &ReconciledState) {
        self.active_connections.set(state.active.len() as f64);
        self.closed_connections.set(state.closed.len() as f64);
        self.upload_total.set(state.upload_total as f64);
        self.download_total.set(state.download_total as f64);
        self.upload_rate.set(state.upload_rate() as f64);
        self.download_rate.set(state.download_rate() as f64);
    }
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let snapshots_received = Counter::with_opts(
            Opts::new(
                "snapshots_received_total",
                "Total snapshot frames parsed successfully.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshots_coalesced = Counter::with_opts(
            Opts::new(
                "snapshots_coalesced_total",
                "Total snapshots replaced by a newer one before reconciliation.",
            )
            .namespace(NAMESPACE),
        )?;
        let reconciliations = Counter::with_opts(
            Opts::new("reconciliations_total", "Total completed reconciliations.")
                .namespace(NAMESPACE),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new(
                "parse_errors_total",
                "Total snapshot frames rejected as malformed.",
            )
            .namespace(NAMESPACE),
        )?;
        let transport_errors = Counter::with_opts(
            Opts::new(
                "transport_errors_total",
                "Total source sessions ended by a transport failure or remote close.",
            )
            .namespace(NAMESPACE),
        )?;
        let connect_attempts = CounterVec::new(
            Opts::new(
                "connect_attempts_total",
                "Total snapshot source connection attempts by result.",
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;
        let history_clears = Counter::with_opts(
            Opts::new(
                "history_clears_total",
                "Total consumer-initiated closed history clears.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Controller ===
        let controller_requests = CounterVec::new(
            Opts::new(
                "controller_requests_total",
                "Total requests to the core controller.",
            )
            .namespace(NAMESPACE),
            &["operation", "status"],
        )?;
        let controller_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "controller_request_duration_seconds",
                "Core controller request latency.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;

        // === State ===
        let source_connected = Gauge::with_opts(
            Opts::new(
                "source_connected",
                "Whether the snapshot source is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let active_connections = Gauge::with_opts(
            Opts::new("active_connections", "Number of active connections.").namespace(NAMESPACE),
        )?;
        let closed_connections = Gauge::with_opts(
            Opts::new(
                "closed_connections",
                "Number of closed connections retained in history.",
            )
            .namespace(NAMESPACE),
        )?;
        let upload_total = Gauge::with_opts(
            Opts::new("upload_total_bytes", "Aggregate upload counter.").namespace(NAMESPACE),
        )?;
        let download_total = Gauge::with_opts(
            Opts::new("download_total_bytes", "Aggregate download counter.").namespace(NAMESPACE),
        )?;
        let upload_rate = Gauge::with_opts(
            Opts::new(
                "upload_rate_bytes",
                "Sum of per-connection upload deltas in the last reconciliation.",
            )
            .namespace(NAMESPACE),
        )?;
        let download_rate = Gauge::with_opts(
            Opts::new(
                "download_rate_bytes",
                "Sum of per-connection download deltas in the last reconciliation.",
            )
            .namespace(NAMESPACE),
        )?;

        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Time to reconcile a single snapshot.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.05]),
        )?;

        // Ingest
        registry.register(Box::new(snapshots_received.clone()))?;
        registry.register(Box::new(snapshots_coalesced.clone()))?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(connect_attempts.clone()))?;
        registry.register(Box::new(history_clears.clone()))?;

        // Controller
        registry.register(Box::new(controller_requests.clone()))?;
        registry.register(Box::new(controller_request_duration.clone()))?;

        // State
        registry.register(Box::new(source_connected.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(closed_connections.clone()))?;
        registry.register(Box::new(upload_total.clone()))?;
        registry.register(Box::new(download_total.clone()))?;
        registry.register(Box::new(upload_rate.clone()))?;
        registry.register(Box::new(download_rate.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            snapshots_received,
            snapshots_coalesced,
            reconciliations,
            parse_errors,
            transport_errors,
            connect_attempts,
            history_clears,
            controller_requests,
            controller_request_duration,
            source_connected,
            state: StateGauges {
                active_connections,
                closed_connections,
                upload_total,
                download_total,
                upload_rate,
                download_rate,
            },
            reconcile_duration,
        })
    }

    /// Mirror a freshly published state into the state gauges.
    pub fn observe_state(&self, state: &ReconciledState) {
        self.state.observe(state);
    }

    /// Empty the closed history, counting the clear and refreshing the state gauges.
    pub fn clear_closed_history(&self, store: &StateStore) -> Arc<Versioned> {
        clear_closed_history(store, &self.history_clears, &self.state)
    }

    /// Starts the HTTP server serving /metrics, /healthz and the state endpoints.
    ///
    /// Returns the bound address.
    pub async fn start(
        &self,
        store: StateStore,
        controller: Arc<ControllerClient>,
    ) -> Result<SocketAddr> {
        if self.shutdown.lock().is_some() {
            bail!("health metrics server already running");
        }

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

        let app = router(Arc::new(AppState {
            registry: self.registry.clone(),
            history_clears: self.history_clears.clone(),
            gauges: self.state.clone(),
            store,
            controller,
        }));

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
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    history_clears: Counter,
    gauges: StateGauges,
    store: StateStore,
    controller: Arc<ControllerClient>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/connections", get(connections_handler))
        .route(
            "/connections/closed",
            axum::routing::delete(clear_closed_handler),
        )
        .route(
            "/connections/:id",
            axum::routing::delete(close_connection_handler),
        )
        .route("/status", get(status_handler))
        .with_state(state)
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
            tracing::error!(error = %e, "rendering metrics");
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

#[derive(Serialize)]
struct ConnectionsResponse {
    version: u64,
    status: ConnectionStatus,
    state: Arc<ReconciledState>,
}

/// GET /connections - Latest reconciled state.
async fn connections_handler(State(state): State<Arc<AppState>>) -> Json<ConnectionsResponse> {
    let current = state.store.current();
    Json(ConnectionsResponse {
        version: current.version,
        status: state.store.status(),
        state: Arc::clone(&current.state),
    })
}

#[derive(Serialize)]
struct ClearResponse {
    version: u64,
}

fn clear_closed_history(
    store: &StateStore,
    clears: &Counter,
    gauges: &StateGauges,
) -> Arc<Versioned> {
    let before = store.version();
    let after = store.clear_closed_history();
    if after.version != before {
        clears.inc();
        gauges.observe(&after.state);
        tracing::info!(version = after.version, "closed history cleared");
    }

    after
}

/// DELETE /connections/closed - Empty the closed history.
async fn clear_closed_handler(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let after = clear_closed_history(&state.store, &state.history_clears, &state.gauges);

    Json(ClearResponse {
        version: after.version,
    })
}

/// DELETE /connections/:id - Ask the core to close one connection.
///
/// The local table is not touched; the connection leaves it with the next
/// snapshot the core sends.
async fn close_connection_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.close_connection(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!(id, error = %e, "closing connection on core");
            (StatusCode::BAD_GATEWAY, format!("{e:#}")).into_response()
        }
    }
}

/// GET /status - Source connection status.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<ConnectionStatus> {
    Json(state.store.status())
}
