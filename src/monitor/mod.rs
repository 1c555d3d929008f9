use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::ControllerClient;
use crate::export::health::HealthMetrics;
use crate::reconcile::ReconciledState;
use crate::snapshot::ConnectionRecord;
use crate::source::ws::WsSource;
use crate::source::SnapshotSource;
use crate::store::{StateStore, Subscription, Versioned};
use crate::supervisor::Supervisor;

/// How many connections the debug stats report lists.
const TOP_CONNECTIONS: usize = 5;

/// Monitor wires the snapshot source, supervisor, state store and HTTP surface together.
pub struct Monitor<S: SnapshotSource = WsSource> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: StateStore,
    supervisor: Supervisor<S>,
    controller: Arc<ControllerClient>,
    cancel: CancellationToken,
}

impl Monitor<WsSource> {
    /// Creates a monitor reading from the configured WebSocket endpoint.
    pub fn new(cfg: Config) -> Result<Self> {
        let source = WsSource::new(&cfg.source);
        Self::with_source(cfg, source)
    }
}

impl<S: SnapshotSource> Monitor<S> {
    /// Creates a monitor reading from `source`, initializing health metrics.
    pub fn with_source(cfg: Config, source: S) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let store = StateStore::new(ReconciledState::empty(cfg.monitor.closed_capacity));
        let supervisor = Supervisor::new(source, store.clone(), &cfg.monitor, &cfg.reconnect)
            .with_health(Arc::clone(&health));
        let controller = Arc::new(create_controller(&cfg, &health)?);

        Ok(Self {
            cfg,
            health,
            store,
            supervisor,
            controller,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the HTTP surface, the supervisor and the stats reporter.
    pub async fn start(&self) -> Result<()> {
        self.health
            .start(self.store.clone(), Arc::clone(&self.controller))
            .await
            .context("starting health metrics server")?;

        if let Err(e) = self.supervisor.start(self.cancel.child_token()).await {
            if let Err(stop_err) = self.health.stop().await {
                warn!(error = %stop_err, "stopping health metrics server after failed start");
            }
            return Err(e.context("starting supervisor"));
        }

        self.spawn_stats_reporter();

        info!(
            url = %self.cfg.source.url,
            throttle_interval = ?self.cfg.monitor.throttle_interval,
            closed_capacity = self.cfg.monitor.closed_capacity,
            "monitor started",
        );

        Ok(())
    }

    /// Stop all components. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.supervisor.stop().await;
        self.health.stop().await?;

        Ok(())
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Latest reconciled state.
    pub fn current(&self) -> Arc<Versioned> {
        self.store.current()
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    /// Reconnect to the source immediately.
    pub fn refresh(&self) {
        self.supervisor.refresh();
    }

    /// Empty the closed history, keeping active connections.
    pub fn clear_closed_history(&self) -> Arc<Versioned> {
        self.health.clear_closed_history(&self.store)
    }

    /// Ask the core to terminate a connection. It leaves the active table
    /// with the next snapshot.
    pub async fn close_connection(&self, id: &str) -> Result<()> {
        self.controller
            .close_connection(id)
            .await
            .with_context(|| format!("closing connection {id}"))
    }

    /// Spawn background connection stats reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let store = self.store.clone();
        let interval = self.cfg.monitor.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => report_stats(&store.current(), interval),
                }
            }
        });
    }
}

/// Create a controller client with metrics callback.
fn create_controller(cfg: &Config, health: &Arc<HealthMetrics>) -> Result<ControllerClient> {
    let client = ControllerClient::new(&cfg.source).context("creating controller client")?;

    let health = Arc::clone(health);
    Ok(client.with_metrics(Box::new(move |operation, status, duration| {
        health
            .controller_requests
            .with_label_values(&[operation, status])
            .inc();
        health
            .controller_request_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    })))
}

fn report_stats(current: &Versioned, interval: Duration) {
    let state = &current.state;

    info!(
        version = current.version,
        active = state.active.len(),
        closed = state.closed.len(),
        upload_total = state.upload_total,
        download_total = state.download_total,
        upload_rate = state.upload_rate(),
        download_rate = state.download_rate(),
        interval = ?interval,
        "connection stats",
    );

    for conn in busiest(state, TOP_CONNECTIONS) {
        debug!(
            host = conn.display_host(),
            chain = %conn.chain_label(),
            upload_rate = conn.upload_rate,
            download_rate = conn.download_rate,
            "  busiest",
        );
    }
}

/// Active connections with visible traffic, highest combined rate first.
fn busiest(state: &ReconciledState, limit: usize) -> Vec<&ConnectionRecord> {
    let mut conns: Vec<_> = state
        .active
        .iter()
        .map(Arc::as_ref)
        .filter(|c| c.has_visible_traffic())
        .collect();
    conns.sort_by_key(|c| std::cmp::Reverse(c.upload_rate.saturating_add(c.download_rate)));
    conns.truncate(limit);
    conns
}
