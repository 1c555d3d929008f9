//! Reconnection supervisor.
//!
//! Owns the snapshot stream for the lifetime of the monitor. A single task
//! connects, pumps frames into the [`Pipeline`], fires the throttle deadline
//! and reconnects with exponential backoff when the session ends. Frame
//! delivery and timer firing never run concurrently.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MonitorConfig, ReconnectConfig};
use crate::export::health::HealthMetrics;
use crate::pipeline::Pipeline;
use crate::source::{SnapshotSource, SnapshotStream, SourceMessage};
use crate::store::{ConnectionStatus, StateStore};

use self::backoff::Backoff;

/// Upper bound on a graceful stream close; a peer that stopped reading can stall it.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Refresh,
    Failed(String),
}

/// Keeps a snapshot source connected and feeds it into the state store.
pub struct Supervisor<S: SnapshotSource> {
    source: Arc<S>,
    store: StateStore,
    monitor: MonitorConfig,
    reconnect: ReconnectConfig,
    health: Option<Arc<HealthMetrics>>,
    refresh: Arc<Notify>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: SnapshotSource> Supervisor<S> {
    pub fn new(
        source: S,
        store: StateStore,
        monitor: &MonitorConfig,
        reconnect: &ReconnectConfig,
    ) -> Self {
        Self {
            source: Arc::new(source),
            store,
            monitor: monitor.clone(),
            reconnect: reconnect.clone(),
            health: None,
            refresh: Arc::new(Notify::new()),
            cancel: parking_lot::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Attach health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Spawn the supervision task. It runs until `cancel` fires or [`stop`](Self::stop).
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancel.lock().is_some() {
            bail!("supervisor already started");
        }

        *self.cancel.lock() = Some(cancel.clone());

        let run = Run {
            source: Arc::clone(&self.source),
            store: self.store.clone(),
            pipeline: Pipeline::new(&self.monitor, self.store.clone(), self.health.clone()),
            backoff: Backoff::new(&self.reconnect),
            health: self.health.clone(),
            refresh: Arc::clone(&self.refresh),
            cancel,
        };
        *task = Some(tokio::spawn(run.run()));

        Ok(())
    }

    /// Drop the current connection and reconnect immediately.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Cancel the task and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor task failed");
            }
        }
    }
}

/// State owned by the supervision task.
struct Run<S: SnapshotSource> {
    source: Arc<S>,
    store: StateStore,
    pipeline: Pipeline,
    backoff: Backoff,
    health: Option<Arc<HealthMetrics>>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
}

impl<S: SnapshotSource> Run<S> {
    async fn run(mut self) {
        let endpoint = self.source.endpoint().to_string();
        let mut sessions: u64 = 0;

        loop {
            self.store.set_status(ConnectionStatus::Connecting);
            debug!(endpoint = %endpoint, attempt = self.backoff.attempt(), "connecting to snapshot source");

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.source.connect() => res,
            };

            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    self.record_connect("error");
                    let reason = format!("{e:#}");
                    warn!(endpoint = %endpoint, error = %reason, "snapshot source connect failed");
                    if !self.wait_retry(reason).await {
                        break;
                    }
                    continue;
                }
            };

            self.record_connect("ok");
            self.backoff.reset();
            if sessions > 0 {
                let v = self.store.begin_session();
                debug!(version = v.version, "new session, active set cleared");
            }
            sessions += 1;

            self.store.set_status(ConnectionStatus::Connected);
            self.set_connected(true);
            info!(endpoint = %endpoint, session = sessions, "snapshot source connected");

            let end = self.session(&mut stream).await;

            self.pipeline.reset();
            self.set_connected(false);
            match tokio::time::timeout(CLOSE_TIMEOUT, stream.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "closing snapshot stream"),
                Err(_) => warn!(
                    endpoint = %endpoint,
                    timeout = ?CLOSE_TIMEOUT,
                    "snapshot stream close timed out, dropping it",
                ),
            }

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Refresh => {
                    info!(endpoint = %endpoint, "refresh requested, reconnecting");
                    self.backoff.reset();
                }
                SessionEnd::Failed(reason) => {
                    if let Some(h) = &self.health {
                        h.transport_errors.inc();
                    }
                    warn!(endpoint = %endpoint, reason = %reason, "snapshot source session ended");
                    if !self.wait_retry(reason).await {
                        break;
                    }
                }
            }
        }

        self.pipeline.shutdown();
        self.set_connected(false);
        self.store.set_status(ConnectionStatus::Stopped);
        info!(endpoint = %endpoint, "supervisor stopped");
    }

    /// Pump one connected stream until it fails, a refresh arrives or we are cancelled.
    async fn session(&mut self, stream: &mut S::Stream) -> SessionEnd {
        loop {
            let deadline = self.pipeline.deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = self.refresh.notified() => return SessionEnd::Refresh,
                _ = sleep_until(deadline) => {
                    self.pipeline.flush(Instant::now());
                }
                msg = stream.next_message() => match msg {
                    Some(SourceMessage::Text(text)) => {
                        // Malformed frames are reported by the pipeline.
                        let _ = self.pipeline.deliver(&text, Instant::now());
                    }
                    Some(SourceMessage::Error(reason)) => return SessionEnd::Failed(reason),
                    None => return SessionEnd::Failed("stream closed by remote".to_string()),
                },
            }
        }
    }

    /// Sleep one backoff delay. Returns false if cancelled.
    async fn wait_retry(&mut self, reason: String) -> bool {
        let delay = self.backoff.next_delay();
        self.store.set_status(ConnectionStatus::Disconnected {
            reason,
            retry_in: delay,
        });
        debug!(delay = ?delay, attempt = self.backoff.attempt(), "waiting before reconnect");

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
            _ = self.refresh.notified() => {
                self.backoff.reset();
                true
            }
        }
    }

    fn record_connect(&self, result: &str) {
        if let Some(h) = &self.health {
            h.connect_attempts.with_label_values(&[result]).inc();
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Some(h) = &self.health {
            h.source_connected.set(if connected { 1.0 } else { 0.0 });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::sync::mpsc;

    use super::*;
    use crate::reconcile::ReconciledState;

    type Script = Result<mpsc::UnboundedReceiver<SourceMessage>, String>;

    struct FakeSource {
        sessions: parking_lot::Mutex<VecDeque<Script>>,
        connects: Arc<AtomicUsize>,
        stall_close: bool,
    }

    struct FakeStream {
        rx: mpsc::UnboundedReceiver<SourceMessage>,
        stall_close: bool,
    }

    impl SnapshotStream for FakeStream {
        async fn next_message(&mut self) -> Option<SourceMessage> {
            self.rx.recv().await
        }

        async fn close(&mut self) -> Result<()> {
            if self.stall_close {
                // Peer stopped reading; the close frame never flushes.
                std::future::pending::<()>().await;
            }
            self.rx.close();
            Ok(())
        }
    }

    impl SnapshotSource for FakeSource {
        type Stream = FakeStream;

        fn endpoint(&self) -> &str {
            "fake://connections"
        }

        async fn connect(&self) -> Result<FakeStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.sessions.lock().pop_front();
            match next {
                Some(Ok(rx)) => Ok(FakeStream {
                    rx,
                    stall_close: self.stall_close,
                }),
                Some(Err(reason)) => Err(anyhow!(reason)),
                None => Err(anyhow!("connection refused")),
            }
        }
    }

    struct Harness {
        supervisor: Supervisor<FakeSource>,
        connects: Arc<AtomicUsize>,
    }

    fn harness(sessions: Vec<Script>) -> Harness {
        harness_with(sessions, false)
    }

    fn harness_with(sessions: Vec<Script>, stall_close: bool) -> Harness {
        let connects = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            sessions: parking_lot::Mutex::new(sessions.into()),
            connects: Arc::clone(&connects),
            stall_close,
        };
        let monitor = MonitorConfig {
            closed_capacity: 10,
            throttle_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        };
        let store = StateStore::new(ReconciledState::empty(monitor.closed_capacity));
        Harness {
            supervisor: Supervisor::new(source, store, &monitor, &reconnect),
            connects,
        }
    }

    fn session() -> (mpsc::UnboundedSender<SourceMessage>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Ok(rx))
    }

    fn frame(total: u64, conns: &[(&str, u64)]) -> SourceMessage {
        let conns: Vec<serde_json::Value> = conns
            .iter()
            .map(|(id, up)| serde_json::json!({ "id": id, "upload": up, "download": 0 }))
            .collect();
        SourceMessage::Text(
            serde_json::json!({ "uploadTotal": total, "downloadTotal": 0, "connections": conns })
                .to_string(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_throttled_and_published() {
        let (tx, script) = session();
        let h = harness(vec![script]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        assert_eq!(store.status(), ConnectionStatus::Connected);

        for i in 1..=3u64 {
            tx.send(frame(i, &[("a", i * 100)])).expect("send");
        }
        settle().await;
        assert_eq!(store.version(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let cur = store.current();
        assert_eq!(cur.version, 1);
        assert_eq!(cur.state.upload_total, 3);

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_backs_off_then_connects() {
        let (_tx, script) = session();
        let h = harness(vec![Err("connection refused".to_string()), script]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        match store.status() {
            ConnectionStatus::Disconnected { reason, retry_in } => {
                assert!(reason.contains("connection refused"));
                assert_eq!(retry_in, Duration::from_secs(1));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.status(), ConnectionStatus::Connected);
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_signal_ends_session_and_reconnect_starts_new_one() {
        let (tx1, s1) = session();
        let (tx2, s2) = session();
        let h = harness(vec![s1, s2]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        tx1.send(frame(10, &[("a", 5), ("b", 5)])).expect("send");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.current().state.active.len(), 2);

        // A pending snapshot at disconnect is discarded.
        tx1.send(frame(11, &[("a", 6)])).expect("send");
        tx1.send(SourceMessage::Error("Websocket error: reset".to_string()))
            .expect("send");
        settle().await;

        match store.status() {
            ConnectionStatus::Disconnected { reason, .. } => {
                assert!(reason.starts_with("Websocket error"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(store.current().state.upload_total, 10);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.status(), ConnectionStatus::Connected);

        // New session: active set cleared, totals and history kept.
        let cur = store.current();
        assert!(cur.state.active.is_empty());
        assert_eq!(cur.state.upload_total, 10);

        tx2.send(frame(20, &[("a", 50)])).expect("send");
        tokio::time::sleep(Duration::from_millis(250)).await;
        let a_rate = store
            .current()
            .state
            .active_by_id("a")
            .map(|c| c.upload_rate);
        assert_eq!(a_rate, Some(0));

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_backs_off() {
        let (tx, s1) = session();
        let (_tx2, s2) = session();
        let h = harness(vec![s1, s2]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        drop(tx);
        settle().await;

        assert!(matches!(
            store.status(),
            ConnectionStatus::Disconnected { .. }
        ));
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert_eq!(store.status(), ConnectionStatus::Connected);

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_reconnects_without_delay() {
        let (_tx1, s1) = session();
        let (_tx2, s2) = session();
        let h = harness(vec![s1, s2]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);

        h.supervisor.refresh();
        settle().await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert_eq!(store.status(), ConnectionStatus::Connected);

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_discards_pending() {
        let (tx, script) = session();
        let h = harness(vec![script]);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        tx.send(frame(1, &[("a", 1)])).expect("send");
        settle().await;

        h.supervisor.stop().await;
        h.supervisor.stop().await;

        assert_eq!(store.status(), ConnectionStatus::Stopped);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_completes_when_close_stalls() {
        let (_tx, script) = session();
        let h = harness_with(vec![script], true);
        let store = h.supervisor.store().clone();
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        settle().await;
        assert_eq!(store.status(), ConnectionStatus::Connected);

        let started = Instant::now();
        tokio::time::timeout(CLOSE_TIMEOUT * 2, h.supervisor.stop())
            .await
            .expect("stop returns despite stalled close");

        assert!(started.elapsed() >= CLOSE_TIMEOUT);
        assert_eq!(store.status(), ConnectionStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_task() {
        let h = harness(vec![]);
        let store = h.supervisor.store().clone();
        let parent = CancellationToken::new();
        h.supervisor
            .start(parent.child_token())
            .await
            .expect("starts");

        settle().await;
        assert!(matches!(
            store.status(),
            ConnectionStatus::Disconnected { .. }
        ));

        parent.cancel();
        settle().await;
        assert_eq!(store.status(), ConnectionStatus::Stopped);

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_tx, script) = session();
        let h = harness(vec![script]);
        h.supervisor
            .start(CancellationToken::new())
            .await
            .expect("starts");

        let err = h
            .supervisor
            .start(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already started"));

        h.supervisor.stop().await;
    }
}
