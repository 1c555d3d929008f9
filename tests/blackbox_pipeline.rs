use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use connscope::config::Config;
use connscope::monitor::Monitor;
use connscope::source::{SnapshotSource, SnapshotStream, SourceMessage};
use connscope::store::{ConnectionStatus, StreamError};
use tokio::time::Instant;

/// One scripted connection: frames with their delay after the previous frame.
/// The connection stays open once the script is exhausted.
struct Session {
    frames: VecDeque<(Duration, SourceMessage)>,
}

impl Session {
    fn new(frames: Vec<(u64, SourceMessage)>) -> Self {
        Self {
            frames: frames
                .into_iter()
                .map(|(ms, msg)| (Duration::from_millis(ms), msg))
                .collect(),
        }
    }
}

struct ScriptedSource {
    sessions: parking_lot::Mutex<VecDeque<Session>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn new(sessions: Vec<Session>) -> (Self, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let source = Self {
            sessions: parking_lot::Mutex::new(sessions.into()),
            connects: Arc::clone(&connects),
        };
        (source, connects)
    }
}

struct ScriptedStream {
    session: Session,
    due: Option<Instant>,
}

impl SnapshotStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<SourceMessage> {
        let Some((delay, _)) = self.session.frames.front() else {
            return std::future::pending().await;
        };

        let due = *self.due.get_or_insert(Instant::now() + *delay);
        tokio::time::sleep_until(due).await;
        self.due = None;
        self.session.frames.pop_front().map(|(_, msg)| msg)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SnapshotSource for ScriptedSource {
    type Stream = ScriptedStream;

    fn endpoint(&self) -> &str {
        "scripted://connections"
    }

    async fn connect(&self) -> Result<ScriptedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().pop_front();
        next.map(|session| ScriptedStream { session, due: None })
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg.monitor.closed_capacity = 3;
    cfg.monitor.throttle_interval = Duration::from_millis(200);
    cfg.reconnect.initial_delay = Duration::from_millis(500);
    cfg.reconnect.max_delay = Duration::from_secs(4);
    cfg
}

fn snapshot(upload_total: u64, conns: &[(&str, u64, u64)]) -> SourceMessage {
    let conns: Vec<serde_json::Value> = conns
        .iter()
        .map(|(id, up, down)| {
            serde_json::json!({
                "id": id,
                "metadata": {
                    "network": "tcp",
                    "type": "HTTPS",
                    "host": format!("{id}.example.com"),
                    "destinationIP": "203.0.113.7",
                    "destinationPort": "443",
                    "sniffHost": "",
                },
                "upload": up,
                "download": down,
                "start": "2024-05-01T10:00:00Z",
                "chains": ["HK-01", "Proxy"],
                "rule": "Match",
                "rulePayload": "",
            })
        })
        .collect();

    SourceMessage::Text(
        serde_json::json!({
            "uploadTotal": upload_total,
            "downloadTotal": upload_total * 2,
            "connections": conns,
        })
        .to_string(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_coalesced_into_single_update() {
    let frames = (1..=10u64)
        .map(|i| (10, snapshot(i, &[("a", i * 100, i * 10)])))
        .collect();
    let (source, _) = ScriptedSource::new(vec![Session::new(frames)]);

    let monitor = Monitor::with_source(test_config(), source).expect("monitor");
    let mut updates = monitor.subscribe();
    monitor.start().await.expect("start");

    let update = updates.next().await.expect("update");
    assert_eq!(update.version, 1);

    // Frames keep arriving until 100ms; the update fires at 210ms with the newest.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let current = monitor.current();
    assert_eq!(current.version, 1);
    assert_eq!(current.state.upload_total, 10);
    assert_eq!(current.state.download_total, 20);

    let a = current.state.active_by_id("a").expect("a active");
    assert_eq!(a.upload, 1000);
    assert_eq!(a.upload_rate, 0);
    assert_eq!(a.display_host(), "a.example.com");
    assert_eq!(a.chain_label(), "Proxy / HK-01");
    assert_eq!(
        a.metadata.extra.get("sniffHost"),
        Some(&serde_json::json!(""))
    );

    monitor.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_rates_closures_and_history_clear() {
    let frames = vec![
        (0, snapshot(1, &[("a", 100, 1000), ("b", 10, 10)])),
        (300, snapshot(2, &[("a", 250, 1400), ("c", 5, 5)])),
        (300, snapshot(3, &[("a", 200, 1500)])),
    ];
    let (source, _) = ScriptedSource::new(vec![Session::new(frames)]);

    let monitor = Monitor::with_source(test_config(), source).expect("monitor");
    monitor.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(550)).await;
    let state = monitor.current().state.clone();
    let a = state.active_by_id("a").expect("a active");
    assert_eq!((a.upload_rate, a.download_rate), (150, 400));
    assert!(a.has_visible_traffic());
    assert_eq!(state.active_by_id("c").map(|c| c.upload_rate), Some(0));
    let closed: Vec<&str> = state.closed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(closed, vec!["b"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = monitor.current().state.clone();
    let a = state.active_by_id("a").expect("a active");
    // Counter went backwards: clamped.
    assert_eq!(a.upload_rate, 0);
    assert_eq!(a.download_rate, 100);
    let closed: Vec<&str> = state.closed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(closed, vec!["b", "c"]);

    let cleared = monitor.clear_closed_history();
    assert!(cleared.state.closed.is_empty());
    assert_eq!(cleared.state.active.len(), 1);
    assert_eq!(cleared.state.upload_total, 3);

    let again = monitor.clear_closed_history();
    assert_eq!(again.version, cleared.version);
    assert_eq!(monitor.health().history_clears.get() as u64, 1);

    monitor.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_is_reported_and_state_kept() {
    let frames = vec![
        (0, snapshot(5, &[("a", 1, 1)])),
        (300, SourceMessage::Text("{\"uploadTotal\": ".to_string())),
        (300, snapshot(6, &[("a", 2, 2)])),
    ];
    let (source, connects) = ScriptedSource::new(vec![Session::new(frames)]);

    let monitor = Monitor::with_source(test_config(), source).expect("monitor");
    let mut errors = monitor.store().errors();
    monitor.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(450)).await;
    let err = errors.recv().await.expect("error reported");
    assert!(matches!(err, StreamError::Malformed(_)));
    assert_eq!(monitor.current().state.upload_total, 5);
    assert_eq!(monitor.store().status(), ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(monitor.current().state.upload_total, 6);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.health().parse_errors.get() as u64, 1);

    monitor.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_reconnects_with_new_session() {
    // First session fails 300ms in, after its snapshot was published.
    let first = Session::new(vec![
        (0, snapshot(10, &[("a", 1, 1), ("b", 1, 1)])),
        (
            300,
            SourceMessage::Error("Websocket error: connection reset".to_string()),
        ),
    ]);
    let second = Session::new(vec![(100, snapshot(12, &[("a", 5, 5)]))]);
    let (source, connects) = ScriptedSource::new(vec![first, second]);

    let monitor = Monitor::with_source(test_config(), source).expect("monitor");
    let status = monitor.store().watch_status();
    monitor.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(monitor.current().state.active.len(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    match status.borrow().clone() {
        ConnectionStatus::Disconnected { reason, retry_in } => {
            assert!(reason.contains("connection reset"));
            assert_eq!(retry_in, Duration::from_millis(500));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(monitor.health().transport_errors.get() as u64, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    // Reconnected: the previous session's connections are forgotten, not closed.
    let state = monitor.current().state.clone();
    assert!(state.active.is_empty());
    assert!(state.closed.is_empty());
    assert_eq!(state.upload_total, 10);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let state = monitor.current().state.clone();
    assert_eq!(state.upload_total, 12);
    assert_eq!(state.active_by_id("a").map(|c| c.upload_rate), Some(0));

    monitor.stop().await.expect("stop");
    assert_eq!(monitor.store().status(), ConnectionStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_reconnects_immediately() {
    let (source, connects) = ScriptedSource::new(vec![
        Session::new(vec![(0, snapshot(1, &[("a", 1, 1)]))]),
        Session::new(vec![]),
    ]);

    let monitor = Monitor::with_source(test_config(), source).expect("monitor");
    monitor.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    monitor.refresh();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(monitor.store().status(), ConnectionStatus::Connected);
    assert!(monitor.current().state.active.is_empty());

    monitor.stop().await.expect("stop");
    monitor.stop().await.expect("second stop");
}
