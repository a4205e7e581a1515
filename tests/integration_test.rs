// tests/integration_test.rs
//! End-to-end tests against the synthetic AMI server.


use std::sync::Arc;
use std::time::Duration;

use ami_monitor::ami::{AmiClient, ConnectionState};
use ami_monitor::config::{AmiConfig, MonitorConfig, QueryStrategy, ReconnectConfig};
use ami_monitor::error::AmiError;
use ami_monitor::monitor::{
    ChangeSink, DeviceState, ExtensionSynchronizer, MemoryChangeSink, MemoryStatusStore,
    StaticProvider, StatusQuerier, StatusStore,
};

use ami_simulator::{AmiSimulator, ListShape, SimulatorOptions, SIM_CONTEXT, SIM_SECRET, SIM_USERNAME};

fn ami_config(host: &str, port: u16) -> AmiConfig {
    AmiConfig {
        host: host.to_string(),
        port,
        username: SIM_USERNAME.to_string(),
        secret: SIM_SECRET.to_string(),
        auth_timeout: Duration::from_secs(2),
        query_timeout: Duration::from_millis(500),
        grace_period: Duration::from_millis(100),
        keepalive_interval: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    }
}

fn monitor_config(extensions: &[&str], strategy: QueryStrategy) -> MonitorConfig {
    MonitorConfig {
        extensions: extensions.iter().map(|e| e.to_string()).collect(),
        context: SIM_CONTEXT.to_string(),
        poll_interval: Duration::from_secs(60),
        strategy,
    }
}

struct Harness {
    client: Arc<AmiClient>,
    synchronizer: ExtensionSynchronizer,
    store: Arc<MemoryStatusStore>,
    sink: Arc<MemoryChangeSink>,
}

async fn harness(sim: &AmiSimulator, extensions: &[&str], strategy: QueryStrategy) -> Harness {
    let client = AmiClient::new(ami_config(&sim.host(), sim.port()));
    client.start().await.expect("client should connect");

    let store = Arc::new(MemoryStatusStore::new());
    let sink = Arc::new(MemoryChangeSink::new());
    let synchronizer = ExtensionSynchronizer::new(
        Arc::clone(&client) as Arc<dyn StatusQuerier>,
        Arc::new(StaticProvider::new(
            extensions.iter().map(|e| e.to_string()).collect(),
        )),
        Arc::clone(&store) as Arc<dyn StatusStore>,
        Arc::clone(&sink) as Arc<dyn ChangeSink>,
        monitor_config(extensions, strategy),
    );
    Harness {
        client,
        synchronizer,
        store,
        sink,
    }
}

#[tokio::test]
async fn test_end_to_end_status_cycle() {
    let sim = AmiSimulator::start(
        SimulatorOptions::default(),
        &[("100", "0"), ("200", "0"), ("300", "0")],
    )
    .await;
    let h = harness(&sim, &["100", "200", "300"], QueryStrategy::Individual).await;
    assert_eq!(h.client.state(), ConnectionState::Ready);

    // First cycle seeds the store: three new records, three notifications.
    let report = h.synchronizer.sync_now().await.unwrap();
    assert_eq!(report.changed, 3);
    h.sink.drain().await;

    // 100 unchanged, 200 goes unavailable, 300 vanishes from the switch.
    sim.set_code("200", "4");
    sim.remove_extension("300");

    let report = h.synchronizer.sync_now().await.unwrap();
    assert_eq!(report.changed, 2);

    let changes = h.sink.drain().await;
    assert_eq!(changes.len(), 2, "exactly two notifications expected");

    let s100 = h.store.load("100").await.unwrap().unwrap();
    assert_eq!(s100.state, DeviceState::Online);
    let s200 = h.store.load("200").await.unwrap().unwrap();
    assert_eq!((s200.state, s200.raw_code.as_str()), (DeviceState::Offline, "4"));
    let s300 = h.store.load("300").await.unwrap().unwrap();
    assert_eq!(s300.state, DeviceState::Offline);

    h.client.stop().await;
}

#[tokio::test]
async fn test_bulk_list_events_shape() {
    let sim = AmiSimulator::start(
        SimulatorOptions {
            list_shape: ListShape::Events,
            ..SimulatorOptions::default()
        },
        &[("100", "0"), ("200", "8")],
    )
    .await;
    let h = harness(&sim, &["100", "200"], QueryStrategy::Bulk).await;

    let report = h.synchronizer.sync_now().await.unwrap();
    assert_eq!(report.present, 2);
    assert_eq!(report.changed, 2);
    assert_eq!(
        h.store.load("200").await.unwrap().unwrap().state,
        DeviceState::Online
    );

    h.client.stop().await;
}

#[tokio::test]
async fn test_aggregated_list_shape_resolves_without_offlining() {
    let sim = AmiSimulator::start(
        SimulatorOptions {
            list_shape: ListShape::Aggregated,
            ..SimulatorOptions::default()
        },
        &[("100", "0")],
    )
    .await;
    let h = harness(&sim, &["100"], QueryStrategy::Bulk).await;

    // The aggregated response carries no per-extension data: the grace
    // window must still resolve the action, and the cycle must not assume
    // anyone went offline.
    let report = h.synchronizer.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.changed, 0);
    assert!(h.store.load("100").await.unwrap().is_none());

    h.client.stop().await;
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let sim = AmiSimulator::start(SimulatorOptions::default(), &[]).await;
    let mut config = ami_config(&sim.host(), sim.port());
    config.secret = "wrong".to_string();

    let client = AmiClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, AmiError::Authentication(_)), "got {:?}", err);

    let health = client.health();
    assert!(health.permanently_failed);
    assert_eq!(health.state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_gives_up_after_bound() {
    // Grab a free port, then close the listener so every dial is refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = AmiClient::new(ami_config("127.0.0.1", port));
    let err = client.start().await.unwrap_err();
    assert!(
        matches!(err, AmiError::ReconnectExhausted { attempts: 3 }),
        "got {:?}",
        err
    );

    let health = client.health();
    assert!(health.permanently_failed);
    assert_eq!(health.consecutive_failures, 3);
    assert!(health.last_error.is_some());
}

#[tokio::test]
async fn test_reestablishes_after_connection_drop() {
    let sim = AmiSimulator::start(
        SimulatorOptions {
            drop_sessions_after_login: 1,
            ..SimulatorOptions::default()
        },
        &[("100", "0")],
    )
    .await;
    let client = AmiClient::new(ami_config(&sim.host(), sim.port()));
    client.start().await.unwrap();

    // The switch drops the first session right after answering Login. Even
    // when the loss lands before the supervisor subscribes, it must still
    // be observed and a second session brought up.
    let mut state = client.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.state() == ConnectionState::Ready && sim.sessions() >= 2 {
                return;
            }
            let _ = state.changed().await;
        }
    })
    .await
    .expect("client should reconnect after losing the session");

    let result = client.extension_state("100", SIM_CONTEXT).await.unwrap();
    assert!(result.response.unwrap().is_success());
    assert!(!client.health().permanently_failed);

    client.stop().await;
}

#[tokio::test]
async fn test_query_timeout_on_silent_extension() {
    let sim = AmiSimulator::start(
        SimulatorOptions {
            silent_extensions: vec!["999".to_string()],
            ..SimulatorOptions::default()
        },
        &[("999", "0")],
    )
    .await;
    let client = AmiClient::new(ami_config(&sim.host(), sim.port()));
    client.start().await.unwrap();

    let err = client.extension_state("999", SIM_CONTEXT).await.unwrap_err();
    assert!(matches!(err, AmiError::QueryTimeout { .. }), "got {:?}", err);

    // The connection survives one timed-out query, and the expired action
    // no longer counts as pending.
    let ok = client.extension_state("999", SIM_CONTEXT).await;
    assert!(matches!(ok, Err(AmiError::QueryTimeout { .. })));
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.health().pending_actions, 0);

    client.stop().await;
}

#[tokio::test]
async fn test_unsolicited_events_reach_subscribers() {
    let sim = AmiSimulator::start(
        SimulatorOptions {
            unsolicited_after_login: Some(
                "Event: PeerStatus\r\nPeer: SIP/100\r\nPeerStatus: Registered\r\n\r\n".to_string(),
            ),
            ..SimulatorOptions::default()
        },
        &[],
    )
    .await;

    let client = AmiClient::new(ami_config(&sim.host(), sim.port()));
    let mut events = client.subscribe("PeerStatus");
    client.start().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event should arrive")
        .unwrap();
    assert_eq!(event.get("Peer"), Some("SIP/100"));
    assert_eq!(event.get("PeerStatus"), Some("Registered"));

    client.stop().await;
}

#[tokio::test]
async fn test_stop_is_terminal() {
    let sim = AmiSimulator::start(SimulatorOptions::default(), &[("100", "0")]).await;
    let client = AmiClient::new(ami_config(&sim.host(), sim.port()));
    client.start().await.unwrap();

    client.stop().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.extension_state("100", SIM_CONTEXT).await.unwrap_err();
    assert!(matches!(err, AmiError::Stopped));
}
