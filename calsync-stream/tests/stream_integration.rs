//! End-to-end tests for the push stream.
//!
//! These tests start a real service on a free port and connect raw
//! WebSocket sockets or full `SyncClient`s.

use calsync_stream::client::{ClientConfig, ConnectionState, ReconnectPolicy, SyncClient, SyncEvent};
use calsync_stream::protocol::{Frame, FrameEvent, UpdateKind};
use calsync_stream::pubsub::EventBus;
use calsync_stream::server::{ConnectionGate, ServerConfig, SyncService};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve `service` on a free port and return the stream URL.
async fn start(service: Arc<SyncService>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        service.serve(listener).await.unwrap();
    });
    format!("ws://127.0.0.1:{port}/stream")
}

async fn start_test_server(config: ServerConfig) -> (Arc<SyncService>, String) {
    let service = Arc::new(SyncService::new(config).unwrap());
    let url = start(service.clone()).await;
    (service, url)
}

async fn wait_for_listeners(service: &SyncService, n: usize) {
    for _ in 0..200 {
        if service.log().live().listener_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} listeners");
}

/// Next frame on a raw socket, skipping non-text messages.
async fn next_frame(ws: &mut Socket) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream still open")
            .expect("valid message");
        if let Message::Text(text) = msg {
            return Frame::decode(text.as_str()).unwrap();
        }
    }
}

fn event_channel(client: &SyncClient) -> mpsc::UnboundedReceiver<SyncEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .events()
        .subscribe(move |e: &SyncEvent, _: &EventBus<SyncEvent>| {
            let _ = tx.send(e.clone());
        });
    rx
}

async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("bus still open");
        if pred(&event) {
            return event;
        }
    }
}

fn applied_id(event: &SyncEvent) -> Option<u64> {
    match event {
        SyncEvent::Apply { id, .. } => Some(*id),
        _ => None,
    }
}

#[tokio::test]
async fn test_backlog_then_live() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;
    for n in 1..=3 {
        service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?since=1")).await.unwrap();
    assert_eq!(next_frame(&mut ws).await.id, 2);
    let third = next_frame(&mut ws).await;
    assert_eq!(third.id, 3);
    assert_eq!(third.event, FrameEvent::Create);
    assert_eq!(third.data, json!({"id": 3}));

    wait_for_listeners(&service, 1).await;
    service.log().append(UpdateKind::Delete, json!({"id": 1})).unwrap();
    let live = next_frame(&mut ws).await;
    assert_eq!((live.event, live.id), (FrameEvent::Delete, 4));

    let stats = service.stats().await;
    assert_eq!(stats.backlog_frames, 2);
    assert_eq!(stats.total_connections, 1);
}

#[tokio::test]
async fn test_missing_cursor_means_latest() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;
    service.log().append(UpdateKind::Create, json!({"id": 1})).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_listeners(&service, 1).await;
    service.log().append(UpdateKind::Update, json!({"id": 1})).unwrap();

    assert_eq!(next_frame(&mut ws).await.id, 2);
}

#[tokio::test]
async fn test_cursor_before_retention_serves_earliest_retained() {
    let config = ServerConfig {
        retention: Duration::from_millis(5),
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;
    for n in 1..=4 {
        service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    service.log().append(UpdateKind::Create, json!({"id": 5})).unwrap();
    service.prune_now().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?since=0")).await.unwrap();
    assert_eq!(next_frame(&mut ws).await.id, 5);
}

#[tokio::test]
async fn test_reconnect_directive_after_lifetime() {
    let config = ServerConfig {
        connection_lifetime: Duration::from_millis(200),
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;
    service.log().append(UpdateKind::Create, json!({"id": 1})).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?since=0")).await.unwrap();
    assert_eq!(next_frame(&mut ws).await.id, 1);

    let directive = next_frame(&mut ws).await;
    assert_eq!(directive.event, FrameEvent::Reconnect);
    assert_eq!(directive.id, 1);

    wait_for_listeners(&service, 0).await;
    assert_eq!(service.stats().await.reconnect_directives, 1);
}

#[tokio::test]
async fn test_heartbeats_reach_clients() {
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let beat = next_frame(&mut ws).await;
    assert_eq!(beat.event, FrameEvent::Heartbeat);
    assert!(beat.data.get("ts").is_some());
    assert!(service.stats().await.heartbeats >= 1);
}

#[tokio::test(flavor = "current_thread")]
async fn test_slow_consumer_is_dropped_without_blocking_appender() {
    let config = ServerConfig {
        listener_capacity: 4,
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;

    let (mut slow, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_listeners(&service, 1).await;

    // No await between appends, so the push loop cannot drain in between
    for n in 0..20 {
        service.log().append(UpdateKind::Update, json!({"n": n})).unwrap();
    }

    let notice = next_frame(&mut slow).await;
    assert_eq!(notice.event, FrameEvent::Timeout);
    assert_eq!(notice.id, 0);

    wait_for_listeners(&service, 0).await;
    let stats = service.stats().await;
    assert_eq!(stats.dropped_slow_consumers, 1);
    assert_eq!(service.log().live().stats().await.listeners_dropped, 1);
    assert_eq!(service.log().latest_id().unwrap(), 20);
}

struct DenyAll;

impl ConnectionGate for DenyAll {
    fn authorize(&self, _request: &Request) -> bool {
        false
    }
}

#[tokio::test]
async fn test_rejected_handshake_is_terminal_for_client() {
    let service = SyncService::new(ServerConfig::for_testing())
        .unwrap()
        .with_gate(Arc::new(DenyAll));
    let service = Arc::new(service);
    let url = start(service.clone()).await;

    let raw = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(raw.is_err());

    let client = SyncClient::new(ClientConfig::new(url));
    let mut events = event_channel(&client);
    client.start().unwrap();

    let failed = next_matching(&mut events, |e| matches!(e, SyncEvent::Failed { .. })).await;
    match failed {
        SyncEvent::Failed { reason } => assert!(reason.contains("401"), "{reason}"),
        _ => unreachable!(),
    }
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(client.attempts(), 0);
}

#[tokio::test]
async fn test_unknown_path_is_rejected() {
    let (_service, url) = start_test_server(ServerConfig::for_testing()).await;
    let other = url.replace("/stream", "/other");
    assert!(tokio_tungstenite::connect_async(other).await.is_err());
}

#[tokio::test]
async fn test_client_resumes_from_cursor() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;
    for n in 1..=3 {
        service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
    }

    let client = SyncClient::new(ClientConfig {
        resume_from: Some(1),
        ..ClientConfig::new(url)
    });
    let mut events = event_channel(&client);
    client.start().unwrap();

    assert_eq!(applied_id(&next_matching(&mut events, |e| applied_id(e).is_some()).await), Some(2));
    assert_eq!(applied_id(&next_matching(&mut events, |e| applied_id(e).is_some()).await), Some(3));

    wait_for_listeners(&service, 1).await;
    service.log().append(UpdateKind::UserCreated, json!({"user": "ana"})).unwrap();
    let roster = next_matching(&mut events, |e| matches!(e, SyncEvent::RefreshRoster { .. })).await;
    assert_eq!(roster, SyncEvent::RefreshRoster { id: 4, payload: json!({"user": "ana"}) });
    assert_eq!(client.cursor(), Some(4));

    client.stop().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_client_follows_reconnect_directive_without_backoff() {
    let config = ServerConfig {
        connection_lifetime: Duration::from_millis(150),
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;
    service.log().append(UpdateKind::Create, json!({"id": 1})).unwrap();

    let client = SyncClient::new(ClientConfig {
        resume_from: Some(0),
        policy: ReconnectPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        },
        ..ClientConfig::new(url)
    });
    let mut events = event_channel(&client);
    client.start().unwrap();

    assert_eq!(applied_id(&next_matching(&mut events, |e| applied_id(e).is_some()).await), Some(1));

    // Wait for the second connection
    let mut seen = Vec::new();
    loop {
        let event = next_matching(&mut events, |_| true).await;
        let done = event == SyncEvent::Status(ConnectionState::Connected);
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(!seen.contains(&SyncEvent::Status(ConnectionState::BackingOff)));
    assert_eq!(client.attempts(), 0);

    // The resumed connection replays nothing already consumed
    wait_for_listeners(&service, 1).await;
    service.log().append(UpdateKind::Update, json!({"id": 1, "v": 2})).unwrap();
    let next = next_matching(&mut events, |e| applied_id(e).is_some()).await;
    assert_eq!(applied_id(&next), Some(2));

    client.stop().await;
}

#[tokio::test]
async fn test_client_backs_off_when_server_stops() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;

    let client = SyncClient::new(ClientConfig {
        policy: ReconnectPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60),
            max_attempts: 10,
        },
        ..ClientConfig::new(url)
    });
    let mut events = event_channel(&client);
    client.start().unwrap();
    next_matching(&mut events, |e| *e == SyncEvent::Status(ConnectionState::Connected)).await;

    service.shutdown();
    next_matching(&mut events, |e| *e == SyncEvent::Status(ConnectionState::BackingOff)).await;
    assert_eq!(client.attempts(), 1);

    // Stopping cancels the pending one-minute backoff
    timeout(Duration::from_secs(2), client.stop()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_durable_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("calsync")),
        ..ServerConfig::for_testing()
    };

    {
        let service = SyncService::new(config.clone()).unwrap();
        for n in 1..=3 {
            service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
        }
    }

    let (service, url) = start_test_server(config).await;
    assert_eq!(service.log().latest_id().unwrap(), 3);
    assert_eq!(service.log().append(UpdateKind::Delete, json!({"id": 1})).unwrap(), 4);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?since=2")).await.unwrap();
    assert_eq!(next_frame(&mut ws).await.id, 3);
    let last = next_frame(&mut ws).await;
    assert_eq!((last.event, last.id), (FrameEvent::Delete, 4));
}

#[tokio::test]
async fn test_concurrent_appends_reach_every_listener_in_order() {
    let config = ServerConfig {
        listener_capacity: 1024,
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;

    let mut sockets = Vec::new();
    for _ in 0..3 {
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        sockets.push(ws);
    }
    wait_for_listeners(&service, 3).await;

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let log = service.log().clone();
            tokio::task::spawn_blocking(move || {
                for n in 0..25 {
                    log.append(UpdateKind::Update, json!({"p": p, "n": n})).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    for ws in &mut sockets {
        let mut ids = Vec::new();
        while ids.len() < 100 {
            ids.push(next_frame(ws).await.id);
        }
        assert_eq!(ids, (1..=100).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn test_stalled_reader_is_released() {
    let config = ServerConfig {
        listener_capacity: 256,
        send_timeout: Duration::from_millis(300),
        ..ServerConfig::for_testing()
    };
    let (service, url) = start_test_server(config).await;

    // Never polled: its socket buffers fill up and stay full
    let (_stalled, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut healthy, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_listeners(&service, 2).await;

    let reader = tokio::spawn(async move {
        let mut ids = Vec::new();
        while ids.len() < 80 {
            ids.push(next_frame(&mut healthy).await.id);
        }
        ids
    });

    // Far more than loopback socket buffers hold
    let blob = "x".repeat(256 * 1024);
    for n in 0..80 {
        service.log().append(UpdateKind::Update, json!({"n": n, "blob": blob})).unwrap();
    }

    assert_eq!(reader.await.unwrap(), (1..=80).collect::<Vec<u64>>());

    let mut released = false;
    for _ in 0..500 {
        if service.log().live().listener_count().await == 1
            && service.stats().await.active_connections == 1
        {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "stalled peer still holds its listener");

    assert_eq!(service.stats().await.dropped_slow_consumers, 1);
    assert_eq!(service.log().latest_id().unwrap(), 80);
}

#[tokio::test]
async fn test_cursor_ahead_of_log_is_reset_to_latest() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;
    for n in 1..=3 {
        service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
    }

    // Cursor saved against a log that has since been replaced
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?since=100")).await.unwrap();
    wait_for_listeners(&service, 1).await;
    service.log().append(UpdateKind::Update, json!({"id": 1})).unwrap();

    let first = next_frame(&mut ws).await;
    assert_eq!((first.event, first.id), (FrameEvent::Update, 4));
}

#[tokio::test]
async fn test_client_with_cursor_ahead_of_log_resumes() {
    let (service, url) = start_test_server(ServerConfig::for_testing()).await;
    for n in 1..=3 {
        service.log().append(UpdateKind::Create, json!({"id": n})).unwrap();
    }

    let client = SyncClient::new(ClientConfig {
        resume_from: Some(100),
        ..ClientConfig::new(url)
    });
    let mut events = event_channel(&client);
    client.start().unwrap();
    next_matching(&mut events, |e| *e == SyncEvent::Status(ConnectionState::Connected)).await;
    wait_for_listeners(&service, 1).await;

    service.log().append(UpdateKind::Update, json!({"id": 2})).unwrap();
    let jump = next_matching(&mut events, |e| matches!(e, SyncEvent::CursorJump { .. })).await;
    assert_eq!(jump, SyncEvent::CursorJump { expected: 101, received: 4 });
    assert_eq!(applied_id(&next_matching(&mut events, |e| applied_id(e).is_some()).await), Some(4));

    service.log().append(UpdateKind::Delete, json!({"id": 2})).unwrap();
    assert_eq!(applied_id(&next_matching(&mut events, |e| applied_id(e).is_some()).await), Some(5));
    assert_eq!(client.cursor(), Some(5));

    client.stop().await;
}

#[tokio::test]
async fn test_attempts_reset_after_successful_connect() {
    // Reserve a port, then leave it closed so the first connects are refused
    let port = {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        reserved.local_addr().unwrap().port()
    };
    let client = SyncClient::new(ClientConfig {
        policy: ReconnectPolicy {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(100),
            max_attempts: 50,
        },
        ..ClientConfig::new(format!("ws://127.0.0.1:{port}/stream"))
    });
    let mut events = event_channel(&client);
    client.start().unwrap();

    next_matching(&mut events, |e| *e == SyncEvent::Status(ConnectionState::BackingOff)).await;
    assert!(client.attempts() >= 1);

    let service = Arc::new(SyncService::new(ServerConfig::for_testing()).unwrap());
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let server = service.clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    next_matching(&mut events, |e| *e == SyncEvent::Status(ConnectionState::Connected)).await;
    assert_eq!(client.attempts(), 0);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.stop().await;
}
