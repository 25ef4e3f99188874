use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use relink::{
    transport::{memory, Connector, Link},
    ConnectError, Connection, ConnectionState, DisconnectReason, ErrorEvent, Event, EventKind,
    Frame, HeartbeatConfig, ReconnectPolicy, SendError, TransportError,
};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn attempts(conn: &Connection) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(vec![]));
    let log = seen.clone();
    conn.on(EventKind::Reconnecting, move |event| {
        if let Event::Reconnecting { attempt, .. } = event {
            log.lock().unwrap().push(*attempt);
        }
    });
    seen
}

/// Transport whose writes never complete and which never receives
#[derive(Debug)]
struct StuckConnector;

#[async_trait::async_trait]
impl Connector for StuckConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let sink = futures_util::sink::unfold((), |(), _frame: Frame| async {
            std::future::pending::<()>().await;
            Ok::<_, TransportError>(())
        });
        Ok(Link::new(sink, futures_util::stream::pending()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_keeps_connection() {
    let conn = Connection::builder(StuckConnector).build().unwrap();
    conn.connect().await.unwrap();

    assert!(matches!(
        conn.send_timeout("x", secs(1)).await,
        Err(SendError::Timeout { timeout }) if timeout == secs(1)
    ));
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_pending_sends_fail_when_closing() {
    let conn = Connection::builder(StuckConnector).build().unwrap();
    conn.connect().await.unwrap();

    // first one is taken by the writer, second one waits in the queue
    let writing = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send_timeout("a", secs(60)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send_timeout("b", secs(60)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    conn.disconnect().await;

    assert!(matches!(writing.await.unwrap(), Err(SendError::Closing)));
    assert!(matches!(queued.await.unwrap(), Err(SendError::Closing)));
    assert_eq!(
        conn.state(),
        ConnectionState::Disconnected(DisconnectReason::UserInitiated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reconnect_delay() {
    let (connector, mut listener) = memory::pair();
    let conn = Connection::builder(connector)
        .reconnect(ReconnectPolicy::fixed(secs(10)))
        .build()
        .unwrap();
    let mut state = conn.watch_state();

    conn.connect().await.unwrap();
    let mut peer = listener.accept().await.unwrap();
    peer.close();

    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt: 0 }))
        .await
        .unwrap();

    conn.disconnect().await;
    assert_eq!(
        conn.state(),
        ConnectionState::Disconnected(DisconnectReason::UserInitiated)
    );

    tokio::time::sleep(secs(30)).await;
    assert_eq!(listener.connect_count(), 1);
    assert_eq!(
        conn.state(),
        ConnectionState::Disconnected(DisconnectReason::UserInitiated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempt_counter_resets_after_success() {
    let (connector, mut listener) = memory::pair();
    let conn = Connection::builder(connector)
        .reconnect(ReconnectPolicy::fixed(secs(1)))
        .build()
        .unwrap();
    let seen = attempts(&conn);
    let mut state = conn.watch_state();

    conn.connect().await.unwrap();
    let mut first = listener.accept().await.unwrap();
    first.close();

    let mut second = listener.accept().await.unwrap();
    state.wait_for(|s| s.is_connected()).await.unwrap();
    second.close();

    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
    assert_eq!(
        conn.state(),
        ConnectionState::Reconnecting { attempt: 0 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_attempts_exhaust_the_policy() {
    let (connector, listener) = memory::pair();
    let conn = Connection::builder(connector)
        .reconnect(ReconnectPolicy::fixed(secs(1)).max_attempts(2))
        .build()
        .unwrap();
    let seen = attempts(&conn);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    conn.on(EventKind::Error, move |event| {
        if let Event::Error(ErrorEvent::ReconnectExhausted { attempts }) = event {
            let _ = tx.send(*attempts);
        }
    });

    listener.set_refusing(true);
    assert!(matches!(
        conn.connect().await,
        Err(ConnectError::Transport { .. })
    ));

    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(listener.connect_count(), 3);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(
        conn.state(),
        ConnectionState::Disconnected(DisconnectReason::Error)
    );
}

#[tokio::test]
async fn test_user_disconnect_never_reconnects() {
    let (connector, mut listener) = memory::pair();
    let conn = Connection::builder(connector)
        .reconnect(ReconnectPolicy::immediate())
        .build()
        .unwrap();
    let seen = attempts(&conn);

    conn.connect().await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    conn.disconnect().await;
    assert_eq!(peer.recv().await, None);

    tokio::task::yield_now().await;
    assert_eq!(listener.connect_count(), 1);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_frames_keep_send_order() {
    let (connector, mut listener) = memory::pair();
    let conn = Connection::builder(connector).build().unwrap();

    conn.connect().await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    let frames: Vec<Frame> = (0..10).map(|i| Frame::from(format!("f{}", i))).collect();
    conn.send_all(frames.clone(), secs(1)).await.unwrap();
    for i in 10..20 {
        conn.send(format!("f{}", i)).await.unwrap();
    }

    for i in 0..20 {
        assert_eq!(peer.recv().await, Some(Frame::from(format!("f{}", i))));
    }
}

#[tokio::test(start_paused = true)]
async fn test_peer_pings_keep_passive_heartbeat_alive() {
    let (connector, mut listener) = memory::pair();
    let config = HeartbeatConfig::new(secs(1), secs(1), 1);
    let conn = Connection::builder(connector)
        .heartbeat(config, relink::socketio::EngineProbe)
        .build()
        .unwrap();

    conn.connect().await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        peer.send("2");
        assert_eq!(peer.recv().await, Some(Frame::from("3")));
    }
    assert!(conn.state().is_connected());

    tokio::time::sleep(secs(3)).await;
    assert_eq!(
        conn.state(),
        ConnectionState::Disconnected(DisconnectReason::HeartbeatTimeout)
    );
}
