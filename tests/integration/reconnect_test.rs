// tests/integration/reconnect_test.rs

//! Integration tests for connection loss, reconnection and close.

use super::test_helpers::{
    MockServer, wait_for_epoch_after, wait_for_pending, wait_for_state,
};
use rmpv::Value;
use std::time::Duration;
use tntwire::config::{ReconnectConfig, ReconnectingPolicy};
use tntwire::connection::{Connection, ConnectionState};
use tntwire::TntError;

const RECONNECT_LIMIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_pending_requests_fail_with_connection_lost() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("sleep", vec![Value::from(5_000)], None).await })
        })
        .collect();
    wait_for_pending(&conn, 3).await;

    server.kill_connections();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, TntError::ConnectionLost);
    }
    assert_eq!(conn.pending_requests(), 0);

    wait_for_epoch_after(&conn, 1, RECONNECT_LIMIT).await;
    assert!(conn.ping(None).await.is_ok());
    assert_eq!(server.accepted(), 2);
    conn.close().await;
}

#[tokio::test]
async fn test_disconnect_then_call_fails_then_recovers() {
    let server = MockServer::start().await;
    let mut config = server.client_config();
    config.on_reconnecting = ReconnectingPolicy::FailFast;
    config.reconnect.initial_delay = Duration::from_millis(300);
    config.reconnect.max_delay = Duration::from_millis(300);
    let conn = Connection::open(config).await.unwrap();

    server.kill_connections();
    let mut status = conn.subscribe();
    status
        .wait_for(|s| s.state != ConnectionState::Connected)
        .await
        .unwrap();

    let err = conn.ping(None).await.unwrap_err();
    assert!(
        matches!(err, TntError::NotConnected | TntError::ConnectionLost),
        "got {err:?}"
    );

    wait_for_epoch_after(&conn, 1, RECONNECT_LIMIT).await;
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_queued_call_waits_for_reconnection() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    server.refuse_connections(true);
    server.kill_connections();
    let mut status = conn.subscribe();
    status
        .wait_for(|s| s.state.is_transient())
        .await
        .unwrap();

    let queued_conn = conn.clone();
    let queued =
        tokio::spawn(async move { queued_conn.ping(Some(Duration::from_secs(3))).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!queued.is_finished());

    server.refuse_connections(false);
    let response = queued.await.unwrap().unwrap();
    assert!(response.is_ok());
    assert!(conn.status().epoch >= 2);
    conn.close().await;
}

#[tokio::test]
async fn test_queued_call_gives_up_at_its_deadline() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    server.refuse_connections(true);
    server.kill_connections();
    let mut status = conn.subscribe();
    status
        .wait_for(|s| s.state.is_transient())
        .await
        .unwrap();

    let err = conn
        .ping(Some(Duration::from_millis(60)))
        .await
        .unwrap_err();
    assert_eq!(err, TntError::NotConnected);

    server.refuse_connections(false);
    wait_for_epoch_after(&conn, 1, RECONNECT_LIMIT).await;
    conn.close().await;
}

#[tokio::test]
async fn test_forced_reconnect_opens_a_new_transport() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    let call_conn = conn.clone();
    let call = tokio::spawn(async move {
        call_conn.call("sleep", vec![Value::from(5_000)], None).await
    });
    wait_for_pending(&conn, 1).await;

    conn.reconnect().await.unwrap();

    assert_eq!(call.await.unwrap().unwrap_err(), TntError::ConnectionLost);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.status().epoch, 2);
    assert_eq!(server.accepted(), 2);
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_forced_reconnect_works_with_auto_reconnect_disabled() {
    let server = MockServer::start().await;
    let mut config = server.client_config();
    config.reconnect = ReconnectConfig::disabled();
    let conn = Connection::open(config).await.unwrap();

    conn.reconnect().await.unwrap();

    assert_eq!(conn.status().epoch, 2);
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_connection_loss_without_reconnect_closes() {
    let server = MockServer::start().await;
    let mut config = server.client_config();
    config.reconnect = ReconnectConfig::disabled();
    let conn = Connection::open(config).await.unwrap();

    server.kill_connections();
    wait_for_state(&conn, ConnectionState::Closed, RECONNECT_LIMIT).await;

    assert_eq!(conn.ping(None).await.unwrap_err(), TntError::NotConnected);
    assert_eq!(server.accepted(), 1);

    // An explicit connect starts over.
    conn.connect().await.unwrap();
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_initial_failure_then_background_recovery() {
    let server = MockServer::start().await;
    server.refuse_connections(true);

    let conn = Connection::new(server.client_config());
    assert!(conn.connect().await.is_err());
    assert_ne!(conn.state(), ConnectionState::Closed);

    server.refuse_connections(false);
    wait_for_state(&conn, ConnectionState::Connected, RECONNECT_LIMIT).await;
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_malformed_frame_forces_reconnect() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    let err = conn
        .call("garbage", Vec::new(), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert_eq!(err, TntError::ConnectionLost);
    assert!(matches!(conn.last_error(), Some(TntError::Protocol(_))));

    wait_for_epoch_after(&conn, 1, RECONNECT_LIMIT).await;
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_undecodable_body_fails_only_its_request() {
    let server = MockServer::start().await;
    let conn = server.connect().await;
    let epoch = conn.status().epoch;

    let err = conn
        .call("bad_body", Vec::new(), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, TntError::Decode(_)), "unexpected error: {err:?}");

    assert!(conn.is_connected());
    assert_eq!(conn.status().epoch, epoch);
    assert!(conn.ping(None).await.is_ok());
    assert_eq!(server.accepted(), 1);
    conn.close().await;
}

#[tokio::test]
async fn test_reconnect_during_handshake_keeps_the_new_transport() {
    let server = MockServer::start().await;
    let conn = server.connect().await;
    let first_epoch = conn.status().epoch;

    server.set_greeting_delay(Duration::from_millis(200));
    server.kill_connections();
    wait_for_state(&conn, ConnectionState::Handshaking, RECONNECT_LIMIT).await;

    // The attempt under way already replaces the lost transport.
    conn.reconnect().await.unwrap();
    let epoch = conn.status().epoch;
    assert!(epoch > first_epoch);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.status().epoch, epoch);
    assert_eq!(server.accepted(), 2);
    assert!(conn.ping(None).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn test_close_fails_pending_and_is_idempotent() {
    let server = MockServer::start().await;
    let conn = server.connect().await;

    let call_conn = conn.clone();
    let call = tokio::spawn(async move {
        call_conn.call("sleep", vec![Value::from(5_000)], None).await
    });
    wait_for_pending(&conn, 1).await;

    conn.close().await;

    assert_eq!(call.await.unwrap().unwrap_err(), TntError::ConnectionClosed);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.ping(None).await.unwrap_err(), TntError::NotConnected);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_after_close_reopens() {
    let server = MockServer::start().await;
    let conn = server.connect().await;
    conn.close().await;

    conn.connect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.ping(None).await.is_ok());
    assert_eq!(server.accepted(), 2);
    conn.close().await;
}

#[tokio::test]
async fn test_close_before_connect() {
    super::test_helpers::init_tracing();
    let conn = Connection::new(tntwire::ClientConfig::default());
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}
