//! Resilience tests for Pricebus
//!
//! These tests verify behavior under failure conditions like:
//! - Subscribers disappearing mid-delivery
//! - Outbound buffer exhaustion
//! - Rapid connect/disconnect cycles
//! - A token store that stops answering

use async_trait::async_trait;
use pricebus::auth::{ClientInfo, TokenRecord};
use pricebus::config::PricebusConfig;
use pricebus::error::{ErrorCode, Rejection};
use pricebus::server::{session, AppState, BroadcastEvent};
use pricebus::storage::{
    ConnectionEventKind, MemoryConnectionLog, MemoryTokenStore, StorageError, TokenStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn state(config: PricebusConfig) -> (AppState, Arc<MemoryTokenStore>, Arc<MemoryConnectionLog>) {
    let store = Arc::new(MemoryTokenStore::new());
    let log = Arc::new(MemoryConnectionLog::new());
    let state = AppState::new(config, store.clone(), log.clone()).unwrap();
    (state, store, log)
}

fn client(i: usize) -> ClientInfo {
    ClientInfo::new(format!("10.9.0.{}:4000", i % 250), "/ws")
}

/// Publishing keeps working when half the subscribers vanish without closing
#[tokio::test]
async fn test_subscribers_disappearing_mid_delivery() {
    let (state, _, _) = state(PricebusConfig::default().outbound_buffer(200));

    let mut receivers = vec![];
    for i in 0..100 {
        let (conn, rx) = session::open(&state, None, &client(i)).await.unwrap();
        state.registry.subscribe(conn.id, "price");
        receivers.push(rx);
    }

    // Dropping a receiver makes delivery to that connection fail
    let mut live: Vec<_> = receivers.drain(..50).collect();
    drop(receivers);

    for i in 0..100 {
        let delivered = state
            .broadcaster
            .publish("price", BroadcastEvent::Price { source: None, data: json!(i) })
            .unwrap();
        assert_eq!(delivered, 50);
    }

    for rx in live.iter_mut() {
        // welcome + 100 events
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 101);
    }
}

/// A slow consumer loses events instead of stalling the publisher
#[tokio::test]
async fn test_buffer_exhaustion_drops_for_slow_consumer_only() {
    let (state, _, _) = state(PricebusConfig::default().outbound_buffer(8));

    let (slow, _slow_rx) = session::open(&state, None, &client(1)).await.unwrap();
    let (fast, mut fast_rx) = session::open(&state, None, &client(2)).await.unwrap();
    state.registry.subscribe(slow.id, "alerts");
    state.registry.subscribe(fast.id, "alerts");
    while fast_rx.try_recv().is_ok() {}

    let mut fast_received = 0;
    for i in 0..100 {
        state
            .broadcaster
            .publish("alerts", BroadcastEvent::alert("binance", json!({"n": i})))
            .unwrap();
        while fast_rx.try_recv().is_ok() {
            fast_received += 1;
        }
    }

    assert_eq!(fast_received, 100);
    // Slow consumer is still registered; it just missed events
    assert!(state.registry.get(slow.id).is_some());
}

/// Rapid connect/disconnect leaves no residue in the registry
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rapid_connect_disconnect() {
    let (state, store, _) = state(PricebusConfig::default());
    for i in 0..10 {
        store.insert(TokenRecord::builder(&format!("pb_cycle_{}", i)).build());
    }

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let state = state.clone();
            tokio::spawn(async move {
                let value = format!("pb_cycle_{}", i);
                for round in 0..50 {
                    let (conn, _rx) = session::open(&state, Some(value.as_str()), &client(round)).await.unwrap();
                    session::handle_text(&state, &conn, r#"{"type":"subscribe","channel":"price"}"#);
                    session::close(&state, &conn);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(state.registry.count(), 0);
    assert!(state.registry.channel_counts().is_empty());
}

/// Closing twice records a single disconnect
#[tokio::test]
async fn test_double_close_is_harmless() {
    let (state, _, log) = state(PricebusConfig::default());
    let (conn, _rx) = session::open(&state, None, &client(1)).await.unwrap();
    let (other, _other_rx) = session::open(&state, None, &client(2)).await.unwrap();

    session::close(&state, &conn);
    session::close(&state, &conn);

    assert!(state.registry.get(other.id).is_some());
    assert_eq!(state.registry.count(), 1);

    let mut disconnects = 0;
    for _ in 0..100 {
        tokio::task::yield_now().await;
        disconnects = log
            .events()
            .iter()
            .filter(|e| e.kind == ConnectionEventKind::Disconnect)
            .count();
        if disconnects > 0 {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(disconnects, 1);
}

/// Idle connections are told to close; the session loop deregisters them
#[tokio::test]
async fn test_idle_connections_are_closed() {
    let (state, _, _) = state(PricebusConfig::default());
    let (conn, _rx) = session::open(&state, None, &client(1)).await.unwrap();

    let closed = state.registry.close_idle(Duration::ZERO);
    assert_eq!(closed, 1);

    tokio::time::timeout(Duration::from_secs(1), conn.closed())
        .await
        .expect("close notification");
}

struct StalledStore;

#[async_trait]
impl TokenStore for StalledStore {
    async fn lookup(&self, _value: &str) -> Result<Option<TokenRecord>, StorageError> {
        std::future::pending().await
    }

    async fn record_usage(&self, _token_id: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A store that never answers produces a rejection, not a hung admission
#[tokio::test]
async fn test_stalled_store_rejects_connection() {
    let config = PricebusConfig::default()
        .store_timeouts(Duration::from_millis(50), Duration::from_millis(50));
    let state = AppState::new(config, Arc::new(StalledStore), Arc::new(MemoryConnectionLog::new())).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        session::open(&state, Some("pb_any"), &client(1)),
    )
    .await
    .expect("admission must not hang");

    let err = result.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StoreUnavailable);
    assert!(err.is_authentication_failure());
    assert_eq!(state.registry.count(), 0);
}

/// Anonymous connections are refused outright when disabled
#[tokio::test]
async fn test_anonymous_disabled() {
    let (state, _, _) = state(PricebusConfig::default().allow_anonymous(false));
    assert_eq!(
        session::open(&state, None, &client(1)).await.unwrap_err(),
        Rejection::AuthenticationRequired
    );
    assert_eq!(
        session::open(&state, Some(""), &client(1)).await.unwrap_err(),
        Rejection::AuthenticationRequired
    );
}
