//! Stress tests for pathological cases
//!
//! These tests verify we don't have accidentally quadratic behavior.

use pricebus::auth::{ChannelAuthorizer, ClientInfo, RateLimitPolicy, TokenRecord};
use pricebus::channels::ChannelTopology;
use pricebus::ratelimit::RateLimiter;
use pricebus::server::{BroadcastEvent, Broadcaster, ConnectionRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Fan-out cost should grow linearly with the subscriber count
#[test]
fn test_fan_out_not_quadratic() {
    let subscriber_counts = [100, 1_000, 10_000];
    let mut times = vec![];

    for &count in &subscriber_counts {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let broadcaster = Broadcaster::new(registry.clone(), Arc::new(ChannelTopology::reserved_only()));

        let mut receivers = Vec::with_capacity(count);
        for i in 0..count {
            let (conn, rx) = registry
                .admit(None, &ClientInfo::new(format!("10.0.{}.{}:1", i / 250, i % 250), "/ws"))
                .unwrap();
            registry.subscribe(conn.id, "price");
            receivers.push(rx);
        }

        let start = Instant::now();
        let delivered = broadcaster
            .publish("price", BroadcastEvent::Price { source: None, data: json!({"BTC": 1}) })
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(delivered, count);

        let per_subscriber_ns = elapsed.as_nanos() / count as u128;
        times.push((count, per_subscriber_ns));

        println!(
            "Subscribers: {:>6}, Time: {:?}, Per subscriber: {}ns",
            count, elapsed, per_subscriber_ns
        );
    }

    let (_, smallest) = times[0];
    let (_, largest) = times[times.len() - 1];
    assert!(
        largest <= smallest.max(1_000) * 20,
        "per-subscriber fan-out cost grew from {}ns to {}ns",
        smallest,
        largest
    );
}

/// Channel access checks should not degrade with large allow-lists
#[test]
fn test_allow_list_check_not_quadratic() {
    let authorizer = ChannelAuthorizer::new();
    let list_sizes = [10, 1_000, 100_000];
    let mut times = vec![];

    for &size in &list_sizes {
        let record = TokenRecord::builder("pb_stress")
            .channels((0..size).map(|i| format!("feed-{}", i)))
            .build();

        let iterations = 10_000;
        let start = Instant::now();
        for i in 0..iterations {
            let _ = authorizer.can_access(Some(&record), &format!("feed-{}", i % size));
        }
        let per_check_ns = start.elapsed().as_nanos() / iterations as u128;
        times.push(per_check_ns);

        println!("Allow-list: {:>6}, Per check: {}ns", size, per_check_ns);
    }

    assert!(
        times[2] <= times[0].max(1_000) * 20,
        "check cost grew from {}ns to {}ns",
        times[0],
        times[2]
    );
}

/// Many tokens in the limiter stay independent and sweepable
#[test]
fn test_rate_limiter_many_tokens() {
    let limiter = RateLimiter::new();
    let policy = RateLimitPolicy::new(5, 60).unwrap();
    let now = tokio::time::Instant::now();

    for i in 0..50_000 {
        assert!(limiter.check_at(&format!("token-{}", i), &policy, now).is_allowed());
    }
    assert_eq!(limiter.tracked(), 50_000);

    let later = now + policy.window();
    assert_eq!(limiter.sweep(later), 50_000);
    assert_eq!(limiter.tracked(), 0);
}
