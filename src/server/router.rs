//! Channel fan-out

use crate::channels::ChannelTopology;
use crate::error::Rejection;
use crate::server::connections::ConnectionRegistry;
use crate::server::transport::{BroadcastEvent, ServerMessage};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Delivers events to the current subscribers of a channel
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    topology: Arc<ChannelTopology>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, topology: Arc<ChannelTopology>) -> Self {
        Self { registry, topology }
    }

    /// Publish an event on a declared channel
    ///
    /// Source-tagged events are also delivered on the source's own channel.
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, channel: &str, event: BroadcastEvent) -> Result<usize, Rejection> {
        if !self.topology.contains(channel) {
            return Err(Rejection::UnknownChannel {
                channel: channel.to_string(),
            });
        }

        let derived = event
            .source()
            .and_then(|source| self.topology.source_channel(source))
            .filter(|source_channel| *source_channel != channel)
            .map(str::to_string);

        let timestamp = Utc::now();
        let mut delivered = self.route(channel, &event, timestamp);
        if let Some(derived) = derived {
            delivered += self.route(&derived, &event, timestamp);
        }

        Ok(delivered)
    }

    fn route(&self, channel: &str, event: &BroadcastEvent, timestamp: chrono::DateTime<Utc>) -> usize {
        let subscribers = self.registry.subscribers(channel);
        if subscribers.is_empty() {
            debug!(channel = %channel, "No subscribers for channel");
            return 0;
        }

        debug!(channel = %channel, subscriber_count = subscribers.len(), "Routing event");

        // One allocation shared by every recipient
        let msg = Arc::new(ServerMessage::Event {
            channel: channel.to_string(),
            event: event.clone(),
            timestamp,
        });

        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.deliver(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Expected during rapid disconnect or for slow consumers
                    debug!(conn_id = %subscriber.id, channel = %channel, error = %e, "Dropped event for subscriber");
                }
            }
        }

        delivered
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientInfo;
    use serde_json::json;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let topology = Arc::new(ChannelTopology::new(["binance", "kraken"]).unwrap());
        let broadcaster = Broadcaster::new(registry.clone(), topology);
        (registry, broadcaster)
    }

    fn channel_of(msg: &ServerMessage) -> &str {
        match msg {
            ServerMessage::Event { channel, .. } => channel,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_source_tagged_event_reaches_both_channels() {
        let (registry, broadcaster) = setup();
        let (generic, mut generic_rx) = registry.admit(None, &ClientInfo::new("a:1", "/ws")).unwrap();
        let (specific, mut specific_rx) = registry.admit(None, &ClientInfo::new("b:1", "/ws")).unwrap();
        let (other, mut other_rx) = registry.admit(None, &ClientInfo::new("c:1", "/ws")).unwrap();
        registry.subscribe(generic.id, "price");
        registry.subscribe(specific.id, "binance");
        registry.subscribe(other.id, "kraken");

        let delivered = broadcaster
            .publish("price", BroadcastEvent::price("binance", json!({"BTC": 1})))
            .unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(channel_of(&generic_rx.try_recv().unwrap()), "price");
        assert_eq!(channel_of(&specific_rx.try_recv().unwrap()), "binance");
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_channel() {
        let (_, broadcaster) = setup();
        let err = broadcaster
            .publish("bitstamp", BroadcastEvent::price("bitstamp", json!({})))
            .unwrap_err();
        assert_eq!(
            err,
            Rejection::UnknownChannel {
                channel: "bitstamp".to_string()
            }
        );
    }

    #[test]
    fn test_undeclared_source_tag_is_ignored() {
        let (registry, broadcaster) = setup();
        let (conn, mut rx) = registry.admit(None, &ClientInfo::new("a:1", "/ws")).unwrap();
        registry.subscribe(conn.id, "alerts");

        let delivered = broadcaster
            .publish("alerts", BroadcastEvent::alert("coinbase", json!({"spread": 9})))
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(channel_of(&rx.try_recv().unwrap()), "alerts");
    }

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new(1));
        let broadcaster = Broadcaster::new(registry.clone(), Arc::new(ChannelTopology::reserved_only()));

        let (slow, _slow_rx) = registry.admit(None, &ClientInfo::new("slow:1", "/ws")).unwrap();
        let (fast, mut fast_rx) = registry.admit(None, &ClientInfo::new("fast:1", "/ws")).unwrap();
        registry.subscribe(slow.id, "price");
        registry.subscribe(fast.id, "price");

        assert_eq!(broadcaster.publish("price", BroadcastEvent::price("x", json!(1))).unwrap(), 2);
        fast_rx.try_recv().unwrap();

        // The slow subscriber's buffer is full; the fast one still receives
        assert_eq!(broadcaster.publish("price", BroadcastEvent::price("x", json!(2))).unwrap(), 1);
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let (registry, broadcaster) = setup();
        let (conn, mut rx) = registry.admit(None, &ClientInfo::new("a:1", "/ws")).unwrap();
        registry.subscribe(conn.id, "price");

        for i in 0..10 {
            broadcaster
                .publish("price", BroadcastEvent::Price { source: None, data: json!(i) })
                .unwrap();
        }

        for i in 0..10 {
            match &*rx.try_recv().unwrap() {
                ServerMessage::Event {
                    event: BroadcastEvent::Price { data, .. },
                    ..
                } => assert_eq!(*data, json!(i)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
