//! Live connection registry and admission control
//!
//! The registry is the single owner of live connections. Admission for a
//! token runs under one lock so two concurrent connects with the same
//! single-connection token can never both succeed.

use crate::auth::{ClientInfo, TokenRecord};
use crate::error::{ErrorCode, Rejection};
use crate::server::transport::{OutboundMessage, ServerMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Why an outbound event was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound buffer full")]
    Full,

    #[error("connection closed")]
    Closed,
}

/// One real-time session
pub struct LiveConnection {
    /// Unique connection ID
    pub id: ConnectionId,
    /// Token the connection was admitted with, if any
    pub token: Option<Arc<TokenRecord>>,
    pub address: String,
    pub user_agent: Option<String>,
    pub domain: String,
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    /// Channels this connection is subscribed to
    subscriptions: RwLock<HashSet<String>>,
    /// Channel for sending events to this client
    tx: mpsc::Sender<OutboundMessage>,
    close: Notify,
}

impl LiveConnection {
    fn new(
        token: Option<Arc<TokenRecord>>,
        client: &ClientInfo,
        tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            token,
            address: client.address.clone(),
            user_agent: client.user_agent.clone(),
            domain: client.domain.clone(),
            connected_at: now,
            last_activity: Mutex::new(Instant::now()),
            subscriptions: RwLock::new(HashSet::new()),
            tx,
            close: Notify::new(),
        }
    }

    pub fn token_id(&self) -> Option<&str> {
        self.token.as_deref().map(|t| t.id.as_str())
    }

    pub fn token_record(&self) -> Option<&TokenRecord> {
        self.token.as_deref()
    }

    /// Time since the last client activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Mark the connection as active now
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().contains(channel)
    }

    /// Subscribed channels, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Queue an event without waiting for buffer space
    pub fn deliver(&self, msg: OutboundMessage) -> Result<(), DeliveryError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Queue a message addressed to this connection only
    pub fn send(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        self.deliver(Arc::new(msg))
    }

    /// Ask the transport to close this connection
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("id", &self.id)
            .field("token_id", &self.token_id())
            .field("address", &self.address)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Tracks every live connection and channel subscriber set
pub struct ConnectionRegistry {
    /// All active connections by ID
    connections: DashMap<ConnectionId, Arc<LiveConnection>>,
    /// Admission serialization point: token id -> its connections
    by_token: Mutex<HashMap<String, Vec<ConnectionId>>>,
    /// Channel name -> subscribed connection IDs
    channels: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    /// Outbound buffer size for new connections
    outbound_buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_token: Mutex::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Admit a new connection
    ///
    /// When the token is already connected and does not allow multiple
    /// connections, the existing connection gets a `connectionWarning` and
    /// the new one is refused with `DuplicateToken`.
    pub fn admit(
        &self,
        token: Option<Arc<TokenRecord>>,
        client: &ClientInfo,
    ) -> Result<(Arc<LiveConnection>, mpsc::Receiver<OutboundMessage>), Rejection> {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);

        let Some(record) = token else {
            let conn = Arc::new(LiveConnection::new(None, client, tx));
            self.connections.insert(conn.id, conn.clone());
            debug!(conn_id = %conn.id, address = %conn.address, "Anonymous connection admitted");
            return Ok((conn, rx));
        };

        let mut by_token = self.by_token.lock();
        let existing: Vec<Arc<LiveConnection>> = by_token
            .get(&record.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if !record.allow_multiple_connections {
            if let Some(oldest) = existing.iter().min_by_key(|c| c.connected_at) {
                let attempted_at = Utc::now();
                for conn in &existing {
                    let warning = ServerMessage::ConnectionWarning {
                        code: ErrorCode::DuplicateToken,
                        message: "Another client attempted to connect with this token".to_string(),
                        address: client.address.clone(),
                        user_agent: client.user_agent.clone(),
                        attempted_at,
                    };
                    if let Err(e) = conn.send(warning) {
                        debug!(conn_id = %conn.id, error = %e, "Failed to deliver duplicate warning");
                    }
                }

                warn!(
                    token_id = %record.id,
                    existing_conn = %oldest.id,
                    address = %client.address,
                    "Duplicate connection rejected"
                );

                return Err(Rejection::DuplicateToken {
                    existing_connected_at: oldest.connected_at,
                    existing_address: oldest.address.clone(),
                });
            }
        }

        let token_id = record.id.clone();
        let conn = Arc::new(LiveConnection::new(Some(record), client, tx));
        self.connections.insert(conn.id, conn.clone());
        by_token.entry(token_id.clone()).or_default().push(conn.id);

        info!(conn_id = %conn.id, token_id = %token_id, address = %conn.address, "Connection admitted");
        Ok((conn, rx))
    }

    /// Remove a connection by its exact ID
    ///
    /// Idempotent; other connections for the same token are untouched.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<LiveConnection>> {
        let (_, conn) = self.connections.remove(&id)?;

        if let Some(token_id) = conn.token_id() {
            let mut by_token = self.by_token.lock();
            if let Some(ids) = by_token.get_mut(token_id) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    by_token.remove(token_id);
                }
            }
        }

        let mut channels = self.channels.write();
        for channel in conn.subscriptions.read().iter() {
            if let Some(set) = channels.get_mut(channel) {
                set.remove(&id);
                if set.is_empty() {
                    channels.remove(channel);
                }
            }
        }

        debug!(conn_id = %id, "Connection removed");
        Some(conn)
    }

    /// Add a connection to a channel's subscriber set
    ///
    /// Returns false if the connection is no longer registered.
    pub fn subscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut channels = self.channels.write();
        let Some(conn) = self.connections.get(&id).map(|c| c.clone()) else {
            return false;
        };

        channels.entry(channel.to_string()).or_default().insert(id);
        conn.subscriptions.write().insert(channel.to_string());
        conn.touch();
        true
    }

    /// Remove a connection from a channel's subscriber set
    ///
    /// Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        let mut channels = self.channels.write();
        let Some(conn) = self.connections.get(&id).map(|c| c.clone()) else {
            return false;
        };

        if let Some(set) = channels.get_mut(channel) {
            set.remove(&id);
            if set.is_empty() {
                channels.remove(channel);
            }
        }
        conn.touch();
        let removed = conn.subscriptions.write().remove(channel);
        removed
    }

    /// Snapshot of a channel's current subscribers
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<LiveConnection>> {
        let ids: Vec<ConnectionId> = match self.channels.read().get(channel) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };

        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
            .collect()
    }

    /// Bump a connection's last activity time
    pub fn update_activity(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    /// Get a connection by ID
    pub fn get(&self, id: ConnectionId) -> Option<Arc<LiveConnection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Live connections admitted with a token
    pub fn connections_for_token(&self, token_id: &str) -> Vec<Arc<LiveConnection>> {
        let by_token = self.by_token.lock();
        by_token
            .get(token_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Subscriber count per channel
    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        self.channels
            .read()
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect()
    }

    /// Connections with no activity for at least `timeout`
    pub fn idle_longer_than(&self, timeout: Duration) -> Vec<Arc<LiveConnection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().idle_for() >= timeout)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ask idle connections to close; their sessions deregister them
    pub fn close_idle(&self, timeout: Duration) -> usize {
        let idle = self.idle_longer_than(timeout);
        for conn in &idle {
            info!(conn_id = %conn.id, idle_secs = conn.idle_for().as_secs(), "Closing idle connection");
            conn.close();
        }
        idle.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
