//! Wire protocol and the Pricebus server

use crate::auth::{ChannelAuthorizer, TokenValidator};
use crate::channels::ChannelTopology;
use crate::config::PricebusConfig;
use crate::error::{ErrorCode, Rejection};
use crate::ratelimit::RateLimiter;
use crate::server::connections::ConnectionRegistry;
use crate::server::router::Broadcaster;
use crate::server::{http, websocket};
use crate::storage::{ConnectionLog, TokenStore};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to a channel
    Subscribe {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<serde_json::Value>,
    },
    /// Unsubscribe from a channel
    Unsubscribe { channel: String },
    /// Heartbeat
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// Publish on a channel (system commands go to `system`)
    Message {
        channel: String,
        payload: serde_json::Value,
    },
}

/// Operator commands carried by the `system` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum SystemCommand {
    /// Ask clients to refresh their view
    Refresh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Ask clients to reload entirely
    Reload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Operator announcement
    Announcement {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
    },
}

impl SystemCommand {
    pub const NAMES: [&'static str; 3] = ["refresh", "reload", "announcement"];

    pub fn name(&self) -> &'static str {
        match self {
            SystemCommand::Refresh { .. } => "refresh",
            SystemCommand::Reload { .. } => "reload",
            SystemCommand::Announcement { .. } => "announcement",
        }
    }
}

/// Events fanned out to channel subscribers
///
/// Payloads are opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Price update, optionally tagged with its upstream source
    Price {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        data: serde_json::Value,
    },
    /// Anomaly alert
    Alert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        data: serde_json::Value,
    },
    /// Operator command
    System(SystemCommand),
    /// Free-form client payload
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: serde_json::Value,
    },
}

impl BroadcastEvent {
    pub fn price(source: impl Into<String>, data: serde_json::Value) -> Self {
        BroadcastEvent::Price {
            source: Some(source.into()),
            data,
        }
    }

    pub fn alert(source: impl Into<String>, data: serde_json::Value) -> Self {
        BroadcastEvent::Alert {
            source: Some(source.into()),
            data,
        }
    }

    /// Source tag used for derived-channel fan-out
    pub fn source(&self) -> Option<&str> {
        match self {
            BroadcastEvent::Price { source, .. } | BroadcastEvent::Alert { source, .. } => {
                source.as_deref()
            }
            _ => None,
        }
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once on admission
    Welcome {
        connection_id: Uuid,
        authenticated: bool,
        token_name: Option<String>,
        permissions: Vec<String>,
        channels: Vec<String>,
    },
    /// Subscription confirmed
    SubscriptionSuccess {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filters: Option<serde_json::Value>,
    },
    /// Subscription denied
    SubscriptionError {
        channel: String,
        code: ErrorCode,
        message: String,
    },
    /// Unsubscription confirmed
    UnsubscriptionSuccess { channel: String },
    /// Connection refused; the socket closes after this
    ConnectionRejected {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_connected_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_address: Option<String>,
    },
    /// Another client tried to connect with this connection's token
    ConnectionWarning {
        code: ErrorCode,
        message: String,
        address: String,
        user_agent: Option<String>,
        attempted_at: DateTime<Utc>,
    },
    /// Event on a subscribed channel
    Event {
        channel: String,
        event: BroadcastEvent,
        timestamp: DateTime<Utc>,
    },
    /// Publish accepted
    PublishSuccess { channel: String, delivered: usize },
    /// Heartbeat reply
    Pong {
        seq: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// Request-scoped failure; the connection stays open
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl ServerMessage {
    pub fn pong(seq: Option<u64>) -> Self {
        ServerMessage::Pong {
            seq,
            timestamp: Utc::now(),
        }
    }

    /// Final message for a refused connection
    pub fn rejected(rejection: &Rejection) -> Self {
        let (existing_connected_at, existing_address) = match rejection {
            Rejection::DuplicateToken {
                existing_connected_at,
                existing_address,
            } => (Some(*existing_connected_at), Some(existing_address.clone())),
            _ => (None, None),
        };

        ServerMessage::ConnectionRejected {
            code: rejection.code(),
            message: rejection.to_string(),
            existing_connected_at,
            existing_address,
        }
    }

    pub fn error(rejection: &Rejection, channel: Option<&str>) -> Self {
        ServerMessage::Error {
            code: rejection.code(),
            message: rejection.to_string(),
            channel: channel.map(str::to_string),
        }
    }

    pub fn subscription_error(channel: &str, rejection: &Rejection) -> Self {
        ServerMessage::SubscriptionError {
            channel: channel.to_string(),
            code: rejection.code(),
            message: rejection.to_string(),
        }
    }
}

/// Outbound events are shared between all recipients of a fan-out
pub type OutboundMessage = Arc<ServerMessage>;

/// Shared state for transport handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PricebusConfig>,
    pub topology: Arc<ChannelTopology>,
    pub validator: TokenValidator,
    pub authorizer: Arc<ChannelAuthorizer>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: PricebusConfig,
        store: Arc<dyn TokenStore>,
        log: Arc<dyn ConnectionLog>,
    ) -> Result<Self> {
        let topology = Arc::new(
            ChannelTopology::new(config.source_channels.iter().cloned())
                .context("Invalid source channel")?,
        );
        let validator = TokenValidator::new(store, log)
            .with_timeouts(config.lookup_timeout, config.usage_timeout);
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_buffer));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), topology.clone()));

        Ok(Self {
            config: Arc::new(config),
            topology,
            validator,
            authorizer: Arc::new(ChannelAuthorizer::new()),
            registry,
            broadcaster,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }
}

/// Build the full HTTP router: WebSocket, REST API and health check
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(websocket::create_router(state.clone()))
        .merge(http::create_router(state))
}

async fn health_handler() -> &'static str {
    "ok"
}

/// The main Pricebus server
pub struct PricebusServer {
    state: AppState,
}

impl PricebusServer {
    pub fn new(
        config: PricebusConfig,
        store: Arc<dyn TokenStore>,
        log: Arc<dyn ConnectionLog>,
    ) -> Result<Self> {
        Ok(Self {
            state: AppState::new(config, store, log)?,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get a reference to the broadcaster (for publishing from ingestion adapters)
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.state.broadcaster.clone()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.state.registry.count()
    }

    /// Publish an event from a server-side producer
    pub fn publish(&self, channel: &str, event: BroadcastEvent) -> Result<usize, Rejection> {
        self.state.broadcaster.publish(channel, event)
    }

    /// Run the server until the listener fails
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;

        let background = self.spawn_background_tasks();

        info!(addr = %bind_addr, channels = %self.state.topology, "Pricebus server listening");

        let app = create_router(self.state.clone());
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        for task in background {
            task.abort();
        }

        result.context("Server error")
    }

    fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self
            .state
            .rate_limiter
            .clone()
            .spawn_sweeper(self.state.config.rate_limit_sweep_interval)];

        if let Some(idle_timeout) = self.state.config.idle_timeout {
            tasks.push(spawn_idle_reaper(self.state.registry.clone(), idle_timeout));
        }

        tasks
    }
}

/// Periodically close connections idle for longer than `idle_timeout`
pub fn spawn_idle_reaper(registry: Arc<ConnectionRegistry>, idle_timeout: Duration) -> JoinHandle<()> {
    let period = (idle_timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let closed = registry.close_idle(idle_timeout);
            if closed > 0 {
                debug!(closed, "Closed idle connections");
            }
        }
    })
}
