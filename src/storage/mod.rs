//! Storage collaborators for Pricebus
//!
//! - `TokenStore`: token records and usage counters
//! - `ConnectionLog`: write-only audit trail of connection events
//!
//! Backends:
//! - Memory: DashMap-backed store for tests and single-node development
//! - Postgres: durable tokens and connection log

mod memory;
mod postgres;

pub use memory::{MemoryConnectionLog, MemoryTokenStore, TracingConnectionLog};
pub use postgres::{PostgresConfig, PostgresStore};

use crate::auth::{token_prefix, ClientInfo, TokenRecord};
pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Token persistence as seen by the server
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Find the record for a presented token value
    async fn lookup(&self, value: &str) -> Result<Option<TokenRecord>, StorageError>;

    /// Increment the usage counter and stamp `last_used_at`
    async fn record_usage(&self, token_id: &str) -> Result<(), StorageError>;
}

/// Append-only connection audit log, never read back by the server
#[async_trait]
pub trait ConnectionLog: Send + Sync {
    async fn append(&self, event: ConnectionEvent) -> Result<(), StorageError>;
}

/// Kind of connection event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    /// Token validation, successful or not
    Authenticate,
    /// Real-time connection admitted
    Connect,
    /// Real-time connection refused because the token is already connected
    DuplicateRejected,
    /// Real-time connection closed
    Disconnect,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventKind::Authenticate => "authenticate",
            ConnectionEventKind::Connect => "connect",
            ConnectionEventKind::DuplicateRejected => "duplicate_rejected",
            ConnectionEventKind::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for ConnectionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the connection log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub token_id: Option<String>,
    /// Redacted token value
    pub token: Option<String>,
    pub domain: String,
    pub address: String,
    pub user_agent: Option<String>,
    /// Endpoint or channel the caller was attempting
    pub endpoint: String,
    pub kind: ConnectionEventKind,
    pub success: bool,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(kind: ConnectionEventKind, client: &ClientInfo, success: bool) -> Self {
        Self {
            token_id: None,
            token: None,
            domain: client.domain.clone(),
            address: client.address.clone(),
            user_agent: client.user_agent.clone(),
            endpoint: client.endpoint.clone(),
            kind,
            success,
            reason: None,
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_token_id(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    /// Attach the redacted form of a presented token value
    pub fn with_token_value(mut self, value: &str) -> Self {
        self.token = Some(token_prefix(value));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
