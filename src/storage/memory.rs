//! In-memory storage backends

use crate::auth::{hash_token_value, TokenRecord};
use crate::storage::{ConnectionEvent, ConnectionLog, StorageError, TokenStore};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Token store held entirely in memory, keyed by value hash
#[derive(Default)]
pub struct MemoryTokenStore {
    /// token hash -> record
    tokens: DashMap<String, TokenRecord>,
    /// token id -> token hash
    ids: DashMap<String, String>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn insert(&self, record: TokenRecord) {
        self.ids.insert(record.id.clone(), record.token_hash.clone());
        self.tokens.insert(record.token_hash.clone(), record);
    }

    /// Get a record by its id
    pub fn get(&self, token_id: &str) -> Option<TokenRecord> {
        let hash = self.ids.get(token_id)?;
        self.tokens.get(hash.value()).map(|r| r.clone())
    }

    /// Enable or disable a token
    pub fn set_active(&self, token_id: &str, active: bool) -> Result<(), StorageError> {
        let hash = self
            .ids
            .get(token_id)
            .map(|h| h.clone())
            .ok_or_else(|| StorageError::NotFound(format!("Token not found: {}", token_id)))?;

        match self.tokens.get_mut(&hash) {
            Some(mut record) => {
                record.is_active = active;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("Token not found: {}", token_id))),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn lookup(&self, value: &str) -> Result<Option<TokenRecord>, StorageError> {
        let hash = hash_token_value(value);
        Ok(self.tokens.get(&hash).map(|r| r.clone()))
    }

    async fn record_usage(&self, token_id: &str) -> Result<(), StorageError> {
        let hash = self
            .ids
            .get(token_id)
            .map(|h| h.clone())
            .ok_or_else(|| StorageError::NotFound(format!("Token not found: {}", token_id)))?;

        if let Some(mut record) = self.tokens.get_mut(&hash) {
            record.usage_count += 1;
            record.last_used_at = Some(Utc::now());
        }

        Ok(())
    }
}

/// Connection log that keeps every event in memory
#[derive(Default)]
pub struct MemoryConnectionLog {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl MemoryConnectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events appended so far
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl ConnectionLog for MemoryConnectionLog {
    async fn append(&self, event: ConnectionEvent) -> Result<(), StorageError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Connection log that emits each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConnectionLog;

#[async_trait]
impl ConnectionLog for TracingConnectionLog {
    async fn append(&self, event: ConnectionEvent) -> Result<(), StorageError> {
        if event.success {
            info!(
                target: "pricebus::connection_log",
                kind = %event.kind,
                token_id = ?event.token_id,
                token = ?event.token,
                domain = %event.domain,
                address = %event.address,
                user_agent = ?event.user_agent,
                endpoint = %event.endpoint,
                "connection event"
            );
        } else {
            warn!(
                target: "pricebus::connection_log",
                kind = %event.kind,
                token_id = ?event.token_id,
                token = ?event.token,
                domain = %event.domain,
                address = %event.address,
                user_agent = ?event.user_agent,
                endpoint = %event.endpoint,
                reason = ?event.reason,
                "connection event"
            );
        }
        Ok(())
    }
}
