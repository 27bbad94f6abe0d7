//! Token validation
//!
//! A presented token value is admitted when it resolves to a record that is
//! active, not expired, and compatible with the requesting domain. Each
//! outcome is appended to the connection log.

use crate::auth::tokens::{token_prefix, TokenRecord};
use crate::channels::WILDCARD;
use crate::error::Rejection;
use crate::storage::{ConnectionEvent, ConnectionEventKind, ConnectionLog, TokenStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Who is calling and what they are after
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Remote socket address
    pub address: String,
    pub user_agent: Option<String>,
    /// Host name the request originates from (empty when unknown)
    pub domain: String,
    /// Endpoint or channel being accessed
    pub endpoint: String,
}

impl ClientInfo {
    pub fn new(address: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Check a requesting domain against a token's domain rule
///
/// Admits when the rule is `*`, equals the requesting domain, is a substring
/// of it, or itself mentions `localhost`. The substring rules are loose on
/// purpose: tokens issued for `a.com` also work from `notaa.com`.
pub fn domain_matches(token_domain: &str, requesting_domain: &str) -> bool {
    token_domain == WILDCARD
        || requesting_domain == token_domain
        || requesting_domain.contains(token_domain)
        || token_domain.contains("localhost")
}

/// Reduce an `Origin`/`Referer`/`Host` header value to a lowercase host name
pub fn normalize_domain(raw: &str) -> String {
    let raw = raw.trim();
    let without_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);

    let host = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        rest.split_once(']').map(|(h, _)| h).unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or_default()
    };

    host.to_lowercase()
}

/// Check the policy fields of a resolved record
pub fn check_record(
    record: &TokenRecord,
    requesting_domain: &str,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    if !record.is_active {
        return Err(Rejection::TokenDisabled);
    }

    if let Some(expired_at) = record.expires_at.filter(|_| record.is_expired_at(now)) {
        return Err(Rejection::TokenExpired { expired_at });
    }

    if !domain_matches(&record.domain, requesting_domain) {
        return Err(Rejection::DomainMismatch {
            domain: requesting_domain.to_string(),
        });
    }

    Ok(())
}

/// Resolves token values into records
#[derive(Clone)]
pub struct TokenValidator {
    store: Arc<dyn TokenStore>,
    log: Arc<dyn ConnectionLog>,
    lookup_timeout: Duration,
    usage_timeout: Duration,
}

impl TokenValidator {
    pub fn new(store: Arc<dyn TokenStore>, log: Arc<dyn ConnectionLog>) -> Self {
        Self {
            store,
            log,
            lookup_timeout: Duration::from_secs(5),
            usage_timeout: Duration::from_secs(5),
        }
    }

    /// Bound the store round-trips
    pub fn with_timeouts(mut self, lookup: Duration, usage: Duration) -> Self {
        self.lookup_timeout = lookup;
        self.usage_timeout = usage;
        self
    }

    /// Validate a token value for a caller
    pub async fn validate(
        &self,
        value: &str,
        client: &ClientInfo,
    ) -> Result<Arc<TokenRecord>, Rejection> {
        match self.resolve(value, client).await {
            Ok(record) => {
                debug!(
                    token_id = %record.id,
                    token = %token_prefix(value),
                    address = %client.address,
                    endpoint = %client.endpoint,
                    "Token validated"
                );

                self.append_log(
                    ConnectionEvent::new(ConnectionEventKind::Authenticate, client, true)
                        .with_token_id(record.id.clone())
                        .with_token_value(value),
                );
                self.spawn_usage_increment(record.id.clone());

                Ok(Arc::new(record))
            }
            Err(rejection) => {
                warn!(
                    token = %token_prefix(value),
                    address = %client.address,
                    domain = %client.domain,
                    endpoint = %client.endpoint,
                    reason = %rejection.code(),
                    "Token rejected"
                );

                self.append_log(
                    ConnectionEvent::new(ConnectionEventKind::Authenticate, client, false)
                        .with_token_value(value)
                        .with_reason(rejection.code().as_str()),
                );

                Err(rejection)
            }
        }
    }

    async fn resolve(&self, value: &str, client: &ClientInfo) -> Result<TokenRecord, Rejection> {
        let lookup = tokio::time::timeout(self.lookup_timeout, self.store.lookup(value)).await;

        let record = match lookup {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => return Err(Rejection::TokenNotFound),
            Ok(Err(e)) => return Err(Rejection::StoreUnavailable(e.to_string())),
            Err(_) => {
                return Err(Rejection::StoreUnavailable(format!(
                    "lookup timed out after {:?}",
                    self.lookup_timeout
                )))
            }
        };

        check_record(&record, &client.domain, Utc::now())?;
        Ok(record)
    }

    /// Append to the connection log without waiting for it
    pub fn append_log(&self, event: ConnectionEvent) {
        let log = self.log.clone();
        tokio::spawn(async move {
            if let Err(e) = log.append(event).await {
                warn!(error = %e, "Failed to append connection log event");
            }
        });
    }

    fn spawn_usage_increment(&self, token_id: String) {
        let store = self.store.clone();
        let timeout = self.usage_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.record_usage(&token_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(token_id = %token_id, error = %e, "Failed to record token usage"),
                Err(_) => warn!(token_id = %token_id, "Recording token usage timed out"),
            }
        });
    }
}
