//! Token records and credential handling
//!
//! Token values look like `pb_<43 chars>` and are never stored in the clear:
//! stores key records by the SHA-256 of the value. Only the first few
//! characters of a value ever reach the logs (see [`token_prefix`]).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::channels::{self, ChannelError, WILDCARD};

/// Prefix of generated token values
pub const TOKEN_PREFIX: &str = "pb_";

/// Number of characters of a token value that may appear in logs
const LOG_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid permission '{0}': must be read, write, admin or system_control")]
    InvalidPermission(String),

    #[error("invalid rate limit '{0}': expected <requests>/<seconds> with both non-zero")]
    InvalidRateLimit(String),

    #[error("invalid channel: {0}")]
    InvalidChannel(#[from] ChannelError),
}

/// Capability tags carried by a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Receive events
    Read,
    /// Publish events on data channels
    Write,
    /// Full access, including system commands
    Admin,
    /// Issue system commands without other admin rights
    SystemControl,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
            Permission::SystemControl => "system_control",
        }
    }
}

impl FromStr for Permission {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            "system_control" | "system-control" => Ok(Permission::SystemControl),
            _ => Err(TokenError::InvalidPermission(s.to_string())),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request quota for REST calls made with a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub requests_per_window: u32,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub const DEFAULT_REQUESTS: u32 = 100;
    pub const DEFAULT_WINDOW_SECS: u64 = 60;

    pub fn new(requests_per_window: u32, window_secs: u64) -> Result<Self, TokenError> {
        if requests_per_window == 0 || window_secs == 0 {
            return Err(TokenError::InvalidRateLimit(format!(
                "{}/{}",
                requests_per_window, window_secs
            )));
        }
        Ok(Self {
            requests_per_window,
            window_secs,
        })
    }

    /// Parse `<requests>/<seconds>`, e.g. `100/60`
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        let invalid = || TokenError::InvalidRateLimit(s.to_string());
        let (requests, window) = s.split_once('/').ok_or_else(invalid)?;
        let requests = requests.trim().parse().map_err(|_| invalid())?;
        let window = window.trim().parse().map_err(|_| invalid())?;
        Self::new(requests, window).map_err(|_| invalid())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_window: Self::DEFAULT_REQUESTS,
            window_secs: Self::DEFAULT_WINDOW_SECS,
        }
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.requests_per_window, self.window_secs)
    }
}

/// Identity and policy bound to a credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub id: String,
    pub name: String,
    /// SHA-256 of the token value
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    /// `*`, a host name, or a substring pattern
    pub domain: String,
    pub permissions: BTreeSet<Permission>,
    /// Channel names this token may subscribe to; `*` grants all
    pub allowed_channels: BTreeSet<String>,
    pub rate_limit: RateLimitPolicy,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub allow_multiple_connections: bool,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Start building a record for the given token value
    pub fn builder(value: &str) -> TokenRecordBuilder {
        TokenRecordBuilder::new(value)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has_permission(Permission::Admin)
    }

    /// May publish on data channels
    pub fn can_publish(&self) -> bool {
        self.has_permission(Permission::Write) || self.is_admin()
    }

    /// May issue `system` channel commands
    pub fn can_control_system(&self) -> bool {
        self.is_admin() || self.has_permission(Permission::SystemControl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn allows_all_channels(&self) -> bool {
        self.allowed_channels.contains(WILDCARD)
    }

    pub fn permission_names(&self) -> Vec<String> {
        self.permissions.iter().map(|p| p.to_string()).collect()
    }
}

/// Builder applying the record defaults in one place
///
/// Defaults: domain `*`, permissions `{read}`, channels `{price, system}`,
/// 100 requests per 60 seconds, active, never expires, one connection.
#[derive(Debug, Clone)]
pub struct TokenRecordBuilder {
    record: TokenRecord,
}

impl TokenRecordBuilder {
    fn new(value: &str) -> Self {
        Self {
            record: TokenRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: String::new(),
                token_hash: hash_token_value(value),
                domain: WILDCARD.to_string(),
                permissions: BTreeSet::from([Permission::Read]),
                allowed_channels: BTreeSet::from([
                    channels::PRICE.to_string(),
                    channels::SYSTEM.to_string(),
                ]),
                rate_limit: RateLimitPolicy::default(),
                is_active: true,
                expires_at: None,
                usage_count: 0,
                last_used_at: None,
                allow_multiple_connections: false,
                created_at: Utc::now(),
            },
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.record.id = id.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.record.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.record.domain = domain.into();
        self
    }

    /// Replace the permission set
    pub fn permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.record.permissions = permissions.into_iter().collect();
        self
    }

    /// Replace the channel allow-list
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record.allowed_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.record.rate_limit = rate_limit;
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.record.is_active = is_active;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.record.expires_at = Some(expires_at);
        self
    }

    pub fn allow_multiple_connections(mut self, allow: bool) -> Self {
        self.record.allow_multiple_connections = allow;
        self
    }

    pub fn build(self) -> TokenRecord {
        self.record
    }
}

/// Generate a fresh random token value
pub fn generate_token_value() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// Stable lookup key for a token value
pub fn hash_token_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Redacted form of a token value, safe to log
///
/// At most half of a short value is kept.
pub fn token_prefix(value: &str) -> String {
    let keep = LOG_PREFIX_LEN.min(value.chars().count() / 2);
    let prefix: String = value.chars().take(keep).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let record = TokenRecord::builder("pb_secret").name("dashboard").build();

        assert_eq!(record.name, "dashboard");
        assert_eq!(record.domain, "*");
        assert!(record.has_permission(Permission::Read));
        assert!(!record.can_publish());
        assert!(record.allowed_channels.contains("price"));
        assert!(record.allowed_channels.contains("system"));
        assert_eq!(record.rate_limit, RateLimitPolicy::default());
        assert!(record.is_active);
        assert!(!record.allow_multiple_connections);
        assert_eq!(record.token_hash, hash_token_value("pb_secret"));
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!("READ".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!(
            "system_control".parse::<Permission>().unwrap(),
            Permission::SystemControl
        );
        assert!("root".parse::<Permission>().is_err());
    }

    #[test]
    fn test_system_control_permissions() {
        let admin = TokenRecord::builder("a").permissions([Permission::Admin]).build();
        let operator = TokenRecord::builder("b")
            .permissions([Permission::SystemControl])
            .build();
        let reader = TokenRecord::builder("c").build();

        assert!(admin.can_control_system());
        assert!(admin.can_publish());
        assert!(operator.can_control_system());
        assert!(!operator.can_publish());
        assert!(!reader.can_control_system());
    }

    #[test]
    fn test_rate_limit_parse() {
        let policy = RateLimitPolicy::parse("3/10").unwrap();
        assert_eq!(policy.requests_per_window, 3);
        assert_eq!(policy.window(), Duration::from_secs(10));

        assert!(RateLimitPolicy::parse("0/10").is_err());
        assert!(RateLimitPolicy::parse("10").is_err());
        assert!(RateLimitPolicy::parse("a/b").is_err());
    }

    #[test]
    fn test_generated_values_are_unique_and_prefixed() {
        let a = generate_token_value();
        let b = generate_token_value();
        assert!(a.starts_with(TOKEN_PREFIX));
        assert_ne!(a, b);
        assert_ne!(hash_token_value(&a), hash_token_value(&b));
    }

    #[test]
    fn test_token_prefix_redacts() {
        let value = "pb_abcdefghijklmnop";
        let redacted = token_prefix(value);
        assert_eq!(redacted, "pb_abcde…");
        assert!(!redacted.contains("ijklmnop"));

        assert_eq!(token_prefix("pb_nope"), "pb_…");
        assert_eq!(token_prefix("pb_12345"), "pb_1…");
        assert_eq!(token_prefix(""), "…");
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let expired = TokenRecord::builder("x")
            .expires_at(now - chrono::Duration::seconds(1))
            .build();
        let fresh = TokenRecord::builder("y")
            .expires_at(now + chrono::Duration::hours(1))
            .build();

        assert!(expired.is_expired_at(now));
        assert!(!fresh.is_expired_at(now));
        assert!(!TokenRecord::builder("z").build().is_expired_at(now));
    }
}
