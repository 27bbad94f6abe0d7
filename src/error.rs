//! Rejection taxonomy shared by the real-time and REST surfaces
//!
//! Every rejection carries a machine-readable code (see [`Rejection::code`])
//! and a human-readable message (its `Display` impl).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable rejection codes sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationRequired,
    TokenNotFound,
    TokenDisabled,
    TokenExpired,
    DomainMismatch,
    StoreUnavailable,
    DuplicateToken,
    ChannelNotAuthorized,
    UnknownChannel,
    CommandNotAuthorized,
    RateLimited,
    InvalidMessage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            ErrorCode::TokenNotFound => "TOKEN_NOT_FOUND",
            ErrorCode::TokenDisabled => "TOKEN_DISABLED",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::DomainMismatch => "DOMAIN_MISMATCH",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::DuplicateToken => "DUPLICATE_TOKEN",
            ErrorCode::ChannelNotAuthorized => "CHANNEL_NOT_AUTHORIZED",
            ErrorCode::UnknownChannel => "UNKNOWN_CHANNEL",
            ErrorCode::CommandNotAuthorized => "COMMAND_NOT_AUTHORIZED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an action was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("a token is required for this endpoint")]
    AuthenticationRequired,

    #[error("token not found")]
    TokenNotFound,

    #[error("token has been disabled")]
    TokenDisabled,

    #[error("token expired at {expired_at}")]
    TokenExpired { expired_at: DateTime<Utc> },

    #[error("token is not valid for domain '{domain}'")]
    DomainMismatch { domain: String },

    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("token already has an active connection since {existing_connected_at} from {existing_address}")]
    DuplicateToken {
        existing_connected_at: DateTime<Utc>,
        existing_address: String,
    },

    #[error("not authorized for channel '{channel}'")]
    ChannelNotAuthorized { channel: String },

    #[error("unknown channel '{channel}'")]
    UnknownChannel { channel: String },

    #[error("not authorized to issue system command '{command}'")]
    CommandNotAuthorized { command: String },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Rejection::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            Rejection::TokenNotFound => ErrorCode::TokenNotFound,
            Rejection::TokenDisabled => ErrorCode::TokenDisabled,
            Rejection::TokenExpired { .. } => ErrorCode::TokenExpired,
            Rejection::DomainMismatch { .. } => ErrorCode::DomainMismatch,
            Rejection::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Rejection::DuplicateToken { .. } => ErrorCode::DuplicateToken,
            Rejection::ChannelNotAuthorized { .. } => ErrorCode::ChannelNotAuthorized,
            Rejection::UnknownChannel { .. } => ErrorCode::UnknownChannel,
            Rejection::CommandNotAuthorized { .. } => ErrorCode::CommandNotAuthorized,
            Rejection::RateLimited { .. } => ErrorCode::RateLimited,
            Rejection::InvalidMessage(_) => ErrorCode::InvalidMessage,
        }
    }

    /// Authentication failures refuse the connection or request outright
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Rejection::AuthenticationRequired
                | Rejection::TokenNotFound
                | Rejection::TokenDisabled
                | Rejection::TokenExpired { .. }
                | Rejection::DomainMismatch { .. }
                | Rejection::StoreUnavailable(_)
        )
    }

    /// HTTP status code for the REST surface
    pub fn http_status(&self) -> u16 {
        match self {
            Rejection::AuthenticationRequired
            | Rejection::TokenNotFound
            | Rejection::TokenDisabled
            | Rejection::TokenExpired { .. } => 401,
            Rejection::DomainMismatch { .. }
            | Rejection::ChannelNotAuthorized { .. }
            | Rejection::CommandNotAuthorized { .. } => 403,
            Rejection::UnknownChannel { .. } => 404,
            Rejection::DuplicateToken { .. } => 409,
            Rejection::RateLimited { .. } => 429,
            Rejection::InvalidMessage(_) => 400,
            Rejection::StoreUnavailable(_) => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::DuplicateToken).unwrap();
        assert_eq!(json, "\"DUPLICATE_TOKEN\"");
        assert_eq!(ErrorCode::RateLimited.to_string(), "RATE_LIMITED");
    }

    #[test]
    fn test_rejection_classification() {
        assert!(Rejection::TokenDisabled.is_authentication_failure());
        assert!(!Rejection::RateLimited { retry_after_secs: 3 }.is_authentication_failure());
        assert_eq!(Rejection::RateLimited { retry_after_secs: 3 }.http_status(), 429);
        assert_eq!(
            Rejection::ChannelNotAuthorized { channel: "alerts".into() }.code(),
            ErrorCode::ChannelNotAuthorized
        );
    }
}
