//! Pricebus - token-authenticated real-time channel broadcasting
//!
//! Admits WebSocket clients bound to access tokens, enforces single-connection
//! and channel policy, rate-limits token-scoped REST calls, and fans price
//! updates, alerts and operator commands out to authorized subscribers.

pub mod auth;
pub mod channels;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod storage;

pub use auth::{ChannelAuthorizer, ClientInfo, Permission, RateLimitPolicy, TokenRecord, TokenValidator};
pub use channels::ChannelTopology;
pub use config::PricebusConfig;
pub use error::{ErrorCode, Rejection};
pub use ratelimit::{RateDecision, RateLimiter};
pub use server::{Broadcaster, BroadcastEvent, ConnectionRegistry, PricebusServer};
