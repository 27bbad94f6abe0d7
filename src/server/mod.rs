//! Pricebus server implementation
//!
//! Handles WebSocket sessions, the token-scoped REST API, admission control
//! and channel fan-out.

mod connections;
pub mod http;
mod router;
pub mod session;
pub mod transport;
pub mod websocket;

pub use connections::{ConnectionId, ConnectionRegistry, DeliveryError, LiveConnection};
pub use http::AuthenticatedToken;
pub use router::Broadcaster;
pub use transport::{
    create_router, spawn_idle_reaper, AppState, BroadcastEvent, ClientMessage, OutboundMessage,
    PricebusServer, ServerMessage, SystemCommand,
};
