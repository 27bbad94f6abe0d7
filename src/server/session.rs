//! Real-time session lifecycle
//!
//! Transport-independent handling of one client connection: admission,
//! inbound message dispatch, publishing and teardown.

use crate::auth::{ClientInfo, TokenRecord};
use crate::channels::SYSTEM;
use crate::error::Rejection;
use crate::server::connections::LiveConnection;
use crate::server::transport::{
    AppState, BroadcastEvent, ClientMessage, OutboundMessage, ServerMessage, SystemCommand,
};
use crate::storage::{ConnectionEvent, ConnectionEventKind};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Authenticate and admit a new connection
///
/// On success the `welcome` message is already queued on the returned
/// receiver.
pub async fn open(
    state: &AppState,
    token: Option<&str>,
    client: &ClientInfo,
) -> Result<(Arc<LiveConnection>, mpsc::Receiver<OutboundMessage>), Rejection> {
    let record = match token.filter(|t| !t.is_empty()) {
        Some(value) => Some(state.validator.validate(value, client).await?),
        None if state.config.allow_anonymous => None,
        None => {
            warn!(address = %client.address, "Anonymous connection refused");
            state.validator.append_log(
                ConnectionEvent::new(ConnectionEventKind::Authenticate, client, false)
                    .with_reason(Rejection::AuthenticationRequired.code().as_str()),
            );
            return Err(Rejection::AuthenticationRequired);
        }
    };

    let token_id = record.as_ref().map(|r| r.id.clone());
    let (conn, rx) = match state.registry.admit(record, client) {
        Ok(admitted) => admitted,
        Err(rejection) => {
            let mut event = ConnectionEvent::new(ConnectionEventKind::DuplicateRejected, client, false)
                .with_reason(rejection.code().as_str());
            if let Some(id) = token_id {
                event = event.with_token_id(id);
            }
            if let Rejection::DuplicateToken { existing_address, existing_connected_at } = &rejection {
                event = event.with_metadata(json!({
                    "existingAddress": existing_address,
                    "existingConnectedAt": existing_connected_at,
                }));
            }
            state.validator.append_log(event);
            return Err(rejection);
        }
    };

    let mut event = ConnectionEvent::new(ConnectionEventKind::Connect, client, true)
        .with_metadata(json!({ "connectionId": conn.id }));
    if let Some(id) = conn.token_id() {
        event = event.with_token_id(id);
    }
    state.validator.append_log(event);

    let token = conn.token_record();
    reply(
        &conn,
        ServerMessage::Welcome {
            connection_id: conn.id,
            authenticated: token.is_some(),
            token_name: token.map(|t| t.name.clone()),
            permissions: token.map(TokenRecord::permission_names).unwrap_or_default(),
            channels: state.authorizer.accessible_channels(token, &state.topology),
        },
    );

    Ok((conn, rx))
}

/// Parse and dispatch one inbound text frame
pub fn handle_text(state: &AppState, conn: &Arc<LiveConnection>, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_client_message(state, conn, msg),
        Err(e) => {
            debug!(conn_id = %conn.id, error = %e, "Invalid client message");
            conn.touch();
            reply(conn, ServerMessage::error(&Rejection::InvalidMessage(e.to_string()), None));
        }
    }
}

/// Dispatch one inbound message
pub fn handle_client_message(state: &AppState, conn: &Arc<LiveConnection>, msg: ClientMessage) {
    conn.touch();

    match msg {
        ClientMessage::Subscribe { channel, filters } => {
            match authorize_subscription(state, conn, &channel) {
                Ok(()) => {
                    state.registry.subscribe(conn.id, &channel);
                    debug!(conn_id = %conn.id, channel = %channel, "Subscribed");
                    reply(conn, ServerMessage::SubscriptionSuccess { channel, filters });
                }
                Err(rejection) => {
                    warn!(
                        conn_id = %conn.id,
                        token_id = conn.token_id().unwrap_or("-"),
                        channel = %channel,
                        reason = %rejection.code(),
                        "Subscription refused"
                    );
                    reply(conn, ServerMessage::subscription_error(&channel, &rejection));
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            state.registry.unsubscribe(conn.id, &channel);
            debug!(conn_id = %conn.id, channel = %channel, "Unsubscribed");
            reply(conn, ServerMessage::UnsubscriptionSuccess { channel });
        }
        ClientMessage::Ping { seq } => {
            reply(conn, ServerMessage::pong(seq));
        }
        ClientMessage::Message { channel, payload } => {
            match publish_from_client(state, conn.token_record(), &channel, payload) {
                Ok(delivered) => reply(conn, ServerMessage::PublishSuccess { channel, delivered }),
                Err(rejection) => {
                    warn!(
                        conn_id = %conn.id,
                        token_id = conn.token_id().unwrap_or("-"),
                        channel = %channel,
                        reason = %rejection.code(),
                        "Publish refused"
                    );
                    reply(conn, ServerMessage::error(&rejection, Some(channel.as_str())));
                }
            }
        }
    }
}

fn authorize_subscription(state: &AppState, conn: &LiveConnection, channel: &str) -> Result<(), Rejection> {
    if !state.topology.contains(channel) {
        return Err(Rejection::UnknownChannel {
            channel: channel.to_string(),
        });
    }
    state.authorizer.authorize_subscribe(conn.token_record(), channel)
}

/// Authorize and publish a client-originated payload
///
/// Shared by the real-time `message` and the REST publish endpoint.
pub fn publish_from_client(
    state: &AppState,
    token: Option<&TokenRecord>,
    channel: &str,
    payload: serde_json::Value,
) -> Result<usize, Rejection> {
    if !state.topology.contains(channel) {
        return Err(Rejection::UnknownChannel {
            channel: channel.to_string(),
        });
    }

    let event = if channel == SYSTEM {
        let command = payload
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| Rejection::InvalidMessage("system messages require a command".to_string()))?;
        if !SystemCommand::NAMES.contains(&command) {
            return Err(Rejection::InvalidMessage(format!("unknown system command '{}'", command)));
        }

        state.authorizer.authorize_command(token, command)?;

        let command: SystemCommand = serde_json::from_value(payload)
            .map_err(|e| Rejection::InvalidMessage(e.to_string()))?;
        info!(
            token_id = token.map(|t| t.id.as_str()).unwrap_or("-"),
            command = command.name(),
            "System command issued"
        );
        BroadcastEvent::System(command)
    } else {
        state.authorizer.authorize_publish(token, channel)?;

        match serde_json::from_value::<BroadcastEvent>(payload.clone()) {
            Ok(BroadcastEvent::System(_)) => {
                return Err(Rejection::InvalidMessage(format!(
                    "system commands must be sent on the '{}' channel",
                    SYSTEM
                )))
            }
            Ok(event) => {
                // The source tag fans out to a second channel; the token needs that one too
                if let Some(derived) = event
                    .source()
                    .and_then(|source| state.topology.source_channel(source))
                    .filter(|derived| *derived != channel)
                {
                    state.authorizer.authorize_publish(token, derived)?;
                }
                event
            }
            Err(_) => BroadcastEvent::Message {
                from: token.map(|t| t.name.clone()),
                payload,
            },
        }
    };

    state.broadcaster.publish(channel, event)
}

/// Deregister a connection and record the disconnect
///
/// Safe to call more than once.
pub fn close(state: &AppState, conn: &LiveConnection) {
    if state.registry.remove(conn.id).is_none() {
        return;
    }

    let mut client = ClientInfo::new(conn.address.clone(), "/ws").with_domain(conn.domain.clone());
    if let Some(user_agent) = &conn.user_agent {
        client = client.with_user_agent(user_agent.clone());
    }

    let mut event = ConnectionEvent::new(ConnectionEventKind::Disconnect, &client, true)
        .with_metadata(json!({
            "connectionId": conn.id,
            "connectedAt": conn.connected_at,
            "subscriptions": conn.subscriptions(),
        }));
    if let Some(id) = conn.token_id() {
        event = event.with_token_id(id);
    }
    state.validator.append_log(event);

    info!(conn_id = %conn.id, token_id = conn.token_id().unwrap_or("-"), "Client disconnected");
}

fn reply(conn: &LiveConnection, msg: ServerMessage) {
    if let Err(e) = conn.send(msg) {
        debug!(conn_id = %conn.id, error = %e, "Failed to queue reply");
    }
}
