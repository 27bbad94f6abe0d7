//! WebSocket transport
//!
//! One socket per real-time session. The token is presented at upgrade time
//! via `Authorization: Bearer` or the `token` query parameter; everything
//! after admission is JSON text frames.

use crate::server::http::{client_info, presented_token, TokenQuery};
use crate::server::session;
use crate::server::transport::{AppState, ServerMessage};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Create the WebSocket router
pub fn create_router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = presented_token(&headers, &query).map(str::to_string);
    let client = client_info(&headers, Some(addr), "/ws");
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, client))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            None
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    token: Option<String>,
    client: crate::auth::ClientInfo,
) {
    let (mut sender, mut receiver) = socket.split();

    let (conn, mut rx) = match session::open(&state, token.as_deref(), &client).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            info!(address = %client.address, reason = %rejection.code(), "WebSocket connection rejected");
            if let Some(msg) = encode(&ServerMessage::rejected(&rejection)) {
                let _ = sender.send(msg).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let conn_id = conn.id;
    info!(conn_id = %conn_id, address = %conn.address, "WebSocket client connected");

    // Forward outbound messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(frame) = encode(&msg) else { continue };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = conn.closed() => {
                debug!(conn_id = %conn_id, "Connection closed by server");
                break;
            }
            msg_result = receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => session::handle_text(&state, &conn, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => session::handle_text(&state, &conn, text),
                        Err(_) => debug!(conn_id = %conn_id, "Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Handled automatically by axum
                        conn.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    session::close(&state, &conn);
    send_task.abort();
}
