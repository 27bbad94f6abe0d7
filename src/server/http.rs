//! Token-scoped REST API
//!
//! Every `/api` route runs behind [`require_token`], which validates the
//! caller's token, applies the per-token rate limit and stamps the
//! `X-RateLimit-*` headers on the response.

use crate::auth::{normalize_domain, ClientInfo, RateLimitPolicy, TokenRecord};
use crate::error::Rejection;
use crate::ratelimit::RateDecision;
use crate::server::session;
use crate::server::transport::AppState;

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{
        header::{AUTHORIZATION, HOST, ORIGIN, REFERER, RETRY_AFTER, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATE_LIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// Token query parameter, accepted where a bearer header cannot be set
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// The validated token behind an API request
#[derive(Debug, Clone)]
pub struct AuthenticatedToken(pub Arc<TokenRecord>);

/// Create the REST router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/token", get(token_info))
        .route("/api/channels", get(channels))
        .route("/api/publish/{channel}", post(publish))
        .route("/api/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::trim)
}

/// Presented token value: bearer header first, then the `token` query parameter
pub(crate) fn presented_token<'a>(headers: &'a HeaderMap, query: &'a TokenQuery) -> Option<&'a str> {
    bearer_token(headers)
        .or(query.token.as_deref())
        .filter(|t| !t.is_empty())
}

/// Describe the caller from its socket address and request headers
///
/// The requesting domain comes from `Origin`, then `Referer`, then `Host`.
pub(crate) fn client_info(headers: &HeaderMap, address: Option<SocketAddr>, endpoint: &str) -> ClientInfo {
    let address = address.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());

    let domain = [ORIGIN, REFERER, HOST]
        .iter()
        .filter_map(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .map(normalize_domain)
        .find(|d| !d.is_empty())
        .unwrap_or_default();

    let mut client = ClientInfo::new(address, endpoint).with_domain(domain);
    if let Some(user_agent) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        client = client.with_user_agent(user_agent);
    }
    client
}

/// Validate the caller's token and apply its rate limit
pub async fn require_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    let address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_info(request.headers(), address, request.uri().path());

    let Some(value) = presented_token(request.headers(), &query).map(str::to_string) else {
        warn!(address = %client.address, endpoint = %client.endpoint, "API request without token");
        return Rejection::AuthenticationRequired.into_response();
    };

    let record = match state.validator.validate(&value, &client).await {
        Ok(record) => record,
        Err(rejection) => return rejection.into_response(),
    };

    match state.rate_limiter.check(&record.id, &record.rate_limit) {
        RateDecision::Limited { retry_after_secs, .. } => {
            warn!(
                token_id = %record.id,
                endpoint = %client.endpoint,
                retry_after_secs,
                "API rate limit exceeded"
            );
            let mut response = Rejection::RateLimited { retry_after_secs }.into_response();
            apply_rate_limit_headers(
                response.headers_mut(),
                &record.rate_limit,
                0,
                Duration::from_secs(retry_after_secs),
            );
            response
        }
        RateDecision::Allowed { remaining, reset_after, .. } => {
            debug!(token_id = %record.id, endpoint = %client.endpoint, remaining, "API request admitted");
            let policy = record.rate_limit;
            request.extensions_mut().insert(AuthenticatedToken(record));

            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &policy, remaining, reset_after);
            response
        }
    }
}

fn apply_rate_limit_headers(
    headers: &mut HeaderMap,
    policy: &RateLimitPolicy,
    remaining: u32,
    reset_after: Duration,
) {
    let reset_at = Utc::now().timestamp() + reset_after.as_secs() as i64;
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(policy.requests_per_window));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_at));
    headers.insert(RATE_LIMIT_WINDOW, HeaderValue::from(policy.window_secs));
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        match &self {
            Rejection::RateLimited { retry_after_secs } => {
                body["retryAfterSeconds"] = json!(retry_after_secs);
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                response
            }
            Rejection::DuplicateToken {
                existing_connected_at,
                existing_address,
            } => {
                body["existingConnectedAt"] = json!(existing_connected_at);
                body["existingAddress"] = json!(existing_address);
                (status, Json(body)).into_response()
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenSummary {
    #[serde(flatten)]
    record: TokenRecord,
    live_connections: usize,
}

async fn token_info(
    State(state): State<AppState>,
    Extension(AuthenticatedToken(record)): Extension<AuthenticatedToken>,
) -> Json<TokenSummary> {
    Json(TokenSummary {
        live_connections: state.registry.connections_for_token(&record.id).len(),
        record: (*record).clone(),
    })
}

async fn channels(
    State(state): State<AppState>,
    Extension(AuthenticatedToken(record)): Extension<AuthenticatedToken>,
) -> Json<serde_json::Value> {
    Json(json!({
        "channels": state.authorizer.accessible_channels(Some(&*record), &state.topology),
    }))
}

async fn publish(
    State(state): State<AppState>,
    Extension(AuthenticatedToken(record)): Extension<AuthenticatedToken>,
    Path(channel): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, Rejection> {
    let delivered = session::publish_from_client(&state, Some(&*record), &channel, payload)?;
    Ok(Json(json!({
        "channel": channel,
        "delivered": delivered,
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    connections: usize,
    subscribers: BTreeMap<String, usize>,
    rate_limited_tokens: usize,
}

async fn stats(
    State(state): State<AppState>,
    Extension(AuthenticatedToken(record)): Extension<AuthenticatedToken>,
) -> Result<Json<Stats>, Rejection> {
    if !record.is_admin() {
        return Err(Rejection::CommandNotAuthorized {
            command: "stats".to_string(),
        });
    }

    Ok(Json(Stats {
        connections: state.registry.count(),
        subscribers: state.registry.channel_counts(),
        rate_limited_tokens: state.rate_limiter.tracked(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presented_token_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer pb_header"));
        let query = TokenQuery {
            token: Some("pb_query".to_string()),
        };
        assert_eq!(presented_token(&headers, &query), Some("pb_header"));

        let empty = HeaderMap::new();
        assert_eq!(presented_token(&empty, &query), Some("pb_query"));
        assert_eq!(presented_token(&empty, &TokenQuery::default()), None);
    }

    #[test]
    fn test_client_info_domain_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("api.example.com:8080"));
        let client = client_info(&headers, None, "/api/token");
        assert_eq!(client.domain, "api.example.com");
        assert_eq!(client.address, "unknown");

        headers.insert(REFERER, HeaderValue::from_static("https://shop.example.com/page"));
        assert_eq!(client_info(&headers, None, "/").domain, "shop.example.com");

        headers.insert(ORIGIN, HeaderValue::from_static("https://app.example.com"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));
        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let client = client_info(&headers, Some(addr), "/");
        assert_eq!(client.domain, "app.example.com");
        assert_eq!(client.address, "10.1.2.3:5555");
        assert_eq!(client.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn test_rate_limited_response() {
        let response = Rejection::RateLimited { retry_after_secs: 8 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "8");
    }
}
