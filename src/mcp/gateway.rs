//! Multi-tenant MCP gateway: authenticated HTTP per endpoint, SSE event
//! fan-out, and a JSON-RPC face over the same operations.
//!
//! Every tenant route requires `Authorization: Bearer <secret>`. A failed
//! check answers 401 with no body hint and delays repeat offenders.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::audit;
use crate::bus::{
    mcp_events_topic, Bus, BusItem, ChannelKind, Envelope, OutgoingReply, Payload,
    TOPIC_CONFIRMATION_RESULT, TOPIC_OUTGOING_REPLY,
};
use crate::error::{ChannelError, GatewayError};
use crate::mcp::confirmations::{ConfirmationStore, DEFAULT_TIMEOUT};
use crate::mcp::endpoints::{EndpointRegistry, McpEndpoint};
use crate::mcp::protocol::{
    tool_definitions, ContentBlock, McpRequest, McpResponse, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::ratelimit::RateLimiter;

/// SSE keepalive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Failed-auth window; counters reset after this much quiet.
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Per-failure delay step, capped.
const AUTH_DELAY_STEP: Duration = Duration::from_millis(250);
const AUTH_DELAY_MAX: Duration = Duration::from_secs(2);

struct FailureBucket {
    count: u32,
    window_start: Instant,
}

pub struct GatewayState {
    pub bus: Arc<dyn Bus>,
    pub endpoints: Arc<EndpointRegistry>,
    pub confirmations: Arc<ConfirmationStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub admin_token: Option<SecretString>,
    auth_failures: Mutex<HashMap<String, FailureBucket>>,
}

impl GatewayState {
    pub fn new(
        bus: Arc<dyn Bus>,
        endpoints: Arc<EndpointRegistry>,
        confirmations: Arc<ConfirmationStore>,
        rate_limiter: Arc<RateLimiter>,
        admin_token: Option<SecretString>,
    ) -> Self {
        Self {
            bus,
            endpoints,
            confirmations,
            rate_limiter,
            admin_token,
            auth_failures: Mutex::new(HashMap::new()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            // No hint about which half of the credential failed.
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            GatewayError::UnknownEndpoint => StatusCode::NOT_FOUND.into_response(),
            GatewayError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            GatewayError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS.into_response(),
            GatewayError::BusUnavailable(e) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Authenticate a tenant request; throttles brute force by delaying after
/// repeated failures from the same endpoint id.
async fn authorize(
    state: &GatewayState,
    endpoint_id: &str,
    headers: &HeaderMap,
) -> Result<McpEndpoint, GatewayError> {
    let token = bearer_token(headers);
    let verified = match token {
        Some(token) => state.endpoints.verify(endpoint_id, token).await?,
        None => None,
    };
    if let Some(endpoint) = verified {
        return Ok(endpoint);
    }

    let delay = {
        let mut failures = state.auth_failures.lock().await;
        let bucket = failures
            .entry(endpoint_id.to_string())
            .or_insert(FailureBucket {
                count: 0,
                window_start: Instant::now(),
            });
        if bucket.window_start.elapsed() > AUTH_FAILURE_WINDOW {
            bucket.count = 0;
            bucket.window_start = Instant::now();
        }
        bucket.count += 1;
        (AUTH_DELAY_STEP * bucket.count).min(AUTH_DELAY_MAX)
    };
    audit::audit(
        &format!("mcp:{endpoint_id}"),
        "mcp.auth_failure",
        &Value::Null,
        "unauthorized",
        Duration::ZERO,
    );
    tokio::time::sleep(delay).await;
    Err(GatewayError::Unauthorized)
}

async fn check_rate(state: &GatewayState, endpoint_id: &str) -> Result<(), GatewayError> {
    let admitted = state
        .rate_limiter
        .acquire(&format!("mcp:{endpoint_id}"))
        .await?;
    if admitted {
        Ok(())
    } else {
        Err(GatewayError::RateLimited)
    }
}

async fn deliver_to_chat(
    state: &GatewayState,
    endpoint: &McpEndpoint,
    text: &str,
) -> Result<(), GatewayError> {
    let env = Envelope::broadcast(
        ChannelKind::Telegram,
        Payload::OutgoingReply(OutgoingReply {
            chat_id: endpoint.chat_id.clone(),
            message_id: None,
            text: text.to_string(),
            done: true,
            extra: Map::new(),
        }),
    );
    state.bus.publish(TOPIC_OUTGOING_REPLY, env).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ConfirmationBody {
    message: String,
    #[serde(default)]
    timeout_sec: Option<u64>,
}

async fn notify_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<Response, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    check_rate(&state, &endpoint_id).await?;
    if body.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("message is empty".into()));
    }
    deliver_to_chat(&state, &endpoint, &body.message).await?;
    audit::audit(
        &format!("mcp:{endpoint_id}"),
        "mcp.notify",
        &json!({ "len": body.message.len() }),
        "ok",
        Duration::ZERO,
    );
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn question_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<Response, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    check_rate(&state, &endpoint_id).await?;
    if body.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("message is empty".into()));
    }
    // Advisory: delivered like a notification, no correlation is created.
    deliver_to_chat(&state, &endpoint, &body.message).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn confirmation_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConfirmationBody>,
) -> Result<Response, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    check_rate(&state, &endpoint_id).await?;
    if body.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("message is empty".into()));
    }
    let timeout = body
        .timeout_sec
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    let record = state
        .confirmations
        .create(&endpoint.id, &endpoint.chat_id, &body.message, timeout)
        .await?;
    audit::audit(
        &format!("mcp:{endpoint_id}"),
        "confirm.request",
        &json!({ "correlation_id": record.id }),
        "ok",
        Duration::ZERO,
    );
    Ok((
        StatusCode::OK,
        Json(json!({
            "correlation_id": record.id,
            "deadline_ts": record.deadline_ts,
        })),
    )
        .into_response())
}

async fn replies_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    let replies = state.confirmations.drain_replies(&endpoint.id).await?;
    Ok((StatusCode::OK, Json(json!({ "replies": replies }))).into_response())
}

/// Shape one bus envelope as an SSE event.
fn sse_event(envelope: &Envelope) -> Option<Event> {
    match &envelope.payload {
        Payload::ConfirmationResult(result) => {
            let data = json!({
                "correlation_id": result.correlation_id,
                "outcome": result.outcome,
                "confirmed": result.outcome == "confirmed",
                "rejected": result.outcome == "rejected",
                "timeout": result.outcome == "timeout",
                "reply": result.reply,
            });
            Some(Event::default().event("confirmation").data(data.to_string()))
        }
        Payload::FeedbackMessage(feedback) => {
            let data = json!({ "text": feedback.text });
            Some(Event::default().event("feedback").data(data.to_string()))
        }
        _ => None,
    }
}

async fn events_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    let sub = state.bus.subscribe(&mcp_events_topic(&endpoint.id)).await;
    let stream = futures::stream::unfold(sub, |mut sub| async move {
        loop {
            match sub.recv().await {
                Some(BusItem::Event(env)) => {
                    if let Some(event) = sse_event(&env) {
                        return Some((Ok(event), sub));
                    }
                }
                // Lag only costs live events; /replies bridges the gap.
                Some(BusItem::Gap { .. }) => continue,
                None => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

// --- JSON-RPC face ---

async fn jsonrpc_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<McpRequest>,
) -> Result<Response, GatewayError> {
    let endpoint = authorize(&state, &endpoint_id, &headers).await?;
    let id = request.id.clone().unwrap_or(Value::Null);
    let response = match request.method.as_str() {
        "initialize" => McpResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "adjutant-mcp",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => McpResponse::result(id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            match tools_call(&state, &endpoint, name, arguments).await {
                Ok(content) => McpResponse::result(id, json!({ "content": content })),
                Err(ToolsCallError::BadParams(msg)) => McpResponse::error(id, INVALID_PARAMS, msg),
                Err(ToolsCallError::Unknown(name)) => {
                    McpResponse::error(id, METHOD_NOT_FOUND, format!("unknown tool: {name}"))
                }
                Err(ToolsCallError::Internal(msg)) => McpResponse::error(id, INTERNAL_ERROR, msg),
            }
        }
        other => McpResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

enum ToolsCallError {
    BadParams(String),
    Unknown(String),
    Internal(String),
}

async fn tools_call(
    state: &GatewayState,
    endpoint: &McpEndpoint,
    name: &str,
    arguments: Value,
) -> Result<Vec<ContentBlock>, ToolsCallError> {
    match name {
        "notify" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if message.is_empty() {
                return Err(ToolsCallError::BadParams("message is empty".into()));
            }
            deliver_to_chat(state, endpoint, &message)
                .await
                .map_err(|e| ToolsCallError::Internal(e.to_string()))?;
            Ok(vec![ContentBlock::text("Sent.")])
        }
        "ask_confirmation" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if message.is_empty() {
                return Err(ToolsCallError::BadParams("message is empty".into()));
            }
            let timeout = arguments
                .get("timeout_sec")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT);
            // Subscribe before creating so the resolution cannot slip past.
            let mut sub = state.bus.subscribe(TOPIC_CONFIRMATION_RESULT).await;
            let record = state
                .confirmations
                .create(&endpoint.id, &endpoint.chat_id, &message, timeout)
                .await
                .map_err(|e| ToolsCallError::Internal(e.to_string()))?;
            let deadline = tokio::time::Instant::now() + timeout + Duration::from_secs(5);
            let outcome = loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break json!({ "confirmed": false, "timeout": true, "reply": "" });
                }
                match tokio::time::timeout(remaining, sub.recv()).await {
                    Ok(Some(BusItem::Event(env))) => {
                        if let Payload::ConfirmationResult(result) = env.payload {
                            if result.correlation_id == record.id {
                                break json!({
                                    "confirmed": result.outcome == "confirmed",
                                    "rejected": result.outcome == "rejected",
                                    "timeout": result.outcome == "timeout",
                                    "reply": result.reply.unwrap_or_default(),
                                });
                            }
                        }
                    }
                    Ok(Some(BusItem::Gap { .. })) => continue,
                    Ok(None) | Err(_) => {
                        break json!({ "confirmed": false, "timeout": true, "reply": "" })
                    }
                }
            };
            Ok(vec![ContentBlock::text(outcome.to_string())])
        }
        "get_user_feedback" => {
            let replies = state
                .confirmations
                .drain_replies(&endpoint.id)
                .await
                .map_err(|e| ToolsCallError::Internal(e.to_string()))?;
            Ok(vec![ContentBlock::text(
                serde_json::to_string(&replies).unwrap_or_else(|_| "[]".into()),
            )])
        }
        other => Err(ToolsCallError::Unknown(other.to_string())),
    }
}

// --- Administrative surface ---

#[derive(Debug, Deserialize)]
struct CreateEndpointBody {
    name: String,
    chat_id: String,
}

fn check_admin(state: &GatewayState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let expected = state
        .admin_token
        .as_ref()
        .ok_or_else(|| GatewayError::BadRequest("admin surface disabled".into()))?;
    match bearer_token(headers) {
        Some(token) if constant_time_token_eq(token, expected.expose_secret()) => Ok(()),
        _ => Err(GatewayError::Unauthorized),
    }
}

fn constant_time_token_eq(a: &str, b: &str) -> bool {
    use sha2::{Digest, Sha256};
    // Hashing first makes the comparison length-independent.
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn admin_create_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateEndpointBody>,
) -> Result<Response, GatewayError> {
    check_admin(&state, &headers)?;
    if body.name.trim().is_empty() || body.chat_id.trim().is_empty() {
        return Err(GatewayError::BadRequest("name and chat_id are required".into()));
    }
    let (endpoint, secret) = state.endpoints.create(&body.name, &body.chat_id).await?;
    audit::audit(
        "admin",
        "mcp.endpoint_created",
        &json!({ "endpoint_id": endpoint.id }),
        "ok",
        Duration::ZERO,
    );
    // The plain secret appears exactly once, here.
    Ok((
        StatusCode::OK,
        Json(json!({ "endpoint_id": endpoint.id, "secret": secret })),
    )
        .into_response())
}

async fn admin_list_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    check_admin(&state, &headers)?;
    let endpoints: Vec<Value> = state
        .endpoints
        .list()
        .await?
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "name": e.name,
                "chat_id": e.chat_id,
                "created_at": e.created_at,
                "revoked": e.revoked,
            })
        })
        .collect();
    Ok((StatusCode::OK, Json(json!({ "endpoints": endpoints }))).into_response())
}

async fn admin_revoke_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    check_admin(&state, &headers)?;
    if state.endpoints.revoke(&endpoint_id).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Err(GatewayError::UnknownEndpoint)
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/mcp/v1/agent/{endpoint_id}", post(jsonrpc_handler))
        .route("/mcp/v1/agent/{endpoint_id}/notify", post(notify_handler))
        .route(
            "/mcp/v1/agent/{endpoint_id}/question",
            post(question_handler),
        )
        .route(
            "/mcp/v1/agent/{endpoint_id}/confirmation",
            post(confirmation_handler),
        )
        .route("/mcp/v1/agent/{endpoint_id}/replies", get(replies_handler))
        .route("/mcp/v1/agent/{endpoint_id}/events", get(events_handler))
        .route(
            "/mcp/v1/admin/endpoints",
            post(admin_create_handler).get(admin_list_handler),
        )
        .route(
            "/mcp/v1/admin/endpoints/{endpoint_id}",
            axum::routing::delete(admin_revoke_handler),
        )
        .with_state(state)
}

/// Bind and serve the gateway. Returns the bound address (useful with
/// port 0).
pub async fn serve(
    state: Arc<GatewayState>,
    addr: SocketAddr,
) -> Result<SocketAddr, ChannelError> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "mcp-gateway".to_string(),
                reason: format!("failed to bind {addr}: {e}"),
            })?;
    let bound = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "mcp-gateway".to_string(),
            reason: e.to_string(),
        })?;
    let app = router(state);
    tokio::spawn(async move {
        tracing::info!("mcp gateway listening on {bound}");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "mcp gateway stopped");
        }
    });
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parse() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer s3cret".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("s3cret"));
        headers.insert(axum::http::header::AUTHORIZATION, "Basic x".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn sse_event_mapping() {
        let env = Envelope::broadcast(
            ChannelKind::Telegram,
            Payload::ConfirmationResult(crate::bus::ConfirmationResult {
                endpoint_id: "e1".into(),
                correlation_id: "c1".into(),
                outcome: "confirmed".into(),
                reply: None,
                extra: Map::new(),
            }),
        );
        let event = sse_event(&env);
        assert!(event.is_some());
    }

    #[test]
    fn token_eq_is_exact() {
        assert!(constant_time_token_eq("abc", "abc"));
        assert!(!constant_time_token_eq("abc", "abd"));
        assert!(!constant_time_token_eq("abc", "abcd"));
    }
}
