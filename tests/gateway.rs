//! MCP gateway tests over a real listener: auth, confirmation correlation,
//! the replies bridge, SSE events, and the JSON-RPC face.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use secrecy::SecretString;
use serde_json::{json, Value};

use adjutant::bus::{Bus, KvStore, MemoryBus};
use adjutant::mcp::{
    confirmations::ConfirmationOutcome, ConfirmationStore, EndpointRegistry, GatewayState,
};
use adjutant::ratelimit::RateLimiter;

struct Gateway {
    base: String,
    secret: String,
    endpoint_id: String,
    confirmations: Arc<ConfirmationStore>,
    endpoints: Arc<EndpointRegistry>,
    client: reqwest::Client,
}

async fn start_gateway(capacity: f64) -> Gateway {
    let fabric = Arc::new(MemoryBus::new());
    let bus: Arc<dyn Bus> = fabric.clone();
    let kv: Arc<dyn KvStore> = fabric.clone();

    let endpoints = Arc::new(EndpointRegistry::new(kv.clone()));
    let confirmations = Arc::new(ConfirmationStore::new(kv.clone(), bus.clone()));
    let limiter = Arc::new(RateLimiter::new(kv.clone(), capacity, 0.0));
    let (endpoint, secret) = endpoints.create("cursor", "100").await.unwrap();

    let state = Arc::new(GatewayState::new(
        bus,
        endpoints.clone(),
        confirmations.clone(),
        limiter,
        Some(SecretString::from("admin-token".to_string())),
    ));
    let addr = adjutant::mcp::serve(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    Gateway {
        base: format!("http://{addr}/mcp/v1"),
        secret,
        endpoint_id: endpoint.id,
        confirmations,
        endpoints,
        client: reqwest::Client::new(),
    }
}

impl Gateway {
    fn agent_url(&self, tail: &str) -> String {
        format!("{}/agent/{}{}", self.base, self.endpoint_id, tail)
    }
}

#[tokio::test]
async fn bad_auth_is_401_without_a_hint() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(g.agent_url("/notify"))
        .bearer_auth("wrong-secret")
        .json(&json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(resp.text().await.unwrap().is_empty());

    // Missing header entirely.
    let resp = g
        .client
        .post(g.agent_url("/notify"))
        .json(&json!({ "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn notify_accepts_and_rate_limits() {
    let g = start_gateway(2.0).await;
    for _ in 0..2 {
        let resp = g
            .client
            .post(g.agent_url("/notify"))
            .bearer_auth(&g.secret)
            .json(&json!({ "message": "ping" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
    }
    let resp = g
        .client
        .post(g.agent_url("/notify"))
        .bearer_auth(&g.secret)
        .json(&json!({ "message": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn empty_message_is_400() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(g.agent_url("/notify"))
        .bearer_auth(&g.secret)
        .json(&json!({ "message": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn confirmation_confirmed_flows_to_events_and_record() {
    let g = start_gateway(100.0).await;

    // Attach the SSE listener before anything happens.
    let events_url = g.agent_url("/events");
    let secret = g.secret.clone();
    let client = g.client.clone();
    let sse = tokio::spawn(async move {
        let resp = client
            .get(events_url)
            .bearer_auth(secret)
            .send()
            .await
            .unwrap();
        let mut body = String::new();
        let mut stream = Box::pin(resp.bytes_stream());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    body.push_str(&String::from_utf8_lossy(&chunk));
                    if body.contains("event: confirmation") && body.contains("\n\n") {
                        break;
                    }
                }
                _ => break,
            }
        }
        body
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = g
        .client
        .post(g.agent_url("/confirmation"))
        .bearer_auth(&g.secret)
        .json(&json!({ "message": "deploy?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let correlation_id = body["correlation_id"].as_str().unwrap().to_string();

    // The user clicks confirm (channel adapter callback path).
    let resolved = g
        .confirmations
        .resolve(&correlation_id, ConfirmationOutcome::Confirmed, None)
        .await
        .unwrap();
    assert!(resolved.is_some());

    let record = g.confirmations.get(&correlation_id).await.unwrap().unwrap();
    assert_eq!(record.outcome, ConfirmationOutcome::Confirmed);

    let sse_body = sse.await.unwrap();
    assert!(sse_body.contains("event: confirmation"), "sse body: {sse_body}");
    assert!(sse_body.contains("\"confirmed\":true"), "sse body: {sse_body}");
}

#[tokio::test]
async fn confirmation_timeout_is_swept_and_late_clicks_ignored() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(g.agent_url("/confirmation"))
        .bearer_auth(&g.secret)
        .json(&json!({ "message": "deploy?", "timeout_sec": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let correlation_id = body["correlation_id"].as_str().unwrap().to_string();

    let swept = g.confirmations.sweep().await.unwrap();
    assert_eq!(swept, 1);
    let record = g.confirmations.get(&correlation_id).await.unwrap().unwrap();
    assert_eq!(record.outcome, ConfirmationOutcome::Timeout);

    // A late click must not flip the resolved record.
    let late = g
        .confirmations
        .resolve(&correlation_id, ConfirmationOutcome::Confirmed, None)
        .await
        .unwrap();
    assert!(late.is_none());
    let record = g.confirmations.get(&correlation_id).await.unwrap().unwrap();
    assert_eq!(record.outcome, ConfirmationOutcome::Timeout);
}

#[tokio::test]
async fn replies_drains_resolutions_and_feedback_once() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(g.agent_url("/confirmation"))
        .bearer_auth(&g.secret)
        .json(&json!({ "message": "ok?" }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let correlation_id = body["correlation_id"].as_str().unwrap().to_string();
    g.confirmations
        .resolve(&correlation_id, ConfirmationOutcome::Rejected, None)
        .await
        .unwrap();
    g.confirmations
        .push_feedback(&g.endpoint_id, "100", "try smaller steps")
        .await
        .unwrap();

    let resp = g
        .client
        .get(g.agent_url("/replies"))
        .bearer_auth(&g.secret)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let replies = body["replies"].as_array().unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["type"], "confirmation");
    assert_eq!(replies[0]["outcome"], "rejected");
    assert_eq!(replies[1]["type"], "feedback");

    // The drain is atomic: a second read is empty.
    let resp = g
        .client
        .get(g.agent_url("/replies"))
        .bearer_auth(&g.secret)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["replies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn jsonrpc_face_lists_and_calls_tools() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(g.agent_url(""))
        .bearer_auth(&g.secret)
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["notify", "ask_confirmation", "get_user_feedback"]);

    let resp = g
        .client
        .post(g.agent_url(""))
        .bearer_auth(&g.secret)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "notify", "arguments": { "message": "hello" } },
        }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "Sent.");

    let resp = g
        .client
        .post(g.agent_url(""))
        .bearer_auth(&g.secret)
        .json(&json!({ "jsonrpc": "2.0", "id": 3, "method": "nope" }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn admin_surface_creates_lists_and_revokes() {
    let g = start_gateway(100.0).await;
    let resp = g
        .client
        .post(format!("{}/admin/endpoints", g.base))
        .bearer_auth("admin-token")
        .json(&json!({ "name": "other", "chat_id": "200" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let new_id = body["endpoint_id"].as_str().unwrap().to_string();
    assert!(!body["secret"].as_str().unwrap().is_empty());

    let resp = g
        .client
        .get(format!("{}/admin/endpoints", g.base))
        .bearer_auth("admin-token")
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["endpoints"].as_array().unwrap().len(), 2);
    // The stored hash never leaves the registry.
    assert!(!body.to_string().contains("secret_hash"));

    let resp = g
        .client
        .delete(format!("{}/admin/endpoints/{new_id}", g.base))
        .bearer_auth("admin-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(g.endpoints.get(&new_id).await.unwrap().unwrap().revoked);

    // Wrong admin token.
    let resp = g
        .client
        .get(format!("{}/admin/endpoints", g.base))
        .bearer_auth("not-admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
