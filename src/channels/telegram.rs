//! Telegram channel adapter.
//!
//! Long-polls the Bot API for updates, gates them through the allow-list
//! and the token bucket, and publishes `IncomingMessage` envelopes.
//! Outbound, it reassembles the per-task token stream into one live-edited
//! message and renders confirmation prompts with inline confirm/reject
//! controls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::bus::{
    Bus, BusItem, ChannelKind, Envelope, IncomingMessage, KvStore, Payload,
    TOPIC_CONFIRMATION_REQUEST, TOPIC_INCOMING, TOPIC_OUTGOING_REPLY, TOPIC_STREAM_TOKEN,
};
use crate::channels::format::{
    chunk_text, markdown_to_html, sanitize_incoming, strip_think_blocks, TEXT_CHUNK_LIMIT,
};
use crate::channels::stream::{StreamAction, StreamAssembler};
use crate::config::ConfigHandle;
use crate::error::ChannelError;
use crate::mcp::confirmations::{ConfirmationOutcome, ConfirmationStore};
use crate::mcp::endpoints::EndpointRegistry;
use crate::ratelimit::RateLimiter;

const TELEGRAM_API: &str = "https://api.telegram.org/bot";

/// Maximum characters accepted from one incoming message.
const MAX_INCOMING_CHARS: usize = 4000;

const CONFIRM_PREFIX: &str = "confirm:";
const REJECT_PREFIX: &str = "reject:";

const STREAM_FAILURE_TEXT: &str = "Internal error. Please try again later.";

// --- Bot API payloads (the minimum the adapter contract needs) ---

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Thin Bot API client.
struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    fn new(token: &SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{TELEGRAM_API}{}", token.expose_secret()),
        }
    }

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ChannelError> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[("offset", offset.to_string()), ("timeout", timeout_secs.to_string())])
            .timeout(Duration::from_secs(timeout_secs + 15))
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        let parsed: UpdatesResponse =
            response.json().await.map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        if !parsed.ok {
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "getUpdates returned ok=false".into(),
            });
        }
        Ok(parsed.result)
    }

    /// Send an HTML message; returns the new message id.
    async fn send_message(
        &self,
        chat_id: &str,
        html: &str,
        reply_to: Option<i64>,
        reply_markup: Option<Value>,
    ) -> Option<i64> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": if html.is_empty() { "…" } else { html },
            "parse_mode": "HTML",
        });
        if let Some(id) = reply_to {
            body["reply_to_message_id"] = json!(id);
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }
        match self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .timeout(Duration::from_secs(15))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => match resp.json::<SendMessageResponse>().await {
                Ok(parsed) if parsed.ok => parsed.result.map(|m| m.message_id),
                Ok(_) => {
                    tracing::warn!("sendMessage rejected");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sendMessage parse failed");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "sendMessage failed");
                None
            }
        }
    }

    async fn edit_message(&self, chat_id: &str, message_id: i64, html: &str, clear_markup: bool) {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": if html.is_empty() { "…" } else { html },
            "parse_mode": "HTML",
        });
        if clear_markup {
            body["reply_markup"] = json!({ "inline_keyboard": [] });
        }
        if let Err(e) = self
            .client
            .post(format!("{}/editMessageText", self.base_url))
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await
        {
            tracing::debug!(error = %e, "editMessageText failed");
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) {
        let body = json!({ "callback_query_id": callback_id, "text": text });
        if let Err(e) = self
            .client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await
        {
            tracing::debug!(error = %e, "answerCallbackQuery failed");
        }
    }

    async fn send_typing(&self, chat_id: &str) {
        let body = json!({ "chat_id": chat_id, "action": "typing" });
        let _ = self
            .client
            .post(format!("{}/sendChatAction", self.base_url))
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await;
    }
}

struct StreamState {
    assembler: StreamAssembler,
    message_id: Option<i64>,
    chat_id: String,
}

pub struct TelegramAdapter {
    api: TelegramApi,
    bus: Arc<dyn Bus>,
    kv: Arc<dyn KvStore>,
    config: ConfigHandle,
    confirmations: Arc<ConfirmationStore>,
    endpoints: Arc<EndpointRegistry>,
    limiter: Arc<RateLimiter>,
    allowed: RwLock<HashSet<i64>>,
    streams: Mutex<HashMap<String, StreamState>>,
}

impl TelegramAdapter {
    pub async fn new(
        bus: Arc<dyn Bus>,
        kv: Arc<dyn KvStore>,
        config: ConfigHandle,
        confirmations: Arc<ConfirmationStore>,
        endpoints: Arc<EndpointRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ChannelError> {
        let snapshot = config.get().await;
        let token = snapshot
            .telegram
            .bot_token
            .as_ref()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: "bot token is not configured".into(),
            })?;
        let allowed: HashSet<i64> = snapshot.telegram.allowed_user_ids.iter().copied().collect();
        Ok(Self {
            api: TelegramApi::new(token),
            bus,
            kv,
            config,
            confirmations,
            endpoints,
            limiter,
            allowed: RwLock::new(allowed),
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Run all adapter loops until the bus closes.
    pub async fn run(self: Arc<Self>) {
        let poll = {
            let this = self.clone();
            tokio::spawn(async move { this.poll_loop().await })
        };
        let stream = {
            let this = self.clone();
            tokio::spawn(async move { this.stream_loop().await })
        };
        let reply = {
            let this = self.clone();
            tokio::spawn(async move { this.reply_loop().await })
        };
        let prompts = {
            let this = self.clone();
            tokio::spawn(async move { this.confirmation_prompt_loop().await })
        };
        let _ = tokio::join!(poll, stream, reply, prompts);
    }

    // --- Ingress ---

    async fn poll_loop(&self) {
        let mut offset = 0i64;
        loop {
            let snapshot = self.config.get().await;
            let updates = match self
                .api
                .get_updates(offset, snapshot.telegram.long_poll_timeout_secs)
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!(error = %e, "getUpdates failed, retry in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Some(cq) = update.callback_query {
                    self.handle_callback(cq).await;
                    continue;
                }
                if let Some(msg) = update.message {
                    self.handle_message(msg).await;
                }
            }
        }
    }

    async fn handle_callback(&self, cq: CallbackQuery) {
        let data = cq.data.unwrap_or_default();
        if !self.is_allowed(cq.from.id).await {
            self.api.answer_callback(&cq.id, "Access denied.").await;
            return;
        }
        let (correlation_id, outcome, ack) = if let Some(id) = data.strip_prefix(CONFIRM_PREFIX) {
            (id.to_string(), ConfirmationOutcome::Confirmed, "Confirmed.")
        } else if let Some(id) = data.strip_prefix(REJECT_PREFIX) {
            (id.to_string(), ConfirmationOutcome::Rejected, "Rejected.")
        } else {
            self.api.answer_callback(&cq.id, "").await;
            return;
        };
        match self
            .confirmations
            .resolve(&correlation_id, outcome, None)
            .await
        {
            Ok(Some(record)) => {
                self.api.answer_callback(&cq.id, ack).await;
                if let Some(message) = cq.message {
                    let verdict = if outcome == ConfirmationOutcome::Confirmed {
                        "✅ <b>Confirmed</b>"
                    } else {
                        "❌ <b>Rejected</b>"
                    };
                    let html = format!("{}\n\n{}", markdown_to_html(&record.prompt), verdict);
                    self.api
                        .edit_message(&message.chat.id.to_string(), message.message_id, &html, true)
                        .await;
                }
            }
            Ok(None) => {
                // Already resolved or expired; late clicks are ignored.
                self.api.answer_callback(&cq.id, "No active request.").await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "confirmation resolve failed");
                self.api.answer_callback(&cq.id, "").await;
            }
        }
    }

    async fn handle_message(&self, msg: TgMessage) {
        let Some(from) = msg.from.as_ref() else {
            return;
        };
        let user_id = from.id;
        let chat_id = msg.chat.id.to_string();
        let raw_text = msg.text.clone().unwrap_or_default();
        let text = raw_text.trim().to_string();
        let snapshot = self.config.get().await;

        // Pairing handshake admits new users when enabled.
        if text == "/start" || text == "/pair" {
            if snapshot.telegram.pairing_mode {
                self.admit_user(user_id).await;
                self.api
                    .send_message(&chat_id, "Paired. Your ID is now allowed.", None, None)
                    .await;
            } else {
                self.api
                    .send_message(&chat_id, "Hello! Send a message to begin.", None, None)
                    .await;
            }
            return;
        }
        if !self.is_allowed(user_id).await {
            tracing::debug!(user_id, "user not in allow-list");
            return;
        }
        if !self.limiter.acquire(&user_id.to_string()).await.unwrap_or(false) {
            // RateLimited: drop the event after telling the user once.
            self.api
                .send_message(&chat_id, "Rate limit exceeded. Try again later.", None, None)
                .await;
            return;
        }

        // A pending confirmation swallows the next plain-text reply.
        match self
            .confirmations
            .resolve_pending_for_chat(&chat_id, &text)
            .await
        {
            Ok(Some(_)) => {
                self.api.send_message(&chat_id, "Accepted.", None, None).await;
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "pending confirmation check failed"),
        }

        // Developer feedback feeds the tenant queue for this chat.
        if let Some(feedback) = text.strip_prefix("/dev ") {
            let endpoint_id = self
                .endpoints
                .endpoint_for_chat(&chat_id)
                .await
                .ok()
                .flatten();
            match endpoint_id {
                Some(endpoint_id) => {
                    if let Err(e) = self
                        .confirmations
                        .push_feedback(&endpoint_id, &chat_id, feedback.trim())
                        .await
                    {
                        tracing::warn!(error = %e, "feedback push failed");
                    }
                    self.api
                        .send_message(&chat_id, "Passed to the agent.", None, None)
                        .await;
                }
                None => {
                    self.api
                        .send_message(&chat_id, "No agent endpoint is bound to this chat.", None, None)
                        .await;
                }
            }
            return;
        }

        let mut text = text;
        let reasoning = text.contains("/reasoning");
        if reasoning {
            text = text.replace("/reasoning", "").trim().to_string();
        }
        let text = sanitize_incoming(&text, MAX_INCOMING_CHARS);
        if text.is_empty() {
            return;
        }

        self.api.send_typing(&chat_id).await;
        let envelope = Envelope::broadcast(
            ChannelKind::Telegram,
            Payload::IncomingMessage(IncomingMessage {
                message_id: msg.message_id.to_string(),
                user_id: user_id.to_string(),
                chat_id,
                text,
                reasoning_requested: reasoning,
                reply_to: None,
                extra: Map::new(),
            }),
        );
        if let Err(e) = self.bus.publish(TOPIC_INCOMING, envelope).await {
            tracing::error!(error = %e, "incoming publish failed");
        }
    }

    async fn is_allowed(&self, user_id: i64) -> bool {
        let allowed = self.allowed.read().await;
        allowed.is_empty() || allowed.contains(&user_id)
    }

    /// Add a user to the allow-list and persist it through the KV config
    /// layer so a restart keeps the pairing.
    async fn admit_user(&self, user_id: i64) {
        let mut allowed = self.allowed.write().await;
        if !allowed.insert(user_id) {
            return;
        }
        let joined = allowed
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        drop(allowed);
        if let Err(e) = self
            .kv
            .set("config:telegram.allowed_user_ids", &joined)
            .await
        {
            tracing::warn!(error = %e, "failed to persist allow-list");
        }
        if let Err(e) = self.config.reload_hot(self.kv.as_ref()).await {
            tracing::warn!(error = %e, "hot reload failed");
        }
    }

    // --- Egress: stream reassembly ---

    async fn stream_loop(&self) {
        let mut sub = self.bus.subscribe(TOPIC_STREAM_TOKEN).await;
        while let Some(item) = sub.recv().await {
            match item {
                BusItem::Event(env) => {
                    if env.channel != ChannelKind::Telegram {
                        continue;
                    }
                    let task_id = env.task_id.clone();
                    if let Payload::StreamToken(token) = env.payload {
                        let interrupted = token
                            .extra
                            .get("interrupted")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        let action = {
                            let mut streams = self.streams.lock().await;
                            if token.done && !streams.contains_key(&task_id) {
                                // A lone final token: the task already
                                // finalized through the reply path.
                                continue;
                            }
                            let state =
                                streams.entry(task_id.clone()).or_insert_with(|| StreamState {
                                    assembler: StreamAssembler::new(),
                                    message_id: None,
                                    chat_id: token.chat_id.clone(),
                                });
                            state.assembler.feed_token(
                                env.seq,
                                &token.token,
                                token.done,
                                interrupted,
                                Instant::now(),
                            )
                        };
                        self.apply_stream_action(&task_id, action).await;
                    }
                }
                BusItem::Gap { skipped } => {
                    tracing::warn!(skipped, "stream subscription lagged");
                    self.fail_open_streams().await;
                }
            }
        }
    }

    async fn reply_loop(&self) {
        let mut sub = self.bus.subscribe(TOPIC_OUTGOING_REPLY).await;
        while let Some(item) = sub.recv().await {
            match item {
                BusItem::Event(env) => {
                    if env.channel != ChannelKind::Telegram {
                        continue;
                    }
                    let task_id = env.task_id.clone();
                    if let Payload::OutgoingReply(reply) = env.payload {
                        self.handle_reply(&task_id, reply).await;
                    }
                }
                BusItem::Gap { skipped } => {
                    tracing::warn!(skipped, "reply subscription lagged");
                    self.fail_open_streams().await;
                }
            }
        }
    }

    async fn handle_reply(&self, task_id: &str, reply: crate::bus::OutgoingReply) {
        let visible = strip_think_blocks(&reply.text);
        let streaming_action = if !task_id.is_empty() {
            let mut streams = self.streams.lock().await;
            streams
                .get_mut(task_id)
                .map(|state| state.assembler.feed_reply(&visible))
        } else {
            None
        };
        match streaming_action {
            Some(action) => {
                // The reply is the last word on a streamed task.
                self.apply_stream_action(task_id, action).await;
                self.streams.lock().await.remove(task_id);
            }
            None => {
                // Not a streamed task (MCP notify, advisory): plain send.
                let reply_to = reply
                    .message_id
                    .as_deref()
                    .and_then(|id| id.parse::<i64>().ok())
                    .filter(|id| *id > 0);
                let markup = reply.extra.get("reply_markup").cloned();
                let chunks = chunk_text(&visible, TEXT_CHUNK_LIMIT);
                let last = chunks.len().saturating_sub(1);
                for (i, chunk) in chunks.iter().enumerate() {
                    self.api
                        .send_message(
                            &reply.chat_id,
                            &markdown_to_html(chunk),
                            if i == 0 { reply_to } else { None },
                            if i == last { markup.clone() } else { None },
                        )
                        .await;
                }
            }
        }
    }

    /// Render an action. Finalized state stays registered until the
    /// `OutgoingReply` final sync consumes it (the second finalize is then
    /// a no-op edit).
    async fn apply_stream_action(&self, task_id: &str, action: StreamAction) {
        match action {
            StreamAction::None => {}
            StreamAction::Render(text) => {
                self.render_stream(task_id, &text, false).await;
            }
            StreamAction::Finalize(text) => {
                self.render_stream(task_id, &text, true).await;
            }
            StreamAction::Fail => {
                self.render_stream(task_id, STREAM_FAILURE_TEXT, true).await;
            }
        }
    }

    async fn render_stream(&self, task_id: &str, text: &str, fin: bool) {
        let visible = strip_think_blocks(text);
        let mut shown = visible.clone();
        if shown.chars().count() > TEXT_CHUNK_LIMIT {
            // Live edits stay in one message; overflow is chunked only at
            // the end.
            if !fin {
                shown = shown.chars().take(TEXT_CHUNK_LIMIT - 3).collect::<String>() + "...";
            }
        }
        let (chat_id, message_id) = {
            let streams = self.streams.lock().await;
            match streams.get(task_id) {
                Some(state) => (state.chat_id.clone(), state.message_id),
                None => return,
            }
        };
        if fin && shown.chars().count() > TEXT_CHUNK_LIMIT {
            // Final text over the cap: edit the live message with the first
            // segment, send the rest as fresh messages.
            let chunks = chunk_text(&shown, TEXT_CHUNK_LIMIT);
            for (i, chunk) in chunks.iter().enumerate() {
                let html = markdown_to_html(chunk);
                if i == 0 {
                    if let Some(id) = message_id {
                        self.api.edit_message(&chat_id, id, &html, false).await;
                    } else {
                        self.api.send_message(&chat_id, &html, None, None).await;
                    }
                } else {
                    self.api.send_message(&chat_id, &html, None, None).await;
                }
            }
            return;
        }
        let html = markdown_to_html(&shown);
        match message_id {
            Some(id) => self.api.edit_message(&chat_id, id, &html, false).await,
            None => {
                if let Some(new_id) = self.api.send_message(&chat_id, &html, None, None).await {
                    if let Some(state) = self.streams.lock().await.get_mut(task_id) {
                        state.message_id = Some(new_id);
                    }
                }
            }
        }
    }

    async fn fail_open_streams(&self) {
        let task_ids: Vec<String> = {
            let mut streams = self.streams.lock().await;
            streams
                .iter_mut()
                .filter_map(|(id, state)| {
                    if state.assembler.transport_gap() == StreamAction::Fail {
                        Some(id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for task_id in task_ids {
            // State stays registered; the owner's failure reply (same
            // text) lands as a no-op and cleans it up.
            self.render_stream(&task_id, STREAM_FAILURE_TEXT, true).await;
        }
    }

    // --- Egress: confirmation prompts ---

    async fn confirmation_prompt_loop(&self) {
        let mut sub = self.bus.subscribe(TOPIC_CONFIRMATION_REQUEST).await;
        while let Some(item) = sub.recv().await {
            let BusItem::Event(env) = item else {
                continue;
            };
            if let Payload::ConfirmationRequest(request) = env.payload {
                let markup = json!({
                    "inline_keyboard": [[
                        { "text": "✅ Confirm", "callback_data": format!("{CONFIRM_PREFIX}{}", request.correlation_id) },
                        { "text": "❌ Reject", "callback_data": format!("{REJECT_PREFIX}{}", request.correlation_id) },
                    ]]
                });
                let html = markdown_to_html(&request.message);
                self.api
                    .send_message(&request.chat_id, &html, None, Some(markup))
                    .await;
            }
        }
    }
}
