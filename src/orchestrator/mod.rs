//! Orchestrator: the deterministic controller owning a task from ingress
//! to reply.
//!
//! One instance claims each task and drives it through the state machine:
//! model call, optional tool or confirmation round trips, finalize. All
//! lifecycle decisions are made here; the model never controls state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::agent::{parse_reply, AgentReply, AssistantAgent, TaskContext, ToolAgent};
use crate::audit;
use crate::bus::{
    Bus, BusItem, BusSubscription, ChannelKind, Envelope, IncomingMessage, OutgoingReply, Payload,
    StreamToken, ToolRequest, ToolResult, TOPIC_CONFIRMATION_RESULT, TOPIC_INCOMING,
    TOPIC_OUTGOING_REPLY, TOPIC_RESTART_REQUESTED, TOPIC_STREAM_TOKEN, TOPIC_TOOL_REQUEST,
    TOPIC_TOOL_RESULT,
};
use crate::config::ConfigHandle;
use crate::error::{BusError, ModelError, TaskError};
use crate::mcp::confirmations::{ConfirmationOutcome, ConfirmationStore, DEFAULT_TIMEOUT};
use crate::memory::UserMemory;
use crate::tasks::{TaskRecord, TaskStatus, TaskStore};

/// Ownership lease; refreshed between iterations.
const CLAIM_TTL: Duration = Duration::from_secs(60);

/// Backoff schedule for transient model errors.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(8),
];

/// Extra slack on top of a skill's own timeout while waiting for its
/// result envelope.
const TOOL_WAIT_SLACK: Duration = Duration::from_secs(15);

/// Localized, non-technical failure reply. Internal detail goes to the
/// audit log only.
const INTERNAL_ERROR_REPLY: &str = "Internal error. Please try again later.";

const MODEL_UNAVAILABLE_REPLY: &str = "The model is unavailable right now. Please try again later.";

const ITERATION_LIMIT_NOTE: &str = "(iteration limit reached)";

/// Pseudo-skill the model calls to request a user confirmation.
const CONFIRMATION_SKILL: &str = "ask_confirmation";

#[derive(Debug)]
enum DriveError {
    Bus(BusError),
    Task(TaskError),
    Model(ModelError),
    /// Transport signalled data loss while this task was in flight.
    SequenceGap,
}

impl From<BusError> for DriveError {
    fn from(e: BusError) -> Self {
        DriveError::Bus(e)
    }
}

impl From<TaskError> for DriveError {
    fn from(e: TaskError) -> Self {
        DriveError::Task(e)
    }
}

impl From<ModelError> for DriveError {
    fn from(e: ModelError) -> Self {
        DriveError::Model(e)
    }
}

impl std::fmt::Display for DriveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveError::Bus(e) => write!(f, "bus: {e}"),
            DriveError::Task(e) => write!(f, "task store: {e}"),
            DriveError::Model(e) => write!(f, "model: {e}"),
            DriveError::SequenceGap => write!(f, "sequence gap"),
        }
    }
}

/// Publishes all task-bound envelopes with one monotonic `seq` counter, so
/// every consumer filtering by task id observes a strictly increasing
/// sequence.
pub struct TaskPublisher {
    bus: Arc<dyn Bus>,
    task_id: String,
    chat_id: String,
    channel: ChannelKind,
    reply_to: Option<String>,
    seq: u64,
    done_sent: bool,
}

impl TaskPublisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        task_id: impl Into<String>,
        chat_id: impl Into<String>,
        channel: ChannelKind,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            bus,
            task_id: task_id.into(),
            chat_id: chat_id.into(),
            channel,
            reply_to,
            seq: 0,
            done_sent: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Fold in a sequence number another worker used for this task.
    pub fn observe_seq(&mut self, seq: u64) {
        self.seq = self.seq.max(seq);
    }

    /// Publish one stream delta. The token is passed through the secret
    /// redactor before it rides the bus.
    pub async fn token(&mut self, token: &str) -> Result<(), BusError> {
        if self.done_sent {
            return Ok(());
        }
        let seq = self.next_seq();
        let env = Envelope::for_task(
            self.task_id.clone(),
            self.channel,
            seq,
            Payload::StreamToken(StreamToken {
                chat_id: self.chat_id.clone(),
                token: audit::redact_text(token),
                done: false,
                extra: Map::new(),
            }),
        );
        self.bus.publish(TOPIC_STREAM_TOKEN, env).await
    }

    /// Publish the single final stream token for this task.
    pub async fn done(&mut self, interrupted: bool) -> Result<(), BusError> {
        if self.done_sent {
            return Ok(());
        }
        self.done_sent = true;
        let mut extra = Map::new();
        if interrupted {
            extra.insert("interrupted".to_string(), Value::Bool(true));
        }
        let seq = self.next_seq();
        let env = Envelope::for_task(
            self.task_id.clone(),
            self.channel,
            seq,
            Payload::StreamToken(StreamToken {
                chat_id: self.chat_id.clone(),
                token: String::new(),
                done: true,
                extra,
            }),
        );
        self.bus.publish(TOPIC_STREAM_TOKEN, env).await
    }

    /// Publish a tool request; returns the sequence number used.
    pub async fn tool_request(&mut self, name: &str, arguments: Value) -> Result<u64, BusError> {
        let seq = self.next_seq();
        let env = Envelope::for_task(
            self.task_id.clone(),
            self.channel,
            seq,
            Payload::ToolRequest(ToolRequest {
                name: name.to_string(),
                arguments,
                extra: Map::new(),
            }),
        );
        self.bus.publish(TOPIC_TOOL_REQUEST, env).await?;
        Ok(seq)
    }

    /// Publish the final reply (final-sync when a stream already ended).
    pub async fn reply(&mut self, text: &str) -> Result<(), BusError> {
        let seq = self.next_seq();
        let env = Envelope::for_task(
            self.task_id.clone(),
            self.channel,
            seq,
            Payload::OutgoingReply(OutgoingReply {
                chat_id: self.chat_id.clone(),
                message_id: self.reply_to.clone(),
                text: audit::redact_text(text),
                done: true,
                extra: Map::new(),
            }),
        );
        self.bus.publish(TOPIC_OUTGOING_REPLY, env).await
    }
}

pub struct Orchestrator {
    bus: Arc<dyn Bus>,
    tasks: Arc<TaskStore>,
    memory: Arc<UserMemory>,
    assistant: Arc<AssistantAgent>,
    confirmations: Arc<ConfirmationStore>,
    config: ConfigHandle,
    worker_id: String,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn Bus>,
        tasks: Arc<TaskStore>,
        memory: Arc<UserMemory>,
        assistant: Arc<AssistantAgent>,
        confirmations: Arc<ConfirmationStore>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            bus,
            tasks,
            memory,
            assistant,
            confirmations,
            config,
            worker_id: format!("orchestrator-{}", Uuid::new_v4().simple()),
        }
    }

    /// Consume incoming messages until the topic closes.
    pub async fn run(self: Arc<Self>) {
        let mut sub = self.bus.subscribe(TOPIC_INCOMING).await;
        tracing::info!(worker_id = %self.worker_id, "orchestrator started");
        while let Some(item) = sub.recv().await {
            match item {
                BusItem::Event(env) => {
                    let channel = env.channel;
                    if let Payload::IncomingMessage(msg) = env.payload {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.handle_incoming(channel, msg).await;
                        });
                    }
                }
                BusItem::Gap { skipped } => {
                    // Nothing claimed yet for the lost envelopes; the users
                    // will resend.
                    tracing::warn!(skipped, "incoming subscription lagged");
                }
            }
        }
    }

    async fn handle_incoming(&self, channel: ChannelKind, msg: IncomingMessage) {
        let record = TaskRecord::new(&msg.user_id, channel, &msg.chat_id, &msg.message_id);
        let task_id = record.id.clone();
        if let Err(e) = self.tasks.create(&record).await {
            tracing::error!(error = %e, "task create failed");
            return;
        }
        match self.tasks.claim(&task_id, &self.worker_id, CLAIM_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_id, "claim lost, dropping");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "claim failed");
                return;
            }
        }

        let cfg = self.config.get().await;
        let deadline = Duration::from_secs(cfg.orchestrator.task_deadline_secs);
        let mut publisher = TaskPublisher::new(
            self.bus.clone(),
            task_id.clone(),
            msg.chat_id.clone(),
            channel,
            Some(msg.message_id.clone()),
        );
        let outcome =
            tokio::time::timeout(deadline, self.drive(&task_id, &msg, &mut publisher)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(task_id, error = %e, "task failed");
                audit::audit(
                    &format!("user:{}", msg.user_id),
                    "task.failed",
                    &serde_json::json!({ "task_id": task_id, "error": e.to_string() }),
                    "failed",
                    Duration::ZERO,
                );
                let reply = match e {
                    DriveError::Model(_) => MODEL_UNAVAILABLE_REPLY,
                    _ => INTERNAL_ERROR_REPLY,
                };
                self.fail_task(&task_id, &mut publisher, reply).await;
            }
            Err(_) => {
                tracing::warn!(task_id, "task deadline exceeded");
                self.fail_task(&task_id, &mut publisher, INTERNAL_ERROR_REPLY)
                    .await;
            }
        }
    }

    /// The dispatch loop of one claimed task.
    async fn drive(
        &self,
        task_id: &str,
        msg: &IncomingMessage,
        publisher: &mut TaskPublisher,
    ) -> Result<(), DriveError> {
        let cfg = self.config.get().await;
        self.tasks
            .transition(task_id, TaskStatus::Pending, TaskStatus::Running, |_| {})
            .await?;
        self.tasks
            .append_message(task_id, "user", &msg.text)
            .await?;
        self.memory.append(&msg.user_id, "user", &msg.text).await?;

        let memory_blocks = self.memory.context_blocks(&msg.user_id).await?;
        let mut tool_results: Vec<Value> = Vec::new();
        let mut iteration: u32 = 0;
        let max_iterations = cfg.orchestrator.max_iterations.max(1);

        loop {
            iteration += 1;
            self.tasks
                .transition(task_id, TaskStatus::Running, TaskStatus::Running, |rec| {
                    rec.iterations = iteration;
                })
                .await?;
            let _ = self
                .tasks
                .refresh_claim(task_id, &self.worker_id, CLAIM_TTL)
                .await;

            let window = self
                .tasks
                .get(task_id)
                .await?
                .map(|rec| rec.window)
                .unwrap_or_default();
            let ctx = TaskContext {
                task_id: task_id.to_string(),
                user_id: msg.user_id.clone(),
                chat_id: msg.chat_id.clone(),
                channel: publisher.channel,
                text: msg.text.clone(),
                reasoning_requested: msg.reasoning_requested,
                iteration,
                window,
                memory_blocks: memory_blocks.clone(),
                tool_results: tool_results.clone(),
            };

            let (full_text, interrupted) = self.model_turn(&ctx, publisher).await?;
            if interrupted {
                // The buffered partial already went out; close the stream
                // and let the adapter annotate the interruption.
                publisher.done(true).await?;
                return self.finalize(task_id, msg, publisher, &full_text).await;
            }

            match parse_reply(&full_text) {
                AgentReply::Text { body, .. } => {
                    publisher.done(false).await?;
                    return self.finalize(task_id, msg, publisher, &body).await;
                }
                AgentReply::ToolCall {
                    name,
                    arguments,
                    quality,
                } => {
                    if let Some(q) = quality {
                        if q >= f64::from(cfg.orchestrator.quality_threshold) {
                            // The model rates the answer good enough; skip
                            // the requested tool and finalize.
                            publisher.done(false).await?;
                            return self.finalize(task_id, msg, publisher, &full_text).await;
                        }
                    }
                    if !cfg.orchestrator.autonomous_mode {
                        let diagnostic = format!(
                            "Tool request was not executed (autonomous mode is off): {name} {arguments}"
                        );
                        publisher.done(false).await?;
                        return self.finalize(task_id, msg, publisher, &diagnostic).await;
                    }

                    let result_value = if name == CONFIRMATION_SKILL {
                        self.confirmation_round(task_id, msg, &arguments).await?
                    } else {
                        self.tool_round(task_id, publisher, &name, arguments).await?
                    };
                    tool_results.push(result_value.clone());
                    self.tasks
                        .append_message(task_id, "tool", &result_value.to_string())
                        .await?;

                    if iteration >= max_iterations {
                        publisher.done(false).await?;
                        let text = format!("{full_text}\n\n{ITERATION_LIMIT_NOTE}");
                        return self.finalize(task_id, msg, publisher, &text).await;
                    }
                }
            }
        }
    }

    /// One model turn: pull the token stream, republish each delta, return
    /// the accumulated text. Transient setup errors retry on the 500 ms /
    /// 2 s / 8 s schedule.
    async fn model_turn(
        &self,
        ctx: &TaskContext,
        publisher: &mut TaskPublisher,
    ) -> Result<(String, bool), DriveError> {
        let started = std::time::Instant::now();
        let mut attempt = 0usize;
        let mut stream = loop {
            match self.assistant.respond_stream(ctx).await {
                Ok(s) => break s,
                Err(e) if e.is_transient() && attempt < RETRY_DELAYS.len() => {
                    tracing::warn!(error = %e, attempt, "model call failed, retrying");
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let mut full = String::new();
        let mut interrupted = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => {
                    full.push_str(&token);
                    publisher.token(&token).await?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "model stream interrupted");
                    interrupted = true;
                    break;
                }
            }
        }
        audit::audit(
            &format!("user:{}", ctx.user_id),
            "model.generate",
            &serde_json::json!({ "task_id": ctx.task_id, "iteration": ctx.iteration }),
            if interrupted { "interrupted" } else { "ok" },
            started.elapsed(),
        );
        Ok((full, interrupted))
    }

    /// Dispatch one tool request over the bus and wait for its result.
    async fn tool_round(
        &self,
        task_id: &str,
        publisher: &mut TaskPublisher,
        name: &str,
        arguments: Value,
    ) -> Result<Value, DriveError> {
        // Subscribe before publishing so the result cannot slip past.
        let mut sub = self.bus.subscribe(TOPIC_TOOL_RESULT).await;
        self.tasks
            .transition(task_id, TaskStatus::Running, TaskStatus::AwaitingTool, |_| {})
            .await?;
        publisher.tool_request(name, arguments).await?;

        let cfg = self.config.get().await;
        let wait = Duration::from_secs(cfg.sandbox.skill_timeout_secs) + TOOL_WAIT_SLACK;
        let result = self.wait_tool_result(&mut sub, task_id, name, wait, publisher).await?;

        self.tasks
            .transition(task_id, TaskStatus::AwaitingTool, TaskStatus::Running, |_| {})
            .await?;
        Ok(result)
    }

    async fn wait_tool_result(
        &self,
        sub: &mut BusSubscription,
        task_id: &str,
        name: &str,
        wait: Duration,
        publisher: &mut TaskPublisher,
    ) -> Result<Value, DriveError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(tool_result_value(&ToolResult {
                    name: name.to_string(),
                    ok: false,
                    result: Value::Null,
                    error: Some("timeout".to_string()),
                    extra: Map::new(),
                }));
            }
            match sub.recv_timeout(remaining).await {
                Ok(Some(BusItem::Event(env))) => {
                    if env.task_id != task_id {
                        continue;
                    }
                    if let Payload::ToolResult(result) = env.payload {
                        publisher.observe_seq(env.seq);
                        return Ok(tool_result_value(&result));
                    }
                }
                Ok(Some(BusItem::Gap { .. })) => return Err(DriveError::SequenceGap),
                Ok(None) => {
                    return Err(DriveError::Bus(BusError::Closed {
                        topic: TOPIC_TOOL_RESULT.to_string(),
                    }))
                }
                Err(()) => continue,
            }
        }
    }

    /// Confirmation round: create the record, wait for its resolution, and
    /// shape the outcome as a tool result. Timeout counts as rejection and
    /// the loop continues.
    async fn confirmation_round(
        &self,
        task_id: &str,
        msg: &IncomingMessage,
        arguments: &Value,
    ) -> Result<Value, DriveError> {
        let message = arguments
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Confirm?")
            .to_string();
        let timeout = arguments
            .get("timeout_sec")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut sub = self.bus.subscribe(TOPIC_CONFIRMATION_RESULT).await;
        let record = self
            .confirmations
            .create_for_chat(&msg.chat_id, &message, timeout)
            .await?;
        self.tasks
            .transition(
                task_id,
                TaskStatus::Running,
                TaskStatus::AwaitingConfirmation,
                |_| {},
            )
            .await?;

        // The sweeper resolves on deadline; the slack covers its cadence.
        let wait = timeout + Duration::from_secs(5);
        let deadline = tokio::time::Instant::now() + wait;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break ("timeout".to_string(), None);
            }
            match sub.recv_timeout(remaining).await {
                Ok(Some(BusItem::Event(env))) => {
                    if let Payload::ConfirmationResult(result) = env.payload {
                        if result.correlation_id == record.id {
                            break (result.outcome, result.reply);
                        }
                    }
                }
                Ok(Some(BusItem::Gap { .. })) => return Err(DriveError::SequenceGap),
                Ok(None) => break ("timeout".to_string(), None),
                Err(()) => continue,
            }
        };

        self.tasks
            .transition(
                task_id,
                TaskStatus::AwaitingConfirmation,
                TaskStatus::Running,
                |_| {},
            )
            .await?;
        let confirmed = outcome.0 == ConfirmationOutcome::Confirmed.as_str();
        Ok(serde_json::json!({
            "name": CONFIRMATION_SKILL,
            "ok": true,
            "confirmed": confirmed,
            "rejected": !confirmed,
            "timeout": outcome.0 == ConfirmationOutcome::Timeout.as_str(),
            "reply": outcome.1,
        }))
    }

    async fn finalize(
        &self,
        task_id: &str,
        msg: &IncomingMessage,
        publisher: &mut TaskPublisher,
        text: &str,
    ) -> Result<(), DriveError> {
        self.tasks
            .append_message(task_id, "assistant", text)
            .await?;
        self.memory.append(&msg.user_id, "assistant", text).await?;
        let moved = self
            .tasks
            .transition(task_id, TaskStatus::Running, TaskStatus::Completed, |_| {})
            .await?;
        if !moved {
            tracing::warn!(task_id, "finalize found unexpected status");
        }
        publisher.reply(text).await?;
        audit::audit(
            &format!("user:{}", msg.user_id),
            "task.completed",
            &serde_json::json!({ "task_id": task_id }),
            "ok",
            Duration::ZERO,
        );
        Ok(())
    }

    /// Mark a task failed from whichever live state it is in and tell the
    /// user, without technical detail.
    async fn fail_task(&self, task_id: &str, publisher: &mut TaskPublisher, reply: &str) {
        for from in [
            TaskStatus::Running,
            TaskStatus::AwaitingTool,
            TaskStatus::AwaitingConfirmation,
            TaskStatus::Pending,
        ] {
            match self
                .tasks
                .transition(task_id, from, TaskStatus::Failed, |_| {})
                .await
            {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(task_id, error = %e, "fail transition error");
                    break;
                }
            }
        }
        let _ = publisher.done(false).await;
        let _ = publisher.reply(reply).await;
    }

    /// Log restart requests arriving over the bus; process supervision is
    /// external.
    pub async fn run_restart_listener(self: Arc<Self>) {
        let mut sub = self.bus.subscribe(TOPIC_RESTART_REQUESTED).await;
        while let Some(item) = sub.recv().await {
            if let BusItem::Event(env) = item {
                tracing::info!(kind = env.payload.kind(), "restart requested");
            }
        }
    }
}

fn tool_result_value(result: &ToolResult) -> Value {
    let mut obj = serde_json::json!({
        "name": result.name,
        "ok": result.ok,
        "result": result.result,
    });
    if let Some(err) = &result.error {
        obj["error"] = Value::String(err.clone());
    }
    obj
}

/// Skill dispatcher: consumes tool requests, runs skills, publishes
/// results. Runs in its own concurrency domain.
pub struct ToolWorker {
    bus: Arc<dyn Bus>,
    agent: Arc<ToolAgent>,
}

impl ToolWorker {
    pub fn new(bus: Arc<dyn Bus>, agent: Arc<ToolAgent>) -> Self {
        Self { bus, agent }
    }

    pub async fn run(self: Arc<Self>) {
        let mut sub = self.bus.subscribe(TOPIC_TOOL_REQUEST).await;
        tracing::info!("skill dispatcher started");
        while let Some(item) = sub.recv().await {
            let env = match item {
                BusItem::Event(env) => env,
                BusItem::Gap { skipped } => {
                    tracing::warn!(skipped, "tool request subscription lagged");
                    continue;
                }
            };
            let Payload::ToolRequest(request) = env.payload else {
                continue;
            };
            let this = self.clone();
            let task_id = env.task_id.clone();
            let channel = env.channel;
            let seq = env.seq;
            tokio::spawn(async move {
                let actor = format!("task:{task_id}");
                let output = this
                    .agent
                    .dispatch(&actor, &request.name, request.arguments)
                    .await;
                let result = Envelope::for_task(
                    task_id,
                    channel,
                    seq + 1,
                    Payload::ToolResult(ToolResult {
                        name: request.name,
                        ok: output.ok,
                        result: output.result,
                        error: output.error,
                        extra: Map::new(),
                    }),
                );
                if let Err(e) = this.bus.publish(TOPIC_TOOL_RESULT, result).await {
                    tracing::error!(error = %e, "tool result publish failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_value_carries_error() {
        let v = tool_result_value(&ToolResult {
            name: "shell".into(),
            ok: false,
            result: Value::Null,
            error: Some("denied:nope".into()),
            extra: Map::new(),
        });
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "denied:nope");
    }
}
