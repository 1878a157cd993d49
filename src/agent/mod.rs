//! Stateless agents.
//!
//! `AssistantAgent` turns a task context into a model request and parses
//! the reply into either a final text or a tool call. `ToolAgent` resolves
//! a tool call against the skill registry, validates the arguments, and
//! runs the skill inside the sandbox. Neither holds task state; everything
//! flows through the context and the central stores.

use std::sync::Arc;

use serde_json::Value;

use crate::bus::ChannelKind;
use crate::error::ModelError;
use crate::llm::{ChatMessage, GenerateRequest, ModelGateway, Role, TokenStream};
use crate::skills::{SandboxRunner, SkillOutput, SkillRegistry};
use crate::tasks::WindowEntry;

const SYSTEM_PROMPT: &str = "You are a helpful personal assistant. You can use tools when needed.\n\
When you need to run a tool, respond with a JSON block like:\n\
{\"tool_calls\": [{\"name\": \"filesystem\", \"arguments\": {\"action\": \"read\", \"path\": \"notes.txt\"}}]}\n\
When a confirmation from the user is required before a risky action, call the ask_confirmation tool.\n\
You may add \"quality\": <0..1> to the JSON block to self-rate a final answer.\n\
Keep answers concise. Do not make up file contents or command output.";

/// Everything an agent may read about one task iteration.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub channel: ChannelKind,
    pub text: String,
    pub reasoning_requested: bool,
    pub iteration: u32,
    pub window: Vec<WindowEntry>,
    /// Memory blocks in fixed order: summary first, then user data.
    pub memory_blocks: Vec<String>,
    /// Tool results accumulated in this task, oldest first.
    pub tool_results: Vec<Value>,
}

/// Parsed reply of one model turn.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Text {
        body: String,
        quality: Option<f64>,
    },
    ToolCall {
        name: String,
        arguments: Value,
        /// Self-rating emitted alongside the call, if any.
        quality: Option<f64>,
    },
}

/// Builds prompts, calls the model gateway, parses replies.
pub struct AssistantAgent {
    gateway: Arc<dyn ModelGateway>,
    skill_summary: String,
}

impl AssistantAgent {
    pub fn new(gateway: Arc<dyn ModelGateway>, registry: &SkillRegistry) -> Self {
        let skill_summary = registry
            .descriptors()
            .iter()
            .map(|d| format!("- {}: {} {}", d.name, d.description, d.parameters_schema()))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            gateway,
            skill_summary,
        }
    }

    /// Assemble the message array for one iteration.
    pub fn build_request(&self, ctx: &TaskContext) -> GenerateRequest {
        let mut messages = Vec::new();
        let mut system = SYSTEM_PROMPT.to_string();
        if !self.skill_summary.is_empty() {
            system.push_str("\nAvailable tools:\n");
            system.push_str(&self.skill_summary);
        }
        messages.push(ChatMessage::new(Role::System, system));
        for block in &ctx.memory_blocks {
            messages.push(ChatMessage::new(Role::System, block.clone()));
        }
        for entry in &ctx.window {
            let role = match entry.role.as_str() {
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => Role::User,
            };
            messages.push(ChatMessage::new(role, entry.text.clone()));
        }
        let mut user_content = ctx.text.clone();
        if !ctx.tool_results.is_empty() {
            user_content.push_str("\n\nTool results:\n");
            for result in &ctx.tool_results {
                user_content.push_str(&result.to_string());
                user_content.push('\n');
            }
        }
        messages.push(ChatMessage::new(Role::User, user_content));
        GenerateRequest {
            messages,
            reasoning: ctx.reasoning_requested,
            max_tokens: None,
            temperature: None,
        }
    }

    /// One non-streaming model turn.
    pub async fn respond(&self, ctx: &TaskContext) -> Result<AgentReply, ModelError> {
        let text = self.gateway.generate(self.build_request(ctx)).await?;
        Ok(parse_reply(&text))
    }

    /// Start a streaming model turn. The caller drains the stream and then
    /// feeds the accumulated text to [`parse_reply`].
    pub async fn respond_stream(&self, ctx: &TaskContext) -> Result<TokenStream, ModelError> {
        self.gateway.generate_stream(self.build_request(ctx)).await
    }
}

/// Parse a model reply: a `tool_calls` JSON block wins over free-form text
/// in the same turn; an optional `quality` self-rating rides the same
/// block.
pub fn parse_reply(text: &str) -> AgentReply {
    if let Some(block) = extract_json_block(text, "\"tool_calls\"") {
        let quality = block.get("quality").and_then(Value::as_f64);
        if let Some(calls) = block.get("tool_calls").and_then(Value::as_array) {
            if let Some(first) = calls.first() {
                let name = first
                    .get("name")
                    .or_else(|| first.get("skill"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = first
                    .get("arguments")
                    .or_else(|| first.get("params"))
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                if !name.is_empty() {
                    return AgentReply::ToolCall {
                        name,
                        arguments,
                        quality,
                    };
                }
            }
        }
        return AgentReply::Text {
            body: text.to_string(),
            quality,
        };
    }
    let quality = extract_json_block(text, "\"quality\"")
        .and_then(|b| b.get("quality").and_then(Value::as_f64));
    AgentReply::Text {
        body: text.to_string(),
        quality,
    }
}

/// Find the innermost JSON object containing `marker` by scanning braces
/// backward from the marker. The model emits these blocks inline with
/// prose, so a plain `from_str` on the whole reply would not do.
fn extract_json_block(text: &str, marker: &str) -> Option<Value> {
    let idx = text.find(marker)?;
    let start = text[..idx].rfind('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Resolves and executes one tool call.
pub struct ToolAgent {
    registry: Arc<SkillRegistry>,
    runner: Arc<SandboxRunner>,
}

impl ToolAgent {
    pub fn new(registry: Arc<SkillRegistry>, runner: Arc<SandboxRunner>) -> Self {
        Self { registry, runner }
    }

    /// Validate and run a named skill. Denials and failures come back as
    /// `ok=false` outputs, never as panics or lost envelopes.
    pub async fn dispatch(&self, actor: &str, name: &str, arguments: Value) -> SkillOutput {
        let skill = match self.registry.get(name) {
            Some(skill) => skill,
            None => return SkillOutput::err(format!("unknown skill: {name}")),
        };
        if let Err(e) = skill.descriptor().validate(&arguments) {
            return SkillOutput::err(e.to_string());
        }
        self.runner.execute(skill.as_ref(), arguments, actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_reply() {
        match parse_reply("hello there") {
            AgentReply::Text { body, quality } => {
                assert_eq!(body, "hello there");
                assert!(quality.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn tool_call_wins_over_text() {
        let text = r#"Let me check that file.
{"tool_calls": [{"name": "filesystem", "arguments": {"action": "read", "path": "a.txt"}}]}"#;
        match parse_reply(text) {
            AgentReply::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "filesystem");
                assert_eq!(arguments["path"], "a.txt");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn quality_rating_parsed() {
        let text = r#"Done. {"quality": 0.92}"#;
        match parse_reply(text) {
            AgentReply::Text { quality, .. } => assert_eq!(quality, Some(0.92)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn params_alias_accepted() {
        let text = r#"{"tool_calls": [{"skill": "shell", "params": {"command": "ls"}}]}"#;
        match parse_reply(text) {
            AgentReply::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "shell");
                assert_eq!(arguments["command"], "ls");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn braces_inside_strings_do_not_break_the_scan() {
        let text = r#"{"tool_calls": [{"name": "shell", "arguments": {"command": "echo {ok}"}}]}"#;
        match parse_reply(text) {
            AgentReply::ToolCall { arguments, .. } => {
                assert_eq!(arguments["command"], "echo {ok}");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
