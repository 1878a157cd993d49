//! Skills: named, sandboxed operations invoked by the tool agent.
//!
//! A skill declares its parameter schema and sandbox profile up front; the
//! dispatcher validates arguments against the schema before the body ever
//! runs, and the sandbox runner enforces the profile around the body.

pub mod allowlist;
pub mod builtin;
pub mod registry;
pub mod sandbox;

pub use allowlist::CommandAllowList;
pub use registry::SkillRegistry;
pub use sandbox::SandboxRunner;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SkillError;

/// Semantic type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Sandbox profile a skill runs under.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    /// `None` inherits the configured default policy.
    pub network: Option<bool>,
    /// Filesystem confinement root; `None` means no filesystem access is
    /// expected.
    pub fs_root: Option<PathBuf>,
    pub timeout: Duration,
    pub cpu_limit_secs: u64,
    pub memory_limit_mb: u64,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            network: None,
            fs_root: None,
            timeout: Duration::from_secs(60),
            cpu_limit_secs: 30,
            memory_limit_mb: 256,
        }
    }
}

/// Declared surface of one skill.
#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    pub name: &'static str,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
    pub sandbox: SandboxProfile,
    /// Marks arguments for aggressive masking in the audit log.
    pub secret_sensitive: bool,
}

impl SkillDescriptor {
    /// Validate a generic argument map against the declared schema.
    pub fn validate(&self, args: &Value) -> Result<(), SkillError> {
        let obj = args.as_object().ok_or_else(|| SkillError::InvalidArguments {
            name: self.name.to_string(),
            reason: "arguments must be an object".to_string(),
        })?;
        for spec in &self.parameters {
            match obj.get(spec.name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(SkillError::InvalidArguments {
                            name: self.name.to_string(),
                            reason: format!("parameter '{}' has the wrong type", spec.name),
                        });
                    }
                }
                None if spec.required => {
                    return Err(SkillError::InvalidArguments {
                        name: self.name.to_string(),
                        reason: format!("missing required parameter '{}'", spec.name),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// JSON-schema-shaped view for prompt construction and tools/list.
    pub fn parameters_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for spec in &self.parameters {
            let kind = match spec.kind {
                ParamKind::String => "string",
                ParamKind::Integer => "integer",
                ParamKind::Number => "number",
                ParamKind::Boolean => "boolean",
                ParamKind::Object => "object",
                ParamKind::Array => "array",
            };
            properties.insert(
                spec.name.to_string(),
                serde_json::json!({ "type": kind }),
            );
            if spec.required {
                required.push(Value::String(spec.name.to_string()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Result of one skill invocation.
#[derive(Debug, Clone)]
pub struct SkillOutput {
    pub ok: bool,
    pub result: Value,
    pub error: Option<String>,
}

impl SkillOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// One skill: a descriptor plus `run`.
#[async_trait]
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &SkillDescriptor;

    /// Execute with validated arguments. Implementations deserialize into
    /// their own typed argument struct.
    async fn run(&self, args: Value) -> SkillOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SkillDescriptor {
        SkillDescriptor {
            name: "filesystem",
            description: "read files".into(),
            parameters: vec![
                ParamSpec::required("action", ParamKind::String),
                ParamSpec::required("path", ParamKind::String),
                ParamSpec::optional("content", ParamKind::String),
            ],
            sandbox: SandboxProfile::default(),
            secret_sensitive: false,
        }
    }

    #[test]
    fn validate_accepts_well_formed_arguments() {
        let d = descriptor();
        let args = serde_json::json!({"action": "read", "path": "a.txt"});
        assert!(d.validate(&args).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let d = descriptor();
        let args = serde_json::json!({"action": "read"});
        assert!(matches!(
            d.validate(&args),
            Err(SkillError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let d = descriptor();
        let args = serde_json::json!({"action": "read", "path": 5});
        assert!(d.validate(&args).is_err());
    }

    #[test]
    fn schema_lists_required_parameters() {
        let schema = descriptor().parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }
}
