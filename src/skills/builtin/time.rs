//! Time skill: current UTC time, no sandbox surface.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::skills::{SandboxProfile, Skill, SkillDescriptor, SkillOutput};

pub struct TimeSkill {
    descriptor: SkillDescriptor,
}

impl TimeSkill {
    pub fn new() -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "time",
                description: "Current date and time in UTC".into(),
                parameters: vec![],
                sandbox: SandboxProfile::default(),
                secret_sensitive: false,
            },
        }
    }
}

impl Default for TimeSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for TimeSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, _args: serde_json::Value) -> SkillOutput {
        let now = Utc::now();
        SkillOutput::ok(json!({
            "iso": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_current_time() {
        let out = TimeSkill::new().run(json!({})).await;
        assert!(out.ok);
        assert!(out.result["unix"].as_i64().unwrap() > 0);
    }
}
