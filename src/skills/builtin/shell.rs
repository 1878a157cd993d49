//! Shell skill: allow-listed commands inside the workspace, no shell
//! interpretation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::skills::allowlist::{CommandAllowList, CommandDecision};
use crate::skills::sandbox::run_command;
use crate::skills::{ParamKind, ParamSpec, SandboxProfile, Skill, SkillDescriptor, SkillOutput};

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
}

pub struct ShellSkill {
    descriptor: SkillDescriptor,
    allowlist: CommandAllowList,
    workspace: PathBuf,
    network_enabled: bool,
}

impl ShellSkill {
    pub fn new(
        allowed_commands: &[String],
        workspace: PathBuf,
        network_enabled: bool,
        timeout_secs: u64,
    ) -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "shell",
                description: "Run an allow-listed command in the workspace".into(),
                parameters: vec![ParamSpec::required("command", ParamKind::String)],
                sandbox: SandboxProfile {
                    network: Some(network_enabled),
                    fs_root: Some(workspace.clone()),
                    timeout: Duration::from_secs(timeout_secs),
                    ..SandboxProfile::default()
                },
                secret_sensitive: false,
            },
            allowlist: CommandAllowList::new(allowed_commands.iter().map(String::as_str)),
            workspace,
            network_enabled,
        }
    }
}

#[async_trait]
impl Skill for ShellSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, args: serde_json::Value) -> SkillOutput {
        let args: ShellArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return SkillOutput::err(format!("bad arguments: {e}")),
        };
        let argv = match self.allowlist.check(&args.command) {
            CommandDecision::Allowed(argv) => argv,
            CommandDecision::Denied(reason) => {
                return SkillOutput::err(format!("denied:{reason}"));
            }
        };
        match run_command(
            &argv,
            &self.workspace,
            &self.descriptor.sandbox,
            self.network_enabled,
            self.descriptor.sandbox.timeout,
        )
        .await
        {
            Ok(out) => SkillOutput::ok(json!({
                "exit_code": out.exit_code,
                "stdout": out.stdout,
                "stderr": out.stderr,
            })),
            Err(e) => SkillOutput::err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(dir: &std::path::Path) -> ShellSkill {
        ShellSkill::new(
            &["echo".to_string(), "cat".to_string()],
            dir.to_path_buf(),
            false,
            5,
        )
    }

    #[tokio::test]
    async fn runs_allowed_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = skill(dir.path())
            .run(serde_json::json!({"command": "echo hi"}))
            .await;
        assert!(out.ok);
        assert_eq!(out.result["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn denies_unlisted_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = skill(dir.path())
            .run(serde_json::json!({"command": "python3 x.py"}))
            .await;
        assert!(!out.ok);
        assert!(out.error.unwrap().starts_with("denied:"));
    }
}
