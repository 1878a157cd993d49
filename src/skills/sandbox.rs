//! Sandbox runner: the boundary around every untrusted skill execution.
//!
//! Filesystem access is confined to a canonicalized workspace root,
//! subprocesses run without a shell under a wall-clock timeout, and the
//! proxy environment is scrubbed when the profile disables network.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Command;

use crate::audit::AuditEntry;
use crate::error::SkillError;
use crate::skills::{SandboxProfile, Skill, SkillOutput};

/// Outcome of a confined subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Resolve `candidate` inside `root`, rejecting any escape (including via
/// symlink). For paths that do not exist yet, the parent directory is
/// resolved instead so writes to new files still pass.
pub fn confine_path(root: &Path, candidate: &str) -> Result<PathBuf, SkillError> {
    let root = root
        .canonicalize()
        .map_err(|e| SkillError::ExecutionFailed {
            name: "sandbox".to_string(),
            reason: format!("workspace root unavailable: {e}"),
        })?;
    let joined = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        root.join(candidate)
    };
    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = joined.parent().ok_or_else(|| SkillError::Denied {
                reason: format!("path escapes workspace: {candidate}"),
            })?;
            let file_name = joined.file_name().ok_or_else(|| SkillError::Denied {
                reason: format!("path escapes workspace: {candidate}"),
            })?;
            parent
                .canonicalize()
                .map_err(|_| SkillError::Denied {
                    reason: format!("path escapes workspace: {candidate}"),
                })?
                .join(file_name)
        }
    };
    if !resolved.starts_with(&root) {
        return Err(SkillError::Denied {
            reason: format!("path escapes workspace: {candidate}"),
        });
    }
    Ok(resolved)
}

/// Run one program without shell interpretation, confined by the profile.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    profile: &SandboxProfile,
    network_enabled: bool,
    timeout: Duration,
) -> Result<CommandOutput, SkillError> {
    let (program, args) = argv.split_first().ok_or_else(|| SkillError::Denied {
        reason: "empty command".to_string(),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if !network_enabled {
        // Best-effort egress block for proxy-respecting tools; full
        // isolation requires an external container boundary.
        cmd.env("HTTP_PROXY", "http://127.0.0.1:1")
            .env("HTTPS_PROXY", "http://127.0.0.1:1")
            .env("NO_PROXY", "");
    }
    cmd.env(
        "SANDBOX_MEMORY_LIMIT_MB",
        profile.memory_limit_mb.to_string(),
    );

    let child = cmd.spawn().map_err(|e| SkillError::ExecutionFailed {
        name: program.clone(),
        reason: e.to_string(),
    })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(SkillError::ExecutionFailed {
                name: program.clone(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            // kill_on_drop reaps the process when the future is dropped.
            return Err(SkillError::Timeout {
                name: program.clone(),
            });
        }
    };
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Wraps every skill invocation with the profile timeout and the audit
/// trail.
pub struct SandboxRunner {
    default_network: bool,
}

impl SandboxRunner {
    pub fn new(default_network: bool) -> Self {
        Self { default_network }
    }

    /// Effective network policy for a profile.
    pub fn network_enabled(&self, profile: &SandboxProfile) -> bool {
        profile.network.unwrap_or(self.default_network)
    }

    /// Run a skill under its declared profile. Every invocation, success or
    /// failure, emits one audit entry with redacted arguments.
    pub async fn execute(&self, skill: &dyn Skill, args: Value, actor: &str) -> SkillOutput {
        let descriptor = skill.descriptor();
        let started = Instant::now();
        let audit_args = if descriptor.secret_sensitive {
            Value::String("[SENSITIVE]".to_string())
        } else {
            args.clone()
        };

        let output = match tokio::time::timeout(descriptor.sandbox.timeout, skill.run(args)).await {
            Ok(output) => output,
            Err(_) => SkillOutput::err("timeout"),
        };

        let outcome = if output.ok {
            "ok".to_string()
        } else {
            format!("error:{}", output.error.as_deref().unwrap_or("unknown"))
        };
        AuditEntry::new(
            actor,
            format!("skill.invoke:{}", descriptor.name),
            &audit_args,
            outcome,
            started.elapsed(),
        )
        .emit();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confine_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = confine_path(dir.path(), "../outside.txt");
        assert!(matches!(err, Err(SkillError::Denied { .. })));
    }

    #[test]
    fn confine_accepts_inner_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let p = confine_path(dir.path(), "a.txt").unwrap();
        assert!(p.ends_with("a.txt"));
    }

    #[test]
    fn confine_accepts_new_file_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let p = confine_path(dir.path(), "new.txt").unwrap();
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn confine_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = confine_path(dir.path(), "link/escape.txt");
        assert!(matches!(err, Err(SkillError::Denied { .. })));
    }

    #[tokio::test]
    async fn command_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let profile = SandboxProfile::default();
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let err = run_command(
            &argv,
            dir.path(),
            &profile,
            false,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(err, Err(SkillError::Timeout { .. })));
    }

    #[tokio::test]
    async fn command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let profile = SandboxProfile::default();
        let argv = vec!["echo".to_string(), "hello".to_string()];
        let out = run_command(&argv, dir.path(), &profile, false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }
}
