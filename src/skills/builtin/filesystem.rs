//! Filesystem skill: read, list, and write confined to the workspace root.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::skills::sandbox::confine_path;
use crate::skills::{ParamKind, ParamSpec, SandboxProfile, Skill, SkillDescriptor, SkillOutput};

/// Upper bound on a single read.
const MAX_READ_BYTES: u64 = 512 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FsAction {
    Read,
    List,
    Write,
}

#[derive(Debug, Deserialize)]
struct FsArgs {
    action: FsAction,
    path: String,
    #[serde(default)]
    content: Option<String>,
}

pub struct FilesystemSkill {
    descriptor: SkillDescriptor,
    root: PathBuf,
}

impl FilesystemSkill {
    pub fn new(root: PathBuf, timeout_secs: u64) -> Self {
        Self {
            descriptor: SkillDescriptor {
                name: "filesystem",
                description: "Read, list, or write files inside the workspace".into(),
                parameters: vec![
                    ParamSpec::required("action", ParamKind::String),
                    ParamSpec::required("path", ParamKind::String),
                    ParamSpec::optional("content", ParamKind::String),
                ],
                sandbox: SandboxProfile {
                    network: Some(false),
                    fs_root: Some(root.clone()),
                    timeout: Duration::from_secs(timeout_secs),
                    ..SandboxProfile::default()
                },
                secret_sensitive: false,
            },
            root,
        }
    }
}

#[async_trait]
impl Skill for FilesystemSkill {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn run(&self, args: serde_json::Value) -> SkillOutput {
        let args: FsArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return SkillOutput::err(format!("bad arguments: {e}")),
        };
        let path = match confine_path(&self.root, &args.path) {
            Ok(p) => p,
            Err(e) => return SkillOutput::err(e.to_string()),
        };
        match args.action {
            FsAction::Read => {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() > MAX_READ_BYTES => {
                        return SkillOutput::err(format!(
                            "file too large: {} bytes",
                            meta.len()
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return SkillOutput::err(format!("read failed: {e}")),
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => SkillOutput::ok(json!({ "content": content })),
                    Err(e) => SkillOutput::err(format!("read failed: {e}")),
                }
            }
            FsAction::List => {
                let mut entries = Vec::new();
                let mut dir = match tokio::fs::read_dir(&path).await {
                    Ok(dir) => dir,
                    Err(e) => return SkillOutput::err(format!("list failed: {e}")),
                };
                while let Ok(Some(entry)) = dir.next_entry().await {
                    entries.push(entry.file_name().to_string_lossy().into_owned());
                }
                entries.sort();
                SkillOutput::ok(json!({ "entries": entries }))
            }
            FsAction::Write => {
                let content = match args.content {
                    Some(c) => c,
                    None => return SkillOutput::err("missing 'content' for write"),
                };
                match tokio::fs::write(&path, content).await {
                    Ok(()) => SkillOutput::ok(json!({ "written": true })),
                    Err(e) => SkillOutput::err(format!("write failed: {e}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_and_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let skill = FilesystemSkill::new(dir.path().to_path_buf(), 60);
        let out = skill
            .run(json!({"action": "write", "path": "a.txt", "content": "X"}))
            .await;
        assert!(out.ok);
        let out = skill.run(json!({"action": "read", "path": "a.txt"})).await;
        assert!(out.ok);
        assert_eq!(out.result["content"], "X");
    }

    #[tokio::test]
    async fn list_returns_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        let skill = FilesystemSkill::new(dir.path().to_path_buf(), 60);
        let out = skill.run(json!({"action": "list", "path": "."})).await;
        assert!(out.ok);
        assert_eq!(out.result["entries"][0], "b.txt");
    }

    #[tokio::test]
    async fn escape_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let skill = FilesystemSkill::new(dir.path().to_path_buf(), 60);
        let out = skill
            .run(json!({"action": "read", "path": "../etc/passwd"}))
            .await;
        assert!(!out.ok);
    }
}
