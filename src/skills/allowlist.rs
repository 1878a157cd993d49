//! Command allow-list for shell-like skills.
//!
//! A command runs only when its program name matches the allow-list
//! literally and no deny pattern fires. Interpretation never goes through a
//! shell; the line is split here and handed to the process spawner as-is.

use std::collections::HashSet;

/// Substring patterns that veto a command regardless of the allow-list.
const DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -r /",
    "rm -f /",
    "curl ",
    "wget ",
    "| sh",
    "|sh",
    "&& sh",
    "; sh",
    "> /",
    ">/dev",
    "mkfs",
    ":(){",
];

/// Decision with the reason a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    Allowed(Vec<String>),
    Denied(String),
}

pub struct CommandAllowList {
    allowed: HashSet<String>,
}

impl CommandAllowList {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Check a raw command line. On success, returns the argv split.
    pub fn check(&self, raw: &str) -> CommandDecision {
        let raw = raw.trim();
        if raw.is_empty() {
            return CommandDecision::Denied("empty command".to_string());
        }
        let parts = match split_command(raw) {
            Some(parts) if !parts.is_empty() => parts,
            _ => return CommandDecision::Denied("unparsable command".to_string()),
        };
        let program = parts[0].to_ascii_lowercase();
        if !self.allowed.contains(&program) {
            return CommandDecision::Denied(format!("command not in allow-list: {program}"));
        }
        let lower = raw.to_ascii_lowercase();
        for pattern in DENY_PATTERNS {
            if lower.contains(pattern) {
                return CommandDecision::Denied(format!("forbidden pattern: {pattern}"));
            }
        }
        CommandDecision::Allowed(parts)
    }
}

/// Whitespace split with single/double-quote grouping. Returns `None` on an
/// unterminated quote.
pub fn split_command(raw: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut had_token = false;
    for c in raw.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                had_token = true;
            }
            None if c.is_whitespace() => {
                if had_token {
                    parts.push(std::mem::take(&mut current));
                    had_token = false;
                }
            }
            None => {
                current.push(c);
                had_token = true;
            }
        }
    }
    if quote.is_some() {
        return None;
    }
    if had_token {
        parts.push(current);
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> CommandAllowList {
        CommandAllowList::new(["ls", "cat", "git"])
    }

    #[test]
    fn allowed_command_passes() {
        match allowlist().check("git status") {
            CommandDecision::Allowed(parts) => assert_eq!(parts, vec!["git", "status"]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unlisted_program_denied() {
        assert!(matches!(
            allowlist().check("python3 -c 'print(1)'"),
            CommandDecision::Denied(_)
        ));
    }

    #[test]
    fn deny_pattern_vetoes_listed_program() {
        // `git` is listed, but the destructive pattern wins.
        assert!(matches!(
            allowlist().check("git clean && rm -rf /"),
            CommandDecision::Denied(_)
        ));
    }

    #[test]
    fn raw_curl_denied() {
        let list = CommandAllowList::new(["curl"]);
        assert!(matches!(
            list.check("curl https://example.com"),
            CommandDecision::Denied(_)
        ));
    }

    #[test]
    fn quoted_arguments_stay_grouped() {
        let parts = split_command(r#"git commit -m "two words""#).unwrap();
        assert_eq!(parts, vec!["git", "commit", "-m", "two words"]);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(split_command("cat 'a.txt").is_none());
    }
}
