//! Configuration: an immutable snapshot resolved KV -> environment -> file.
//!
//! Workers read the snapshot through a [`ConfigHandle`]; only the
//! whitelisted hot subset (allow-lists, thresholds, rate-limit parameters)
//! is refreshed by `reload_hot` without a restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::bus::KvStore;
use crate::error::ConfigError;

/// Prefix for KV-resident options (`config:<dotted.key>`).
const KV_CONFIG_PREFIX: &str = "config:";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Enables the autonomous tool loop.
    pub autonomous_mode: bool,
    /// Upper bound on loop iterations per task.
    pub max_iterations: u32,
    /// Early-exit score in [0,1] compared against the model self-rating.
    pub quality_threshold: f32,
    /// Task-wide deadline in seconds.
    pub task_deadline_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            autonomous_mode: false,
            max_iterations: 5,
            quality_threshold: 0.8,
            task_deadline_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
    pub api_key: SecretString,
    /// Suffix appended to the model name when reasoning is requested.
    pub reasoning_suffix: String,
    pub cloud_fallback_enabled: bool,
    pub cloud_base_url: Option<String>,
    pub cloud_name: Option<String>,
    pub cloud_api_key: Option<SecretString>,
    /// Per-call timeout for non-streaming generation, seconds.
    pub request_timeout_secs: u64,
    /// Total timeout for a streamed generation, seconds.
    pub stream_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            name: "llama3.2".into(),
            api_key: SecretString::from("ollama".to_string()),
            reasoning_suffix: ":reasoning".into(),
            cloud_fallback_enabled: false,
            cloud_base_url: None,
            cloud_name: None,
            cloud_api_key: None,
            request_timeout_secs: 120,
            stream_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Entries kept in a task's short-term window.
    pub short_term_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default network policy for skills that do not override it.
    pub network_enabled: bool,
    pub workspace_dir: String,
    pub command_allow_list: Vec<String>,
    pub skill_timeout_secs: u64,
    pub shell_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_enabled: false,
            workspace_dir: "/workspace".into(),
            command_allow_list: vec![
                "ls".into(),
                "cat".into(),
                "git".into(),
                "grep".into(),
                "python3".into(),
            ],
            skill_timeout_secs: 60,
            shell_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<SecretString>,
    pub allowed_user_ids: Vec<i64>,
    /// Admits new users via the /start handshake.
    pub pairing_mode: bool,
    pub long_poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_user_ids: Vec::new(),
            pairing_mode: false,
            long_poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub admin_token: Option<SecretString>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8081".into(),
            admin_token: None,
        }
    }
}

/// The full snapshot. Cloning is cheap enough for per-task reads via
/// `Arc<Config>`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub model: ModelConfig,
    pub memory: MemoryConfig,
    pub sandbox: SandboxConfig,
    pub telegram: TelegramConfig,
    pub rate_limit: RateLimitConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load the file layer (optional JSON) and apply the environment layer.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MODEL_BASE_URL") {
            self.model.base_url = v;
        }
        if let Ok(v) = std::env::var("MODEL_NAME") {
            self.model.name = v;
        }
        if let Ok(v) = std::env::var("MODEL_API_KEY") {
            self.model.api_key = SecretString::from(v);
        }
        if let Ok(v) = std::env::var("CLOUD_FALLBACK_ENABLED") {
            self.model.cloud_fallback_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.telegram.bot_token = Some(SecretString::from(v));
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_ALLOWED_USER_IDS") {
            self.telegram.allowed_user_ids = parse_id_list(&v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_PAIRING_MODE") {
            self.telegram.pairing_mode = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_AUTONOMOUS_MODE") {
            self.orchestrator.autonomous_mode = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                self.orchestrator.max_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_WORKSPACE_DIR") {
            self.sandbox.workspace_dir = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_NETWORK_ENABLED") {
            self.sandbox.network_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("GATEWAY_BIND_ADDR") {
            self.gateway.bind_addr = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_ADMIN_TOKEN") {
            if !v.trim().is_empty() {
                self.gateway.admin_token = Some(SecretString::from(v));
            }
        }
    }

    /// Apply the KV layer (highest priority). Only dotted keys published
    /// through the administrative surface are recognized.
    pub async fn apply_kv(&mut self, kv: &dyn KvStore) -> Result<(), ConfigError> {
        let overrides = read_kv_options(kv).await?;
        self.apply_overrides(&overrides);
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        if let Some(v) = overrides.get("orchestrator.autonomous_mode") {
            self.orchestrator.autonomous_mode = parse_bool(v);
        }
        if let Some(v) = overrides.get("orchestrator.max_iterations") {
            if let Ok(n) = v.parse() {
                self.orchestrator.max_iterations = n;
            }
        }
        if let Some(v) = overrides.get("orchestrator.quality_threshold") {
            if let Ok(n) = v.parse() {
                self.orchestrator.quality_threshold = n;
            }
        }
        if let Some(v) = overrides.get("model.base_url") {
            self.model.base_url = v.clone();
        }
        if let Some(v) = overrides.get("model.name") {
            self.model.name = v.clone();
        }
        if let Some(v) = overrides.get("model.api_key") {
            self.model.api_key = SecretString::from(v.clone());
        }
        if let Some(v) = overrides.get("cloud_fallback_enabled") {
            self.model.cloud_fallback_enabled = parse_bool(v);
        }
        if let Some(v) = overrides.get("memory.short_term_window") {
            if let Ok(n) = v.parse() {
                self.memory.short_term_window = n;
            }
        }
        if let Some(v) = overrides.get("sandbox.network_enabled") {
            self.sandbox.network_enabled = parse_bool(v);
        }
        if let Some(v) = overrides.get("telegram.allowed_user_ids") {
            self.telegram.allowed_user_ids = parse_id_list(v);
        }
        if let Some(v) = overrides.get("telegram.pairing_mode") {
            self.telegram.pairing_mode = parse_bool(v);
        }
        if let Some(v) = overrides.get("rate_limit.capacity") {
            if let Ok(n) = v.parse() {
                self.rate_limit.capacity = n;
            }
        }
        if let Some(v) = overrides.get("rate_limit.refill_per_sec") {
            if let Ok(n) = v.parse() {
                self.rate_limit.refill_per_sec = n;
            }
        }
    }

    /// Options that must be present before the process may start.
    pub fn validate(&self, telegram_enabled: bool) -> Result<(), ConfigError> {
        if self.model.base_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "model.base_url".into(),
            });
        }
        if self.model.cloud_fallback_enabled
            && self
                .model
                .cloud_api_key
                .as_ref()
                .map(|k| k.expose_secret().is_empty())
                .unwrap_or(true)
        {
            return Err(ConfigError::Missing {
                key: "model.cloud_api_key".into(),
            });
        }
        if telegram_enabled && self.telegram.bot_token.is_none() {
            return Err(ConfigError::Missing {
                key: "telegram.bot_token".into(),
            });
        }
        Ok(())
    }
}

async fn read_kv_options(kv: &dyn KvStore) -> Result<HashMap<String, String>, ConfigError> {
    let mut overrides = HashMap::new();
    let keys = kv
        .list(KV_CONFIG_PREFIX)
        .await
        .map_err(|e| ConfigError::Invalid {
            key: "config:*".into(),
            reason: e.to_string(),
        })?;
    for key in keys {
        if let Ok(Some(value)) = kv.get(&key).await {
            let dotted = key.trim_start_matches(KV_CONFIG_PREFIX).to_string();
            overrides.insert(dotted, value);
        }
    }
    Ok(overrides)
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_id_list(v: &str) -> Vec<i64> {
    v.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

/// Shared handle: workers read the current snapshot, the admin surface
/// refreshes the hot subset.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub async fn get(&self) -> Arc<Config> {
        self.inner.read().await.clone()
    }

    /// Re-read the hot-reloadable subset (allow-lists, thresholds,
    /// rate-limit parameters) from the KV layer.
    pub async fn reload_hot(&self, kv: &dyn KvStore) -> Result<(), ConfigError> {
        let overrides = read_kv_options(kv).await?;
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        let hot_keys = [
            "orchestrator.autonomous_mode",
            "orchestrator.max_iterations",
            "orchestrator.quality_threshold",
            "telegram.allowed_user_ids",
            "telegram.pairing_mode",
            "rate_limit.capacity",
            "rate_limit.refill_per_sec",
        ];
        let hot: HashMap<String, String> = overrides
            .into_iter()
            .filter(|(k, _)| hot_keys.contains(&k.as_str()))
            .collect();
        next.apply_overrides(&hot);
        *guard = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(!c.orchestrator.autonomous_mode);
        assert_eq!(c.orchestrator.max_iterations, 5);
        assert_eq!(c.memory.short_term_window, 20);
    }

    #[tokio::test]
    async fn kv_layer_wins() {
        let bus = MemoryBus::new();
        bus.set("config:orchestrator.max_iterations", "3")
            .await
            .unwrap();
        bus.set("config:orchestrator.autonomous_mode", "true")
            .await
            .unwrap();
        let mut c = Config::default();
        c.apply_kv(&bus).await.unwrap();
        assert_eq!(c.orchestrator.max_iterations, 3);
        assert!(c.orchestrator.autonomous_mode);
    }

    #[tokio::test]
    async fn hot_reload_only_touches_whitelisted_keys() {
        let bus = MemoryBus::new();
        bus.set("config:telegram.allowed_user_ids", "7,8")
            .await
            .unwrap();
        bus.set("config:model.name", "other-model").await.unwrap();
        let handle = ConfigHandle::new(Config::default());
        handle.reload_hot(&bus).await.unwrap();
        let c = handle.get().await;
        assert_eq!(c.telegram.allowed_user_ids, vec![7, 8]);
        // model.name is not hot-reloadable.
        assert_eq!(c.model.name, "llama3.2");
    }

    #[test]
    fn missing_bot_token_is_fatal_when_enabled() {
        let c = Config::default();
        assert!(c.validate(true).is_err());
        assert!(c.validate(false).is_ok());
    }
}
