use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to call the API from a browser. `"*"` allows any origin;
    /// an empty list disables CORS headers.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9500,
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAi,
    Azure,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    /// Model name, or the deployment name on Azure.
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Stub,
            model: "stub-model".into(),
            api_key: None,
            endpoint: None,
            api_version: None,
            temperature: 0.0,
            max_retries: default_max_retries(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// Per-request timeout of the HTTP client.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default_external_call()
        }
    }

    /// Upper bound for one model call including every retry and its backoff.
    /// Callers that wrap the client in their own timeout should allow this much.
    pub fn call_budget(&self) -> Duration {
        let retry = self.retry_policy();
        self.timeout() * (retry.max_retries + 1) + retry.total_backoff()
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_model_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,
    #[serde(default = "default_max_routes")]
    pub max_routes: usize,
    #[serde(default = "default_concurrent_tools")]
    pub concurrent_tools: bool,
    /// Number of trailing messages sent to the model; `None` sends the full history.
    #[serde(default)]
    pub context_window: Option<usize>,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_rounds: default_max_rounds(),
            tool_timeout_secs: default_tool_timeout_secs(),
            turn_deadline_secs: default_turn_deadline_secs(),
            max_routes: default_max_routes(),
            concurrent_tools: default_concurrent_tools(),
            context_window: None,
            busy_policy: BusyPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn turn_deadline(&self) -> Duration {
        Duration::from_secs(self.turn_deadline_secs)
    }
}

fn default_system_prompt() -> String {
    "You are a financial assistant. Use the available tools to retrieve quotes, \
     filings, options, news and weather, then answer concisely."
        .into()
}

fn default_max_rounds() -> usize {
    25
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_turn_deadline_secs() -> u64 {
    300
}

fn default_max_routes() -> usize {
    10
}

fn default_concurrent_tools() -> bool {
    true
}

/// What a second turn on a thread does while one is already running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running turn to finish.
    #[default]
    Queue,
    /// Fail fast with `ThreadBusy`.
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_dir")]
    pub directory: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            directory: default_storage_dir(),
            database_url: None,
        }
    }
}

fn default_storage_dir() -> String {
    "threads".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| {
            AgentError::Configuration(format!("failed to parse configuration: {err}"))
        })
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Overlays environment variables on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("FINCHAT_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed_var::<u16>("FINCHAT_PORT") {
            self.server.port = port;
        }
        if let Ok(origins) = env::var("FINCHAT_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(provider) = env::var("FINCHAT_MODEL_PROVIDER") {
            match provider.to_ascii_lowercase().as_str() {
                "openai" => self.model.provider = ModelProvider::OpenAi,
                "azure" => self.model.provider = ModelProvider::Azure,
                "stub" => self.model.provider = ModelProvider::Stub,
                _ => {}
            }
        }
        if let Ok(model) = env::var("AZURE_OPENAI_MODEL").or_else(|_| env::var("FINCHAT_MODEL")) {
            self.model.model = model;
        }
        if let Ok(key) = env::var("AZURE_OPENAI_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Ok(endpoint) = env::var("AZURE_OPENAI_ENDPOINT") {
            self.model.endpoint = Some(endpoint);
        }
        if let Ok(version) = env::var("OPENAI_API_VERSION") {
            self.model.api_version = Some(version);
        }
        if let Some(retries) = parsed_var::<u32>("FINCHAT_MODEL_MAX_RETRIES") {
            self.model.max_retries = retries;
        }
        if let Some(rounds) = parsed_var::<usize>("FINCHAT_MAX_ROUNDS") {
            self.agent.max_rounds = rounds.max(1);
        }
        if let Some(secs) = parsed_var::<u64>("FINCHAT_TURN_DEADLINE_SECS") {
            self.agent.turn_deadline_secs = secs;
        }
        if let Ok(policy) = env::var("FINCHAT_BUSY_POLICY") {
            self.agent.busy_policy = match policy.to_ascii_lowercase().as_str() {
                "reject" => BusyPolicy::Reject,
                _ => BusyPolicy::Queue,
            };
        }
        if let Ok(backend) = env::var("FINCHAT_STORAGE_BACKEND") {
            self.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "sqlite" => StorageBackend::Sqlite,
                "file" => StorageBackend::File,
                _ => StorageBackend::Memory,
            };
        }
        if let Ok(dir) = env::var("FINCHAT_STORAGE_DIR") {
            self.storage.directory = dir;
        }
        if let Ok(url) = env::var("FINCHAT_DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        if let Ok(level) = env::var("FINCHAT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parsed_var::<bool>("FINCHAT_LOG_JSON") {
            self.logging.json = json;
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}
