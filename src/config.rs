//! Configuration types.
//!
//! Resolution precedence: CLI flags > `TASK_RELAY_*` environment variables >
//! `<config-dir>/<profile>.json` > built-in defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Deployment profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidValue {
                key: "profile".into(),
                message: format!("expected dev|staging|prod, got {other}"),
            }),
        }
    }
}

/// Where persisted state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::InvalidValue {
                key: "storage".into(),
                message: format!("expected memory|sqlite, got {other}"),
            }),
        }
    }
}

/// Answer Runner knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub enabled: bool,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub max_retries: u32,
    pub default_timeout: Duration,
    pub default_max_tokens: u32,
    pub cache_ttl_seconds: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: None,
            max_retries: 3,
            default_timeout: Duration::from_secs(60),
            default_max_tokens: 4096,
            cache_ttl_seconds: 86_400,
        }
    }
}

/// Worker pool knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    /// Command invoked as the executor backend; unset means jobs cannot run.
    pub executor_command: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(60),
            executor_command: None,
        }
    }
}

/// HTTP bridge knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub port: u16,
    pub long_poll_timeout: Duration,
    pub sse_heartbeat: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: 3415,
            long_poll_timeout: Duration::from_secs(30),
            sse_heartbeat: Duration::from_secs(15),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub config_dir: Option<PathBuf>,
    pub storage: StorageKind,
    pub sqlite_path: Option<PathBuf>,
    pub artifact_root: PathBuf,
    pub worker: WorkerConfig,
    pub bridge: BridgeConfig,
    pub runner: RunnerConfig,
    pub janitor_interval: Duration,
    /// `TASK_RELAY_FACT_*` contributions to the default envelope facts.
    pub facts: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Dev,
            config_dir: None,
            storage: StorageKind::Memory,
            sqlite_path: None,
            artifact_root: PathBuf::from(".task-relay/artifacts"),
            worker: WorkerConfig::default(),
            bridge: BridgeConfig::default(),
            runner: RunnerConfig::default(),
            janitor_interval: Duration::from_secs(5),
            facts: BTreeMap::new(),
        }
    }
}

/// CLI flag values handed in by `main`. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub profile: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub storage: Option<String>,
    pub sqlite: Option<PathBuf>,
}

/// Optional overrides loadable from `<config-dir>/<profile>.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    storage: Option<String>,
    sqlite: Option<String>,
    artifact_root: Option<String>,
    http_port: Option<u16>,
    max_concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    lease_ttl_ms: Option<u64>,
    long_poll_timeout_ms: Option<u64>,
    sse_heartbeat_ms: Option<u64>,
    runner_enabled: Option<bool>,
    model: Option<String>,
    max_retries: Option<u32>,
    executor_command: Option<String>,
}

impl Config {
    /// Resolve the effective configuration from flags, environment,
    /// profile file, and defaults.
    pub fn resolve(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let profile: Profile = match cli
            .profile
            .clone()
            .or_else(|| env_var("TASK_RELAY_PROFILE"))
        {
            Some(raw) => raw.parse()?,
            None => Profile::default(),
        };

        let config_dir = cli
            .config_dir
            .clone()
            .or_else(|| env_var("TASK_RELAY_CONFIG_DIR").map(PathBuf::from));

        let mut config = Config {
            profile,
            config_dir: config_dir.clone(),
            ..Config::default()
        };

        if let Some(dir) = &config_dir {
            let path = dir.join(format!("{}.json", profile.as_str()));
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                let file: ConfigFile =
                    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                config.apply_file(file)?;
            }
        }

        config.apply_env()?;
        config.apply_cli(cli)?;
        config.collect_facts();
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        if let Some(storage) = file.storage {
            self.storage = storage.parse()?;
        }
        if let Some(path) = file.sqlite {
            self.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(root) = file.artifact_root {
            self.artifact_root = PathBuf::from(root);
        }
        if let Some(port) = file.http_port {
            self.bridge.port = port;
        }
        if let Some(n) = file.max_concurrency {
            self.worker.max_concurrency = n;
        }
        if let Some(ms) = file.poll_interval_ms {
            self.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.heartbeat_interval_ms {
            self.worker.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.lease_ttl_ms {
            self.worker.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = file.long_poll_timeout_ms {
            self.bridge.long_poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.sse_heartbeat_ms {
            self.bridge.sse_heartbeat = Duration::from_millis(ms);
        }
        if let Some(enabled) = file.runner_enabled {
            self.runner.enabled = enabled;
        }
        if let Some(model) = file.model {
            self.runner.model = model;
        }
        if let Some(retries) = file.max_retries {
            self.runner.max_retries = retries;
        }
        if let Some(cmd) = file.executor_command {
            self.worker.executor_command = Some(cmd);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(raw) = env_var("TASK_RELAY_STORAGE") {
            self.storage = raw.parse()?;
        }
        if let Some(raw) = env_var("TASK_RELAY_SQLITE") {
            self.sqlite_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_var("TASK_RELAY_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(raw);
        }
        if let Some(port) = parse_env("TASK_RELAY_HTTP_PORT")? {
            self.bridge.port = port;
        }
        if let Some(n) = parse_env("TASK_RELAY_MAX_CONCURRENCY")? {
            self.worker.max_concurrency = n;
        }
        if let Some(ms) = parse_env("TASK_RELAY_POLL_INTERVAL_MS")? {
            self.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("TASK_RELAY_HEARTBEAT_INTERVAL_MS")? {
            self.worker.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("TASK_RELAY_LEASE_TTL_MS")? {
            self.worker.lease_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("TASK_RELAY_LONG_POLL_TIMEOUT_MS")? {
            self.bridge.long_poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("TASK_RELAY_SSE_HEARTBEAT_MS")? {
            self.bridge.sse_heartbeat = Duration::from_millis(ms);
        }
        if let Some(raw) = env_var("TASK_RELAY_RUNNER_ENABLED") {
            self.runner.enabled = raw != "false" && raw != "0";
        }
        if let Some(model) = env_var("TASK_RELAY_MODEL") {
            self.runner.model = model;
        }
        if let Some(retries) = parse_env("TASK_RELAY_MAX_RETRIES")? {
            self.runner.max_retries = retries;
        }
        if let Some(cmd) = env_var("TASK_RELAY_EXECUTOR_CMD") {
            self.worker.executor_command = Some(cmd);
        }
        if let Some(key) = env_var("ANTHROPIC_API_KEY") {
            self.runner.api_key = Some(SecretString::from(key));
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(raw) = &cli.storage {
            self.storage = raw.parse()?;
        }
        if let Some(path) = &cli.sqlite {
            self.sqlite_path = Some(path.clone());
        }
        Ok(())
    }

    fn collect_facts(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("TASK_RELAY_FACT_") {
                if !name.is_empty() {
                    self.facts.insert(name.to_ascii_lowercase(), value);
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage == StorageKind::Sqlite && self.sqlite_path.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "sqlite".into(),
                hint: "pass --sqlite <path> or TASK_RELAY_SQLITE when --storage sqlite".into(),
            });
        }
        if self.runner.enabled && self.runner.api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()));
        }
        if self.worker.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "maxConcurrency".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw.parse().map(Some).map_err(|e| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{e}"),
        }),
        None => Ok(None),
    }
}
