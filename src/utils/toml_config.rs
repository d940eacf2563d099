//! TOML-based configuration for the hub
//!
//! Declarative settings for the listener, heartbeat policy, dispatch policy,
//! circuit breaking, the agent-type allow-list and the research pipeline,
//! loaded from a TOML file (`ares-mcp.toml`) with `MCP_*` environment overrides.
//!
//! # Hot Reloading
//!
//! Configuration changes are detected and applied at runtime. Dispatch reads
//! its settings through `HubConfigManager` on every decision, so a new
//! strategy, timeout or retry budget applies to the next task.

use crate::dispatch::LoadBalanceStrategy;
use crate::types::AgentType;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "ares-mcp.toml";

/// Root configuration structure loaded from ares-mcp.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Agent admission policy
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Multi-stage research workflow
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// ============= Server Configuration =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Concurrent WebSocket sessions accepted before new upgrades are refused
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Watch the config file and apply changes without restart
    #[serde(default = "default_true")]
    pub hot_reload: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_connections() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            hot_reload: default_true(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============= Heartbeat Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Expected heartbeat cadence
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Registrations silent for longer than this are evicted
    #[serde(default = "default_heartbeat_ttl")]
    pub ttl_secs: u64,

    /// Missed intervals before an agent is unreachable
    #[serde(default = "default_grace_multiplier")]
    pub grace_multiplier: u32,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u64 {
    300
}

fn default_grace_multiplier() -> u32 {
    2
}

fn default_sweep_interval() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            ttl_secs: default_heartbeat_ttl(),
            grace_multiplier: default_grace_multiplier(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Silence after which an agent counts as unreachable.
    pub fn unreachable_after(&self) -> Duration {
        self.interval() * self.grace_multiplier
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ============= Dispatch Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-attempt deadline and backlog wait bound, unless a task overrides it
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub strategy: LoadBalanceStrategy,

    /// Weight of latency against load for the adaptive strategy (0.0..=1.0)
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Tasks waiting for an agent before submissions are refused
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout watcher tick
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// How long finished tasks stay queryable
    #[serde(default = "default_result_retention")]
    pub result_retention_secs: u64,

    /// Terminal outcomes buffered for the research driver. Read at startup.
    #[serde(default = "default_outcome_buffer")]
    pub outcome_buffer: usize,
}

fn default_task_timeout() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_latency_weight() -> f64 {
    0.5
}

fn default_backlog_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_watch_interval_ms() -> u64 {
    250
}

fn default_result_retention() -> u64 {
    600
}

fn default_outcome_buffer() -> usize {
    1024
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            retry_attempts: default_retry_attempts(),
            strategy: LoadBalanceStrategy::default(),
            latency_weight: default_latency_weight(),
            backlog_capacity: default_backlog_capacity(),
            workers: default_workers(),
            watch_interval_ms: default_watch_interval_ms(),
            result_retention_secs: default_result_retention(),
            outcome_buffer: default_outcome_buffer(),
        }
    }
}

impl DispatchConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    /// Total attempts a task may consume.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

// ============= Circuit Breaker Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Upper bound for the doubled cool-down after failed trials
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30
}

fn default_max_cooldown() -> u64 {
    300
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

// ============= Agent Admission =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<AgentType>,
}

fn default_allowed_types() -> Vec<AgentType> {
    AgentType::ALL.to_vec()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
        }
    }
}

impl AgentsConfig {
    pub fn allows(&self, agent_type: AgentType) -> bool {
        self.allowed_types.contains(&agent_type)
    }
}

// ============= Research Pipeline =============

/// One stage of the research workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
}

impl StageConfig {
    fn new(name: &str, capability: &str, agent_type: AgentType) -> Self {
        Self {
            name: name.to_string(),
            capability: capability.to_string(),
            agent_type: Some(agent_type),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,

    #[serde(default = "default_stage_priority")]
    pub stage_priority: u8,
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("plan", "plan_research", AgentType::Planning),
        StageConfig::new("search", "literature_search", AgentType::LiteratureSearch),
        StageConfig::new(
            "synthesize",
            "synthesize_findings",
            AgentType::SynthesisReview,
        ),
        StageConfig::new("review", "review_synthesis", AgentType::ResearchManager),
    ]
}

fn default_stage_priority() -> u8 {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            stage_priority: default_stage_priority(),
        }
    }
}

impl PipelineConfig {
    pub fn stage(&self, name: &str) -> Option<(usize, &StageConfig)> {
        self.stages.iter().enumerate().find(|(_, s)| s.name == name)
    }
}

// ============= Configuration Loading & Validation =============

/// Configuration warnings that don't prevent operation but may indicate issues
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub kind: ConfigWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarningKind {
    /// A pipeline stage targets an agent type outside the allow-list
    UnreachableStage,
    /// TTL shorter than the unreachable window; agents are evicted before being marked
    ShortTtl,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid value for environment variable '{0}': {1}")]
    InvalidEnvVar(String, String),

    #[error("Watch error: {0}")]
    WatchError(#[from] notify::Error),
}

impl From<ConfigError> for crate::types::AppError {
    fn from(err: ConfigError) -> Self {
        crate::types::AppError::Configuration(err.to_string())
    }
}

impl HubConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply `MCP_*` environment overrides before
    /// validating.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        super::config::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = HubConfig::default();
        super::config::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than 0".into());
        }
        if self.heartbeat.interval_secs == 0 {
            return invalid("heartbeat.interval_secs must be greater than 0".into());
        }
        if self.heartbeat.grace_multiplier == 0 {
            return invalid("heartbeat.grace_multiplier must be at least 1".into());
        }
        if self.heartbeat.ttl_secs == 0 {
            return invalid("heartbeat.ttl_secs must be greater than 0".into());
        }
        if self.heartbeat.sweep_interval_secs == 0 {
            return invalid("heartbeat.sweep_interval_secs must be greater than 0".into());
        }
        if self.dispatch.task_timeout_secs == 0 {
            return invalid("dispatch.task_timeout_secs must be greater than 0".into());
        }
        if self.dispatch.workers == 0 {
            return invalid("dispatch.workers must be greater than 0".into());
        }
        if self.dispatch.backlog_capacity == 0 {
            return invalid("dispatch.backlog_capacity must be greater than 0".into());
        }
        if self.dispatch.outcome_buffer == 0 {
            return invalid("dispatch.outcome_buffer must be greater than 0".into());
        }
        if self.dispatch.watch_interval_ms == 0 {
            return invalid("dispatch.watch_interval_ms must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.dispatch.latency_weight) {
            return invalid(format!(
                "dispatch.latency_weight must be between 0.0 and 1.0, got {}",
                self.dispatch.latency_weight
            ));
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return invalid("circuit_breaker.failure_threshold must be greater than 0".into());
            }
            if self.circuit_breaker.cooldown_secs == 0 {
                return invalid("circuit_breaker.cooldown_secs must be greater than 0".into());
            }
            if self.circuit_breaker.max_cooldown_secs < self.circuit_breaker.cooldown_secs {
                return invalid(
                    "circuit_breaker.max_cooldown_secs must not be below cooldown_secs".into(),
                );
            }
        }
        if self.agents.allowed_types.is_empty() {
            return invalid("agents.allowed_types must list at least one agent type".into());
        }
        if self.pipeline.stages.is_empty() {
            return invalid("pipeline.stages must define at least one stage".into());
        }

        let mut seen = HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.name.trim().is_empty() || stage.capability.trim().is_empty() {
                return invalid("pipeline stages need a name and a capability".into());
            }
            if !seen.insert(stage.name.as_str()) {
                return invalid(format!("duplicate pipeline stage '{}'", stage.name));
            }
        }

        Ok(())
    }

    /// Validate and collect non-fatal warnings
    pub fn validate_with_warnings(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        self.validate()?;

        let mut warnings = Vec::new();

        for stage in &self.pipeline.stages {
            let Some(agent_type) = stage.agent_type else {
                continue;
            };
            if !self.agents.allows(agent_type) {
                warnings.push(ConfigWarning {
                    kind: ConfigWarningKind::UnreachableStage,
                    message: format!(
                        "Pipeline stage '{}' targets agent type '{}' which is not in agents.allowed_types",
                        stage.name, agent_type
                    ),
                });
            }
        }

        if self.heartbeat.ttl() < self.heartbeat.unreachable_after() {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::ShortTtl,
                message: format!(
                    "heartbeat.ttl_secs ({}) is shorter than interval x grace ({}s)",
                    self.heartbeat.ttl_secs,
                    self.heartbeat.unreachable_after().as_secs()
                ),
            });
        }

        Ok(warnings)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("cannot serialize config: {}", e)))
    }
}

// ============= Hot Reloading Configuration Manager =============

/// Thread-safe configuration manager with hot reloading support
pub struct HubConfigManager {
    config: Arc<ArcSwap<HubConfig>>,
    config_path: PathBuf,
    watcher: RwLock<Option<RecommendedWatcher>>,
    reload_tx: Option<mpsc::UnboundedSender<()>>,
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .map_err(ConfigError::ReadError)?
            .join(path))
    }
}

impl HubConfigManager {
    /// Create a new configuration manager and load the initial config
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = absolute(path.as_ref())?;
        let config = HubConfig::load_with_env(&path)?;
        Ok(Self::build(config, path))
    }

    /// Like [`HubConfigManager::new`], but falls back to defaults plus
    /// environment when the file does not exist yet.
    pub fn new_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = absolute(path.as_ref())?;
        let config = if path.exists() {
            HubConfig::load_with_env(&path)?
        } else {
            warn!(
                "Config file {:?} not found, using defaults and environment",
                path
            );
            HubConfig::from_env()?
        };
        Ok(Self::build(config, path))
    }

    fn build(config: HubConfig, path: PathBuf) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path: path,
            watcher: RwLock::new(None),
            reload_tx: None,
        }
    }

    /// Get the current configuration (lockless read)
    pub fn config(&self) -> Arc<HubConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Manually reload the configuration from disk
    pub fn reload(&self) -> Result<(), ConfigError> {
        info!("Reloading configuration from {:?}", self.config_path);

        let new_config = HubConfig::load_with_env(&self.config_path)?;
        self.config.store(Arc::new(new_config));

        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Replace the live configuration after validating it.
    pub fn replace(&self, config: HubConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Start watching for configuration file changes
    pub fn start_watching(&mut self) -> Result<(), ConfigError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        self.reload_tx = Some(tx.clone());

        let config_path = self.config_path.clone();
        let config_arc = Arc::clone(&self.config);
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touches_config = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if touches_config && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => {
                    error!("Config watcher error: {:?}", e);
                }
            }
        })?;

        // Watch the parent directory so editors that replace the file are seen
        if let Some(parent) = self.config_path.parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        *self.watcher.write() = Some(watcher);

        tokio::spawn(async move {
            let mut last_reload: Option<tokio::time::Instant> = None;
            let debounce_duration = Duration::from_millis(500);

            while rx.recv().await.is_some() {
                if last_reload.is_some_and(|at| at.elapsed() < debounce_duration) {
                    continue;
                }

                // Let the writer finish
                tokio::time::sleep(Duration::from_millis(100)).await;

                match HubConfig::load_with_env(&config_path) {
                    Ok(new_config) => {
                        config_arc.store(Arc::new(new_config));
                        info!("Configuration hot-reloaded successfully");
                        last_reload = Some(tokio::time::Instant::now());
                    }
                    Err(e) => {
                        warn!(
                            "Failed to hot-reload config: {}. Keeping previous config.",
                            e
                        );
                    }
                }
            }
        });

        info!("Configuration hot-reload watcher started");
        Ok(())
    }

    /// Stop watching for configuration changes
    pub fn stop_watching(&self) {
        *self.watcher.write() = None;
        info!("Configuration hot-reload watcher stopped");
    }
}

impl Clone for HubConfigManager {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            config_path: self.config_path.clone(),
            watcher: RwLock::new(None), // Watcher is not cloned
            reload_tx: self.reload_tx.clone(),
        }
    }
}

impl HubConfigManager {
    /// Create a config manager directly from a config (useful for testing)
    /// This won't have file watching capabilities.
    pub fn from_config(config: HubConfig) -> Self {
        Self::build(config, PathBuf::from("test-config.toml"))
    }
}
