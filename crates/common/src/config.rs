//! Configuration structures for ChatServe
//!
//! This module defines all configuration types used across workers and controllers.
//! Configurations are loaded from YAML files and can be overridden by environment
//! variables of the form `CHATSERVE__WORKER__STREAM_INTERVAL=4`.

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "CHATSERVE";

/// Top-level configuration for ChatServe components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Mode: either "worker" or "controller"
    pub mode: String,

    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_worker_port")]
    pub port: u16,

    /// Worker-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Controller-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerConfig>,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address the controller and clients use to reach this worker
    #[serde(default = "default_worker_address")]
    pub worker_address: String,

    /// Base URL of the controller
    #[serde(default = "default_controller_address")]
    pub controller_address: String,

    /// Model name advertised to the controller
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Maximum number of generations running at once
    #[serde(default = "default_limit_model_concurrency")]
    pub limit_model_concurrency: usize,

    /// Emit a frame every N decode steps
    #[serde(default = "default_stream_interval")]
    pub stream_interval: usize,

    /// Seconds between heartbeats
    #[serde(default = "default_heart_beat_interval")]
    pub heart_beat_interval_secs: u64,

    /// Seconds to wait before retrying a failed controller call
    #[serde(default = "default_heart_beat_retry")]
    pub heart_beat_retry_secs: u64,

    /// Timeout for a single controller call
    #[serde(default = "default_controller_timeout")]
    pub controller_timeout_secs: u64,

    /// Maximum context length of the model, in tokens
    #[serde(default = "default_context_len")]
    pub context_len: usize,

    /// Upper bound applied to a request's max_new_tokens
    #[serde(default = "default_max_new_tokens_cap")]
    pub max_new_tokens_cap: usize,

    /// Skip controller registration and heartbeats entirely
    #[serde(default)]
    pub no_register: bool,

    /// Sampling seed (random when unset)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Inference engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Settings for the bundled inference engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of sequences whose cached state may be alive at once
    #[serde(default = "default_max_cached_sequences")]
    pub max_cached_sequences: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cached_sequences: default_max_cached_sequences(),
        }
    }
}

/// Controller-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Drop workers whose last heartbeat is older than this
    #[serde(default = "default_heart_beat_expiration")]
    pub heart_beat_expiration_secs: u64,

    /// How often expired workers are swept
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval_secs: u64,

    /// Timeout for calls the controller makes to workers
    #[serde(default = "default_controller_timeout")]
    pub worker_timeout_secs: u64,

    /// Worker selection strategy
    #[serde(default)]
    pub dispatch: DispatchMethod,
}

/// Worker selection strategy for `get_worker_address`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMethod {
    /// Lowest queue_length / speed wins
    #[default]
    ShortestQueue,

    /// Random pick weighted by speed
    Lottery,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics on /metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_worker_port() -> u16 {
    21002
}

fn default_controller_port() -> u16 {
    21005
}

fn default_worker_address() -> String {
    "http://127.0.0.1:21002".to_string()
}

fn default_controller_address() -> String {
    "http://127.0.0.1:21005".to_string()
}

fn default_model_name() -> String {
    "opt-1.3b".to_string()
}

fn default_limit_model_concurrency() -> usize {
    5
}

fn default_stream_interval() -> usize {
    2
}

fn default_heart_beat_interval() -> u64 {
    30
}

fn default_heart_beat_retry() -> u64 {
    5
}

fn default_controller_timeout() -> u64 {
    5
}

fn default_context_len() -> usize {
    2048
}

fn default_max_new_tokens_cap() -> usize {
    1024
}

fn default_max_cached_sequences() -> usize {
    64
}

fn default_heart_beat_expiration() -> u64 {
    90
}

fn default_expiry_check_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_address: default_worker_address(),
            controller_address: default_controller_address(),
            model_name: default_model_name(),
            limit_model_concurrency: default_limit_model_concurrency(),
            stream_interval: default_stream_interval(),
            heart_beat_interval_secs: default_heart_beat_interval(),
            heart_beat_retry_secs: default_heart_beat_retry(),
            controller_timeout_secs: default_controller_timeout(),
            context_len: default_context_len(),
            max_new_tokens_cap: default_max_new_tokens_cap(),
            no_register: false,
            seed: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heart_beat_expiration_secs: default_heart_beat_expiration(),
            expiry_check_interval_secs: default_expiry_check_interval(),
            worker_timeout_secs: default_controller_timeout(),
            dispatch: DispatchMethod::default(),
        }
    }
}

impl WorkerConfig {
    /// Heartbeat period
    pub fn heart_beat_interval(&self) -> Duration {
        Duration::from_secs(self.heart_beat_interval_secs)
    }

    /// Backoff between failed controller calls
    pub fn heart_beat_retry(&self) -> Duration {
        Duration::from_secs(self.heart_beat_retry_secs)
    }

    /// Per-call controller timeout
    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller_timeout_secs)
    }

    /// Validate worker settings
    pub fn validate(&self) -> Result<()> {
        if self.limit_model_concurrency == 0 {
            return Err(ServeError::config("limit_model_concurrency must be at least 1"));
        }
        if self.stream_interval == 0 {
            return Err(ServeError::config("stream_interval must be at least 1"));
        }
        if self.heart_beat_interval_secs == 0 {
            return Err(ServeError::config("heart_beat_interval_secs must be at least 1"));
        }
        if self.max_new_tokens_cap == 0 {
            return Err(ServeError::config("max_new_tokens_cap must be at least 1"));
        }
        // Prompt truncation keeps context_len - max_new_tokens - 8 tokens
        if self.context_len <= self.max_new_tokens_cap + 8 {
            return Err(ServeError::config(format!(
                "context_len {} leaves no room for prompts with max_new_tokens_cap {}",
                self.context_len, self.max_new_tokens_cap
            )));
        }
        if self.engine.max_cached_sequences == 0 {
            return Err(ServeError::config("engine.max_cached_sequences must be at least 1"));
        }
        Ok(())
    }
}

impl ControllerConfig {
    /// Heartbeat expiration window
    pub fn heart_beat_expiration(&self) -> Duration {
        Duration::from_secs(self.heart_beat_expiration_secs)
    }

    /// Sweep period for expired workers
    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }

    /// Timeout for controller → worker calls
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

impl ServeConfig {
    /// Defaults for a worker process
    pub fn worker_defaults() -> Self {
        ServeConfig {
            mode: "worker".to_string(),
            bind_address: default_bind_address(),
            port: default_worker_port(),
            worker: Some(WorkerConfig::default()),
            controller: None,
            observability: Some(ObservabilityConfig::default()),
        }
    }

    /// Defaults for a controller process
    pub fn controller_defaults() -> Self {
        ServeConfig {
            mode: "controller".to_string(),
            bind_address: default_bind_address(),
            port: default_controller_port(),
            worker: None,
            controller: Some(ControllerConfig::default()),
            observability: Some(ObservabilityConfig::default()),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ServeError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        Self::from_yaml_str(&content)
            .map_err(|e| ServeError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ServeConfig = serde_yaml::from_str(content)
            .map_err(|e| ServeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: mode defaults, then the optional YAML file,
    /// then `CHATSERVE__*` environment variables
    pub fn load(mode: &str, path: Option<&Path>) -> Result<Self> {
        let defaults = match mode {
            "worker" => Self::worker_defaults(),
            "controller" => Self::controller_defaults(),
            other => return Err(ServeError::config(format!("Invalid mode: {}", other))),
        };

        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: ServeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "worker" => match &self.worker {
                Some(worker) => worker.validate()?,
                None => return Err(ServeError::config("Worker config required for worker mode")),
            },
            "controller" => {
                let controller = self
                    .controller
                    .as_ref()
                    .ok_or_else(|| ServeError::config("Controller config required for controller mode"))?;
                if controller.expiry_check_interval_secs == 0 {
                    return Err(ServeError::config("expiry_check_interval_secs must be at least 1"));
                }
            }
            _ => {
                return Err(ServeError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Socket address string to bind the HTTP server to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Worker section, or an error if this is not a worker config
    pub fn worker_config(&self) -> Result<&WorkerConfig> {
        self.worker
            .as_ref()
            .ok_or_else(|| ServeError::config("Worker config not found"))
    }

    /// Controller section, or an error if this is not a controller config
    pub fn controller_config(&self) -> Result<&ControllerConfig> {
        self.controller
            .as_ref()
            .ok_or_else(|| ServeError::config("Controller config not found"))
    }

    /// Whether /metrics should be served
    pub fn metrics_enabled(&self) -> bool {
        self.observability
            .as_ref()
            .map(|o| o.enable_metrics)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation() {
        let config = ServeConfig::worker_defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "127.0.0.1:21002");
    }

    #[test]
    fn test_config_validation_missing_worker() {
        let config = ServeConfig {
            mode: "worker".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 21002,
            worker: None,
            controller: None,
            observability: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_stream_interval_rejected() {
        let mut config = ServeConfig::worker_defaults();
        if let Some(worker) = config.worker.as_mut() {
            worker.stream_interval = 0;
        }
        assert!(matches!(config.validate(), Err(ServeError::Config(_))));
    }

    #[test]
    fn test_context_too_small_for_cap() {
        let mut config = ServeConfig::worker_defaults();
        if let Some(worker) = config.worker.as_mut() {
            worker.context_len = 512;
            worker.max_new_tokens_cap = 1024;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_fills_defaults() {
        let yaml = r#"
mode: worker
port: 31000
worker:
  model_name: opt-350m
  limit_model_concurrency: 2
"#;
        let config = ServeConfig::from_yaml_str(yaml).unwrap();
        let worker = config.worker_config().unwrap();
        assert_eq!(config.port, 31000);
        assert_eq!(worker.model_name, "opt-350m");
        assert_eq!(worker.limit_model_concurrency, 2);
        assert_eq!(worker.stream_interval, 2);
        assert_eq!(worker.context_len, 2048);
        assert!(!worker.no_register);
    }

    #[test]
    fn test_controller_yaml() {
        let yaml = r#"
mode: controller
port: 21005
controller:
  dispatch: lottery
"#;
        let config = ServeConfig::from_yaml_str(yaml).unwrap();
        let controller = config.controller_config().unwrap();
        assert_eq!(controller.dispatch, DispatchMethod::Lottery);
        assert_eq!(controller.heart_beat_expiration_secs, 90);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: worker\nworker:\n  stream_interval: 4").unwrap();

        let config = ServeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker_config().unwrap().stream_interval, 4);
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "mode: worker\nport: 40001\nworker:\n  model_name: layered-model").unwrap();

        let config = ServeConfig::load("worker", Some(file.path())).unwrap();
        let worker = config.worker_config().unwrap();
        assert_eq!(config.port, 40001);
        assert_eq!(worker.model_name, "layered-model");
        assert_eq!(worker.limit_model_concurrency, 5);
    }

    #[test]
    fn test_load_rejects_unknown_mode() {
        assert!(ServeConfig::load("gateway", None).is_err());
    }

    #[test]
    fn test_shipped_configs_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");

        let worker = ServeConfig::from_file(dir.join("worker.yaml")).unwrap();
        assert_eq!(worker.port, 21002);
        assert_eq!(worker.worker_config().unwrap().limit_model_concurrency, 5);

        let controller = ServeConfig::from_file(dir.join("controller.yaml")).unwrap();
        assert_eq!(controller.controller_config().unwrap().dispatch, DispatchMethod::ShortestQueue);
    }
}
