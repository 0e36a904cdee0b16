// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Conductor Configuration Manifest
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) covering:
// - Controller loop limits, timeouts and retry policies
// - Runtime backend selection (local process, Docker, remote executor)
// - Event log persistence
// - Swarm admission limits
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::controller::ControllerConfig;
use crate::domain::repository::StorageBackend;

pub const API_VERSION: &str = "conductor.dev/v1";
pub const KIND: &str = "ConductorConfig";

/// Top-level configuration manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// API version (must be "conductor.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ConductorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ConductorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorSpec {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub runtime: RuntimeBackendConfig,

    #[serde(default)]
    pub event_log: StorageBackend,

    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Which execution environment sessions get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RuntimeBackendConfig {
    Process(ProcessRuntimeConfig),
    Docker(DockerRuntimeConfig),
    Remote(RemoteRuntimeConfig),
}

impl Default for RuntimeBackendConfig {
    fn default() -> Self {
        RuntimeBackendConfig::Process(ProcessRuntimeConfig::default())
    }
}

impl RuntimeBackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeBackendConfig::Process(_) => "process",
            RuntimeBackendConfig::Docker(_) => "docker",
            RuntimeBackendConfig::Remote(_) => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRuntimeConfig {
    /// Parent directory for per-session workspaces (defaults to the system
    /// temp directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Per-stream cap on captured stdout / stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_browse_timeout", with = "humantime_serde")]
    pub browse_timeout: Duration,

    /// Keep workspaces on disk after the session ends.
    #[serde(default)]
    pub keep_workspace: bool,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            shell: default_shell(),
            command_timeout: default_command_timeout(),
            max_output_bytes: default_max_output_bytes(),
            browse_timeout: default_browse_timeout(),
            keep_workspace: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerRuntimeConfig {
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_workdir")]
    pub workdir: String,

    /// Docker daemon socket (e.g. `unix:///var/run/docker.sock`). Uses the
    /// local defaults when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workdir: default_container_workdir(),
            socket: None,
            network_mode: None,
            memory_bytes: None,
            command_timeout: default_command_timeout(),
            max_output_bytes: default_max_output_bytes(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRuntimeConfig {
    /// Base URL of the remote executor, e.g. `http://executor:8080`.
    pub endpoint: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Sent as a bearer token when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for RemoteRuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout: default_request_timeout(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Ceiling on concurrently running sessions across all swarm tasks.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Used when a dispatch does not name its own limit.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// How long cancelled children get before they are forcibly terminated.
    #[serde(default = "default_swarm_cancel_grace", with = "humantime_serde")]
    pub cancel_grace: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            default_concurrency: default_concurrency(),
            cancel_grace: default_swarm_cancel_grace(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_shell() -> String {
    "sh".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_browse_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_image() -> String {
    "debian:bookworm-slim".to_string()
}

fn default_container_workdir() -> String {
    "/workspace".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_sessions() -> usize {
    16
}

fn default_concurrency() -> usize {
    4
}

fn default_swarm_cancel_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for ConductorConfig {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "conductor".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ConductorSpec::default(),
        }
    }
}

impl ConductorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CONDUCTOR_CONFIG_PATH environment variable
    /// 2. ./conductor-config.yaml (working directory)
    /// 3. ~/.conductor/config.yaml (user home)
    /// 4. /etc/conductor/config.yaml (system, Unix) or C:\ProgramData\Conductor\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CONDUCTOR_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./conductor-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".conductor").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/conductor/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Conductor\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse.
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("CONDUCTOR_MAX_STEPS") {
            match val.trim().parse::<u32>() {
                Ok(steps) if steps > 0 => {
                    tracing::info!("Environment override: CONDUCTOR_MAX_STEPS={}", steps);
                    self.spec.controller.max_steps = steps;
                }
                _ => tracing::warn!(
                    "Invalid value for CONDUCTOR_MAX_STEPS: '{}'. Expected a positive integer. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("CONDUCTOR_RUNTIME_BACKEND") {
            let backend = val.trim().to_lowercase();
            let replacement = match backend.as_str() {
                name if name == self.spec.runtime.name() => None,
                "process" => Some(RuntimeBackendConfig::Process(ProcessRuntimeConfig::default())),
                "docker" => Some(RuntimeBackendConfig::Docker(DockerRuntimeConfig::default())),
                "remote" => Some(RuntimeBackendConfig::Remote(RemoteRuntimeConfig {
                    request_timeout: default_request_timeout(),
                    ..RemoteRuntimeConfig::default()
                })),
                _ => {
                    tracing::warn!(
                        "Invalid value for CONDUCTOR_RUNTIME_BACKEND: '{}'. Expected process/docker/remote. Ignoring.",
                        val
                    );
                    None
                }
            };
            if let Some(runtime) = replacement {
                tracing::info!("Environment override: CONDUCTOR_RUNTIME_BACKEND={}", backend);
                self.spec.runtime = runtime;
            }
        }

        if let Some(val) = lookup("CONDUCTOR_REMOTE_ENDPOINT") {
            if let RuntimeBackendConfig::Remote(remote) = &mut self.spec.runtime {
                tracing::info!("Environment override: CONDUCTOR_REMOTE_ENDPOINT={}", val);
                remote.endpoint = val;
            }
        }

        if let Some(val) = lookup("CONDUCTOR_METRICS_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: CONDUCTOR_METRICS_ENABLED=true");
                    self.spec.observability.metrics.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: CONDUCTOR_METRICS_ENABLED=false");
                    self.spec.observability.metrics.enabled = false;
                }
                _ => tracing::warn!(
                    "Invalid value for CONDUCTOR_METRICS_ENABLED: '{}'. Expected true/false. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let controller = &self.spec.controller;
        if controller.max_steps == 0 {
            anyhow::bail!("spec.controller.max_steps must be at least 1");
        }
        if controller.max_wall_time.is_zero() {
            anyhow::bail!("spec.controller.max_wall_time must be greater than zero");
        }
        if controller.thinker_timeout.is_zero()
            || controller.action_timeout.is_zero()
            || controller.dispose_timeout.is_zero()
        {
            anyhow::bail!("spec.controller timeouts must be greater than zero");
        }
        if controller.thinker_retry.max_attempts == 0 || controller.runtime_retry.max_attempts == 0 {
            anyhow::bail!("spec.controller retry policies need max_attempts of at least 1");
        }
        if controller.history_window.max_events == Some(0) {
            anyhow::bail!("spec.controller.history_window.max_events must be at least 1 when set");
        }

        match &self.spec.runtime {
            RuntimeBackendConfig::Process(process) => {
                if process.shell.trim().is_empty() {
                    anyhow::bail!("spec.runtime.shell cannot be empty");
                }
                if process.max_output_bytes == 0 {
                    anyhow::bail!("spec.runtime.max_output_bytes must be greater than zero");
                }
            }
            RuntimeBackendConfig::Docker(docker) => {
                if docker.image.trim().is_empty() {
                    anyhow::bail!("spec.runtime.image cannot be empty");
                }
                if !docker.workdir.starts_with('/') {
                    anyhow::bail!("spec.runtime.workdir must be an absolute path: {}", docker.workdir);
                }
            }
            RuntimeBackendConfig::Remote(remote) => {
                let url = url::Url::parse(&remote.endpoint).map_err(|e| {
                    anyhow::anyhow!("spec.runtime.endpoint '{}' is not a valid URL: {}", remote.endpoint, e)
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    anyhow::bail!("spec.runtime.endpoint must use http or https: {}", remote.endpoint);
                }
            }
        }

        if let StorageBackend::File { directory } = &self.spec.event_log {
            if directory.as_os_str().is_empty() {
                anyhow::bail!("spec.event_log.directory cannot be empty");
            }
        }

        if self.spec.swarm.max_sessions == 0 {
            anyhow::bail!("spec.swarm.max_sessions must be at least 1");
        }
        if self.spec.swarm.default_concurrency == 0 {
            anyhow::bail!("spec.swarm.default_concurrency must be at least 1");
        }
        // Children must get the chance to record their own cancellation
        // before the swarm force-terminates them.
        if self.spec.swarm.cancel_grace <= controller.cancel_grace {
            anyhow::bail!(
                "spec.swarm.cancel_grace ({:?}) must be longer than spec.controller.cancel_grace ({:?})",
                self.spec.swarm.cancel_grace,
                controller.cancel_grace
            );
        }

        let format = self.spec.observability.logging.format.as_str();
        if format != "text" && format != "json" {
            anyhow::bail!("spec.observability.logging.format must be 'text' or 'json', got '{}'", format);
        }

        Ok(())
    }
}
