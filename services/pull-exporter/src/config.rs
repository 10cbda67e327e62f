//! Configuration for the pull exporter.
//!
//! Two layers are loaded once at startup:
//! - [`Config`]: process settings from environment variables
//! - [`FleetConfig`]: the YAML fleet file describing what to pull and how often

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_INTERVAL_MINUTES: u64 = 5;

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the fleet file.
    pub fleet_file: PathBuf,

    /// HTTP listen address.
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Docker Engine Unix socket.
    pub docker_socket: PathBuf,

    /// containerd Unix socket.
    pub containerd_socket: PathBuf,

    /// containerd namespace images are pulled into.
    pub containerd_namespace: String,

    /// How often containerd ingest progress is polled during a pull.
    pub progress_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let fleet_file = std::env::var("PULL_EXPORTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("files.yaml"));

        let listen_addr = std::env::var("PULL_EXPORTER_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let log_level =
            std::env::var("PULL_EXPORTER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let docker_host = std::env::var("DOCKER_HOST")
            .unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string());
        let docker_socket = docker_socket_path(&docker_host)?;

        let containerd_socket = std::env::var("CONTAINERD_ADDRESS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/containerd/containerd.sock"));

        let containerd_namespace =
            std::env::var("CONTAINERD_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let progress_interval_ms: u64 = std::env::var("PULL_EXPORTER_PROGRESS_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PULL_EXPORTER_PROGRESS_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(500);
        let progress_interval = Duration::from_millis(progress_interval_ms.max(50));

        Ok(Self {
            fleet_file,
            listen_addr,
            log_level,
            docker_socket,
            containerd_socket,
            containerd_namespace,
            progress_interval,
        })
    }
}

/// Resolve a `DOCKER_HOST` value to a Unix socket path.
///
/// Only `unix://` endpoints (or bare paths) are supported.
pub fn docker_socket_path(docker_host: &str) -> Result<PathBuf> {
    if let Some(path) = docker_host.strip_prefix("unix://") {
        return Ok(PathBuf::from(path));
    }
    if docker_host.starts_with('/') {
        return Ok(PathBuf::from(docker_host));
    }
    anyhow::bail!("unsupported DOCKER_HOST {docker_host:?}: only unix:// sockets are supported")
}

/// One pullable unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageSpec {
    /// Image reference as the runtime should resolve it (e.g. `nginx:latest`).
    pub image: String,

    /// Free-form classification used only as a metric dimension.
    #[serde(default)]
    pub label: String,
}

impl ImageSpec {
    pub fn new(image: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            label: label.into(),
        }
    }
}

/// Container runtime used to pull images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Containerd,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Containerd => write!(f, "containerd"),
        }
    }
}

/// The fleet file: what to pull, where we are, and how often.
///
/// Read-only for the process lifetime. Every field is optional so a partially
/// populated file still loads; an empty image list is a no-op cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FleetConfig {
    /// Site tag attached to every metric.
    #[serde(default)]
    pub location: String,

    /// Images in pull order.
    #[serde(default)]
    pub image_downloads: Vec<ImageSpec>,

    /// Cycle period in minutes.
    #[serde(default = "default_interval_minutes", rename = "minute_time_to_pull")]
    pub interval_minutes: u64,

    /// Which runtime to pull with.
    #[serde(default, rename = "container_type")]
    pub backend_kind: BackendKind,

    /// Optional cron expression; overrides `minute_time_to_pull` when set.
    #[serde(default)]
    pub schedule: Option<String>,
}

fn default_interval_minutes() -> u64 {
    DEFAULT_INTERVAL_MINUTES
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            location: String::new(),
            image_downloads: Vec::new(),
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            backend_kind: BackendKind::default(),
            schedule: None,
        }
    }
}

impl FleetConfig {
    /// Load the fleet file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid fleet file {}", path.display()))
    }

    /// Parse a fleet file from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to a mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FleetConfig = serde_yaml::from_str(raw)?;
        if let Some(expr) = &config.schedule {
            cron::Schedule::from_str(expr)
                .with_context(|| format!("invalid cron schedule {expr:?}"))?;
        }
        Ok(config)
    }

    /// The cycle period, never shorter than one minute.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }
}
