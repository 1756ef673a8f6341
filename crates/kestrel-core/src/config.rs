//! Configuration structures for Kestrel

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable the master uses to hand its effective configuration
/// to the processes it spawns
pub const CHILD_CONFIG_ENV: &str = "KESTREL_CHILD_CONFIG";

/// Main configuration for Kestrel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    /// Queue backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KestrelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Merge configuration from file and environment (env vars take precedence)
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `KESTREL_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("KESTREL_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Ok(path) = std::env::var("KESTREL_QLESS_SCRIPT") {
            self.backend.script_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("KESTREL_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Ok(queues) = std::env::var("KESTREL_QUEUES") {
            self.worker.queues = split_queues(&queues);
        }
        if let Ok(interval) = std::env::var("KESTREL_INTERVAL") {
            self.worker.interval = interval.parse().map_err(|_| {
                crate::Error::Configuration(format!("KESTREL_INTERVAL is not a number: {}", interval))
            })?;
        }
        Ok(())
    }

    /// Serialize for a child process
    pub fn to_child_env(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read the configuration handed down by the master, if any
    pub fn from_child_env() -> crate::Result<Option<Self>> {
        match std::env::var(CHILD_CONFIG_ENV) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(_) => Ok(None),
        }
    }
}

fn split_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(String::from)
        .collect()
}

/// Queue backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Connection URL (`redis://` or `memory://`)
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Path to the qless-core Lua script
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

fn default_backend_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_script_path() -> PathBuf {
    PathBuf::from("qless-core/qless.lua")
}

fn default_pool_size() -> usize {
    4
}

fn default_connection_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            script_path: default_script_path(),
            pool_size: default_pool_size(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

/// Queue reservation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReserverKind {
    #[default]
    Ordered,
    Priority,
    RoundRobin,
    ShuffledRoundRobin,
}

impl std::str::FromStr for ReserverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ordered" => Ok(ReserverKind::Ordered),
            "priority" => Ok(ReserverKind::Priority),
            "round-robin" | "round_robin" | "roundrobin" => Ok(ReserverKind::RoundRobin),
            "shuffled-round-robin" | "shuffled_round_robin" | "shuffled" => {
                Ok(ReserverKind::ShuffledRoundRobin)
            }
            _ => Err(format!("Unknown reserver: {}", s)),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name (defaults to `<hostname>-<pid>`)
    pub name: Option<String>,

    /// Hostname
    pub hostname: Option<String>,

    /// Queues to reserve from
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<String>,

    /// Reservation strategy
    #[serde(default)]
    pub reserver: ReserverKind,

    /// Queue priorities for the priority reserver (higher = polled first)
    #[serde(default)]
    pub priorities: HashMap<String, i32>,

    /// Drop queues below this priority
    pub min_priority: Option<i32>,

    /// Drop queues above this priority
    pub max_priority: Option<i32>,

    /// Seconds to sleep when no job is available (0 = drain once and stop)
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Sleep increment while paused, in milliseconds
    #[serde(default = "default_pause_interval_ms")]
    pub pause_interval_ms: u64,

    /// Stop after this many jobs
    pub max_jobs: Option<u64>,

    /// Stop after this many seconds
    pub time_limit: Option<u64>,

    /// Stop once resident memory exceeds this many bytes
    pub memory_limit: Option<u64>,

    /// Handler used for jobs whose class has no registered handler
    pub default_handler: Option<String>,
}

fn default_worker_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_interval() -> u64 {
    5
}

fn default_pause_interval_ms() -> u64 {
    250
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            hostname: None,
            queues: default_worker_queues(),
            reserver: ReserverKind::default(),
            priorities: HashMap::new(),
            min_priority: None,
            max_priority: None,
            interval: default_interval(),
            pause_interval_ms: default_pause_interval_ms(),
            max_jobs: None,
            time_limit: None,
            memory_limit: None,
            default_handler: None,
        }
    }
}

impl WorkerConfig {
    /// Get the worker name, generating one if not set
    pub fn get_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let hostname = self.get_hostname();
            let pid = std::process::id();
            format!("{}-{}", hostname, pid)
        })
    }

    /// Get the hostname
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact or json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
