//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Service settings, read from `settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level
    pub log_level: LogLevel,

    /// Emit logs as JSON
    pub json_logs: bool,

    /// Directory for rolling log files; stdout only when unset
    pub log_dir: Option<PathBuf>,

    /// HTTP gateway configuration
    pub server: ServerSettings,

    /// Where deployment workspaces are created; defaults to the layout's
    pub workspace_root: Option<PathBuf>,

    /// Base URL `owner/name` repositories are cloned from
    pub git_base_url: String,

    /// Shell used to run stage commands
    pub shell: String,

    /// Per-stage timeouts
    pub timeouts: TimeoutSettings,

    /// Event buffers and retention
    pub retention: RetentionSettings,

    /// Port injected into services that do not set `PORT`
    pub default_service_port: u16,

    /// Maximum time to wait for pipelines on shutdown, in seconds
    pub shutdown_delay_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_dir: None,
            server: ServerSettings::default(),
            workspace_root: None,
            git_base_url: "https://github.com/".to_string(),
            shell: "sh".to_string(),
            timeouts: TimeoutSettings::default(),
            retention: RetentionSettings::default(),
            default_service_port: 8080,
            shutdown_delay_secs: 30,
        }
    }
}

/// HTTP gateway settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,

    /// Origins allowed to call the API from a browser; empty allows any
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            allowed_origins: Vec::new(),
        }
    }
}

/// Stage timeouts in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub fetch_secs: u64,
    pub install_secs: u64,
    pub build_secs: u64,
    pub start_secs: u64,

    /// Time a silent service must stay alive to count as started
    pub service_grace_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            fetch_secs: 120,
            install_secs: 600,
            build_secs: 900,
            start_secs: 300,
            service_grace_secs: 5,
        }
    }
}

/// Event buffering and deployment retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Log events kept per deployment
    pub log_buffer_events: usize,

    /// Events a live subscriber may lag before resyncing
    pub subscriber_buffer_events: usize,

    /// How long finished deployments stay queryable, in seconds
    pub finished_ttl_secs: u64,

    /// How often expired deployments are evicted, in seconds
    pub reaper_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            log_buffer_events: 5_000,
            subscriber_buffer_events: 1_024,
            finished_ttl_secs: 3_600,
            reaper_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Load settings; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json::<Settings>().await.map_err(|e| {
            EngineError::ConfigError(format!(
                "failed to read {}: {}",
                file.path().display(),
                e
            ))
        })
    }
}
