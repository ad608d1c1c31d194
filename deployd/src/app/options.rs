//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::broadcaster::EventLogLimits;
use crate::deploy::pipeline::PipelineOptions;
use crate::deploy::runner::RunnerOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::reaper;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Where deployment workspaces are created
    pub workspace_root: PathBuf,

    /// Base URL `owner/name` repositories are resolved against
    pub git_base_url: String,

    /// Limit for cloning a repository
    pub fetch_timeout: Duration,

    /// Process runner configuration
    pub runner: RunnerOptions,

    /// Stage limits
    pub pipeline: PipelineOptions,

    /// Event buffer sizes
    pub event_log: EventLogLimits,

    /// Server configuration
    pub server: ServerOptions,

    /// Reaper worker options
    pub reaper: reaper::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        let workspace_root = settings
            .workspace_root
            .clone()
            .unwrap_or_else(|| StorageLayout::default().workspaces_dir().path().to_path_buf());
        let timeouts = &settings.timeouts;
        let retention = &settings.retention;

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.shutdown_delay_secs),
            },
            workspace_root,
            git_base_url: settings.git_base_url.clone(),
            fetch_timeout: Duration::from_secs(timeouts.fetch_secs),
            runner: RunnerOptions {
                shell: settings.shell.clone(),
            },
            pipeline: PipelineOptions {
                install_timeout: Duration::from_secs(timeouts.install_secs),
                build_timeout: Duration::from_secs(timeouts.build_secs),
                start_timeout: Duration::from_secs(timeouts.start_secs),
                service_grace_period: Duration::from_secs(timeouts.service_grace_secs),
                default_port: settings.default_service_port,
            },
            event_log: EventLogLimits {
                retained: retention.log_buffer_events.max(1),
                per_subscriber: retention.subscriber_buffer_events.max(1),
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                allowed_origins: settings.server.allowed_origins.clone(),
            },
            reaper: reaper::Options {
                interval: Duration::from_secs(retention.reaper_interval_secs.max(1)),
                retention: Duration::from_secs(retention.finished_ttl_secs),
            },
        }
    }
}

/// Lifecycle options for the service
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins; empty allows any
    pub allowed_origins: Vec<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            allowed_origins: Vec::new(),
        }
    }
}
