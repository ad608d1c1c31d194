//! Shared fixtures

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use deployd::deploy::broadcaster::EventLogLimits;
use deployd::deploy::fsm::DeploymentState;
use deployd::deploy::git::SourceFetcher;
use deployd::deploy::pipeline::{Pipeline, PipelineOptions};
use deployd::deploy::registry::{Deployment, Registry};
use deployd::deploy::runner::{LineSink, ProcessRunner, RunnerOptions};
use deployd::deploy::workspace::WorkspaceManager;
use deployd::errors::{EngineError, FetchFailure};
use deployd::models::event::{LogEvent, LogKind};
use deployd::models::request::{DeployRequest, Environment, Runtime, ServiceType};

/// Upper bound for any single scenario
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes fixed files instead of cloning
#[derive(Default)]
pub struct FixtureFetcher {
    pub files: Vec<(&'static str, &'static str)>,
    pub failure: Option<FetchFailure>,
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        request: &DeployRequest,
        dest: &Path,
        _cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError> {
        sink(format!("Cloning {}@{}", request.repository, request.branch));
        if let Some(failure) = &self.failure {
            return Err(EngineError::FetchError(failure.clone()));
        }
        for (name, contents) in &self.files {
            let path = dest.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, contents).await?;
        }
        Ok(())
    }
}

/// Stage limits short enough for tests
pub fn fast_options() -> PipelineOptions {
    PipelineOptions {
        install_timeout: Duration::from_secs(20),
        build_timeout: Duration::from_secs(20),
        start_timeout: Duration::from_secs(20),
        service_grace_period: Duration::from_millis(300),
        default_port: 8080,
    }
}

pub fn registry_with(
    workspace_root: &Path,
    fetcher: FixtureFetcher,
    options: PipelineOptions,
) -> Arc<Registry> {
    let runner = ProcessRunner::new(RunnerOptions::default());
    let workspaces = WorkspaceManager::new(workspace_root, Arc::new(fetcher));
    let pipeline = Pipeline::new(workspaces, runner, options);
    Arc::new(Registry::new(Arc::new(pipeline), EventLogLimits::default()))
}

pub fn registry(workspace_root: &Path) -> Arc<Registry> {
    registry_with(workspace_root, FixtureFetcher::default(), fast_options())
}

/// A python request: no default build, install only with requirements.txt
pub fn request(service_type: ServiceType) -> DeployRequest {
    DeployRequest {
        repository: "acme/widgets".to_string(),
        branch: "main".to_string(),
        runtime: Runtime::Python,
        install_command: None,
        build_command: String::new(),
        start_command: String::new(),
        output_dir: String::new(),
        environment: Environment::default(),
        service_type,
        app_name: None,
        region: None,
        git_url: None,
    }
}

pub async fn wait_final(deployment: &Deployment) -> DeploymentState {
    tokio::time::timeout(SCENARIO_TIMEOUT, deployment.wait_for_state(|s| s.is_final()))
        .await
        .expect("deployment did not finish in time")
}

pub async fn wait_state(deployment: &Deployment, state: DeploymentState) -> DeploymentState {
    tokio::time::timeout(
        SCENARIO_TIMEOUT,
        deployment.wait_for_state(|s| s == state || s.is_final()),
    )
    .await
    .expect("deployment did not reach the state in time")
}

/// Full log of a deployment; returns once it is final
pub async fn collect_events(deployment: &Deployment) -> Vec<LogEvent> {
    tokio::time::timeout(
        SCENARIO_TIMEOUT,
        deployment.subscribe(None).into_stream().collect::<Vec<_>>(),
    )
    .await
    .expect("event stream did not end in time")
}

/// States named by status events, in order
pub fn statuses(events: &[LogEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.kind == LogKind::Status)
        .filter_map(|e| e.text.strip_prefix("status: "))
        .map(String::from)
        .collect()
}

pub fn texts(events: &[LogEvent]) -> Vec<&str> {
    events.iter().map(|e| e.text.as_str()).collect()
}

/// Number of entries left under the workspace root
pub fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}
