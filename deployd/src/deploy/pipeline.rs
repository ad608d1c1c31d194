//! Build/run pipeline
//!
//! Drives one deployment through Fetch -> Install -> Build -> Start. Every
//! failure, timeout or cancellation is turned into a state transition plus a
//! log event here; nothing propagates past `execute`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::registry::Deployment;
use crate::deploy::runner::{CommandSpec, LineSink, ProcessRunner, RunningService};
use crate::deploy::workspace::{Workspace, WorkspaceManager};
use crate::errors::EngineError;
use crate::models::event::{command_text, error_text, LogKind};
use crate::models::request::StagePlan;

/// Per-stage limits
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub install_timeout: Duration,
    pub build_timeout: Duration,

    /// Limit for a batch start command
    pub start_timeout: Duration,

    /// How long a silent service must stay up to count as started
    pub service_grace_period: Duration,

    /// `PORT` given to services that do not set one
    pub default_port: u16,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            install_timeout: Duration::from_secs(600),
            build_timeout: Duration::from_secs(900),
            start_timeout: Duration::from_secs(300),
            service_grace_period: Duration::from_secs(5),
            default_port: 8080,
        }
    }
}

enum StagesOutcome {
    /// Batch deployment finished its start/publish stage
    Completed,

    /// Long-lived process is up
    Service(RunningService),
}

/// Executes deployments
pub struct Pipeline {
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(workspaces: WorkspaceManager, runner: ProcessRunner, options: PipelineOptions) -> Self {
        Self {
            workspaces,
            runner,
            options,
        }
    }

    /// Run a deployment to a terminal state
    pub async fn execute(&self, deployment: Arc<Deployment>) {
        let cancel = deployment.cancel_token().clone();
        let sink = deployment.line_sink();

        if let Err(e) = deployment.transition(DeploymentEvent::Start) {
            error!("{}", e);
            return;
        }
        self.log_banner(&deployment);

        let mut workspace = None;
        let mut outcome = match self.run_stages(&deployment, &cancel, &sink, &mut workspace).await {
            Ok(StagesOutcome::Completed) => Ok(()),
            Ok(StagesOutcome::Service(service)) => {
                match deployment.transition(DeploymentEvent::ServiceUp) {
                    Ok(_) => {
                        deployment.log(
                            LogKind::Info,
                            format!("Service is running (pid {})", service.pid().unwrap_or_default()),
                        );
                        Err(service.supervise(&cancel, &sink).await)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        // Cancellation wins over whatever else was about to happen
        if cancel.is_cancelled() {
            outcome = Err(EngineError::CancelledError);
        }

        match &outcome {
            Err(e) if e.is_cancellation() => {
                deployment.log(LogKind::Info, "Deployment cancelled, tearing down workspace");
            }
            Err(e) => {
                warn!("Deployment {} failed: {}", deployment.id(), e);
                deployment.log(LogKind::Error, error_text(e));
            }
            Ok(()) => {}
        }

        if let Some(workspace) = workspace.take() {
            if let Err(e) = self.workspaces.release(workspace).await {
                error!("Deployment {}: {}", deployment.id(), e);
                deployment.log(LogKind::Error, error_text(&e));
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
            deployment.set_workspace_path(None);
        }

        let event = match outcome {
            Ok(()) => DeploymentEvent::Completed,
            Err(e) if e.is_cancellation() => DeploymentEvent::Cancel,
            Err(e) => DeploymentEvent::Fail(e.to_string()),
        };
        if let Err(e) = deployment.transition(event) {
            error!("{}", e);
        }
    }

    fn log_banner(&self, deployment: &Deployment) {
        let request = deployment.request();
        deployment.log(
            LogKind::Info,
            format!(
                "Deploying {}@{} ({} {}) in {}",
                request.label(),
                request.branch.trim(),
                request.runtime,
                request.service_type,
                request.region()
            ),
        );
        if !request.environment.is_empty() {
            deployment.log(
                LogKind::Info,
                format!("Environment: {}", request.environment.describe().join(", ")),
            );
        }
    }

    async fn run_stages(
        &self,
        deployment: &Deployment,
        cancel: &CancellationToken,
        sink: &LineSink,
        slot: &mut Option<Workspace>,
    ) -> Result<StagesOutcome, EngineError> {
        check_cancel(cancel)?;
        let request = deployment.request();
        let plan = request.plan();

        // Fetching
        let workspace = self.workspaces.acquire(deployment.id(), request).await?;
        deployment.set_workspace_path(Some(workspace.path()));
        let workspace = slot.insert(workspace);
        self.workspaces
            .fetch_source(workspace, request, cancel, sink)
            .await?;
        check_cancel(cancel)?;
        deployment.transition(DeploymentEvent::Fetched)?;

        // Installing
        let mut env = request.environment.pairs();
        self.install(deployment, workspace, &plan, &env, cancel, sink)
            .await?;
        check_cancel(cancel)?;

        // Building
        match &plan.build {
            Some(build) => {
                deployment.transition(DeploymentEvent::Installed)?;
                self.run_stage(deployment, workspace, "build", build, self.options.build_timeout, &env, cancel, sink)
                    .await?;
                check_cancel(cancel)?;
                deployment.transition(DeploymentEvent::Built)?;
            }
            None => {
                deployment.transition(DeploymentEvent::InstalledNoBuild)?;
            }
        }

        // Starting
        if plan.long_lived {
            let start = plan.start.as_deref().ok_or_else(|| {
                EngineError::ValidationError("no start command for a long-lived service".to_string())
            })?;
            if !request.environment.contains("PORT") {
                env.push(("PORT".to_string(), self.options.default_port.to_string()));
            }
            deployment.log(LogKind::Command, command_text(start));
            let spec = CommandSpec {
                stage: "start",
                command: start,
                cwd: workspace.path(),
                env: &env,
            };
            let service = self
                .runner
                .start(&spec, self.options.service_grace_period, cancel, sink)
                .await?;
            return Ok(StagesOutcome::Service(service));
        }

        if let Some(start) = &plan.start {
            self.run_stage(deployment, workspace, "start", start, self.options.start_timeout, &env, cancel, sink)
                .await?;
            check_cancel(cancel)?;
        }
        if let Some(output_dir) = &plan.output_dir {
            self.publish(deployment, workspace, output_dir).await?;
        }
        Ok(StagesOutcome::Completed)
    }

    async fn install(
        &self,
        deployment: &Deployment,
        workspace: &Workspace,
        plan: &StagePlan,
        env: &[(String, String)],
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError> {
        if let Some(manifest) = plan.install.manifest {
            if !workspace.dir().file(manifest).exists().await {
                deployment.log(
                    LogKind::Info,
                    format!("No {} found, skipping dependency install", manifest),
                );
                return Ok(());
            }
        }
        self.run_stage(
            deployment,
            workspace,
            "install",
            &plan.install.command,
            self.options.install_timeout,
            env,
            cancel,
            sink,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        deployment: &Deployment,
        workspace: &Workspace,
        stage: &str,
        command: &str,
        timeout: Duration,
        env: &[(String, String)],
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError> {
        deployment.log(LogKind::Command, command_text(command));
        let spec = CommandSpec {
            stage,
            command,
            cwd: workspace.path(),
            env,
        };
        let outcome = self.runner.run(&spec, timeout, cancel, sink).await?;
        if !outcome.success() {
            return Err(EngineError::CommandFailed {
                stage: stage.to_string(),
                code: outcome.exit_code,
            });
        }
        info!(
            "Deployment {}: {} finished in {}ms",
            deployment.id(),
            stage,
            outcome.duration_ms
        );
        deployment.log(
            LogKind::Info,
            format!("{} finished in {:.1}s", stage, outcome.duration_ms as f64 / 1000.0),
        );
        Ok(())
    }

    async fn publish(
        &self,
        deployment: &Deployment,
        workspace: &Workspace,
        output_dir: &str,
    ) -> Result<(), EngineError> {
        let artifacts = workspace.dir().subdir(output_dir);
        if !artifacts.exists().await {
            return Err(EngineError::PublishError(format!(
                "output directory {} was not produced",
                output_dir
            )));
        }
        let files = artifacts
            .count_files()
            .await
            .map_err(|e| EngineError::PublishError(e.to_string()))?;
        if files == 0 {
            warn!("Deployment {} published an empty {}", deployment.id(), output_dir);
        }
        deployment.log(
            LogKind::Info,
            format!("Published {} files from {}", files, output_dir),
        );
        Ok(())
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::CancelledError)
    } else {
        Ok(())
    }
}
