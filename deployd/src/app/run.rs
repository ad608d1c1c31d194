//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::deploy::git::GitFetcher;
use crate::deploy::pipeline::Pipeline;
use crate::deploy::registry::Registry;
use crate::deploy::runner::ProcessRunner;
use crate::deploy::workspace::WorkspaceManager;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::reaper;

/// Run the deploy service until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing deployd...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start deployd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), EngineError> {
    let registry = init_registry(options).await?;
    shutdown_manager.with_registry(registry.clone())?;

    init_reaper_worker(
        options.reaper.clone(),
        registry.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_server(options, registry, shutdown_manager, shutdown_tx.subscribe()).await?;

    Ok(())
}

async fn init_registry(options: &AppOptions) -> Result<Arc<Registry>, EngineError> {
    Dir::new(&options.workspace_root).create().await?;
    info!("Workspaces under {}", options.workspace_root.display());

    let runner = ProcessRunner::new(options.runner.clone());
    let fetcher = GitFetcher::new(runner.clone(), &options.git_base_url, options.fetch_timeout)?;
    let workspaces = WorkspaceManager::new(&options.workspace_root, Arc::new(fetcher));
    let pipeline = Pipeline::new(workspaces, runner, options.pipeline.clone());

    Ok(Arc::new(Registry::new(Arc::new(pipeline), options.event_log)))
}

fn init_reaper_worker(
    options: reaper::Options,
    registry: Arc<Registry>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing reaper worker...");

    let reaper_handle = tokio::spawn(async move {
        reaper::run(
            &options,
            registry.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reaper_worker_handle(reaper_handle)
}

async fn init_server(
    options: &AppOptions,
    registry: Arc<Registry>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(registry);
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    registry: Option<Arc<Registry>>,
    server_handle: Option<JoinHandle<Result<(), EngineError>>>,
    reaper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            registry: None,
            server_handle: None,
            reaper_worker_handle: None,
        }
    }

    pub fn with_registry(&mut self, registry: Arc<Registry>) -> Result<(), EngineError> {
        if self.registry.is_some() {
            return Err(EngineError::ShutdownError("registry already set".to_string()));
        }
        self.registry = Some(registry);
        Ok(())
    }

    pub fn with_reaper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), EngineError> {
        if self.reaper_worker_handle.is_some() {
            return Err(EngineError::ShutdownError("reaper_handle already set".to_string()));
        }
        self.reaper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        if self.server_handle.is_some() {
            return Err(EngineError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        // Pipelines get the whole delay; the rest only needs a moment
        let max_delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(max_delay * 2, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}, forcing shutdown...", max_delay * 2);
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down deployd...");

        // 1. Reaper worker
        if let Some(handle) = self.reaper_worker_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))?;
        }

        // 2. Deployments; this also ends every open event stream
        if let Some(registry) = self.registry.take() {
            registry.shutdown(self.lifecycle_options.max_shutdown_delay).await;
        }

        // 3. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
