//! Deployment registry
//!
//! In-memory table of deployment attempts. The registry is constructed once at
//! startup and handed to whoever needs it; there is no global instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::broadcaster::{EventLog, EventLogLimits, Subscription};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::deploy::pipeline::Pipeline;
use crate::deploy::runner::LineSink;
use crate::errors::EngineError;
use crate::models::deployment::DeploymentSummary;
use crate::models::event::{LogEvent, LogKind};
use crate::models::request::DeployRequest;
use crate::utils::generate_id;

/// Text of the status event emitted for a state
pub fn status_text(state: DeploymentState) -> String {
    format!("status: {}", state)
}

#[derive(Debug)]
struct Progress {
    fsm: DeploymentFsm,
    finished_at: Option<DateTime<Utc>>,
    workspace_path: Option<PathBuf>,
}

/// One deployment attempt
///
/// State and log are written only by the deployment's pipeline task; the
/// subscriber set changes as gateway connections attach and detach.
pub struct Deployment {
    id: String,
    request: DeployRequest,
    created_at: DateTime<Utc>,
    progress: Mutex<Progress>,
    events: Arc<EventLog>,
    cancel: CancellationToken,
    state_tx: watch::Sender<DeploymentState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Deployment {
    fn new(id: String, request: DeployRequest, limits: EventLogLimits) -> Self {
        let (state_tx, _) = watch::channel(DeploymentState::Queued);
        Self {
            id,
            request,
            created_at: Utc::now(),
            progress: Mutex::new(Progress {
                fsm: DeploymentFsm::new(),
                finished_at: None,
                workspace_path: None,
            }),
            events: Arc::new(EventLog::new(limits)),
            cancel: CancellationToken::new(),
            state_tx,
            task: Mutex::new(None),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &DeployRequest {
        &self.request
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> DeploymentState {
        self.progress().fsm.state()
    }

    pub fn error(&self) -> Option<String> {
        self.progress().fsm.error().map(String::from)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.progress().finished_at
    }

    /// Workspace directory while the deployment owns one
    pub fn workspace_path(&self) -> Option<PathBuf> {
        self.progress().workspace_path.clone()
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Attach a subscriber; see [`EventLog::subscribe`]
    pub fn subscribe(&self, after: Option<u64>) -> Subscription {
        self.events.subscribe(after)
    }

    /// Wait until the state satisfies `pred`
    pub async fn wait_for_state<F>(&self, pred: F) -> DeploymentState
    where
        F: Fn(DeploymentState) -> bool,
    {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            // The sender lives as long as self
            Err(_) => self.state(),
        };
        state
    }

    pub fn summary(&self) -> DeploymentSummary {
        let (state, error, finished_at) = {
            let progress = self.progress();
            (
                progress.fsm.state(),
                progress.fsm.error().map(String::from),
                progress.finished_at,
            )
        };
        DeploymentSummary {
            id: self.id.clone(),
            repository: self.request.repository.clone(),
            branch: self.request.branch.clone(),
            runtime: self.request.runtime,
            service_type: self.request.service_type,
            app_name: self.request.app_name.clone(),
            region: self.request.region().to_string(),
            state,
            error,
            created_at: self.created_at,
            finished_at,
            last_sequence: self.events.last_sequence(),
            environment: self.request.environment.iter().map(|v| v.name.clone()).collect(),
        }
    }

    /// Append one event to the deployment log
    pub(crate) fn log(&self, kind: LogKind, text: impl Into<String>) -> Option<LogEvent> {
        self.events.publish(kind, text)
    }

    /// Sink that appends command output to the deployment log
    pub(crate) fn line_sink(&self) -> LineSink {
        let events = self.events.clone();
        Arc::new(move |line: String| {
            events.publish(LogKind::infer(&line), line);
        })
    }

    pub(crate) fn set_workspace_path(&self, path: Option<&Path>) {
        self.progress().workspace_path = path.map(Path::to_path_buf);
    }

    /// Apply a state machine event and emit its status event
    ///
    /// Reaching a final state closes the event log.
    pub(crate) fn transition(&self, event: DeploymentEvent) -> Result<DeploymentState, EngineError> {
        let state = {
            let mut progress = self.progress();
            let state = progress
                .fsm
                .process(event)
                .map_err(|e| EngineError::Internal(format!("deployment {}: {}", self.id, e)))?;
            if state.is_final() {
                progress.finished_at = Some(Utc::now());
            }
            state
        };

        info!("Deployment {} -> {}", self.id, state);
        self.events.publish(LogKind::Status, status_text(state));
        if state.is_final() {
            self.events.close();
        }
        self.state_tx.send_replace(state);
        Ok(state)
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Registry of deployments keyed by id
pub struct Registry {
    deployments: RwLock<HashMap<String, Arc<Deployment>>>,
    pipeline: Arc<Pipeline>,
    limits: EventLogLimits,
}

impl Registry {
    pub fn new(pipeline: Arc<Pipeline>, limits: EventLogLimits) -> Self {
        Self {
            deployments: RwLock::new(HashMap::new()),
            pipeline,
            limits,
        }
    }

    /// Validate a request, record a deployment and start its pipeline
    ///
    /// Returns as soon as the pipeline task is spawned.
    pub fn create(&self, request: DeployRequest) -> Result<Arc<Deployment>, EngineError> {
        request.validate()?;

        let deployment = Arc::new(Deployment::new(generate_id(), request, self.limits));
        deployment.log(LogKind::Status, status_text(DeploymentState::Queued));

        {
            let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
            deployments.insert(deployment.id.clone(), deployment.clone());
        }
        info!(
            "Created deployment {} for {}@{} ({}, {})",
            deployment.id,
            deployment.request.repository,
            deployment.request.branch,
            deployment.request.runtime,
            deployment.request.service_type
        );

        let pipeline = self.pipeline.clone();
        let task_deployment = deployment.clone();
        let handle = tokio::spawn(async move {
            pipeline.execute(task_deployment).await;
        });
        deployment.set_task(handle);

        Ok(deployment)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Deployment>, EngineError> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        deployments
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", id)))
    }

    /// Replay retained events after `after` and attach for live ones
    pub fn subscribe(&self, id: &str, after: Option<u64>) -> Result<Subscription, EngineError> {
        Ok(self.get(id)?.subscribe(after))
    }

    /// Request cancellation; a no-op for deployments already in a final state
    pub fn cancel(&self, id: &str) -> Result<Arc<Deployment>, EngineError> {
        let deployment = self.get(id)?;
        if deployment.state().is_final() {
            debug!("Deployment {} already {}, ignoring cancel", id, deployment.state());
        } else {
            info!("Cancelling deployment {}", id);
            deployment.cancel.cancel();
        }
        Ok(deployment)
    }

    /// All deployments, newest first
    pub fn list(&self) -> Vec<Arc<Deployment>> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<_> = deployments.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn len(&self) -> usize {
        self.deployments.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop deployments that finished more than `retention` before `now`
    pub fn evict_expired(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        let before = deployments.len();
        deployments.retain(|_, d| match d.finished_at() {
            Some(finished_at) => now.signed_duration_since(finished_at) < retention,
            None => true,
        });
        let evicted = before - deployments.len();
        if evicted > 0 {
            info!("Evicted {} finished deployments", evicted);
        }
        evicted
    }

    /// Cancel every unfinished deployment and wait for the pipelines to wind down
    pub async fn shutdown(&self, max_delay: Duration) {
        let deployments = self.list();
        for deployment in &deployments {
            if !deployment.state().is_final() {
                deployment.cancel.cancel();
            }
        }

        let handles: Vec<_> = deployments.iter().filter_map(|d| d.take_task()).collect();
        if handles.is_empty() {
            return;
        }
        info!("Waiting for {} pipelines to stop...", handles.len());

        let wait_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Pipeline task ended abnormally: {}", e);
                }
            }
        };
        if tokio::time::timeout(max_delay, wait_all).await.is_err() {
            warn!("Pipelines did not stop within {:?}", max_delay);
        }
    }
}
