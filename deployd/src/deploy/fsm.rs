//! Finite state machine for a deployment attempt

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Created, pipeline not started yet
    Queued,

    /// Retrieving source code into the workspace
    Fetching,

    /// Installing dependencies
    Installing,

    /// Running the build command
    Building,

    /// Starting the application or publishing artifacts
    Starting,

    /// Long-lived process is up (terminal-but-ongoing)
    Running,

    /// Batch deployment finished
    Succeeded,

    /// Deployment failed
    Failed,

    /// Cancelled by the user
    Cancelled,
}

impl DeploymentState {
    /// No further transitions are possible
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::Cancelled
        )
    }

    /// Final, or a service that reached `Running`
    pub fn is_terminal(&self) -> bool {
        self.is_final() || *self == DeploymentState::Running
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Queued => "queued",
            DeploymentState::Fetching => "fetching",
            DeploymentState::Installing => "installing",
            DeploymentState::Building => "building",
            DeploymentState::Starting => "starting",
            DeploymentState::Running => "running",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Pipeline picked the deployment up
    Start,

    /// Source is in the workspace
    Fetched,

    /// Install finished and a build step follows
    Installed,

    /// Install finished and there is no build step
    InstalledNoBuild,

    /// Build exited zero
    Built,

    /// Long-lived process confirmed alive
    ServiceUp,

    /// Batch start/publish finished
    Completed,

    /// Any stage failed, or the service died
    Fail(String),

    /// User cancellation
    Cancel,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Queued,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state, returning the new state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, String> {
        use DeploymentEvent as E;
        use DeploymentState as S;

        let new_state = match (self.state, &event) {
            (S::Queued, E::Start) => S::Fetching,
            (S::Fetching, E::Fetched) => S::Installing,
            (S::Installing, E::Installed) => S::Building,
            (S::Installing, E::InstalledNoBuild) => S::Starting,
            (S::Building, E::Built) => S::Starting,
            (S::Starting, E::ServiceUp) => S::Running,
            (S::Starting, E::Completed) => S::Succeeded,

            // Running only ends by cancellation or unexpected exit
            (state, E::Fail(err)) if !state.is_final() => {
                self.error = Some(err.clone());
                S::Failed
            }
            (state, E::Cancel) if !state.is_final() => S::Cancelled,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
