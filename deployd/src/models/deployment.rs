//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentState;
use crate::models::request::{Runtime, ServiceType};

/// Externally visible view of one deployment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub runtime: Runtime,
    pub service_type: ServiceType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    pub region: String,
    pub state: DeploymentState,

    /// Failure reason, set only for failed deployments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Sequence of the latest log event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,

    /// Names of injected variables, never their values
    pub environment: Vec<String>,
}
