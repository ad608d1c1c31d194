//! Deploy request model

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::EngineError;

/// Regions a deployment may be placed in
pub const REGIONS: &[&str] = &["asia-south1", "asia-southeast1"];

/// Region used when the request does not name one
pub const DEFAULT_REGION: &str = "asia-south1";

const MAX_APP_NAME_LEN: usize = 63;

/// Language runtime of the repository being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Nodejs,
    Go,
    Python,
}

/// Commands a runtime falls back to when the request leaves them empty
#[derive(Debug, Clone, Copy)]
pub struct RuntimeDefaults {
    /// Dependency install command
    pub install: &'static str,

    /// Install only runs when this file exists at the workspace root
    pub manifest: &'static str,

    /// Build command, if the runtime has a separate build step
    pub build: Option<&'static str>,

    /// Start command
    pub start: &'static str,
}

impl Runtime {
    pub fn defaults(&self) -> RuntimeDefaults {
        match self {
            Runtime::Nodejs => RuntimeDefaults {
                install: "npm install",
                manifest: "package.json",
                build: Some("npm run build"),
                start: "npm start",
            },
            Runtime::Go => RuntimeDefaults {
                install: "go mod download",
                manifest: "go.mod",
                build: Some("go build -o app"),
                start: "./app",
            },
            Runtime::Python => RuntimeDefaults {
                install: "pip install -r requirements.txt",
                manifest: "requirements.txt",
                build: None,
                start: "python main.py",
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Nodejs => "nodejs",
            Runtime::Go => "go",
            Runtime::Python => "python",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of service being deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    WebService,
    Static,
    Serverless,
    Redis,
    ObjectStorage,
}

impl ServiceType {
    /// Long-lived services keep running after start; the rest run to completion
    pub fn is_long_lived(&self) -> bool {
        matches!(self, ServiceType::WebService | ServiceType::Redis)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::WebService => "web_service",
            ServiceType::Static => "static",
            ServiceType::Serverless => "serverless",
            ServiceType::Redis => "redis",
            ServiceType::ObjectStorage => "object_storage",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One environment variable injected into every stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    #[serde(alias = "key")]
    pub name: String,

    pub value: String,

    /// Secret values are masked wherever variables are echoed
    #[serde(default)]
    pub secret: bool,
}

/// Environment variables of a request, in declaration order
///
/// Accepts either a JSON object (`{"NAME": "value"}`) or a list of
/// `{name|key, value, secret}` entries. The list form can carry duplicates,
/// which validation rejects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Environment(Vec<EnvVar>);

#[derive(Deserialize)]
#[serde(untagged)]
enum EnvironmentRepr {
    Map(BTreeMap<String, String>),
    List(Vec<EnvVar>),
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vars = match EnvironmentRepr::deserialize(deserializer)? {
            EnvironmentRepr::Map(map) => map
                .into_iter()
                .map(|(name, value)| EnvVar {
                    name,
                    value,
                    secret: false,
                })
                .collect(),
            EnvironmentRepr::List(list) => list,
        };
        Ok(Environment(vars))
    }
}

impl Environment {
    pub fn new(vars: Vec<EnvVar>) -> Self {
        Self(vars)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|v| v.name == name)
    }

    /// Name/value pairs for handing to a child process
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }

    /// Variable names for log output, secrets marked
    pub fn describe(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|v| {
                if v.secret {
                    format!("{}=********", v.name)
                } else {
                    v.name.clone()
                }
            })
            .collect()
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for var in &self.0 {
            if var.name.is_empty() {
                return Err(EngineError::ValidationError(
                    "environment variable name must not be empty".to_string(),
                ));
            }
            if var.name.contains('=') || var.name.contains('\0') || var.value.contains('\0') {
                return Err(EngineError::ValidationError(format!(
                    "environment variable {:?} contains an illegal character",
                    var.name
                )));
            }
            if !seen.insert(var.name.as_str()) {
                return Err(EngineError::ValidationError(format!(
                    "environment variable {} is declared more than once",
                    var.name
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Environment(
            iter.into_iter()
                .map(|(name, value)| EnvVar {
                    name,
                    value,
                    secret: false,
                })
                .collect(),
        )
    }
}

/// A request to deploy one repository/branch with a given configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// `owner/name`, or a full clone URL
    #[serde(alias = "repo")]
    pub repository: String,

    pub branch: String,

    pub runtime: Runtime,

    #[serde(default)]
    pub install_command: Option<String>,

    #[serde(default)]
    pub build_command: String,

    #[serde(default)]
    pub start_command: String,

    #[serde(default)]
    pub output_dir: String,

    #[serde(default)]
    pub environment: Environment,

    pub service_type: ServiceType,

    #[serde(default)]
    pub app_name: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Explicit clone URL, takes precedence over `repository`
    #[serde(default)]
    pub git_url: Option<String>,
}

/// Install step resolved for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub command: String,

    /// When set, the step is skipped unless this file exists in the workspace
    pub manifest: Option<&'static str>,
}

/// Commands each stage will run, after applying runtime defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub install: InstallStep,
    pub build: Option<String>,
    pub start: Option<String>,
    pub long_lived: bool,
    pub output_dir: Option<String>,
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl DeployRequest {
    /// Check the request shape before any resources are allocated
    pub fn validate(&self) -> Result<(), EngineError> {
        let repository = self.repository.trim();
        if repository.is_empty() {
            return Err(EngineError::ValidationError(
                "repository must not be empty".to_string(),
            ));
        }
        if self.git_url.is_none() && !repository.contains("://") {
            validate_repository_slug(repository)?;
        }
        if let Some(git_url) = self.git_url.as_deref().filter(|u| !u.trim().is_empty()) {
            url::Url::parse(git_url.trim()).map_err(|e| {
                EngineError::ValidationError(format!("gitUrl is not a valid URL: {}", e))
            })?;
        } else if repository.contains("://") {
            url::Url::parse(repository).map_err(|e| {
                EngineError::ValidationError(format!("repository is not a valid URL: {}", e))
            })?;
        }

        let branch = self.branch.trim();
        if branch.is_empty() {
            return Err(EngineError::ValidationError(
                "branch must not be empty".to_string(),
            ));
        }
        if branch.starts_with('-') || branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(EngineError::ValidationError(format!(
                "branch {:?} is not a valid ref name",
                branch
            )));
        }

        if let Some(app_name) = &self.app_name {
            let valid = !app_name.is_empty()
                && app_name.len() <= MAX_APP_NAME_LEN
                && app_name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid {
                return Err(EngineError::ValidationError(format!(
                    "appName {:?} must be 1-{} characters of a-z, 0-9 or '-'",
                    app_name, MAX_APP_NAME_LEN
                )));
            }
        }

        if let Some(region) = &self.region {
            if !REGIONS.contains(&region.as_str()) {
                return Err(EngineError::ValidationError(format!(
                    "unknown region {}",
                    region
                )));
            }
        }

        let output_dir = self.output_dir.trim();
        if output_dir.starts_with('/') || output_dir.split('/').any(|part| part == "..") {
            return Err(EngineError::ValidationError(
                "outputDir must be a path inside the repository".to_string(),
            ));
        }

        self.environment.validate()?;

        let plan = self.plan();
        if plan.long_lived && plan.start.is_none() {
            return Err(EngineError::ValidationError(format!(
                "{} deployments need a start command",
                self.service_type
            )));
        }

        Ok(())
    }

    /// Resolve the commands of every stage
    pub fn plan(&self) -> StagePlan {
        let defaults = self.runtime.defaults();
        let long_lived = self.service_type.is_long_lived();

        let install = match self.install_command.as_deref().and_then(non_empty) {
            Some(command) => InstallStep {
                command,
                manifest: None,
            },
            None => InstallStep {
                command: defaults.install.to_string(),
                manifest: Some(defaults.manifest),
            },
        };

        let build = non_empty(&self.build_command).or_else(|| defaults.build.map(String::from));

        // Batch deployments never fall back to a default start command
        let start = match non_empty(&self.start_command) {
            Some(command) => Some(command),
            None if long_lived => Some(defaults.start.to_string()),
            None => None,
        };

        StagePlan {
            install,
            build,
            start,
            long_lived,
            output_dir: non_empty(&self.output_dir),
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    /// Short label for logs: app name if set, otherwise the repository
    pub fn label(&self) -> &str {
        self.app_name.as_deref().unwrap_or(self.repository.trim())
    }
}

fn validate_repository_slug(repository: &str) -> Result<(), EngineError> {
    let mut parts = repository.split('/');
    let (owner, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => (owner, name),
        _ => {
            return Err(EngineError::ValidationError(format!(
                "repository {:?} must look like owner/name",
                repository
            )))
        }
    };
    let valid_part = |s: &str| {
        !s.is_empty()
            && !s.starts_with('.')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid_part(owner) || !valid_part(name) {
        return Err(EngineError::ValidationError(format!(
            "repository {:?} must look like owner/name",
            repository
        )));
    }
    Ok(())
}
