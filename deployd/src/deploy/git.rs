//! Source fetching
//!
//! The default fetcher shallow-clones the requested branch with the git CLI,
//! streaming its progress into the deployment log.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::deploy::runner::{CommandSpec, LineSink, ProcessRunner};
use crate::errors::{EngineError, FetchFailure};
use crate::models::event::command_text;
use crate::models::request::DeployRequest;

/// Lines of git output kept for classifying a failure
const TAIL_LINES: usize = 20;

/// Retrieves a repository's source tree into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Populate `dest` (an existing, empty directory) with the requested branch
    async fn fetch(
        &self,
        request: &DeployRequest,
        dest: &Path,
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError>;
}

/// Fetcher backed by `git clone`
pub struct GitFetcher {
    runner: ProcessRunner,
    base_url: Url,
    timeout: Duration,
}

impl GitFetcher {
    /// `base_url` is where `owner/name` slugs are resolved, e.g. `https://github.com/`
    pub fn new(runner: ProcessRunner, base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| EngineError::ConfigError(format!("invalid git base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            runner,
            base_url,
            timeout,
        })
    }

    /// URL to clone for a request
    pub fn clone_url(&self, request: &DeployRequest) -> Result<Url, EngineError> {
        let explicit = request
            .git_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let repository = request.repository.trim();

        let parsed = match explicit {
            Some(git_url) => Url::parse(git_url),
            None if repository.contains("://") => Url::parse(repository),
            None => {
                let slug = repository.trim_end_matches(".git");
                self.base_url.join(&format!("{}.git", slug))
            }
        };
        parsed.map_err(|e| EngineError::ValidationError(format!("cannot build clone URL: {}", e)))
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        request: &DeployRequest,
        dest: &Path,
        cancel: &CancellationToken,
        sink: &LineSink,
    ) -> Result<(), EngineError> {
        let url = self.clone_url(request)?;
        let branch = request.branch.trim();
        info!("Cloning {} (branch: {}) into {}", redact(&url), branch, dest.display());

        sink(command_text(&format!(
            "git clone --depth 1 --branch {} {}",
            branch,
            redact(&url)
        )));

        let command = format!(
            "git clone --depth 1 --single-branch --branch {} -- {} .",
            shell_quote(branch),
            shell_quote(url.as_str())
        );

        // Keep the tail of git's output to explain a failure
        let tail = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = tail.clone();
        let forward = sink.clone();
        let tee: LineSink = Arc::new(move |line: String| {
            {
                let mut tail = captured.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line.clone());
            }
            forward(line);
        });

        let env = [
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ("GIT_ASKPASS".to_string(), "true".to_string()),
        ];
        let spec = CommandSpec {
            stage: "fetch",
            command: &command,
            cwd: dest,
            env: &env,
        };

        let outcome = self.runner.run(&spec, self.timeout, cancel, &tee).await?;
        if outcome.success() {
            debug!("Clone finished in {}ms", outcome.duration_ms);
            return Ok(());
        }

        let tail = tail.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Err(EngineError::FetchError(classify_git_failure(&tail)))
    }
}

/// Map git's error output onto a fetch failure kind
pub fn classify_git_failure(lines: &[String]) -> FetchFailure {
    let text = lines.join("\n").to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "terminal prompts disabled",
        "permission denied",
    ]) {
        FetchFailure::AuthRequired
    } else if any(&[
        "repository not found",
        "not found in upstream",
        "does not appear to be a git repository",
        "does not exist",
    ]) {
        FetchFailure::NotFound
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "unable to access",
        "early eof",
    ]) {
        FetchFailure::Network
    } else {
        let last = lines
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "git clone failed".to_string());
        FetchFailure::Other(last)
    }
}

/// URL without credentials, for logs
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    if !clean.username().is_empty() || clean.password().is_some() {
        let _ = clean.set_username("");
        let _ = clean.set_password(None);
    }
    clean.to_string()
}

/// Single-quote a value for `sh -c`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
