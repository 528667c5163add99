//! Configuration for the deployer.
//!
//! Every field is read from the environment once at startup; the binary
//! lets command-line flags override individual values.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::convergence::{PollSettings, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::github_client::GITHUB_API_URL;
use crate::reconcile::CreateReplicaPolicy;

/// Namespace rolled out to unless overridden.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Definition read by the startup trigger.
pub const DEFAULT_DEFINITION_PATH: &str = "deployment.yaml";
/// Webhook listener port.
pub const DEFAULT_PORT: u16 = 8080;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Process-wide deployer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit kubeconfig file, set from the command line. `None` defers to
    /// `KUBECONFIG`, `~/.kube/config`, then in-cluster config.
    pub kubeconfig: Option<PathBuf>,
    /// Namespace every rollout targets.
    pub namespace: String,
    /// Definition rolled out by `deployer apply`.
    pub definition_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Webhook signing secret for signature verification.
    pub webhook_secret: Option<String>,
    /// GitHub token for the contents API.
    pub github_token: Option<String>,
    /// GitHub API base URL.
    pub github_api_url: String,
    /// Repository paths that trigger a rollout; empty tracks every changed file.
    pub tracked_paths: Vec<String>,
    /// Convergence polling bounds.
    pub poll: PollSettings,
    /// Expected replica count recorded for newly created workloads.
    pub create_policy: CreateReplicaPolicy,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl Config {
    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Blank values count as unset. Values that fail to parse are logged and
    /// replaced by the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| get(key).filter(|value| !value.trim().is_empty());

        Self {
            kubeconfig: None,
            namespace: get("DEPLOYER_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            definition_path: get("DEPLOYER_DEFINITION_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_DEFINITION_PATH), PathBuf::from),
            port: parse_var("DEPLOYER_PORT", get("DEPLOYER_PORT")).unwrap_or(DEFAULT_PORT),
            webhook_secret: get("GITHUB_WEBHOOK_SECRET"),
            github_token: get("GITHUB_TOKEN"),
            github_api_url: get("GITHUB_API_URL").unwrap_or_else(|| GITHUB_API_URL.to_string()),
            tracked_paths: get("DEPLOYER_TRACKED_PATHS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            poll: PollSettings {
                interval: parse_var::<u64>(
                    "DEPLOYER_POLL_INTERVAL_SECS",
                    get("DEPLOYER_POLL_INTERVAL_SECS"),
                )
                .filter(|secs| *secs > 0)
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs),
                // 0 disables the deadline.
                timeout: match parse_var::<u64>(
                    "DEPLOYER_POLL_TIMEOUT_SECS",
                    get("DEPLOYER_POLL_TIMEOUT_SECS"),
                ) {
                    Some(0) => None,
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => Some(DEFAULT_POLL_TIMEOUT),
                },
                max_ticks: parse_var::<u64>("DEPLOYER_MAX_TICKS", get("DEPLOYER_MAX_TICKS"))
                    .filter(|ticks| *ticks > 0),
            },
            create_policy: parse_var("DEPLOYER_CREATE_REPLICAS", get("DEPLOYER_CREATE_REPLICAS"))
                .unwrap_or(CreateReplicaPolicy::Requested),
            log_format: parse_var("DEPLOYER_LOG_FORMAT", get("DEPLOYER_LOG_FORMAT"))
                .unwrap_or_default(),
        }
    }

    /// Whether a changed repository path should trigger a rollout.
    pub fn is_tracked(&self, path: &str) -> bool {
        self.tracked_paths.is_empty() || self.tracked_paths.iter().any(|p| p == path)
    }
}

fn parse_var<T>(key: &str, value: Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = value?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key = %key, value = %value, error = %e, "Ignoring invalid configuration value");
            None
        }
    }
}
