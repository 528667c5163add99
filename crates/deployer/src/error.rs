//! Error types for the rollout pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while decoding a workload definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Definition bytes were empty.
    #[error("definition is empty")]
    Empty,

    /// Definition bytes are not a well-formed document.
    #[error("decode error: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// Document decoded but names a kind this system does not roll out.
    #[error("unrecognised type: {api_version}/{kind}")]
    UnsupportedKind { api_version: String, kind: String },

    /// `metadata.name` is missing or empty.
    #[error("definition has no metadata.name")]
    MissingName,

    /// Definition targets a namespace other than the one this process manages.
    #[error("definition targets namespace {found}, expected {expected}")]
    NamespaceMismatch { expected: String, found: String },

    /// Reading the definition from disk failed.
    #[error("readfile error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by a [`ClusterGateway`](crate::gateway::ClusterGateway).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The named object does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The API server rejected the request.
    #[error("API error: {code} {reason} - {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    /// Transport, auth or serialization failure talking to the API server.
    #[error("transport error: {0}")]
    Transport(String),

    /// Kubeconfig could not be loaded or yields no usable client.
    #[error("credentials error: {0}")]
    Credentials(String),
}

impl GatewayError {
    /// True when the error is the recognized "does not exist" branch.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<kube::Error> for GatewayError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => Self::Api {
                code: response.code,
                reason: response.reason,
                message: response.message,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Terminal error of one rollout cycle.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("deployment error: {0}")]
    Gateway(#[from] GatewayError),

    /// The label set cannot be turned into a selector.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// The workload did not converge within its deadline or tick budget.
    #[error(
        "convergence failed for {name}: running {running}/{total}, expected {expected} \
         after {ticks} ticks ({elapsed:?}){phases}"
    )]
    ConvergenceFailed {
        name: String,
        running: usize,
        total: usize,
        expected: i32,
        ticks: u64,
        elapsed: Duration,
        /// Per-phase breakdown of the last observation, pre-rendered.
        phases: String,
    },

    /// Polling was cancelled before the workload converged.
    #[error("rollout of {name} cancelled after {ticks} ticks")]
    Cancelled { name: String, ticks: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    #[test]
    fn test_kube_api_error_maps_to_api_variant() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });

        let mapped = GatewayError::from(err);
        assert!(matches!(mapped, GatewayError::Api { code: 403, .. }));
        assert!(!mapped.is_not_found());
    }

    #[test]
    fn test_convergence_failed_message_carries_diagnostic() {
        let err = DeployError::ConvergenceFailed {
            name: "web".to_string(),
            running: 2,
            total: 3,
            expected: 3,
            ticks: 4,
            elapsed: Duration::from_secs(20),
            phases: " [Pending=1, Running=2]".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("running 2/3"));
        assert!(message.contains("expected 3"));
        assert!(message.contains("Pending=1"));
    }
}
