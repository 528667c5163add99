//! Create-or-update reconciliation of a workload definition.

use std::fmt;
use std::str::FromStr;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::definition::{template_labels, WorkloadDefinition, DEFAULT_REPLICAS};
use crate::error::{DeployError, GatewayError};
use crate::gateway::{or_cancelled, ClusterGateway};
use crate::selector::LabelSet;

/// Which replica count a freshly created workload is expected to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateReplicaPolicy {
    /// Wait for the requested replica count, as on update.
    Requested,
    /// Record an expected count of zero for new workloads.
    ///
    /// Because convergence requires at least one running pod, a workload
    /// created under this policy never converges; its poll ends only on
    /// deadline, tick budget or cancellation.
    ZeroOnCreate,
}

impl fmt::Display for CreateReplicaPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::ZeroOnCreate => write!(f, "zero"),
        }
    }
}

impl FromStr for CreateReplicaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requested" => Ok(Self::Requested),
            "zero" | "zero-on-create" => Ok(Self::ZeroOnCreate),
            other => Err(format!(
                "unknown create replica policy {other:?} (expected \"requested\" or \"zero\")"
            )),
        }
    }
}

/// What the reconciler did to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
        }
    }
}

/// Outcome of one reconciliation, and the sole input of the convergence poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Name of the reconciled workload.
    pub name: String,
    pub action: ReconcileAction,
    /// Pod template labels as stored by the API server.
    pub labels: LabelSet,
    /// Number of running pods that counts as converged.
    pub expected_replicas: i32,
}

/// Applies a definition to the cluster with exactly one create or update.
pub struct Reconciler<'a> {
    gateway: &'a dyn ClusterGateway,
    create_policy: CreateReplicaPolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(gateway: &'a dyn ClusterGateway, create_policy: CreateReplicaPolicy) -> Self {
        Self {
            gateway,
            create_policy,
        }
    }

    /// Create the workload if absent, replace it if present.
    ///
    /// Lookup errors other than not-found, and any create or update error,
    /// abort without retry.
    pub async fn reconcile(
        &self,
        definition: &WorkloadDefinition,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationResult, DeployError> {
        let name = definition.name();
        let cancelled = || DeployError::Cancelled {
            name: name.to_string(),
            ticks: 0,
        };

        let lookup = or_cancelled(cancel, self.gateway.get(name))
            .await
            .ok_or_else(cancelled)?;

        match lookup {
            Ok(_) => {
                let updated = or_cancelled(cancel, self.gateway.update(definition.as_deployment()))
                    .await
                    .ok_or_else(cancelled)??;
                let expected_replicas = definition.desired_replicas();
                info!(
                    name = %name,
                    namespace = %self.gateway.namespace(),
                    expected_replicas,
                    "Updated deployment"
                );
                Ok(ReconciliationResult {
                    name: name.to_string(),
                    action: ReconcileAction::Updated,
                    labels: template_labels(&updated),
                    expected_replicas,
                })
            }
            Err(GatewayError::NotFound { .. }) => {
                let created = or_cancelled(cancel, self.gateway.create(definition.as_deployment()))
                    .await
                    .ok_or_else(cancelled)??;
                let expected_replicas = match self.create_policy {
                    CreateReplicaPolicy::ZeroOnCreate => {
                        warn!(
                            name = %name,
                            "Recording zero expected replicas for new deployment; \
                             convergence cannot succeed under this policy"
                        );
                        0
                    }
                    CreateReplicaPolicy::Requested => created
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.replicas)
                        .or_else(|| definition.replicas())
                        .unwrap_or(DEFAULT_REPLICAS),
                };
                info!(
                    name = %name,
                    namespace = %self.gateway.namespace(),
                    expected_replicas,
                    "Created deployment"
                );
                Ok(ReconciliationResult {
                    name: name.to_string(),
                    action: ReconcileAction::Created,
                    labels: template_labels(&created),
                    expected_replicas,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
