//! One rollout cycle: decode, reconcile, wait for convergence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::convergence::{ConvergencePoller, ConvergenceReport, PollSettings};
use crate::definition::WorkloadDefinition;
use crate::error::DeployError;
use crate::gateway::ClusterGateway;
use crate::reconcile::{CreateReplicaPolicy, Reconciler, ReconciliationResult};

/// Outcome of a successful rollout.
#[derive(Debug, Clone)]
pub struct RolloutReport {
    pub reconciled: ReconciliationResult,
    pub convergence: ConvergenceReport,
}

/// Runs rollouts against one gateway with fixed settings.
///
/// Shared by the startup and webhook triggers; cheap to share behind an
/// `Arc`, and concurrent rollouts do not coordinate with each other.
pub struct Deployer {
    gateway: Arc<dyn ClusterGateway>,
    create_policy: CreateReplicaPolicy,
    poll: PollSettings,
}

impl Deployer {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        create_policy: CreateReplicaPolicy,
        poll: PollSettings,
    ) -> Self {
        Self {
            gateway,
            create_policy,
            poll,
        }
    }

    pub fn namespace(&self) -> &str {
        self.gateway.namespace()
    }

    /// Decode `bytes` as a workload definition and roll it out.
    pub async fn rollout(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RolloutReport, DeployError> {
        let definition = WorkloadDefinition::from_slice(bytes)?;
        self.rollout_definition(definition, cancel).await
    }

    /// Reconcile an already decoded definition and wait for its pods.
    pub async fn rollout_definition(
        &self,
        definition: WorkloadDefinition,
        cancel: &CancellationToken,
    ) -> Result<RolloutReport, DeployError> {
        let definition = definition.bind_namespace(self.gateway.namespace())?;
        info!(
            name = %definition.name(),
            namespace = %self.gateway.namespace(),
            "Rolling out deployment"
        );

        let reconciled = Reconciler::new(self.gateway.as_ref(), self.create_policy)
            .reconcile(&definition, cancel)
            .await?;

        let convergence = ConvergencePoller::new(self.gateway.as_ref(), self.poll)
            .await_ready(&reconciled, cancel)
            .await?;

        info!(
            name = %reconciled.name,
            action = %reconciled.action,
            ticks = convergence.ticks,
            elapsed_secs = convergence.elapsed.as_secs(),
            "Rollout complete"
        );

        Ok(RolloutReport {
            reconciled,
            convergence,
        })
    }
}
