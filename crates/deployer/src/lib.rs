//! Declarative Deployment rollout for Kubernetes.
//!
//! This crate provides:
//! - Decoding of an `apps/v1` Deployment definition
//! - Create-or-update reconciliation against a cluster gateway
//! - A bounded, cancellable convergence poll over the workload's pods
//! - GitHub push webhook handling (signature verification, changed-file fetch)
//! - HTTP server for webhook handling (standalone service)

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Every gateway and fetch call can fail

pub mod config;
pub mod convergence;
pub mod definition;
pub mod error;
pub mod gateway;
pub mod github_client;
pub mod reconcile;
pub mod rollout;
pub mod selector;
pub mod server;
pub mod webhooks;

pub use config::Config;
pub use convergence::{ConvergencePoller, ConvergenceReport, PollSettings};
pub use definition::WorkloadDefinition;
pub use error::{DefinitionError, DeployError, GatewayError};
pub use gateway::{ClusterGateway, KubeGateway, PodPhase, PodSummary};
pub use github_client::{FileSource, GitHubClient};
pub use reconcile::{CreateReplicaPolicy, ReconcileAction, Reconciler, ReconciliationResult};
pub use rollout::{Deployer, RolloutReport};
pub use webhooks::{verify_webhook_signature, WebhookEvent};
