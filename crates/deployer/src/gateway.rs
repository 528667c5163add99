//! Cluster gateway: the CRUD/list surface the reconciler and poller need.

use std::fmt;
use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::GatewayError;

/// Lifecycle phase reported for a pod.
///
/// Parsing is exact and case-sensitive; unrecognized strings are kept
/// verbatim in [`PodPhase::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Other(String),
}

impl PodPhase {
    /// Parse the `status.phase` field; a missing phase is `Unknown`.
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some("Unknown") | None => Self::Unknown,
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Other(phase) => write!(f, "{phase}"),
        }
    }
}

/// The slice of a pod the convergence check looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub phase: PodPhase,
}

impl From<&Pod> for PodSummary {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: PodPhase::from_status(
                pod.status.as_ref().and_then(|status| status.phase.as_deref()),
            ),
        }
    }
}

/// Operations against the orchestrator, scoped to a single namespace.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Namespace every call operates in.
    fn namespace(&self) -> &str;

    /// Fetch a deployment by name. Absent objects yield `GatewayError::NotFound`.
    async fn get(&self, name: &str) -> Result<Deployment, GatewayError>;

    /// Create a deployment, returning the object as stored by the API server.
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, GatewayError>;

    /// Replace an existing deployment, returning the stored object.
    async fn update(&self, deployment: &Deployment) -> Result<Deployment, GatewayError>;

    /// List pods matching a label-equality selector.
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSummary>, GatewayError>;
}

/// Await a gateway call unless `cancel` fires first. `None` means cancelled.
pub(crate) async fn or_cancelled<F: Future>(
    cancel: &CancellationToken,
    call: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = call => Some(output),
    }
}

/// Resolve the client configuration.
///
/// An explicit kubeconfig file is always used as-is. Otherwise the standard
/// inference applies: `KUBECONFIG` (which may list several files), then
/// `~/.kube/config`, then the in-cluster service account.
pub async fn client_config(kubeconfig: Option<&Path>) -> Result<kube::Config, GatewayError> {
    let Some(path) = kubeconfig else {
        debug!("Inferring Kubernetes configuration");
        return kube::Config::infer()
            .await
            .map_err(|e| GatewayError::Credentials(e.to_string()));
    };

    info!(kubeconfig = %path.display(), "Loading kubeconfig");
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| GatewayError::Credentials(format!("{}: {e}", path.display())))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| GatewayError::Credentials(format!("{}: {e}", path.display())))
}

/// Build the process-wide Kubernetes client.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client, GatewayError> {
    let config = client_config(kubeconfig).await?;
    Ok(Client::try_from(config)?)
}

/// [`ClusterGateway`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeGateway {
    deployments: Api<Deployment>,
    pods: Api<Pod>,
    namespace: String,
}

impl KubeGateway {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            deployments: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<Deployment, GatewayError> {
        match self.deployments.get(name).await {
            Ok(deployment) => Ok(deployment),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(GatewayError::NotFound {
                kind: "deployment",
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, deployment: &Deployment) -> Result<Deployment, GatewayError> {
        debug!(namespace = %self.namespace, "Creating deployment");
        Ok(self
            .deployments
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, GatewayError> {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        debug!(namespace = %self.namespace, name = %name, "Replacing deployment");
        match self
            .deployments
            .replace(name, &PostParams::default(), deployment)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(GatewayError::NotFound {
                kind: "deployment",
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSummary>, GatewayError> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items.iter().map(PodSummary::from).collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    #[test]
    fn test_phase_parsing_is_exact() {
        assert_eq!(PodPhase::from_status(Some("Running")), PodPhase::Running);
        assert_eq!(
            PodPhase::from_status(Some("running")),
            PodPhase::Other("running".to_string())
        );
        assert_eq!(
            PodPhase::from_status(Some("RUNNING")),
            PodPhase::Other("RUNNING".to_string())
        );
        assert_eq!(PodPhase::from_status(None), PodPhase::Unknown);
        assert_eq!(PodPhase::from_status(Some("Failed")), PodPhase::Failed);
    }

    #[test]
    fn test_pod_summary_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-7d9f-abcde".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let summary = PodSummary::from(&pod);
        assert_eq!(summary.name, "web-7d9f-abcde");
        assert_eq!(summary.phase, PodPhase::Pending);
        assert_eq!(summary.phase.to_string(), "Pending");
    }

    fn write_kubeconfig(dir: &Path, cluster: &str, host: &str) -> std::path::PathBuf {
        let path = dir.join(format!("{cluster}.yaml"));
        let yaml = format!(
            r"apiVersion: v1
kind: Config
clusters:
  - name: {cluster}
    cluster:
      server: https://{host}:6443
contexts:
  - name: {cluster}
    context:
      cluster: {cluster}
      user: {cluster}-admin
current-context: {cluster}
users:
  - name: {cluster}-admin
    user:
      token: t0ken
"
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[tokio::test]
    async fn test_explicit_kubeconfig_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_kubeconfig(dir.path(), "staging", "10.0.0.1");

        let config = client_config(Some(path.as_path())).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_missing_explicit_kubeconfig_is_a_credentials_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = client_config(Some(dir.path().join("absent.yaml").as_path()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_kubeconfig_env_accepts_path_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = write_kubeconfig(dir.path(), "primary", "10.0.0.1");
        let second = write_kubeconfig(dir.path(), "secondary", "10.0.0.2");
        let list = std::env::join_paths([&first, &second]).unwrap();
        // No other test in this crate reads KUBECONFIG from the process env.
        std::env::set_var("KUBECONFIG", &list);

        let config = client_config(None).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
    }

    #[test]
    fn test_pod_without_status_is_unknown() {
        let summary = PodSummary::from(&Pod::default());
        assert_eq!(summary.phase, PodPhase::Unknown);
    }
}
