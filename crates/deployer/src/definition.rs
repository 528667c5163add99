//! Workload definition loading.
//!
//! A definition is a single YAML (or JSON) document describing an
//! `apps/v1` `Deployment`. Anything else is rejected before the cluster is
//! contacted.

use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use serde::Deserialize;

use crate::error::DefinitionError;
use crate::selector::LabelSet;

const API_VERSION: &str = "apps/v1";
const KIND: &str = "Deployment";

/// Replica count the API server assigns when `spec.replicas` is omitted.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Type header peeked before decoding the full object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeHeader {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
}

/// A decoded, immutable workload definition.
#[derive(Debug, Clone)]
pub struct WorkloadDefinition {
    deployment: Deployment,
}

impl WorkloadDefinition {
    /// Decode a definition from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DefinitionError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(DefinitionError::Empty);
        }

        let header: TypeHeader = serde_yaml::from_slice(bytes)?;
        if header.api_version != API_VERSION || header.kind != KIND {
            return Err(DefinitionError::UnsupportedKind {
                api_version: header.api_version,
                kind: header.kind,
            });
        }

        let deployment: Deployment = serde_yaml::from_slice(bytes)?;
        if deployment.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(DefinitionError::MissingName);
        }

        Ok(Self { deployment })
    }

    /// Read and decode a definition from a local file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| DefinitionError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_slice(&bytes)
    }

    /// Pin the definition to the namespace this process manages.
    ///
    /// A definition that names a different namespace is rejected rather than
    /// silently moved.
    pub fn bind_namespace(mut self, namespace: &str) -> Result<Self, DefinitionError> {
        match self.deployment.metadata.namespace.as_deref() {
            Some(found) if !found.is_empty() && found != namespace => {
                Err(DefinitionError::NamespaceMismatch {
                    expected: namespace.to_string(),
                    found: found.to_string(),
                })
            }
            _ => {
                self.deployment.metadata.namespace = Some(namespace.to_string());
                Ok(self)
            }
        }
    }

    pub fn name(&self) -> &str {
        self.deployment.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.deployment.metadata.namespace.as_deref()
    }

    /// Labels on the pod template, as written in the definition.
    pub fn pod_labels(&self) -> LabelSet {
        template_labels(&self.deployment)
    }

    /// `spec.replicas` exactly as written (None when omitted).
    pub fn replicas(&self) -> Option<i32> {
        self.deployment.spec.as_ref().and_then(|spec| spec.replicas)
    }

    /// Replica count the orchestrator will aim for.
    pub fn desired_replicas(&self) -> i32 {
        self.replicas().unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn as_deployment(&self) -> &Deployment {
        &self.deployment
    }
}

/// Pod template labels of a deployment object.
pub(crate) fn template_labels(deployment: &Deployment) -> LabelSet {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}
