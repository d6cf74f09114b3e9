//! DaskCluster CRD types
//!
//! A `DaskCluster` describes one scheduler, an elastic pool of workers and an
//! optional Jupyter notebook front-end. Shared settings live at the top level
//! of `spec`; `scheduler`, `worker` and `notebook` carry per-role overrides.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Role overrides
// =============================================================================

/// Per-role override block layered on top of the shared cluster settings.
///
/// Scalars fall back to the shared value when unset. Collections do not: a
/// collection left unset here means "none for this role".
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleOverride {
    /// Container image for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Pod volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,

    /// Container volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,

    /// Extra container environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Node selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Pod affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

// =============================================================================
// CRD
// =============================================================================

/// Specification for a Dask cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "analytics.dask.dev",
    version = "v1",
    kind = "DaskCluster",
    plural = "daskclusters",
    shortname = "dask",
    namespaced,
    status = "DaskClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Components","type":"integer","jsonPath":".status.replicas","description":"Workloads in the cluster"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"integer","jsonPath":".status.succeeded","description":"Workloads with all replicas ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Resources","type":"string","priority":1,"jsonPath":".status.resources"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DaskClusterSpec {
    /// Deploy a Jupyter notebook alongside the scheduler
    #[serde(default)]
    pub jupyter: bool,

    /// Spread workers one per node with a required pod anti-affinity
    #[serde(default)]
    pub daemon: bool,

    /// Skip creation of NetworkPolicies
    #[serde(default)]
    pub disable_policies: bool,

    /// Number of workers; 0 or unset means the default of 5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub replicas: Option<i32>,

    /// Container image for every role (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Ingress hostname for the notebook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jupyter_ingress: Option<String>,

    /// Notebook password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jupyter_password: Option<String>,

    /// Ingress hostname for the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_ingress: Option<String>,

    /// Ingress hostname for the scheduler dashboard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_ingress: Option<String>,

    /// Pod volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,

    /// Container volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,

    /// Extra container environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Node selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Pod affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Scheduler-specific overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<RoleOverride>,

    /// Worker-specific overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<RoleOverride>,

    /// Notebook-specific overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook: Option<RoleOverride>,
}

/// Observed state of a DaskCluster
///
/// Rebuilt on every reconcile from the live child resources; never read back
/// as an input.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaskClusterStatus {
    /// Number of workloads observed
    #[serde(default)]
    pub replicas: i32,

    /// Number of workloads whose ready replicas match the requested replicas
    #[serde(default)]
    pub succeeded: i32,

    /// `Building`, `Running`, or an error description
    #[serde(default)]
    pub state: String,

    /// Human-readable summary of endpoints and child status
    #[serde(default)]
    pub resources: String,
}

impl DaskClusterStatus {
    /// Fresh status at the start of a reconcile pass
    pub fn building() -> Self {
        Self {
            state: super::STATE_BUILDING.to_string(),
            ..Default::default()
        }
    }

    /// Whether jobs may run against this cluster
    pub fn is_running(&self) -> bool {
        self.state == super::STATE_RUNNING
    }
}

impl DaskCluster {
    /// Whether the last written status reports the cluster as ready
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .map(DaskClusterStatus::is_running)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_parses_camel_case_fields() {
        let spec: DaskClusterSpec = serde_json::from_value(serde_json::json!({
            "jupyter": true,
            "replicas": 3,
            "imagePullPolicy": "Always",
            "schedulerIngress": "scheduler.dask.local",
            "disablePolicies": true,
            "worker": {
                "nodeSelector": {"pool": "compute"},
                "image": "daskdev/dask:2024.1.0"
            }
        }))
        .unwrap();

        assert!(spec.jupyter);
        assert!(spec.disable_policies);
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.image_pull_policy.as_deref(), Some("Always"));
        let worker = spec.worker.unwrap();
        assert_eq!(worker.image.as_deref(), Some("daskdev/dask:2024.1.0"));
        assert_eq!(
            worker.node_selector.unwrap().get("pool").map(String::as_str),
            Some("compute")
        );
    }

    #[test]
    fn empty_spec_is_valid() {
        let spec: DaskClusterSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!spec.jupyter);
        assert!(!spec.daemon);
        assert!(spec.replicas.is_none());
        assert!(spec.scheduler.is_none());
    }

    #[test]
    fn crd_has_expected_identity() {
        let crd = DaskCluster::crd();
        assert_eq!(crd.spec.group, "analytics.dask.dev");
        assert_eq!(crd.spec.names.kind, "DaskCluster");
        assert_eq!(crd.spec.names.plural, "daskclusters");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn only_running_state_is_ready() {
        let mut status = DaskClusterStatus::building();
        assert!(!status.is_running());
        status.state = "running".to_string();
        assert!(!status.is_running());
        status.state = "Running".to_string();
        assert!(status.is_running());
    }

    #[test]
    fn cluster_without_status_is_not_running() {
        let cluster = DaskCluster::new("analytics", DaskClusterSpec::default());
        assert!(!cluster.is_running());
    }
}
