//! DaskJob CRD types
//!
//! A `DaskJob` runs a notebook or Python script to completion against a
//! `DaskCluster` in the same namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_script() -> String {
    "/notebook.ipynb".to_string()
}

/// Batch job run against a Dask cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "analytics.dask.dev",
    version = "v1",
    kind = "DaskJob",
    plural = "daskjobs",
    shortname = "daskjob",
    namespaced,
    status = "DaskJobStatus",
    printcolumn = r#"{"name":"Succeeded","type":"integer","jsonPath":".status.succeeded"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Resources","type":"string","priority":1,"jsonPath":".status.resources"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DaskJobSpec {
    /// Name of the DaskCluster to run against
    pub cluster: String,

    /// Notebook JSON, Python source, an http(s) URL or a path to a mounted file
    #[serde(default = "default_script")]
    pub script: String,

    /// Container image (falls back to the cluster's image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy (falls back to the cluster's policy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Keep the rendered notebook report on a PersistentVolumeClaim
    #[serde(default)]
    pub report: bool,

    /// StorageClass for the report volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_storage_class: Option<String>,

    /// Size of the report volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_storage_size: Option<String>,

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

/// Observed state of a DaskJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaskJobStatus {
    /// Number of succeeded pods reported by the batch workload
    #[serde(default)]
    pub succeeded: i32,

    /// `Building`, `Running`, a pending-cluster message or the terminal condition type
    #[serde(default)]
    pub state: String,

    /// Human-readable summary of the batch workload status
    #[serde(default)]
    pub resources: String,
}

impl DaskJobStatus {
    /// Fresh status at the start of a reconcile pass
    pub fn building() -> Self {
        Self {
            state: super::STATE_BUILDING.to_string(),
            ..Default::default()
        }
    }

    /// Status written while the referenced cluster does not exist
    pub fn pending_cluster() -> Self {
        Self {
            state: super::STATE_PENDING_CLUSTER.to_string(),
            ..Default::default()
        }
    }
}
