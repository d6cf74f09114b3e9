//! Configuration resolution for Dask clusters and jobs
//!
//! `resolve` turns a [`DaskCluster`] into a fully-defaulted [`ResolvedConfig`]
//! once per reconcile pass. [`ResolvedConfig::for_role`] then layers the
//! scheduler, worker or notebook override block on top to produce the
//! [`RoleConfig`] each renderer consumes.
//!
//! Everything here is pure: process-wide defaults arrive as an immutable
//! [`OperatorDefaults`] value, and no function mutates its inputs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, PodAffinityTerm, ResourceRequirements, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;

use crate::crd::{DaskCluster, DaskJob, RoleOverride};

/// Default container image when neither `spec.image` nor the environment sets one
pub const DEFAULT_IMAGE: &str = "daskdev/dask:latest";
/// Default image pull policy
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";
/// Default notebook image
pub const DEFAULT_NOTEBOOK_IMAGE: &str = "jupyter/scipy-notebook:latest";
/// Scheduler control channel port
pub const SCHEDULER_PORT: i32 = 8786;
/// Scheduler and worker dashboard (bokeh) port
pub const DASHBOARD_PORT: i32 = 8787;
/// Notebook HTTP port
pub const NOTEBOOK_PORT: i32 = 8888;
/// Worker replica count used when `spec.replicas` is 0 or unset
pub const DEFAULT_REPLICAS: i32 = 5;
/// Dashboard ingress hostname used when `spec.monitorIngress` is unset
pub const DEFAULT_MONITOR_INGRESS: &str = "monitor.dask.local";
/// Placeholder notebook password; insecure, expected to be overridden
pub const DEFAULT_NOTEBOOK_PASSWORD: &str = "password";
/// Default job script
pub const DEFAULT_SCRIPT: &str = "/notebook.ipynb";
/// Default StorageClass for job report volumes
pub const DEFAULT_REPORT_STORAGE_CLASS: &str = "standard";
/// Default size of job report volumes
pub const DEFAULT_REPORT_STORAGE_SIZE: &str = "1Gi";
/// Topology key for daemon-mode worker spreading
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

// =============================================================================
// Process defaults
// =============================================================================

/// Process-wide defaults, fixed at start-up
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDefaults {
    /// Image for clusters that do not set one
    pub image: String,
    /// Pull policy for clusters that do not set one
    pub pull_policy: String,
    /// Image for the notebook role
    pub notebook_image: String,
    /// Service type for scheduler and notebook Services
    pub service_type: String,
    /// Scheduler control channel port
    pub scheduler_port: i32,
    /// Dashboard port
    pub dashboard_port: i32,
    /// Notebook port
    pub notebook_port: i32,
}

impl Default for OperatorDefaults {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            pull_policy: DEFAULT_PULL_POLICY.to_string(),
            notebook_image: DEFAULT_NOTEBOOK_IMAGE.to_string(),
            service_type: "ClusterIP".to_string(),
            scheduler_port: SCHEDULER_PORT,
            dashboard_port: DASHBOARD_PORT,
            notebook_port: NOTEBOOK_PORT,
        }
    }
}

impl OperatorDefaults {
    /// Defaults with the given image and pull policy
    ///
    /// Empty strings fall back to the built-in values.
    pub fn new(image: impl Into<String>, pull_policy: impl Into<String>) -> Self {
        let mut defaults = Self::default();
        let image = image.into();
        let pull_policy = pull_policy.into();
        if !image.is_empty() {
            defaults.image = image;
        }
        if !pull_policy.is_empty() {
            defaults.pull_policy = pull_policy;
        }
        defaults
    }
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// The pod-level settings every role carries
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSettings {
    /// Container image
    pub image: String,
    /// Image pull policy
    pub image_pull_policy: String,
    /// Pod volumes
    pub volumes: Option<Vec<Volume>>,
    /// Container volume mounts
    pub volume_mounts: Option<Vec<VolumeMount>>,
    /// Extra container environment
    pub env: Option<Vec<EnvVar>>,
    /// Image pull secrets
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    /// Node selector
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Pod affinity
    pub affinity: Option<Affinity>,
    /// Pod tolerations
    pub tolerations: Option<Vec<Toleration>>,
    /// Container resources
    pub resources: Option<ResourceRequirements>,
}

/// Fully-defaulted configuration for one cluster, derived once per pass
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    /// Cluster name
    pub name: String,
    /// Cluster namespace
    pub namespace: String,
    /// Whether the notebook is deployed
    pub jupyter: bool,
    /// Whether workers are spread one per node
    pub daemon: bool,
    /// Whether NetworkPolicies are skipped
    pub disable_policies: bool,
    /// Desired worker replicas
    pub replicas: i32,
    /// Notebook ingress hostname
    pub jupyter_ingress: Option<String>,
    /// Scheduler ingress hostname
    pub scheduler_ingress: Option<String>,
    /// Dashboard ingress hostname
    pub monitor_ingress: String,
    /// Notebook password
    pub jupyter_password: String,
    /// Image for the notebook role before overrides
    pub notebook_image: String,
    /// Service type for scheduler and notebook
    pub service_type: String,
    /// Scheduler control channel port
    pub scheduler_port: i32,
    /// Dashboard port
    pub dashboard_port: i32,
    /// Notebook port
    pub notebook_port: i32,
    /// Shared pod settings
    pub pod: PodSettings,
    /// Scheduler override block
    pub scheduler: Option<RoleOverride>,
    /// Worker override block
    pub worker: Option<RoleOverride>,
    /// Notebook override block
    pub notebook: Option<RoleOverride>,
}

/// Cluster role a [`RoleConfig`] is derived for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Dask scheduler
    Scheduler,
    /// Dask worker pool
    Worker,
    /// Jupyter notebook front-end
    Notebook,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::Worker => write!(f, "worker"),
            Self::Notebook => write!(f, "notebook"),
        }
    }
}

/// A [`ResolvedConfig`] with one role's overrides applied to its pod settings
#[derive(Clone, Debug, PartialEq)]
pub struct RoleConfig {
    /// Role this configuration is for
    pub role: Role,
    /// Cluster configuration; `config.pod` carries the role's effective settings
    pub config: ResolvedConfig,
}

impl std::ops::Deref for RoleConfig {
    type Target = ResolvedConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Build the canonical configuration for a cluster
///
/// Never fails: every field has a fallback.
pub fn resolve(cluster: &DaskCluster, defaults: &OperatorDefaults) -> ResolvedConfig {
    let spec = &cluster.spec;
    let replicas = match spec.replicas {
        Some(n) if n > 0 => n,
        _ => DEFAULT_REPLICAS,
    };

    ResolvedConfig {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        jupyter: spec.jupyter,
        daemon: spec.daemon,
        disable_policies: spec.disable_policies,
        replicas,
        jupyter_ingress: non_empty(&spec.jupyter_ingress),
        scheduler_ingress: non_empty(&spec.scheduler_ingress),
        monitor_ingress: non_empty(&spec.monitor_ingress)
            .unwrap_or_else(|| DEFAULT_MONITOR_INGRESS.to_string()),
        jupyter_password: non_empty(&spec.jupyter_password)
            .unwrap_or_else(|| DEFAULT_NOTEBOOK_PASSWORD.to_string()),
        notebook_image: defaults.notebook_image.clone(),
        service_type: defaults.service_type.clone(),
        scheduler_port: defaults.scheduler_port,
        dashboard_port: defaults.dashboard_port,
        notebook_port: defaults.notebook_port,
        pod: PodSettings {
            image: non_empty(&spec.image).unwrap_or_else(|| defaults.image.clone()),
            image_pull_policy: non_empty(&spec.image_pull_policy)
                .unwrap_or_else(|| defaults.pull_policy.clone()),
            volumes: spec.volumes.clone(),
            volume_mounts: spec.volume_mounts.clone(),
            env: spec.env.clone(),
            image_pull_secrets: spec.image_pull_secrets.clone(),
            node_selector: spec.node_selector.clone(),
            affinity: spec.affinity.clone(),
            tolerations: spec.tolerations.clone(),
            resources: spec.resources.clone(),
        },
        scheduler: spec.scheduler.clone(),
        worker: spec.worker.clone(),
        notebook: spec.notebook.clone(),
    }
}

impl ResolvedConfig {
    /// Derive the configuration for `role` from this config's own override block
    pub fn for_role(&self, role: Role) -> RoleConfig {
        let role_override = match role {
            Role::Scheduler => self.scheduler.as_ref(),
            Role::Worker => self.worker.as_ref(),
            Role::Notebook => self.notebook.as_ref(),
        };
        derive_role(self, role, role_override)
    }

    /// Fully-qualified scheduler address `dask-scheduler-<name>.<namespace>`
    pub fn scheduler_host(&self) -> String {
        format!(
            "{}.{}",
            crate::naming::child_name(crate::naming::SCHEDULER, &self.name),
            self.namespace
        )
    }
}

/// Overlay a role override onto the base configuration
///
/// Scalars present and non-empty in the override replace the base value;
/// absent scalars keep it. Collections are taken from the override only:
/// an unset or empty collection there yields `None`, so a role never
/// silently inherits a cluster-wide volume, selector or limit.
///
/// With no override the base is returned unchanged. The notebook role starts
/// from the notebook image rather than the cluster image.
pub fn derive_role(
    base: &ResolvedConfig,
    role: Role,
    role_override: Option<&RoleOverride>,
) -> RoleConfig {
    let mut config = base.clone();
    if role == Role::Notebook {
        config.pod.image = base.notebook_image.clone();
    }

    if let Some(o) = role_override {
        let pod = &mut config.pod;
        if let Some(image) = non_empty(&o.image) {
            pod.image = image;
        }
        if let Some(policy) = non_empty(&o.image_pull_policy) {
            pod.image_pull_policy = policy;
        }
        pod.volumes = o.volumes.clone().filter(|v| !v.is_empty());
        pod.volume_mounts = o.volume_mounts.clone().filter(|v| !v.is_empty());
        pod.env = o.env.clone().filter(|v| !v.is_empty());
        pod.image_pull_secrets = o.image_pull_secrets.clone().filter(|v| !v.is_empty());
        pod.node_selector = o.node_selector.clone().filter(|v| !v.is_empty());
        pod.affinity = o.affinity.clone().filter(|a| *a != Affinity::default());
        pod.tolerations = o.tolerations.clone().filter(|v| !v.is_empty());
        pod.resources = o
            .resources
            .clone()
            .filter(|r| *r != ResourceRequirements::default());
    }

    RoleConfig { role, config }
}

// =============================================================================
// Job configuration
// =============================================================================

/// Configuration for one DaskJob run against a resolved cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedJobConfig {
    /// Job name
    pub name: String,
    /// Job namespace
    pub namespace: String,
    /// Target cluster configuration
    pub cluster: ResolvedConfig,
    /// Script reference as written in `spec.script`
    pub script: String,
    /// Whether a report volume is requested
    pub report: bool,
    /// StorageClass for the report volume
    pub report_storage_class: String,
    /// Size of the report volume
    pub report_storage_size: String,
    /// Effective pod settings for the job container
    pub pod: PodSettings,
}

/// Build the job configuration from the target cluster's configuration
///
/// The job's image, pull policy and non-empty collections replace the
/// cluster's shared settings.
pub fn resolve_job(job: &DaskJob, cluster: &ResolvedConfig) -> ResolvedJobConfig {
    let spec = &job.spec;
    let mut pod = cluster.pod.clone();
    if let Some(image) = non_empty(&spec.image) {
        pod.image = image;
    }
    if let Some(policy) = non_empty(&spec.image_pull_policy) {
        pod.image_pull_policy = policy;
    }
    if let Some(v) = spec.volumes.clone().filter(|v| !v.is_empty()) {
        pod.volumes = Some(v);
    }
    if let Some(v) = spec.volume_mounts.clone().filter(|v| !v.is_empty()) {
        pod.volume_mounts = Some(v);
    }
    if let Some(v) = spec.env.clone().filter(|v| !v.is_empty()) {
        pod.env = Some(v);
    }
    if let Some(v) = spec.image_pull_secrets.clone().filter(|v| !v.is_empty()) {
        pod.image_pull_secrets = Some(v);
    }
    if let Some(v) = spec.node_selector.clone().filter(|v| !v.is_empty()) {
        pod.node_selector = Some(v);
    }
    if let Some(v) = spec.affinity.clone() {
        pod.affinity = Some(v);
    }
    if let Some(v) = spec.tolerations.clone().filter(|v| !v.is_empty()) {
        pod.tolerations = Some(v);
    }
    if let Some(v) = spec.resources.clone() {
        pod.resources = Some(v);
    }

    ResolvedJobConfig {
        name: job.name_any(),
        namespace: job.namespace().unwrap_or_default(),
        cluster: cluster.clone(),
        script: if spec.script.is_empty() {
            DEFAULT_SCRIPT.to_string()
        } else {
            spec.script.clone()
        },
        report: spec.report,
        report_storage_class: non_empty(&spec.report_storage_class)
            .unwrap_or_else(|| DEFAULT_REPORT_STORAGE_CLASS.to_string()),
        report_storage_size: non_empty(&spec.report_storage_size)
            .unwrap_or_else(|| DEFAULT_REPORT_STORAGE_SIZE.to_string()),
        pod,
    }
}

// =============================================================================
// Affinity
// =============================================================================

/// Builder extensions for [`Affinity`]
pub trait AffinityExt {
    /// Return a copy with a required pod anti-affinity term appended
    ///
    /// The term keeps pods whose `key` label is `value` off the same node.
    /// Existing affinity rules are preserved.
    fn with_anti_affinity(&self, key: &str, value: &str) -> Affinity;
}

impl AffinityExt for Affinity {
    fn with_anti_affinity(&self, key: &str, value: &str) -> Affinity {
        let term = PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: key.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![value.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            ..Default::default()
        };

        let mut anti = self.pod_anti_affinity.clone().unwrap_or_default();
        let mut required = anti
            .required_during_scheduling_ignored_during_execution
            .unwrap_or_default();
        required.push(term);
        anti.required_during_scheduling_ignored_during_execution = Some(required);

        Affinity {
            pod_anti_affinity: Some(anti),
            ..self.clone()
        }
    }
}
