//! Child resource names, labels and ownership
//!
//! Names are deterministic concatenations of a role prefix and the parent's
//! name. Observation finds previously created children by these names, so
//! they must never change.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::API_VERSION;
use crate::Error;

/// Label key for the component name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label key for the owning DaskCluster or DaskJob
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Label key for the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// `managed-by` value for DaskCluster children
pub const CLUSTER_MANAGER: &str = "DaskController";
/// `managed-by` value for DaskJob children
pub const JOB_MANAGER: &str = "DaskJobController";

/// Kind of the cluster owner recorded on children
pub const CLUSTER_KIND: &str = "DaskCluster";
/// Kind of the job owner recorded on children
pub const JOB_KIND: &str = "DaskJob";

/// ConfigMap with the cluster start-up scripts
pub const CONFIGS: &str = "dask-configs";
/// NetworkPolicy allowing DNS egress for every cluster pod
pub const DNS_POLICY: &str = "dask-networkpolicy-dns";
/// ServiceAccount shared by cluster pods
pub const CLUSTER_SERVICE_ACCOUNT: &str = "dask-cluster-serviceaccount";
/// Scheduler Service and Deployment
pub const SCHEDULER: &str = "dask-scheduler";
/// NetworkPolicy for the scheduler
pub const SCHEDULER_POLICY: &str = "dask-scheduler-networkpolicy";
/// Worker Deployment
pub const WORKER: &str = "dask-worker";
/// NetworkPolicy for the workers
pub const WORKER_POLICY: &str = "dask-worker-networkpolicy";
/// Notebook Service and Deployment
pub const NOTEBOOK: &str = "jupyter-notebook";
/// NetworkPolicy for the notebook
pub const NOTEBOOK_POLICY: &str = "jupyter-notebook-networkpolicy";
/// Ingress for the notebook and scheduler hosts
pub const INGRESS: &str = "dask";
/// ConfigMap with the job script and runner
pub const JOB_CONFIGS: &str = "daskjob-configs";
/// ServiceAccount for the job pod
pub const JOB_SERVICE_ACCOUNT: &str = "daskjob-serviceaccount";
/// PersistentVolumeClaim holding job reports
pub const JOB_REPORT_PVC: &str = "daskjob-report-pvc";
/// Batch Job running the script
pub const JOB_WORKLOAD: &str = "daskjob-job";

/// Build the child name `<component>-<parent>`
pub fn child_name(component: &str, parent: &str) -> String {
    format!("{}-{}", component, parent)
}

/// Standard labels for a child component
pub fn labels(component: &str, instance: &str, managed_by: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(component, instance);
    labels.insert(LABEL_MANAGED_BY.to_string(), managed_by.to_string());
    labels
}

/// Labels used in pod selectors (no `managed-by`, which may change)
pub fn selector_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_NAME.to_string(), component.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), instance.to_string());
    labels
}

/// Identity of a parent resource that owns children
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// `DaskCluster` or `DaskJob`
    pub kind: &'static str,
    /// Parent name
    pub name: String,
    /// Parent namespace
    pub namespace: String,
    /// Parent UID
    pub uid: String,
}

impl Owner {
    /// Capture the owner identity of a Dask resource
    ///
    /// Fails when the resource has no namespace or UID (it was never persisted).
    pub fn of<K>(resource: &K, kind: &'static str) -> Result<Self, Error>
    where
        K: Resource,
    {
        let name = resource.name_any();
        let namespace = resource.namespace().ok_or_else(|| {
            Error::validation_for(&name, format!("{} must be namespaced", kind))
        })?;
        let uid = resource
            .uid()
            .ok_or_else(|| Error::internal_with_context("owner", format!("{} has no UID", name)))?;
        Ok(Self {
            kind,
            name,
            namespace,
            uid,
        })
    }

    /// Controller owner reference written atomically at creation time
    pub fn reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: self.kind.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Metadata for a child component with labels and the owner reference set
    pub fn child_meta(&self, component: &str, managed_by: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(child_name(component, &self.name)),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels(component, &self.name, managed_by)),
            owner_references: Some(vec![self.reference()]),
            ..Default::default()
        }
    }

    fn describe(&self) -> String {
        describe_reference(&self.reference())
    }
}

fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
}

fn describe_reference(r: &OwnerReference) -> String {
    format!("{}/{}/{}", r.api_version, r.kind, r.name)
}

fn mismatch<K>(child: &K, expected: String, found: Option<&OwnerReference>) -> Error
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    Error::ownership_mismatch(
        K::kind(&Default::default()).to_string(),
        child.name_any(),
        expected,
        found.map_or_else(|| "none".to_string(), describe_reference),
    )
}

/// Verify that an observed child is controlled by `owner`
///
/// The controller owner reference must carry the Dask API version, the
/// expected kind and the parent's name. Anything else is a name collision
/// with an unrelated resource and is reported, never adopted.
pub fn verify_owner<K>(child: &K, owner: &Owner) -> Result<(), Error>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    match controller_of(child) {
        Some(r) if r.api_version == API_VERSION && r.kind == owner.kind && r.name == owner.name => {
            Ok(())
        }
        found => Err(mismatch(child, owner.describe(), found)),
    }
}

/// Verify that an object hit by a create conflict belongs to the same parent
/// as the object that was being created
///
/// `desired` must carry its controller reference; the existing object counts
/// as already created only when its controller matches it.
pub fn verify_existing<K>(existing: &K, desired: &K) -> Result<(), Error>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    let expected = controller_of(desired).ok_or_else(|| {
        Error::internal_with_context(
            "ownership",
            format!("{} has no controller reference", desired.name_any()),
        )
    })?;
    match controller_of(existing) {
        Some(r)
            if r.api_version == expected.api_version
                && r.kind == expected.kind
                && r.name == expected.name =>
        {
            Ok(())
        }
        found => Err(mismatch(existing, describe_reference(expected), found)),
    }
}
