//! Kubernetes access for DaskCluster reconciliation
//!
//! Every child lookup goes through [`ClusterKubeClient`]; [`observe`] gathers
//! a pass's view of the cluster and rejects children that belong to someone
//! else.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use dask_common::config::ResolvedConfig;
use dask_common::crd::{DaskCluster, DaskClusterStatus};
use dask_common::kube_utils::{create_namespaced, get_namespaced, patch_resource_status};
use dask_common::naming::{
    child_name, verify_owner, Owner, CONFIGS, INGRESS, NOTEBOOK, SCHEDULER, WORKER,
};
use dask_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for DaskCluster
///
/// Lookups return `Ok(None)` when the object does not exist. Creates treat
/// "already exists" as success, so a pass interrupted halfway can be
/// replayed, but only when the existing object has the same controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterKubeClient: Send + Sync {
    /// Fetch the latest copy of a DaskCluster
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<DaskCluster>, Error>;

    /// Fetch a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Fetch a Service by name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Fetch a Deployment by name
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Fetch an Ingress by name
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;

    /// Create a NetworkPolicy
    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<(), Error>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deploy: &Deployment) -> Result<(), Error>;

    /// Create an Ingress
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error>;

    /// Change only `spec.replicas` of a Deployment
    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error>;

    /// Merge-patch the status subresource of a DaskCluster
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DaskClusterStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ClusterKubeClientImpl {
    client: Client,
}

impl ClusterKubeClientImpl {
    /// Create a new ClusterKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterKubeClient for ClusterKubeClientImpl {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaskCluster>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, cm).await
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, policy).await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, sa).await
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, svc).await
    }

    async fn create_deployment(&self, namespace: &str, deploy: &Deployment) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, deploy).await
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, ingress).await
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(deployment = %name, replicas, "scaled deployment");
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DaskClusterStatus,
    ) -> Result<(), Error> {
        Ok(patch_resource_status::<DaskCluster>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?)
    }
}

/// Children of one DaskCluster as seen at the start of a pass
///
/// The engine updates this view as it creates and scales children so the
/// status computed at the end reflects the whole pass.
#[derive(Clone, Debug, Default)]
pub struct ClusterObservation {
    /// `dask-configs-<n>`
    pub config_map: Option<ConfigMap>,
    /// `dask-scheduler-<n>` Service
    pub scheduler_service: Option<Service>,
    /// `dask-scheduler-<n>` Deployment
    pub scheduler: Option<Deployment>,
    /// `dask-worker-<n>` Deployment
    pub worker: Option<Deployment>,
    /// `jupyter-notebook-<n>` Service, only looked up with the notebook enabled
    pub notebook_service: Option<Service>,
    /// `jupyter-notebook-<n>` Deployment, only looked up with the notebook enabled
    pub notebook: Option<Deployment>,
    /// `dask-<n>` Ingress
    pub ingress: Option<Ingress>,
}

impl ClusterObservation {
    /// Workload Deployments present in this view, scheduler first
    pub fn workloads(&self) -> impl Iterator<Item = &Deployment> {
        [&self.scheduler, &self.worker, &self.notebook]
            .into_iter()
            .flatten()
    }
}

fn owned<K>(found: Option<K>, owner: &Owner) -> Result<Option<K>, Error>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    if let Some(child) = &found {
        verify_owner(child, owner)?;
    }
    Ok(found)
}

/// Look up every child the engine makes decisions on
///
/// A child that exists under the expected name but is controlled by another
/// parent fails the whole observation with an ownership mismatch.
pub async fn observe(
    kube: &dyn ClusterKubeClient,
    owner: &Owner,
    config: &ResolvedConfig,
) -> Result<ClusterObservation, Error> {
    let ns = owner.namespace.as_str();
    let name = owner.name.as_str();

    let config_map = owned(
        kube.get_config_map(ns, &child_name(CONFIGS, name)).await?,
        owner,
    )?;
    let scheduler_service = owned(
        kube.get_service(ns, &child_name(SCHEDULER, name)).await?,
        owner,
    )?;
    let scheduler = owned(
        kube.get_deployment(ns, &child_name(SCHEDULER, name)).await?,
        owner,
    )?;
    let worker = owned(
        kube.get_deployment(ns, &child_name(WORKER, name)).await?,
        owner,
    )?;

    let (notebook_service, notebook) = if config.jupyter {
        (
            owned(
                kube.get_service(ns, &child_name(NOTEBOOK, name)).await?,
                owner,
            )?,
            owned(
                kube.get_deployment(ns, &child_name(NOTEBOOK, name)).await?,
                owner,
            )?,
        )
    } else {
        (None, None)
    };

    let ingress = owned(
        kube.get_ingress(ns, &child_name(INGRESS, name)).await?,
        owner,
    )?;

    Ok(ClusterObservation {
        config_map,
        scheduler_service,
        scheduler,
        worker,
        notebook_service,
        notebook,
        ingress,
    })
}
