//! Controller runner - builds the DaskCluster and DaskJob controller futures
//!
//! Both controllers watch their owned children so a deleted or updated
//! Deployment, Service or Job triggers a pass on its parent.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use dask_common::config::OperatorDefaults;
use dask_common::crd::{DaskCluster, DaskJob};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api scoped to `namespace`, or cluster-wide when unset
fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the DaskCluster controller future
pub fn build_cluster_controller(
    client: Client,
    namespace: Option<&str>,
    defaults: OperatorDefaults,
) -> ControllerFuture {
    let ctx = Arc::new(dask_cluster::Context::from_client(client.clone(), defaults));

    tracing::info!("- DaskCluster controller");

    Box::pin(
        Controller::new(scoped::<DaskCluster>(&client, namespace), watcher_config())
            .owns(scoped::<ConfigMap>(&client, namespace), watcher_config())
            .owns(scoped::<Service>(&client, namespace), watcher_config())
            .owns(scoped::<Deployment>(&client, namespace), watcher_config())
            .owns(scoped::<Ingress>(&client, namespace), watcher_config())
            .owns(scoped::<NetworkPolicy>(&client, namespace), watcher_config())
            .owns(scoped::<ServiceAccount>(&client, namespace), watcher_config())
            .shutdown_on_signal()
            .run(dask_cluster::reconcile, dask_cluster::error_policy, ctx)
            .for_each(log_reconcile_result("DaskCluster")),
    )
}

/// Build the DaskJob controller future
pub fn build_job_controller(
    client: Client,
    namespace: Option<&str>,
    defaults: OperatorDefaults,
) -> Result<ControllerFuture, dask_common::Error> {
    let ctx = Arc::new(dask_job::JobContext::from_client(client.clone(), defaults)?);

    tracing::info!("- DaskJob controller");

    Ok(Box::pin(
        Controller::new(scoped::<DaskJob>(&client, namespace), watcher_config())
            .owns(scoped::<ConfigMap>(&client, namespace), watcher_config())
            .owns(scoped::<Job>(&client, namespace), watcher_config())
            .owns(
                scoped::<PersistentVolumeClaim>(&client, namespace),
                watcher_config(),
            )
            .owns(scoped::<ServiceAccount>(&client, namespace), watcher_config())
            .shutdown_on_signal()
            .run(dask_job::reconcile, dask_job::error_policy, ctx)
            .for_each(log_reconcile_result("DaskJob")),
    ))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
