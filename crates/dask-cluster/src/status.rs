//! DaskCluster status aggregation
//!
//! Pure functions over a [`ClusterObservation`]. Counting is per workload:
//! each Deployment adds one to `replicas`, and one to `succeeded` when all of
//! its requested pods are ready.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::Serialize;

use dask_common::crd::{DaskClusterStatus, STATE_BUILDING, STATE_RUNNING};

use crate::observer::ClusterObservation;

const SEPARATOR: &str = " - ";

/// Whether every requested pod of a Deployment is ready
///
/// An unset `spec.replicas` is the API default of one.
pub fn workload_ready(deploy: &Deployment) -> bool {
    let requested = deploy
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deploy
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == requested
}

/// Recompute the cluster status from the pass's final view
pub fn aggregate(obs: &ClusterObservation) -> DaskClusterStatus {
    let mut status = DaskClusterStatus::building();
    for deploy in obs.workloads() {
        status.replicas += 1;
        if workload_ready(deploy) {
            status.succeeded += 1;
        }
    }
    status.state = if status.replicas > 0 && status.replicas == status.succeeded {
        STATE_RUNNING
    } else {
        STATE_BUILDING
    }
    .to_string();
    status.resources = summarize(obs);
    status
}

fn raw<T: Serialize>(status: &Option<T>) -> String {
    serde_json::to_string(status).unwrap_or_default()
}

fn ingress_summary(ingress: &Ingress) -> String {
    let address = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|entries| entries.first())
        .and_then(|e| e.ip.clone().or_else(|| e.hostname.clone()))
        .unwrap_or_default();
    let hosts: Vec<String> = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|r| r.host.as_ref())
        .map(|h| format!("http://{}/", h))
        .collect();
    format!(
        "Ingress: {} IP: {}, Hosts: {}, status: {}",
        ingress.name_any(),
        address,
        hosts.join(" "),
        raw(&ingress.status)
    )
}

fn service_summary(svc: &Service) -> String {
    let spec = svc.spec.as_ref();
    let ports: Vec<String> = spec
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .map(|p| format!("{}/{}", p.name.as_deref().unwrap_or_default(), p.port))
        .collect();
    format!(
        "Service: {} Type: {}, IP: {}, Ports: {}, status: {}",
        svc.name_any(),
        spec.and_then(|s| s.type_.as_deref()).unwrap_or_default(),
        spec.and_then(|s| s.cluster_ip.as_deref()).unwrap_or_default(),
        ports.join(","),
        raw(&svc.status)
    )
}

fn deployment_summary(deploy: &Deployment) -> String {
    format!(
        "Deployment: {} Replicas: {}/{}, status: {}",
        deploy.name_any(),
        deploy
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        raw(&deploy.status)
    )
}

/// Human-readable endpoint summary for `status.resources`
///
/// Ingress, scheduler service, worker pool and notebook service, in that
/// order, each with the raw status of the underlying object. Missing
/// children are left out.
pub fn summarize(obs: &ClusterObservation) -> String {
    let mut parts = Vec::new();
    if let Some(ingress) = &obs.ingress {
        parts.push(ingress_summary(ingress));
    }
    if let Some(svc) = &obs.scheduler_service {
        parts.push(service_summary(svc));
    }
    if let Some(worker) = &obs.worker {
        parts.push(deployment_summary(worker));
    }
    if let Some(svc) = &obs.notebook_service {
        parts.push(service_summary(svc));
    }
    parts.join(SEPARATOR)
}
