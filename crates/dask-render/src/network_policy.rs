//! NetworkPolicies isolating a Dask cluster
//!
//! Policies are additive: the DNS policy puts every cluster pod under
//! egress isolation, and each role policy opens the paths that role needs.

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use serde_json::json;

use dask_common::config::ResolvedConfig;
use dask_common::naming::{
    Owner, DNS_POLICY, JOB_MANAGER, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME, NOTEBOOK,
    NOTEBOOK_POLICY, SCHEDULER, SCHEDULER_POLICY, WORKER, WORKER_POLICY,
};
use dask_common::Result;

use crate::{from_json, manager, owned_meta};

const KIND: &str = "NetworkPolicy";

fn role_peer(component: &str, instance: &str) -> serde_json::Value {
    json!({ "podSelector": { "matchLabels": {
        LABEL_NAME: component,
        LABEL_INSTANCE: instance,
    }}})
}

/// Job pods in the same namespace act as Dask clients
fn job_peer() -> serde_json::Value {
    json!({ "podSelector": { "matchLabels": { LABEL_MANAGED_BY: JOB_MANAGER }}})
}

fn policy(owner: &Owner, component: &str, spec: serde_json::Value) -> Result<NetworkPolicy> {
    let spec: NetworkPolicySpec = from_json(KIND, spec)?;
    Ok(NetworkPolicy {
        metadata: owned_meta(owner, component)?,
        spec: Some(spec),
        ..Default::default()
    })
}

/// `dask-networkpolicy-dns-<n>`: DNS egress for every cluster pod
pub fn dns_network_policy(owner: &Owner) -> Result<NetworkPolicy> {
    policy(
        owner,
        DNS_POLICY,
        json!({
            "podSelector": { "matchLabels": {
                LABEL_MANAGED_BY: manager(owner),
                LABEL_INSTANCE: owner.name,
            }},
            "policyTypes": ["Egress"],
            "egress": [{ "ports": [
                { "port": 53, "protocol": "UDP" },
                { "port": 53, "protocol": "TCP" },
            ]}],
        }),
    )
}

/// `dask-scheduler-networkpolicy-<n>`
///
/// The scheduler accepts connections on its control and dashboard ports
/// from any pod, and talks out only to its workers.
pub fn scheduler_network_policy(owner: &Owner, config: &ResolvedConfig) -> Result<NetworkPolicy> {
    policy(
        owner,
        SCHEDULER_POLICY,
        json!({
            "podSelector": { "matchLabels": {
                LABEL_NAME: SCHEDULER,
                LABEL_INSTANCE: owner.name,
            }},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{ "ports": [
                { "port": config.scheduler_port, "protocol": "TCP" },
                { "port": config.dashboard_port, "protocol": "TCP" },
            ]}],
            "egress": [{ "to": [role_peer(WORKER, &owner.name)] }],
        }),
    )
}

/// `dask-worker-networkpolicy-<n>`
///
/// Workers talk to each other, the scheduler, the notebook and job clients.
pub fn worker_network_policy(owner: &Owner) -> Result<NetworkPolicy> {
    let peers = json!([
        role_peer(WORKER, &owner.name),
        role_peer(SCHEDULER, &owner.name),
        role_peer(NOTEBOOK, &owner.name),
        job_peer(),
    ]);
    policy(
        owner,
        WORKER_POLICY,
        json!({
            "podSelector": { "matchLabels": {
                LABEL_NAME: WORKER,
                LABEL_INSTANCE: owner.name,
            }},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{ "from": peers }],
            "egress": [{ "to": peers }],
        }),
    )
}

/// `jupyter-notebook-networkpolicy-<n>`
///
/// The notebook serves its UI to anyone and reaches the scheduler and workers.
pub fn notebook_network_policy(owner: &Owner, config: &ResolvedConfig) -> Result<NetworkPolicy> {
    policy(
        owner,
        NOTEBOOK_POLICY,
        json!({
            "podSelector": { "matchLabels": {
                LABEL_NAME: NOTEBOOK,
                LABEL_INSTANCE: owner.name,
            }},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{ "ports": [{ "port": config.notebook_port, "protocol": "TCP" }] }],
            "egress": [{ "to": [
                role_peer(SCHEDULER, &owner.name),
                role_peer(WORKER, &owner.name),
            ]}],
        }),
    )
}
