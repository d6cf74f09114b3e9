//! Ingress for the notebook, scheduler and dashboard hosts

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};

use dask_common::config::ResolvedConfig;
use dask_common::naming::{child_name, Owner, INGRESS, NOTEBOOK, SCHEDULER};
use dask_common::{Error, Result};

use crate::owned_meta;

/// Ingress class the operator targets
pub const INGRESS_CLASS: &str = "nginx";

fn rule(host: &str, service: String, port: i32) -> IngressRule {
    IngressRule {
        host: Some(host.to_string()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service,
                        port: Some(ServiceBackendPort {
                            number: Some(port),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

/// `dask-<n>`: one rule per configured host
///
/// The notebook rule needs the notebook enabled. The dashboard host rides
/// along once any other host is exposed. With no notebook or scheduler host
/// there is nothing to route and rendering fails.
pub fn cluster_ingress(owner: &Owner, config: &ResolvedConfig) -> Result<Ingress> {
    let mut rules = Vec::new();
    if let (true, Some(host)) = (config.jupyter, config.jupyter_ingress.as_deref()) {
        rules.push(rule(
            host,
            child_name(NOTEBOOK, &owner.name),
            config.notebook_port,
        ));
    }
    if let Some(host) = config.scheduler_ingress.as_deref() {
        rules.push(rule(
            host,
            child_name(SCHEDULER, &owner.name),
            config.scheduler_port,
        ));
    }
    if rules.is_empty() {
        return Err(Error::serialization_for_kind(
            "Ingress",
            format!("no ingress hosts configured for {}", owner.name),
        ));
    }
    rules.push(rule(
        &config.monitor_ingress,
        child_name(SCHEDULER, &owner.name),
        config.dashboard_port,
    ));

    let mut metadata = owned_meta(owner, INGRESS)?;
    metadata.annotations = Some(BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/x-forwarded-prefix".to_string(),
            "true".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "false".to_string(),
        ),
    ]));

    Ok(Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Whether the configuration asks for an ingress at all
pub fn wants_ingress(config: &ResolvedConfig) -> bool {
    (config.jupyter && config.jupyter_ingress.is_some()) || config.scheduler_ingress.is_some()
}
