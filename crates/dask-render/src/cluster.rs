//! Scheduler, worker and notebook workloads and their Services

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, Probe, Service, ServiceAccount,
    ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use dask_common::config::{AffinityExt, ResolvedConfig, Role, RoleConfig};
use dask_common::naming::{
    self, child_name, Owner, CLUSTER_SERVICE_ACCOUNT, CONFIGS, LABEL_INSTANCE, NOTEBOOK, SCHEDULER,
    WORKER,
};
use dask_common::{Error, Result};

use crate::config_map::{NOTEBOOK_CONFIG, START_NOTEBOOK, START_SCHEDULER, START_WORKER};
use crate::{
    apply_pod_settings, env_field, env_resource, env_value, local_dir_mount, local_dir_volume,
    owned_meta, pod_template, script_mount, script_volume, LOCAL_DIR,
};

/// Worker nanny port
pub const NANNY_PORT: i32 = 8789;
/// Worker data port
pub const WORKER_PORT: i32 = 8788;

/// `dask-cluster-serviceaccount-<n>`
pub fn cluster_service_account(owner: &Owner) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: owned_meta(owner, CLUSTER_SERVICE_ACCOUNT)?,
        ..Default::default()
    })
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

fn service(
    owner: &Owner,
    component: &str,
    config: &ResolvedConfig,
    ports: Vec<ServicePort>,
) -> Result<Service> {
    Ok(Service {
        metadata: owned_meta(owner, component)?,
        spec: Some(ServiceSpec {
            selector: Some(naming::selector_labels(component, &owner.name)),
            type_: Some(config.service_type.clone()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// `dask-scheduler-<n>`: control channel and dashboard
pub fn scheduler_service(owner: &Owner, config: &ResolvedConfig) -> Result<Service> {
    service(
        owner,
        SCHEDULER,
        config,
        vec![
            service_port("scheduler", config.scheduler_port),
            service_port("bokeh", config.dashboard_port),
        ],
    )
}

/// `jupyter-notebook-<n>`
pub fn notebook_service(owner: &Owner, config: &ResolvedConfig) -> Result<Service> {
    service(
        owner,
        NOTEBOOK,
        config,
        vec![service_port("jupyter", config.notebook_port)],
    )
}

fn readiness(initial_delay: i32) -> Probe {
    Probe {
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(10),
        period_seconds: Some(20),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn http_readiness(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        ..readiness(10)
    }
}

fn deployment(
    owner: &Owner,
    component: &str,
    replicas: i32,
    mut pod: PodSpec,
    mut container: Container,
    role: &RoleConfig,
) -> Result<Deployment> {
    apply_pod_settings(&mut pod, &mut container, &role.pod);
    pod.containers = vec![container];
    pod.service_account_name = Some(child_name(CLUSTER_SERVICE_ACCOUNT, &owner.name));

    Ok(Deployment {
        metadata: owned_meta(owner, component)?,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(naming::selector_labels(component, &owner.name)),
                ..Default::default()
            },
            template: pod_template(owner, component, pod),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn cluster_pod(owner: &Owner) -> PodSpec {
    PodSpec {
        volumes: Some(vec![
            script_volume(child_name(CONFIGS, &owner.name)),
            local_dir_volume(),
        ]),
        ..Default::default()
    }
}

fn expect_role(role: &RoleConfig, expected: Role) -> Result<()> {
    if role.role != expected {
        return Err(Error::internal_with_context(
            "render",
            format!("{} configuration passed to the {} renderer", role.role, expected),
        ));
    }
    Ok(())
}

/// `dask-scheduler-<n>`: a single scheduler replica
pub fn scheduler_deployment(owner: &Owner, role: &RoleConfig) -> Result<Deployment> {
    expect_role(role, Role::Scheduler)?;
    let scheduler_host = role.scheduler_host();

    let container = Container {
        name: "scheduler".to_string(),
        command: Some(vec![format!("/{}", START_SCHEDULER)]),
        env: Some(vec![
            env_field("DASK_HOST_NAME", "status.podIP"),
            env_value("DASK_SCHEDULER", scheduler_host.clone()),
            env_value("DASK_PORT_SCHEDULER", role.scheduler_port.to_string()),
            env_value("DASK_PORT_BOKEH", role.dashboard_port.to_string()),
            env_value("DASK_BOKEH_WHITELIST", scheduler_host),
            env_value("DASK_BOKEH_APP_PREFIX", "/"),
            env_value("DASK_LOCAL_DIRECTORY", LOCAL_DIR),
            env_field("K8S_APP_NAME", "metadata.name"),
            env_field("DASK_UID", "metadata.uid"),
            env_field("DASK_NAME", "metadata.name"),
            env_resource("DASK_CPU_LIMIT", "scheduler", "limits.cpu"),
            env_resource("DASK_MEM_LIMIT", "scheduler", "limits.memory"),
        ]),
        ports: Some(vec![
            container_port("scheduler", role.scheduler_port),
            container_port("bokeh", role.dashboard_port),
        ]),
        readiness_probe: Some(http_readiness("/json/identity.json", role.dashboard_port)),
        volume_mounts: Some(vec![script_mount(START_SCHEDULER), local_dir_mount()]),
        ..Default::default()
    };

    deployment(owner, SCHEDULER, 1, cluster_pod(owner), container, role)
}

/// `dask-worker-<n>`: the elastic worker pool
///
/// In daemon mode a required anti-affinity term keeps workers of this
/// cluster on distinct nodes.
pub fn worker_deployment(owner: &Owner, role: &RoleConfig) -> Result<Deployment> {
    expect_role(role, Role::Worker)?;

    let container = Container {
        name: "worker".to_string(),
        command: Some(vec![format!("/{}", START_WORKER)]),
        env: Some(vec![
            env_field("DASK_HOST_NAME", "status.podIP"),
            env_value("DASK_SCHEDULER", role.scheduler_host()),
            env_value("DASK_PORT_NANNY", NANNY_PORT.to_string()),
            env_value("DASK_PORT_WORKER", WORKER_PORT.to_string()),
            env_value("DASK_PORT_SCHEDULER", role.scheduler_port.to_string()),
            env_value("DASK_PORT_BOKEH", format!(":{}", role.dashboard_port)),
            env_value("DASK_LOCAL_DIRECTORY", LOCAL_DIR),
            env_value("DASK_RESOURCES", ""),
            env_field("K8S_APP_NAME", "metadata.name"),
            env_field("DASK_UID", "metadata.uid"),
            env_field("DASK_NAME", "metadata.name"),
            env_resource("DASK_CPU_LIMIT", "worker", "limits.cpu"),
            env_resource("DASK_MEM_LIMIT", "worker", "limits.memory"),
        ]),
        ports: Some(vec![
            container_port("worker", WORKER_PORT),
            container_port("bokeh", role.dashboard_port),
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(role.dashboard_port),
                ..Default::default()
            }),
            ..readiness(10)
        }),
        volume_mounts: Some(vec![script_mount(START_WORKER), local_dir_mount()]),
        ..Default::default()
    };

    let mut worker = deployment(owner, WORKER, role.replicas, cluster_pod(owner), container, role)?;
    if role.daemon {
        if let Some(pod) = worker
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            let base = pod.affinity.take().unwrap_or_default();
            pod.affinity = Some(base.with_anti_affinity(LABEL_INSTANCE, &owner.name));
        }
    }
    Ok(worker)
}

/// `jupyter-notebook-<n>`: a single notebook replica
pub fn notebook_deployment(owner: &Owner, role: &RoleConfig) -> Result<Deployment> {
    expect_role(role, Role::Notebook)?;

    let container = Container {
        name: "jupyter".to_string(),
        command: Some(vec![format!("/{}", START_NOTEBOOK)]),
        env: Some(vec![
            env_value(
                "DASK_SCHEDULER",
                format!("{}:{}", role.scheduler_host(), role.scheduler_port),
            ),
            env_value("JUPYTER_PASSWORD", role.jupyter_password.clone()),
            env_value("NOTEBOOK_PORT", role.notebook_port.to_string()),
        ]),
        ports: Some(vec![container_port("jupyter", role.notebook_port)]),
        readiness_probe: Some(http_readiness("/api", role.notebook_port)),
        volume_mounts: Some(vec![
            script_mount(START_NOTEBOOK),
            script_mount(NOTEBOOK_CONFIG),
            local_dir_mount(),
        ]),
        ..Default::default()
    };

    deployment(owner, NOTEBOOK, 1, cluster_pod(owner), container, role)
}
