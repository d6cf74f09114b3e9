//! Typed Kubernetes manifests for Dask clusters and jobs
//!
//! One function per child resource. Every function goes straight from the
//! resolved configuration to a k8s-openapi object and returns
//! `Result<T, Error>`: a parent that was never persisted (no UID) or an
//! ingress with no hosts is a serialization error, not a malformed manifest.

#![deny(missing_docs)]

mod cluster;
mod config_map;
mod ingress;
mod job;
mod network_policy;

pub use cluster::{
    cluster_service_account, notebook_deployment, notebook_service, scheduler_deployment,
    scheduler_service, worker_deployment,
};
pub use config_map::{cluster_config_map, job_config_map};
pub use ingress::{cluster_ingress, wants_ingress};
pub use job::{batch_job, job_service_account, report_pvc, JobScript, ScriptKind};
pub use network_policy::{
    dns_network_policy, notebook_network_policy, scheduler_network_policy, worker_network_policy,
};

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, ResourceFieldSelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;

use dask_common::config::PodSettings;
use dask_common::naming::{self, Owner, CLUSTER_KIND, CLUSTER_MANAGER, JOB_MANAGER};
use dask_common::{Error, Result};

/// Volume name for the mounted start-up scripts
pub const SCRIPT_VOLUME: &str = "dask-script";
/// Volume name for the scratch directory
pub const LOCAL_DIR_VOLUME: &str = "localdir";
/// Scratch directory inside every Dask container
pub const LOCAL_DIR: &str = "/var/tmp";
/// File mode for mounted scripts (0777)
pub const SCRIPT_MODE: i32 = 0o777;

/// `managed-by` label value for children of `owner`
pub(crate) fn manager(owner: &Owner) -> &'static str {
    if owner.kind == CLUSTER_KIND {
        CLUSTER_MANAGER
    } else {
        JOB_MANAGER
    }
}

/// Child metadata with labels and the controller owner reference
///
/// Refuses owners without a namespace or UID: a child created without its
/// owner reference would never be garbage collected.
pub(crate) fn owned_meta(owner: &Owner, component: &str) -> Result<ObjectMeta> {
    if owner.uid.is_empty() || owner.namespace.is_empty() {
        return Err(Error::serialization_for_kind(
            owner.kind,
            format!(
                "cannot render {} for {} without namespace and UID",
                component, owner.name
            ),
        ));
    }
    Ok(owner.child_meta(component, manager(owner)))
}

/// Pod template labelled for `component`
pub(crate) fn pod_template(owner: &Owner, component: &str, spec: PodSpec) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(naming::labels(component, &owner.name, manager(owner))),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

/// Deserialize a JSON-shaped manifest fragment into its typed form
pub(crate) fn from_json<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(kind, format!("invalid {}: {}", kind, e)))
}

pub(crate) fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub(crate) fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn env_resource(name: &str, container: &str, resource: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                container_name: Some(container.to_string()),
                resource: resource.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mount a single file from the script ConfigMap at `/<file>`
pub(crate) fn script_mount(file: &str) -> VolumeMount {
    VolumeMount {
        name: SCRIPT_VOLUME.to_string(),
        mount_path: format!("/{}", file),
        sub_path: Some(file.to_string()),
        ..Default::default()
    }
}

pub(crate) fn script_volume(config_map: String) -> Volume {
    Volume {
        name: SCRIPT_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map,
            default_mode: Some(SCRIPT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn local_dir_mount() -> VolumeMount {
    VolumeMount {
        name: LOCAL_DIR_VOLUME.to_string(),
        mount_path: LOCAL_DIR.to_string(),
        read_only: Some(false),
        ..Default::default()
    }
}

pub(crate) fn local_dir_volume() -> Volume {
    Volume {
        name: LOCAL_DIR_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Apply image, collections and placement from `settings`
///
/// User env, mounts and volumes are appended after the built-in ones so
/// they can shadow built-in env vars.
pub(crate) fn apply_pod_settings(
    pod: &mut PodSpec,
    container: &mut Container,
    settings: &PodSettings,
) {
    container.image = Some(settings.image.clone());
    container.image_pull_policy = Some(settings.image_pull_policy.clone());
    container.resources = settings.resources.clone();

    if let Some(env) = &settings.env {
        container.env.get_or_insert_with(Vec::new).extend(env.iter().cloned());
    }
    if let Some(mounts) = &settings.volume_mounts {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .extend(mounts.iter().cloned());
    }
    if let Some(volumes) = &settings.volumes {
        pod.volumes
            .get_or_insert_with(Vec::new)
            .extend(volumes.iter().cloned());
    }

    pod.image_pull_secrets = settings.image_pull_secrets.clone();
    pod.node_selector = settings.node_selector.clone();
    pod.affinity = settings.affinity.clone();
    pod.tolerations = settings.tolerations.clone();
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use k8s_openapi::api::core::v1::Toleration;

    #[test]
    fn owned_meta_requires_uid() {
        let mut owner = cluster_owner();
        owner.uid.clear();
        let err = owned_meta(&owner, naming::CONFIGS).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.to_string().contains("without namespace and UID"));
    }

    #[test]
    fn managed_by_follows_owner_kind() {
        assert_eq!(manager(&cluster_owner()), "DaskController");
        assert_eq!(manager(&job_owner()), "DaskJobController");
    }

    #[test]
    fn user_env_is_appended_after_builtins() {
        let settings = PodSettings {
            image: "img".to_string(),
            image_pull_policy: "Always".to_string(),
            env: Some(vec![env_value("EXTRA", "1")]),
            tolerations: Some(vec![Toleration {
                key: Some("gpu".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let mut pod = PodSpec::default();
        let mut c = Container {
            env: Some(vec![env_value("BUILTIN", "0")]),
            ..Default::default()
        };
        apply_pod_settings(&mut pod, &mut c, &settings);

        let names: Vec<_> = c.env.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["BUILTIN", "EXTRA"]);
        assert_eq!(c.image.as_deref(), Some("img"));
        assert_eq!(pod.tolerations.map(|t| t.len()), Some(1));
        assert!(pod.volumes.is_none());
    }
}
