//! Batch workload, report volume and service account for a DaskJob

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, ServiceAccount, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use dask_common::config::ResolvedJobConfig;
use dask_common::naming::{
    child_name, Owner, JOB_CONFIGS, JOB_REPORT_PVC, JOB_SERVICE_ACCOUNT, JOB_WORKLOAD,
};
use dask_common::Result;

use crate::config_map::{NOTEBOOK_CONFIG, START_JOB};
use crate::{
    apply_pod_settings, env_field, env_value, local_dir_mount, local_dir_volume, owned_meta,
    pod_template, script_mount, script_volume, LOCAL_DIR,
};

/// Mount point of the report volume
pub const REPORTS_DIR: &str = "/reports";

const REPORTS_VOLUME: &str = "reports";

/// How the job runner executes a script
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    /// Jupyter notebook, executed with nbconvert
    Notebook,
    /// Python source
    Python,
    /// Shell script
    Shell,
}

impl ScriptKind {
    /// File extension, also used as `SCRIPT_TYPE`
    pub fn extension(self) -> &'static str {
        match self {
            Self::Notebook => "ipynb",
            Self::Python => "py",
            Self::Shell => "sh",
        }
    }

    /// Kind for a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "ipynb" => Some(Self::Notebook),
            "py" => Some(Self::Python),
            "sh" => Some(Self::Shell),
            _ => None,
        }
    }
}

/// A classified job script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobScript {
    /// How to run it
    pub kind: ScriptKind,
    /// Inline body stored in the job ConfigMap; `None` for a mounted file
    pub content: Option<String>,
    /// Path of the script inside the job container
    pub path: String,
}

impl JobScript {
    /// Script whose body ships in the job ConfigMap as `/app.<ext>`
    pub fn inline(kind: ScriptKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: Some(content.into()),
            path: format!("/app.{}", kind.extension()),
        }
    }

    /// Script already present in the container at `path`
    pub fn mounted(kind: ScriptKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            content: None,
            path: path.into(),
        }
    }

    /// ConfigMap key of an inline script
    pub fn file_name(&self) -> String {
        format!("app.{}", self.kind.extension())
    }
}

/// `daskjob-serviceaccount-<n>`
pub fn job_service_account(owner: &Owner) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: owned_meta(owner, JOB_SERVICE_ACCOUNT)?,
        ..Default::default()
    })
}

/// `daskjob-report-pvc-<n>`: ReadWriteOnce volume for notebook reports
pub fn report_pvc(owner: &Owner, job: &ResolvedJobConfig) -> Result<PersistentVolumeClaim> {
    Ok(PersistentVolumeClaim {
        metadata: owned_meta(owner, JOB_REPORT_PVC)?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(job.report_storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(job.report_storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// `daskjob-job-<n>`: runs the script once against the cluster's scheduler
pub fn batch_job(owner: &Owner, job: &ResolvedJobConfig, script: &JobScript) -> Result<Job> {
    let cluster = &job.cluster;

    let mut mounts = vec![script_mount(START_JOB), script_mount(NOTEBOOK_CONFIG)];
    if script.content.is_some() {
        mounts.push(script_mount(&script.file_name()));
    }
    mounts.push(local_dir_mount());

    let mut volumes = vec![
        script_volume(child_name(JOB_CONFIGS, &owner.name)),
        local_dir_volume(),
    ];

    let mut env = vec![
        env_field("DASK_HOST_NAME", "status.podIP"),
        env_value(
            "DASK_SCHEDULER",
            format!("{}:{}", cluster.scheduler_host(), cluster.scheduler_port),
        ),
        env_value("DASK_PORT_SCHEDULER", cluster.scheduler_port.to_string()),
        env_value("DASK_LOCAL_DIRECTORY", LOCAL_DIR),
        env_field("K8S_APP_NAME", "metadata.name"),
        env_value("SCRIPT_TYPE", script.kind.extension()),
        env_value("SCRIPT_PATH", script.path.clone()),
    ];

    if job.report {
        env.push(env_value("REPORTS_DIR", REPORTS_DIR));
        mounts.push(VolumeMount {
            name: REPORTS_VOLUME.to_string(),
            mount_path: REPORTS_DIR.to_string(),
            ..Default::default()
        });
        volumes.push(Volume {
            name: REPORTS_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: child_name(JOB_REPORT_PVC, &owner.name),
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }

    let mut container = Container {
        name: "job".to_string(),
        command: Some(vec![format!("/{}", START_JOB)]),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    let mut pod = PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(child_name(JOB_SERVICE_ACCOUNT, &owner.name)),
        volumes: Some(volumes),
        ..Default::default()
    };
    apply_pod_settings(&mut pod, &mut container, &job.pod);
    pod.containers = vec![container];

    Ok(Job {
        metadata: owned_meta(owner, JOB_WORKLOAD)?,
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            completions: Some(1),
            parallelism: Some(1),
            template: pod_template(owner, JOB_WORKLOAD, pod),
            ..Default::default()
        }),
        ..Default::default()
    })
}
