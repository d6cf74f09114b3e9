//! Script ConfigMaps for clusters and jobs

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use dask_common::naming::{Owner, CONFIGS, JOB_CONFIGS};
use dask_common::Result;

use crate::job::JobScript;
use crate::owned_meta;

pub(crate) const START_SCHEDULER: &str = "start-dask-scheduler.sh";
pub(crate) const START_WORKER: &str = "start-dask-worker.sh";
pub(crate) const START_NOTEBOOK: &str = "start-jupyter-notebook.sh";
pub(crate) const NOTEBOOK_CONFIG: &str = "jupyter_notebook_config.py";
pub(crate) const START_JOB: &str = "start-dask-job.sh";

const START_SCHEDULER_SCRIPT: &str = include_str!("../assets/start-dask-scheduler.sh");
const START_WORKER_SCRIPT: &str = include_str!("../assets/start-dask-worker.sh");
const START_NOTEBOOK_SCRIPT: &str = include_str!("../assets/start-jupyter-notebook.sh");
const NOTEBOOK_CONFIG_SCRIPT: &str = include_str!("../assets/jupyter_notebook_config.py");
const START_JOB_SCRIPT: &str = include_str!("../assets/start-dask-job.sh");

/// `dask-configs-<n>`: start-up scripts for scheduler, worker and notebook
pub fn cluster_config_map(owner: &Owner) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        (START_SCHEDULER.to_string(), START_SCHEDULER_SCRIPT.to_string()),
        (START_WORKER.to_string(), START_WORKER_SCRIPT.to_string()),
        (START_NOTEBOOK.to_string(), START_NOTEBOOK_SCRIPT.to_string()),
        (NOTEBOOK_CONFIG.to_string(), NOTEBOOK_CONFIG_SCRIPT.to_string()),
    ]);

    Ok(ConfigMap {
        metadata: owned_meta(owner, CONFIGS)?,
        data: Some(data),
        ..Default::default()
    })
}

/// `daskjob-configs-<n>`: the job runner plus the inline script, if any
pub fn job_config_map(owner: &Owner, script: &JobScript) -> Result<ConfigMap> {
    let mut data = BTreeMap::from([
        (START_JOB.to_string(), START_JOB_SCRIPT.to_string()),
        (NOTEBOOK_CONFIG.to_string(), NOTEBOOK_CONFIG_SCRIPT.to_string()),
    ]);
    if let Some(content) = &script.content {
        data.insert(script.file_name(), content.clone());
    }

    Ok(ConfigMap {
        metadata: owned_meta(owner, JOB_CONFIGS)?,
        data: Some(data),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cluster_owner, job_owner};
    use crate::ScriptKind;

    #[test]
    fn cluster_config_map_carries_every_start_script() {
        let cm = cluster_config_map(&cluster_owner()).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("dask-configs-analytics"));
        let data = cm.data.unwrap();
        for key in [START_SCHEDULER, START_WORKER, START_NOTEBOOK, NOTEBOOK_CONFIG] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert!(data[START_WORKER].starts_with("#!/usr/bin/env bash"));
    }

    #[test]
    fn inline_script_is_stored_under_app_file() {
        let script = JobScript::inline(ScriptKind::Python, "#!/usr/bin/env python\nprint(1)\n");
        let cm = job_config_map(&job_owner(), &script).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("daskjob-configs-etl"));
        let data = cm.data.unwrap();
        assert_eq!(data["app.py"], "#!/usr/bin/env python\nprint(1)\n");
        assert!(data.contains_key(START_JOB));
    }

    #[test]
    fn mounted_script_adds_no_app_file() {
        let script = JobScript::mounted(ScriptKind::Shell, "/local/path.sh");
        let data = job_config_map(&job_owner(), &script).unwrap().data.unwrap();
        assert!(!data.keys().any(|k| k.starts_with("app.")));
    }
}
