//! DaskJob controller implementation
//!
//! A job waits until its cluster is Running, then gets a script ConfigMap,
//! an optional report volume, a service account and a batch Job. The batch
//! Job is never modified once created; its conditions decide when the
//! DaskJob is finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, ServiceAccount};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use dask_common::config::{resolve, resolve_job, OperatorDefaults, ResolvedJobConfig};
use dask_common::crd::{
    validate_name, DaskCluster, DaskJob, DaskJobStatus, STATE_FAILED, STATE_RUNNING,
};
use dask_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use dask_common::kube_utils::{
    create_namespaced, first_true_condition, get_namespaced, patch_resource_status,
};
use dask_common::naming::{
    child_name, verify_owner, Owner, JOB_CONFIGS, JOB_KIND, JOB_MANAGER, JOB_REPORT_PVC,
    JOB_WORKLOAD,
};
use dask_common::{Error, FIELD_MANAGER};
use dask_render::{batch_job, job_config_map, job_service_account, report_pvc};

use crate::gate::ClusterGate;
use crate::script::{resolve_script, HttpScriptFetcher, ScriptFetcher};

/// Requeue interval while the cluster is not ready or the job is running
pub const JOB_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue interval after a retryable failure
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Batch Job condition types that end a DaskJob
pub const TERMINAL_CONDITIONS: [&str; 2] = ["Complete", "Failed"];

/// Trait abstracting Kubernetes client operations for DaskJob
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobKubeClient: Send + Sync {
    /// Fetch the latest copy of a DaskJob
    async fn get_dask_job(&self, namespace: &str, name: &str) -> Result<Option<DaskJob>, Error>;

    /// Fetch the DaskCluster a job targets
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<DaskCluster>, Error>;

    /// Fetch a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Fetch a batch Job by name
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Fetch a PersistentVolumeClaim by name
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim)
        -> Result<(), Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Create a batch Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Merge-patch the status subresource of a DaskJob
    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DaskJobStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct JobKubeClientImpl {
    client: Client,
}

impl JobKubeClientImpl {
    /// Create a new JobKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobKubeClient for JobKubeClientImpl {
    async fn get_dask_job(&self, namespace: &str, name: &str) -> Result<Option<DaskJob>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

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

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(get_namespaced(&self.client, namespace, name).await?)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, cm).await
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, pvc).await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, sa).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        create_namespaced(&self.client, namespace, job).await
    }

    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DaskJobStatus,
    ) -> Result<(), Error> {
        Ok(patch_resource_status::<DaskJob>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?)
    }
}

/// Controller context for DaskJob reconciliation
pub struct JobContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn JobKubeClient>,
    /// Remote script downloader
    pub fetcher: Arc<dyn ScriptFetcher>,
    /// Event publisher for job progress and failures
    pub events: Arc<dyn EventPublisher>,
    /// Process-wide defaults, needed to resolve the target cluster's config
    pub defaults: OperatorDefaults,
}

impl JobContext {
    /// Create a new context from explicit dependencies
    pub fn new(
        kube: Arc<dyn JobKubeClient>,
        fetcher: Arc<dyn ScriptFetcher>,
        events: Arc<dyn EventPublisher>,
        defaults: OperatorDefaults,
    ) -> Self {
        Self {
            kube,
            fetcher,
            events,
            defaults,
        }
    }

    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client, defaults: OperatorDefaults) -> Result<Self, Error> {
        Ok(Self {
            kube: Arc::new(JobKubeClientImpl::new(client.clone())),
            fetcher: Arc::new(HttpScriptFetcher::new()?),
            events: Arc::new(KubeEventPublisher::new(client, JOB_MANAGER)),
            defaults,
        })
    }

    /// Create a context for testing with mock clients and no events
    pub fn for_testing(kube: Arc<dyn JobKubeClient>, fetcher: Arc<dyn ScriptFetcher>) -> Self {
        Self {
            kube,
            fetcher,
            events: Arc::new(NoopEventPublisher),
            defaults: OperatorDefaults::default(),
        }
    }
}

#[derive(Debug, Default)]
struct JobObservation {
    config_map: Option<ConfigMap>,
    workload: Option<Job>,
    report_pvc: Option<PersistentVolumeClaim>,
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

async fn observe(
    kube: &dyn JobKubeClient,
    owner: &Owner,
    job: &ResolvedJobConfig,
) -> Result<JobObservation, Error> {
    let ns = owner.namespace.as_str();
    let name = owner.name.as_str();

    let config_map = owned(
        kube.get_config_map(ns, &child_name(JOB_CONFIGS, name)).await?,
        owner,
    )?;
    let workload = owned(kube.get_job(ns, &child_name(JOB_WORKLOAD, name)).await?, owner)?;
    let report_pvc = if job.report {
        owned(
            kube.get_pvc(ns, &child_name(JOB_REPORT_PVC, name)).await?,
            owner,
        )?
    } else {
        None
    };

    Ok(JobObservation {
        config_map,
        workload,
        report_pvc,
    })
}

/// Status derived from the batch Job
///
/// A true `Complete` or `Failed` condition makes its type the state;
/// otherwise the job is Running.
pub fn job_status(workload: &Job) -> DaskJobStatus {
    let status = workload.status.as_ref();
    let terminal = first_true_condition(
        status.and_then(|s| s.conditions.as_deref()),
        &TERMINAL_CONDITIONS,
    );
    DaskJobStatus {
        succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
        state: terminal
            .map(|c| c.type_.clone())
            .unwrap_or_else(|| STATE_RUNNING.to_string()),
        resources: format!(
            "Job: {}, status: {}",
            workload.name_any(),
            serde_json::to_string(&workload.status).unwrap_or_default()
        ),
    }
}

fn is_terminal(status: &DaskJobStatus) -> bool {
    TERMINAL_CONDITIONS.contains(&status.state.as_str())
}

/// Reconcile a DaskJob
#[instrument(skip(job, ctx), fields(job = %job.name_any()))]
pub async fn reconcile(job: Arc<DaskJob>, ctx: Arc<JobContext>) -> Result<Action, Error> {
    info!("reconciling job");

    let name = job.name_any();
    let namespace = job
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "DaskJob must be namespaced"))?;

    let Some(job) = ctx.kube.get_dask_job(&namespace, &name).await? else {
        debug!("job no longer exists");
        return Ok(Action::await_change());
    };
    validate_name(&name)?;

    let cluster = match ClusterGate::evaluate(
        ctx.kube.get_cluster(&namespace, &job.spec.cluster).await?,
    ) {
        ClusterGate::Missing => {
            info!(cluster = %job.spec.cluster, "target cluster not found");
            ctx.kube
                .patch_job_status(&namespace, &name, &DaskJobStatus::pending_cluster())
                .await?;
            ctx.events
                .publish(
                    &job.object_ref(&()),
                    EventType::Normal,
                    reasons::PENDING_CLUSTER,
                    actions::RECONCILE,
                    Some(format!("Waiting for DaskCluster {}", job.spec.cluster)),
                )
                .await;
            return Ok(Action::requeue(JOB_REQUEUE));
        }
        ClusterGate::NotReady(state) => {
            debug!(cluster = %job.spec.cluster, %state, "target cluster not running");
            return Ok(Action::requeue(JOB_REQUEUE));
        }
        ClusterGate::Ready(cluster) => cluster,
    };

    let owner = Owner::of(&job, JOB_KIND)?;
    let cluster_config = resolve(&cluster, &ctx.defaults);
    let config = resolve_job(&job, &cluster_config);

    let status = converge(&job, &owner, &config, &ctx).await?;
    ctx.kube
        .patch_job_status(&namespace, &name, &status)
        .await?;

    if is_terminal(&status) {
        info!(state = %status.state, succeeded = status.succeeded, "job finished");
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(JOB_REQUEUE))
    }
}

async fn converge(
    job: &DaskJob,
    owner: &Owner,
    config: &ResolvedJobConfig,
    ctx: &JobContext,
) -> Result<DaskJobStatus, Error> {
    let kube = ctx.kube.as_ref();
    let ns = owner.namespace.as_str();
    let mut obs = observe(kube, owner, config).await?;

    if obs.config_map.is_none() || obs.workload.is_none() {
        let script = match resolve_script(&config.script, ctx.fetcher.as_ref()).await {
            Ok(script) => script,
            Err(e) => {
                fail_job(job, owner, ctx, &e).await;
                return Err(e);
            }
        };

        if obs.config_map.is_none() {
            let cm = job_config_map(owner, &script)?;
            kube.create_config_map(ns, &cm).await?;
            obs.config_map = Some(cm);
        }

        if obs.workload.is_none() {
            if config.report && obs.report_pvc.is_none() {
                let pvc = report_pvc(owner, config)?;
                kube.create_pvc(ns, &pvc).await?;
                obs.report_pvc = Some(pvc);
            }
            kube.create_service_account(ns, &job_service_account(owner)?)
                .await?;
            let workload = batch_job(owner, config, &script)?;
            kube.create_job(ns, &workload).await?;
            obs.workload = Some(workload);
            ctx.events
                .publish(
                    &job.object_ref(&()),
                    EventType::Normal,
                    reasons::CREATED,
                    actions::CREATE,
                    Some(format!(
                        "Created {} running {}",
                        child_name(JOB_WORKLOAD, &owner.name),
                        script.path
                    )),
                )
                .await;
        }
    }

    Ok(obs
        .workload
        .as_ref()
        .map(job_status)
        .unwrap_or_else(DaskJobStatus::building))
}

/// Mark the job Failed after a script that can never run
async fn fail_job(job: &DaskJob, owner: &Owner, ctx: &JobContext, err: &Error) {
    warn!(error = %err, "job script rejected");
    let status = DaskJobStatus {
        state: STATE_FAILED.to_string(),
        resources: err.to_string(),
        ..Default::default()
    };
    if let Err(e) = ctx
        .kube
        .patch_job_status(&owner.namespace, &owner.name, &status)
        .await
    {
        warn!(error = %e, "failed to record job failure in status");
    }
    ctx.events
        .publish(
            &job.object_ref(&()),
            EventType::Warning,
            reasons::INVALID_SCRIPT,
            actions::RECONCILE,
            Some(err.to_string()),
        )
        .await;
}

/// Error policy for DaskJob reconciliation
///
/// Script and spec errors wait for the job to be edited; everything else is
/// retried.
pub fn error_policy(job: Arc<DaskJob>, error: &Error, _ctx: Arc<JobContext>) -> Action {
    error!(
        ?error,
        job = %job.name_any(),
        "job reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::MockScriptFetcher;
    use dask_common::crd::{DaskClusterSpec, DaskClusterStatus, DaskJobSpec};
    use dask_common::naming::verify_existing;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    // =========================================================================
    // Test Fixture Helpers
    // =========================================================================

    const NOTEBOOK: &str = r#"{"cells": [], "metadata": {}, "nbformat": 4}"#;

    fn sample_job(script: &str) -> DaskJob {
        let mut spec: DaskJobSpec =
            serde_json::from_value(serde_json::json!({ "cluster": "analytics" }))
                .expect("job spec should parse");
        spec.script = script.to_string();
        DaskJob {
            metadata: ObjectMeta {
                name: Some("etl".to_string()),
                namespace: Some("data".to_string()),
                uid: Some("uid-job".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn sample_cluster(state: &str) -> DaskCluster {
        DaskCluster {
            metadata: ObjectMeta {
                name: Some("analytics".to_string()),
                namespace: Some("data".to_string()),
                uid: Some("uid-cluster".to_string()),
                ..Default::default()
            },
            spec: DaskClusterSpec::default(),
            status: Some(DaskClusterStatus {
                state: state.to_string(),
                ..Default::default()
            }),
        }
    }

    /// In-memory stand-in for the API server; records every write
    #[derive(Clone, Default)]
    struct FakeStore {
        job: Arc<Mutex<Option<DaskJob>>>,
        cluster: Arc<Mutex<Option<DaskCluster>>>,
        objects: Arc<Mutex<BTreeMap<(String, String), serde_json::Value>>>,
        calls: Arc<Mutex<Vec<String>>>,
        statuses: Arc<Mutex<Vec<DaskJobStatus>>>,
    }

    impl FakeStore {
        fn new(job: DaskJob, cluster: Option<DaskCluster>) -> Self {
            let store = Self::default();
            *store.job.lock().unwrap() = Some(job);
            *store.cluster.lock().unwrap() = cluster;
            store
        }

        fn get<K: DeserializeOwned>(&self, kind: &str, name: &str) -> Option<K> {
            self.objects
                .lock()
                .unwrap()
                .get(&(kind.to_string(), name.to_string()))
                .map(|v| serde_json::from_value(v.clone()).expect("stored object should parse"))
        }

        /// Create `obj`; a name that is already taken behaves like a 409
        /// followed by the controller check the real client does
        fn put<K>(&self, obj: &K) -> Result<(), Error>
        where
            K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
        {
            let kind = K::kind(&()).to_string();
            let name = obj.name_any();
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {}/{}", kind, name));
            if let Some(existing) = self.get::<K>(&kind, &name) {
                return verify_existing(&existing, obj);
            }
            let value = serde_json::to_value(obj).expect("object should serialize");
            self.objects.lock().unwrap().insert((kind, name), value);
            Ok(())
        }

        /// Simulate the batch Job reaching a terminal condition
        fn finish_workload(&self, condition: &str) {
            let status = JobStatus {
                succeeded: Some(if condition == "Complete" { 1 } else { 0 }),
                conditions: Some(vec![JobCondition {
                    type_: condition.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            };
            let key = ("Job".to_string(), "daskjob-job-etl".to_string());
            if let Some(v) = self.objects.lock().unwrap().get_mut(&key) {
                v["status"] = serde_json::to_value(status).expect("status should serialize");
            }
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn last_status(&self) -> Option<DaskJobStatus> {
            self.statuses.lock().unwrap().last().cloned()
        }
    }

    fn mock_kube(store: &FakeStore) -> MockJobKubeClient {
        let mut mock = MockJobKubeClient::new();

        let s = store.clone();
        mock.expect_get_dask_job()
            .returning(move |_, _| Ok(s.job.lock().unwrap().clone()));
        let s = store.clone();
        mock.expect_get_cluster()
            .returning(move |_, _| Ok(s.cluster.lock().unwrap().clone()));
        let s = store.clone();
        mock.expect_get_config_map()
            .returning(move |_, name| Ok(s.get("ConfigMap", name)));
        let s = store.clone();
        mock.expect_get_job()
            .returning(move |_, name| Ok(s.get("Job", name)));
        let s = store.clone();
        mock.expect_get_pvc()
            .returning(move |_, name| Ok(s.get("PersistentVolumeClaim", name)));

        let s = store.clone();
        mock.expect_create_config_map()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_pvc().returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_service_account()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_job().returning(move |_, obj| s.put(obj));

        let s = store.clone();
        mock.expect_patch_job_status()
            .returning(move |_, _, status| {
                s.statuses.lock().unwrap().push(status.clone());
                Ok(())
            });

        mock
    }

    fn no_fetch() -> Arc<MockScriptFetcher> {
        let mut fetcher = MockScriptFetcher::new();
        fetcher.expect_fetch().never();
        Arc::new(fetcher)
    }

    fn context_with(store: &FakeStore, fetcher: Arc<MockScriptFetcher>) -> Arc<JobContext> {
        Arc::new(JobContext::for_testing(Arc::new(mock_kube(store)), fetcher))
    }

    async fn run_pass(store: &FakeStore) -> Result<Action, Error> {
        run_pass_with(store, no_fetch()).await
    }

    async fn run_pass_with(
        store: &FakeStore,
        fetcher: Arc<MockScriptFetcher>,
    ) -> Result<Action, Error> {
        let job = store.job.lock().unwrap().clone().expect("job should exist");
        reconcile(Arc::new(job), context_with(store, fetcher)).await
    }

    // =========================================================================
    // Gating Stories
    // =========================================================================

    /// Story: A job submitted before its cluster exists waits with a pending
    /// message and creates nothing
    #[tokio::test]
    async fn story_missing_cluster_marks_job_pending() {
        let store = FakeStore::new(sample_job(NOTEBOOK), None);

        let action = run_pass(&store).await.expect("reconcile should succeed");

        assert_eq!(action, Action::requeue(JOB_REQUEUE));
        assert!(store.take_calls().is_empty());
        assert_eq!(
            store.last_status().map(|s| s.state).as_deref(),
            Some("pending cluster creation...")
        );
    }

    /// Story: A job for a cluster that is still building neither progresses
    /// nor fails
    #[tokio::test]
    async fn story_building_cluster_blocks_job() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Building")));

        let action = run_pass(&store).await.expect("reconcile should succeed");

        assert_eq!(action, Action::requeue(JOB_REQUEUE));
        assert!(store.take_calls().is_empty());
        assert!(store.last_status().is_none());
    }

    // =========================================================================
    // Convergence Stories
    // =========================================================================

    /// Story: With a Running cluster an inline notebook job gets its script,
    /// account and batch Job, in that order
    #[tokio::test]
    async fn story_running_cluster_starts_job() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Running")));

        let action = run_pass(&store).await.expect("reconcile should succeed");

        assert_eq!(
            store.take_calls(),
            vec![
                "create ConfigMap/daskjob-configs-etl",
                "create ServiceAccount/daskjob-serviceaccount-etl",
                "create Job/daskjob-job-etl",
            ]
        );
        let cm: ConfigMap = store
            .get("ConfigMap", "daskjob-configs-etl")
            .expect("config map should exist");
        assert_eq!(
            cm.data.and_then(|d| d.get("app.ipynb").cloned()).as_deref(),
            Some(NOTEBOOK)
        );
        assert_eq!(store.last_status().map(|s| s.state).as_deref(), Some("Running"));
        assert_eq!(action, Action::requeue(JOB_REQUEUE));
    }

    /// Story: Reports get their volume claimed before the Job that mounts it
    #[tokio::test]
    async fn story_report_volume_precedes_job() {
        let mut job = sample_job("/notebooks/daily.ipynb");
        job.spec.report = true;
        let store = FakeStore::new(job, Some(sample_cluster("Running")));

        run_pass(&store).await.expect("reconcile should succeed");

        assert_eq!(
            store.take_calls(),
            vec![
                "create ConfigMap/daskjob-configs-etl",
                "create PersistentVolumeClaim/daskjob-report-pvc-etl",
                "create ServiceAccount/daskjob-serviceaccount-etl",
                "create Job/daskjob-job-etl",
            ]
        );
    }

    /// Story: A remote script is downloaded once and shipped inline
    #[tokio::test]
    async fn story_remote_script_is_fetched() {
        let store = FakeStore::new(
            sample_job("https://scripts.example.org/etl.py"),
            Some(sample_cluster("Running")),
        );
        let mut fetcher = MockScriptFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Ok("print('etl')\n".to_string()));

        run_pass_with(&store, Arc::new(fetcher))
            .await
            .expect("reconcile should succeed");

        let cm: ConfigMap = store
            .get("ConfigMap", "daskjob-configs-etl")
            .expect("config map should exist");
        assert_eq!(
            cm.data.and_then(|d| d.get("app.py").cloned()).as_deref(),
            Some("print('etl')\n")
        );
    }

    /// Story: Once the Job exists nothing is re-created and the script is
    /// not resolved again
    #[tokio::test]
    async fn story_second_pass_is_idempotent() {
        let store = FakeStore::new(
            sample_job("https://scripts.example.org/etl.py"),
            Some(sample_cluster("Running")),
        );
        let mut fetcher = MockScriptFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok("print('etl')\n".to_string()));
        run_pass_with(&store, Arc::new(fetcher))
            .await
            .expect("first pass should succeed");
        store.take_calls();

        run_pass(&store).await.expect("second pass should succeed");

        assert!(store.take_calls().is_empty());
    }

    /// Story: A completed batch Job finishes the DaskJob
    #[tokio::test]
    async fn story_complete_condition_finishes_job() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Running")));
        run_pass(&store).await.expect("first pass should succeed");

        store.finish_workload("Complete");
        let action = run_pass(&store).await.expect("second pass should succeed");

        let status = store.last_status().expect("status should be written");
        assert_eq!(status.state, "Complete");
        assert_eq!(status.succeeded, 1);
        assert!(status.resources.starts_with("Job: daskjob-job-etl, status: "));
        assert_eq!(action, Action::await_change());
    }

    /// Story: A failed batch Job is reported as Failed and not retried
    #[tokio::test]
    async fn story_failed_condition_finishes_job() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Running")));
        run_pass(&store).await.expect("first pass should succeed");

        store.finish_workload("Failed");
        let action = run_pass(&store).await.expect("second pass should succeed");

        assert_eq!(store.last_status().map(|s| s.state).as_deref(), Some("Failed"));
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    /// Story: A script that is neither JSON, Python, URL nor path fails the
    /// job immediately and is never retried
    #[tokio::test]
    async fn story_invalid_script_fails_fast() {
        let store = FakeStore::new(
            sample_job("not a script, not json, not a url###"),
            Some(sample_cluster("Running")),
        );

        let err = run_pass(&store).await.expect_err("pass should fail");

        assert!(matches!(err, Error::Validation { .. }));
        assert!(store.take_calls().is_empty());
        let status = store.last_status().expect("failure should be recorded");
        assert_eq!(status.state, "Failed");
        assert!(status.resources.contains("cannot determine script"));

        let job = Arc::new(sample_job("broken"));
        let action = error_policy(job, &err, context_with(&store, no_fetch()));
        assert_eq!(action, Action::await_change());
    }

    /// Story: A remote script that cannot be downloaded also fails fast
    #[tokio::test]
    async fn story_unreachable_script_fails_fast() {
        let store = FakeStore::new(
            sample_job("https://scripts.example.org/gone.ipynb"),
            Some(sample_cluster("Running")),
        );
        let mut fetcher = MockScriptFetcher::new();
        fetcher.expect_fetch().returning(|url| {
            Err(Error::script_fetch(url.as_str(), "404 Not Found"))
        });

        let err = run_pass_with(&store, Arc::new(fetcher))
            .await
            .expect_err("pass should fail");

        assert!(!err.is_retryable());
        assert!(store.take_calls().is_empty());
        assert_eq!(store.last_status().map(|s| s.state).as_deref(), Some("Failed"));
    }

    /// Story: A batch Job with the expected name but another owner is not
    /// adopted
    #[tokio::test]
    async fn story_foreign_workload_is_not_adopted() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Running")));
        store
            .put(&Job {
                metadata: ObjectMeta {
                    name: Some("daskjob-job-etl".to_string()),
                    namespace: Some("data".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .expect("seed should succeed");
        store.take_calls();

        let err = run_pass(&store).await.expect_err("pass should fail");

        assert!(matches!(err, Error::OwnershipMismatch { .. }));
        assert!(store.take_calls().is_empty());
    }

    /// Story: A job ServiceAccount name already taken by someone else stops
    /// the pass before the batch Job is created
    #[tokio::test]
    async fn story_foreign_service_account_is_not_adopted() {
        let store = FakeStore::new(sample_job(NOTEBOOK), Some(sample_cluster("Running")));
        store
            .put(&ServiceAccount {
                metadata: ObjectMeta {
                    name: Some("daskjob-serviceaccount-etl".to_string()),
                    namespace: Some("data".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .expect("seed should succeed");
        store.take_calls();

        let err = run_pass(&store).await.expect_err("pass should fail");

        match &err {
            Error::OwnershipMismatch { kind, name, .. } => {
                assert_eq!(kind, "ServiceAccount");
                assert_eq!(name, "daskjob-serviceaccount-etl");
            }
            other => panic!("Expected OwnershipMismatch, got {other:?}"),
        }
        assert!(!store
            .take_calls()
            .iter()
            .any(|c| c.starts_with("create Job/")));
        assert!(store.get::<Job>("Job", "daskjob-job-etl").is_none());
    }

    /// Story: Throttling by the API server is retried, never parked
    #[test]
    fn story_throttled_api_server_is_retried() {
        let store = FakeStore::new(sample_job(NOTEBOOK), None);
        let throttled = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "too many requests".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        }));

        let action = error_policy(
            Arc::new(sample_job(NOTEBOOK)),
            &throttled,
            context_with(&store, no_fetch()),
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }

    #[test]
    fn running_job_without_conditions_is_running() {
        let workload = Job {
            metadata: ObjectMeta {
                name: Some("daskjob-job-etl".to_string()),
                ..Default::default()
            },
            status: Some(JobStatus {
                active: Some(1),
                conditions: Some(vec![JobCondition {
                    type_: "Complete".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = job_status(&workload);
        assert_eq!(status.state, "Running");
        assert!(!is_terminal(&status));
    }
}
