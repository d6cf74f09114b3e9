//! DaskCluster controller implementation
//!
//! Each pass re-reads the cluster, observes its children by name, creates
//! whatever is missing in dependency order, scales the worker pool and
//! writes a freshly computed status. Existing children are never edited
//! beyond the worker replica count.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use dask_common::config::{resolve, OperatorDefaults, ResolvedConfig, Role};
use dask_common::crd::{validate_name, DaskCluster, DaskClusterStatus};
use dask_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use dask_common::naming::{Owner, CLUSTER_KIND, CLUSTER_MANAGER};
use dask_common::Error;
use dask_render::{
    cluster_config_map, cluster_ingress, cluster_service_account, dns_network_policy,
    notebook_deployment, notebook_network_policy, notebook_service, scheduler_deployment,
    scheduler_network_policy, scheduler_service, wants_ingress, worker_deployment,
    worker_network_policy,
};

use crate::observer::{observe, ClusterKubeClient, ClusterKubeClientImpl, ClusterObservation};
use crate::status::aggregate;

/// Requeue interval while workloads are still coming up
pub const BUILDING_REQUEUE: Duration = Duration::from_secs(60);
/// Requeue interval after a retryable failure
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn ClusterKubeClient>,
    /// Event publisher for child creation and failures
    pub events: Arc<dyn EventPublisher>,
    /// Process-wide defaults fed to the config resolver
    pub defaults: OperatorDefaults,
}

impl Context {
    /// Create a new context from explicit dependencies
    pub fn new(
        kube: Arc<dyn ClusterKubeClient>,
        events: Arc<dyn EventPublisher>,
        defaults: OperatorDefaults,
    ) -> Self {
        Self {
            kube,
            events,
            defaults,
        }
    }

    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client, defaults: OperatorDefaults) -> Self {
        Self {
            kube: Arc::new(ClusterKubeClientImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CLUSTER_MANAGER)),
            defaults,
        }
    }

    /// Create a context for testing with a mock client and no events
    pub fn for_testing(kube: Arc<dyn ClusterKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(NoopEventPublisher),
            defaults: OperatorDefaults::default(),
        }
    }
}

/// Reconcile a DaskCluster
///
/// Requeues every minute until all workloads report ready, then waits for
/// a change to the cluster or one of its children.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<DaskCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling cluster");

    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "DaskCluster must be namespaced"))?;

    let Some(cluster) = ctx.kube.get_cluster(&namespace, &name).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    let owner = Owner::of(&cluster, CLUSTER_KIND)?;
    let config = resolve(&cluster, &ctx.defaults);

    let status = match converge(&cluster, &owner, &config, &ctx).await {
        Ok(status) => status,
        Err(e) => {
            record_failure(&cluster, &owner, &ctx, &e).await;
            return Err(e);
        }
    };

    ctx.kube
        .patch_cluster_status(&namespace, &name, &status)
        .await?;

    if status.is_running() {
        info!(workloads = status.replicas, "cluster running");
        Ok(Action::await_change())
    } else {
        debug!(
            workloads = status.replicas,
            ready = status.succeeded,
            "cluster still building"
        );
        Ok(Action::requeue(BUILDING_REQUEUE))
    }
}

/// Bring the children in line with `config` and return the resulting status
///
/// Stops at the first failed write; children created before it stay and
/// are found by name on the next pass.
async fn converge(
    cluster: &DaskCluster,
    owner: &Owner,
    config: &ResolvedConfig,
    ctx: &Context,
) -> Result<DaskClusterStatus, Error> {
    validate_name(&owner.name)?;

    let kube = ctx.kube.as_ref();
    let ns = owner.namespace.as_str();
    let mut obs = observe(kube, owner, config).await?;

    if obs.config_map.is_none() {
        if !config.disable_policies {
            kube.create_network_policy(ns, &dns_network_policy(owner)?)
                .await?;
        }
        kube.create_service_account(ns, &cluster_service_account(owner)?)
            .await?;
        let cm = cluster_config_map(owner)?;
        kube.create_config_map(ns, &cm).await?;
        obs.config_map = Some(cm);
        created(ctx, cluster, "cluster configuration").await;
    }

    if config.jupyter && obs.notebook.is_none() {
        create_notebook(kube, owner, config, &mut obs).await?;
        created(ctx, cluster, "notebook").await;
    }

    if obs.scheduler.is_none() {
        create_scheduler(kube, owner, config, &mut obs).await?;
        created(ctx, cluster, "scheduler").await;
    }

    match obs.worker.as_mut() {
        None => {
            if !config.disable_policies {
                kube.create_network_policy(ns, &worker_network_policy(owner)?)
                    .await?;
            }
            let deploy = worker_deployment(owner, &config.for_role(Role::Worker))?;
            kube.create_deployment(ns, &deploy).await?;
            obs.worker = Some(deploy);
            created(ctx, cluster, "worker pool").await;
        }
        Some(worker) => {
            let worker_name = worker.name_any();
            let spec = worker.spec.get_or_insert_with(Default::default);
            if spec.replicas != Some(config.replicas) {
                info!(
                    from = ?spec.replicas,
                    to = config.replicas,
                    "scaling worker pool"
                );
                kube.scale_deployment(ns, &worker_name, config.replicas)
                    .await?;
                spec.replicas = Some(config.replicas);
                ctx.events
                    .publish(
                        &cluster.object_ref(&()),
                        EventType::Normal,
                        reasons::SCALED,
                        actions::SCALE,
                        Some(format!("Scaled worker pool to {}", config.replicas)),
                    )
                    .await;
            }
        }
    }

    if wants_ingress(config) && obs.ingress.is_none() {
        let ingress = cluster_ingress(owner, config)?;
        kube.create_ingress(ns, &ingress).await?;
        obs.ingress = Some(ingress);
        created(ctx, cluster, "ingress").await;
    }

    Ok(aggregate(&obs))
}

async fn create_notebook(
    kube: &dyn ClusterKubeClient,
    owner: &Owner,
    config: &ResolvedConfig,
    obs: &mut ClusterObservation,
) -> Result<(), Error> {
    let ns = owner.namespace.as_str();
    if !config.disable_policies {
        kube.create_network_policy(ns, &notebook_network_policy(owner, config)?)
            .await?;
    }
    let svc = notebook_service(owner, config)?;
    kube.create_service(ns, &svc).await?;
    obs.notebook_service.get_or_insert(svc);

    let deploy = notebook_deployment(owner, &config.for_role(Role::Notebook))?;
    kube.create_deployment(ns, &deploy).await?;
    obs.notebook = Some(deploy);
    Ok(())
}

async fn create_scheduler(
    kube: &dyn ClusterKubeClient,
    owner: &Owner,
    config: &ResolvedConfig,
    obs: &mut ClusterObservation,
) -> Result<(), Error> {
    let ns = owner.namespace.as_str();
    if !config.disable_policies {
        kube.create_network_policy(ns, &scheduler_network_policy(owner, config)?)
            .await?;
    }
    let svc = scheduler_service(owner, config)?;
    kube.create_service(ns, &svc).await?;
    obs.scheduler_service.get_or_insert(svc);

    let deploy = scheduler_deployment(owner, &config.for_role(Role::Scheduler))?;
    kube.create_deployment(ns, &deploy).await?;
    obs.scheduler = Some(deploy);
    Ok(())
}

async fn created(ctx: &Context, cluster: &DaskCluster, what: &str) {
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::CREATED,
            actions::CREATE,
            Some(format!("Created {}", what)),
        )
        .await;
}

/// Write the failure text into `status.state`, best effort
async fn record_failure(cluster: &DaskCluster, owner: &Owner, ctx: &Context, err: &Error) {
    let status = DaskClusterStatus {
        state: err.to_string(),
        ..DaskClusterStatus::building()
    };
    if let Err(e) = ctx
        .kube
        .patch_cluster_status(&owner.namespace, &owner.name, &status)
        .await
    {
        warn!(error = %e, "failed to record reconcile failure in status");
    }
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Warning,
            reasons::RECONCILE_FAILED,
            actions::RECONCILE,
            Some(err.to_string()),
        )
        .await;
}

/// Error policy for the controller
///
/// Errors that need a spec change wait for one; everything else is retried.
pub fn error_policy(cluster: Arc<DaskCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
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
    use crate::observer::MockClusterKubeClient;
    use dask_common::crd::DaskClusterSpec;
    use dask_common::naming::verify_existing;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    // =========================================================================
    // Test Fixture Helpers
    // =========================================================================

    fn sample_cluster(spec: DaskClusterSpec) -> DaskCluster {
        DaskCluster {
            metadata: ObjectMeta {
                name: Some("analytics".to_string()),
                namespace: Some("data".to_string()),
                uid: Some("uid-cluster".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// In-memory stand-in for the API server behind the mocked client
    ///
    /// Objects are kept as JSON keyed by kind and name; every write is
    /// recorded in `calls` so tests can assert on exact write sequences.
    #[derive(Clone, Default)]
    struct FakeStore {
        cluster: Arc<Mutex<Option<DaskCluster>>>,
        objects: Arc<Mutex<BTreeMap<(String, String), serde_json::Value>>>,
        calls: Arc<Mutex<Vec<String>>>,
        statuses: Arc<Mutex<Vec<DaskClusterStatus>>>,
        fail_on: Arc<Mutex<Option<String>>>,
    }

    impl FakeStore {
        fn with_cluster(cluster: DaskCluster) -> Self {
            let store = Self::default();
            *store.cluster.lock().unwrap() = Some(cluster);
            store
        }

        fn cluster(&self) -> Option<DaskCluster> {
            self.cluster.lock().unwrap().clone()
        }

        fn update_spec(&self, f: impl FnOnce(&mut DaskClusterSpec)) {
            if let Some(c) = self.cluster.lock().unwrap().as_mut() {
                f(&mut c.spec);
            }
        }

        fn get<K: DeserializeOwned>(&self, kind: &str, name: &str) -> Option<K> {
            self.objects
                .lock()
                .unwrap()
                .get(&(kind.to_string(), name.to_string()))
                .map(|v| serde_json::from_value(v.clone()).expect("stored object should parse"))
        }

        fn insert<K>(&self, obj: &K)
        where
            K: Resource<DynamicType = ()> + Serialize,
        {
            let key = (K::kind(&()).to_string(), obj.name_any());
            let value = serde_json::to_value(obj).expect("object should serialize");
            self.objects.lock().unwrap().insert(key, value);
        }

        /// Create `obj`; a name that is already taken behaves like a 409
        /// followed by the controller check the real client does
        fn put<K>(&self, obj: &K) -> Result<(), Error>
        where
            K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
        {
            let name = obj.name_any();
            if self.fail_on.lock().unwrap().as_deref() == Some(name.as_str()) {
                return Err(Error::internal("apiserver unavailable"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {}/{}", K::kind(&()), name));
            match self.get::<K>(&K::kind(&()), &name) {
                Some(existing) => verify_existing(&existing, obj),
                None => {
                    self.insert(obj);
                    Ok(())
                }
            }
        }

        fn scale(&self, name: &str, replicas: i32) -> Result<(), Error> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("scale Deployment/{} to {}", name, replicas));
            let key = ("Deployment".to_string(), name.to_string());
            if let Some(v) = self.objects.lock().unwrap().get_mut(&key) {
                v["spec"]["replicas"] = replicas.into();
            }
            Ok(())
        }

        /// Simulate every Deployment's pods becoming ready
        fn mark_all_ready(&self) {
            for ((kind, _), v) in self.objects.lock().unwrap().iter_mut() {
                if kind == "Deployment" {
                    let replicas = v["spec"]["replicas"].clone();
                    v["status"] = serde_json::json!({ "readyReplicas": replicas });
                }
            }
        }

        fn fail_creating(&self, name: &str) {
            *self.fail_on.lock().unwrap() = Some(name.to_string());
        }

        fn take_calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn last_status(&self) -> Option<DaskClusterStatus> {
            self.statuses.lock().unwrap().last().cloned()
        }
    }

    fn mock_kube(store: &FakeStore) -> MockClusterKubeClient {
        let mut mock = MockClusterKubeClient::new();

        let s = store.clone();
        mock.expect_get_cluster().returning(move |_, _| Ok(s.cluster()));
        let s = store.clone();
        mock.expect_get_config_map()
            .returning(move |_, name| Ok(s.get("ConfigMap", name)));
        let s = store.clone();
        mock.expect_get_service()
            .returning(move |_, name| Ok(s.get("Service", name)));
        let s = store.clone();
        mock.expect_get_deployment()
            .returning(move |_, name| Ok(s.get("Deployment", name)));
        let s = store.clone();
        mock.expect_get_ingress()
            .returning(move |_, name| Ok(s.get("Ingress", name)));

        let s = store.clone();
        mock.expect_create_config_map()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_network_policy()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_service_account()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_service().returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_deployment()
            .returning(move |_, obj| s.put(obj));
        let s = store.clone();
        mock.expect_create_ingress().returning(move |_, obj| s.put(obj));

        let s = store.clone();
        mock.expect_scale_deployment()
            .returning(move |_, name, replicas| s.scale(name, replicas));
        let s = store.clone();
        mock.expect_patch_cluster_status()
            .returning(move |_, _, status| {
                s.statuses.lock().unwrap().push(status.clone());
                Ok(())
            });

        mock
    }

    fn context_for(store: &FakeStore) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(mock_kube(store))))
    }

    async fn run_pass(store: &FakeStore) -> Result<Action, Error> {
        let cluster = Arc::new(store.cluster().expect("cluster should exist"));
        reconcile(cluster, context_for(store)).await
    }

    // =========================================================================
    // Creation Stories
    // =========================================================================

    /// Story: A brand new cluster gets its configuration, scheduler and
    /// workers created in dependency order and starts out Building
    #[tokio::test]
    async fn story_new_cluster_creates_children_in_order() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));

        let action = run_pass(&store).await.expect("reconcile should succeed");

        assert_eq!(
            store.take_calls(),
            vec![
                "create NetworkPolicy/dask-networkpolicy-dns-analytics",
                "create ServiceAccount/dask-cluster-serviceaccount-analytics",
                "create ConfigMap/dask-configs-analytics",
                "create NetworkPolicy/dask-scheduler-networkpolicy-analytics",
                "create Service/dask-scheduler-analytics",
                "create Deployment/dask-scheduler-analytics",
                "create NetworkPolicy/dask-worker-networkpolicy-analytics",
                "create Deployment/dask-worker-analytics",
            ]
        );
        let status = store.last_status().expect("status should be written");
        assert_eq!(status.state, "Building");
        assert_eq!(status.replicas, 2);
        assert_eq!(status.succeeded, 0);
        assert_eq!(action, Action::requeue(BUILDING_REQUEUE));
    }

    /// Story: The notebook comes up before the scheduler and the ingress is
    /// created last
    #[tokio::test]
    async fn story_notebook_and_ingress_are_created_when_configured() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec {
            jupyter: true,
            jupyter_ingress: Some("notebook.example.org".to_string()),
            ..Default::default()
        }));

        run_pass(&store).await.expect("reconcile should succeed");

        let calls = store.take_calls();
        let position = |call: &str| {
            calls
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("missing call {call}"))
        };
        assert!(
            position("create Deployment/jupyter-notebook-analytics")
                < position("create NetworkPolicy/dask-scheduler-networkpolicy-analytics")
        );
        assert!(
            position("create NetworkPolicy/jupyter-notebook-networkpolicy-analytics")
                < position("create Service/jupyter-notebook-analytics")
        );
        assert_eq!(calls.last().map(String::as_str), Some("create Ingress/dask-analytics"));
        assert_eq!(store.last_status().map(|s| s.replicas), Some(3));
    }

    /// Story: Clusters that opt out of NetworkPolicies get none
    #[tokio::test]
    async fn story_disabled_policies_are_not_created() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec {
            disable_policies: true,
            jupyter: true,
            ..Default::default()
        }));

        run_pass(&store).await.expect("reconcile should succeed");

        assert!(!store
            .take_calls()
            .iter()
            .any(|c| c.starts_with("create NetworkPolicy/")));
    }

    // =========================================================================
    // Convergence Stories
    // =========================================================================

    /// Story: Reconciling an unchanged cluster a second time writes nothing
    /// but status
    #[tokio::test]
    async fn story_second_pass_is_idempotent() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec {
            jupyter: true,
            scheduler_ingress: Some("scheduler.example.org".to_string()),
            ..Default::default()
        }));

        run_pass(&store).await.expect("first pass should succeed");
        store.take_calls();

        run_pass(&store).await.expect("second pass should succeed");
        assert!(store.take_calls().is_empty());
    }

    /// Story: Once every workload reports ready the cluster is Running and
    /// the controller stops polling
    #[tokio::test]
    async fn story_ready_workloads_mark_cluster_running() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        run_pass(&store).await.expect("first pass should succeed");

        store.mark_all_ready();
        let action = run_pass(&store).await.expect("second pass should succeed");

        let status = store.last_status().expect("status should be written");
        assert_eq!(status.state, "Running");
        assert_eq!(status.replicas, status.succeeded);
        assert!(status.resources.contains("Service: dask-scheduler-analytics"));
        assert_eq!(action, Action::await_change());
    }

    /// Story: Changing only the replica count scales the worker pool with a
    /// single write and touches nothing else
    #[tokio::test]
    async fn story_replica_change_scales_only_workers() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        run_pass(&store).await.expect("first pass should succeed");
        store.mark_all_ready();
        store.take_calls();

        store.update_spec(|spec| spec.replicas = Some(8));
        let action = run_pass(&store).await.expect("scaling pass should succeed");

        assert_eq!(
            store.take_calls(),
            vec!["scale Deployment/dask-worker-analytics to 8"]
        );
        // Pods for the new replicas are not ready yet
        let status = store.last_status().expect("status should be written");
        assert_eq!(status.state, "Building");
        assert_eq!(action, Action::requeue(BUILDING_REQUEUE));
    }

    /// Story: A replica count of zero means the default pool size
    #[tokio::test]
    async fn story_zero_replicas_uses_default_pool_size() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec {
            replicas: Some(0),
            ..Default::default()
        }));
        run_pass(&store).await.expect("reconcile should succeed");

        let worker: k8s_openapi::api::apps::v1::Deployment = store
            .get("Deployment", "dask-worker-analytics")
            .expect("worker should exist");
        assert_eq!(worker.spec.and_then(|s| s.replicas), Some(5));
    }

    /// Story: A cluster deleted between the trigger and the pass is a no-op
    #[tokio::test]
    async fn story_deleted_cluster_is_ignored() {
        let store = FakeStore::default();
        let cluster = Arc::new(sample_cluster(DaskClusterSpec::default()));

        let action = reconcile(cluster, context_for(&store))
            .await
            .expect("reconcile should succeed");

        assert_eq!(action, Action::await_change());
        assert!(store.take_calls().is_empty());
        assert!(store.last_status().is_none());
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    /// Story: A failed create stops the pass, keeps earlier children and
    /// records the failure in status
    #[tokio::test]
    async fn story_create_failure_aborts_pass() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        store.fail_creating("dask-scheduler-analytics");

        let err = run_pass(&store).await.expect_err("pass should fail");

        let calls = store.take_calls();
        assert_eq!(
            calls.last().map(String::as_str),
            Some("create NetworkPolicy/dask-scheduler-networkpolicy-analytics")
        );
        assert!(!calls.iter().any(|c| c.contains("dask-worker")));
        let status = store.last_status().expect("failure should be recorded");
        assert!(status.state.contains("apiserver unavailable"));
        assert!(err.is_retryable());
    }

    /// Story: A same-named Deployment that the cluster does not own is
    /// reported, never adopted
    #[tokio::test]
    async fn story_foreign_child_is_not_adopted() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        store.insert(&k8s_openapi::api::apps::v1::Deployment {
            metadata: ObjectMeta {
                name: Some("dask-worker-analytics".to_string()),
                namespace: Some("data".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = run_pass(&store).await.expect_err("pass should fail");

        assert!(matches!(err, Error::OwnershipMismatch { .. }));
        assert!(store.take_calls().is_empty());
        let cluster = Arc::new(store.cluster().expect("cluster should exist"));
        assert_eq!(
            error_policy(cluster, &err, context_for(&store)),
            Action::requeue(ERROR_REQUEUE)
        );
    }

    /// Story: A ServiceAccount squatting on the cluster's account name is
    /// reported instead of being handed to the cluster pods
    #[tokio::test]
    async fn story_foreign_service_account_is_not_adopted() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        store.insert(&k8s_openapi::api::core::v1::ServiceAccount {
            metadata: ObjectMeta {
                name: Some("dask-cluster-serviceaccount-analytics".to_string()),
                namespace: Some("data".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = run_pass(&store).await.expect_err("pass should fail");

        match &err {
            Error::OwnershipMismatch { kind, name, .. } => {
                assert_eq!(kind, "ServiceAccount");
                assert_eq!(name, "dask-cluster-serviceaccount-analytics");
            }
            other => panic!("Expected OwnershipMismatch, got {other:?}"),
        }
        let calls = store.take_calls();
        assert_eq!(
            calls.last().map(String::as_str),
            Some("create ServiceAccount/dask-cluster-serviceaccount-analytics")
        );
        assert!(!calls.iter().any(|c| c.starts_with("create Deployment/")));
        let status = store.last_status().expect("failure should be recorded");
        assert!(status.state.contains("dask-cluster-serviceaccount-analytics"));
    }

    /// Story: Children left by an interrupted pass are picked up again
    #[tokio::test]
    async fn story_own_leftover_children_count_as_created() {
        let store = FakeStore::with_cluster(sample_cluster(DaskClusterSpec::default()));
        let owner = Owner::of(&store.cluster().expect("cluster should exist"), CLUSTER_KIND)
            .expect("owner should resolve");
        store.insert(&cluster_service_account(&owner).expect("account should render"));

        run_pass(&store).await.expect("reconcile should succeed");

        assert!(store
            .get::<k8s_openapi::api::apps::v1::Deployment>("Deployment", "dask-worker-analytics")
            .is_some());
    }

    /// Story: A name too long for its children is rejected without retry
    #[tokio::test]
    async fn story_overlong_name_is_rejected() {
        let mut cluster = sample_cluster(DaskClusterSpec::default());
        cluster.metadata.name = Some("a".repeat(60));
        let store = FakeStore::with_cluster(cluster);

        let err = run_pass(&store).await.expect_err("pass should fail");

        assert!(matches!(err, Error::Validation { .. }));
        assert!(store.take_calls().is_empty());
        let ctx = context_for(&store);
        let cluster = Arc::new(store.cluster().expect("cluster should exist"));
        assert_eq!(error_policy(cluster, &err, ctx), Action::await_change());
    }

    /// Story: Retryable errors requeue, spec errors wait for a change
    #[test]
    fn story_error_policy_requeues() {
        let store = FakeStore::default();
        let cluster = Arc::new(sample_cluster(DaskClusterSpec::default()));
        let ctx = context_for(&store);

        let action = error_policy(
            Arc::clone(&cluster),
            &Error::internal("connection reset"),
            Arc::clone(&ctx),
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));

        let action = error_policy(cluster, &Error::validation("bad spec"), ctx);
        assert_eq!(action, Action::await_change());
    }

    /// Story: API server throttling is retried even though nothing about the
    /// cluster changes
    #[test]
    fn story_throttled_api_server_is_retried() {
        let store = FakeStore::default();
        let cluster = Arc::new(sample_cluster(DaskClusterSpec::default()));
        let throttled = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "too many requests".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        }));

        let action = error_policy(cluster, &throttled, context_for(&store));
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }
}
