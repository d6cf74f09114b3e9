//! Kubernetes Event recording for the Dask controllers
//!
//! Events are fire-and-forget: a failed publish is logged as a warning and
//! never fails reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about Dask resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// A child resource was created
    pub const CREATED: &str = "Created";
    /// The worker Deployment was resized
    pub const SCALED: &str = "Scaled";
    /// The job script could not be classified or fetched
    pub const INVALID_SCRIPT: &str = "InvalidScript";
    /// The referenced cluster does not exist yet
    pub const PENDING_CLUSTER: &str = "PendingCluster";
    /// A reconcile pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Standard reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Child creation
    pub const CREATE: &str = "Create";
    /// Worker scaling
    pub const SCALE: &str = "Scale";
}
