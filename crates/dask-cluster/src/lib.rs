//! DaskCluster reconciliation
//!
//! - [`observer`]: Kubernetes access and per-pass observation of children
//! - [`status`]: readiness counting and the `status.resources` summary
//! - [`controller`]: the reconcile loop and error policy

pub mod controller;
pub mod observer;
pub mod status;

pub use controller::{error_policy, reconcile, Context};
pub use observer::{ClusterKubeClient, ClusterKubeClientImpl, ClusterObservation};
