//! Readiness gate between a DaskJob and its target cluster

use dask_common::crd::{DaskCluster, STATE_BUILDING};

/// What a job may do given the current state of its cluster
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterGate {
    /// No cluster with the referenced name exists in the job's namespace
    Missing,
    /// The cluster exists but is not Running yet; carries its current state
    NotReady(String),
    /// The cluster is Running and can accept work
    Ready(Box<DaskCluster>),
}

impl ClusterGate {
    /// Gate on the looked-up cluster
    ///
    /// Only the literal `Running` state opens the gate. A cluster whose
    /// status was never written counts as building.
    pub fn evaluate(cluster: Option<DaskCluster>) -> Self {
        match cluster {
            None => Self::Missing,
            Some(c) if c.is_running() => Self::Ready(Box::new(c)),
            Some(c) => Self::NotReady(
                c.status
                    .map(|s| s.state)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| STATE_BUILDING.to_string()),
            ),
        }
    }
}
