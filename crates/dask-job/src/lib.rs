//! DaskJob reconciliation
//!
//! Jobs are gated on their target cluster reaching `Running`; the script is
//! classified (and fetched, for remote URLs) only when job children still
//! need creating.

#![deny(missing_docs)]

pub mod controller;
pub mod gate;
pub mod script;

pub use controller::{error_policy, reconcile, JobContext, JobKubeClient, JobKubeClientImpl};
pub use gate::ClusterGate;
pub use script::{resolve_script, HttpScriptFetcher, ScriptFetcher};
