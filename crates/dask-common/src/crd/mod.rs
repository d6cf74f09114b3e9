//! Custom Resource Definitions for the Dask operator

mod cluster;
mod job;

pub use cluster::{DaskCluster, DaskClusterSpec, DaskClusterStatus, RoleOverride};
pub use job::{DaskJob, DaskJobSpec, DaskJobStatus};

/// API group shared by all Dask CRDs
pub const API_GROUP: &str = "analytics.dask.dev";

/// `apiVersion` written into owner references
pub const API_VERSION: &str = "analytics.dask.dev/v1";

/// Status state while children are being created or are not yet ready
pub const STATE_BUILDING: &str = "Building";

/// Status state once every workload reports all replicas ready
pub const STATE_RUNNING: &str = "Running";

/// DaskJob status state while the referenced cluster does not exist
pub const STATE_PENDING_CLUSTER: &str = "pending cluster creation...";

/// DaskJob status state after its script failed validation
pub const STATE_FAILED: &str = "Failed";

/// Maximum length of a DaskCluster or DaskJob name
///
/// The longest Service name prefix (`jupyter-notebook-`) plus this stays
/// within the 63-character DNS label limit.
pub const MAX_NAME_LENGTH: usize = 46;

/// Validate a DaskCluster or DaskJob name
///
/// Names must be DNS-1035 labels short enough that every derived Service
/// name is itself a valid label.
pub fn validate_name(name: &str) -> Result<(), crate::Error> {
    if name.is_empty() {
        return Err(crate::Error::validation_for_field(
            name,
            "metadata.name",
            "name must not be empty",
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(crate::Error::validation_for_field(
            name,
            "metadata.name",
            format!("name must be no more than {} characters", MAX_NAME_LENGTH),
        ));
    }
    let first_ok = name.starts_with(|c: char| c.is_ascii_lowercase());
    let last_ok = name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    let body_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !(first_ok && last_ok && body_ok) {
        return Err(crate::Error::validation_for_field(
            name,
            "metadata.name",
            "name must be a lowercase DNS-1035 label",
        ));
    }
    Ok(())
}
