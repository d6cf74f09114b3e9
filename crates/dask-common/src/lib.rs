//! Common types for the Dask operator: CRDs, configuration, errors and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod naming;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for status patches and server-side apply
pub const FIELD_MANAGER: &str = "dask-operator";
