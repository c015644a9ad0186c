//! Chartfleet jobs: asynchronous, polled resolution of chart default values.

#![forbid(unsafe_code)]

use chartfleet_persist::CacheError;
use thiserror::Error;

pub mod archive;
pub mod jobs;
pub mod pipeline;

pub use jobs::{JobId, JobStatus, Jobs};
pub use pipeline::{PipelineTiming, ValuesPipeline};

/// Why a values job failed. Rendered verbatim into the job's error.
#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("cluster {0} is not part of the fleet")]
    ClusterNotFound(String),
    #[error("chart cache: {0}")]
    Cache(#[from] CacheError),
    #[error("failed to create HelmChart {name}: {cause:#}")]
    CreateChart { name: String, cause: anyhow::Error },
    #[error("failed to wait for chart to become ready: HelmChart {name} is not ready: {reason}")]
    NotReady { name: String, reason: String },
    #[error("values job cancelled")]
    Cancelled,
    #[error("failed to fetch chart artifact: {cause:#}")]
    Artifact { cause: anyhow::Error },
    #[error("failed to read values from chart {chart}: {cause:#}")]
    Unpack { chart: String, cause: anyhow::Error },
}
