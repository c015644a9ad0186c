//! Chartfleet indexer: watches HelmRepository objects across the fleet and
//! keeps the chart cache current.

#![forbid(unsafe_code)]

use chartfleet_persist::CacheError;
use thiserror::Error;

pub mod classifier;
pub mod reconciler;
pub mod supervisor;

pub use classifier::{load_index, LoadStats};
pub use reconciler::{Reconciler, FINALIZER};
pub use supervisor::{spawn_fleet_watcher, FleetChange, FleetHandle, FleetView, FleetWatcher};

/// Reconcile failures. All of them are retried with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetching index for {repo}: {cause:#}")]
    Fetch { repo: String, cause: anyhow::Error },
    #[error("updating chart cache for {repo}: {source}")]
    Store { repo: String, source: CacheError },
    #[error("updating finalizer on {repo}: {cause:#}")]
    Finalizer { repo: String, cause: anyhow::Error },
}
