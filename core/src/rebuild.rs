//! Fault classification and per-index rebuild status
//!
//! ```text
//!        request_rebuild            begin_rebuild           finish_rebuild
//!   Ok ─────────────────▶ Requires ───────────────▶ InProgress ─────────────▶ Ok
//!                          Rebuild  ◀───────────────
//!                                    request_rebuild
//! ```

use crate::config::FaultPolicy;
use crate::error::IndexError;
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use tracing::debug;
use tracing::info;

/// What to do about an error raised while reading or writing an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Persisted data is suspect; discard and recompute it
    Rebuild,
    /// Cooperative cancellation; propagate without side effects
    Cancelled,
    /// The indexer misbehaved; propagate, stored data is not implicated
    IndexerError,
    /// Not an index-storage concern
    Unrelated,
}

pub fn classify_fault(error: &IndexError, policy: &FaultPolicy) -> FaultClass {
    match error {
        IndexError::Storage { source, .. } if policy.rebuilds_on(source.kind()) => {
            FaultClass::Rebuild
        }
        IndexError::Cancelled => FaultClass::Cancelled,
        IndexError::Indexer { .. } => FaultClass::IndexerError,
        _ => FaultClass::Unrelated,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStatus {
    Ok,
    RequiresRebuild,
    RebuildInProgress,
}

/// "This index's persisted data must be discarded and recomputed."
#[derive(Debug, Clone)]
pub struct RebuildMarker {
    pub index: String,
    pub cause: String,
    pub requested_at: SystemTime,
}

#[derive(Debug, Default)]
pub struct RebuildCoordinator {
    status: DashMap<String, RebuildStatus>,
    pending: Mutex<Vec<RebuildMarker>>,
    requested: AtomicU64,
}

impl RebuildCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a rebuild of `index`. Returns `false` when one is already
    /// pending.
    pub fn request_rebuild(&self, index: &str, cause: impl Into<String>) -> bool {
        let mut status = self
            .status
            .entry(index.to_string())
            .or_insert(RebuildStatus::Ok);
        if *status == RebuildStatus::RequiresRebuild {
            return false;
        }
        *status = RebuildStatus::RequiresRebuild;
        drop(status);

        let cause = cause.into();
        info!("Rebuild requested for index {}: {}", index, cause);
        self.requested.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RebuildMarker {
                index: index.to_string(),
                cause,
                requested_at: SystemTime::now(),
            });
        true
    }

    /// Hand every pending marker to the caller.
    pub fn take_rebuild_requests(&self) -> Vec<RebuildMarker> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn has_pending_requests(&self) -> bool {
        !self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// `RequiresRebuild → RebuildInProgress`. Returns `false` if the index
    /// was not waiting for a rebuild.
    pub fn begin_rebuild(&self, index: &str) -> bool {
        match self.status.get_mut(index) {
            Some(mut status) if *status == RebuildStatus::RequiresRebuild => {
                *status = RebuildStatus::RebuildInProgress;
                true
            }
            _ => false,
        }
    }

    /// `RebuildInProgress → Ok`. A request that arrived meanwhile keeps the
    /// index in `RequiresRebuild`.
    pub fn finish_rebuild(&self, index: &str) {
        if let Some(mut status) = self.status.get_mut(index)
            && *status == RebuildStatus::RebuildInProgress
        {
            *status = RebuildStatus::Ok;
            debug!("Rebuild of index {} finished", index);
        }
    }

    pub fn status(&self, index: &str) -> RebuildStatus {
        self.status
            .get(index)
            .map_or(RebuildStatus::Ok, |status| *status)
    }

    pub fn requires_rebuild(&self, index: &str) -> bool {
        self.status(index) != RebuildStatus::Ok
    }

    /// Rebuilds requested since startup.
    pub fn requested_count(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }
}
