//! Per-execution-context access state
//!
//! An [`AccessContext`] travels with one logical unit of work (a thread, or a
//! task that explicitly inherited it). It carries:
//!
//! - the relaxed-access stack: kinds pushed while running computations that
//!   may read stale indexes. Entering the first level suppresses result
//!   memoization until the stack is empty again.
//! - a counter suppressing up-to-date checks, and the reentrancy flag of
//!   `ensure_up_to_date`.
//! - the cooperative cancellation token polled by long scans.
//!
//! The context is `Send` but not `Sync`: it may move to another thread but
//! never be shared by two. Use [`AccessContext::inherit`] to hand the
//! current state to a worker.

use crate::error::IndexError;
use crate::error::Result;
use dashmap::DashMap;
use std::cell::Cell;
use std::cell::RefCell;
use std::hash::Hash;
use tokio_util::sync::CancellationToken;

/// Why a computation is allowed to read possibly stale indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Reads that tolerate indexes being rebuilt
    Stale,
    /// Reads performed by the updater while it is indexing
    Indexing,
    /// Host-defined kind
    Named(&'static str),
}

#[derive(Debug, Default)]
pub struct AccessContext {
    relaxed: RefCell<Vec<AccessKind>>,
    memoization_suppressed: Cell<bool>,
    skip_up_to_date: Cell<u32>,
    updating: Cell<bool>,
    cancel: CancellationToken,
}

impl AccessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose cancellation follows `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..Self::default()
        }
    }

    /// Push `kind`; the returned guard pops it when dropped, including while
    /// unwinding.
    pub fn enter_relaxed(&self, kind: AccessKind) -> RelaxedAccessGuard<'_> {
        let mut stack = self.relaxed.borrow_mut();
        if stack.is_empty() {
            self.memoization_suppressed.set(true);
        }
        stack.push(kind);
        RelaxedAccessGuard { context: self }
    }

    pub fn run_relaxed<R>(&self, kind: AccessKind, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter_relaxed(kind);
        f()
    }

    /// Top of the relaxed-access stack.
    pub fn current_access_kind(&self) -> Option<AccessKind> {
        self.relaxed.borrow().last().copied()
    }

    pub fn relaxed_depth(&self) -> usize {
        self.relaxed.borrow().len()
    }

    pub fn memoization_allowed(&self) -> bool {
        !self.memoization_suppressed.get()
    }

    /// Suppress `ensure_up_to_date` refreshes until the guard drops.
    pub fn skip_up_to_date_checks(&self) -> UpToDateCheckGuard<'_> {
        self.skip_up_to_date.set(self.skip_up_to_date.get() + 1);
        UpToDateCheckGuard { context: self }
    }

    pub fn up_to_date_checks_enabled(&self) -> bool {
        self.skip_up_to_date.get() == 0
    }

    /// Mark the context as inside `ensure_up_to_date`. `None` when it already
    /// is.
    pub(crate) fn enter_update(&self) -> Option<UpdateGuard<'_>> {
        if self.updating.replace(true) {
            None
        } else {
            Some(UpdateGuard { context: self })
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(IndexError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Context for work handed to another thread: it starts under the
    /// current access kind, if any, and is cancelled together with this one.
    pub fn inherit(&self) -> AccessContext {
        let inherited = AccessContext::with_cancellation(self.cancel.child_token());
        if let Some(kind) = self.current_access_kind() {
            inherited.relaxed.borrow_mut().push(kind);
            inherited.memoization_suppressed.set(true);
        }
        inherited.skip_up_to_date.set(self.skip_up_to_date.get());
        inherited
    }
}

#[must_use = "the access kind is popped when the guard is dropped"]
pub struct RelaxedAccessGuard<'a> {
    context: &'a AccessContext,
}

impl Drop for RelaxedAccessGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.context.relaxed.borrow_mut();
        stack.pop();
        if stack.is_empty() {
            self.context.memoization_suppressed.set(false);
        }
    }
}

#[must_use = "up-to-date checks resume when the guard is dropped"]
pub struct UpToDateCheckGuard<'a> {
    context: &'a AccessContext,
}

impl Drop for UpToDateCheckGuard<'_> {
    fn drop(&mut self) {
        let count = self.context.skip_up_to_date.get();
        self.context.skip_up_to_date.set(count.saturating_sub(1));
    }
}

pub(crate) struct UpdateGuard<'a> {
    context: &'a AccessContext,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.context.updating.set(false);
    }
}

/// Memo cache that neither reads nor stores while the calling context
/// suppresses memoization.
#[derive(Debug)]
pub struct ResultCache<K: Eq + Hash, T> {
    entries: DashMap<K, T>,
    capacity: usize,
}

impl<K: Eq + Hash, T: Clone> ResultCache<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_try_compute(
        &self,
        context: &AccessContext,
        key: K,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if !context.memoization_allowed() {
            return compute();
        }
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.value().clone());
        }

        let value = compute()?;
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        self.entries.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
