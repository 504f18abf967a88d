//! Coalescing work queue keyed by resource identity.
//!
//! Pending entries keep only the newest version per identity, in FIFO order.
//! An identity is handed out at most once at a time; changes that arrive
//! while it runs are remembered and re-queued when it finishes. Failure
//! accounting (retry counts, scheduled retries, parking) lives here too so
//! a newer input change can cancel all of it in one place.
//!
//! Versions restart at 1 when an identity is destroyed and created again,
//! so versions are only compared within one lifetime. A create or destroy
//! starts a new one: see `WorkQueue::renew`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use recon_core::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    pending: FxHashMap<ResourceRef, Version>,
    order: VecDeque<ResourceRef>,
    running: FxHashSet<ResourceRef>,
    /// Newer versions observed while the identity was running, and whether
    /// they began a new lifetime.
    dirty: FxHashMap<ResourceRef, (Version, bool)>,
    failures: FxHashMap<ResourceRef, u32>,
    /// Scheduled retries: version and generation of the latest schedule.
    retries: FxHashMap<ResourceRef, (Version, u64)>,
    /// Identities that exhausted their retries, with the failing version.
    parked: FxHashMap<ResourceRef, Version>,
    retry_gen: u64,
    closed: bool,
}

impl Inner {
    /// Drop failure bookkeeping left over from an earlier lifetime.
    fn reset(&mut self, r: &ResourceRef) {
        self.parked.remove(r);
        self.failures.remove(r);
        self.retries.remove(r);
    }

    fn enqueue(&mut self, r: ResourceRef, version: Version, renew: bool) -> bool {
        // A version below the parked one can only come from a later lifetime.
        let renew = renew || self.parked.get(&r).is_some_and(|&pv| version < pv);
        if renew {
            self.reset(&r);
        } else if let Some(&pv) = self.parked.get(&r) {
            if version <= pv {
                return false;
            }
            self.parked.remove(&r);
            self.failures.remove(&r);
        }
        if self.running.contains(&r) {
            let e = self.dirty.entry(r).or_insert((version, renew));
            *e = if renew { (version, true) } else { (e.0.max(version), e.1) };
            return false;
        }
        match self.pending.get_mut(&r) {
            Some(v) if renew => *v = version,
            Some(v) => *v = (*v).max(version),
            None => {
                self.pending.insert(r.clone(), version);
                self.order.push_back(r);
            }
        }
        true
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub backoff: usize,
    pub parked: usize,
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Record a change. Returns true if the identity became (or stayed) pending.
    pub fn push(&self, r: ResourceRef, version: Version) -> bool { self.record(r, version, false) }

    /// Record a change that starts a new lifetime of `r` (a create or a
    /// destroy). Parking, failure counts and scheduled retries of the old
    /// lifetime are dropped, and `version` replaces whatever was pending.
    pub fn renew(&self, r: ResourceRef, version: Version) -> bool { self.record(r, version, true) }

    fn record(&self, r: ResourceRef, version: Version, renew: bool) -> bool {
        let queued = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.enqueue(r, version, renew)
        };
        if queued {
            self.notify.notify_one();
        }
        queued
    }

    /// Take the oldest pending identity, marking it running.
    pub fn try_pop(&self) -> Option<(ResourceRef, Version)> {
        let mut inner = self.lock();
        while let Some(r) = inner.order.pop_front() {
            if let Some(v) = inner.pending.remove(&r) {
                inner.running.insert(r.clone());
                return Some((r, v));
            }
        }
        None
    }

    /// Wait for the next pending identity. `None` once closed.
    pub async fn next(&self) -> Option<(ResourceRef, Version)> {
        loop {
            if self.lock().closed {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            self.notify.notified().await;
        }
    }

    /// Mark a running identity finished. A change seen while it ran is
    /// queued again; returns that version.
    pub fn done(&self, r: &ResourceRef) -> Option<Version> {
        let requeued = {
            let mut inner = self.lock();
            inner.running.remove(r);
            match inner.dirty.remove(r) {
                Some((v, renew)) if !inner.closed && inner.enqueue(r.clone(), v, renew) => Some(v),
                _ => None,
            }
        };
        if requeued.is_some() {
            self.notify.notify_one();
        }
        requeued
    }

    /// Count a failure for `r`; returns the consecutive failure count.
    pub fn record_failure(&self, r: &ResourceRef) -> u32 {
        let mut inner = self.lock();
        let n = inner.failures.entry(r.clone()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn failures(&self, r: &ResourceRef) -> u32 { self.lock().failures.get(r).copied().unwrap_or(0) }

    /// Schedule a retry; the returned generation must be handed back to
    /// `retry` so that only the latest schedule fires.
    pub fn schedule_retry(&self, r: &ResourceRef, version: Version) -> u64 {
        let mut inner = self.lock();
        inner.retry_gen += 1;
        let gen = inner.retry_gen;
        inner.retries.insert(r.clone(), (version, gen));
        gen
    }

    /// Fire a scheduled retry if it is still current.
    pub fn retry(&self, r: &ResourceRef, gen: u64) -> bool {
        let queued = {
            let mut inner = self.lock();
            match inner.retries.get(r) {
                Some(&(v, g)) if g == gen && !inner.closed => {
                    inner.retries.remove(r);
                    inner.enqueue(r.clone(), v, false)
                }
                _ => false,
            }
        };
        if queued {
            self.notify.notify_one();
        }
        queued
    }

    /// Stop retrying `r` until a version newer than `version` shows up.
    pub fn park(&self, r: &ResourceRef, version: Version) {
        let mut inner = self.lock();
        inner.retries.remove(r);
        inner.parked.insert(r.clone(), version);
    }

    pub fn is_parked(&self, r: &ResourceRef) -> bool { self.lock().parked.contains_key(r) }

    /// Clear all failure bookkeeping for `r` after a success.
    pub fn forget(&self, r: &ResourceRef) {
        let mut inner = self.lock();
        inner.failures.remove(r);
        inner.retries.remove(r);
        inner.parked.remove(r);
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            pending: inner.pending.len(),
            running: inner.running.len(),
            backoff: inner.retries.len(),
            parked: inner.parked.len(),
        }
    }

    pub fn len(&self) -> usize { self.lock().pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop pending work and wake the consumer; later pushes are ignored.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.pending.clear();
        inner.order.clear();
        inner.dirty.clear();
        inner.retries.clear();
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
