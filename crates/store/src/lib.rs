//! Recon store: namespaced, versioned, watchable in-RAM resource database.
//!
//! `State` is the capability every consumer programs against. `InMemState`
//! holds one namespace; `NamespacedState` multiplexes many of them. Remote
//! clients implement the same trait over the socket.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use recon_core::prelude::*;
use tracing::debug;

mod collection;
pub mod inmem;
pub mod namespaced;

pub use inmem::InMemState;
pub use namespaced::NamespacedState;

/// Lazily produced, cancel-by-drop stream of change events.
pub type WatchStream = BoxStream<'static, StateResult<Event>>;

/// Store tunables, read from `RECON_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Events retained per collection for watch resume checks.
    pub history_capacity: usize,
    /// Per-collection broadcast buffer; slower watchers get `BookmarkExpired`.
    pub watch_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self { Self { history_capacity: 100, watch_buffer: 1024 } }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let history_capacity = std::env::var("RECON_HISTORY_CAPACITY").ok().and_then(|s| s.parse().ok()).unwrap_or(d.history_capacity);
        let watch_buffer = std::env::var("RECON_WATCH_BUFFER").ok().and_then(|s| s.parse().ok()).unwrap_or(d.watch_buffer);
        Self { history_capacity, watch_buffer }
    }
}

/// Core store contract. All mutation is version-gated; nothing retries
/// implicitly.
#[async_trait]
pub trait State: Send + Sync {
    async fn get(&self, r: &ResourceRef) -> StateResult<Resource>;

    /// Resources ordered by id, consistent at a single collection revision.
    async fn list(&self, namespace: &str, kind: &str, selector: &LabelSelector) -> StateResult<Vec<Resource>>;

    /// Stores the resource at version 1.
    async fn create(&self, resource: Resource) -> StateResult<Resource>;

    /// Stores the resource at `expected_version + 1` or fails with `Conflict`.
    async fn update(&self, resource: Resource, expected_version: Version) -> StateResult<Resource>;

    /// Removes the resource, or tombstones it while finalizers remain.
    async fn destroy(&self, r: &ResourceRef, expected_version: Version) -> StateResult<DestroyOutcome>;

    async fn add_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource>;

    /// Purges a tombstoned resource once its last finalizer is gone.
    async fn remove_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource>;

    async fn watch(&self, namespace: &str, kind: &str, opts: WatchOptions) -> StateResult<WatchStream>;
}

/// Read-modify-write helpers layered on any `State`.
#[async_trait]
pub trait StateExt: State {
    /// Re-read and reapply `mutate` until the update lands or `attempts`
    /// conflicts have been seen. Skips the write when `mutate` changes
    /// nothing.
    async fn update_with_conflicts<F>(&self, r: &ResourceRef, attempts: usize, mutate: F) -> StateResult<Resource>
    where
        F: FnMut(&mut Resource) -> StateResult<()> + Send;

    /// Destroy at whatever version is current, retrying version races.
    async fn teardown_and_destroy(&self, r: &ResourceRef) -> StateResult<DestroyOutcome>;

    /// Wait until an event for `r` satisfies `pred`, or the timeout elapses.
    async fn watch_for<P>(&self, r: &ResourceRef, timeout: Duration, pred: P) -> StateResult<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync;
}

pub const DEFAULT_CONFLICT_ATTEMPTS: usize = 5;

#[async_trait]
impl<T: State + ?Sized> StateExt for T {
    async fn update_with_conflicts<F>(&self, r: &ResourceRef, attempts: usize, mut mutate: F) -> StateResult<Resource>
    where
        F: FnMut(&mut Resource) -> StateResult<()> + Send,
    {
        let attempts = attempts.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            let cur = self.get(r).await?;
            let mut next = cur.clone();
            mutate(&mut next)?;
            if next == cur {
                return Ok(cur);
            }
            match self.update(next, cur.version()).await {
                Ok(res) => return Ok(res),
                Err(e) if e.is_conflict() => {
                    debug!(resource = %r, attempt, "store: update conflict, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| StateError::Conflict(r.to_string())))
    }

    async fn teardown_and_destroy(&self, r: &ResourceRef) -> StateResult<DestroyOutcome> {
        let mut last = None;
        for _ in 0..DEFAULT_CONFLICT_ATTEMPTS {
            let cur = self.get(r).await?;
            match self.destroy(r, cur.version()).await {
                Err(e) if e.is_conflict() => last = Some(e),
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| StateError::Conflict(r.to_string())))
    }

    async fn watch_for<P>(&self, r: &ResourceRef, timeout: Duration, pred: P) -> StateResult<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync,
    {
        let opts = WatchOptions { id: Some(r.id.clone()), bootstrap: true, ..Default::default() };
        let mut stream = self.watch(&r.namespace, &r.kind, opts).await?;
        let wait = async {
            while let Some(ev) = stream.next().await {
                let ev = ev?;
                if pred(&ev) {
                    return Ok(ev);
                }
            }
            Err(StateError::Cancelled(format!("watch on {r} ended")))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StateError::Cancelled(format!("timed out waiting for {r}")))?
    }
}
