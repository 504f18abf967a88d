//! One namespace + type: ordered items, bounded event history and fan-out.
//!
//! Every mutation commits under a single short `std::sync::Mutex` and is
//! broadcast before the lock is released, so all watchers observe the same
//! sequence per collection (and therefore per identity).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use recon_core::now_ms;
use recon_core::prelude::*;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::{StoreConfig, WatchStream};

struct Inner {
    items: BTreeMap<String, Resource>,
    revision: Bookmark,
    history: VecDeque<Event>,
    /// Highest bookmark evicted from `history`.
    compacted_through: Bookmark,
}

pub(crate) struct Collection {
    namespace: String,
    kind: String,
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Event>,
    history_capacity: usize,
}

/// Live-event filter applied on the watcher side of the broadcast.
struct Filter {
    id: Option<String>,
    selector: LabelSelector,
    after: Bookmark,
}

impl Filter {
    fn matches(&self, ev: &Event) -> bool {
        if ev.bookmark <= self.after {
            return false;
        }
        if let Some(id) = &self.id {
            if ev.id() != id {
                return false;
            }
        }
        self.selector.matches(&ev.resource.metadata.labels)
    }
}

fn version_conflict(r: &ResourceRef, expected: Version, actual: Version) -> StateError {
    StateError::Conflict(format!("{r}: expected version {expected}, current version {actual}"))
}

impl Collection {
    pub(crate) fn new(namespace: &str, kind: &str, cfg: &StoreConfig) -> Self {
        let (tx, _) = broadcast::channel(cfg.watch_buffer.max(1));
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            inner: Mutex::new(Inner { items: BTreeMap::new(), revision: 0, history: VecDeque::new(), compacted_through: 0 }),
            tx,
            history_capacity: cfg.history_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic midway through a mutation; a poisoned
        // lock still guards consistent data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reference(&self, id: &str) -> ResourceRef { ResourceRef::new(&self.namespace, &self.kind, id) }

    /// Append to history and broadcast. Must be called with the lock held.
    fn commit(&self, inner: &mut Inner, kind: EventKind, resource: Resource) -> Event {
        inner.revision += 1;
        let ev = Event { kind, resource, bookmark: inner.revision };
        if inner.history.len() >= self.history_capacity {
            if let Some(old) = inner.history.pop_front() {
                inner.compacted_through = old.bookmark;
            }
        }
        inner.history.push_back(ev.clone());
        // No receivers is not an error for us.
        let _ = self.tx.send(ev.clone());
        debug!(ns = %self.namespace, kind = %self.kind, id = %ev.id(), event = %ev.kind, version = ev.version(), bookmark = ev.bookmark, "store: commit");
        ev
    }

    pub(crate) fn get(&self, id: &str) -> StateResult<Resource> {
        self.lock().items.get(id).cloned().ok_or_else(|| StateError::NotFound(self.reference(id).to_string()))
    }

    pub(crate) fn list(&self, selector: &LabelSelector) -> Vec<Resource> {
        let inner = self.lock();
        inner.items.values().filter(|r| selector.matches(&r.metadata.labels)).cloned().collect()
    }

    pub(crate) fn create(&self, mut resource: Resource) -> StateResult<Resource> {
        let mut inner = self.lock();
        let id = resource.metadata.id.clone();
        if inner.items.contains_key(&id) {
            return Err(StateError::AlreadyExists(self.reference(&id).to_string()));
        }
        let now = now_ms();
        let md = &mut resource.metadata;
        md.version = 1;
        md.phase = Phase::Running;
        md.created_ms = now;
        md.updated_ms = now;
        inner.items.insert(id, resource.clone());
        self.commit(&mut inner, EventKind::Created, resource.clone());
        Ok(resource)
    }

    pub(crate) fn update(&self, mut resource: Resource, expected: Version) -> StateResult<Resource> {
        let mut inner = self.lock();
        let id = resource.metadata.id.clone();
        let cur = inner.items.get(&id).ok_or_else(|| StateError::NotFound(self.reference(&id).to_string()))?;
        if cur.metadata.version != expected {
            return Err(version_conflict(&cur.reference(), expected, cur.metadata.version));
        }
        if cur.metadata.tearing_down() {
            return Err(StateError::Conflict(format!("{} is tearing down; only finalizer removal is allowed", cur.reference())));
        }
        let md = &mut resource.metadata;
        md.version = cur.metadata.version + 1;
        md.phase = cur.metadata.phase;
        md.owner = cur.metadata.owner.clone();
        md.created_ms = cur.metadata.created_ms;
        md.updated_ms = now_ms();
        inner.items.insert(id, resource.clone());
        self.commit(&mut inner, EventKind::Updated, resource.clone());
        Ok(resource)
    }

    pub(crate) fn destroy(&self, id: &str, expected: Version) -> StateResult<DestroyOutcome> {
        let mut inner = self.lock();
        let cur = inner.items.get(id).ok_or_else(|| StateError::NotFound(self.reference(id).to_string()))?;
        if cur.metadata.version != expected {
            return Err(version_conflict(&cur.reference(), expected, cur.metadata.version));
        }
        if cur.metadata.tearing_down() {
            return Ok(DestroyOutcome::TearingDown(cur.clone()));
        }
        let mut next = cur.clone();
        next.metadata.version += 1;
        next.metadata.updated_ms = now_ms();
        if next.metadata.finalizers.is_empty() {
            inner.items.remove(id);
            self.commit(&mut inner, EventKind::Destroyed, next.clone());
            return Ok(DestroyOutcome::Destroyed(next));
        }
        next.metadata.phase = Phase::TearingDown;
        inner.items.insert(id.to_string(), next.clone());
        self.commit(&mut inner, EventKind::Updated, next.clone());
        Ok(DestroyOutcome::TearingDown(next))
    }

    pub(crate) fn add_finalizers(&self, id: &str, finalizers: &[String]) -> StateResult<Resource> {
        let mut inner = self.lock();
        let cur = inner.items.get(id).ok_or_else(|| StateError::NotFound(self.reference(id).to_string()))?;
        if cur.metadata.tearing_down() {
            return Err(StateError::Conflict(format!("{} is tearing down; finalizers can only be removed", cur.reference())));
        }
        let mut next = cur.clone();
        if !next.metadata.add_finalizers(finalizers.iter().map(String::as_str)) {
            return Ok(next);
        }
        next.metadata.version += 1;
        next.metadata.updated_ms = now_ms();
        inner.items.insert(id.to_string(), next.clone());
        self.commit(&mut inner, EventKind::Updated, next.clone());
        Ok(next)
    }

    /// Removing the last finalizer of a tombstoned resource purges it.
    pub(crate) fn remove_finalizers(&self, id: &str, finalizers: &[String]) -> StateResult<Resource> {
        let mut inner = self.lock();
        let cur = inner.items.get(id).ok_or_else(|| StateError::NotFound(self.reference(id).to_string()))?;
        let mut next = cur.clone();
        if !next.metadata.remove_finalizers(finalizers.iter().map(String::as_str)) {
            return Ok(next);
        }
        next.metadata.version += 1;
        next.metadata.updated_ms = now_ms();
        if next.metadata.tearing_down() && next.metadata.finalizers.is_empty() {
            inner.items.remove(id);
            self.commit(&mut inner, EventKind::Destroyed, next.clone());
            return Ok(next);
        }
        inner.items.insert(id.to_string(), next.clone());
        self.commit(&mut inner, EventKind::Updated, next.clone());
        Ok(next)
    }

    /// Build the replay prefix for a watch. Returns the events to emit before
    /// live ones. Must be called with the lock held.
    fn replay(&self, inner: &Inner, opts: &WatchOptions) -> StateResult<Vec<Event>> {
        let matching = |r: &Resource| opts.selector.matches(&r.metadata.labels);
        let bootstrap = |r: &Resource| Event { kind: EventKind::Bootstrap, resource: r.clone(), bookmark: inner.revision };
        match (&opts.id, opts.from_version) {
            (Some(id), Some(v)) => self.replay_identity(inner, id, v, &matching),
            (Some(id), None) if opts.bootstrap => {
                Ok(inner.items.get(id).filter(|r| matching(*r)).map(bootstrap).into_iter().collect())
            }
            (None, Some(b)) => {
                if b > inner.revision {
                    return Err(StateError::InvalidArgument(format!(
                        "bookmark {b} is ahead of {}/{} revision {}",
                        self.namespace, self.kind, inner.revision
                    )));
                }
                if b < inner.compacted_through {
                    return Err(StateError::BookmarkExpired(format!(
                        "{}/{}: bookmark {b} compacted (history starts after {})",
                        self.namespace, self.kind, inner.compacted_through
                    )));
                }
                Ok(inner.items.values().filter(|r| matching(*r)).map(bootstrap).collect())
            }
            (None, None) if opts.bootstrap => Ok(inner.items.values().filter(|r| matching(*r)).map(bootstrap).collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Resume a single identity from resource version `v`: the state at `v`
    /// is emitted as a bootstrap event, followed by every retained event
    /// after it.
    fn replay_identity(
        &self,
        inner: &Inner,
        id: &str,
        v: Version,
        matching: &dyn Fn(&Resource) -> bool,
    ) -> StateResult<Vec<Event>> {
        let r = self.reference(id);
        if let Some(cur) = inner.items.get(id) {
            if v > cur.metadata.version {
                return Err(StateError::InvalidArgument(format!(
                    "{r}: version {v} is ahead of current version {}",
                    cur.metadata.version
                )));
            }
            if v == cur.metadata.version {
                let out = Event { kind: EventKind::Bootstrap, resource: cur.clone(), bookmark: inner.revision };
                return Ok(if matching(cur) { vec![out] } else { Vec::new() });
            }
        }
        // Retained events of the current lifetime of this identity.
        let mut tail: Vec<&Event> = Vec::new();
        for ev in inner.history.iter().filter(|e| e.id() == id) {
            if ev.kind == EventKind::Created {
                tail.clear();
            }
            tail.push(ev);
        }
        let start = tail.iter().position(|e| e.version() == v).ok_or_else(|| {
            StateError::BookmarkExpired(format!("{r}: version {v} is no longer retained"))
        })?;
        let mut out = Vec::with_capacity(tail.len() - start);
        for (i, ev) in tail[start..].iter().enumerate() {
            if !matching(&ev.resource) {
                continue;
            }
            let mut ev = (*ev).clone();
            if i == 0 {
                ev.kind = EventKind::Bootstrap;
            }
            out.push(ev);
        }
        Ok(out)
    }

    pub(crate) fn watch(&self, opts: WatchOptions) -> StateResult<WatchStream> {
        let inner = self.lock();
        let replay = self.replay(&inner, &opts)?;
        // Subscribe while holding the lock: nothing can commit in between.
        let rx = self.tx.subscribe();
        let filter = Filter { id: opts.id.clone(), selector: opts.selector.clone(), after: inner.revision };
        drop(inner);
        metrics::counter!("store_watches_total", 1u64, "kind" => self.kind.clone());
        let ctx = format!("{}/{}", self.namespace, self.kind);
        let live = futures::stream::unfold(Some((rx, filter, ctx)), |state| async move {
            let (mut rx, filter, ctx) = state?;
            loop {
                match rx.recv().await {
                    Ok(ev) if filter.matches(&ev) => return Some((Ok(ev), Some((rx, filter, ctx)))),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        let err = StateError::BookmarkExpired(format!("{ctx}: watcher fell behind by {n} events"));
                        return Some((Err(err), None));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(futures::stream::iter(replay.into_iter().map(Ok)).chain(live).boxed())
    }
}
