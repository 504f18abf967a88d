//! Adapter bridge: scoped store access for controllers, and the request/ack
//! exchange that lets a controller's reconcile run in another process.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use recon_core::prelude::*;
use recon_store::{State, WatchStream};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::{Controller, Input, ReconcileContext, Registration, Task};
use crate::Runtime;

/// `State` view for one controller. Reads are limited to its inputs and
/// output types; writes to output types; finalizers may be managed on
/// inputs too, since that is how a controller holds up their teardown.
pub struct ScopedState {
    inner: Arc<dyn State>,
    controller: String,
    inputs: Vec<Input>,
    outputs: BTreeSet<String>,
}

impl ScopedState {
    pub fn new(inner: Arc<dyn State>, registration: &Registration) -> Self {
        Self {
            inner,
            controller: registration.name.clone(),
            inputs: registration.inputs.clone(),
            outputs: registration.output_set(),
        }
    }

    pub fn controller(&self) -> &str { &self.controller }

    /// Unscoped store. Only the runtime itself should need this.
    pub fn unscoped(&self) -> Arc<dyn State> { Arc::clone(&self.inner) }

    fn denied(&self, what: String) -> StateError {
        metrics::counter!("adapter_unauthorized_total", 1u64, "controller" => self.controller.clone());
        debug!(controller = %self.controller, %what, "adapter: access denied");
        StateError::Unauthorized(format!("controller {}: {what}", self.controller))
    }

    fn is_input(&self, namespace: &str, kind: &str) -> bool {
        self.inputs.iter().any(|i| i.namespace == namespace && i.kind == kind)
    }

    fn check_read(&self, namespace: &str, kind: &str) -> StateResult<()> {
        if self.outputs.contains(kind) || self.is_input(namespace, kind) {
            return Ok(());
        }
        Err(self.denied(format!("{namespace}/{kind} is neither an input nor an output")))
    }

    fn check_write(&self, kind: &str) -> StateResult<()> {
        if self.outputs.contains(kind) {
            return Ok(());
        }
        Err(self.denied(format!("type {kind} is not a declared output")))
    }

    /// Writes may not touch a resource another controller created.
    async fn check_owner(&self, r: &ResourceRef) -> StateResult<()> {
        let cur = self.inner.get(r).await?;
        let owner = &cur.metadata.owner;
        if !owner.is_empty() && owner != &self.controller {
            return Err(self.denied(format!("{r} is owned by {owner}")));
        }
        Ok(())
    }
}

#[async_trait]
impl State for ScopedState {
    async fn get(&self, r: &ResourceRef) -> StateResult<Resource> {
        self.check_read(&r.namespace, &r.kind)?;
        self.inner.get(r).await
    }

    async fn list(&self, namespace: &str, kind: &str, selector: &LabelSelector) -> StateResult<Vec<Resource>> {
        self.check_read(namespace, kind)?;
        self.inner.list(namespace, kind, selector).await
    }

    async fn create(&self, mut resource: Resource) -> StateResult<Resource> {
        self.check_write(&resource.metadata.kind)?;
        resource.metadata.owner = self.controller.clone();
        self.inner.create(resource).await
    }

    async fn update(&self, resource: Resource, expected_version: Version) -> StateResult<Resource> {
        let r = resource.reference();
        self.check_write(&r.kind)?;
        self.check_owner(&r).await?;
        self.inner.update(resource, expected_version).await
    }

    async fn destroy(&self, r: &ResourceRef, expected_version: Version) -> StateResult<DestroyOutcome> {
        self.check_write(&r.kind)?;
        self.check_owner(r).await?;
        self.inner.destroy(r, expected_version).await
    }

    async fn add_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.check_read(&r.namespace, &r.kind)?;
        self.inner.add_finalizers(r, finalizers).await
    }

    async fn remove_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.check_read(&r.namespace, &r.kind)?;
        self.inner.remove_finalizers(r, finalizers).await
    }

    async fn watch(&self, namespace: &str, kind: &str, opts: WatchOptions) -> StateResult<WatchStream> {
        self.check_read(namespace, kind)?;
        self.inner.watch(namespace, kind, opts).await
    }
}

/// A task in flight to a remote controller, identified per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: u64,
    pub task: Task,
}

type AckResult = Result<(), String>;

#[derive(Default)]
struct Acks {
    waiting: Mutex<FxHashMap<u64, oneshot::Sender<AckResult>>>,
}

impl Acks {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<u64, oneshot::Sender<AckResult>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn len(&self) -> usize { self.lock().len() }
}

/// Removes an ack slot when the waiting reconcile goes away for any reason.
struct AckSlot<'a> {
    acks: &'a Acks,
    task_id: u64,
}

impl Drop for AckSlot<'_> {
    fn drop(&mut self) { self.acks.lock().remove(&self.task_id); }
}

/// Controller whose reconcile is a task/ack exchange with an adapter session.
pub struct RemoteController {
    registration: Registration,
    tx: mpsc::Sender<TaskEnvelope>,
    acks: Arc<Acks>,
    next_id: AtomicU64,
    timeout: Duration,
}

#[async_trait]
impl Controller for RemoteController {
    fn name(&self) -> &str { &self.registration.name }

    fn inputs(&self) -> Vec<Input> { self.registration.inputs.clone() }

    fn outputs(&self) -> Vec<String> { self.registration.outputs.clone() }

    fn concurrency(&self) -> usize { self.registration.concurrency }

    async fn reconcile(&self, ctx: &ReconcileContext, task: &Task) -> anyhow::Result<()> {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks.lock().insert(task_id, ack_tx);
        let _slot = AckSlot { acks: &self.acks, task_id };

        let exchange = async {
            self.tx
                .send(TaskEnvelope { task_id, task: task.clone() })
                .await
                .map_err(|_| anyhow!("adapter session for {} is closed", self.registration.name))?;
            ack_rx.await.map_err(|_| anyhow!("adapter session dropped task {task_id}"))
        };
        let ack = tokio::select! {
            _ = ctx.cancel_token().cancelled() => bail!("cancelled while waiting for task {task_id}"),
            res = tokio::time::timeout(self.timeout, exchange) => res,
        };
        match ack {
            Err(_) => bail!("task {task_id} not acknowledged within {:?}", self.timeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Err(msg))) => bail!("remote reconcile of {} failed: {msg}", task.resource),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// Server-side end of a remote controller registration. Dropping or
/// closing it deregisters the controller; unacknowledged tasks fail.
pub struct AdapterSession {
    id: Uuid,
    name: String,
    tasks: Option<mpsc::Receiver<TaskEnvelope>>,
    acks: Arc<Acks>,
    state: Arc<ScopedState>,
    runtime: Runtime,
    closed: AtomicBool,
}

impl AdapterSession {
    pub(crate) fn open(runtime: &Runtime, registration: Registration) -> StateResult<Self> {
        registration.validate()?;
        let (tx, rx) = mpsc::channel(registration.concurrency.saturating_mul(2).max(1));
        let acks = Arc::new(Acks::default());
        let state = Arc::new(ScopedState::new(runtime.state(), &registration));
        let name = registration.name.clone();
        let remote = RemoteController {
            registration,
            tx,
            acks: Arc::clone(&acks),
            next_id: AtomicU64::new(0),
            timeout: runtime.config().task_timeout,
        };
        runtime.register_remote(Arc::new(remote))?;
        let id = Uuid::new_v4();
        info!(controller = %name, session = %id, "adapter: session opened");
        Ok(Self { id, name, tasks: Some(rx), acks, state, runtime: runtime.clone(), closed: AtomicBool::new(false) })
    }

    pub fn id(&self) -> Uuid { self.id }

    pub fn name(&self) -> &str { &self.name }

    /// Store access scoped to this controller.
    pub fn state(&self) -> Arc<ScopedState> { Arc::clone(&self.state) }

    /// Take the task stream, e.g. to pump it from a separate task.
    pub fn take_tasks(&mut self) -> Option<mpsc::Receiver<TaskEnvelope>> { self.tasks.take() }

    /// Next task for the remote side; `None` after the controller stops or
    /// the stream was taken.
    pub async fn next_task(&mut self) -> Option<TaskEnvelope> {
        match self.tasks.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Acknowledge a task. `Err(message)` marks it failed.
    pub fn complete(&self, task_id: u64, outcome: AckResult) -> StateResult<()> {
        let slot = self.acks.lock().remove(&task_id);
        match slot {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(controller = %self.name, task_id, "adapter: ack arrived after the task gave up");
                }
                Ok(())
            }
            None => Err(StateError::NotFound(format!("task {task_id} is not awaiting completion"))),
        }
    }

    pub fn in_flight(&self) -> usize { self.acks.len() }

    /// Deregister the controller and fail whatever is still in flight.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.acks.lock().drain().count();
        if dropped > 0 {
            warn!(controller = %self.name, dropped, "adapter: session closed with tasks in flight");
        }
        if let Err(e) = self.runtime.deregister(&self.name).await {
            debug!(controller = %self.name, error = %e, "adapter: deregister on close");
        }
        info!(controller = %self.name, session = %self.id, "adapter: session closed");
    }
}

impl Drop for AdapterSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.acks.lock().clear();
        let runtime = self.runtime.clone();
        let name = self.name.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = runtime.deregister(&name).await;
            });
        }
    }
}
