//! Recon controller runtime.
//!
//! A `Runtime` owns a registry of controllers. Each registered controller
//! gets one loop: a watch forwarder per declared input feeding a coalescing
//! work queue, and a dispatcher running reconciles up to the controller's
//! concurrency. Failures back off exponentially; identities that keep
//! failing are parked and reported through `ControllerStatus`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use recon_core::prelude::*;
use recon_store::State;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod adapter;
pub mod backoff;
pub mod controller;
mod dispatch;
pub mod queue;
pub mod status;

pub use adapter::{AdapterSession, RemoteController, ScopedState, TaskEnvelope};
pub use backoff::Backoff;
pub use controller::{Controller, Input, ReconcileContext, Registration, Task};
pub use status::{Condition, ControllerStatus, Health, LoopState};

use dispatch::LoopShared;

/// Extra time granted to a loop, beyond the grace period, to wind down.
const LOOP_EXIT_MARGIN: Duration = Duration::from_secs(1);

/// Runtime tunables, read from `RECON_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures after which an identity is parked.
    pub max_retries: u32,
    /// Immediate re-runs on `Conflict` before it counts as a failure.
    pub conflict_retries: u32,
    /// How long shutdown waits for in-flight reconciles.
    pub grace_period: Duration,
    /// Acknowledgement deadline for remote tasks.
    pub task_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(30_000),
            max_retries: 10,
            conflict_retries: 5,
            grace_period: Duration::from_secs(10),
            task_timeout: Duration::from_secs(60),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> { std::env::var(key).ok().and_then(|s| s.parse().ok()) }

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            backoff_base: env_u64("RECON_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_u64("RECON_BACKOFF_MAX_MS").map(Duration::from_millis).unwrap_or(d.backoff_max),
            max_retries: std::env::var("RECON_MAX_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_retries),
            conflict_retries: std::env::var("RECON_CONFLICT_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.conflict_retries),
            grace_period: env_u64("RECON_GRACE_SECS").map(Duration::from_secs).unwrap_or(d.grace_period),
            task_timeout: env_u64("RECON_TASK_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.task_timeout),
        }
    }
}

struct LoopEntry {
    shared: Arc<LoopShared>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    started: bool,
    stopped: bool,
    loops: BTreeMap<String, LoopEntry>,
}

struct Inner {
    state: Arc<dyn State>,
    config: RuntimeConfig,
    root: CancellationToken,
    registry: Mutex<Registry>,
}

/// Cheap-to-clone handle on one controller runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(state: Arc<dyn State>, config: RuntimeConfig) -> Self {
        let inner = Inner { state, config, root: CancellationToken::new(), registry: Mutex::new(Registry::default()) };
        Self { inner: Arc::new(inner) }
    }

    pub fn state(&self) -> Arc<dyn State> { Arc::clone(&self.inner.state) }

    pub fn config(&self) -> &RuntimeConfig { &self.inner.config }

    fn registry(&self) -> MutexGuard<'_, Registry> { self.inner.registry.lock().unwrap_or_else(|e| e.into_inner()) }

    fn spawn_loop(&self, shared: &Arc<LoopShared>, token: &CancellationToken) -> JoinHandle<()> {
        tokio::spawn(dispatch::run_loop(Arc::clone(shared), self.state(), self.inner.config.clone(), token.clone()))
    }

    fn register_inner(&self, controller: Arc<dyn Controller>, remote: bool) -> StateResult<()> {
        let registration = Registration::of(controller.as_ref());
        registration.validate()?;
        let mut reg = self.registry();
        if reg.stopped {
            return Err(StateError::Cancelled("runtime is shut down".into()));
        }
        if reg.loops.contains_key(&registration.name) {
            return Err(StateError::AlreadyExists(format!("controller {}", registration.name)));
        }
        let scoped = Arc::new(ScopedState::new(self.state(), &registration));
        let name = registration.name.clone();
        let shared = Arc::new(LoopShared::new(controller, registration, scoped, remote));
        let token = self.inner.root.child_token();
        let task = reg.started.then(|| self.spawn_loop(&shared, &token));
        info!(controller = %name, remote, running = task.is_some(), "runtime: controller registered");
        metrics::counter!("runtime_registrations_total", 1u64);
        reg.loops.insert(name, LoopEntry { shared, token, task });
        Ok(())
    }

    /// Add a controller. If the runtime is already started its loop starts
    /// immediately and bootstraps from current state.
    pub fn register(&self, controller: Arc<dyn Controller>) -> StateResult<()> { self.register_inner(controller, false) }

    pub(crate) fn register_remote(&self, controller: Arc<RemoteController>) -> StateResult<()> {
        self.register_inner(controller, true)
    }

    /// Register a controller hosted in another process.
    pub fn attach(&self, registration: Registration) -> StateResult<AdapterSession> {
        AdapterSession::open(self, registration)
    }

    /// Stop and remove a controller, waiting up to the grace period for its
    /// in-flight reconciles.
    pub async fn deregister(&self, name: &str) -> StateResult<()> {
        let entry = self.registry().loops.remove(name).ok_or_else(|| StateError::NotFound(format!("controller {name}")))?;
        entry.token.cancel();
        if let Some(task) = entry.task {
            self.join_loops(vec![task]).await;
        }
        entry.shared.mark_stopped();
        info!(controller = %name, "runtime: controller deregistered");
        Ok(())
    }

    /// Start every registered loop. Idempotent; a no-op after shutdown.
    pub fn start(&self) {
        let mut reg = self.registry();
        if reg.started || reg.stopped {
            return;
        }
        reg.started = true;
        for entry in reg.loops.values_mut() {
            entry.task = Some(self.spawn_loop(&entry.shared, &entry.token));
        }
        info!(controllers = reg.loops.len(), "runtime: started");
    }

    pub fn is_running(&self) -> bool {
        let reg = self.registry();
        reg.started && !reg.stopped
    }

    /// Cancel every loop and wait for them. In-flight reconciles see their
    /// cancellation token; those still running after the grace period are
    /// aborted and their results discarded.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut reg = self.registry();
            if reg.stopped {
                return;
            }
            reg.stopped = true;
            reg.loops.values_mut().filter_map(|e| e.task.take()).collect()
        };
        info!(loops = tasks.len(), grace_ms = %self.inner.config.grace_period.as_millis(), "runtime: shutting down");
        self.inner.root.cancel();
        self.join_loops(tasks).await;
        for entry in self.registry().loops.values() {
            entry.shared.mark_stopped();
        }
        info!("runtime: stopped");
    }

    async fn join_loops(&self, mut tasks: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + self.inner.config.grace_period + LOOP_EXIT_MARGIN;
        for task in tasks.iter_mut() {
            let _ = tokio::time::timeout_at(deadline, task).await;
        }
        for task in &tasks {
            if !task.is_finished() {
                warn!("runtime: loop did not exit in time, aborting");
                task.abort();
            }
        }
    }

    /// Status of every registered controller, ordered by name.
    pub fn controllers(&self) -> Vec<ControllerStatus> {
        self.registry().loops.values().map(|e| e.shared.status()).collect()
    }

    pub fn status(&self, name: &str) -> Option<ControllerStatus> {
        self.registry().loops.get(name).map(|e| e.shared.status())
    }
}
