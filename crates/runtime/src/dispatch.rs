//! One reconciliation loop: input watch forwarders feed the work queue, the
//! dispatcher drains it under a concurrency semaphore.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use recon_core::now_ms;
use recon_core::prelude::*;
use recon_store::State;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::ScopedState;
use crate::backoff::Backoff;
use crate::controller::{Controller, Input, ReconcileContext, Registration, Task};
use crate::queue::WorkQueue;
use crate::status::{Condition, ControllerStatus};
use crate::RuntimeConfig;

/// State shared between a loop, its forwarders and introspection.
pub(crate) struct LoopShared {
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) registration: Registration,
    pub(crate) queue: WorkQueue,
    pub(crate) scoped: Arc<ScopedState>,
    status: ArcSwap<ControllerStatus>,
    stopped: AtomicBool,
}

impl LoopShared {
    pub(crate) fn new(controller: Arc<dyn Controller>, registration: Registration, scoped: Arc<ScopedState>, remote: bool) -> Self {
        let status = ControllerStatus {
            name: registration.name.clone(),
            inputs: registration.inputs.clone(),
            outputs: registration.outputs.clone(),
            concurrency: registration.concurrency,
            remote,
            ..Default::default()
        };
        Self {
            controller,
            registration,
            queue: WorkQueue::new(),
            scoped,
            status: ArcSwap::from_pointee(status),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str { &self.registration.name }

    pub(crate) fn status(&self) -> ControllerStatus {
        let published = ControllerStatus::clone(&self.status.load());
        published.with_queue(self.queue.stats(), self.stopped.load(Ordering::SeqCst))
    }

    /// Only the dispatcher task writes, so load-modify-store does not race.
    fn publish(&self, f: impl FnOnce(&mut ControllerStatus)) {
        let mut next = ControllerStatus::clone(&self.status.load());
        f(&mut next);
        self.status.store(Arc::new(next));
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.queue.close();
    }

    fn gauge_queue(&self) {
        metrics::gauge!("runtime_queue_depth", self.queue.len() as f64, "controller" => self.name().to_string());
    }
}

enum Outcome {
    Ok,
    Failed(String),
    Panicked(String),
}

struct Finished {
    task: Task,
    outcome: Outcome,
    elapsed: Duration,
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

fn is_conflict(err: &anyhow::Error) -> bool { err.chain().next().is_some_and(StateError::chain_is_conflict) }

/// Run one reconcile, retrying `Conflict` immediately a bounded number of
/// times. Panics are caught here so the identity is never lost.
async fn execute(
    shared: Arc<LoopShared>,
    task: Task,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
    conflict_retries: u32,
) -> Finished {
    let ctx = ReconcileContext::new(Arc::clone(&shared.scoped), cancel);
    let t0 = Instant::now();
    let mut conflicts = 0u32;
    let outcome = loop {
        let res = AssertUnwindSafe(shared.controller.reconcile(&ctx, &task)).catch_unwind().await;
        match res {
            Ok(Ok(())) => break Outcome::Ok,
            Ok(Err(e)) if is_conflict(&e) && conflicts < conflict_retries && !ctx.is_cancelled() => {
                conflicts += 1;
                metrics::counter!("runtime_reconcile_conflicts_total", 1u64, "controller" => shared.name().to_string());
                debug!(controller = %shared.name(), resource = %task.resource, conflicts, "runtime: conflict, reconciling again");
            }
            Ok(Err(e)) => break Outcome::Failed(format!("{e:#}")),
            Err(p) => break Outcome::Panicked(panic_message(p.as_ref())),
        }
    };
    Finished { task, outcome, elapsed: t0.elapsed() }
}

async fn acquire_next(sem: &Arc<Semaphore>, queue: &WorkQueue) -> Option<(OwnedSemaphorePermit, ResourceRef, Version)> {
    let permit = Arc::clone(sem).acquire_owned().await.ok()?;
    let (r, v) = queue.next().await?;
    Some((permit, r, v))
}

/// Watch one input and push every change into the queue. The watch is
/// reopened with bootstrap after any failure.
async fn forward(state: Arc<dyn State>, input: Input, shared: Arc<LoopShared>, config: RuntimeConfig, token: CancellationToken) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
    loop {
        let opened = tokio::select! {
            _ = token.cancelled() => return,
            res = state.watch(&input.namespace, &input.kind, WatchOptions::bootstrap()) => res,
        };
        match opened {
            Ok(mut stream) => {
                debug!(controller = %shared.name(), input = %input, "runtime: watch open");
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => return,
                        ev = stream.next() => ev,
                    };
                    match next {
                        Some(Ok(ev)) => {
                            backoff.reset();
                            let r = ev.resource.reference();
                            let queued = match ev.kind {
                                EventKind::Created | EventKind::Destroyed => shared.queue.renew(r, ev.version()),
                                EventKind::Updated | EventKind::Bootstrap => shared.queue.push(r, ev.version()),
                            };
                            if queued {
                                shared.gauge_queue();
                            }
                        }
                        Some(Err(e)) => {
                            warn!(controller = %shared.name(), input = %input, error = %e, "runtime: watch failed, restarting");
                            break;
                        }
                        None => {
                            debug!(controller = %shared.name(), input = %input, "runtime: watch ended, restarting");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(controller = %shared.name(), input = %input, error = %e, "runtime: watch open failed"),
        }
        metrics::counter!("runtime_watch_restarts_total", 1u64, "controller" => shared.name().to_string());
        let delay = backoff.next_delay();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn finish(shared: &Arc<LoopShared>, joined: Result<Finished, JoinError>, config: &RuntimeConfig, token: &CancellationToken) {
    let f = match joined {
        Ok(f) => f,
        Err(e) if e.is_cancelled() => return,
        Err(e) => {
            error!(controller = %shared.name(), error = %e, "runtime: reconcile task failed to join");
            return;
        }
    };
    let name = shared.name().to_string();
    let r = f.task.resource.clone();
    metrics::histogram!("runtime_reconcile_seconds", f.elapsed.as_secs_f64(), "controller" => name.clone());
    let (message, panicked) = match f.outcome {
        Outcome::Ok => {
            metrics::counter!("runtime_reconciles_total", 1u64, "controller" => name.clone());
            debug!(controller = %name, resource = %r, version = f.task.version, took_ms = %f.elapsed.as_millis(), "runtime: reconciled");
            shared.queue.forget(&r);
            shared.publish(|s| {
                s.reconciles += 1;
                s.clear_condition(&r);
            });
            shared.queue.done(&r);
            shared.gauge_queue();
            return;
        }
        Outcome::Failed(m) => (m, false),
        Outcome::Panicked(m) => (m, true),
    };

    metrics::counter!("runtime_reconcile_failures_total", 1u64, "controller" => name.clone());
    if panicked {
        metrics::counter!("runtime_reconcile_panics_total", 1u64, "controller" => name.clone());
        error!(controller = %name, resource = %r, panic = %message, "runtime: reconcile panicked");
    }
    let failures = shared.queue.record_failure(&r);
    let mut condition = None;
    if failures > config.max_retries {
        shared.queue.park(&r, f.task.version);
        warn!(controller = %name, resource = %r, failures, error = %message, "runtime: retries exhausted, parking until the input changes");
        condition = Some(Condition { resource: r.clone(), message: message.clone(), failures, since_ms: now_ms() });
    } else {
        let delay = Backoff::new(config.backoff_base, config.backoff_max).delay(failures - 1);
        let gen = shared.queue.schedule_retry(&r, f.task.version);
        warn!(controller = %name, resource = %r, failures, delay_ms = %delay.as_millis(), error = %message, "runtime: reconcile failed, backing off");
        let retry_shared = Arc::clone(shared);
        let retry_ref = r.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    retry_shared.queue.retry(&retry_ref, gen);
                }
            }
        });
    }
    shared.publish(|s| {
        s.failures += 1;
        if panicked {
            s.panics += 1;
        }
        s.last_error = Some(message);
        if let Some(c) = condition {
            s.set_condition(c);
        }
    });
    shared.queue.done(&r);
    shared.gauge_queue();
}

/// Body of a controller loop. Returns once `token` is cancelled and
/// in-flight reconciles finished or the grace period ran out.
pub(crate) async fn run_loop(shared: Arc<LoopShared>, state: Arc<dyn State>, config: RuntimeConfig, token: CancellationToken) {
    let name = shared.name().to_string();
    info!(controller = %name, inputs = shared.registration.inputs.len(), concurrency = shared.registration.concurrency, "runtime: loop started");

    let mut forwarders = JoinSet::new();
    for input in shared.registration.inputs.iter().cloned() {
        forwarders.spawn(forward(Arc::clone(&state), input, Arc::clone(&shared), config.clone(), token.clone()));
    }

    let sem = Arc::new(Semaphore::new(shared.registration.concurrency));
    let mut inflight: JoinSet<Finished> = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(joined) = inflight.join_next() => finish(&shared, joined, &config, &token),
            next = acquire_next(&sem, &shared.queue) => {
                let Some((permit, r, version)) = next else { break };
                if shared.status().conditions.iter().any(|c| c.resource == r) {
                    // Unparked by a newer change; the condition no longer holds.
                    shared.publish(|s| s.clear_condition(&r));
                }
                let attempt = shared.queue.failures(&r);
                let task = Task { controller: name.clone(), resource: r, version, attempt };
                debug!(controller = %name, resource = %task.resource, version, attempt, "runtime: dispatch");
                inflight.spawn(execute(Arc::clone(&shared), task, permit, token.child_token(), config.conflict_retries));
            }
        }
    }

    let grace = config.grace_period;
    let drain = async {
        while let Some(joined) = inflight.join_next().await {
            finish(&shared, joined, &config, &token);
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(controller = %name, grace_ms = %grace.as_millis(), "runtime: grace period elapsed, aborting in-flight reconciles");
        inflight.shutdown().await;
    }
    forwarders.shutdown().await;
    shared.mark_stopped();
    info!(controller = %name, "runtime: loop stopped");
}
