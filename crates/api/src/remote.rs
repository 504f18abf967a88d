//! Hosting a `Controller` implementation in a process other than the
//! daemon. The daemon sends tasks over an adapter session; this side runs
//! the reconcile against a scoped socket client and acknowledges each one.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::FutureExt;
use recon_core::prelude::*;
use recon_runtime::{Controller, ReconcileContext, Registration, RuntimeConfig, ScopedState, TaskEnvelope};
use recon_store::State;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;

/// Run `controller` against the daemon listening on `path` until `token`
/// is cancelled (returns `Ok`) or the daemon ends the session (returns the
/// reason). The caller decides whether to reconnect.
pub async fn run_remote_controller(
    path: impl AsRef<Path>,
    controller: Arc<dyn Controller>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let registration = Registration::of(controller.as_ref());
    registration.validate()?;
    let client = Arc::new(Client::connect(path).await.with_context(|| format!("connecting to {}", path.display()))?);
    let mut tasks = client
        .register_controller(registration.clone())
        .await
        .with_context(|| format!("registering controller {}", registration.name))?;
    let scoped = Arc::new(ScopedState::new(Arc::clone(&client) as Arc<dyn State>, &registration));
    let conflict_retries = RuntimeConfig::from_env().conflict_retries;
    info!(controller = %registration.name, session = %tasks.session(), path = %path.display(), "remote: controller attached");

    let mut running = JoinSet::new();
    let result = loop {
        let next = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            Some(_) = running.join_next(), if !running.is_empty() => continue,
            next = tasks.next() => next,
        };
        match next {
            Some(Ok(env)) => {
                let ctx = ReconcileContext::new(Arc::clone(&scoped), token.child_token());
                running.spawn(handle_task(Arc::clone(&controller), Arc::clone(&client), ctx, env, conflict_retries));
            }
            Some(Err(e)) => break Err(anyhow::Error::new(e).context("adapter session failed")),
            None => break Err(anyhow!("daemon ended the adapter session for {}", registration.name)),
        }
    };
    running.shutdown().await;
    info!(controller = %registration.name, "remote: controller detached");
    result
}

async fn handle_task(
    controller: Arc<dyn Controller>,
    client: Arc<Client>,
    ctx: ReconcileContext,
    env: TaskEnvelope,
    conflict_retries: u32,
) {
    let TaskEnvelope { task_id, task } = env;
    let mut conflicts = 0u32;
    let outcome = loop {
        match AssertUnwindSafe(controller.reconcile(&ctx, &task)).catch_unwind().await {
            Ok(Ok(())) => break Ok(()),
            Ok(Err(e)) if e.chain().next().is_some_and(StateError::chain_is_conflict) && conflicts < conflict_retries => {
                conflicts += 1;
                debug!(controller = %task.controller, resource = %task.resource, conflicts, "remote: conflict, reconciling again");
            }
            Ok(Err(e)) => break Err(format!("{e:#}")),
            Err(_) => break Err(format!("reconcile of {} panicked", task.resource)),
        }
    };
    if let Err(msg) = &outcome {
        warn!(controller = %task.controller, resource = %task.resource, error = %msg, "remote: reconcile failed");
    }
    if let Err(e) = client.complete(task_id, outcome).await {
        debug!(task_id, error = %e, "remote: acknowledgement not delivered");
    }
}
