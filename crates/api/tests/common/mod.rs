#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recon_api::Server;
use recon_core::prelude::*;
use recon_runtime::{Controller, Input, ReconcileContext, Runtime, RuntimeConfig, Task};
use recon_store::{NamespacedState, State};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(40),
        max_retries: 3,
        conflict_retries: 5,
        grace_period: Duration::from_secs(1),
        task_timeout: Duration::from_secs(5),
    }
}

/// A daemon on a socket in a private temp dir.
pub struct Daemon {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
    pub store: Arc<dyn State>,
    pub runtime: Runtime,
    pub token: CancellationToken,
    pub server: JoinHandle<anyhow::Result<()>>,
}

impl Daemon {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.sock");
        let store: Arc<dyn State> = Arc::new(NamespacedState::default());
        let runtime = Runtime::new(Arc::clone(&store), fast_config());
        runtime.start();
        let server = Server::new(runtime.clone(), &path);
        let listener = server.bind().unwrap();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        let server = tokio::spawn(async move { server.serve(listener, serve_token).await });
        Self { _dir: dir, path, store, runtime, token, server }
    }

    pub async fn stop(self) {
        self.token.cancel();
        self.server.await.unwrap().unwrap();
        self.runtime.shutdown().await;
    }
}

pub fn widget(id: &str, count: i64) -> Resource {
    Resource::new("default", "Widget", id, serde_json::json!({ "count": count }))
}

pub fn widget_ref(id: &str) -> ResourceRef { ResourceRef::new("default", "Widget", id) }

pub fn status_ref(id: &str) -> ResourceRef { ResourceRef::new("default", "WidgetStatus", id) }

pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Widget -> WidgetStatus, writing only when the status differs.
#[derive(Default)]
pub struct WidgetStatusController {
    pub runs: AtomicUsize,
}

impl WidgetStatusController {
    pub fn runs(&self) -> usize { self.runs.load(Ordering::SeqCst) }
}

#[async_trait]
impl Controller for WidgetStatusController {
    fn name(&self) -> &str { "widget-status" }

    fn inputs(&self) -> Vec<Input> { vec![Input::new("default", "Widget")] }

    fn outputs(&self) -> Vec<String> { vec!["WidgetStatus".into()] }

    async fn reconcile(&self, ctx: &ReconcileContext, task: &Task) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let state = ctx.state();
        let id = &task.resource.id;
        let widget = match state.get(&task.resource).await {
            Ok(w) => w,
            Err(e) if e.is_not_found() => {
                if let Ok(cur) = state.get(&status_ref(id)).await {
                    state.destroy(&status_ref(id), cur.version()).await?;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let desired = serde_json::json!({ "ready": true, "count": widget.spec["count"] });
        match state.get(&status_ref(id)).await {
            Ok(cur) if cur.spec == desired => {}
            Ok(cur) => {
                let mut next = cur.clone();
                next.spec = desired;
                state.update(next, cur.version()).await?;
            }
            Err(e) if e.is_not_found() => {
                state.create(Resource::new("default", "WidgetStatus", id.as_str(), desired)).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
