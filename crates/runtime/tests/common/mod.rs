#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recon_core::prelude::*;
use recon_runtime::{Controller, Input, ReconcileContext, RuntimeConfig, Task};
use recon_store::State;

pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(40),
        max_retries: 3,
        conflict_retries: 5,
        grace_period: Duration::from_secs(2),
        task_timeout: Duration::from_secs(5),
    }
}

pub fn widget(id: &str, count: i64) -> Resource {
    Resource::new("default", "Widget", id, serde_json::json!({ "count": count }))
}

pub fn widget_ref(id: &str) -> ResourceRef { ResourceRef::new("default", "Widget", id) }

pub fn status_ref(id: &str) -> ResourceRef { ResourceRef::new("default", "WidgetStatus", id) }

pub async fn bump(st: &dyn State, id: &str, count: i64) -> Resource {
    let cur = st.get(&widget_ref(id)).await.unwrap();
    let mut next = cur.clone();
    next.spec = serde_json::json!({ "count": count });
    st.update(next, cur.version()).await.unwrap()
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
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

/// Converge `WidgetStatus/<id>` to `{ready: true, count: <widget count>}`,
/// writing only when something differs.
pub async fn converge_status(state: &dyn State, task: &Task) -> anyhow::Result<()> {
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
        Ok(cur) if cur.spec == desired => Ok(()),
        Ok(cur) => {
            let mut next = cur.clone();
            next.spec = desired;
            state.update(next, cur.version()).await?;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            state.create(Resource::new("default", "WidgetStatus", id.as_str(), desired)).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The canonical Widget -> WidgetStatus controller.
#[derive(Default)]
pub struct WidgetStatusController {
    pub runs: AtomicUsize,
    pub seen: std::sync::Mutex<Vec<(String, Version)>>,
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
        self.seen.lock().unwrap().push((task.resource.id.clone(), task.version));
        converge_status(ctx.state(), task).await
    }
}

pub fn new_store() -> Arc<dyn State> { Arc::new(recon_store::NamespacedState::default()) }
