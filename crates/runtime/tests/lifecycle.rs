#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::*;
use recon_core::prelude::*;
use recon_runtime::{Controller, Input, LoopState, ReconcileContext, Runtime, RuntimeConfig, Task};

/// Parks in reconcile until cancelled (or forever, if `stubborn`).
struct Sleeper {
    name: &'static str,
    stubborn: bool,
    started: AtomicUsize,
    saw_cancel: AtomicBool,
}

impl Sleeper {
    fn new(name: &'static str, stubborn: bool) -> Self {
        Self { name, stubborn, started: AtomicUsize::new(0), saw_cancel: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Controller for Sleeper {
    fn name(&self) -> &str { self.name }

    fn inputs(&self) -> Vec<Input> { vec![Input::new("default", "Widget")] }

    fn outputs(&self) -> Vec<String> { Vec::new() }

    async fn reconcile(&self, ctx: &ReconcileContext, _task: &Task) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.stubborn {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }
        ctx.cancel_token().cancelled().await;
        self.saw_cancel.store(true, Ordering::SeqCst);
        anyhow::bail!("cancelled")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_in_flight_reconciles() {
    let store = new_store();
    let rt = Runtime::new(Arc::clone(&store), fast_config());
    let ctl = Arc::new(Sleeper::new("sleeper", false));
    rt.register(ctl.clone()).unwrap();
    rt.start();
    store.create(widget("a", 0)).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { ctl.started.load(Ordering::SeqCst) == 1 }).await);

    let t0 = Instant::now();
    rt.shutdown().await;
    assert!(t0.elapsed() < Duration::from_secs(2), "cooperative reconcile should finish before the grace period");
    assert!(ctl.saw_cancel.load(Ordering::SeqCst));
    let st = rt.status("sleeper").unwrap();
    assert_eq!(st.state, LoopState::Stopped);
    assert!(!rt.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_aborts_after_the_grace_period() {
    let store = new_store();
    let config = RuntimeConfig { grace_period: Duration::from_millis(200), ..fast_config() };
    let rt = Runtime::new(Arc::clone(&store), config);
    let ctl = Arc::new(Sleeper::new("stubborn", true));
    rt.register(ctl.clone()).unwrap();
    rt.start();
    store.create(widget("a", 0)).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { ctl.started.load(Ordering::SeqCst) == 1 }).await);

    let t0 = Instant::now();
    rt.shutdown().await;
    let took = t0.elapsed();
    assert!(took >= Duration::from_millis(200), "{took:?}");
    assert!(took < Duration::from_secs(3), "{took:?}");
    assert_eq!(rt.status("stubborn").unwrap().state, LoopState::Stopped);
    assert_eq!(rt.status("stubborn").unwrap().reconciles, 0);
}

#[tokio::test]
async fn registration_is_validated_once() {
    let rt = Runtime::new(new_store(), fast_config());
    rt.register(Arc::new(WidgetStatusController::default())).unwrap();
    let dup = rt.register(Arc::new(WidgetStatusController::default())).unwrap_err();
    assert!(dup.is_already_exists());

    struct NoInputs;
    #[async_trait]
    impl Controller for NoInputs {
        fn name(&self) -> &str { "no-inputs" }
        fn inputs(&self) -> Vec<Input> { Vec::new() }
        fn outputs(&self) -> Vec<String> { Vec::new() }
        async fn reconcile(&self, _: &ReconcileContext, _: &Task) -> anyhow::Result<()> { Ok(()) }
    }
    let err = rt.register(Arc::new(NoInputs)).unwrap_err();
    assert!(matches!(err, StateError::InvalidArgument(_)));

    let names: Vec<String> = rt.controllers().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["widget-status".to_string()]);
    assert_eq!(rt.status("widget-status").unwrap().state, LoopState::Idle);
    assert!(rt.deregister("nope").await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registering_on_a_running_runtime_bootstraps_existing_resources() {
    let store = new_store();
    store.create(widget("a", 3)).await.unwrap();
    let rt = Runtime::new(Arc::clone(&store), fast_config());
    rt.start();
    assert!(rt.is_running());
    let ctl = Arc::new(WidgetStatusController::default());
    rt.register(ctl.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { store.get(&status_ref("a")).await.is_ok() }).await);
    assert_eq!(*ctl.seen.lock().unwrap(), vec![("a".to_string(), 1)]);

    rt.deregister("widget-status").await.unwrap();
    assert!(rt.status("widget-status").is_none());
    store.create(widget("b", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctl.runs(), 1, "deregistered controller must not run");
    rt.shutdown().await;
    assert!(rt.register(Arc::new(WidgetStatusController::default())).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_inputs_are_reconciled_too() {
    let store = new_store();
    let rt = Runtime::new(Arc::clone(&store), fast_config());
    rt.register(Arc::new(WidgetStatusController::default())).unwrap();
    rt.start();
    let created = store.create(widget("a", 1)).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { store.get(&status_ref("a")).await.is_ok() }).await);
    store.destroy(&widget_ref("a"), created.version()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || async { store.get(&status_ref("a")).await.is_err() }).await);
    rt.shutdown().await;
}
