#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::*;
use futures::StreamExt;
use recon_api::Client;
use recon_core::prelude::*;
use recon_runtime::{Input, Registration};
use recon_store::State;

async fn next_event(stream: &mut recon_store::WatchStream) -> StateResult<Event> {
    tokio::time::timeout(Duration::from_secs(5), stream.next()).await.expect("timed out waiting for event").expect("stream ended")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_operations_cross_the_socket_unchanged() {
    let daemon = Daemon::start().await;
    let client = Client::connect(&daemon.path).await.unwrap();

    let a = client.create(widget("a", 1).with_label("app", "web")).await.unwrap();
    assert_eq!(a.version(), 1);
    let a2 = {
        let mut next = a.clone();
        next.spec = serde_json::json!({ "count": 2 });
        client.update(next, 1).await.unwrap()
    };
    assert_eq!(a2.version(), 2);
    let err = client.update(a.clone(), 1).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");
    assert_eq!(client.get(&widget_ref("a")).await.unwrap().version(), 2);
    assert!(client.create(widget("a", 9)).await.unwrap_err().is_already_exists());
    assert!(client.get(&widget_ref("nope")).await.unwrap_err().is_not_found());

    client.create(widget("b", 1)).await.unwrap();
    let web = client.list("default", "Widget", &"app=web".parse().unwrap()).await.unwrap();
    assert_eq!(web.iter().map(|r| r.metadata.id.as_str()).collect::<Vec<_>>(), vec!["a"]);

    // Finalizers hold up the destroy until removed.
    let fin = vec!["cleanup".to_string()];
    let held = client.add_finalizers(&widget_ref("b"), &fin).await.unwrap();
    let outcome = client.destroy(&widget_ref("b"), held.version()).await.unwrap();
    assert!(!outcome.is_destroyed());
    assert!(outcome.resource().metadata.tearing_down());
    client.remove_finalizers(&widget_ref("b"), &fin).await.unwrap();
    assert!(daemon.store.get(&widget_ref("b")).await.unwrap_err().is_not_found());

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watches_stream_over_the_socket() {
    let daemon = Daemon::start().await;
    let client = Client::connect(&daemon.path).await.unwrap();
    client.create(widget("a", 1)).await.unwrap();

    let mut stream = client.watch("default", "Widget", WatchOptions::bootstrap()).await.unwrap();
    let ev = next_event(&mut stream).await.unwrap();
    assert_eq!((ev.kind, ev.id(), ev.version()), (EventKind::Bootstrap, "a", 1));

    // Writes made directly on the daemon's store show up remotely.
    let cur = daemon.store.get(&widget_ref("a")).await.unwrap();
    daemon.store.update(cur.clone(), cur.version()).await.unwrap();
    daemon.store.create(widget("b", 1)).await.unwrap();
    let ev = next_event(&mut stream).await.unwrap();
    assert_eq!((ev.kind, ev.version()), (EventKind::Updated, 2));
    let ev = next_event(&mut stream).await.unwrap();
    assert_eq!((ev.kind, ev.id()), (EventKind::Created, "b"));

    // Resume points ahead of the store are rejected when the watch opens.
    let err = client.watch("default", "Widget", WatchOptions::single("a").from_version(99)).await.err().unwrap();
    assert!(matches!(err, StateError::InvalidArgument(_)), "{err}");

    // Several streams share one connection.
    let mut only_b = client.watch("default", "Widget", WatchOptions::single("b")).await.unwrap();
    drop(stream);
    let cur = daemon.store.get(&widget_ref("b")).await.unwrap();
    daemon.store.update(cur.clone(), cur.version()).await.unwrap();
    let ev = next_event(&mut only_b).await.unwrap();
    assert_eq!((ev.id(), ev.version()), ("b", 2));
    assert!(client.get(&widget_ref("a")).await.is_ok(), "connection survives a dropped stream");

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adapter_connections_are_scoped_to_their_controller() {
    let daemon = Daemon::start().await;
    daemon.store.create(Resource::new("default", "Gadget", "g", serde_json::json!({}))).await.unwrap();
    let client = Client::connect(&daemon.path).await.unwrap();
    let registration = Registration {
        name: "widget-status".into(),
        inputs: vec![Input::new("default", "Widget")],
        outputs: vec!["WidgetStatus".into()],
        concurrency: 1,
    };
    let tasks = client.register_controller(registration.clone()).await.unwrap();
    assert!(!tasks.session().is_empty());

    let err = client.get(&ResourceRef::new("default", "Gadget", "g")).await.unwrap_err();
    assert!(matches!(err, StateError::Unauthorized(_)), "{err}");
    let err = client.create(widget("a", 1)).await.unwrap_err();
    assert!(matches!(err, StateError::Unauthorized(_)), "{err}");
    let status = client.create(Resource::new("default", "WidgetStatus", "a", serde_json::json!({}))).await.unwrap();
    assert_eq!(status.metadata.owner, "widget-status");

    assert!(client.complete(42, Ok(())).await.unwrap_err().is_not_found());
    let err = client.register_controller(registration).await.err().unwrap();
    assert!(matches!(err, StateError::InvalidArgument(_)), "{err}");

    // Another connection sees the remote controller in the listing.
    let observer = Client::connect(&daemon.path).await.unwrap();
    let listed = observer.controllers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "widget-status");
    assert!(listed[0].remote);

    drop(tasks);
    drop(client);
    assert!(wait_until(Duration::from_secs(5), || async { observer.controllers().await.unwrap().is_empty() }).await);
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_the_server_ends_streams_and_removes_the_socket() {
    let daemon = Daemon::start().await;
    let client = Client::connect(&daemon.path).await.unwrap();
    let mut stream = client.watch("default", "Widget", WatchOptions::live()).await.unwrap();
    let path = daemon.path.clone();
    assert!(path.exists());

    daemon.token.cancel();
    daemon.server.await.unwrap().unwrap();
    assert!(!path.exists());
    let last = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.unwrap();
    assert!(matches!(last, None | Some(Err(_))));
    assert!(client.get(&widget_ref("a")).await.is_err());
    daemon.runtime.shutdown().await;
}

fn server_at(path: &std::path::Path) -> recon_api::Server {
    let runtime = recon_runtime::Runtime::new(std::sync::Arc::new(recon_store::NamespacedState::default()), fast_config());
    recon_api::Server::new(runtime, path)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binding_replaces_a_stale_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recon.sock");
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());
    let _listener = server_at(&path).bind().unwrap();
    assert!(Client::connect(&path).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binding_over_a_live_daemon_fails() {
    let daemon = Daemon::start().await;
    let err = server_at(&daemon.path).bind().unwrap_err();
    assert!(format!("{err:#}").contains("address in use"), "{err:#}");

    // The running daemon keeps its socket.
    let client = Client::connect(&daemon.path).await.unwrap();
    client.create(widget("a", 1)).await.unwrap();
    assert_eq!(client.get(&widget_ref("a")).await.unwrap().version(), 1);
    daemon.stop().await;
}

#[tokio::test]
async fn binding_leaves_other_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recon.sock");
    std::fs::write(&path, b"not a socket").unwrap();
    let err = server_at(&path).bind().unwrap_err();
    assert!(format!("{err:#}").contains("not a socket"), "{err:#}");
    assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
}
