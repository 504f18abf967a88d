#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt;
use recon_core::prelude::*;
use recon_store::{NamespacedState, State, StateExt};

fn widget_ref(id: &str) -> ResourceRef { ResourceRef::new("default", "Widget", id) }

fn fins(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

#[tokio::test]
async fn destroy_without_finalizers_removes_immediately() {
    let st = NamespacedState::default();
    let created = st.create(Resource::new("default", "Widget", "a", serde_json::json!({}))).await.unwrap();
    let out = st.destroy(&widget_ref("a"), created.version()).await.unwrap();
    assert!(out.is_destroyed());
    assert_eq!(out.resource().version(), 2);
    assert!(st.get(&widget_ref("a")).await.unwrap_err().is_not_found());
    // Identity can be reused, starting over at version 1.
    let again = st.create(Resource::new("default", "Widget", "a", serde_json::json!({}))).await.unwrap();
    assert_eq!(again.version(), 1);
}

#[tokio::test]
async fn finalizers_hold_a_tombstone_until_released() {
    let st = NamespacedState::default();
    let r = widget_ref("a");
    st.create(Resource::new("default", "Widget", "a", serde_json::json!({})).with_finalizer("ctrl-a")).await.unwrap();
    let with_b = st.add_finalizers(&r, &fins(&["ctrl-b"])).await.unwrap();
    assert_eq!(with_b.metadata.finalizers.len(), 2);

    let mut w = st.watch("default", "Widget", WatchOptions::single("a")).await.unwrap();

    let out = st.destroy(&r, with_b.version()).await.unwrap();
    assert!(!out.is_destroyed());
    assert_eq!(out.resource().metadata.phase, Phase::TearingDown);

    // Still readable, but no longer writable except for finalizer removal.
    let tomb = st.get(&r).await.unwrap();
    assert!(tomb.metadata.tearing_down());
    assert!(st.update(tomb.clone(), tomb.version()).await.unwrap_err().is_conflict());
    assert!(st.add_finalizers(&r, &fins(&["ctrl-c"])).await.unwrap_err().is_conflict());
    // Destroying again at the current version is a no-op.
    let again = st.destroy(&r, tomb.version()).await.unwrap();
    assert_eq!(again.resource().version(), tomb.version());

    st.remove_finalizers(&r, &fins(&["ctrl-a"])).await.unwrap();
    assert!(st.get(&r).await.is_ok());
    let last = st.remove_finalizers(&r, &fins(&["ctrl-b"])).await.unwrap();
    assert!(last.metadata.finalizers.is_empty());
    assert!(st.get(&r).await.unwrap_err().is_not_found());

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let ev = tokio::time::timeout(Duration::from_secs(5), w.next()).await.unwrap().unwrap().unwrap();
        kinds.push(ev.kind);
    }
    assert_eq!(kinds, vec![EventKind::Updated, EventKind::Updated, EventKind::Destroyed]);
}

#[tokio::test]
async fn finalizer_changes_that_do_nothing_keep_the_version() {
    let st = NamespacedState::default();
    let r = widget_ref("a");
    st.create(Resource::new("default", "Widget", "a", serde_json::json!({})).with_finalizer("x")).await.unwrap();
    assert_eq!(st.add_finalizers(&r, &fins(&["x"])).await.unwrap().version(), 1);
    assert_eq!(st.remove_finalizers(&r, &fins(&["nope"])).await.unwrap().version(), 1);
    assert_eq!(st.remove_finalizers(&r, &fins(&["x"])).await.unwrap().version(), 2);
}

#[tokio::test]
async fn teardown_and_destroy_uses_current_version() {
    let st = NamespacedState::default();
    let r = widget_ref("a");
    st.create(Resource::new("default", "Widget", "a", serde_json::json!({ "n": 0 }))).await.unwrap();
    st.update_with_conflicts(&r, 3, |res| {
        res.spec = serde_json::json!({ "n": 1 });
        Ok(())
    })
    .await
    .unwrap();
    assert!(st.teardown_and_destroy(&r).await.unwrap().is_destroyed());
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let st = NamespacedState::default();
    st.create(Resource::new("team-a", "Widget", "w", serde_json::json!({ "n": 1 }))).await.unwrap();
    st.create(Resource::new("team-b", "Widget", "w", serde_json::json!({ "n": 2 }))).await.unwrap();

    let a = st.get(&ResourceRef::new("team-a", "Widget", "w")).await.unwrap();
    let b = st.get(&ResourceRef::new("team-b", "Widget", "w")).await.unwrap();
    assert_eq!((a.spec["n"].as_i64(), b.spec["n"].as_i64()), (Some(1), Some(2)));
    assert_eq!(st.namespaces(), vec!["team-a".to_string(), "team-b".to_string()]);

    let all = LabelSelector::everything();
    assert!(st.list("team-c", "Widget", &all).await.unwrap().is_empty());
    assert!(st.get(&ResourceRef::new("team-c", "Widget", "w")).await.unwrap_err().is_not_found());

    // A watch in one namespace never sees writes from another.
    let mut w = st.watch("team-a", "Widget", WatchOptions::live()).await.unwrap();
    st.create(Resource::new("team-b", "Widget", "x", serde_json::json!({}))).await.unwrap();
    st.create(Resource::new("team-a", "Widget", "y", serde_json::json!({}))).await.unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(5), w.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(ev.resource.metadata.namespace, "team-a");
    assert_eq!(ev.id(), "y");
}

#[tokio::test]
async fn watch_for_waits_for_a_predicate() {
    let st = std::sync::Arc::new(NamespacedState::default());
    let r = widget_ref("a");
    st.create(Resource::new("default", "Widget", "a", serde_json::json!({ "ready": false }))).await.unwrap();

    let writer = {
        let st = std::sync::Arc::clone(&st);
        let r = r.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            st.update_with_conflicts(&r, 3, |res| {
                res.spec = serde_json::json!({ "ready": true });
                Ok(())
            })
            .await
        })
    };
    let ev = st.watch_for(&r, Duration::from_secs(5), |ev| ev.resource.spec["ready"] == true).await.unwrap();
    assert_eq!(ev.version(), 2);
    writer.await.unwrap().unwrap();

    let err = st.watch_for(&r, Duration::from_millis(30), |_| false).await.unwrap_err();
    assert!(matches!(err, StateError::Cancelled(_)));
}
