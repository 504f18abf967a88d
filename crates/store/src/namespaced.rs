//! Namespace multiplexer: routes each call to an isolated `InMemState`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use recon_core::prelude::*;
use recon_core::validate_segment;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::{InMemState, State, StoreConfig, WatchStream};

/// Partitions materialize lazily on first write (or first watch, which must
/// see later writes) and are never removed.
pub struct NamespacedState {
    partitions: RwLock<FxHashMap<String, Arc<InMemState>>>,
    config: StoreConfig,
}

impl Default for NamespacedState {
    fn default() -> Self { Self::new(StoreConfig::default()) }
}

impl NamespacedState {
    pub fn new(config: StoreConfig) -> Self { Self { partitions: RwLock::new(FxHashMap::default()), config } }

    fn partition(&self, ns: &str) -> Option<Arc<InMemState>> {
        self.partitions.read().unwrap_or_else(|e| e.into_inner()).get(ns).cloned()
    }

    fn partition_or_create(&self, ns: &str) -> StateResult<Arc<InMemState>> {
        validate_segment("namespace", ns)?;
        if let Some(p) = self.partition(ns) {
            return Ok(p);
        }
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        let p = map
            .entry(ns.to_string())
            .or_insert_with(|| {
                info!(ns = %ns, "store: namespace materialized");
                metrics::counter!("store_namespaces_total", 1u64);
                Arc::new(InMemState::with_config(ns, self.config.clone()))
            })
            .clone();
        Ok(p)
    }

    fn existing(&self, r: &ResourceRef) -> StateResult<Arc<InMemState>> {
        r.validate()?;
        self.partition(&r.namespace).ok_or_else(|| StateError::NotFound(r.to_string()))
    }

    /// Names of all materialized namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut v: Vec<String> = self.partitions.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl State for NamespacedState {
    async fn get(&self, r: &ResourceRef) -> StateResult<Resource> {
        self.existing(r)?.get(r).await
    }

    async fn list(&self, namespace: &str, kind: &str, selector: &LabelSelector) -> StateResult<Vec<Resource>> {
        validate_segment("namespace", namespace)?;
        match self.partition(namespace) {
            Some(p) => p.list(namespace, kind, selector).await,
            None => {
                validate_segment("type", kind)?;
                Ok(Vec::new())
            }
        }
    }

    async fn create(&self, resource: Resource) -> StateResult<Resource> {
        let r = resource.reference();
        r.validate()?;
        self.partition_or_create(&r.namespace)?.create(resource).await
    }

    async fn update(&self, resource: Resource, expected_version: Version) -> StateResult<Resource> {
        let r = resource.reference();
        self.existing(&r)?.update(resource, expected_version).await
    }

    async fn destroy(&self, r: &ResourceRef, expected_version: Version) -> StateResult<DestroyOutcome> {
        self.existing(r)?.destroy(r, expected_version).await
    }

    async fn add_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.existing(r)?.add_finalizers(r, finalizers).await
    }

    async fn remove_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.existing(r)?.remove_finalizers(r, finalizers).await
    }

    async fn watch(&self, namespace: &str, kind: &str, opts: WatchOptions) -> StateResult<WatchStream> {
        self.partition_or_create(namespace)?.watch(namespace, kind, opts).await
    }
}
