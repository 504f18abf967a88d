//! Single-namespace in-memory store.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use recon_core::prelude::*;
use recon_core::validate_segment;
use rustc_hash::FxHashMap;

use crate::collection::Collection;
use crate::{State, StoreConfig, WatchStream};

/// One namespace: an independent collection per resource type.
pub struct InMemState {
    namespace: String,
    collections: RwLock<FxHashMap<String, Arc<Collection>>>,
    config: StoreConfig,
}

fn count_write(op: &'static str, res: &StateResult<impl Sized>) {
    match res {
        Ok(_) => {
            metrics::counter!("store_writes_total", 1u64, "op" => op);
        }
        Err(e) => {
            metrics::counter!("store_errors_total", 1u64, "op" => op, "code" => e.code());
        }
    }
}

impl InMemState {
    pub fn new(namespace: impl Into<String>) -> Self { Self::with_config(namespace, StoreConfig::default()) }

    pub fn with_config(namespace: impl Into<String>, config: StoreConfig) -> Self {
        Self { namespace: namespace.into(), collections: RwLock::new(FxHashMap::default()), config }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    fn check_namespace(&self, ns: &str) -> StateResult<()> {
        if ns != self.namespace {
            return Err(StateError::InvalidArgument(format!("namespace {ns:?} routed to partition {:?}", self.namespace)));
        }
        Ok(())
    }

    fn check_ref(&self, r: &ResourceRef) -> StateResult<()> {
        r.validate()?;
        self.check_namespace(&r.namespace)
    }

    fn collection(&self, kind: &str) -> Option<Arc<Collection>> {
        self.collections.read().unwrap_or_else(|e| e.into_inner()).get(kind).cloned()
    }

    fn collection_or_create(&self, kind: &str) -> Arc<Collection> {
        if let Some(c) = self.collection(kind) {
            return c;
        }
        let mut map = self.collections.write().unwrap_or_else(|e| e.into_inner());
        map.entry(kind.to_string())
            .or_insert_with(|| Arc::new(Collection::new(&self.namespace, kind, &self.config)))
            .clone()
    }

    fn existing(&self, r: &ResourceRef) -> StateResult<Arc<Collection>> {
        self.check_ref(r)?;
        self.collection(&r.kind).ok_or_else(|| StateError::NotFound(r.to_string()))
    }

    /// Resource types that have ever been written or watched here.
    pub fn kinds(&self) -> Vec<String> {
        let mut v: Vec<String> = self.collections.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl State for InMemState {
    async fn get(&self, r: &ResourceRef) -> StateResult<Resource> {
        self.existing(r)?.get(&r.id)
    }

    async fn list(&self, namespace: &str, kind: &str, selector: &LabelSelector) -> StateResult<Vec<Resource>> {
        self.check_namespace(namespace)?;
        validate_segment("type", kind)?;
        Ok(self.collection(kind).map(|c| c.list(selector)).unwrap_or_default())
    }

    async fn create(&self, resource: Resource) -> StateResult<Resource> {
        let r = resource.reference();
        self.check_ref(&r)?;
        let res = self.collection_or_create(&r.kind).create(resource);
        count_write("create", &res);
        res
    }

    async fn update(&self, resource: Resource, expected_version: Version) -> StateResult<Resource> {
        let r = resource.reference();
        let res = self.existing(&r).and_then(|c| c.update(resource, expected_version));
        count_write("update", &res);
        res
    }

    async fn destroy(&self, r: &ResourceRef, expected_version: Version) -> StateResult<DestroyOutcome> {
        let res = self.existing(r).and_then(|c| c.destroy(&r.id, expected_version));
        count_write("destroy", &res);
        res
    }

    async fn add_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        let res = self.existing(r).and_then(|c| c.add_finalizers(&r.id, finalizers));
        count_write("add_finalizers", &res);
        res
    }

    async fn remove_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        let res = self.existing(r).and_then(|c| c.remove_finalizers(&r.id, finalizers));
        count_write("remove_finalizers", &res);
        res
    }

    async fn watch(&self, namespace: &str, kind: &str, opts: WatchOptions) -> StateResult<WatchStream> {
        self.check_namespace(namespace)?;
        validate_segment("type", kind)?;
        if let Some(id) = &opts.id {
            validate_segment("id", id)?;
        }
        self.collection_or_create(kind).watch(opts)
    }
}
