//! Recon core types: resource identity, metadata, change events.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod error;
pub mod selector;

pub use error::{StateError, StateResult};
pub use selector::{LabelSelector, LabelTerm};

/// Per-resource version. Starts at 1 on creation, +1 on every write.
pub type Version = u64;

/// Collection-wide (namespace + type) revision carried by every event.
pub type Bookmark = u64;

/// Full identity of a resource: `(namespace, type, id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), id: id.into() }
    }

    /// Reject identities the store cannot address.
    pub fn validate(&self) -> StateResult<()> {
        validate_segment("namespace", &self.namespace)?;
        validate_segment("type", &self.kind)?;
        validate_segment("id", &self.id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

/// Parses the `namespace/type/id` form produced by `Display`.
impl FromStr for ResourceRef {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let (Some(ns), Some(kind), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(StateError::InvalidArgument(format!("expected namespace/type/id, got {s:?}")));
        };
        let r = ResourceRef::new(ns, kind, id);
        r.validate()?;
        Ok(r)
    }
}

/// Validate a single identity segment (namespace, type or id).
pub fn validate_segment(what: &str, value: &str) -> StateResult<()> {
    if value.is_empty() {
        return Err(StateError::InvalidArgument(format!("{what} must not be empty")));
    }
    if value.contains('/') || value.chars().any(char::is_control) {
        return Err(StateError::InvalidArgument(format!("{what} {value:?} contains forbidden characters")));
    }
    Ok(())
}

/// Lifecycle phase. `TearingDown` is the tombstone left by a destroy that was
/// blocked by finalizers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearing_down"),
        }
    }
}

/// Finalizers are a small ordered set; most resources carry zero or one.
pub type Finalizers = SmallVec<[String; 2]>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Metadata {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    /// Assigned by the store; ignored on create.
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub phase: Phase,
    /// Controller that created the resource; empty for external writers.
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Finalizers,
    /// Weak back-references; never enforced by the store.
    #[serde(default)]
    pub owner_refs: Vec<ResourceRef>,
    #[serde(default)]
    pub created_ms: i64,
    #[serde(default)]
    pub updated_ms: i64,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), id: id.into(), ..Default::default() }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef { namespace: self.namespace.clone(), kind: self.kind.clone(), id: self.id.clone() }
    }

    pub fn tearing_down(&self) -> bool { self.phase == Phase::TearingDown }

    pub fn has_finalizer(&self, f: &str) -> bool { self.finalizers.iter().any(|x| x == f) }

    /// Insert finalizers keeping set semantics. Returns true if anything changed.
    pub fn add_finalizers<'a>(&mut self, fins: impl IntoIterator<Item = &'a str>) -> bool {
        let mut changed = false;
        for f in fins {
            if !self.has_finalizer(f) {
                self.finalizers.push(f.to_string());
                changed = true;
            }
        }
        changed
    }

    /// Remove finalizers. Returns true if anything changed.
    pub fn remove_finalizers<'a>(&mut self, fins: impl IntoIterator<Item = &'a str>) -> bool {
        let before = self.finalizers.len();
        for f in fins {
            self.finalizers.retain(|x| x != f);
        }
        before != self.finalizers.len()
    }
}

/// The atomic unit of state: metadata plus opaque spec and status payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Resource {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>, spec: serde_json::Value) -> Self {
        Self { metadata: Metadata::new(namespace, kind, id), spec, status: serde_json::Value::Null }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_finalizer(mut self, f: impl Into<String>) -> Self {
        let f = f.into();
        self.metadata.add_finalizers([f.as_str()]);
        self
    }

    pub fn reference(&self) -> ResourceRef { self.metadata.reference() }
    pub fn version(&self) -> Version { self.metadata.version }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Destroyed,
    /// Synthetic event replaying current state when a watch starts.
    Bootstrap,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Destroyed => "destroyed",
            EventKind::Bootstrap => "bootstrap",
        };
        f.write_str(s)
    }
}

/// A committed change (or bootstrap replay) delivered to watchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub resource: Resource,
    pub bookmark: Bookmark,
}

impl Event {
    pub fn version(&self) -> Version { self.resource.metadata.version }
    pub fn id(&self) -> &str { &self.resource.metadata.id }
}

/// Result of a destroy: either physically removed, or tombstoned because
/// finalizers are still present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "resource", rename_all = "snake_case")]
pub enum DestroyOutcome {
    Destroyed(Resource),
    TearingDown(Resource),
}

impl DestroyOutcome {
    pub fn resource(&self) -> &Resource {
        match self {
            DestroyOutcome::Destroyed(r) | DestroyOutcome::TearingDown(r) => r,
        }
    }

    pub fn is_destroyed(&self) -> bool { matches!(self, DestroyOutcome::Destroyed(_)) }
}

/// Options for a watch subscription on one namespace + type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WatchOptions {
    /// Restrict the watch to a single identity.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub selector: LabelSelector,
    /// Replay current state as `Bootstrap` events before live events.
    #[serde(default)]
    pub bootstrap: bool,
    /// Resume point: a resource version for id watches, a collection bookmark
    /// otherwise. Implies `bootstrap`.
    #[serde(default)]
    pub from_version: Option<u64>,
}

impl WatchOptions {
    pub fn live() -> Self { Self::default() }

    pub fn bootstrap() -> Self { Self { bootstrap: true, ..Default::default() } }

    pub fn single(id: impl Into<String>) -> Self { Self { id: Some(id.into()), ..Default::default() } }

    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn from_version(mut self, v: u64) -> Self {
        self.from_version = Some(v);
        self
    }

    pub fn wants_bootstrap(&self) -> bool { self.bootstrap || self.from_version.is_some() }
}

/// Current wall-clock time in unix millis.
pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

pub mod prelude {
    pub use super::{
        Bookmark, DestroyOutcome, Event, EventKind, LabelSelector, LabelTerm, Metadata, Phase, Resource, ResourceRef,
        StateError, StateResult, Version, WatchOptions,
    };
}
