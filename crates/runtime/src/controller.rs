//! Controller contract: declared inputs/outputs plus a level-triggered reconcile.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use recon_core::prelude::*;
use recon_core::validate_segment;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::ScopedState;

/// A watched `(namespace, type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Input {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Input {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into() }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.kind) }
}

/// One unit of work: reconcile `resource` as of at least `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub controller: String,
    pub resource: ResourceRef,
    pub version: Version,
    /// Consecutive failures before this attempt.
    #[serde(default)]
    pub attempt: u32,
}

/// What a controller declares about itself. Checked once, at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub inputs: Vec<Input>,
    /// Resource types the controller may write.
    pub outputs: Vec<String>,
    #[serde(default = "one")]
    pub concurrency: usize,
}

fn one() -> usize { 1 }

impl Registration {
    pub fn of(c: &dyn Controller) -> Self {
        Self { name: c.name().to_string(), inputs: c.inputs(), outputs: c.outputs(), concurrency: c.concurrency() }
    }

    pub fn validate(&self) -> StateResult<()> {
        validate_segment("controller name", &self.name)?;
        if self.inputs.is_empty() {
            return Err(StateError::InvalidArgument(format!("controller {} declares no inputs", self.name)));
        }
        for i in &self.inputs {
            validate_segment("input namespace", &i.namespace)?;
            validate_segment("input type", &i.kind)?;
        }
        for o in &self.outputs {
            validate_segment("output type", o)?;
        }
        if self.concurrency == 0 {
            return Err(StateError::InvalidArgument(format!("controller {}: concurrency must be at least 1", self.name)));
        }
        Ok(())
    }

    pub fn output_set(&self) -> BTreeSet<String> { self.outputs.iter().cloned().collect() }
}

/// A reconciliation loop body. Implementations must be idempotent: they are
/// re-run after failures, restarts and duplicate notifications.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<Input>;

    fn outputs(&self) -> Vec<String>;

    /// Identities reconciled in parallel.
    fn concurrency(&self) -> usize { 1 }

    async fn reconcile(&self, ctx: &ReconcileContext, task: &Task) -> anyhow::Result<()>;
}

/// Per-task handle given to `Controller::reconcile`.
#[derive(Clone)]
pub struct ReconcileContext {
    state: Arc<ScopedState>,
    cancel: CancellationToken,
}

impl ReconcileContext {
    pub fn new(state: Arc<ScopedState>, cancel: CancellationToken) -> Self { Self { state, cancel } }

    pub fn name(&self) -> &str { self.state.controller() }

    /// Store view limited to the controller's declared inputs and outputs.
    pub fn state(&self) -> &ScopedState { &self.state }

    pub fn scoped(&self) -> Arc<ScopedState> { Arc::clone(&self.state) }

    pub fn cancel_token(&self) -> &CancellationToken { &self.cancel }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> Registration {
        Registration {
            name: "widgets".into(),
            inputs: vec![Input::new("default", "Widget")],
            outputs: vec!["WidgetStatus".into()],
            concurrency: 1,
        }
    }

    #[test]
    fn validates_declarations() {
        assert!(reg().validate().is_ok());
        let mut r = reg();
        r.inputs.clear();
        assert!(matches!(r.validate(), Err(StateError::InvalidArgument(_))));
        let mut r = reg();
        r.concurrency = 0;
        assert!(r.validate().is_err());
        let mut r = reg();
        r.name = String::new();
        assert!(r.validate().is_err());
        let mut r = reg();
        r.outputs.push("bad/type".into());
        assert!(r.validate().is_err());
    }

    #[test]
    fn registration_wire_shape() {
        let v = serde_json::to_value(reg()).unwrap();
        assert_eq!(v["inputs"][0]["type"], "Widget");
        let back: Registration = serde_json::from_value(serde_json::json!({
            "name": "x", "inputs": [{ "namespace": "default", "type": "A" }], "outputs": []
        }))
        .unwrap();
        assert_eq!(back.concurrency, 1);
    }
}
