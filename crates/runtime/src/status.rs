//! Published controller status, read lock-free by introspection calls.

use std::fmt;

use recon_core::ResourceRef;
use serde::{Deserialize, Serialize};

use crate::controller::Input;
use crate::queue::QueueStats;

/// Loop state of a controller as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Queued,
    Running,
    Backoff,
    Stopped,
}

impl LoopState {
    /// Derive the state from queue occupancy; running beats queued beats backoff.
    pub fn from_stats(stats: &QueueStats, stopped: bool) -> Self {
        if stopped {
            LoopState::Stopped
        } else if stats.running > 0 {
            LoopState::Running
        } else if stats.pending > 0 {
            LoopState::Queued
        } else if stats.backoff > 0 {
            LoopState::Backoff
        } else {
            LoopState::Idle
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Queued => "queued",
            LoopState::Running => "running",
            LoopState::Backoff => "backoff",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
        })
    }
}

/// Why a controller is degraded: one parked identity and its last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub resource: ResourceRef,
    pub message: String,
    pub failures: u32,
    pub since_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub name: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<String>,
    pub concurrency: usize,
    pub state: LoopState,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub backoff: usize,
    pub reconciles: u64,
    pub failures: u64,
    pub panics: u64,
    pub health: Health,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set for controllers hosted over an adapter session.
    #[serde(default)]
    pub remote: bool,
}

impl ControllerStatus {
    /// Overlay live queue occupancy on a published snapshot.
    pub fn with_queue(mut self, stats: QueueStats, stopped: bool) -> Self {
        self.state = LoopState::from_stats(&stats, stopped);
        self.queue_depth = stats.pending;
        self.in_flight = stats.running;
        self.backoff = stats.backoff;
        self
    }

    pub fn set_condition(&mut self, c: Condition) {
        self.conditions.retain(|x| x.resource != c.resource);
        self.conditions.push(c);
        self.conditions.sort_by(|a, b| a.resource.cmp(&b.resource));
        self.health = Health::Degraded;
    }

    pub fn clear_condition(&mut self, r: &ResourceRef) {
        self.conditions.retain(|x| &x.resource != r);
        if self.conditions.is_empty() {
            self.health = Health::Healthy;
        }
    }
}
