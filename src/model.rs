//! Core data model.
//!
//! A dispatch loop has identity (a [`LoopId`]) and a lifecycle [`LoopState`].
//! Every submission is tagged with the [`SubmitKind`] that produced it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Loop identity
// ---------------------------------------------------------------------------

/// Newtype for dispatch loop IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopId(pub Uuid);

impl LoopId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No worker thread. Submissions are refused.
    Stopped,
    /// Worker thread is draining the queue.
    Running,
    /// Termination signalled; the worker is finishing its current callback.
    Terminating,
}

impl LoopState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, to),
            (Stopped, Running) | (Running, Terminating) | (Terminating, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Terminating => "terminating",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Submission kind
// ---------------------------------------------------------------------------

/// Which public API produced a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitKind {
    Post,
    Send,
    SendAsync,
    Spawn,
}

impl SubmitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Send => "send",
            Self::SendAsync => "send_async",
            Self::Spawn => "spawn",
        }
    }
}
