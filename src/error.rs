//! Error types for dispatch-loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dispatch loop stopped before the work item ran")]
    Stopped,

    #[error("dispatch loop is not running")]
    NotRunning,

    #[error("dispatch loop has been disposed")]
    Disposed,

    #[error("dispatch queue is full ({capacity} pending items)")]
    QueueFull { capacity: usize },

    #[error("callback panicked: {0}")]
    Panicked(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("work item was dropped before producing a result")]
    Abandoned,

    #[error("executor rejected continuation: {0}")]
    Rejected(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

/// Extract the human-readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
