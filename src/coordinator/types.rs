//! Engine state types.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ──────────→ Reconciling ──→ Importing ──→ Running
//!    │                (incremental      │              │
//!    │                 imports only)    │   shutdown() │  feed error
//!    │                     │            │              ↓  (exit_on_error)
//!    │                     └──── error ─┴──────→ Failed ←──┘
//!    │
//!    └──── shutdown() ──→ ShuttingDown ──→ Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`.
//! - **Reconciling**: Removing rows deleted from the source since the last run.
//! - **Importing**: Bulk import of every namespace.
//! - **Running**: Tailing the change feed.
//! - **ShuttingDown**: `shutdown()` called. Waiting for the in-flight event
//!   and flushing the feed cursor.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Unrecoverable error. Restart the process to resume.

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Deletion reconciliation before an incremental import.
    Reconciling,

    /// Initial import in progress.
    Importing,

    /// Applying the live change feed.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Engine has shut down cleanly.
    Stopped,

    /// Startup or the live feed failed.
    Failed,
}

impl EngineState {
    /// Whether the engine has finished, cleanly or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Reconciling => write!(f, "Reconciling"),
            EngineState::Importing => write!(f, "Importing"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
