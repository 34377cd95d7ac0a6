//! Run-side types streamed from the engine to observers.
//!
//! One run produces a stream of [`RunEvent`]s: user-facing log lines, stats
//! snapshots after every mutation, progress ticks, and a terminal
//! completion event. Observers (UI, report generator) only ever see owned
//! snapshots; the engine keeps the single mutable stats map to itself.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Execution state of one pipeline node within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// The node has started and not yet reached a terminal state.
    Running,
    /// The node finished without error.
    Success,
    /// The node finished with an error.
    Error,
}

impl NodeStatus {
    /// True for `Success` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Error)
    }
}

/// Timing and status record for one node, keyed by node id in
/// [`ExecutionStats`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStats {
    /// When the node entered `Running`.
    pub started_at: DateTime<Utc>,
    /// When the node reached a terminal status.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at`, in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Current execution state.
    pub status: NodeStatus,
    /// Loop nodes: iteration currently executing (1-based).
    #[serde(default)]
    pub current_iteration: Option<u32>,
    /// Loop nodes: total iterations requested.
    #[serde(default)]
    pub total_iterations: Option<u32>,
    /// Conditional nodes: the evaluated predicate result.
    #[serde(default)]
    pub condition_result: Option<bool>,
}

/// Snapshot of per-node stats for one run, in first-started order.
pub type ExecutionStats = IndexMap<String, NodeStats>;

/// Why a run ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    /// The root sequence ran to its end without an aborting error.
    Completed,
    /// The cancellation signal was observed.
    Stopped,
    /// An unrecoverable error unwound to the root.
    Failed {
        /// Human-readable failure description.
        reason: String,
    },
}

/// One event in a run's observer stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A user-facing log line (resolved commands, outputs, lifecycle notes).
    LogLine {
        /// The line text.
        line: String,
    },
    /// The stats map changed; carries a full owned snapshot.
    Stats {
        /// Per-node stats at the time of the change.
        snapshot: ExecutionStats,
    },
    /// A block step finished (in any status).
    Progress {
        /// Steps completed so far.
        completed: u64,
        /// Precomputed total, from `Pipeline::total_steps`.
        total: u64,
    },
    /// The run ended; always the final event of a run.
    Completed {
        /// Why the run ended.
        reason: TerminalReason,
    },
}
