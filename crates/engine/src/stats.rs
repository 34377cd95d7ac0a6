//! Per-node timing and status tracking for one run.
//!
//! A fresh tracker is created at run start and mutated in place as nodes
//! transition states. Observers never see the live map: the engine emits an
//! owned [`ExecutionStats`] snapshot after every mutation. Transitions are
//! monotonic within a run: a node that reached a terminal status never
//! moves back to `Running`, and loop-progress patches never touch
//! timestamps.

use chrono::Utc;
use rigline_types::{ExecutionStats, NodeStats, NodeStatus};

/// The single mutable stats map owned by one run.
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: ExecutionStats,
}

impl StatsTracker {
    /// Creates an empty tracker for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a node `Running` and stamps its start time.
    ///
    /// Re-entering a node that already holds a terminal status (a loop body
    /// on a later iteration) restarts its record: the node is genuinely
    /// running again, and the monotonicity rule applies within one visit.
    pub fn begin(&mut self, id: &str) {
        self.stats.insert(
            id.to_string(),
            NodeStats {
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
                status: NodeStatus::Running,
                current_iteration: None,
                total_iterations: None,
                condition_result: None,
            },
        );
    }

    /// Moves a node to a terminal status and stamps end time and duration.
    ///
    /// Ignored when the node never began or already holds a terminal
    /// status, keeping transitions monotonic.
    pub fn end(&mut self, id: &str, status: NodeStatus) {
        debug_assert!(status.is_terminal());
        let Some(record) = self.stats.get_mut(id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        let ended = Utc::now();
        record.duration_ms = u64::try_from((ended - record.started_at).num_milliseconds()).ok();
        record.ended_at = Some(ended);
        record.status = status;
    }

    /// Patches a loop node's iteration counters without touching timestamps.
    pub fn update_loop_progress(&mut self, id: &str, iteration: u32, total: u32) {
        if let Some(record) = self.stats.get_mut(id) {
            record.current_iteration = Some(iteration);
            record.total_iterations = Some(total);
        }
    }

    /// Records the evaluated predicate of a conditional node.
    pub fn record_condition(&mut self, id: &str, result: bool) {
        if let Some(record) = self.stats.get_mut(id) {
            record.condition_result = Some(result);
        }
    }

    /// Terminal status of a node, if it reached one.
    pub fn terminal_status(&self, id: &str) -> Option<NodeStatus> {
        self.stats.get(id).map(|record| record.status).filter(|status| status.is_terminal())
    }

    /// True when no node has ever been tracked.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Owned snapshot for observers.
    pub fn snapshot(&self) -> ExecutionStats {
        self.stats.clone()
    }
}
