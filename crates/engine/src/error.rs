//! Run error taxonomy.
//!
//! Only errors that abort a run appear here. Command timeouts and other
//! dispatch failures are absorbed at the block level (the node is marked
//! `Error` and the run continues), and a missing catalog block is logged
//! and skipped; neither produces a `RunError`.

use thiserror::Error;

/// An error that unwinds the interpreter to the root.
#[derive(Debug, Error)]
pub enum RunError {
    /// The cancellation signal was observed. Not a failure: the run
    /// terminates with `TerminalReason::Stopped`.
    #[error("pipeline stopped by user")]
    Stopped,
    /// A wait-for-image block did not find its template. Hard gate: the
    /// whole run fails.
    #[error("image match failed at node '{node_id}': {reason}")]
    ImageMatch {
        /// The wait-for-image node.
        node_id: String,
        /// What the matcher reported, or the timeout description.
        reason: String,
    },
    /// `run` was called while another run is active on this engine.
    #[error("a run is already active on this engine")]
    AlreadyRunning,
}
