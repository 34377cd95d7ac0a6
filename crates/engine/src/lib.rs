//! # Rigline Engine
//!
//! The rigline engine interprets a pipeline tree against a remote device
//! rig. It walks the ordered node sequence depth-first, executing leaf
//! blocks through a [`DevicePort`](rigline_channel::DevicePort), iterating
//! loop containers, evaluating conditionals, and honoring a shared
//! cancellation token at every suspension point.
//!
//! ## Key behaviors
//!
//! - **Soft vs. hard failures**: a failing command block marks its node
//!   `Error` and the run continues with the next sibling; loop-body errors
//!   and image-match failures unwind to the root and end the run.
//! - **Observer stream**: log lines, stats snapshots, progress ticks, and
//!   the terminal reason are emitted as [`RunEvent`](rigline_types::RunEvent)s
//!   over an unbounded channel; observers never see the live stats map.
//! - **Variable templating**: command templates are resolved per execution
//!   against the current [`RunContext`](resolve::RunContext), so a command
//!   inside a loop sees that iteration's `$(loop_index)`.
//!
//! ## Architecture
//!
//! - **`resolve`**: placeholder substitution and the per-run context
//! - **`condition`**: the conditional-node predicate evaluator
//! - **`stats`**: the per-node timing/status tracker
//! - **`runner`**: the recursive interpreter itself
//! - **`error`**: the run error taxonomy

pub mod condition;
pub mod error;
pub mod resolve;
pub mod runner;
pub mod stats;

pub use error::RunError;
pub use resolve::{RunContext, resolve_template};
pub use runner::PipelineEngine;
pub use stats::StatsTracker;
