//! # Variable Resolution
//!
//! Command templates may carry `$(...)` placeholders that are substituted
//! at execution time against the current [`RunContext`]. Resolution is a
//! pure left-to-right scan: each placeholder is replaced at most once, the
//! substituted text is never re-scanned (no recursive expansion), and
//! unknown placeholders are left verbatim so the device sees exactly what
//! the author wrote.
//!
//! ## Recognized placeholders
//!
//! - `$(loop_total)`: iteration count of the innermost enclosing loop,
//!   `1` outside any loop
//! - `$(loop_index)`: current 1-based iteration of the innermost enclosing
//!   loop, `1` outside any loop
//! - `$(time_current)`: local timestamp `YYYY-MM-DD-HH-mm-ss`, recomputed
//!   at each resolution call
//! - `$(time_start)`: the run's fixed start timestamp, same format,
//!   computed once when the run begins

use chrono::{DateTime, Local};

/// Timestamp layout shared by `$(time_current)` and `$(time_start)`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Ephemeral per-run values threaded through one traversal.
///
/// Loop fields are passed down by value to descendants: a nested sequence
/// receives a derived context for each iteration and the parent's context
/// is untouched.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Current 1-based iteration of the innermost enclosing loop.
    pub loop_index: Option<u32>,
    /// Iteration count of the innermost enclosing loop.
    pub loop_total: Option<u32>,
    /// The run's start timestamp label, fixed for the whole run.
    pub time_start: String,
}

impl RunContext {
    /// Creates the root context for a run starting now.
    pub fn new() -> Self {
        Self::starting_at(Local::now())
    }

    /// Creates the root context with an explicit start instant.
    pub fn starting_at(start: DateTime<Local>) -> Self {
        Self {
            loop_index: None,
            loop_total: None,
            time_start: format_timestamp(start),
        }
    }

    /// Derives the context handed to a loop body for one iteration.
    pub fn for_iteration(&self, index: u32, total: u32) -> Self {
        Self {
            loop_index: Some(index),
            loop_total: Some(total),
            time_start: self.time_start.clone(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats an instant in the `$(time_*)` layout.
pub fn format_timestamp(instant: DateTime<Local>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

/// Substitutes recognized placeholders in `template` against `context`.
///
/// `$(time_current)` is evaluated once per call, so every occurrence within
/// one template resolves to the same instant.
pub fn resolve_template(template: &str, context: &RunContext) -> String {
    let mut output = String::with_capacity(template.len());
    let mut remainder = template;
    let mut time_current: Option<String> = None;

    while let Some(start) = remainder.find("$(") {
        output.push_str(&remainder[..start]);
        let after_open = &remainder[start + 2..];
        let Some(end) = after_open.find(')') else {
            // Unterminated placeholder: keep the tail verbatim.
            output.push_str(&remainder[start..]);
            return output;
        };
        let name = &after_open[..end];
        match name {
            "loop_total" => output.push_str(&context.loop_total.unwrap_or(1).to_string()),
            "loop_index" => output.push_str(&context.loop_index.unwrap_or(1).to_string()),
            "time_start" => output.push_str(&context.time_start),
            "time_current" => {
                let stamp = time_current.get_or_insert_with(|| format_timestamp(Local::now()));
                output.push_str(stamp);
            }
            _ => {
                output.push_str(&remainder[start..start + 2 + end + 1]);
            }
        }
        remainder = &after_open[end + 1..];
    }

    output.push_str(remainder);
    output
}
