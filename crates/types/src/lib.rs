//! Shared type definitions for the rigline pipeline engine.
//!
//! This crate holds the pure data model that every other rigline crate
//! consumes: the block catalog and pipeline tree interpreted by the engine,
//! and the run-side types (per-node stats, terminal reasons, run events)
//! streamed to observers while a pipeline executes.
//!
//! Nothing here has behavior beyond traversal and validation helpers; the
//! engine crate owns execution semantics and the channel crate owns the
//! wire protocol.

pub mod pipeline;
pub mod run;

pub use pipeline::{
    Block, BlockCatalog, BlockKind, BlockNode, Condition, ConditionalNode, LoopNode, Pipeline, PipelineNode, SpecialKind,
};
pub use run::{ExecutionStats, NodeStats, NodeStatus, RunEvent, TerminalReason};
