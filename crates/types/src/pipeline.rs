//! Block catalog and pipeline tree schema.
//!
//! A pipeline is an ordered tree of typed nodes: leaf blocks referencing a
//! reusable [`Block`] from the catalog, loop containers repeating a child
//! sequence, and conditionals selecting one of two branches. The tree is
//! authored externally and handed to the engine as an immutable snapshot for
//! the duration of one run; node order is preserved everywhere so the
//! authoring tool, the engine, and observers agree on traversal order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod validation;

/// A named, reusable unit of work executed as one pipeline step.
///
/// Blocks are created and edited by an external block manager and referenced
/// by id from [`BlockNode`]s; the engine never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    /// Stable identifier, unique within the catalog.
    pub id: String,
    /// Display label shown in logs and authoring surfaces.
    pub name: String,
    /// Determines whether the block dispatches its commands or resolves to
    /// built-in engine behavior.
    #[serde(default)]
    pub kind: BlockKind,
    /// Ordered command templates; may contain `$(...)` placeholders.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Command that starts device log capture (log-start blocks).
    #[serde(default)]
    pub log_command: Option<String>,
    /// File name handed to the log capture command.
    #[serde(default)]
    pub log_file_name: Option<String>,
    /// Command that stops device log capture (log-stop blocks).
    #[serde(default)]
    pub stop_command: Option<String>,
}

/// Classifies how a block is executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Ships with the product; commands are dispatched as written.
    #[default]
    Predefined,
    /// Authored by the user; commands are dispatched as written.
    Custom,
    /// Resolved to built-in engine behavior instead of dispatched commands.
    Special(SpecialKind),
}

/// Built-in behaviors a special block can resolve to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpecialKind {
    /// Suspend the run for a configured duration.
    Sleep,
    /// Await an on-screen template match from the device.
    WaitForImage,
    /// Begin device log capture.
    LogStart,
    /// End device log capture.
    LogStop,
}

/// Id-keyed catalog of blocks, preserving authoring order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockCatalog {
    /// Blocks keyed by their stable id.
    #[serde(default)]
    pub blocks: IndexMap<String, Block>,
}

impl BlockCatalog {
    /// Builds a catalog from a list of blocks, keyed by id.
    ///
    /// Later duplicates win, matching how the external block manager saves
    /// edits over existing entries.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let mut map = IndexMap::with_capacity(blocks.len());
        for block in blocks {
            map.insert(block.id.clone(), block);
        }
        Self { blocks: map }
    }

    /// Looks up a block by id.
    pub fn lookup(&self, block_id: &str) -> Option<&Block> {
        self.blocks.get(block_id)
    }
}

/// One element of the pipeline tree.
///
/// Closed sum so the traversal in the engine matches exhaustively; adding a
/// node kind forces every consumer to handle it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineNode {
    /// Leaf step referencing a catalog block.
    Block(BlockNode),
    /// Container repeating its children a fixed number of times.
    Loop(LoopNode),
    /// Container selecting one of two child sequences.
    Conditional(ConditionalNode),
}

impl PipelineNode {
    /// Returns the node id, unique across the whole tree.
    pub fn id(&self) -> &str {
        match self {
            PipelineNode::Block(node) => &node.id,
            PipelineNode::Loop(node) => &node.id,
            PipelineNode::Conditional(node) => &node.id,
        }
    }
}

/// Leaf node executing one catalog block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockNode {
    /// Node id, unique across the tree and stable across runs so stats
    /// correlate between executions.
    pub id: String,
    /// Reference into the block catalog.
    pub block_id: String,
    /// Sleep duration in milliseconds for sleep blocks.
    #[serde(default)]
    pub sleep_duration_ms: Option<u64>,
    /// Template image path for wait-for-image blocks.
    #[serde(default)]
    pub image_template_path: Option<String>,
    /// Match timeout in milliseconds for wait-for-image blocks.
    #[serde(default)]
    pub match_timeout_ms: Option<u64>,
    /// Node-level override of the block's log capture command.
    #[serde(default)]
    pub log_command: Option<String>,
    /// Node-level override of the block's log file name.
    #[serde(default)]
    pub log_file_name: Option<String>,
    /// Node-level override of the block's log stop command.
    #[serde(default)]
    pub stop_command: Option<String>,
}

impl BlockNode {
    /// Effective log capture command: node override, then block field.
    pub fn effective_log_command<'a>(&'a self, block: &'a Block) -> Option<&'a str> {
        self.log_command.as_deref().or(block.log_command.as_deref())
    }

    /// Effective log file name: node override, then block field.
    pub fn effective_log_file_name<'a>(&'a self, block: &'a Block) -> Option<&'a str> {
        self.log_file_name.as_deref().or(block.log_file_name.as_deref())
    }

    /// Effective log stop command: node override, then block field.
    pub fn effective_stop_command<'a>(&'a self, block: &'a Block) -> Option<&'a str> {
        self.stop_command.as_deref().or(block.stop_command.as_deref())
    }
}

/// Container node repeating its children `loop_count` times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopNode {
    /// Node id, unique across the tree.
    pub id: String,
    /// Requested iteration count. Authoring tools are expected to supply a
    /// value >= 1; anything <= 0 executes as zero iterations.
    pub loop_count: i64,
    /// Child sequence executed once per iteration.
    #[serde(default)]
    pub children: Vec<PipelineNode>,
}

impl LoopNode {
    /// Iteration count the engine will actually run: `loop_count` clamped at
    /// zero.
    pub fn iterations(&self) -> u32 {
        u32::try_from(self.loop_count).unwrap_or(0)
    }
}

/// Container node executing one of two branches per evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionalNode {
    /// Node id, unique across the tree.
    pub id: String,
    /// Predicate evaluated against the run context and recent stats.
    pub condition: Condition,
    /// Branch executed when the condition holds.
    #[serde(default)]
    pub children: Vec<PipelineNode>,
    /// Branch executed when the condition does not hold.
    #[serde(default)]
    pub else_children: Vec<PipelineNode>,
}

/// Predicate attached to a conditional node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// True when the immediately preceding sibling finished successfully.
    LastStepSuccess,
    /// Custom predicate over resolved placeholders and literals, e.g.
    /// `$(loop_index) == 3 && $(loop_total) != 1`.
    Expression {
        /// The expression source text.
        expression: String,
    },
}

/// An automation script: an ordered tree of pipeline nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    /// Stable pipeline identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Root node sequence.
    #[serde(default)]
    pub items: Vec<PipelineNode>,
}

impl Pipeline {
    /// Total number of block steps a full run visits, for progress reporting.
    ///
    /// A loop contributes `iterations * steps(children)`. A conditional
    /// contributes its true branch only: exactly one branch executes per
    /// evaluation, and counting the true branch keeps the total stable
    /// without inspecting run-time state. Progress accuracy suffers when the
    /// else branch has a different step count; that trade-off is accepted.
    pub fn total_steps(&self) -> u64 {
        sequence_steps(&self.items)
    }
}

fn sequence_steps(nodes: &[PipelineNode]) -> u64 {
    nodes
        .iter()
        .map(|node| match node {
            PipelineNode::Block(_) => 1,
            PipelineNode::Loop(loop_node) => u64::from(loop_node.iterations()) * sequence_steps(&loop_node.children),
            PipelineNode::Conditional(conditional) => sequence_steps(&conditional.children),
        })
        .sum()
}
