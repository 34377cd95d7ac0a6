//! Validation helpers shared across pipeline consumers.
//!
//! The engine indexes run stats by flat node id regardless of nesting depth,
//! so node ids must be unique across the whole tree. These routines let the
//! authoring surface and the engine reject malformed trees with the same
//! diagnostics before a run starts.

use std::collections::HashSet;

use thiserror::Error;

use super::{BlockCatalog, Pipeline, PipelineNode};

/// A structural problem detected in a pipeline document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two nodes (at any nesting depth) share an id.
    #[error("duplicate node id '{0}' in pipeline tree")]
    DuplicateNodeId(String),
    /// A block node references an id missing from the catalog.
    #[error("node '{node_id}' references unknown block '{block_id}'")]
    UnknownBlock {
        /// The offending node.
        node_id: String,
        /// The dangling reference.
        block_id: String,
    },
}

/// Validates node-id uniqueness and catalog references for a whole pipeline.
///
/// Returns every problem found rather than stopping at the first, so the
/// authoring surface can annotate all offending nodes in one pass.
pub fn validate_pipeline(pipeline: &Pipeline, catalog: &BlockCatalog) -> Result<(), Vec<ValidationError>> {
    let mut seen = HashSet::new();
    let mut errors = Vec::new();
    walk(&pipeline.items, catalog, &mut seen, &mut errors);
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn walk(nodes: &[PipelineNode], catalog: &BlockCatalog, seen: &mut HashSet<String>, errors: &mut Vec<ValidationError>) {
    for node in nodes {
        if !seen.insert(node.id().to_string()) {
            errors.push(ValidationError::DuplicateNodeId(node.id().to_string()));
        }
        match node {
            PipelineNode::Block(block_node) => {
                if catalog.lookup(&block_node.block_id).is_none() {
                    errors.push(ValidationError::UnknownBlock {
                        node_id: block_node.id.clone(),
                        block_id: block_node.block_id.clone(),
                    });
                }
            }
            PipelineNode::Loop(loop_node) => walk(&loop_node.children, catalog, seen, errors),
            PipelineNode::Conditional(conditional) => {
                walk(&conditional.children, catalog, seen, errors);
                walk(&conditional.else_children, catalog, seen, errors);
            }
        }
    }
}
