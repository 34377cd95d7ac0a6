//! Conditional-node predicate evaluation.
//!
//! Custom predicates are small expression strings over resolved `$(...)`
//! placeholders and literals. Supported syntax: `==`, `!=`, `&&`, `||`,
//! and leading `!`; double-quoted literals keep operators inside them
//! inert. Comparison is textual after placeholder resolution, which is all
//! the authoring surface produces. `last_step_success` predicates are not
//! expressions: the runner answers them from the preceding sibling's
//! stats.

use anyhow::{Result, bail};

use crate::resolve::{RunContext, resolve_template};

/// Evaluates a predicate expression against the run context.
pub fn evaluate_expression(expression: &str, context: &RunContext) -> Result<bool> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        bail!("condition expression cannot be empty");
    }
    evaluate_node(trimmed, context)
}

fn evaluate_node(expression: &str, context: &RunContext) -> Result<bool> {
    if let Some(parts) = split_top_level(expression, "||") {
        for part in parts {
            if evaluate_node(part.trim(), context)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(parts) = split_top_level(expression, "&&") {
        for part in parts {
            if !evaluate_node(part.trim(), context)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let (negations, inner) = strip_leading_negations(expression);
    let inner = inner.trim();
    if inner.is_empty() {
        bail!("condition expression cannot end with a negation operator");
    }

    let value = if let Some(index) = find_top_level(inner, "==") {
        let (left, right) = operands_at(inner, index, 2)?;
        resolve_operand(left, context) == resolve_operand(right, context)
    } else if let Some(index) = find_top_level(inner, "!=") {
        let (left, right) = operands_at(inner, index, 2)?;
        resolve_operand(left, context) != resolve_operand(right, context)
    } else {
        is_truthy(&resolve_operand(inner, context))
    };

    Ok(if negations % 2 == 1 { !value } else { value })
}

fn operands_at(expression: &str, index: usize, operator_len: usize) -> Result<(&str, &str)> {
    let left = expression[..index].trim();
    let right = expression[index + operator_len..].trim();
    if left.is_empty() || right.is_empty() {
        bail!("comparison is missing an operand: '{expression}'");
    }
    Ok((left, right))
}

fn resolve_operand(operand: &str, context: &RunContext) -> String {
    let resolved = resolve_template(operand.trim(), context);
    let trimmed = resolved.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "false" && value != "0"
}

fn strip_leading_negations(expression: &str) -> (u32, &str) {
    let mut rest = expression.trim_start();
    let mut count = 0;
    while let Some(stripped) = rest.strip_prefix('!') {
        // Don't eat the '!' of a '!=' comparison.
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        rest = stripped.trim_start();
    }
    (count, rest)
}

/// Splits on every top-level occurrence of `operator`, honoring quotes.
/// Returns `None` when the operator does not occur at the top level.
fn split_top_level<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search_from = 0;
    while let Some(offset) = find_top_level(&expression[search_from..], operator) {
        let index = search_from + offset;
        parts.push(&expression[start..index]);
        start = index + operator.len();
        search_from = start;
    }
    if parts.is_empty() {
        return None;
    }
    parts.push(&expression[start..]);
    Some(parts)
}

/// Finds the first occurrence of `operator` outside double quotes.
fn find_top_level(expression: &str, operator: &str) -> Option<usize> {
    let bytes = expression.as_bytes();
    let op_bytes = operator.as_bytes();
    let mut in_quotes = false;
    let mut index = 0;
    while index + op_bytes.len() <= bytes.len() {
        let byte = bytes[index];
        if byte == b'"' {
            in_quotes = !in_quotes;
            index += 1;
            continue;
        }
        if !in_quotes && &bytes[index..index + op_bytes.len()] == op_bytes {
            return Some(index);
        }
        index += 1;
    }
    None
}
