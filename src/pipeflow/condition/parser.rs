// SPDX-License-Identifier: MIT

//! Condition expression parser
//!
//! Parses expressions like:
//! - `field == 'value'`
//! - `score > 0.8 and not (status == 'done')`
//! - `A.score > 0.5 ? 'pass' : 'fail'`

use super::ast::{CompareOp, Expression, Literal, RouteExpr};
use crate::adk::error::ConditionError;

/// Parse the expression of a condition node
pub fn parse_route(input: &str) -> Result<RouteExpr, ConditionError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConditionError::Syntax("empty condition".to_string()));
    }

    if let Some(q) = find_top_level(input, "?") {
        let test = parse(&input[..q])?;
        let branches = &input[q + 1..];
        let colon = find_top_level(branches, ":")
            .ok_or_else(|| ConditionError::Syntax(format!("missing ':' in {}", input)))?;
        return Ok(RouteExpr::Ternary {
            test,
            when_true: parse_label(&branches[..colon])?,
            when_false: parse_label(&branches[colon + 1..])?,
        });
    }

    let inner = strip_parens(input);
    if is_path(inner) && inner != "true" && inner != "false" {
        return Ok(RouteExpr::Path(inner.to_string()));
    }

    Ok(RouteExpr::Predicate(parse(input)?))
}

/// Parse a boolean expression
pub fn parse(input: &str) -> Result<Expression, ConditionError> {
    let input = strip_parens(input.trim());
    if input.is_empty() {
        return Err(ConditionError::Syntax("empty expression".to_string()));
    }

    match input {
        "true" => return Ok(Expression::True),
        "false" => return Ok(Expression::False),
        _ => {}
    }

    // `or` binds looser than `and`
    if let Some(pos) = find_top_level(input, " or ") {
        let left = parse(&input[..pos])?;
        let right = parse(&input[pos + 4..])?;
        return Ok(Expression::Or(Box::new(left), Box::new(right)));
    }
    if let Some(pos) = find_top_level(input, " and ") {
        let left = parse(&input[..pos])?;
        let right = parse(&input[pos + 5..])?;
        return Ok(Expression::And(Box::new(left), Box::new(right)));
    }

    if let Some(rest) = input.strip_prefix("not ") {
        return Ok(Expression::Not(Box::new(parse(rest)?)));
    }
    if let Some(rest) = input.strip_prefix('!') {
        if !rest.starts_with('=') {
            return Ok(Expression::Not(Box::new(parse(rest)?)));
        }
    }

    if let Some(expr) = parse_comparison(input)? {
        return Ok(expr);
    }

    if is_path(input) {
        return Ok(Expression::Truthy(input.to_string()));
    }

    Err(ConditionError::Syntax(input.to_string()))
}

fn parse_comparison(input: &str) -> Result<Option<Expression>, ConditionError> {
    // Longest operators first
    let operators = [
        ("!=", CompareOp::NotEq),
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        ("==", CompareOp::Eq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        (" contains ", CompareOp::Contains),
    ];

    for (op_str, op) in operators {
        if let Some(pos) = find_top_level(input, op_str) {
            let left = input[..pos].trim();
            if !is_path(left) {
                return Err(ConditionError::Syntax(format!(
                    "expected a path before '{}' in {}",
                    op_str.trim(),
                    input
                )));
            }
            let right = parse_literal(&input[pos + op_str.len()..])?;
            return Ok(Some(Expression::Compare {
                left: left.to_string(),
                op,
                right,
            }));
        }
    }

    Ok(None)
}

/// Byte offset of the first `pat` outside quotes and parentheses
fn find_top_level(input: &str, pat: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                continue;
            }
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && input[i..].starts_with(pat) {
            return Some(i);
        }
    }
    None
}

/// Remove parentheses that wrap the whole input
fn strip_parens(mut input: &str) -> &str {
    loop {
        let trimmed = input.trim();
        if !(trimmed.starts_with('(') && trimmed.ends_with(')')) {
            return trimmed;
        }

        let mut depth = 0i32;
        let mut quote: Option<char> = None;
        let last = trimmed.len() - 1;
        for (i, c) in trimmed.char_indices() {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 && i != last {
                        // `(a) and (b)`: the first group closes early
                        return trimmed;
                    }
                }
                _ => {}
            }
        }
        input = &trimmed[1..last];
    }
}

/// Dot-separated identifiers: `result`, `A.score`, `items.0.name`
fn is_path(input: &str) -> bool {
    let starts_well = input
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    starts_well
        && input.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

fn parse_label(input: &str) -> Result<String, ConditionError> {
    let input = input.trim();
    if let Some(s) = unquote(input) {
        return Ok(s.to_string());
    }
    if input.is_empty() || input.contains(char::is_whitespace) {
        return Err(ConditionError::Syntax(format!("invalid label: '{}'", input)));
    }
    Ok(input.to_string())
}

fn unquote(input: &str) -> Option<&str> {
    let quoted = input.len() >= 2
        && ((input.starts_with('\'') && input.ends_with('\''))
            || (input.starts_with('"') && input.ends_with('"')));
    quoted.then(|| &input[1..input.len() - 1])
}

fn parse_literal(input: &str) -> Result<Literal, ConditionError> {
    let input = input.trim();

    match input {
        "null" => return Ok(Literal::Null),
        "true" => return Ok(Literal::Boolean(true)),
        "false" => return Ok(Literal::Boolean(false)),
        _ => {}
    }

    if let Some(s) = unquote(input) {
        return Ok(Literal::String(s.to_string()));
    }

    if let Ok(n) = input.parse::<f64>() {
        return Ok(Literal::Number(n));
    }

    Err(ConditionError::Literal(input.to_string()))
}
