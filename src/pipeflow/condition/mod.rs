// SPDX-License-Identifier: MIT

//! Condition expressions for `condition` nodes
//!
//! A condition resolves to a label that selects outgoing edges:
//! - `A.score > 0.5 ? 'pass' : 'fail'` - ternary over a boolean test
//! - `review.verdict` - the value at a path becomes the label
//! - `intent == 'bug' and priority > 3` - labelled `true` or `false`
//!
//! Boolean tests support `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`,
//! `and`, `or`, `not` and parentheses. Paths use dot notation over the run
//! context, with numeric segments indexing arrays.

mod ast;
mod evaluator;
mod parser;

pub use ast::{CompareOp, Expression, Literal, RouteExpr};
pub use evaluator::{evaluate, evaluate_route};
pub use parser::{parse, parse_route};
