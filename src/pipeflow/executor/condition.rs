// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::error::ExecutionError;
use crate::pipeflow::condition::{evaluate_route, parse_route};
use crate::pipeflow::pipeline::types::{NodeKind, PipelineEdge, PipelineNode};
use async_trait::async_trait;
use serde_json::json;

/// Evaluates the node's expression and picks the outgoing edges to follow
pub struct ConditionExecutor;

/// Edges whose label equals `label`, or the default edges when none does
pub fn select_routes(
    node_id: &str,
    outgoing: &[PipelineEdge],
    label: &str,
) -> Result<Vec<String>, ExecutionError> {
    let matching: Vec<String> = outgoing
        .iter()
        .filter(|e| !e.is_default() && e.label() == Some(label))
        .map(|e| e.id.clone())
        .collect();
    if !matching.is_empty() {
        return Ok(matching);
    }

    let defaults: Vec<String> = outgoing
        .iter()
        .filter(|e| e.is_default())
        .map(|e| e.id.clone())
        .collect();
    if defaults.is_empty() {
        return Err(ExecutionError::UnroutableCondition {
            node: node_id.to_string(),
            label: label.to_string(),
        });
    }
    Ok(defaults)
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        let NodeKind::Condition(cfg) = &node.kind else {
            return Err(ExecutionError::InvalidCondition {
                node: node.id.clone(),
                message: "not a condition node".to_string(),
            });
        };

        let route = parse_route(&cfg.condition).map_err(|e| ExecutionError::InvalidCondition {
            node: node.id.clone(),
            message: e.to_string(),
        })?;
        let label = evaluate_route(&route, &ctx.context);
        let routes = select_routes(&node.id, &ctx.outgoing, &label)?;

        log::debug!("Condition {} evaluated to '{}' -> {:?}", node.id, label, routes);

        Ok(NodeResult {
            output: Some(json!({ "result": label, "routes": routes })),
            routes,
            context: Vec::new(),
        })
    }
}
