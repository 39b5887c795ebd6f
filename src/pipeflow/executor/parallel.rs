// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::error::ExecutionError;
use crate::pipeflow::pipeline::types::PipelineNode;
use async_trait::async_trait;
use serde_json::json;

/// Fan-out marker. The coordinator starts every branch once it completes.
pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(
        &self,
        _node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        Ok(NodeResult::with_output(
            json!({ "branches": ctx.outgoing.len() }),
        ))
    }
}
