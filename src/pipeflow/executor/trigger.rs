// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::error::ExecutionError;
use crate::pipeflow::pipeline::types::PipelineNode;
use async_trait::async_trait;

/// Completes at once; its output is the run's trigger payload
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    async fn execute(
        &self,
        _node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        Ok(NodeResult::with_output(ctx.trigger_payload.as_ref().clone()))
    }
}
