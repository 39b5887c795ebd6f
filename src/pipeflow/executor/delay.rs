// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::error::ExecutionError;
use crate::pipeflow::pipeline::types::{NodeKind, PipelineNode};
use async_trait::async_trait;
use serde_json::json;

/// Sleeps for the configured duration; cancellation ends the sleep early
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        let NodeKind::Delay(cfg) = &node.kind else {
            return Err(ExecutionError::Action(format!(
                "node '{}' is not a delay node",
                node.id
            )));
        };

        let Some(wait) = cfg.duration() else {
            return Err(ExecutionError::Action(format!(
                "node '{}' has an invalid delay of {}s",
                node.id, cfg.seconds
            )));
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(wait) => {
                Ok(NodeResult::with_output(json!({ "waited_secs": cfg.seconds })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeflow::context::RunContext;
    use crate::pipeflow::executor::test_support::node_context;
    use crate::pipeflow::pipeline::types::DelayConfig;
    use std::time::{Duration, Instant};

    fn delay(seconds: f64) -> PipelineNode {
        PipelineNode::new("wait", NodeKind::Delay(DelayConfig { seconds }))
    }

    #[tokio::test]
    async fn test_delay_completes() {
        let ctx = node_context(vec![], RunContext::new());
        let result = DelayExecutor.execute(&delay(0.01), &ctx).await.unwrap();
        assert_eq!(result.output, Some(json!({"waited_secs": 0.01})));
    }

    #[tokio::test]
    async fn test_delay_is_cancellable() {
        let ctx = node_context(vec![], RunContext::new());
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = Instant::now();
        let result = DelayExecutor.execute(&delay(5.0), &ctx).await;
        assert_eq!(result, Err(ExecutionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
