// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::agent::{AgentDispatcher, AgentRequest};
use crate::adk::error::ExecutionError;
use crate::pipeflow::pipeline::types::{NodeKind, PipelineNode};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hands the node's task to the agent service and waits for the result
pub struct AgentExecutor {
    dispatcher: Arc<dyn AgentDispatcher>,
    default_timeout: Duration,
}

impl AgentExecutor {
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>, default_timeout: Duration) -> Self {
        Self {
            dispatcher,
            default_timeout,
        }
    }
}

/// Agents often answer with JSON encoded in a string; store it structured
fn normalize_output(value: Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => Value::String(s),
        },
        other => other,
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        let NodeKind::Agent(cfg) = &node.kind else {
            return Err(ExecutionError::AgentExecution(format!(
                "node '{}' is not an agent node",
                node.id
            )));
        };

        let timeout = cfg
            .timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.default_timeout);

        let request = AgentRequest {
            run_id: ctx.run_id.clone(),
            node_id: node.id.clone(),
            agent_id: cfg.agent_id.clone(),
            task: ctx.context.render(&cfg.task),
            context: ctx.context.to_json(),
        };

        log::debug!(
            "Dispatching node {} to agent {} (attempt {})",
            node.id,
            cfg.agent_id,
            ctx.attempt
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled),
            outcome = tokio::time::timeout(timeout, self.dispatcher.dispatch(request)) => {
                match outcome {
                    Err(_) => Err(ExecutionError::AgentTimeout {
                        agent_id: cfg.agent_id.clone(),
                        timeout,
                    }),
                    Ok(Err(e)) => Err(ExecutionError::AgentExecution(e.to_string())),
                    Ok(Ok(value)) => Ok(NodeResult::with_output(normalize_output(value))),
                }
            }
        }
    }
}
