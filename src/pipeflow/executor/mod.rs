// SPDX-License-Identifier: MIT

//! Node executors: one strategy per node type
//!
//! Executors never touch the store. They receive an immutable snapshot of
//! the run context and a cancellation token, and report a [`NodeResult`]
//! that the coordinator records.

mod action;
mod agent;
mod condition;
mod delay;
mod parallel;
mod trigger;

pub use action::ActionExecutor;
pub use agent::AgentExecutor;
pub use condition::{select_routes, ConditionExecutor};
pub use delay::DelayExecutor;
pub use parallel::ParallelExecutor;
pub use trigger::TriggerExecutor;

use crate::adk::agent::AgentDispatcher;
use crate::adk::error::ExecutionError;
use crate::adk::notifier::Notifier;
use crate::pipeflow::context::RunContext;
use crate::pipeflow::pipeline::types::{NodeType, PipelineEdge, PipelineNode};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an executor may read while running one node
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub pipeline_id: String,
    /// 1 on the first attempt
    pub attempt: u32,
    pub context: Arc<RunContext>,
    pub trigger_payload: Arc<Value>,
    /// Outgoing edges of the node, used by condition routing
    pub outgoing: Vec<PipelineEdge>,
    pub cancel: CancellationToken,
}

/// Outcome of a successful node execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
    /// Appended to the run context under the node id
    pub output: Option<Value>,
    /// Edge ids chosen by a condition node
    pub routes: Vec<String>,
    /// Extra top-level context writes
    pub context: Vec<(String, Value)>,
}

impl NodeResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError>;
}

/// Executor lookup by node type
#[derive(Clone)]
pub struct Executors {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl Executors {
    /// The built-in executors wired to the given collaborators
    pub fn new(
        dispatcher: Arc<dyn AgentDispatcher>,
        notifier: Arc<dyn Notifier>,
        agent_timeout: Duration,
    ) -> Self {
        let mut executors: HashMap<NodeType, Arc<dyn NodeExecutor>> = HashMap::new();
        executors.insert(NodeType::Trigger, Arc::new(TriggerExecutor));
        executors.insert(
            NodeType::Agent,
            Arc::new(AgentExecutor::new(dispatcher, agent_timeout)),
        );
        executors.insert(NodeType::Condition, Arc::new(ConditionExecutor));
        executors.insert(NodeType::Action, Arc::new(ActionExecutor::new(notifier)));
        executors.insert(NodeType::Parallel, Arc::new(ParallelExecutor));
        executors.insert(NodeType::Delay, Arc::new(DelayExecutor));
        Self { executors }
    }

    /// Replace the executor for one node type
    pub fn with(mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.insert(node_type, executor);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }
}
