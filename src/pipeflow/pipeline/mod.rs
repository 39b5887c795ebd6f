// SPDX-License-Identifier: MIT

pub mod graph;
pub mod loader;
pub mod run;
pub mod types;

pub use graph::Graph;
pub use loader::PipelineLoader;
pub use run::{LogLevel, NodeExecutionLog, NodeRecord, NodeState, NodeStates, PipelineRun, RunStatus};
pub use types::{
    NodeKind, NodeType, Pipeline, PipelineDefinition, PipelineEdge, PipelineNode,
    PipelineSettings, PipelineStatus, RetryPolicy,
};
