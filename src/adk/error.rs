// SPDX-License-Identifier: MIT

//! Typed error handling for pipeflow-rs
//!
//! Errors are split by where they surface:
//! - [`DefinitionError`] - structural problems found while validating a pipeline
//! - [`ExecutionError`] - failures of a single node during a run
//! - [`EngineError`] - coordination failures returned by the registry
//! - [`StoreError`] - persistence failures

use std::time::Duration;
use thiserror::Error;

/// Result alias used by the registry and coordinator
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for pipeflow-rs
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pipeline graph failed validation
    #[error("Pipeline graph is invalid: {0}")]
    GraphInvalid(#[from] DefinitionError),

    /// A run is already pending or running for this pipeline
    #[error("Pipeline '{pipeline_id}' already has an active run ({run_id})")]
    RunAlreadyActive { pipeline_id: String, run_id: String },

    /// Runs can only be requested for active pipelines
    #[error("Pipeline '{id}' is {status}, not active")]
    PipelineNotActive { id: String, status: String },

    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("Pipeline '{0}' already exists")]
    PipelineExists(String),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// The pipeline cannot be deleted while a run is pending or running
    #[error("Pipeline '{0}' has a run in progress")]
    RunInProgress(String),

    /// Only pending and running runs can be cancelled
    #[error("Run '{run_id}' is {status} and cannot be cancelled")]
    RunNotCancellable { run_id: String, status: String },

    /// Configuration errors (bad config file, invalid env override)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A spawned run task panicked or was aborted
    #[error("Run task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Structural violations reported by graph validation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("Duplicate edge id '{0}'")]
    DuplicateEdge(String),

    /// An edge points at a node that does not exist
    #[error("Edge '{edge}' references unknown node '{node}'")]
    DanglingEdge { edge: String, node: String },

    #[error("Pipeline has no trigger node")]
    MissingTrigger,

    #[error("Pipeline has more than one trigger node: {0:?}")]
    MultipleTriggers(Vec<String>),

    #[error("Trigger node '{0}' must not have incoming edges")]
    TriggerHasIncomingEdge(String),

    /// Cycle through edges that do not originate at a condition node
    #[error("Cycle detected through nodes: {0:?}")]
    Cycle(Vec<String>),

    #[error("Node '{0}' is not reachable from the trigger")]
    UnreachableNode(String),

    #[error("Condition node '{node}' has several edges labelled '{label}' and no default edge")]
    AmbiguousConditionRouting { node: String, label: String },

    #[error("Invalid configuration for node '{node}': {message}")]
    InvalidNodeConfig { node: String, message: String },
}

/// Failure of a single node execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Agent '{agent_id}' did not answer within {timeout:?}")]
    AgentTimeout { agent_id: String, timeout: Duration },

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("Action failed: {0}")]
    Action(String),

    /// No outgoing edge matches the evaluated label and there is no default
    #[error("Condition node '{node}' produced label '{label}' with no matching edge")]
    UnroutableCondition { node: String, label: String },

    #[error("Condition on node '{node}' could not be evaluated: {message}")]
    InvalidCondition { node: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Loop edge '{edge}' exceeded {limit} iterations")]
    LoopLimitExceeded { edge: String, limit: u32 },

    #[error("Run exceeded its timeout of {0:?}")]
    RunTimeout(Duration),

    /// The node task panicked or was aborted
    #[error("Node task failed: {0}")]
    TaskFailed(String),
}

impl ExecutionError {
    /// Whether a node retry policy may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::AgentTimeout { .. }
                | ExecutionError::AgentExecution(_)
                | ExecutionError::Action(_)
        )
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Pipeline '{0}' not found in store")]
    PipelineNotFound(String),

    #[error("Run '{0}' not found in store")]
    RunNotFound(String),

    /// Terminal runs are immutable
    #[error("Run '{0}' is terminal and cannot be modified")]
    TerminalRun(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

/// Errors raised by external collaborators (agent service, notifier)
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Condition expression syntax errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("Could not parse condition: {0}")]
    Syntax(String),

    #[error("Could not parse literal: {0}")]
    Literal(String),
}

impl EngineError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl DefinitionError {
    /// Create an invalid node configuration error
    pub fn invalid_config(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidNodeConfig {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl DispatchError {
    /// Create a rejection error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}
