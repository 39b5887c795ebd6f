// SPDX-License-Identifier: MIT

//! Live run events for observers such as a dashboard

use crate::pipeflow::pipeline::run::RunStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline_id: String,
    },
    NodeStarted {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeCompleted {
        run_id: String,
        node_id: String,
    },
    NodeFailed {
        run_id: String,
        node_id: String,
        error: String,
    },
    NodeSkipped {
        run_id: String,
        node_id: String,
    },
    NodeRetrying {
        run_id: String,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    RunFinished {
        run_id: String,
        pipeline_id: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::NodeStarted { run_id, .. }
            | PipelineEvent::NodeCompleted { run_id, .. }
            | PipelineEvent::NodeFailed { run_id, .. }
            | PipelineEvent::NodeSkipped { run_id, .. }
            | PipelineEvent::NodeRetrying { run_id, .. }
            | PipelineEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Event bus using a tokio broadcast channel.
/// All subscribers receive all events; slow subscribers may lag.
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
