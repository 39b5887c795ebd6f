// SPDX-License-Identifier: MIT

//! Agent dispatch
//!
//! The engine never runs an agent itself. Agent nodes hand a task to an
//! [`AgentDispatcher`] and wait for its answer; the default implementation
//! talks to the agent service over HTTP.

use crate::adk::error::DispatchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task handed to the agent service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub task: String,
    /// Snapshot of the run context, latest value per key
    pub context: Value,
}

/// Dispatches a task to an agent and returns its result
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: AgentRequest) -> Result<Value, DispatchError>;
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Dispatcher that POSTs tasks to `{base_url}/agents/{agent_id}/tasks`
pub struct HttpAgentDispatcher {
    client: Client,
    base_url: String,
}

impl HttpAgentDispatcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn task_url(&self, agent_id: &str) -> String {
        format!("{}/agents/{}/tasks", self.base_url, agent_id)
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(&self, request: AgentRequest) -> Result<Value, DispatchError> {
        let url = self.task_url(&request.agent_id);
        log::debug!("Dispatching node {} to {}", request.node_id, url);

        let resp = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                service: "agent service".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp.json().await?;
        match serde_json::from_value::<AgentResponse>(body.clone()) {
            Ok(AgentResponse {
                error: Some(error), ..
            }) => Err(DispatchError::rejected(error)),
            Ok(AgentResponse {
                result: Some(result),
                ..
            }) => Ok(result),
            _ => Ok(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_url_trims_trailing_slash() {
        let dispatcher = HttpAgentDispatcher::new("http://agents.local:8000/");
        assert_eq!(
            dispatcher.task_url("researcher"),
            "http://agents.local:8000/agents/researcher/tasks"
        );
    }

    #[test]
    fn test_agent_request_serializes_context() {
        let request = AgentRequest {
            run_id: "run-1".to_string(),
            node_id: "A".to_string(),
            agent_id: "scorer".to_string(),
            task: "score the input".to_string(),
            context: serde_json::json!({"trigger": {"text": "hi"}}),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["agent_id"], "scorer");
        assert_eq!(json["context"]["trigger"]["text"], "hi");
    }
}
