// SPDX-License-Identifier: MIT

use super::{NodeContext, NodeExecutor, NodeResult};
use crate::adk::error::ExecutionError;
use crate::adk::notifier::{Notification, Notifier};
use crate::pipeflow::pipeline::types::{ActionConfig, NodeKind, PipelineNode};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs the built-in side effects of `action` nodes
pub struct ActionExecutor {
    notifier: Arc<dyn Notifier>,
    client: Client,
}

impl ActionExecutor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            client: Client::new(),
        }
    }

    async fn notify(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
        channel: &Option<String>,
        message: &str,
    ) -> Result<NodeResult, ExecutionError> {
        let notification = Notification {
            run_id: ctx.run_id.clone(),
            pipeline_id: ctx.pipeline_id.clone(),
            node_id: node.id.clone(),
            channel: channel.clone(),
            message: ctx.context.render(message),
        };
        self.notifier
            .notify(&notification)
            .await
            .map_err(|e| ExecutionError::Action(e.to_string()))?;

        Ok(NodeResult::with_output(json!({
            "sent": true,
            "channel": notification.channel,
            "message": notification.message,
        })))
    }

    async fn webhook(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
        body: &Option<Value>,
    ) -> Result<NodeResult, ExecutionError> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ExecutionError::Action(format!("invalid HTTP method '{}'", method)))?;
        let url = ctx.context.render(url);
        let body = body.clone().unwrap_or_else(|| {
            json!({
                "run_id": ctx.run_id,
                "pipeline_id": ctx.pipeline_id,
                "node_id": node.id,
                "context": ctx.context.to_json(),
            })
        });

        let mut request = self.client.request(method, &url).json(&body);
        for (name, value) in headers {
            request = request.header(name.as_str(), ctx.context.render(value));
        }

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            response = request.send() => {
                response.map_err(|e| ExecutionError::Action(format!("{} {}: {}", node.id, url, e)))?
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutionError::Action(e.to_string()))?;
        if !status.is_success() {
            return Err(ExecutionError::Action(format!(
                "webhook {} returned status {}: {}",
                url,
                status.as_u16(),
                text
            )));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(NodeResult::with_output(json!({
            "status": status.as_u16(),
            "body": body,
        })))
    }

    fn set_context(values: &Map<String, Value>) -> NodeResult {
        NodeResult {
            output: Some(Value::Object(values.clone())),
            routes: Vec::new(),
            context: values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecutionError> {
        let NodeKind::Action(action) = &node.kind else {
            return Err(ExecutionError::Action(format!(
                "node '{}' is not an action node",
                node.id
            )));
        };

        match action {
            ActionConfig::Notify { channel, message } => {
                self.notify(node, ctx, channel, message).await
            }
            ActionConfig::Webhook {
                url,
                method,
                headers,
                body,
            } => self.webhook(node, ctx, url, method, headers, body).await,
            ActionConfig::SetContext { values } => Ok(Self::set_context(values)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::error::DispatchError;
    use crate::pipeflow::context::RunContext;
    use crate::pipeflow::executor::test_support::node_context;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::rejected("channel offline"));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn action(id: &str, config: ActionConfig) -> PipelineNode {
        PipelineNode::new(id, NodeKind::Action(config))
    }

    #[tokio::test]
    async fn test_notify_renders_message() {
        let notifier = Arc::new(RecordingNotifier::default());
        let exec = ActionExecutor::new(notifier.clone());
        let mut context = RunContext::new();
        context.append("A", json!({"score": 0.8}), Some("A"));
        let ctx = node_context(vec![], context);

        let node = action(
            "N",
            ActionConfig::Notify {
                channel: Some("sales".to_string()),
                message: "Lead scored {{A.score}}".to_string(),
            },
        );
        let result = exec.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.output.unwrap()["message"], "Lead scored 0.8");

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel.as_deref(), Some("sales"));
        assert_eq!(sent[0].node_id, "N");
        assert_eq!(sent[0].run_id, "run-1");
    }

    #[tokio::test]
    async fn test_notify_failure_is_retryable_action_error() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let exec = ActionExecutor::new(notifier);
        let ctx = node_context(vec![], RunContext::new());
        let node = action(
            "N",
            ActionConfig::Notify {
                channel: None,
                message: "hi".to_string(),
            },
        );

        let err = exec.execute(&node, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Action(ref m) if m.contains("channel offline")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_set_context_writes_values() {
        let exec = ActionExecutor::new(Arc::new(RecordingNotifier::default()));
        let ctx = node_context(vec![], RunContext::new());
        let mut values = Map::new();
        values.insert("stage".to_string(), json!("qualified"));
        values.insert("priority".to_string(), json!(2));

        let node = action("S", ActionConfig::SetContext { values });
        let result = exec.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.context.len(), 2);
        assert!(result
            .context
            .contains(&("stage".to_string(), json!("qualified"))));
        assert_eq!(result.output.unwrap()["priority"], 2);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_method() {
        let exec = ActionExecutor::new(Arc::new(RecordingNotifier::default()));
        let ctx = node_context(vec![], RunContext::new());
        let node = action(
            "W",
            ActionConfig::Webhook {
                url: "http://127.0.0.1:9/hook".to_string(),
                method: "NOT A METHOD".to_string(),
                headers: BTreeMap::new(),
                body: None,
            },
        );

        let err = exec.execute(&node, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Action(ref m) if m.contains("invalid HTTP method")));
    }

    #[tokio::test]
    async fn test_webhook_is_cancellable() {
        let exec = ActionExecutor::new(Arc::new(RecordingNotifier::default()));
        let ctx = node_context(vec![], RunContext::new());
        ctx.cancel.cancel();
        let node = action(
            "W",
            ActionConfig::Webhook {
                url: "http://127.0.0.1:9/hook".to_string(),
                method: "post".to_string(),
                headers: BTreeMap::new(),
                body: Some(json!({"ping": true})),
            },
        );

        let err = exec.execute(&node, &ctx).await.unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }
}
