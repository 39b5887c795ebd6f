// SPDX-License-Identifier: MIT

//! Notification delivery for `notify` action nodes

use crate::adk::error::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub run_id: String,
    pub pipeline_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub message: String,
}

/// Delivers notifications raised by a run
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), DispatchError> {
        log::info!(
            "[notify:{}] run {} node {}: {}",
            notification.channel.as_deref().unwrap_or("default"),
            notification.run_id,
            notification.node_id,
            notification.message
        );
        Ok(())
    }
}
