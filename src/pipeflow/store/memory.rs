// SPDX-License-Identifier: MIT

use super::{PipelineFilter, RunFilter, Store};
use crate::adk::error::StoreError;
use crate::pipeflow::pipeline::run::{NodeExecutionLog, PipelineRun, RunStatus};
use crate::pipeflow::pipeline::types::Pipeline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    pipelines: HashMap<String, Pipeline>,
    pipeline_order: Vec<String>,
    runs: HashMap<String, PipelineRun>,
    run_order: Vec<String>,
    logs: HashMap<String, Vec<NodeExecutionLog>>,
}

/// In-process store guarded by a single lock
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .pipelines
            .insert(pipeline.id.clone(), pipeline.clone())
            .is_none()
        {
            inner.pipeline_order.push(pipeline.id.clone());
        }
        Ok(())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .pipelines
            .get_mut(&pipeline.id)
            .ok_or_else(|| StoreError::PipelineNotFound(pipeline.id.clone()))?;
        stored.name = pipeline.name.clone();
        stored.description = pipeline.description.clone();
        stored.status = pipeline.status;
        stored.nodes = pipeline.nodes.clone();
        stored.edges = pipeline.edges.clone();
        stored.settings = pipeline.settings.clone();
        stored.updated_at = pipeline.updated_at;
        Ok(())
    }

    async fn delete_pipeline(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let existed = inner.pipelines.remove(id).is_some();
        inner.pipeline_order.retain(|p| p != id);
        Ok(existed)
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.inner.read().await.pipelines.get(id).cloned())
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pipeline_order
            .iter()
            .rev()
            .filter_map(|id| inner.pipelines.get(id))
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn record_run_outcome(
        &self,
        pipeline_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pipeline = inner
            .pipelines
            .get_mut(pipeline_id)
            .ok_or_else(|| StoreError::PipelineNotFound(pipeline_id.to_string()))?;
        match status {
            RunStatus::Completed => pipeline.success_count += 1,
            RunStatus::Failed => pipeline.error_count += 1,
            RunStatus::Cancelled => pipeline.cancelled_count += 1,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "run outcome must be terminal, got {}",
                    other
                )))
            }
        }
        pipeline.run_count += 1;
        pipeline.last_run = Some(at);
        Ok(())
    }

    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.runs.insert(run.id.clone(), run.clone()).is_none() {
            inner.run_order.push(run.id.clone());
        }
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::RunNotFound(run.id.clone()))?;
        if stored.status.is_terminal() {
            return Err(StoreError::TerminalRun(run.id.clone()));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.inner.read().await.runs.get(id).cloned())
    }

    async fn list_runs(
        &self,
        pipeline_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_order
            .iter()
            .rev()
            .filter_map(|id| inner.runs.get(id))
            .filter(|r| r.pipeline_id == pipeline_id)
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &NodeExecutionLog) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .logs
            .entry(entry.run_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn logs(&self, run_id: &str) -> Result<Vec<NodeExecutionLog>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .logs
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
