// SPDX-License-Identifier: MIT

//! Run state store
//!
//! The store is the single source of truth for pipelines, runs and run
//! logs. Two backends are provided:
//! - [`MemoryStore`] - process-local, used by tests and one-shot CLI runs
//! - [`SqliteStore`] - durable, backed by sqlx
//!
//! Both enforce the same rules: a terminal run is never modified again, and
//! pipeline counters only change through [`Store::record_run_outcome`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::adk::error::StoreError;
use crate::pipeflow::pipeline::run::{NodeExecutionLog, PipelineRun, RunStatus};
use crate::pipeflow::pipeline::types::{Pipeline, PipelineStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineFilter {
    pub status: Option<PipelineStatus>,
    pub limit: Option<usize>,
}

/// Run listing filter; results are newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    /// Replace definition and status. Counters are left untouched.
    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    /// Returns false when the pipeline did not exist
    async fn delete_pipeline(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>, StoreError>;

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>, StoreError>;

    /// Count a terminal run: `run_count` plus exactly one outcome counter
    async fn record_run_outcome(
        &self,
        pipeline_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Replace a run record. Fails with `TerminalRun` if the stored run is
    /// already terminal.
    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError>;

    async fn list_runs(
        &self,
        pipeline_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, StoreError>;

    async fn append_log(&self, entry: &NodeExecutionLog) -> Result<(), StoreError>;

    /// Logs of a run in append order
    async fn logs(&self, run_id: &str) -> Result<Vec<NodeExecutionLog>, StoreError>;
}
