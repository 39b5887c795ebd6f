// SPDX-License-Identifier: MIT

//! SQLite persistence for pipelines, runs and run logs
//!
//! Pipeline definitions and run records are stored as JSON documents next to
//! the columns that queries filter on. Counters live in their own columns so
//! they can be bumped in a single statement.

use super::{PipelineFilter, RunFilter, Store};
use crate::adk::error::StoreError;
use crate::pipeflow::pipeline::run::{LogLevel, NodeExecutionLog, PipelineRun, RunStatus};
use crate::pipeflow::pipeline::types::Pipeline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and initialize the schema
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = if url.contains(":memory:") {
            // every connection to :memory: is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Safe to call multiple times
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                definition TEXT NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                cancelled_count INTEGER NOT NULL DEFAULT 0,
                last_run TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_id, status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                node_id TEXT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn pipeline_from_row(row: &SqliteRow) -> Result<Pipeline, StoreError> {
        let definition: String = row.try_get("definition")?;
        let mut pipeline: Pipeline = serde_json::from_str(&definition)?;
        pipeline.run_count = count(row, "run_count")?;
        pipeline.success_count = count(row, "success_count")?;
        pipeline.error_count = count(row, "error_count")?;
        pipeline.cancelled_count = count(row, "cancelled_count")?;
        let last_run: Option<String> = row.try_get("last_run")?;
        pipeline.last_run = last_run.as_deref().map(parse_timestamp).transpose()?;
        Ok(pipeline)
    }

    fn run_from_row(row: &SqliteRow) -> Result<PipelineRun, StoreError> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn count(row: &SqliteRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

/// SQLite treats a negative LIMIT as unbounded
fn limit(value: Option<usize>) -> i64 {
    value.map(|l| l as i64).unwrap_or(-1)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let definition = serde_json::to_string(pipeline)?;
        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, status, definition, run_count, success_count,
                                   error_count, cancelled_count, last_run, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pipeline.id)
        .bind(&pipeline.name)
        .bind(pipeline.status.as_str())
        .bind(&definition)
        .bind(pipeline.run_count as i64)
        .bind(pipeline.success_count as i64)
        .bind(pipeline.error_count as i64)
        .bind(pipeline.cancelled_count as i64)
        .bind(pipeline.last_run.map(|t| t.to_rfc3339()))
        .bind(pipeline.created_at.to_rfc3339())
        .bind(pipeline.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let definition = serde_json::to_string(pipeline)?;
        let result = sqlx::query(
            "UPDATE pipelines SET name = ?, status = ?, definition = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&pipeline.name)
        .bind(pipeline.status.as_str())
        .bind(&definition)
        .bind(pipeline.updated_at.to_rfc3339())
        .bind(&pipeline.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PipelineNotFound(pipeline.id.clone()));
        }
        Ok(())
    }

    async fn delete_pipeline(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>, StoreError> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pipelines
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::pipeline_from_row).collect()
    }

    async fn record_run_outcome(
        &self,
        pipeline_id: &str,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (success, error, cancelled) = match status {
            RunStatus::Completed => (1i64, 0i64, 0i64),
            RunStatus::Failed => (0, 1, 0),
            RunStatus::Cancelled => (0, 0, 1),
            other => {
                return Err(StoreError::Corrupt(format!(
                    "run outcome must be terminal, got {}",
                    other
                )))
            }
        };

        let result = sqlx::query(
            r#"
            UPDATE pipelines SET
                run_count = run_count + 1,
                success_count = success_count + ?,
                error_count = error_count + ?,
                cancelled_count = cancelled_count + ?,
                last_run = ?
            WHERE id = ?
            "#,
        )
        .bind(success)
        .bind(error)
        .bind(cancelled)
        .bind(at.to_rfc3339())
        .bind(pipeline_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PipelineNotFound(pipeline_id.to_string()));
        }
        Ok(())
    }

    async fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let body = serde_json::to_string(run)?;
        sqlx::query("INSERT INTO runs (id, pipeline_id, status, body) VALUES (?, ?, ?, ?)")
            .bind(&run.id)
            .bind(&run.pipeline_id)
            .bind(run.status.as_str())
            .bind(&body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let body = serde_json::to_string(run)?;
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?, body = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(run.status.as_str())
        .bind(&body)
        .bind(&run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT status FROM runs WHERE id = ?")
            .bind(&run.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::TerminalRun(run.id.clone())),
            None => Err(StoreError::RunNotFound(run.id.clone())),
        }
    }

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>, StoreError> {
        let row = sqlx::query("SELECT body FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(
        &self,
        pipeline_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM runs
            WHERE pipeline_id = ?1 AND (?2 IS NULL OR status = ?2)
            ORDER BY rowid DESC
            LIMIT ?3
            "#,
        )
        .bind(pipeline_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn append_log(&self, entry: &NodeExecutionLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run_logs (run_id, node_id, level, message, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.run_id)
        .bind(entry.node_id.as_deref())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn logs(&self, run_id: &str) -> Result<Vec<NodeExecutionLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, node_id, level, message, timestamp FROM run_logs WHERE run_id = ? ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<NodeExecutionLog, StoreError> {
                let level: String = row.try_get("level")?;
                let timestamp: String = row.try_get("timestamp")?;
                Ok(NodeExecutionLog {
                    run_id: row.try_get("run_id")?,
                    node_id: row.try_get("node_id")?,
                    level: LogLevel::parse(&level)
                        .ok_or_else(|| StoreError::Corrupt(format!("log level '{}'", level)))?,
                    message: row.try_get("message")?,
                    timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }
}
