// SPDX-License-Identifier: MIT

//! Pipeline registry
//!
//! Entry point for editors and schedulers: manages pipeline lifecycles,
//! admits runs and keeps the run counters. Runs are executed on their own
//! tokio task; [`RunTicket::wait`] joins one.

use crate::adk::agent::HttpAgentDispatcher;
use crate::adk::error::{EngineError, Result};
use crate::adk::notifier::LogNotifier;
use crate::pipeflow::config::EngineConfig;
use crate::pipeflow::coordinator::Coordinator;
use crate::pipeflow::events::{EventBus, PipelineEvent};
use crate::pipeflow::executor::Executors;
use crate::pipeflow::pipeline::graph::Graph;
use crate::pipeflow::pipeline::run::{LogLevel, NodeExecutionLog, PipelineRun, RunStatus};
use crate::pipeflow::pipeline::types::{
    OverlapPolicy, Pipeline, PipelineDefinition, PipelineStatus,
};
use crate::pipeflow::store::{MemoryStore, PipelineFilter, RunFilter, SqliteStore, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Pipelines per lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub draft: usize,
    pub active: usize,
    pub paused: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineList {
    pub pipelines: Vec<Pipeline>,
    /// Counts over every stored pipeline, regardless of the filter
    pub counts: StatusCounts,
}

/// A run together with its execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    pub run: PipelineRun,
    pub logs: Vec<NodeExecutionLog>,
}

/// Handle to an admitted run
pub struct RunTicket {
    pub run_id: String,
    handle: JoinHandle<Result<PipelineRun>>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<PipelineRun> {
        self.handle
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?
    }
}

/// A run's place in its pipeline's queue. The run may start once `ahead`
/// resolves; dropping the place lets the next run in.
struct LanePlace {
    ahead: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct PipelineRegistry {
    store: Arc<dyn Store>,
    coordinator: Arc<Coordinator>,
    /// Serializes the active-run check with the insert of the new run
    admission: Arc<Mutex<()>>,
    /// Tail of each pipeline's run queue
    lanes: Arc<Mutex<HashMap<String, oneshot::Receiver<()>>>>,
}

impl PipelineRegistry {
    pub fn new(store: Arc<dyn Store>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            store,
            coordinator,
            admission: Arc::new(Mutex::new(())),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire the default collaborators: SQLite when `database_url` is set,
    /// the in-memory store otherwise, and the HTTP agent dispatcher
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                log::info!("Using SQLite store at {}", url);
                Arc::new(SqliteStore::connect(url).await?)
            }
            None => {
                log::info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        let executors = Executors::new(
            Arc::new(HttpAgentDispatcher::new(config.agent_service_url.clone())),
            Arc::new(LogNotifier),
            config.agent_timeout(),
        );
        let events = Arc::new(EventBus::new(config.event_capacity));
        let coordinator = Coordinator::new(store.clone(), executors, events, config);
        Ok(Self::new(store, Arc::new(coordinator)))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Live run events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.coordinator.events().subscribe()
    }

    /// Cancel every run and refuse to start new ones
    pub fn shutdown(&self) {
        self.coordinator.cancel_all();
    }

    /// Store a new draft pipeline
    pub async fn create(&self, def: PipelineDefinition) -> Result<Pipeline> {
        let pipeline = Pipeline::from_definition(def);
        if self.store.get_pipeline(&pipeline.id).await?.is_some() {
            return Err(EngineError::PipelineExists(pipeline.id));
        }
        self.store.insert_pipeline(&pipeline).await?;
        log::info!("Created pipeline '{}' ({})", pipeline.name, pipeline.id);
        Ok(pipeline)
    }

    /// Replace a pipeline's definition. Active pipelines must stay valid.
    pub async fn update(&self, id: &str, def: PipelineDefinition) -> Result<Pipeline> {
        let mut pipeline = self.require(id).await?;
        pipeline.apply_definition(def);
        if pipeline.status == PipelineStatus::Active {
            Graph::from_pipeline(&pipeline).validate()?;
        }
        self.store.update_pipeline(&pipeline).await?;
        log::info!("Updated pipeline {}", id);
        Ok(pipeline)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _admit = self.admission.lock().await;
        if self.active_run(id).await?.is_some() {
            return Err(EngineError::RunInProgress(id.to_string()));
        }
        if !self.store.delete_pipeline(id).await? {
            return Err(EngineError::PipelineNotFound(id.to_string()));
        }
        self.lanes.lock().await.remove(id);
        log::info!("Deleted pipeline {}", id);
        Ok(())
    }

    /// Flip active and paused; drafts become active. Activation validates.
    pub async fn toggle(&self, id: &str) -> Result<Pipeline> {
        let mut pipeline = self.require(id).await?;
        pipeline.status = match pipeline.status {
            PipelineStatus::Active => PipelineStatus::Paused,
            PipelineStatus::Draft | PipelineStatus::Paused => {
                Graph::from_pipeline(&pipeline).validate()?;
                PipelineStatus::Active
            }
        };
        pipeline.updated_at = Utc::now();
        self.store.update_pipeline(&pipeline).await?;
        log::info!("Pipeline {} is now {}", id, pipeline.status);
        Ok(pipeline)
    }

    pub async fn get(&self, id: &str) -> Result<Pipeline> {
        self.require(id).await
    }

    pub async fn list(&self, filter: &PipelineFilter) -> Result<PipelineList> {
        let mut counts = StatusCounts::default();
        for pipeline in self.store.list_pipelines(&PipelineFilter::default()).await? {
            match pipeline.status {
                PipelineStatus::Draft => counts.draft += 1,
                PipelineStatus::Active => counts.active += 1,
                PipelineStatus::Paused => counts.paused += 1,
            }
        }
        let pipelines = self.store.list_pipelines(filter).await?;
        Ok(PipelineList { pipelines, counts })
    }

    /// Admit a run of an active pipeline and start it in the background
    pub async fn request_run(&self, id: &str, payload: Value) -> Result<RunTicket> {
        let _admit = self.admission.lock().await;

        let pipeline = self.require(id).await?;
        if pipeline.status != PipelineStatus::Active {
            return Err(EngineError::PipelineNotActive {
                id: id.to_string(),
                status: pipeline.status.to_string(),
            });
        }

        let exclusive = !pipeline.settings.allow_concurrent_runs;
        if exclusive && pipeline.settings.on_overlap == OverlapPolicy::Reject {
            if let Some(active) = self.active_run(id).await? {
                return Err(EngineError::RunAlreadyActive {
                    pipeline_id: id.to_string(),
                    run_id: active.id,
                });
            }
        }

        let run = PipelineRun::new(&pipeline, payload);
        self.store.insert_run(&run).await?;
        let token = self.coordinator.token_for(&run.id).await;
        let place = if exclusive {
            Some(self.join_lane(id).await)
        } else {
            None
        };
        log::info!("Admitted run {} of pipeline {}", run.id, id);

        let run_id = run.id.clone();
        let store = self.store.clone();
        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(async move {
            let mut place = place;
            let ahead = place.as_mut().and_then(|p| p.ahead.as_mut());
            // queued runs wait for the pipeline's previous run
            let skipped_turn = match ahead {
                Some(ahead) => tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = ahead => false,
                },
                None => false,
            };

            let outcome = async {
                let run = coordinator.execute(&pipeline, run).await?;
                let at = run.finished_at.unwrap_or_else(Utc::now);
                store
                    .record_run_outcome(&run.pipeline_id, run.status, at)
                    .await?;
                Ok::<_, EngineError>(run)
            }
            .await;

            // a run cancelled while queued still holds its place until the
            // runs ahead of it are done
            if skipped_turn {
                if let Some(ahead) = place.as_mut().and_then(|p| p.ahead.as_mut()) {
                    let _ = ahead.await;
                }
            }
            drop(place);
            outcome
        });

        Ok(RunTicket { run_id, handle })
    }

    /// Runs of a pipeline, newest first
    pub async fn get_runs(&self, pipeline_id: &str, filter: &RunFilter) -> Result<Vec<PipelineRun>> {
        self.require(pipeline_id).await?;
        Ok(self.store.list_runs(pipeline_id, filter).await?)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunDetails> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let logs = self.store.logs(run_id).await?;
        Ok(RunDetails { run, logs })
    }

    /// Cancel a pending or running run
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(EngineError::RunNotCancellable {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }

        if self.coordinator.cancel(run_id).await {
            log::info!("Cancellation requested for run {}", run_id);
            return Ok(());
        }

        // no task owns this run (left over from an earlier process)
        log::warn!("Run {} has no live task, marking it cancelled", run_id);
        let now = Utc::now();
        self.store
            .append_log(&NodeExecutionLog::new(
                run_id,
                None,
                LogLevel::Info,
                "Run cancelled",
            ))
            .await?;
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(now);
        self.store.update_run(&run).await?;
        self.store
            .record_run_outcome(&run.pipeline_id, RunStatus::Cancelled, now)
            .await?;
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<Pipeline> {
        self.store
            .get_pipeline(id)
            .await?
            .ok_or_else(|| EngineError::PipelineNotFound(id.to_string()))
    }

    /// Most recent pending or running run of a pipeline
    async fn active_run(&self, pipeline_id: &str) -> Result<Option<PipelineRun>> {
        for status in [RunStatus::Running, RunStatus::Pending] {
            let filter = RunFilter {
                status: Some(status),
                limit: Some(1),
            };
            if let Some(run) = self.store.list_runs(pipeline_id, &filter).await?.pop() {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    /// Queue behind the pipeline's latest exclusive run. Called under the
    /// admission lock, so places are handed out in request order.
    async fn join_lane(&self, pipeline_id: &str) -> LanePlace {
        let (done, tail) = oneshot::channel();
        let ahead = self.lanes.lock().await.insert(pipeline_id.to_string(), tail);
        LanePlace { ahead, _done: done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::agent::{AgentDispatcher, AgentRequest};
    use crate::adk::error::{DefinitionError, DispatchError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct SlowDispatcher(Duration);

    #[async_trait]
    impl AgentDispatcher for SlowDispatcher {
        async fn dispatch(&self, _request: AgentRequest) -> std::result::Result<Value, DispatchError> {
            tokio::time::sleep(self.0).await;
            Ok(json!({"done": true}))
        }
    }

    fn registry(delay: Duration) -> PipelineRegistry {
        let config = EngineConfig::default();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let executors = Executors::new(
            Arc::new(SlowDispatcher(delay)),
            Arc::new(LogNotifier),
            config.agent_timeout(),
        );
        let coordinator = Coordinator::new(store.clone(), executors, Arc::new(EventBus::default()), config);
        PipelineRegistry::new(store, Arc::new(coordinator))
    }

    fn queued_definition() -> PipelineDefinition {
        let mut def = definition();
        def.settings.on_overlap = OverlapPolicy::Queue;
        def
    }

    fn definition() -> PipelineDefinition {
        serde_json::from_value(json!({
            "name": "enrich",
            "nodes": [
                {"id": "T", "type": "trigger"},
                {"id": "A", "type": "agent", "config": {"agent_id": "enricher", "task": "enrich"}}
            ],
            "edges": [{"from": "T", "to": "A"}]
        }))
        .unwrap()
    }

    fn broken_definition() -> PipelineDefinition {
        serde_json::from_value(json!({
            "name": "broken",
            "nodes": [{"id": "A", "type": "agent", "config": {"agent_id": "x", "task": "y"}}],
            "edges": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_and_counts() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(definition()).await.unwrap();
        assert_eq!(p.status, PipelineStatus::Draft);
        registry.create(broken_definition()).await.unwrap();

        let p = registry.toggle(&p.id).await.unwrap();
        assert_eq!(p.status, PipelineStatus::Active);

        let list = registry.list(&PipelineFilter::default()).await.unwrap();
        assert_eq!(list.pipelines.len(), 2);
        assert_eq!(list.counts, StatusCounts { draft: 1, active: 1, paused: 0 });

        let active = registry
            .list(&PipelineFilter {
                status: Some(PipelineStatus::Active),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(active.pipelines.len(), 1);
        assert_eq!(active.counts.draft, 1);

        let p = registry.toggle(&p.id).await.unwrap();
        assert_eq!(p.status, PipelineStatus::Paused);
    }

    #[tokio::test]
    async fn test_create_with_taken_id_is_rejected() {
        let registry = registry(Duration::ZERO);
        let mut def = definition();
        def.id = Some("fixed".to_string());
        registry.create(def.clone()).await.unwrap();
        let err = registry.create(def).await.unwrap_err();
        assert!(matches!(err, EngineError::PipelineExists(id) if id == "fixed"));
    }

    #[tokio::test]
    async fn test_toggle_invalid_pipeline_is_rejected() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(broken_definition()).await.unwrap();
        let err = registry.toggle(&p.id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::GraphInvalid(DefinitionError::MissingTrigger)
        ));
        assert_eq!(registry.get(&p.id).await.unwrap().status, PipelineStatus::Draft);
    }

    #[tokio::test]
    async fn test_update_active_pipeline_must_validate() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(definition()).await.unwrap();
        registry.toggle(&p.id).await.unwrap();

        let err = registry.update(&p.id, broken_definition()).await.unwrap_err();
        assert!(matches!(err, EngineError::GraphInvalid(_)));
        assert_eq!(registry.get(&p.id).await.unwrap().name, "enrich");

        let mut def = definition();
        def.name = "enrich v2".to_string();
        let updated = registry.update(&p.id, def).await.unwrap();
        assert_eq!(updated.name, "enrich v2");
        assert_eq!(updated.status, PipelineStatus::Active);
    }

    #[tokio::test]
    async fn test_request_run_requires_active_pipeline() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(definition()).await.unwrap();
        let err = registry.request_run(&p.id, json!({})).await.err().unwrap();
        assert!(matches!(err, EngineError::PipelineNotActive { ref status, .. } if status == "draft"));

        let err = registry.request_run("missing", json!({})).await.err().unwrap();
        assert!(matches!(err, EngineError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_updates_counters() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(definition()).await.unwrap();
        registry.toggle(&p.id).await.unwrap();

        let run = registry
            .request_run(&p.id, json!({"id": 1}))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let p = registry.get(&p.id).await.unwrap();
        assert_eq!((p.run_count, p.success_count, p.error_count), (1, 1, 0));
        assert!(p.last_run.is_some());

        let details = registry.get_run(&run.id).await.unwrap();
        assert!(!details.logs.is_empty());
        let runs = registry.get_runs(&p.id, &RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_active_run_is_rejected() {
        let registry = registry(Duration::from_secs(5));
        let p = registry.create(definition()).await.unwrap();
        registry.toggle(&p.id).await.unwrap();

        let ticket = registry.request_run(&p.id, json!({})).await.unwrap();
        let err = registry.delete(&p.id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunInProgress(_)));

        registry.cancel_run(&ticket.run_id).await.unwrap();
        let run = ticket.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        let err = registry.cancel_run(&run.id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotCancellable { .. }));

        registry.delete(&p.id).await.unwrap();
        assert!(matches!(
            registry.get(&p.id).await.unwrap_err(),
            EngineError::PipelineNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_orphaned_run_marks_it_cancelled() {
        let registry = registry(Duration::ZERO);
        let p = registry.create(definition()).await.unwrap();
        let run = PipelineRun::new(&p, Value::Null);
        registry.store.insert_run(&run).await.unwrap();

        registry.cancel_run(&run.id).await.unwrap();

        let details = registry.get_run(&run.id).await.unwrap();
        assert_eq!(details.run.status, RunStatus::Cancelled);
        assert_eq!(details.logs.len(), 1);
        let p = registry.get(&p.id).await.unwrap();
        assert_eq!((p.run_count, p.cancelled_count), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_runs_start_in_request_order() {
        let registry = registry(Duration::from_millis(40));
        let p = registry.create(queued_definition()).await.unwrap();
        registry.toggle(&p.id).await.unwrap();

        let mut tickets = Vec::new();
        for i in 0..4 {
            tickets.push(registry.request_run(&p.id, json!({"n": i})).await.unwrap());
        }
        let mut runs = Vec::new();
        for ticket in tickets {
            runs.push(ticket.wait().await.unwrap());
        }

        for pair in runs.windows(2) {
            assert_eq!(pair[1].status, RunStatus::Completed);
            assert!(pair[1].started_at.unwrap() >= pair[0].finished_at.unwrap());
        }
        let p = registry.get(&p.id).await.unwrap();
        assert_eq!((p.run_count, p.success_count), (4, 4));
    }

    #[tokio::test]
    async fn test_cancelled_queued_run_keeps_later_runs_waiting() {
        let registry = registry(Duration::from_millis(200));
        let p = registry.create(queued_definition()).await.unwrap();
        registry.toggle(&p.id).await.unwrap();

        let first = registry.request_run(&p.id, json!({})).await.unwrap();
        let second = registry.request_run(&p.id, json!({})).await.unwrap();
        let third = registry.request_run(&p.id, json!({})).await.unwrap();

        registry.cancel_run(&second.run_id).await.unwrap();
        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        let third = third.wait().await.unwrap();

        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(second.status, RunStatus::Cancelled);
        assert!(second.started_at.is_none());
        assert_eq!(third.status, RunStatus::Completed);
        assert!(third.started_at.unwrap() >= first.finished_at.unwrap());
    }
}
