// SPDX-License-Identifier: MIT

//! Run coordinator
//!
//! Drives one run over its pipeline graph. The coordinator task owns the
//! run record and the run context; node executors run as spawned tasks and
//! only see an immutable snapshot of the context. Each completion is folded
//! into the run before readiness is computed again, so a node's output is
//! always visible to the nodes it unblocks.
//!
//! Every run gets a child of the coordinator's root cancellation token, and
//! every node attempt a child of its run's token.

use crate::adk::error::{EngineError, ExecutionError, Result};
use crate::pipeflow::config::EngineConfig;
use crate::pipeflow::context::RunContext;
use crate::pipeflow::events::{EventBus, PipelineEvent};
use crate::pipeflow::executor::{Executors, NodeContext, NodeResult};
use crate::pipeflow::pipeline::graph::Graph;
use crate::pipeflow::pipeline::run::{
    LogLevel, NodeExecutionLog, NodeRecord, NodeState, PipelineRun, RunStatus,
};
use crate::pipeflow::pipeline::types::Pipeline;
use crate::pipeflow::store::Store;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type NodeOutcome = std::result::Result<NodeResult, ExecutionError>;
type Finished = (String, std::result::Result<NodeOutcome, JoinError>);
/// Sync so the driver can be borrowed across awaits inside a spawned run
type InFlight = Pin<Box<dyn Future<Output = Finished> + Send + Sync>>;

pub struct Coordinator {
    store: Arc<dyn Store>,
    executors: Executors,
    events: Arc<EventBus>,
    config: EngineConfig,
    root: CancellationToken,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        executors: Executors,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            events,
            config,
            root: CancellationToken::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancellation token of a run, created on first use
    pub async fn token_for(&self, run_id: &str) -> CancellationToken {
        let mut active = self.active.lock().await;
        active
            .entry(run_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// Request cancellation of a run. Returns false when the run has no token.
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.active.lock().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every current and future run of this coordinator
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// Ids of runs that hold a cancellation token
    pub async fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forget a run's token once it can no longer be cancelled
    pub async fn release(&self, run_id: &str) {
        self.active.lock().await.remove(run_id);
    }

    /// Execute a stored run to a terminal state and return the final record
    pub async fn execute(&self, pipeline: &Pipeline, run: PipelineRun) -> Result<PipelineRun> {
        let run_id = run.id.clone();
        let token = self.token_for(&run_id).await;

        let mut driver = RunDriver::new(self, pipeline, run, token);
        let mut outcome = driver.drive().await;
        if let Err(e) = &outcome {
            let reason = e.to_string();
            outcome = if driver.run.status.is_terminal() {
                // the final state was decided but not stored
                driver.save().await.map(|_| driver.emit_finished())
            } else {
                driver.abandon(reason).await
            };
        }
        let run = driver.run.clone();
        drop(driver);

        self.release(&run_id).await;
        outcome.map(|_| run)
    }
}

/// Why scheduling stopped before every node settled
enum Stop {
    Failed(String),
    Cancelled,
    TimedOut(Duration),
}

/// State of one run while it is being driven
struct RunDriver<'a> {
    coordinator: &'a Coordinator,
    pipeline: &'a Pipeline,
    graph: Graph,
    run: PipelineRun,
    context: RunContext,
    token: CancellationToken,
    in_flight: FuturesUnordered<InFlight>,
    node_tokens: HashMap<String, CancellationToken>,
    aborts: HashMap<String, AbortHandle>,
    loop_counts: HashMap<String, u32>,
    /// Loop targets waiting for in-flight nodes to drain
    rearm: Vec<String>,
}

impl<'a> RunDriver<'a> {
    fn new(
        coordinator: &'a Coordinator,
        pipeline: &'a Pipeline,
        run: PipelineRun,
        token: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            pipeline,
            graph: Graph::from_pipeline(pipeline),
            run,
            context: RunContext::new(),
            token,
            in_flight: FuturesUnordered::new(),
            node_tokens: HashMap::new(),
            aborts: HashMap::new(),
            loop_counts: HashMap::new(),
            rearm: Vec::new(),
        }
    }

    fn store(&self) -> &dyn Store {
        self.coordinator.store.as_ref()
    }

    fn emit(&self, event: PipelineEvent) {
        self.coordinator.events.publish(event);
    }

    async fn save(&self) -> Result<()> {
        self.store().update_run(&self.run).await?;
        Ok(())
    }

    /// Write to the process log and the run's stored log. A failed append
    /// is reported but does not stop the run.
    async fn log(&self, level: LogLevel, node_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => log::info!("[run {}] {}", self.run.id, message),
            LogLevel::Warn => log::warn!("[run {}] {}", self.run.id, message),
            LogLevel::Error => log::error!("[run {}] {}", self.run.id, message),
        }
        let entry = NodeExecutionLog::new(&self.run.id, node_id, level, message);
        if let Err(e) = self.store().append_log(&entry).await {
            log::warn!("[run {}] could not store log entry: {}", self.run.id, e);
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if self.token.is_cancelled() {
            self.log(LogLevel::Info, None, "Run cancelled before start").await;
            return self.finish(RunStatus::Cancelled, None).await;
        }

        if let Err(e) = self.graph.validate() {
            let message = EngineError::GraphInvalid(e).to_string();
            self.log(LogLevel::Error, None, message.clone()).await;
            return self.finish(RunStatus::Failed, Some(message)).await;
        }

        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        self.save().await?;
        self.log(
            LogLevel::Info,
            None,
            format!("Run started for pipeline '{}'", self.pipeline.name),
        )
        .await;
        self.emit(PipelineEvent::RunStarted {
            run_id: self.run.id.clone(),
            pipeline_id: self.run.pipeline_id.clone(),
        });

        self.context
            .append("trigger", self.run.trigger_payload.clone(), None);

        let deadline = self
            .coordinator
            .config
            .run_timeout()
            .map(|limit| (Instant::now() + limit, limit));

        match self.schedule(deadline).await? {
            None => {
                self.skip_leftovers().await;
                self.finish(RunStatus::Completed, None).await
            }
            Some(stop) => {
                self.drain(&stop).await?;
                match stop {
                    Stop::Failed(message) => self.finish(RunStatus::Failed, Some(message)).await,
                    Stop::TimedOut(limit) => {
                        let message = ExecutionError::RunTimeout(limit).to_string();
                        self.log(LogLevel::Error, None, message.clone()).await;
                        self.finish(RunStatus::Failed, Some(message)).await
                    }
                    Stop::Cancelled => self.finish(RunStatus::Cancelled, None).await,
                }
            }
        }
    }

    /// Dispatch ready nodes and fold in completions until the run settles
    /// or has to stop
    async fn schedule(&mut self, deadline: Option<(Instant, Duration)>) -> Result<Option<Stop>> {
        let token = self.token.clone();

        loop {
            if token.is_cancelled() {
                return Ok(Some(Stop::Cancelled));
            }
            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    return Ok(Some(Stop::TimedOut(limit)));
                }
            }

            if self.rearm.is_empty() {
                let skipped = self.apply_skips().await;
                let started = self.dispatch_ready().await;
                if skipped || started {
                    self.save().await?;
                }
            }

            if self.in_flight.is_empty() {
                if self.rearm.is_empty() {
                    return Ok(None);
                }
                self.rearm_loops().await?;
                continue;
            }

            let deadline_reached = async move {
                match deadline {
                    Some((at, _)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(Some(Stop::Cancelled)),
                _ = deadline_reached => {
                    if let Some((_, limit)) = deadline {
                        return Ok(Some(Stop::TimedOut(limit)));
                    }
                }
                Some((node_id, joined)) = self.in_flight.next() => {
                    if let Some(stop) = self.on_finished(node_id, joined).await? {
                        return Ok(Some(stop));
                    }
                }
            }
        }
    }

    async fn apply_skips(&mut self) -> bool {
        let skipped = self.graph.skippable_nodes(&self.run.nodes);
        for id in &skipped {
            let record = self.run.nodes.entry(id.clone()).or_default();
            record.state = NodeState::Skipped;
            record.finished_at = Some(Utc::now());

            self.log(LogLevel::Info, Some(id), format!("Node '{}' skipped", id))
                .await;
            self.emit(PipelineEvent::NodeSkipped {
                run_id: self.run.id.clone(),
                node_id: id.clone(),
            });
        }
        !skipped.is_empty()
    }

    async fn dispatch_ready(&mut self) -> bool {
        let cap = self
            .pipeline
            .settings
            .max_concurrency
            .unwrap_or(self.coordinator.config.max_concurrency)
            .max(1);

        let mut started = false;
        for id in self.graph.ready_nodes(&self.run.nodes) {
            if self.in_flight.len() >= cap {
                break;
            }
            let attempt = self.spawn(&id, Duration::ZERO);
            self.log(LogLevel::Info, Some(&id), format!("Node '{}' started", id))
                .await;
            self.emit(PipelineEvent::NodeStarted {
                run_id: self.run.id.clone(),
                node_id: id.clone(),
                attempt,
            });
            started = true;
        }
        started
    }

    /// Start one attempt of a node after `backoff`. Returns the attempt number.
    fn spawn(&mut self, node_id: &str, backoff: Duration) -> u32 {
        let attempt = {
            let record = self.run.nodes.entry(node_id.to_string()).or_default();
            record.state = NodeState::Running;
            record.attempts += 1;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
            record.attempts
        };

        let node = self.graph.node(node_id).cloned();
        let executor = node
            .as_ref()
            .and_then(|n| self.coordinator.executors.get(n.node_type()));
        let cancel = self.token.child_token();
        let ctx = NodeContext {
            run_id: self.run.id.clone(),
            pipeline_id: self.run.pipeline_id.clone(),
            attempt,
            context: Arc::new(self.context.clone()),
            trigger_payload: Arc::new(self.run.trigger_payload.clone()),
            outgoing: self.graph.outgoing_edges(node_id),
            cancel: cancel.clone(),
        };
        let id = node_id.to_string();

        let handle = tokio::spawn(async move {
            if !backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            match (node, executor) {
                (Some(node), Some(executor)) => executor.execute(&node, &ctx).await,
                (Some(node), None) => Err(ExecutionError::TaskFailed(format!(
                    "no executor registered for {} nodes",
                    node.node_type()
                ))),
                (None, _) => Err(ExecutionError::TaskFailed("unknown node".to_string())),
            }
        });

        self.aborts.insert(id.clone(), handle.abort_handle());
        self.node_tokens.insert(id.clone(), cancel);
        self.in_flight.push(Box::pin(async move { (id, handle.await) }));
        attempt
    }

    async fn on_finished(
        &mut self,
        node_id: String,
        joined: std::result::Result<NodeOutcome, JoinError>,
    ) -> Result<Option<Stop>> {
        self.aborts.remove(&node_id);
        self.node_tokens.remove(&node_id);

        let outcome = joined.unwrap_or_else(|e| Err(ExecutionError::TaskFailed(e.to_string())));
        match outcome {
            Ok(result) => self.complete_node(&node_id, result).await,
            Err(error) if error.is_retryable() => self.retry_or_fail(&node_id, error).await,
            Err(error) => self.fail_node(&node_id, error).await.map(Some),
        }
    }

    /// Fold a node's result into the run: context first, then state
    fn record_completion(&mut self, node_id: &str, result: NodeResult) {
        if let Some(output) = &result.output {
            self.context.append(node_id, output.clone(), Some(node_id));
        }
        for (key, value) in result.context {
            self.context.append(key, value, Some(node_id));
        }

        let record = self.run.nodes.entry(node_id.to_string()).or_default();
        record.state = NodeState::Completed;
        record.finished_at = Some(Utc::now());
        record.error = None;
        record.output = result.output;
        record.routes = result.routes;
    }

    async fn complete_node(&mut self, node_id: &str, result: NodeResult) -> Result<Option<Stop>> {
        self.record_completion(node_id, result);
        self.log(
            LogLevel::Info,
            Some(node_id),
            format!("Node '{}' completed", node_id),
        )
        .await;
        self.emit(PipelineEvent::NodeCompleted {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
        });

        let loops: Vec<(String, String)> = self
            .run
            .nodes
            .get(node_id)
            .map(|r| r.routes.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|edge_id| self.graph.is_loop_edge(edge_id))
            .filter_map(|edge_id| {
                self.graph
                    .edge(edge_id)
                    .map(|e| (edge_id.clone(), e.to.clone()))
            })
            .collect();
        let limit = self.coordinator.config.max_loop_iterations;
        for (edge_id, target) in loops {
            let taken = self.loop_counts.entry(edge_id.clone()).or_insert(0);
            *taken += 1;
            if *taken > limit {
                let error = ExecutionError::LoopLimitExceeded { edge: edge_id, limit };
                return self.fail_node(node_id, error).await.map(Some);
            }
            self.rearm.push(target);
        }

        self.save().await?;
        Ok(None)
    }

    async fn retry_or_fail(&mut self, node_id: &str, error: ExecutionError) -> Result<Option<Stop>> {
        let attempts = self.run.nodes.get(node_id).map(|r| r.attempts).unwrap_or(0);
        let policy = self
            .graph
            .node(node_id)
            .and_then(|n| n.retry.clone())
            .or_else(|| self.coordinator.config.default_retry.clone())
            .filter(|p| attempts <= p.max_retries);

        let Some(policy) = policy else {
            return self.fail_node(node_id, error).await.map(Some);
        };

        let delay = policy.delay_for(attempts);
        if let Some(record) = self.run.nodes.get_mut(node_id) {
            record.error = Some(error.to_string());
        }
        self.log(
            LogLevel::Warn,
            Some(node_id),
            format!(
                "Node '{}' failed on attempt {}: {}; retrying in {}ms",
                node_id,
                attempts,
                error,
                delay.as_millis()
            ),
        )
        .await;
        self.emit(PipelineEvent::NodeRetrying {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            attempt: attempts + 1,
            delay_ms: delay.as_millis() as u64,
        });

        let attempt = self.spawn(node_id, delay);
        self.emit(PipelineEvent::NodeStarted {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            attempt,
        });
        self.save().await?;
        Ok(None)
    }

    async fn fail_node(&mut self, node_id: &str, error: ExecutionError) -> Result<Stop> {
        let record = self.run.nodes.entry(node_id.to_string()).or_default();
        record.state = NodeState::Failed;
        record.finished_at = Some(Utc::now());
        record.error = Some(error.to_string());

        self.log(
            LogLevel::Error,
            Some(node_id),
            format!("Node '{}' failed: {}", node_id, error),
        )
        .await;
        self.emit(PipelineEvent::NodeFailed {
            run_id: self.run.id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
        });
        self.save().await?;

        Ok(Stop::Failed(format!("Node '{}' failed: {}", node_id, error)))
    }

    /// Reset every loop body whose re-entry edge was taken
    async fn rearm_loops(&mut self) -> Result<()> {
        for target in std::mem::take(&mut self.rearm) {
            let region = self.graph.loop_region(&target);
            for id in &region {
                self.run.nodes.insert(id.clone(), NodeRecord::default());
            }
            self.log(
                LogLevel::Info,
                Some(&target),
                format!("Loop re-entered at '{}', reset {:?}", target, region),
            )
            .await;
        }
        self.save().await
    }

    /// Cancel in-flight nodes and wait up to the grace period for them
    async fn drain(&mut self, stop: &Stop) -> Result<()> {
        if matches!(stop, Stop::Cancelled) {
            self.log(LogLevel::Info, None, "Cancellation requested").await;
        }
        for token in self.node_tokens.values() {
            token.cancel();
        }

        let grace = tokio::time::sleep(self.coordinator.config.cancel_grace());
        tokio::pin!(grace);
        while !self.in_flight.is_empty() {
            tokio::select! {
                biased;
                Some((node_id, joined)) = self.in_flight.next() => {
                    self.on_drained(node_id, joined).await?;
                }
                _ = &mut grace => break,
            }
        }

        for (_, handle) in self.aborts.drain() {
            handle.abort();
        }
        self.node_tokens.clear();
        self.in_flight = FuturesUnordered::new();

        let abandoned: Vec<String> = self
            .run
            .nodes
            .iter()
            .filter(|(_, r)| r.state == NodeState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for id in abandoned {
            self.mark_cancelled(&id).await;
        }
        self.save().await
    }

    async fn on_drained(
        &mut self,
        node_id: String,
        joined: std::result::Result<NodeOutcome, JoinError>,
    ) -> Result<()> {
        self.aborts.remove(&node_id);
        self.node_tokens.remove(&node_id);

        match joined {
            Ok(Ok(result)) => {
                // finished before it saw the cancellation
                self.record_completion(&node_id, result);
                self.log(
                    LogLevel::Info,
                    Some(&node_id),
                    format!("Node '{}' completed", node_id),
                )
                .await;
                Ok(())
            }
            Ok(Err(ExecutionError::Cancelled)) | Err(_) => {
                self.mark_cancelled(&node_id).await;
                Ok(())
            }
            Ok(Err(error)) => self.fail_node(&node_id, error).await.map(|_| ()),
        }
    }

    async fn mark_cancelled(&mut self, node_id: &str) {
        let record = self.run.nodes.entry(node_id.to_string()).or_default();
        record.state = NodeState::Cancelled;
        record.finished_at = Some(Utc::now());
        self.log(
            LogLevel::Warn,
            Some(node_id),
            format!("Node '{}' cancelled", node_id),
        )
        .await
    }

    /// Pending nodes that nothing can reach any more, e.g. behind a loop
    /// edge that was never taken
    async fn skip_leftovers(&mut self) {
        let leftovers: Vec<String> = self
            .run
            .nodes
            .iter()
            .filter(|(_, r)| r.state == NodeState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in leftovers {
            if let Some(record) = self.run.nodes.get_mut(&id) {
                record.state = NodeState::Skipped;
                record.finished_at = Some(Utc::now());
            }
            self.log(LogLevel::Info, Some(&id), format!("Node '{}' skipped", id))
                .await;
            self.emit(PipelineEvent::NodeSkipped {
                run_id: self.run.id.clone(),
                node_id: id,
            });
        }
    }

    /// Stop everything after an engine error and record the run as failed
    async fn abandon(&mut self, reason: String) -> Result<()> {
        log::error!("[run {}] aborted: {}", self.run.id, reason);
        for token in self.node_tokens.values() {
            token.cancel();
        }
        for (_, handle) in self.aborts.drain() {
            handle.abort();
        }
        self.node_tokens.clear();
        self.in_flight = FuturesUnordered::new();
        for record in self.run.nodes.values_mut() {
            if record.state == NodeState::Running {
                record.state = NodeState::Cancelled;
                record.finished_at = Some(Utc::now());
            }
        }
        self.finish(RunStatus::Failed, Some(format!("Run aborted: {}", reason)))
            .await
    }

    async fn finish(&mut self, status: RunStatus, error: Option<String>) -> Result<()> {
        let level = match status {
            RunStatus::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.log(level, None, format!("Run {}", status)).await;

        self.run.status = status;
        self.run.finished_at = Some(Utc::now());
        self.run.error = error;
        self.save().await?;
        self.emit_finished();
        Ok(())
    }

    fn emit_finished(&self) {
        self.emit(PipelineEvent::RunFinished {
            run_id: self.run.id.clone(),
            pipeline_id: self.run.pipeline_id.clone(),
            status: self.run.status,
            error: self.run.error.clone(),
        });
    }
}

impl Drop for RunDriver<'_> {
    fn drop(&mut self) {
        for handle in self.aborts.values() {
            handle.abort();
        }
    }
}
