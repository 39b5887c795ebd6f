// SPDX-License-Identifier: MIT

//! Pipeline definition types
//!
//! Nodes are written as `{id, type, name, config, retry}`. The untyped
//! `config` object is decoded into a typed [`NodeKind`] as soon as the node
//! is deserialized, so a malformed step never reaches the store.

use crate::adk::error::DefinitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Node types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Trigger,
    Agent,
    Condition,
    Action,
    Parallel,
    Delay,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Agent => "agent",
            NodeType::Condition => "condition",
            NodeType::Action => "action",
            NodeType::Parallel => "parallel",
            NodeType::Delay => "delay",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-node retry policy. Absent means no retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), capped at `backoff_max_ms`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    #[default]
    Manual,
    Schedule,
    Event,
    Webhook,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub task: String,
    /// Overrides the engine-wide agent timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    "true".to_string()
}

/// Built-in side effects of `action` nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Send a message through the notifier. `{{path}}` placeholders are
    /// filled from the run context.
    #[serde(alias = "send_notification")]
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        message: String,
    },
    /// Call an HTTP endpoint. Without a body the run context is sent.
    #[serde(alias = "call_api")]
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    /// Write static values into the run context
    SetContext {
        #[serde(default)]
        values: serde_json::Map<String, Value>,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub seconds: f64,
}

impl DelayConfig {
    /// None for negative, non-finite or out-of-range `seconds`
    pub fn duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.seconds).ok()
    }
}

/// Typed configuration of a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Agent(AgentConfig),
    Condition(ConditionConfig),
    Action(ActionConfig),
    Parallel,
    Delay(DelayConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Trigger(_) => NodeType::Trigger,
            NodeKind::Agent(_) => NodeType::Agent,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Action(_) => NodeType::Action,
            NodeKind::Parallel => NodeType::Parallel,
            NodeKind::Delay(_) => NodeType::Delay,
        }
    }

    fn decode(node_id: &str, node_type: NodeType, config: Value) -> Result<Self, DefinitionError> {
        let config = match config {
            Value::Null => json!({}),
            other => other,
        };
        let invalid = |e: serde_json::Error| DefinitionError::invalid_config(node_id, e.to_string());

        let kind = match node_type {
            NodeType::Trigger => NodeKind::Trigger(serde_json::from_value(config).map_err(invalid)?),
            NodeType::Agent => {
                let cfg: AgentConfig = serde_json::from_value(config).map_err(invalid)?;
                if cfg.agent_id.trim().is_empty() {
                    return Err(DefinitionError::invalid_config(node_id, "agent_id is empty"));
                }
                if let Some(t) = cfg.timeout_secs {
                    if !(t.is_finite() && t > 0.0) {
                        return Err(DefinitionError::invalid_config(
                            node_id,
                            "timeout_secs must be a positive number",
                        ));
                    }
                }
                NodeKind::Agent(cfg)
            }
            NodeType::Condition => {
                NodeKind::Condition(serde_json::from_value(config).map_err(invalid)?)
            }
            NodeType::Action => {
                let cfg: ActionConfig = serde_json::from_value(config).map_err(invalid)?;
                if let ActionConfig::Webhook { url, .. } = &cfg {
                    if url.trim().is_empty() {
                        return Err(DefinitionError::invalid_config(node_id, "webhook url is empty"));
                    }
                }
                NodeKind::Action(cfg)
            }
            NodeType::Parallel => NodeKind::Parallel,
            NodeType::Delay => {
                let cfg: DelayConfig = serde_json::from_value(config).map_err(invalid)?;
                if cfg.duration().is_none() {
                    return Err(DefinitionError::invalid_config(
                        node_id,
                        "seconds must be a non-negative duration",
                    ));
                }
                NodeKind::Delay(cfg)
            }
        };
        Ok(kind)
    }

    fn encode(&self) -> Value {
        let encoded = match self {
            NodeKind::Trigger(cfg) => serde_json::to_value(cfg),
            NodeKind::Agent(cfg) => serde_json::to_value(cfg),
            NodeKind::Condition(cfg) => serde_json::to_value(cfg),
            NodeKind::Action(cfg) => serde_json::to_value(cfg),
            NodeKind::Parallel => Ok(json!({})),
            NodeKind::Delay(cfg) => serde_json::to_value(cfg),
        };
        encoded.unwrap_or_default()
    }
}

/// A typed step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct PipelineNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub retry: Option<RetryPolicy>,
}

/// Wire form of a node. Presentation fields such as `position` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
}

impl TryFrom<RawNode> for PipelineNode {
    type Error = DefinitionError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = NodeKind::decode(&raw.id, raw.node_type, raw.config)?;
        let name = if raw.name.is_empty() {
            raw.id.clone()
        } else {
            raw.name
        };
        Ok(Self {
            id: raw.id,
            name,
            kind,
            retry: raw.retry,
        })
    }
}

impl From<PipelineNode> for RawNode {
    fn from(node: PipelineNode) -> Self {
        Self {
            node_type: node.kind.node_type(),
            config: node.kind.encode(),
            id: node.id,
            name: node.name,
            retry: node.retry,
        }
    }
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            retry: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_condition(&self) -> bool {
        matches!(self.kind, NodeKind::Condition(_))
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEdge {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    /// Routing label, only meaningful when `from` is a condition node
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "label")]
    pub condition: Option<String>,
}

impl PipelineEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: format!("{}->{}", from, to),
            from,
            to,
            condition: None,
        }
    }

    pub fn labelled(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        let mut edge = Self::new(from, to);
        edge.condition = Some(label.into());
        edge
    }

    /// Unlabelled, `default` and `else` edges are taken when no label matches
    pub fn is_default(&self) -> bool {
        match self.condition.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(label) => label.eq_ignore_ascii_case("default") || label.eq_ignore_ascii_case("else"),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.condition.as_deref().map(str::trim)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Draft => "draft",
            PipelineStatus::Active => "active",
            PipelineStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PipelineStatus::Draft),
            "active" => Some(PipelineStatus::Active),
            "paused" => Some(PipelineStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a run is requested while another one is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Cap on in-flight nodes per run; the engine default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub allow_concurrent_runs: bool,
    #[serde(default)]
    pub on_overlap: OverlapPolicy,
}

/// Editable part of a pipeline, as loaded from a file or sent by the editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<PipelineNode>,
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
    #[serde(default)]
    pub settings: PipelineSettings,
}

/// A stored pipeline with its lifecycle status and run counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default)]
    pub nodes: Vec<PipelineNode>,
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub cancelled_count: u64,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// Build a draft pipeline from a definition, generating an id when absent
    pub fn from_definition(def: PipelineDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: def
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: def.name,
            description: def.description,
            status: PipelineStatus::Draft,
            nodes: def.nodes,
            edges: normalize_edges(def.edges),
            settings: def.settings,
            run_count: 0,
            success_count: 0,
            error_count: 0,
            cancelled_count: 0,
            last_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the editable fields, keeping id, status and counters
    pub fn apply_definition(&mut self, def: PipelineDefinition) {
        self.name = def.name;
        self.description = def.description;
        self.nodes = def.nodes;
        self.edges = normalize_edges(def.edges);
        self.settings = def.settings;
        self.updated_at = Utc::now();
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Give every edge an id; the editor may omit them. Generated ids never
/// collide with each other or with ids the editor supplied.
fn normalize_edges(edges: Vec<PipelineEdge>) -> Vec<PipelineEdge> {
    let mut taken: HashSet<String> = edges
        .iter()
        .filter(|e| !e.id.trim().is_empty())
        .map(|e| e.id.clone())
        .collect();
    edges
        .into_iter()
        .map(|mut e| {
            if e.id.trim().is_empty() {
                let base = format!("{}->{}", e.from, e.to);
                let mut id = base.clone();
                let mut n = 2;
                while taken.contains(&id) {
                    id = format!("{}#{}", base, n);
                    n += 1;
                }
                taken.insert(id.clone());
                e.id = id;
            }
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_agent_node() {
        let node: PipelineNode = serde_json::from_value(json!({
            "id": "A",
            "type": "agent",
            "name": "Scorer",
            "config": {"agent_id": "scorer", "task": "Score the lead"},
            "position": {"x": 10, "y": 20}
        }))
        .unwrap();

        assert_eq!(node.name, "Scorer");
        match node.kind {
            NodeKind::Agent(cfg) => {
                assert_eq!(cfg.agent_id, "scorer");
                assert_eq!(cfg.task, "Score the lead");
                assert!(cfg.timeout_secs.is_none());
            }
            other => panic!("Expected agent node, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let node: PipelineNode =
            serde_json::from_value(json!({"id": "start", "type": "trigger"})).unwrap();
        assert_eq!(node.name, "start");
        assert_eq!(node.kind, NodeKind::Trigger(TriggerConfig::default()));

        let node: PipelineNode =
            serde_json::from_value(json!({"id": "c", "type": "condition"})).unwrap();
        match node.kind {
            NodeKind::Condition(cfg) => assert_eq!(cfg.condition, "true"),
            other => panic!("Expected condition node, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_without_task_is_rejected() {
        let result: Result<PipelineNode, _> = serde_json::from_value(json!({
            "id": "A",
            "type": "agent",
            "config": {"agent_id": "scorer"}
        }));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid configuration for node 'A'"), "{}", err);
    }

    #[test]
    fn test_negative_delay_is_rejected() {
        let result: Result<PipelineNode, _> = serde_json::from_value(json!({
            "id": "wait",
            "type": "delay",
            "config": {"seconds": -1}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_delay_is_rejected() {
        let result: Result<PipelineNode, _> = serde_json::from_value(json!({
            "id": "wait",
            "type": "delay",
            "config": {"seconds": 1e30}
        }));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("non-negative duration"), "{}", err);

        let ok = DelayConfig { seconds: 2.5 };
        assert_eq!(ok.duration(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_action_aliases() {
        let node: PipelineNode = serde_json::from_value(json!({
            "id": "n",
            "type": "action",
            "config": {"action": "send_notification", "message": "done"}
        }))
        .unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::Action(ActionConfig::Notify { .. })
        ));

        let node: PipelineNode = serde_json::from_value(json!({
            "id": "w",
            "type": "action",
            "config": {"action": "call_api", "url": "http://example.com/hook"}
        }))
        .unwrap();
        match node.kind {
            NodeKind::Action(ActionConfig::Webhook { method, .. }) => assert_eq!(method, "POST"),
            other => panic!("Expected webhook action, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result: Result<PipelineNode, _> = serde_json::from_value(json!({
            "id": "x",
            "type": "action",
            "config": {"action": "execute_pipeline"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_node_serializes_back_to_wire_form() {
        let node = PipelineNode::new(
            "wait",
            NodeKind::Delay(DelayConfig { seconds: 2.5 }),
        );
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "delay");
        assert_eq!(json["config"]["seconds"], 2.5);

        let back: PipelineNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_edge_defaults() {
        assert!(PipelineEdge::new("a", "b").is_default());
        assert!(PipelineEdge::labelled("a", "b", "else").is_default());
        assert!(PipelineEdge::labelled("a", "b", "Default").is_default());
        assert!(!PipelineEdge::labelled("a", "b", "yes").is_default());

        let edge: PipelineEdge =
            serde_json::from_value(json!({"from": "c", "to": "p", "condition": "pass"})).unwrap();
        assert_eq!(edge.label(), Some("pass"));
        assert!(edge.id.is_empty());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_from_definition_generates_id_and_edge_ids() {
        let def = PipelineDefinition {
            id: None,
            name: "demo".to_string(),
            description: String::new(),
            nodes: vec![],
            edges: vec![PipelineEdge {
                id: String::new(),
                from: "t".to_string(),
                to: "a".to_string(),
                condition: None,
            }],
            settings: PipelineSettings::default(),
        };
        let pipeline = Pipeline::from_definition(def);
        assert!(!pipeline.id.is_empty());
        assert_eq!(pipeline.status, PipelineStatus::Draft);
        assert_eq!(pipeline.edges[0].id, "t->a");
        assert_eq!(pipeline.run_count, 0);
    }

    #[test]
    fn test_generated_edge_ids_are_unique() {
        let edge = |to: &str, label: Option<&str>| PipelineEdge {
            id: String::new(),
            from: "C".to_string(),
            to: to.to_string(),
            condition: label.map(str::to_string),
        };
        let mut explicit = edge("Q", None);
        explicit.id = "C->P#2".to_string();
        let def = PipelineDefinition {
            id: None,
            name: "labels".to_string(),
            description: String::new(),
            nodes: vec![],
            edges: vec![
                explicit,
                edge("P", Some("yes")),
                edge("P", Some("maybe")),
                edge("P", Some("sure")),
            ],
            settings: PipelineSettings::default(),
        };
        let ids: Vec<String> = Pipeline::from_definition(def)
            .edges
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["C->P#2", "C->P", "C->P#3", "C->P#4"]);
    }
}
