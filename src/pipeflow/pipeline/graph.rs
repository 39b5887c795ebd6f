// SPDX-License-Identifier: MIT

//! Graph model of a pipeline
//!
//! [`Graph`] indexes a pipeline's nodes and edges once and answers the
//! questions the coordinator asks on every step:
//! - is the definition structurally sound ([`Graph::validate`])
//! - which pending nodes may start now ([`Graph::ready_nodes`])
//! - which pending nodes can no longer run ([`Graph::skippable_nodes`])
//!
//! Readiness and skip propagation are pure functions of the node states.
//!
//! Condition edges that close a cycle are *loop edges*. They are found by a
//! depth-first walk from the trigger and never block readiness; taking one
//! re-arms the loop body (see the coordinator).

use super::run::{NodeState, NodeStates};
use super::types::{NodeKind, Pipeline, PipelineEdge, PipelineNode};
use crate::adk::error::DefinitionError;
use crate::pipeflow::condition;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Indexed, read-only view of a pipeline definition
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    duplicate: Option<String>,
    duplicate_edge: Option<String>,
    loop_edges: HashSet<usize>,
    /// Non-condition edge closing a cycle, with the cycle's nodes
    bad_back_edge: Option<Vec<String>>,
    order: Vec<String>,
}

impl Graph {
    pub fn new(nodes: &[PipelineNode], edges: &[PipelineEdge]) -> Self {
        let mut node_map = BTreeMap::new();
        let mut duplicate = None;
        for node in nodes {
            if node_map.insert(node.id.clone(), node.clone()).is_some() && duplicate.is_none() {
                duplicate = Some(node.id.clone());
            }
        }

        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut edge_ids = HashSet::new();
        let mut duplicate_edge = None;
        for (idx, edge) in edges.iter().enumerate() {
            if !edge_ids.insert(edge.id.as_str()) && duplicate_edge.is_none() {
                duplicate_edge = Some(edge.id.clone());
            }
            outgoing.entry(edge.from.clone()).or_default().push(idx);
            incoming.entry(edge.to.clone()).or_default().push(idx);
        }

        let mut graph = Self {
            nodes: node_map,
            edges: edges.to_vec(),
            incoming,
            outgoing,
            duplicate,
            duplicate_edge,
            loop_edges: HashSet::new(),
            bad_back_edge: None,
            order: Vec::new(),
        };
        graph.classify_back_edges();
        graph.order = graph.topological_order();
        graph
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(&pipeline.nodes, &pipeline.edges)
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn trigger(&self) -> Option<&PipelineNode> {
        self.nodes
            .values()
            .find(|n| matches!(n.kind, NodeKind::Trigger(_)))
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<PipelineEdge> {
        self.edge_indices(&self.outgoing, node_id)
            .iter()
            .map(|&i| self.edges[i].clone())
            .collect()
    }

    pub fn edge(&self, edge_id: &str) -> Option<&PipelineEdge> {
        self.edges.iter().find(|e| e.id == edge_id)
    }

    pub fn is_loop_edge(&self, edge_id: &str) -> bool {
        self.edges
            .iter()
            .enumerate()
            .any(|(i, e)| e.id == edge_id && self.loop_edges.contains(&i))
    }

    /// Nodes in topological order over non-loop edges, ties broken by id
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Check every structural invariant, reporting the first violation
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if let Some(id) = &self.duplicate {
            return Err(DefinitionError::DuplicateNode(id.clone()));
        }
        if let Some(id) = &self.duplicate_edge {
            return Err(DefinitionError::DuplicateEdge(id.clone()));
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(DefinitionError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        let triggers: Vec<String> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Trigger(_)))
            .map(|n| n.id.clone())
            .collect();
        let trigger = match triggers.as_slice() {
            [] => return Err(DefinitionError::MissingTrigger),
            [only] => only.clone(),
            _ => return Err(DefinitionError::MultipleTriggers(triggers)),
        };
        if !self.edge_indices(&self.incoming, &trigger).is_empty() {
            return Err(DefinitionError::TriggerHasIncomingEdge(trigger));
        }

        self.check_acyclic()?;

        let reachable = self.reachable_from(&trigger);
        if let Some(id) = self.nodes.keys().find(|id| !reachable.contains(id.as_str())) {
            return Err(DefinitionError::UnreachableNode(id.clone()));
        }

        self.check_condition_routing()?;
        self.check_node_configs()
    }

    /// Pending nodes whose forward inputs are all settled and at least one
    /// input edge is live. Sorted by node id.
    pub fn ready_nodes(&self, states: &NodeStates) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| state_of(states, id) == NodeState::Pending)
            .filter(|id| self.inputs_allow(states, id) == Inputs::Ready)
            .cloned()
            .collect()
    }

    /// Pending nodes that can no longer run: every input edge is dead or
    /// comes from a skipped node. Skips cascade in topological order.
    pub fn skippable_nodes(&self, states: &NodeStates) -> Vec<String> {
        let mut local = states.clone();
        let mut skipped = Vec::new();
        let mut queue: VecDeque<&String> = self.order.iter().collect();

        while let Some(id) = queue.pop_front() {
            if state_of(&local, id) != NodeState::Pending {
                continue;
            }
            if self.inputs_allow(&local, id) == Inputs::Dead {
                local.entry(id.clone()).or_default().state = NodeState::Skipped;
                skipped.push(id.clone());
            }
        }
        skipped
    }

    /// The loop body re-entered through `target`: every node reachable from
    /// it over non-loop edges, `target` included.
    pub fn loop_region(&self, target: &str) -> Vec<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue = VecDeque::from([target.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for &idx in self.edge_indices(&self.outgoing, &id) {
                if !self.loop_edges.contains(&idx) {
                    queue.push_back(self.edges[idx].to.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    fn inputs_allow(&self, states: &NodeStates, id: &str) -> Inputs {
        let inputs = self.edge_indices(&self.incoming, id);
        if inputs.is_empty() {
            return Inputs::Ready;
        }

        let forward_settled = inputs
            .iter()
            .filter(|&&i| !self.loop_edges.contains(&i))
            .all(|&i| state_of(states, &self.edges[i].from).is_settled());
        if !forward_settled {
            return Inputs::Waiting;
        }

        if inputs.iter().any(|&i| self.is_live(states, i)) {
            Inputs::Ready
        } else if inputs
            .iter()
            .any(|&i| self.loop_edges.contains(&i) && !state_of(states, &self.edges[i].from).is_settled())
        {
            // a loop edge may still fire
            Inputs::Waiting
        } else {
            Inputs::Dead
        }
    }

    fn is_live(&self, states: &NodeStates, idx: usize) -> bool {
        let edge = &self.edges[idx];
        let Some(record) = states.get(&edge.from) else {
            return false;
        };
        if record.state != NodeState::Completed {
            return false;
        }
        match self.nodes.get(&edge.from) {
            Some(source) if source.is_condition() => record.routes.contains(&edge.id),
            _ => true,
        }
    }

    fn edge_indices<'a>(&'a self, index: &'a HashMap<String, Vec<usize>>, id: &str) -> &'a [usize] {
        index.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn is_condition_node(&self, id: &str) -> bool {
        self.nodes.get(id).map(|n| n.is_condition()).unwrap_or(false)
    }

    /// Depth-first walk from the trigger. Back edges out of condition nodes
    /// become loop edges; any other back edge is recorded as a cycle.
    fn classify_back_edges(&mut self) {
        let Some(root) = self.trigger().map(|n| n.id.clone()) else {
            return;
        };

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut stack: Vec<(String, usize)> = vec![(root.clone(), 0)];
        marks.insert(root.clone(), Mark::Open);
        path.push(root);

        while let Some((node, next)) = stack.last().cloned() {
            let edges = self.edge_indices(&self.outgoing, &node).to_vec();
            if next >= edges.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                path.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let idx = edges[next];
            let target = self.edges[idx].to.clone();
            if !self.nodes.contains_key(&target) {
                continue;
            }
            match marks.get(&target) {
                None => {
                    marks.insert(target.clone(), Mark::Open);
                    path.push(target.clone());
                    stack.push((target, 0));
                }
                Some(Mark::Open) => {
                    if self.is_condition_node(&node) {
                        self.loop_edges.insert(idx);
                    } else if self.bad_back_edge.is_none() {
                        let start = path.iter().position(|n| *n == target).unwrap_or(0);
                        self.bad_back_edge = Some(path[start..].to_vec());
                    }
                }
                Some(Mark::Done) => {}
            }
        }
    }

    fn topological_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        for (idx, edge) in self.edges.iter().enumerate() {
            if self.loop_edges.contains(&idx) || !self.nodes.contains_key(&edge.from) {
                continue;
            }
            if let Some(d) = indegree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for &idx in self.edge_indices(&self.outgoing, id) {
                if self.loop_edges.contains(&idx) {
                    continue;
                }
                if let Some(d) = indegree.get_mut(self.edges[idx].to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(self.edges[idx].to.as_str());
                    }
                }
            }
        }

        // nodes on an invalid cycle still need a slot
        if order.len() < self.nodes.len() {
            let placed: HashSet<String> = order.iter().cloned().collect();
            order.extend(self.nodes.keys().filter(|id| !placed.contains(*id)).cloned());
        }
        order
    }

    /// The edge set without condition edges must be a DAG, and every cycle
    /// must be closed by a condition edge.
    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        let mut indegree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let plain: Vec<&PipelineEdge> = self
            .edges
            .iter()
            .filter(|e| !self.is_condition_node(&e.from))
            .collect();
        for edge in &plain {
            if let Some(d) = indegree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for edge in plain.iter().filter(|e| e.from == id) {
                if let Some(d) = indegree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(edge.to.as_str());
                    }
                }
            }
        }

        if visited < self.nodes.len() {
            let cyclic = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(DefinitionError::Cycle(cyclic));
        }

        if let Some(cycle) = &self.bad_back_edge {
            return Err(DefinitionError::Cycle(cycle.clone()));
        }
        Ok(())
    }

    fn reachable_from<'a>(&'a self, root: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for &idx in self.edge_indices(&self.outgoing, id) {
                queue.push_back(self.edges[idx].to.as_str());
            }
        }
        seen
    }

    fn check_condition_routing(&self) -> Result<(), DefinitionError> {
        for node in self.nodes.values().filter(|n| n.is_condition()) {
            let edges: Vec<&PipelineEdge> = self
                .edge_indices(&self.outgoing, &node.id)
                .iter()
                .map(|&i| &self.edges[i])
                .collect();
            if edges.iter().any(|e| e.is_default()) {
                continue;
            }
            let mut labels = HashSet::new();
            for label in edges.iter().filter_map(|e| e.label()) {
                if !labels.insert(label) {
                    return Err(DefinitionError::AmbiguousConditionRouting {
                        node: node.id.clone(),
                        label: label.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_node_configs(&self) -> Result<(), DefinitionError> {
        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::Delay(cfg) => {
                    let out = self.edge_indices(&self.outgoing, &node.id).len();
                    if out != 1 {
                        return Err(DefinitionError::invalid_config(
                            &node.id,
                            format!("delay nodes need exactly one outgoing edge, found {}", out),
                        ));
                    }
                    if cfg.duration().is_none() {
                        return Err(DefinitionError::invalid_config(
                            &node.id,
                            "seconds must be a non-negative duration",
                        ));
                    }
                }
                NodeKind::Condition(cfg) => {
                    if let Err(e) = condition::parse_route(&cfg.condition) {
                        return Err(DefinitionError::invalid_config(&node.id, e.to_string()));
                    }
                }
                NodeKind::Agent(cfg) if cfg.agent_id.trim().is_empty() => {
                    return Err(DefinitionError::invalid_config(&node.id, "agent_id is empty"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum Inputs {
    Ready,
    Waiting,
    Dead,
}

fn state_of(states: &NodeStates, id: &str) -> NodeState {
    states.get(id).map(|r| r.state).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeflow::pipeline::run::NodeRecord;
    use crate::pipeflow::pipeline::types::{
        ActionConfig, AgentConfig, ConditionConfig, DelayConfig, TriggerConfig,
    };

    fn trigger(id: &str) -> PipelineNode {
        PipelineNode::new(id, NodeKind::Trigger(TriggerConfig::default()))
    }

    fn agent(id: &str) -> PipelineNode {
        PipelineNode::new(
            id,
            NodeKind::Agent(AgentConfig {
                agent_id: format!("{}-agent", id),
                task: "work".to_string(),
                timeout_secs: None,
            }),
        )
    }

    fn cond(id: &str, expr: &str) -> PipelineNode {
        PipelineNode::new(
            id,
            NodeKind::Condition(ConditionConfig {
                condition: expr.to_string(),
            }),
        )
    }

    fn action(id: &str) -> PipelineNode {
        PipelineNode::new(
            id,
            NodeKind::Action(ActionConfig::Notify {
                channel: None,
                message: "hi".to_string(),
            }),
        )
    }

    fn delay(id: &str) -> PipelineNode {
        PipelineNode::new(id, NodeKind::Delay(DelayConfig { seconds: 1.0 }))
    }

    fn parallel(id: &str) -> PipelineNode {
        PipelineNode::new(id, NodeKind::Parallel)
    }

    fn edge(from: &str, to: &str) -> PipelineEdge {
        PipelineEdge::new(from, to)
    }

    fn labelled(from: &str, to: &str, label: &str) -> PipelineEdge {
        PipelineEdge::labelled(from, to, label)
    }

    fn states(pairs: &[(&str, NodeState)]) -> NodeStates {
        pairs
            .iter()
            .map(|(id, state)| {
                (
                    id.to_string(),
                    NodeRecord {
                        state: *state,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn routed(mut states: NodeStates, node: &str, routes: &[&str]) -> NodeStates {
        if let Some(record) = states.get_mut(node) {
            record.routes = routes.iter().map(|s| s.to_string()).collect();
        }
        states
    }

    /// trigger -> A -> C -> [pass: P, fail: F]
    fn scoring_graph() -> Graph {
        Graph::new(
            &[
                trigger("T"),
                agent("A"),
                cond("C", "A.score > 0.5 ? 'pass' : 'fail'"),
                action("P"),
                action("F"),
            ],
            &[
                edge("T", "A"),
                edge("A", "C"),
                labelled("C", "P", "pass"),
                labelled("C", "F", "fail"),
            ],
        )
    }

    #[test]
    fn test_valid_graph() {
        assert_eq!(scoring_graph().validate(), Ok(()));
    }

    #[test]
    fn test_missing_trigger() {
        let graph = Graph::new(&[agent("A")], &[]);
        assert_eq!(graph.validate(), Err(DefinitionError::MissingTrigger));
    }

    #[test]
    fn test_multiple_triggers() {
        let graph = Graph::new(&[trigger("T1"), trigger("T2")], &[]);
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::MultipleTriggers(vec![
                "T1".to_string(),
                "T2".to_string()
            ]))
        );
    }

    #[test]
    fn test_duplicate_node() {
        let graph = Graph::new(&[trigger("T"), agent("A"), agent("A")], &[edge("T", "A")]);
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::DuplicateNode("A".to_string()))
        );
    }

    #[test]
    fn test_duplicate_edge_id() {
        let mut pass = labelled("C", "P", "pass");
        let mut fail = labelled("C", "F", "fail");
        pass.id = "e1".to_string();
        fail.id = "e1".to_string();
        let graph = Graph::new(
            &[trigger("T"), cond("C", "trigger.x"), action("P"), action("F")],
            &[edge("T", "C"), pass, fail],
        );
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::DuplicateEdge("e1".to_string()))
        );
    }

    #[test]
    fn test_dangling_edge() {
        let graph = Graph::new(&[trigger("T")], &[edge("T", "ghost")]);
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::DanglingEdge {
                edge: "T->ghost".to_string(),
                node: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_trigger_with_incoming_edge() {
        let graph = Graph::new(&[trigger("T"), agent("A")], &[edge("T", "A"), edge("A", "T")]);
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::TriggerHasIncomingEdge("T".to_string()))
        );
    }

    #[test]
    fn test_plain_cycle_is_rejected() {
        let graph = Graph::new(
            &[trigger("T"), agent("A"), agent("B")],
            &[edge("T", "A"), edge("A", "B"), edge("B", "A")],
        );
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::Cycle(vec!["A".to_string(), "B".to_string()]))
        );
    }

    #[test]
    fn test_unreachable_node() {
        let graph = Graph::new(
            &[trigger("T"), agent("A"), agent("Z")],
            &[edge("T", "A")],
        );
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::UnreachableNode("Z".to_string()))
        );
    }

    #[test]
    fn test_ambiguous_condition_routing() {
        let graph = Graph::new(
            &[trigger("T"), cond("C", "true"), action("X"), action("Y")],
            &[
                edge("T", "C"),
                labelled("C", "X", "true"),
                labelled("C", "Y", "true"),
            ],
        );
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::AmbiguousConditionRouting {
                node: "C".to_string(),
                label: "true".to_string()
            })
        );

        // a default edge resolves the ambiguity
        let graph = Graph::new(
            &[
                trigger("T"),
                cond("C", "true"),
                action("X"),
                action("Y"),
                action("D"),
            ],
            &[
                edge("T", "C"),
                labelled("C", "X", "true"),
                labelled("C", "Y", "true"),
                edge("C", "D"),
            ],
        );
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn test_delay_needs_exactly_one_outgoing_edge() {
        let graph = Graph::new(&[trigger("T"), delay("W")], &[edge("T", "W")]);
        assert!(matches!(
            graph.validate(),
            Err(DefinitionError::InvalidNodeConfig { node, .. }) if node == "W"
        ));
    }

    #[test]
    fn test_unparsable_condition_is_rejected() {
        let graph = Graph::new(
            &[trigger("T"), cond("C", "this is not valid"), action("X")],
            &[edge("T", "C"), edge("C", "X")],
        );
        assert!(matches!(
            graph.validate(),
            Err(DefinitionError::InvalidNodeConfig { node, .. }) if node == "C"
        ));
    }

    #[test]
    fn test_ready_nodes_initially_only_trigger() {
        let graph = scoring_graph();
        let s = states(&[]);
        assert_eq!(graph.ready_nodes(&s), vec!["T".to_string()]);
    }

    #[test]
    fn test_ready_nodes_is_idempotent() {
        let graph = scoring_graph();
        let s = states(&[("T", NodeState::Completed)]);
        let first = graph.ready_nodes(&s);
        let second = graph.ready_nodes(&s);
        assert_eq!(first, vec!["A".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_condition_routes_only_matching_branch() {
        let graph = scoring_graph();
        let s = states(&[
            ("T", NodeState::Completed),
            ("A", NodeState::Completed),
            ("C", NodeState::Completed),
        ]);
        let s = routed(s, "C", &["C->P"]);

        assert_eq!(graph.ready_nodes(&s), vec!["P".to_string()]);
        assert_eq!(graph.skippable_nodes(&s), vec!["F".to_string()]);
    }

    #[test]
    fn test_yes_no_with_default() {
        let graph = Graph::new(
            &[
                trigger("T"),
                cond("C", "answer"),
                action("Y"),
                action("N"),
                action("D"),
            ],
            &[
                edge("T", "C"),
                labelled("C", "Y", "yes"),
                labelled("C", "N", "no"),
                labelled("C", "D", "default"),
            ],
        );
        assert_eq!(graph.validate(), Ok(()));

        let s = routed(
            states(&[("T", NodeState::Completed), ("C", NodeState::Completed)]),
            "C",
            &["C->Y"],
        );
        assert_eq!(graph.ready_nodes(&s), vec!["Y".to_string()]);
        let mut skipped = graph.skippable_nodes(&s);
        skipped.sort();
        assert_eq!(skipped, vec!["D".to_string(), "N".to_string()]);
    }

    #[test]
    fn test_parallel_join_waits_for_all_branches() {
        let graph = Graph::new(
            &[
                trigger("T"),
                parallel("P"),
                agent("A"),
                agent("B"),
                action("J"),
            ],
            &[
                edge("T", "P"),
                edge("P", "A"),
                edge("P", "B"),
                edge("A", "J"),
                edge("B", "J"),
            ],
        );
        assert_eq!(graph.validate(), Ok(()));

        let s = states(&[("T", NodeState::Completed), ("P", NodeState::Completed)]);
        assert_eq!(graph.ready_nodes(&s), vec!["A".to_string(), "B".to_string()]);

        let s = states(&[
            ("T", NodeState::Completed),
            ("P", NodeState::Completed),
            ("A", NodeState::Completed),
            ("B", NodeState::Running),
        ]);
        assert!(graph.ready_nodes(&s).is_empty());

        let s = states(&[
            ("T", NodeState::Completed),
            ("P", NodeState::Completed),
            ("A", NodeState::Completed),
            ("B", NodeState::Completed),
        ]);
        assert_eq!(graph.ready_nodes(&s), vec!["J".to_string()]);
    }

    #[test]
    fn test_join_after_condition_runs_on_taken_branch() {
        let graph = Graph::new(
            &[
                trigger("T"),
                cond("C", "flag"),
                action("X"),
                action("Y"),
                action("J"),
            ],
            &[
                edge("T", "C"),
                labelled("C", "X", "true"),
                labelled("C", "Y", "false"),
                edge("X", "J"),
                edge("Y", "J"),
            ],
        );
        let s = routed(
            states(&[
                ("T", NodeState::Completed),
                ("C", NodeState::Completed),
                ("X", NodeState::Completed),
                ("Y", NodeState::Skipped),
            ]),
            "C",
            &["C->X"],
        );
        assert_eq!(graph.ready_nodes(&s), vec!["J".to_string()]);
        assert!(graph.skippable_nodes(&s).is_empty());
    }

    #[test]
    fn test_skips_cascade_downstream() {
        let graph = Graph::new(
            &[
                trigger("T"),
                cond("C", "flag"),
                action("X"),
                action("X2"),
                action("Y"),
            ],
            &[
                edge("T", "C"),
                labelled("C", "X", "true"),
                edge("X", "X2"),
                labelled("C", "Y", "false"),
            ],
        );
        let s = routed(
            states(&[("T", NodeState::Completed), ("C", NodeState::Completed)]),
            "C",
            &["C->Y"],
        );
        assert_eq!(
            graph.skippable_nodes(&s),
            vec!["X".to_string(), "X2".to_string()]
        );
    }

    #[test]
    fn test_failed_upstream_blocks_without_skipping() {
        let graph = scoring_graph();
        let s = states(&[("T", NodeState::Completed), ("A", NodeState::Failed)]);
        assert!(graph.ready_nodes(&s).is_empty());
        assert!(graph.skippable_nodes(&s).is_empty());
    }

    #[test]
    fn test_condition_loop_edge() {
        // T -> A -> C, C -retry-> A, C -done-> D
        let graph = Graph::new(
            &[trigger("T"), agent("A"), cond("C", "A.ok"), action("D")],
            &[
                edge("T", "A"),
                edge("A", "C"),
                labelled("C", "A", "retry"),
                labelled("C", "D", "done"),
            ],
        );
        assert_eq!(graph.validate(), Ok(()));
        assert!(graph.is_loop_edge("C->A"));
        assert!(!graph.is_loop_edge("C->D"));

        // the loop edge does not hold A back
        let s = states(&[("T", NodeState::Completed)]);
        assert_eq!(graph.ready_nodes(&s), vec!["A".to_string()]);

        assert_eq!(
            graph.loop_region("A"),
            vec!["A".to_string(), "C".to_string(), "D".to_string()]
        );
        assert_eq!(graph.order(), &["T", "A", "C", "D"]);
    }

    #[test]
    fn test_cycle_entered_at_condition_needs_condition_back_edge() {
        // C -> A -> C where the back edge is the plain A -> C
        let graph = Graph::new(
            &[trigger("T"), cond("C", "go"), agent("A")],
            &[edge("T", "C"), labelled("C", "A", "again"), edge("A", "C")],
        );
        assert_eq!(
            graph.validate(),
            Err(DefinitionError::Cycle(vec!["C".to_string(), "A".to_string()]))
        );
    }
}
