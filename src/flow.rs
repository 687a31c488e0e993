// src/flow.rs
//
// Scripted conversation flows: the JSON definition format shared with the
// external editor, load-time graph validation, per-contact sessions, and
// the engine that walks a contact through a flow.

pub mod engine;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};

pub use engine::FlowEngine;
pub use session::ConversationSession;

/// The fixed node vocabulary. Anything richer belongs in a real workflow
/// engine, which this deliberately is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    Start,
    Message,
    Image,
    Question,
    Condition,
    Action,
    End,
}

/// One node as the editor writes it. Branches are a label → node-id map;
/// `next_id` is the unlabeled default edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl FlowNode {
    /// Branch target for a label, if any.
    pub fn branch(&self, label: &str) -> Option<&String> {
        self.connections.as_ref().and_then(|c| c.get(label))
    }
}

/// A named scripted dialogue, entered via trigger-phrase matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }
}

/// Per-profile flow configuration as persisted for the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    #[serde(default)]
    pub idle_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_message: Option<String>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig { idle_enabled: false, idle_message: None, flows: Vec::new() }
    }
}

pub fn flows_key(profile_id: &str) -> String {
    format!("flows_{profile_id}")
}

/// One problem found while validating a flow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowIssue {
    pub flow_id: String,
    pub node_id: Option<String>,
    pub message: String,
}

impl fmt::Display for FlowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "flow `{}`, node `{node}`: {}", self.flow_id, self.message),
            None => write!(f, "flow `{}`: {}", self.flow_id, self.message),
        }
    }
}

/// Check every flow in a config: each edge must land on an existing node,
/// there must be exactly one START, and everything should be reachable from
/// it. The engine tolerates broken references at runtime by discarding the
/// session, so this exists to catch editor mistakes before they bite.
pub fn validate_config(config: &FlowConfig) -> Vec<FlowIssue> {
    let mut issues = Vec::new();
    for flow in &config.flows {
        validate_flow(flow, &mut issues);
    }
    issues
}

fn validate_flow(flow: &Flow, issues: &mut Vec<FlowIssue>) {
    let mut graph: StableDiGraph<&str, ()> = StableDiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &flow.nodes {
        if index_of.contains_key(node.id.as_str()) {
            issues.push(FlowIssue {
                flow_id: flow.id.clone(),
                node_id: Some(node.id.clone()),
                message: "duplicate node id".to_string(),
            });
            continue;
        }
        let idx = graph.add_node(node.id.as_str());
        index_of.insert(node.id.as_str(), idx);
    }

    // Edges: the default `nextId` plus every labeled branch.
    for node in &flow.nodes {
        let from = index_of[node.id.as_str()];
        let mut targets: Vec<(&str, &str)> = Vec::new();
        if let Some(next) = &node.next_id {
            targets.push(("nextId", next.as_str()));
        }
        if let Some(connections) = &node.connections {
            for (label, target) in connections {
                targets.push((label.as_str(), target.as_str()));
            }
        }
        for (label, target) in targets {
            match index_of.get(target) {
                Some(&to) => {
                    graph.add_edge(from, to, ());
                }
                None => issues.push(FlowIssue {
                    flow_id: flow.id.clone(),
                    node_id: Some(node.id.clone()),
                    message: format!("edge `{label}` points at missing node `{target}`"),
                }),
            }
        }
    }

    let starts: Vec<&FlowNode> =
        flow.nodes.iter().filter(|n| n.kind == NodeKind::Start).collect();
    match starts.as_slice() {
        [] => issues.push(FlowIssue {
            flow_id: flow.id.clone(),
            node_id: None,
            message: "no START node".to_string(),
        }),
        [start] => {
            // Reachability sweep from START.
            let mut dfs = Dfs::new(&graph, index_of[start.id.as_str()]);
            let mut reached = std::collections::HashSet::new();
            while let Some(nx) = dfs.next(&graph) {
                reached.insert(nx);
            }
            for node in &flow.nodes {
                if let Some(idx) = index_of.get(node.id.as_str()) {
                    if !reached.contains(idx) {
                        issues.push(FlowIssue {
                            flow_id: flow.id.clone(),
                            node_id: Some(node.id.clone()),
                            message: "unreachable from START".to_string(),
                        });
                    }
                }
            }
        }
        _ => issues.push(FlowIssue {
            flow_id: flow.id.clone(),
            node_id: None,
            message: format!("{} START nodes, expected exactly one", starts.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(config: serde_json::Value) -> FlowConfig {
        serde_json::from_value(config).unwrap()
    }

    #[test]
    fn editor_format_round_trips() {
        let config = parse(json!({
            "idleEnabled": true,
            "idleMessage": "Hi! Type `menu` to get started.",
            "flows": [{
                "id": "f1",
                "name": "Menu",
                "triggers": ["menu"],
                "nodes": [
                    {"id": "n0", "type": "START", "nextId": "n1"},
                    {"id": "n1", "type": "QUESTION", "content": "Pick one",
                     "options": ["Sales", "Support"],
                     "connections": {"Sales": "n2", "Support": "n3"}},
                    {"id": "n2", "type": "MESSAGE", "content": "sales it is", "nextId": "n4"},
                    {"id": "n3", "type": "IMAGE", "imageUrl": "http://x/y.png",
                     "caption": "support", "nextId": "n4"},
                    {"id": "n4", "type": "END", "content": "bye"}
                ]
            }]
        }));

        assert!(config.idle_enabled);
        let flow = &config.flows[0];
        assert_eq!(flow.nodes[1].kind, NodeKind::Question);
        assert_eq!(flow.nodes[1].branch("Sales"), Some(&"n2".to_string()));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["flows"][0]["nodes"][0]["type"], "START");
        assert_eq!(back["flows"][0]["nodes"][3]["imageUrl"], "http://x/y.png");
    }

    #[test]
    fn valid_flow_has_no_issues() {
        let config = parse(json!({
            "flows": [{
                "id": "f1", "name": "ok", "triggers": ["hi"],
                "nodes": [
                    {"id": "a", "type": "START", "nextId": "b"},
                    {"id": "b", "type": "END"}
                ]
            }]
        }));
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn dangling_edge_is_reported_with_node_id() {
        let config = parse(json!({
            "flows": [{
                "id": "f1", "name": "broken", "triggers": [],
                "nodes": [
                    {"id": "a", "type": "START", "nextId": "ghost"}
                ]
            }]
        }));
        let issues = validate_config(&config);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].node_id.as_deref(), Some("a"));
        assert!(issues[0].message.contains("ghost"));
    }

    #[test]
    fn missing_start_and_unreachable_nodes_are_reported() {
        let config = parse(json!({
            "flows": [
                {"id": "f1", "name": "no start", "triggers": [],
                 "nodes": [{"id": "a", "type": "MESSAGE", "content": "x"}]},
                {"id": "f2", "name": "island", "triggers": [],
                 "nodes": [
                     {"id": "a", "type": "START", "nextId": "b"},
                     {"id": "b", "type": "END"},
                     {"id": "island", "type": "MESSAGE", "content": "lost"}
                 ]}
            ]
        }));
        let issues = validate_config(&config);
        assert!(issues.iter().any(|i| i.flow_id == "f1" && i.message.contains("no START")));
        assert!(
            issues
                .iter()
                .any(|i| i.flow_id == "f2" && i.node_id.as_deref() == Some("island"))
        );
    }

    #[test]
    fn branch_edges_count_for_reachability() {
        let config = parse(json!({
            "flows": [{
                "id": "f1", "name": "branches", "triggers": [],
                "nodes": [
                    {"id": "a", "type": "START", "nextId": "q"},
                    {"id": "q", "type": "QUESTION", "content": "?",
                     "connections": {"yes": "y", "no": "n"}},
                    {"id": "y", "type": "END"},
                    {"id": "n", "type": "END"}
                ]
            }]
        }));
        assert!(validate_config(&config).is_empty());
    }
}
