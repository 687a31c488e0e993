use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::session::{ConversationSession, SessionStore};
use super::{Flow, FlowConfig, FlowNode, NodeKind, flows_key};
use crate::profile::load_profiles;
use crate::store::JsonStore;
use crate::transport::Outbound;

/// Sent when a conversation is dropped for inactivity.
pub const EXPIRY_NOTICE: &str = "Session expired due to inactivity.";
/// Sent when an answer matches none of a question's options.
pub const OPTION_REPROMPT: &str =
    "Please select one of the options by typing the number or the text.";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Side-effect hook behind ACTION nodes. The engine only knows the opaque
/// action identifier; what it means belongs to the integrator.
#[async_trait]
pub trait ActionHook: Send + Sync {
    async fn run(&self, profile_id: &str, contact_id: &str, action: &str);
}

/// Default hook: record that the action fired and move on.
pub struct LogActionHook;

#[async_trait]
impl ActionHook for LogActionHook {
    async fn run(&self, profile_id: &str, contact_id: &str, action: &str) {
        info!("Executing action `{action}` for {profile_id}/{contact_id}");
    }
}

/// Drives per-contact scripted dialogues. All conversation state lives in
/// the store, so a restart picks up mid-flow conversations where they were.
/// Flow definitions are reloaded from the store on every message to honour
/// edits made while a conversation is running.
pub struct FlowEngine {
    store: Arc<JsonStore>,
    sessions: SessionStore,
    outbound: Arc<dyn Outbound>,
    actions: Arc<dyn ActionHook>,
}

impl FlowEngine {
    pub fn new(store: Arc<JsonStore>, outbound: Arc<dyn Outbound>) -> Arc<Self> {
        Arc::new(FlowEngine {
            sessions: SessionStore::new(store.clone()),
            store,
            outbound,
            actions: Arc::new(LogActionHook),
        })
    }

    pub fn with_actions(
        store: Arc<JsonStore>,
        outbound: Arc<dyn Outbound>,
        actions: Arc<dyn ActionHook>,
    ) -> Arc<Self> {
        Arc::new(FlowEngine {
            sessions: SessionStore::new(store.clone()),
            store,
            outbound,
            actions,
        })
    }

    /// Read the profile's flow config, writing the default back on first use
    /// so the editor always finds a file to open.
    pub fn load_config(&self, profile_id: &str) -> FlowConfig {
        let key = flows_key(profile_id);
        if !self.store.exists(&key) {
            let default = FlowConfig::default();
            self.store.set(&key, &default);
            return default;
        }
        self.store.get(&key)
    }

    /// Entry point for every inbound text of a non-group conversation.
    pub async fn handle_message(&self, profile_id: &str, contact_id: &str, text: &str) {
        let config = self.load_config(profile_id);
        let normalized = normalize_text(text);
        let now = Utc::now().timestamp_millis();

        if let Some(mut session) = self.sessions.get(profile_id, contact_id) {
            if session.expired(now) {
                // Expired: notify, drop, and treat the message as session-less.
                self.end_session(profile_id, contact_id, Some(EXPIRY_NOTICE)).await;
            } else {
                let flow = config.flows.iter().find(|f| f.id == session.active_flow_id);
                let node = flow.and_then(|f| f.node(&session.current_node_id));
                if let (Some(flow), Some(node)) = (flow, node) {
                    session.last_activity = now;

                    if node.kind != NodeKind::Question {
                        // Nothing should be waiting for input here; bail out
                        // of the conversation instead of guessing.
                        debug!(
                            "Session for {profile_id}/{contact_id} idles on `{}` ({:?}); ending",
                            node.id, node.kind
                        );
                        self.sessions.remove(profile_id, contact_id);
                        return;
                    }

                    session.record_answer(&node.id, text);
                    self.sessions.put(profile_id, session);

                    match resolve_question_branch(node, &normalized) {
                        Some(next) => {
                            self.process_node(profile_id, contact_id, flow, next).await;
                        }
                        None => {
                            if node.options.as_ref().is_some_and(|o| !o.is_empty()) {
                                self.send_text(profile_id, contact_id, OPTION_REPROMPT).await;
                            } else {
                                self.end_session(profile_id, contact_id, None).await;
                            }
                        }
                    }
                    return;
                }

                // The flow or node went away under us; self-heal silently.
                debug!(
                    "Stale session for {profile_id}/{contact_id} (flow `{}`); discarding",
                    session.active_flow_id
                );
                self.sessions.remove(profile_id, contact_id);
            }
        }

        // No usable session: look for a flow whose trigger matches.
        for flow in &config.flows {
            if flow.triggers.iter().any(|t| trigger_matches(&normalized, t)) {
                self.start_flow(profile_id, contact_id, flow).await;
                return;
            }
        }

        if config.idle_enabled {
            if let Some(idle) = &config.idle_message {
                self.send_text(profile_id, contact_id, idle).await;
            }
        }
    }

    async fn start_flow(&self, profile_id: &str, contact_id: &str, flow: &Flow) {
        let Some(start) = flow.start_node() else {
            warn!("Flow `{}` has no START node; ignoring trigger", flow.id);
            return;
        };

        self.sessions.put(
            profile_id,
            ConversationSession {
                contact_id: contact_id.to_string(),
                active_flow_id: flow.id.clone(),
                current_node_id: start.id.clone(),
                answers: Vec::new(),
                last_activity: Utc::now().timestamp_millis(),
            },
        );

        if let Some(next) = start.next_id.clone() {
            self.process_node(profile_id, contact_id, flow, next).await;
        }
    }

    /// Walk the flow from `node_id` until a node blocks on input or the
    /// conversation ends. The session pointer is persisted before each node
    /// runs so a crash mid-walk resumes at the right place.
    async fn process_node(&self, profile_id: &str, contact_id: &str, flow: &Flow, node_id: String) {
        let mut current = node_id;
        loop {
            let Some(node) = flow.node(&current) else {
                debug!("Node `{current}` missing from flow `{}`; discarding session", flow.id);
                self.sessions.remove(profile_id, contact_id);
                return;
            };

            if let Some(mut session) = self.sessions.get(profile_id, contact_id) {
                session.current_node_id = node.id.clone();
                self.sessions.put(profile_id, session);
            }

            match node.kind {
                NodeKind::Start => {
                    // Only reachable through a mislinked edge; skip through.
                    match node.next_id.clone() {
                        Some(next) => current = next,
                        None => return,
                    }
                }
                NodeKind::Message => {
                    self.send_text(profile_id, contact_id, node.content.as_deref().unwrap_or(""))
                        .await;
                    match node.next_id.clone() {
                        Some(next) => current = next,
                        None => return,
                    }
                }
                NodeKind::Image => {
                    if let Some(url) = &node.image_url {
                        self.send_image(profile_id, contact_id, url, node.caption.as_deref())
                            .await;
                    }
                    match node.next_id.clone() {
                        Some(next) => current = next,
                        None => return,
                    }
                }
                NodeKind::Question => {
                    self.send_text(profile_id, contact_id, &render_question(node)).await;
                    // Blocked: the next inbound message answers this node.
                    return;
                }
                NodeKind::Condition => {
                    let last = self
                        .sessions
                        .get(profile_id, contact_id)
                        .and_then(|s| s.last_answer().map(str::to_string));
                    match resolve_condition_branch(node, last.as_deref()) {
                        Some(next) => current = next,
                        None => {
                            self.end_session(profile_id, contact_id, None).await;
                            return;
                        }
                    }
                }
                NodeKind::Action => {
                    if let Some(action) = &node.action {
                        self.actions.run(profile_id, contact_id, action).await;
                    }
                    match node.next_id.clone() {
                        Some(next) => current = next,
                        None => return,
                    }
                }
                NodeKind::End => {
                    if let Some(content) = &node.content {
                        self.send_text(profile_id, contact_id, content).await;
                    }
                    self.end_session(profile_id, contact_id, None).await;
                    return;
                }
            }
        }
    }

    async fn end_session(&self, profile_id: &str, contact_id: &str, notice: Option<&str>) {
        if let Some(notice) = notice {
            self.send_text(profile_id, contact_id, notice).await;
        }
        self.sessions.remove(profile_id, contact_id);
    }

    /// Expire sessions that went quiet, even without a new inbound message.
    pub async fn sweep_expired(&self) {
        let now = Utc::now().timestamp_millis();
        for profile in load_profiles(&self.store) {
            for (contact_id, session) in self.sessions.load(&profile.id) {
                if session.expired(now) {
                    info!("Expiring idle conversation {}/{contact_id}", profile.id);
                    self.end_session(&profile.id, &contact_id, Some(EXPIRY_NOTICE)).await;
                }
            }
        }
    }

    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                me.sweep_expired().await;
            }
        })
    }

    async fn send_text(&self, profile_id: &str, contact_id: &str, text: &str) {
        if let Err(e) = self.outbound.send_text(profile_id, contact_id, text).await {
            warn!("Could not send to {profile_id}/{contact_id}: {e}");
        }
    }

    async fn send_image(&self, profile_id: &str, contact_id: &str, url: &str, caption: Option<&str>) {
        if let Err(e) = self.outbound.send_image(profile_id, contact_id, url, caption).await {
            warn!("Could not send image to {profile_id}/{contact_id}: {e}");
        }
    }
}

/// Strip punctuation and symbols, collapse whitespace, lowercase.
pub fn normalize_text(text: &str) -> String {
    let kept: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// A trigger matches the whole message, one of its tokens, or any substring
/// of it, all after normalization.
fn trigger_matches(normalized_message: &str, trigger: &str) -> bool {
    let trigger = normalize_text(trigger);
    if trigger.is_empty() {
        return false;
    }
    normalized_message == trigger
        || normalized_message.split_whitespace().any(|word| word == trigger)
        || normalized_message.contains(&trigger)
}

/// Resolve a QUESTION answer to the next node, in order: exact label match,
/// numeric option selection, bidirectional substring, then the default edge.
fn resolve_question_branch(node: &FlowNode, normalized: &str) -> Option<String> {
    if let Some(connections) = &node.connections {
        for (label, target) in connections {
            if normalized == label.to_lowercase() {
                return Some(target.clone());
            }
        }

        if let Some(options) = &node.options {
            if let Some(choice) = normalized.split_whitespace().next().and_then(|t| t.parse::<usize>().ok()) {
                if choice >= 1 && choice <= options.len() {
                    if let Some(target) = connections.get(&options[choice - 1]) {
                        return Some(target.clone());
                    }
                }
            }
        }

        if !normalized.is_empty() {
            for (label, target) in connections {
                let label = label.to_lowercase();
                if !label.is_empty()
                    && (normalized.contains(&label) || label.contains(normalized))
                {
                    return Some(target.clone());
                }
            }
        }
    }

    node.next_id
        .clone()
        .or_else(|| node.branch("default").cloned())
}

/// CONDITION keeps the observed heuristic: the first branch whose label is a
/// case-insensitive substring of the last answer, else the `default` label.
fn resolve_condition_branch(node: &FlowNode, last_answer: Option<&str>) -> Option<String> {
    match &node.connections {
        Some(connections) => {
            if let Some(answer) = last_answer {
                let answer = answer.to_lowercase();
                for (label, target) in connections {
                    if answer.contains(&label.to_lowercase()) {
                        return Some(target.clone());
                    }
                }
            }
            connections.get("default").cloned()
        }
        None => node.next_id.clone(),
    }
}

fn render_question(node: &FlowNode) -> String {
    let mut text = node.content.clone().unwrap_or_default();
    if let Some(options) = &node.options {
        if !options.is_empty() {
            text.push_str("\n\n");
            let numbered: Vec<String> = options
                .iter()
                .enumerate()
                .map(|(i, opt)| format!("{}. {opt}", i + 1))
                .collect();
            text.push_str(&numbered.join("\n"));
        }
    }
    text
}
