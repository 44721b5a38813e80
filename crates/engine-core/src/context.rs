//! Instance context: per-workflow-run in-memory state machine.
//!
//! A single `InstanceContext` tracks every `NodeInstance`/`TaskInstance`
//! belonging to one `WorkflowInstance`. All mutation goes through one
//! `Mutex`-guarded `State`; every public method is a single lock acquisition
//! so callers never hold the lock across an `.await`. Completion callbacks
//! are invoked synchronously, in registration order, with the lock already
//! released.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    NodeInfo, NodeInstance, NodeInstanceStatus, TaskInstance, TaskStatus, UpstreamContext,
    WorkflowTemplate,
};

/// Invoked whenever a node instance transitions to `Completed`, with the
/// set of node ids newly unblocked by that completion (the "delta" the
/// engine should schedule next). Registered in order; called in order.
pub trait CompletionListener: Send + Sync {
    fn on_node_ready(&self, instance_id: Uuid, newly_ready: &[String]);
}

struct State {
    template: WorkflowTemplate,
    node_instances: HashMap<String, NodeInstance>,
    task_instances: HashMap<Uuid, TaskInstance>,
    completed: HashSet<String>,
    outputs: BTreeMap<String, serde_json::Value>,
    workflow_global: serde_json::Value,
    closed: bool,
    terminal_since: Option<chrono::DateTime<Utc>>,
}

/// Per-instance state machine. Cheap to construct; expensive to leak —
/// the `InstanceManager` owns the lifetime and the `ResourceCleanupManager`
/// reclaims it once the instance reaches a terminal status.
pub struct InstanceContext {
    instance_id: Uuid,
    state: Mutex<State>,
    listeners: Mutex<Vec<Box<dyn CompletionListener>>>,
}

impl InstanceContext {
    pub fn new(instance_id: Uuid, template: WorkflowTemplate, workflow_global: serde_json::Value) -> Self {
        Self {
            instance_id,
            state: Mutex::new(State {
                template,
                node_instances: HashMap::new(),
                task_instances: HashMap::new(),
                completed: HashSet::new(),
                outputs: BTreeMap::new(),
                workflow_global,
                closed: false,
                terminal_since: None,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn register_completion_listener(&self, listener: Box<dyn CompletionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Register a fresh `NodeInstance` for `node_id`, transitioning it to
    /// `Pending`. Idempotent re-registration is rejected: a node instance
    /// is created exactly once per run.
    pub fn register_node(&self, node_id: &str) -> Result<NodeInstance> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        if state.node_instances.contains_key(node_id) {
            return Err(EngineError::IllegalState(format!(
                "node '{node_id}' already registered on instance '{}'",
                self.instance_id
            )));
        }
        if state.template.node(node_id).is_none() {
            return Err(EngineError::NotFound(format!(
                "node '{node_id}' not present in template"
            )));
        }
        let node_instance = NodeInstance::new(self.instance_id, node_id);
        state
            .node_instances
            .insert(node_id.to_string(), node_instance.clone());
        Ok(node_instance)
    }

    pub fn register_task(&self, task: TaskInstance) {
        self.state.lock().unwrap().task_instances.insert(task.task_id, task);
    }

    pub fn mark_node_executing(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        let node = get_node_mut(&mut state.node_instances, node_id)?;
        if node.status != NodeInstanceStatus::Pending {
            return Err(EngineError::IllegalState(format!(
                "node '{node_id}' cannot start from status {:?}",
                node.status
            )));
        }
        node.status = NodeInstanceStatus::Running;
        node.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a node completed and return the set of node ids that became
    /// newly ready as a result. Registered listeners are notified with the
    /// lock already released.
    ///
    /// Idempotent: calling this twice with the same `node_id` after the
    /// first call already completed it is a no-op that returns an empty
    /// Δ-set rather than an error — the first call's output is authoritative
    /// and is left untouched.
    pub fn mark_node_completed(
        &self,
        node_id: &str,
        output: serde_json::Value,
    ) -> Result<Vec<String>> {
        let newly_ready = {
            let mut state = self.state.lock().unwrap();
            check_open(&state)?;
            let node = get_node_mut(&mut state.node_instances, node_id)?;
            if node.status == NodeInstanceStatus::Completed {
                return Ok(Vec::new());
            }
            if node.status.is_terminal_like() {
                return Err(EngineError::IllegalState(format!(
                    "node '{node_id}' already in terminal status {:?}",
                    node.status
                )));
            }
            node.status = NodeInstanceStatus::Completed;
            node.completed_at = Some(Utc::now());
            node.output = Some(output.clone());
            state.outputs.insert(node_id.to_string(), output);
            state.completed.insert(node_id.to_string());

            let ready = ready_successors(&state.template, &state.completed);
            mark_terminal_if_complete(&mut state);
            ready
        };

        self.notify(&newly_ready);
        Ok(newly_ready)
    }

    /// Idempotent: a node already `Failed` stays as-is and the call
    /// succeeds silently, matching `mark_node_completed`'s idempotency.
    ///
    /// Cascades: every strict descendant of `node_id` (transitively, via
    /// `depends_on`) that is not already terminal is marked `Cancelled` and
    /// no task is ever materialized for it. Sibling branches that do not
    /// depend on `node_id` are untouched. Returns the ids cancelled by this
    /// call so the engine can announce them.
    pub fn mark_node_failed(&self, node_id: &str, error_message: impl Into<String>) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        let node = get_node_mut(&mut state.node_instances, node_id)?;
        if node.status == NodeInstanceStatus::Failed {
            return Ok(Vec::new());
        }
        if node.status.is_terminal_like() {
            return Err(EngineError::IllegalState(format!(
                "node '{node_id}' already in terminal status {:?}",
                node.status
            )));
        }
        node.status = NodeInstanceStatus::Failed;
        node.completed_at = Some(Utc::now());
        node.error_message = Some(error_message.into());

        let descendants = transitive_descendants(&state.template, node_id);
        let mut cancelled = Vec::new();
        for desc in descendants {
            if let Some(n) = state.node_instances.get_mut(&desc) {
                if !n.status.is_terminal_like() {
                    n.status = NodeInstanceStatus::Cancelled;
                    n.completed_at = Some(Utc::now());
                    cancelled.push(desc);
                }
            }
        }
        mark_terminal_if_complete(&mut state);
        Ok(cancelled)
    }

    /// Bump a node's retry counter and return the new count. Called before
    /// redispatching a failed node's tasks so the engine can compare
    /// against `WorkflowNode::retry_limit`.
    pub fn increment_retry(&self, node_id: &str) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        let node = get_node_mut(&mut state.node_instances, node_id)?;
        node.retry_count += 1;
        node.status = NodeInstanceStatus::Running;
        node.completed_at = None;
        node.error_message = None;
        Ok(node.retry_count)
    }

    pub fn mark_node_cancelled(&self, node_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        let node = get_node_mut(&mut state.node_instances, node_id)?;
        if node.status.is_terminal_like() {
            return Ok(());
        }
        node.status = NodeInstanceStatus::Cancelled;
        node.completed_at = Some(Utc::now());
        mark_terminal_if_complete(&mut state);
        Ok(())
    }

    /// True when every `depends_on` entry for `node_id` is already completed.
    pub fn is_ready_to_execute(&self, node_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        let node = state
            .template
            .node(node_id)
            .ok_or_else(|| EngineError::NotFound(format!("node '{node_id}' not in template")))?;
        Ok(node.depends_on.iter().all(|d| state.completed.contains(d)))
    }

    /// Build the typed envelope a task for `node_id` should receive: the
    /// outputs of its immediate upstream nodes plus the instance-wide
    /// global context.
    pub fn get_upstream_context(&self, node_id: &str) -> Result<UpstreamContext> {
        let state = self.state.lock().unwrap();
        let node = state
            .template
            .node(node_id)
            .ok_or_else(|| EngineError::NotFound(format!("node '{node_id}' not in template")))?;

        let mut immediate_upstream = BTreeMap::new();
        for dep in &node.depends_on {
            if let Some(output) = state.outputs.get(dep) {
                immediate_upstream.insert(dep.clone(), output.clone());
            }
        }

        Ok(UpstreamContext {
            immediate_upstream,
            workflow_global: state.workflow_global.clone(),
            node_info: Some(NodeInfo {
                node_id: node.node_id.clone(),
                task_description: node.task_description.clone(),
            }),
        })
    }

    pub fn node_status(&self, node_id: &str) -> Result<NodeInstanceStatus> {
        let state = self.state.lock().unwrap();
        state
            .node_instances
            .get(node_id)
            .map(|n| n.status)
            .ok_or_else(|| EngineError::NotFound(format!("node '{node_id}' not registered")))
    }

    pub fn node_instance(&self, node_id: &str) -> Result<NodeInstance> {
        let state = self.state.lock().unwrap();
        state
            .node_instances
            .get(node_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("node '{node_id}' not registered")))
    }

    pub fn all_node_instances(&self) -> Vec<NodeInstance> {
        self.state.lock().unwrap().node_instances.values().cloned().collect()
    }

    pub fn all_task_instances(&self) -> Vec<TaskInstance> {
        self.state.lock().unwrap().task_instances.values().cloned().collect()
    }

    pub fn update_task(&self, task_id: Uuid, f: impl FnOnce(&mut TaskInstance)) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        check_open(&state)?;
        let task = state
            .task_instances
            .get_mut(&task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}' not registered")))?;
        f(task);
        Ok(())
    }

    /// True once every node instance is in a terminal state.
    pub fn is_fully_terminal(&self) -> bool {
        let state = self.state.lock().unwrap();
        is_fully_terminal_state(&state)
    }

    /// When this context first became fully terminal, if it has. Consulted
    /// by the cleanup sweep so a context is only reclaimed once it has sat
    /// idle past the configured TTL, not the instant it finishes.
    pub fn terminal_since(&self) -> Option<chrono::DateTime<Utc>> {
        self.state.lock().unwrap().terminal_since
    }

    /// Coarse status snapshot for `get_workflow_status`.
    pub fn status(&self) -> ContextStatus {
        let state = self.state.lock().unwrap();
        let mut pending = 0;
        let mut executing = 0;
        let mut completed = 0;
        let mut failed = 0;
        for node in state.node_instances.values() {
            match node.status {
                NodeInstanceStatus::Pending => pending += 1,
                NodeInstanceStatus::Running => executing += 1,
                NodeInstanceStatus::Completed => completed += 1,
                NodeInstanceStatus::Failed => failed += 1,
                NodeInstanceStatus::Cancelled => {}
            }
        }
        ContextStatus {
            total_nodes: state.node_instances.len(),
            completed,
            executing,
            pending,
            failed,
        }
    }

    /// Release this context's state. Every subsequent operation fails with
    /// `ContextClosed`; the `InstanceManager` calls this right before
    /// dropping its map entry for the instance.
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.node_instances.clear();
        state.task_instances.clear();
        state.outputs.clear();
        self.listeners.lock().unwrap().clear();
    }

    fn notify(&self, newly_ready: &[String]) {
        if newly_ready.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener.on_node_ready(self.instance_id, newly_ready);
        }
    }
}

impl NodeInstanceStatus {
    fn is_terminal_like(self) -> bool {
        matches!(
            self,
            NodeInstanceStatus::Completed
                | NodeInstanceStatus::Failed
                | NodeInstanceStatus::Cancelled
        )
    }
}

/// Coarse-grained node-status counts for `get_workflow_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStatus {
    pub total_nodes: usize,
    pub completed: usize,
    pub executing: usize,
    pub pending: usize,
    pub failed: usize,
}

fn is_fully_terminal_state(state: &State) -> bool {
    !state.node_instances.is_empty()
        && state.node_instances.values().all(|n| n.status.is_terminal_like())
}

fn mark_terminal_if_complete(state: &mut State) {
    if state.terminal_since.is_none() && is_fully_terminal_state(state) {
        state.terminal_since = Some(Utc::now());
    }
}

fn check_open(state: &State) -> Result<()> {
    if state.closed {
        return Err(EngineError::ContextClosed(
            "instance context has been cleaned up".to_string(),
        ));
    }
    Ok(())
}

fn get_node_mut<'a>(
    nodes: &'a mut HashMap<String, NodeInstance>,
    node_id: &str,
) -> Result<&'a mut NodeInstance> {
    nodes
        .get_mut(node_id)
        .ok_or_else(|| EngineError::NotFound(format!("node '{node_id}' not registered")))
}

/// Every node reachable from `node_id` by following `depends_on` edges
/// forward (i.e. every node that transitively depends on `node_id`),
/// sorted for deterministic output.
fn transitive_descendants(template: &WorkflowTemplate, node_id: &str) -> Vec<String> {
    let mut downstream_map: HashMap<&str, Vec<&str>> = HashMap::new();
    for n in &template.nodes {
        for dep in &n.depends_on {
            downstream_map.entry(dep.as_str()).or_default().push(n.node_id.as_str());
        }
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(node_id);
    while let Some(cur) = queue.pop_front() {
        if let Some(children) = downstream_map.get(cur) {
            for &child in children {
                if seen.insert(child.to_string()) {
                    queue.push_back(child);
                }
            }
        }
    }
    let mut v: Vec<String> = seen.into_iter().collect();
    v.sort();
    v
}

fn ready_successors(template: &WorkflowTemplate, completed: &HashSet<String>) -> Vec<String> {
    template
        .nodes
        .iter()
        .filter(|n| !completed.contains(&n.node_id))
        .filter(|n| !n.depends_on.is_empty())
        .filter(|n| n.depends_on.iter().all(|d| completed.contains(d)))
        .map(|n| n.node_id.clone())
        .collect()
}
