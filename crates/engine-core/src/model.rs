//! Data model: workflow templates, processors, and the per-run instance
//! records (`WorkflowInstance`, `NodeInstance`, `TaskInstance`).
//!
//! Templates are read-only to the engine and are expected to be supplied by
//! an external authoring/storage layer; the engine only ever reads them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow template (external, read-only to the core)
// ---------------------------------------------------------------------------

/// The kind of operation a template node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Processor,
    End,
}

/// A binding designating who executes a `Processor` node.
///
/// One node may carry multiple bindings; each yields a distinct task.
/// Modeled as an exhaustive tagged enum per the redesign note against
/// dynamic dispatch on task-type strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Processor {
    Human { user_id: String },
    Agent { agent_id: String },
    Mixed { user_id: String, agent_id: String },
}

impl Processor {
    pub fn task_type(&self) -> TaskType {
        match self {
            Processor::Human { .. } => TaskType::Human,
            Processor::Agent { .. } => TaskType::Agent,
            Processor::Mixed { .. } => TaskType::Mixed,
        }
    }
}

/// A node in the workflow template DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub task_description: String,
    pub processors: Vec<Processor>,
    pub depends_on: Vec<String>,
    pub retry_limit: u32,
}

/// Workflow template definition as a DAG. Immutable within a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub template_id: Uuid,
    pub template_base_id: Uuid,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowTemplate {
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn start_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    pub template_id: Uuid,
    pub template_base_id: Uuid,
    pub executor_id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub summary: Option<serde_json::Value>,
}

impl WorkflowInstance {
    pub fn new(
        template: &WorkflowTemplate,
        executor_id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        context: serde_json::Value,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            template_id: template.template_id,
            template_base_id: template.template_base_id,
            executor_id: executor_id.into(),
            name: name.into(),
            status: InstanceStatus::Pending,
            input,
            context,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            summary: None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_instance_id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub status: NodeInstanceStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstance {
    pub fn new(instance_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            node_instance_id: Uuid::new_v4(),
            instance_id,
            node_id: node_id.into(),
            status: NodeInstanceStatus::Pending,
            input: None,
            output: None,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some(end.signed_duration_since(start).num_milliseconds())
    }
}

// ---------------------------------------------------------------------------
// TaskInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Human,
    Agent,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_id: Uuid,
    pub node_instance_id: Uuid,
    pub instance_id: Uuid,
    pub task_type: TaskType,
    pub assigned_user: Option<String>,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub advisory_output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_duration_minutes: Option<u64>,
    pub error_message: Option<String>,
}

impl TaskInstance {
    pub fn new(
        node_instance_id: Uuid,
        instance_id: Uuid,
        processor: &Processor,
        input: serde_json::Value,
        context: serde_json::Value,
    ) -> Self {
        let (assigned_user, assigned_agent) = match processor {
            Processor::Human { user_id } => (Some(user_id.clone()), None),
            Processor::Agent { agent_id } => (None, Some(agent_id.clone())),
            Processor::Mixed { user_id, agent_id } => {
                (Some(user_id.clone()), Some(agent_id.clone()))
            }
        };

        Self {
            task_id: Uuid::new_v4(),
            node_instance_id,
            instance_id,
            task_type: processor.task_type(),
            assigned_user,
            assigned_agent,
            status: TaskStatus::Pending,
            input,
            context,
            output: None,
            result_summary: None,
            advisory_output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            actual_duration_minutes: None,
            error_message: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some(end.signed_duration_since(start).num_milliseconds())
    }
}

// ---------------------------------------------------------------------------
// Upstream context envelope
// ---------------------------------------------------------------------------

/// Static info about the node a task belongs to, carried in the envelope
/// so a task can describe itself without a round-trip to the template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub task_description: String,
}

/// The typed envelope handed to a task as its input/context payload.
///
/// Inner values stay opaque `serde_json::Value`s per the redesign note on
/// free-form JSON payloads: the engine parses the envelope shape but never
/// the node-specific contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamContext {
    pub immediate_upstream: BTreeMap<String, serde_json::Value>,
    pub workflow_global: serde_json::Value,
    pub node_info: Option<NodeInfo>,
}
