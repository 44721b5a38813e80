//! Outbound agent client contract. The dispatcher calls through this
//! trait to hand a task to whatever AI-agent backend a deployment wires
//! up; a real HTTP/gRPC client is out of scope for this crate, so only a
//! simulated implementation is provided here for tests and the CLI demo.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// An image attachment carried alongside a task's prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentImage {
    pub name: String,
    pub content_type: String,
    pub base64: String,
}

/// Descriptive metadata about the node a task was materialized from,
/// carried alongside the prompt rather than folded into it so an agent
/// backend can log or route on it without parsing free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub task_title: String,
    pub task_description: String,
    pub estimated_duration: Option<String>,
}

/// On-wire request sent to an agent backend for a single task. The shape
/// mirrors a chat-completion call: a system prompt carrying the node's
/// instructions, a user message carrying the upstream context folded into
/// readable text, and an optional image set for multimodal backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRequest {
    pub task_id: Uuid,
    pub system_prompt: String,
    pub user_message: String,
    pub images: Vec<AgentImage>,
    pub has_multimodal_content: bool,
    pub task_metadata: TaskMetadata,
}

/// On-wire response from an agent backend for a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskResponse {
    pub task_id: Uuid,
    pub output: serde_json::Value,
    pub advisory_output: Option<serde_json::Value>,
}

#[async_trait::async_trait]
pub trait AgentClient: Send + Sync {
    async fn run_task(&self, request: AgentTaskRequest) -> Result<AgentTaskResponse>;
}

/// Deterministic stand-in backend: echoes the request's user message back
/// as output. Used by the CLI demo and by dispatcher tests that don't care
/// about real agent behavior, only about dispatch/cancellation plumbing.
pub struct SimulatedAgentClient;

#[async_trait::async_trait]
impl AgentClient for SimulatedAgentClient {
    async fn run_task(&self, request: AgentTaskRequest) -> Result<AgentTaskResponse> {
        Ok(AgentTaskResponse {
            task_id: request.task_id,
            output: serde_json::json!({
                "simulated": true,
                "task_title": request.task_metadata.task_title,
                "echoed_user_message": request.user_message,
            }),
            advisory_output: None,
        })
    }
}
