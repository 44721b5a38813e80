//! Outbound workflow events. The engine reports lifecycle transitions
//! through these events; callers subscribe via an `EventSink` rather than
//! polling instance state. Shaped after the teacher's `RunEvent`/`EventKind`
//! pair, generalized from a single agent-race run to a whole workflow
//! instance's node/task lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstanceStarted,
    InstanceCompleted,
    InstanceFailed,
    InstanceCancelled,
    InstancePaused,
    InstanceResumed,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeCancelled,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub timestamp: DateTime<Utc>,
    pub instance_id: Uuid,
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub data: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(instance_id: Uuid, kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            instance_id,
            kind,
            node_id: None,
            task_id: None,
            data,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Receives a copy of every event published by the engine. Implementations
/// must not block: the engine publishes from inside its own execution loop
/// and a slow sink would stall scheduling.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: WorkflowEvent);
}

/// Broadcast-channel-backed sink. Subscribers that fall behind the
/// channel's capacity silently miss the oldest events (`broadcast`'s
/// standard lagging-receiver behavior) rather than stalling the publisher.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: WorkflowEvent) {
        // No subscribers is a normal state (e.g. in tests); ignore the error.
        let _ = self.tx.send(event);
    }
}

/// Sink that drops every event. Used where a caller has no interest in
/// the event stream but the engine still requires a sink to publish to.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: WorkflowEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_builder_sets_optional_fields() {
        let instance_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let event = WorkflowEvent::new(instance_id, EventKind::NodeStarted, serde_json::json!({}))
            .with_node("n1")
            .with_task(task_id);
        assert_eq!(event.node_id.as_deref(), Some("n1"));
        assert_eq!(event.task_id, Some(task_id));
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        let instance_id = Uuid::new_v4();
        sink.publish(WorkflowEvent::new(
            instance_id,
            EventKind::InstanceStarted,
            serde_json::json!({}),
        ));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id, instance_id);
        assert_eq!(received.kind, EventKind::InstanceStarted);
    }

    #[test]
    fn null_sink_accepts_without_panicking() {
        let sink = NullEventSink;
        sink.publish(WorkflowEvent::new(
            Uuid::new_v4(),
            EventKind::InstanceCompleted,
            serde_json::json!(null),
        ));
    }
}
