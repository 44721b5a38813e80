//! Persistence contracts. The engine never talks to a database directly;
//! it depends on these traits so storage stays pluggable. An in-memory
//! implementation is provided for tests and the CLI demo — durable
//! storage is out of scope for this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{NodeInstance, TaskInstance, WorkflowInstance, WorkflowTemplate};

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_template(&self, template_id: Uuid) -> Result<WorkflowTemplate>;
    async fn put_template(&self, template: WorkflowTemplate) -> Result<()>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance>;
    async fn put_instance(&self, instance: WorkflowInstance) -> Result<()>;
    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>>;

    /// Non-terminal instances of `template_base_id` owned by `executor_id`,
    /// consulted by `execute_workflow` to enforce "one running instance per
    /// (template, executor) pair at a time".
    async fn list_active_for(
        &self,
        template_base_id: Uuid,
        executor_id: &str,
    ) -> Result<Vec<WorkflowInstance>>;
}

#[async_trait]
pub trait NodeInstanceRepository: Send + Sync {
    async fn put_node_instance(&self, node_instance: NodeInstance) -> Result<()>;
    async fn list_node_instances(&self, instance_id: Uuid) -> Result<Vec<NodeInstance>>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn put_task(&self, task: TaskInstance) -> Result<()>;
    async fn get_task(&self, task_id: Uuid) -> Result<TaskInstance>;
    async fn list_by_instance(&self, instance_id: Uuid) -> Result<Vec<TaskInstance>>;
    async fn list_by_node_instance(&self, node_instance_id: Uuid) -> Result<Vec<TaskInstance>>;

    /// AGENT-type tasks still `Pending` (never enqueued, e.g. after an
    /// engine restart), capped at `limit`. Polled by the dispatcher's
    /// monitor loop to recover orphaned submissions.
    async fn list_pending_agent_tasks(&self, limit: usize) -> Result<Vec<TaskInstance>>;
}

#[derive(Default)]
struct Store {
    templates: HashMap<Uuid, WorkflowTemplate>,
    instances: HashMap<Uuid, WorkflowInstance>,
    node_instances: HashMap<Uuid, Vec<NodeInstance>>,
    tasks: HashMap<Uuid, TaskInstance>,
}

/// In-process store implementing every repository trait. Suitable for
/// tests and the CLI demo; not durable across process restarts.
pub struct InMemoryRepository {
    store: Mutex<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn get_template(&self, template_id: Uuid) -> Result<WorkflowTemplate> {
        self.store
            .lock()
            .unwrap()
            .templates
            .get(&template_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("template '{template_id}' not found")))
    }

    async fn put_template(&self, template: WorkflowTemplate) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .templates
            .insert(template.template_id, template);
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for InMemoryRepository {
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance> {
        self.store
            .lock()
            .unwrap()
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("instance '{instance_id}' not found")))
    }

    async fn put_instance(&self, instance: WorkflowInstance) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .instances
            .insert(instance.instance_id, instance);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>> {
        Ok(self.store.lock().unwrap().instances.values().cloned().collect())
    }

    async fn list_active_for(
        &self,
        template_base_id: Uuid,
        executor_id: &str,
    ) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| {
                i.template_base_id == template_base_id
                    && i.executor_id == executor_id
                    && !i.status.is_terminal()
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeInstanceRepository for InMemoryRepository {
    async fn put_node_instance(&self, node_instance: NodeInstance) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let entry = store.node_instances.entry(node_instance.instance_id).or_default();
        if let Some(existing) = entry.iter_mut().find(|n| n.node_id == node_instance.node_id) {
            *existing = node_instance;
        } else {
            entry.push(node_instance);
        }
        Ok(())
    }

    async fn list_node_instances(&self, instance_id: Uuid) -> Result<Vec<NodeInstance>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .node_instances
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn put_task(&self, task: TaskInstance) -> Result<()> {
        self.store.lock().unwrap().tasks.insert(task.task_id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskInstance> {
        self.store
            .lock()
            .unwrap()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}' not found")))
    }

    async fn list_by_instance(&self, instance_id: Uuid) -> Result<Vec<TaskInstance>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_by_node_instance(&self, node_instance_id: Uuid) -> Result<Vec<TaskInstance>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.node_instance_id == node_instance_id)
            .cloned()
            .collect())
    }

    async fn list_pending_agent_tasks(&self, limit: usize) -> Result<Vec<TaskInstance>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.task_type == crate::model::TaskType::Agent && t.status == crate::model::TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }
}
