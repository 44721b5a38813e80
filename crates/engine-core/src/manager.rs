//! Instance manager: a bounded registry of live `InstanceContext`s.
//!
//! The registry lock only ever guards the `HashMap` itself (insert/remove/
//! lookup); each `InstanceContext` has its own internal lock, so concurrent
//! operations against two different instances never contend, matching the
//! per-agent-handle isolation of the parallel supervisor this is grounded on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::context::InstanceContext;
use crate::error::{EngineError, Result};
use crate::model::WorkflowTemplate;

/// Registers and serves `InstanceContext`s for in-flight workflow runs.
pub struct InstanceManager {
    capacity: Option<usize>,
    contexts: RwLock<HashMap<Uuid, Arc<InstanceContext>>>,
}

impl InstanceManager {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a new context for `instance_id`. Errors with
    /// `CapacityExceeded` if the configured instance cap is already hit;
    /// callers are expected to retry after backoff or after some
    /// in-flight instance completes and is reclaimed.
    pub fn create(
        &self,
        instance_id: Uuid,
        template: WorkflowTemplate,
        workflow_global: serde_json::Value,
    ) -> Result<Arc<InstanceContext>> {
        let mut contexts = self.contexts.write().unwrap();

        if let Some(cap) = self.capacity {
            if contexts.len() >= cap {
                return Err(EngineError::CapacityExceeded(format!(
                    "instance manager at capacity ({cap} live instances)"
                )));
            }
        }

        if contexts.contains_key(&instance_id) {
            return Err(EngineError::IllegalState(format!(
                "instance '{instance_id}' already registered"
            )));
        }

        let ctx = Arc::new(InstanceContext::new(instance_id, template, workflow_global));
        contexts.insert(instance_id, ctx.clone());
        Ok(ctx)
    }

    pub fn get(&self, instance_id: Uuid) -> Result<Arc<InstanceContext>> {
        self.contexts
            .read()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("instance '{instance_id}' not registered")))
    }

    pub fn list(&self) -> Vec<Uuid> {
        self.contexts.read().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the context for `instance_id`, running `context.cleanup()` to
    /// release its state before removing the map entry. Refuses to remove
    /// a context whose instance is not yet fully terminal unless `force`
    /// is set — callers that need to abort a live instance should cancel
    /// it through the engine first.
    pub fn remove(&self, instance_id: Uuid, force: bool) -> Result<()> {
        let mut contexts = self.contexts.write().unwrap();
        let ctx = contexts
            .get(&instance_id)
            .ok_or_else(|| EngineError::NotFound(format!("instance '{instance_id}' not registered")))?;

        if !force && !ctx.is_fully_terminal() {
            return Err(EngineError::IllegalState(format!(
                "instance '{instance_id}' is not terminal; pass force=true to remove anyway"
            )));
        }

        let ctx = contexts.remove(&instance_id).unwrap();
        ctx.cleanup();
        Ok(())
    }

    /// Contexts whose every node instance is in a terminal state — the
    /// candidate set the resource cleanup manager sweeps.
    pub fn terminal_instances(&self) -> Vec<Uuid> {
        self.contexts
            .read()
            .unwrap()
            .iter()
            .filter(|(_, ctx)| ctx.is_fully_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Terminal contexts that have additionally sat idle past `ttl` since
    /// becoming terminal — the set the cleanup sweep actually reclaims, so a
    /// freshly-finished instance stays available for a short grace window
    /// (e.g. for a caller to read its summary) before being dropped.
    pub fn terminal_instances_older_than(&self, ttl: std::time::Duration) -> Vec<Uuid> {
        let now = Utc::now();
        self.contexts
            .read()
            .unwrap()
            .iter()
            .filter(|(_, ctx)| {
                ctx.terminal_since().is_some_and(|since| {
                    now.signed_duration_since(since) >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
                })
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
