//! Agent task dispatcher: a bounded worker pool draining a FIFO submission
//! queue, calling out through an `AgentClient`, and notifying subscribers
//! of completion/failure. Cancellation is delivered via a oneshot channel
//! per in-flight task, the same handle shape the single-process supervisor
//! uses for its own cancel signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent_client::{AgentClient, AgentTaskRequest, TaskMetadata};
use crate::error::{EngineError, Result};
use crate::model::UpstreamContext;

/// Notified when a submitted task finishes, one way or the other.
/// Implementations must not block the calling worker thread.
pub trait TaskCompletionSubscriber: Send + Sync {
    fn on_task_completed(&self, task_id: Uuid, output: serde_json::Value);
    fn on_task_failed(&self, task_id: Uuid, error: String);
}

struct Submission {
    task_id: Uuid,
    agent_id: String,
    task_description: String,
    upstream_context: UpstreamContext,
    timeout: Duration,
}

struct InFlight {
    cancel_tx: oneshot::Sender<()>,
}

struct Shared {
    client: Arc<dyn AgentClient>,
    subscribers: Mutex<Vec<Arc<dyn TaskCompletionSubscriber>>>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    semaphore: Arc<Semaphore>,
}

/// Dispatches agent tasks across a bounded worker pool. The pool size caps
/// concurrent outbound agent calls; submissions beyond that bound queue in
/// the unbounded FIFO channel rather than being rejected, since a task
/// queue depth is a monitoring signal, not a hard capacity the caller must
/// handle as `CapacityExceeded`.
pub struct AgentTaskDispatcher {
    tx: mpsc::UnboundedSender<Submission>,
    shared: Arc<Shared>,
}

impl AgentTaskDispatcher {
    pub fn new(client: Arc<dyn AgentClient>, worker_pool_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Submission>();
        let shared = Arc::new(Shared {
            client,
            subscribers: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(worker_pool_size)),
        });

        spawn_dispatch_loop(rx, shared.clone());

        Self { tx, shared }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn TaskCompletionSubscriber>) {
        self.shared.subscribers.lock().unwrap().push(subscriber);
    }

    /// Enqueue a task for execution. Returns immediately; completion is
    /// delivered asynchronously to subscribers.
    pub fn submit(
        &self,
        task_id: Uuid,
        agent_id: impl Into<String>,
        task_description: impl Into<String>,
        upstream_context: UpstreamContext,
        timeout: Duration,
    ) -> Result<()> {
        self.tx
            .send(Submission {
                task_id,
                agent_id: agent_id.into(),
                task_description: task_description.into(),
                upstream_context,
                timeout,
            })
            .map_err(|_| EngineError::Internal("dispatcher loop has shut down".into()))
    }

    /// Request cancellation of an in-flight task. A no-op (returns
    /// `NotFound`) if the task already completed or was never submitted —
    /// completion and cancellation race harmlessly: whichever lands first
    /// wins, and the loser's signal is simply dropped.
    pub fn cancel(&self, task_id: Uuid) -> Result<()> {
        let mut in_flight = self.shared.in_flight.lock().unwrap();
        match in_flight.remove(&task_id) {
            Some(entry) => {
                let _ = entry.cancel_tx.send(());
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "task '{task_id}' is not in flight"
            ))),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().unwrap().len()
    }
}

fn spawn_dispatch_loop(mut rx: mpsc::UnboundedReceiver<Submission>, shared: Arc<Shared>) {
    tokio::spawn(async move {
        while let Some(submission) = rx.recv().await {
            let permit = match shared.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_one(shared, submission).await;
            });
        }
        debug!("agent task dispatcher loop exiting: submission channel closed");
    });
}

async fn run_one(shared: Arc<Shared>, submission: Submission) {
    let task_id = submission.task_id;
    let (cancel_tx, cancel_rx) = oneshot::channel();
    shared
        .in_flight
        .lock()
        .unwrap()
        .insert(task_id, InFlight { cancel_tx });

    let user_message = serde_json::to_string_pretty(&submission.upstream_context)
        .unwrap_or_else(|_| "{}".to_string());

    let request = AgentTaskRequest {
        task_id,
        system_prompt: format!(
            "You are agent '{}'. Complete the following task using only the upstream context provided.",
            submission.agent_id
        ),
        user_message,
        images: Vec::new(),
        has_multimodal_content: false,
        task_metadata: TaskMetadata {
            task_title: submission.task_description.clone(),
            task_description: submission.task_description,
            estimated_duration: None,
        },
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout(submission.timeout, shared.client.run_task(request)) => {
            match result {
                Ok(Ok(response)) => Ok(response.output),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("agent call for task '{task_id}' exceeded its timeout")),
            }
        }
        _ = cancel_rx => {
            Err(format!("task '{task_id}' was cancelled"))
        }
    };

    let still_in_flight = shared.in_flight.lock().unwrap().remove(&task_id).is_some();
    if !still_in_flight {
        // Cancellation raced us to removal after the sender already fired;
        // the cancel path's error message is authoritative either way.
    }

    let subscribers = shared.subscribers.lock().unwrap().clone();
    match outcome {
        Ok(output) => {
            info!(%task_id, "agent task completed");
            for sub in &subscribers {
                sub.on_task_completed(task_id, output.clone());
            }
        }
        Err(error) => {
            warn!(%task_id, %error, "agent task did not complete successfully");
            for sub in &subscribers {
                sub.on_task_failed(task_id, error.clone());
            }
        }
    }
}
