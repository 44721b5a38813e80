//! Thin demo binary: exercises `ExecutionEngine` against an in-memory
//! repository and a simulated agent client so the core library has a
//! runnable entry point without pulling in any real persistence, HTTP, or
//! agent backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use engine_core::agent_client::SimulatedAgentClient;
use engine_core::config::{load_config, EngineConfig};
use engine_core::context::InstanceContext;
use engine_core::dependency::DependencyTracker;
use engine_core::engine::ExecutionEngine;
use engine_core::events::{EventKind, EventSink, WorkflowEvent};
use engine_core::manager::InstanceManager;
use engine_core::model::{NodeType, Processor, WorkflowNode, WorkflowTemplate};

#[derive(Parser)]
#[command(name = "workflow-engine", version, about = "Workflow execution engine demo CLI")]
struct Cli {
    /// Path to an `engine.toml` config file; defaults are used if absent.
    #[arg(long, global = true, default_value = "engine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a small built-in demo workflow end to end and print its summary.
    Run {
        /// Identity the workflow executes on behalf of.
        #[arg(long, default_value = "demo-user")]
        executor_id: String,
        /// Resolve the human-gated review step automatically instead of
        /// waiting on stdin.
        #[arg(long)]
        auto_approve: bool,
    },
    /// Load and validate a config file, printing the resolved values.
    CheckConfig,
}

struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, event: WorkflowEvent) {
        match event.kind {
            EventKind::InstanceCompleted | EventKind::InstanceFailed | EventKind::InstanceCancelled => {
                tracing::info!(instance_id = %event.instance_id, kind = ?event.kind, "instance reached a terminal state");
            }
            _ => {
                tracing::debug!(instance_id = %event.instance_id, kind = ?event.kind, node_id = ?event.node_id, "workflow event");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    engine_core::init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli.config).context("loading engine config")?;

    match cli.command {
        Some(Command::Run {
            executor_id,
            auto_approve,
        }) => run_demo(config, executor_id, auto_approve).await,
        Some(Command::CheckConfig) => {
            println!("{config:#?}");
            Ok(())
        }
        None => {
            println!("workflow-engine v{}", env!("CARGO_PKG_VERSION"));
            println!("run `workflow-engine run` to execute the built-in demo workflow");
            Ok(())
        }
    }
}

/// A three-node template: an automatic intake step, a human-gated review,
/// and an agent-authored write-up, mirroring the shape of spec.md §8's
/// human-gated scenario.
fn demo_template() -> WorkflowTemplate {
    WorkflowTemplate {
        template_id: Uuid::new_v4(),
        template_base_id: Uuid::new_v4(),
        name: "demo-intake-review-writeup".into(),
        nodes: vec![
            WorkflowNode {
                node_id: "intake".into(),
                node_type: NodeType::Start,
                task_description: "accept the incoming request".into(),
                processors: vec![],
                depends_on: vec![],
                retry_limit: 0,
            },
            WorkflowNode {
                node_id: "review".into(),
                node_type: NodeType::Processor,
                task_description: "human review of the intake".into(),
                processors: vec![Processor::Human {
                    user_id: "reviewer".into(),
                }],
                depends_on: vec!["intake".into()],
                retry_limit: 0,
            },
            WorkflowNode {
                node_id: "writeup".into(),
                node_type: NodeType::End,
                task_description: "draft a summary write-up".into(),
                processors: vec![Processor::Agent {
                    agent_id: "demo-writer".into(),
                }],
                depends_on: vec!["review".into()],
                retry_limit: 1,
            },
        ],
    }
}

async fn run_demo(config: EngineConfig, executor_id: String, auto_approve: bool) -> Result<()> {
    let engine = ExecutionEngine::new(
        Arc::new(DependencyTracker::new()),
        Arc::new(InstanceManager::new(config.scheduler.instance_capacity)),
        Arc::new(SimulatedAgentClient),
        Arc::new(LoggingEventSink),
        config.dispatcher.clone(),
        config.scheduler.clone(),
    );

    let template = demo_template();
    let instance = engine
        .execute_workflow(
            template,
            executor_id,
            "cli-demo-run",
            serde_json::json!({"source": "workflow-engine-cli"}),
            serde_json::json!({}),
        )
        .context("starting demo workflow")?;

    println!("started instance {}", instance.instance_id);
    println!("waiting for the review step to become assignable...");

    if !auto_approve {
        println!("press enter to approve the review step");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).context("reading approval from stdin")?;
    }
    resolve_review(&engine, instance.instance_id).await?;

    for _ in 0..200 {
        if engine.get_instance(instance.instance_id)?.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let finished = engine.get_instance(instance.instance_id)?;
    println!("final status: {:?}", finished.status);
    if let Some(summary) = &finished.summary {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }

    Ok(())
}

/// Poll briefly for the review task to appear, then complete it the way an
/// external caller (a real UI) would via `complete_task`.
async fn resolve_review(engine: &Arc<ExecutionEngine>, instance_id: Uuid) -> Result<()> {
    let ctx: Arc<InstanceContext> = engine.context(instance_id)?;
    let review_task = loop {
        if let Some(task) = ctx
            .all_task_instances()
            .into_iter()
            .find(|t| t.assigned_user.as_deref() == Some("reviewer"))
        {
            break task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    engine
        .complete_task(instance_id, review_task.task_id, serde_json::json!({"approved": true}))
        .context("completing the human-gated review task")
}
