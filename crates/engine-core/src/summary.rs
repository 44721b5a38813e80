//! Output summarizer: a pure function over a completed instance's
//! persisted node/task state, producing the execution result, execution
//! statistics, quality metrics, data lineage, and any issues worth
//! surfacing. Grounded on the teacher's `RunHealthMetrics::from_events`,
//! generalized from a flat event log to the node/task instance records
//! this engine persists.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{NodeInstance, NodeInstanceStatus, TaskInstance, TaskStatus, WorkflowInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub result_type: ResultType,
    pub processed_count: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub data_output: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub cancelled_nodes: u32,
    pub total_tasks: u32,
    pub human_tasks: u32,
    pub agent_tasks: u32,
    pub mixed_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_retries: u32,
    pub total_duration_ms: Option<i64>,
    pub mean_node_duration_ms: Option<f64>,
    pub mean_task_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub data_completeness: f64,
    pub accuracy_score: f64,
    pub quality_gates_passed: bool,
    pub overall_quality_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationStep {
    pub node: String,
    pub operations: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLineage {
    pub input_sources: Vec<String>,
    pub transformation_steps: Vec<TransformationStep>,
    pub output_destinations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issues {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recoverable_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub instance_id: Uuid,
    pub execution_result: ExecutionResult,
    pub execution_stats: ExecutionStats,
    pub quality_metrics: QualityMetrics,
    pub data_lineage: DataLineage,
    pub issues: Issues,
}

/// Arithmetic mean over durations recorded only for rows that carry both a
/// start and a completion timestamp (`duration_ms()`); `None` when the
/// iterator is empty rather than an arbitrary default.
fn mean(durations: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, count) = durations.fold((0i64, 0u32), |(sum, count), d| (sum + d, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum as f64 / count as f64)
    }
}

/// Summarizes a completed (or in-flight) instance from its persisted
/// node/task records. Holds no state of its own: callers supply whatever
/// snapshot they have, whether from a live `InstanceContext` or a
/// repository read after the fact.
pub struct OutputSummarizer;

impl OutputSummarizer {
    pub fn summarize(
        instance: &WorkflowInstance,
        nodes: &[NodeInstance],
        tasks: &[TaskInstance],
    ) -> ExecutionSummary {
        let execution_stats = Self::compute_stats(nodes, tasks);
        let execution_result = Self::compute_result(instance, nodes, &execution_stats);
        let quality_metrics = Self::compute_quality(&execution_stats, tasks);
        let data_lineage = Self::compute_lineage(nodes);
        let issues = Self::compute_issues(nodes, tasks);

        ExecutionSummary {
            instance_id: instance.instance_id,
            execution_result,
            execution_stats,
            quality_metrics,
            data_lineage,
            issues,
        }
    }

    fn compute_stats(nodes: &[NodeInstance], tasks: &[TaskInstance]) -> ExecutionStats {
        use crate::model::TaskType;

        let completed_nodes = nodes.iter().filter(|n| n.status == NodeInstanceStatus::Completed).count() as u32;
        let failed_nodes = nodes.iter().filter(|n| n.status == NodeInstanceStatus::Failed).count() as u32;
        let cancelled_nodes = nodes.iter().filter(|n| n.status == NodeInstanceStatus::Cancelled).count() as u32;
        let completed_tasks = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as u32;
        let failed_tasks = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count() as u32;
        let human_tasks = tasks.iter().filter(|t| t.task_type == TaskType::Human).count() as u32;
        let agent_tasks = tasks.iter().filter(|t| t.task_type == TaskType::Agent).count() as u32;
        let mixed_tasks = tasks.iter().filter(|t| t.task_type == TaskType::Mixed).count() as u32;
        let total_retries = nodes.iter().map(|n| n.retry_count).sum();

        let earliest_start = nodes.iter().filter_map(|n| n.started_at).min();
        let latest_end = nodes.iter().filter_map(|n| n.completed_at).max();
        let total_duration_ms = match (earliest_start, latest_end) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start).num_milliseconds()),
            _ => None,
        };

        let mean_node_duration_ms = mean(nodes.iter().filter_map(|n| n.duration_ms()));
        let mean_task_duration_ms = mean(tasks.iter().filter_map(|t| t.duration_ms()));

        ExecutionStats {
            total_nodes: nodes.len() as u32,
            completed_nodes,
            failed_nodes,
            cancelled_nodes,
            total_tasks: tasks.len() as u32,
            human_tasks,
            agent_tasks,
            mixed_tasks,
            completed_tasks,
            failed_tasks,
            total_retries,
            total_duration_ms,
            mean_node_duration_ms,
            mean_task_duration_ms,
        }
    }

    /// Result type follows end-node completion, not the finer node mix:
    /// every processor node completed -> success; every end node completed
    /// but some processor node failed or was cancelled along the way ->
    /// partial_success; no end node completed -> failure.
    fn compute_result(
        instance: &WorkflowInstance,
        nodes: &[NodeInstance],
        stats: &ExecutionStats,
    ) -> ExecutionResult {
        use crate::model::InstanceStatus;

        let result_type = match instance.status {
            InstanceStatus::Completed if stats.failed_nodes == 0 && stats.cancelled_nodes == 0 => {
                ResultType::Success
            }
            InstanceStatus::Completed => ResultType::PartialSuccess,
            _ => ResultType::Failure,
        };

        let data_output = nodes
            .iter()
            .filter_map(|n| n.output.clone().map(|o| (n.node_id.clone(), o)))
            .collect::<serde_json::Map<String, serde_json::Value>>();

        ExecutionResult {
            result_type,
            processed_count: stats.total_nodes,
            success_count: stats.completed_nodes,
            error_count: stats.failed_nodes,
            data_output: serde_json::Value::Object(data_output),
        }
    }

    fn compute_quality(stats: &ExecutionStats, tasks: &[TaskInstance]) -> QualityMetrics {
        let data_completeness = if stats.total_nodes > 0 {
            stats.completed_nodes as f64 / stats.total_nodes as f64
        } else {
            0.0
        };

        let total_tasks_decided = stats.completed_tasks + stats.failed_tasks;
        let accuracy_score = if total_tasks_decided > 0 {
            stats.completed_tasks as f64 / total_tasks_decided as f64
        } else {
            0.0
        };

        let quality_gates_passed = stats.failed_nodes == 0 && stats.cancelled_nodes == 0;
        let overall_quality_score = (data_completeness + accuracy_score) / 2.0;

        let _ = tasks;
        QualityMetrics {
            data_completeness,
            accuracy_score,
            quality_gates_passed,
            overall_quality_score,
        }
    }

    /// Derives a rough operation label from the node's name and the shape
    /// of its recorded output, since the engine never inspects a node's
    /// business payload beyond its JSON envelope.
    fn derive_operations(node: &NodeInstance) -> Vec<String> {
        let mut ops = Vec::new();
        let name = node.node_id.to_ascii_lowercase();
        if name.contains("filter") {
            ops.push("filter".to_string());
        }
        if name.contains("transform") || name.contains("map") {
            ops.push("transform".to_string());
        }
        if name.contains("aggregate") || name.contains("summar") || name.contains("reduce") {
            ops.push("aggregate".to_string());
        }
        if name.contains("validate") || name.contains("check") {
            ops.push("validate".to_string());
        }
        if name.contains("merge") || name.contains("join") {
            ops.push("merge".to_string());
        }
        match &node.output {
            Some(serde_json::Value::Array(_)) => ops.push("produced_collection".to_string()),
            Some(serde_json::Value::Object(_)) => ops.push("produced_record".to_string()),
            Some(_) => ops.push("produced_scalar".to_string()),
            None => {}
        }
        if ops.is_empty() {
            ops.push("process".to_string());
        }
        ops
    }

    fn compute_lineage(nodes: &[NodeInstance]) -> DataLineage {
        let input_sources: Vec<String> = nodes
            .iter()
            .filter(|n| n.input.is_some())
            .map(|n| n.node_id.clone())
            .collect();

        let transformation_steps: Vec<TransformationStep> = nodes
            .iter()
            .filter(|n| n.status == NodeInstanceStatus::Completed)
            .map(|n| TransformationStep {
                node: n.node_id.clone(),
                operations: Self::derive_operations(n),
                timestamp: n.completed_at.unwrap_or(n.created_at),
            })
            .collect();

        let output_destinations: Vec<String> = nodes
            .iter()
            .filter(|n| n.output.is_some())
            .map(|n| n.node_id.clone())
            .collect();

        DataLineage {
            input_sources,
            transformation_steps,
            output_destinations,
        }
    }

    fn compute_issues(nodes: &[NodeInstance], tasks: &[TaskInstance]) -> Issues {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut recoverable_failures = Vec::new();

        for node in nodes {
            if node.status == NodeInstanceStatus::Failed {
                errors.push(format!(
                    "node '{}' failed: {}",
                    node.node_id,
                    node.error_message.as_deref().unwrap_or("no error message recorded")
                ));
            }
            if node.status == NodeInstanceStatus::Cancelled {
                warnings.push(format!("node '{}' was cancelled", node.node_id));
            }
            if node.retry_count > 0 {
                recoverable_failures.push(format!(
                    "node '{}' required {} retry attempt(s) before resolving",
                    node.node_id, node.retry_count
                ));
            }
        }
        for task in tasks {
            if task.status == TaskStatus::Cancelled {
                warnings.push(format!("task '{}' was cancelled before completion", task.task_id));
            }
        }

        Issues {
            errors,
            warnings,
            recoverable_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceStatus, Processor, TaskType, WorkflowTemplate};
    use chrono::Utc;

    fn instance() -> WorkflowInstance {
        let template = WorkflowTemplate {
            template_id: Uuid::new_v4(),
            template_base_id: Uuid::new_v4(),
            name: "t".into(),
            nodes: vec![],
        };
        let mut instance = WorkflowInstance::new(&template, "tester", "run", serde_json::json!({}), serde_json::json!({}));
        instance.status = InstanceStatus::Completed;
        instance
    }

    #[test]
    fn summary_reports_zero_stats_for_empty_instance() {
        let summary = OutputSummarizer::summarize(&instance(), &[], &[]);
        assert_eq!(summary.execution_stats.total_nodes, 0);
        assert_eq!(summary.quality_metrics.data_completeness, 0.0);
        assert_eq!(summary.execution_result.result_type, ResultType::Success);
    }

    #[test]
    fn summary_counts_completed_and_failed_nodes() {
        let mut completed_node = NodeInstance::new(Uuid::new_v4(), "a");
        completed_node.status = NodeInstanceStatus::Completed;
        completed_node.started_at = Some(Utc::now());
        completed_node.completed_at = Some(Utc::now());

        let mut failed_node = NodeInstance::new(Uuid::new_v4(), "b");
        failed_node.status = NodeInstanceStatus::Failed;
        failed_node.error_message = Some("boom".into());

        let summary = OutputSummarizer::summarize(&instance(), &[completed_node, failed_node], &[]);
        assert_eq!(summary.execution_stats.completed_nodes, 1);
        assert_eq!(summary.execution_stats.failed_nodes, 1);
        assert_eq!(summary.issues.errors.len(), 1);
        assert!(summary.issues.errors[0].contains("boom"));
    }

    #[test]
    fn summary_flags_retried_nodes_as_recoverable() {
        let mut node = NodeInstance::new(Uuid::new_v4(), "a");
        node.retry_count = 2;
        node.status = NodeInstanceStatus::Completed;

        let summary = OutputSummarizer::summarize(&instance(), &[node], &[]);
        assert_eq!(summary.execution_stats.total_retries, 2);
        assert!(summary.issues.recoverable_failures.iter().any(|i| i.contains("retry")));
    }

    #[test]
    fn task_counts_split_by_type() {
        let mut completed = TaskInstance::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &Processor::Agent { agent_id: "g".into() },
            serde_json::json!({}),
            serde_json::json!({}),
        );
        completed.status = TaskStatus::Completed;
        completed.task_type = TaskType::Agent;

        let pending = TaskInstance::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &Processor::Human { user_id: "u".into() },
            serde_json::json!({}),
            serde_json::json!({}),
        );

        let summary = OutputSummarizer::summarize(&instance(), &[], &[completed, pending]);
        assert_eq!(summary.execution_stats.agent_tasks, 1);
        assert_eq!(summary.execution_stats.human_tasks, 1);
        assert_eq!(summary.quality_metrics.accuracy_score, 1.0);
    }

    #[test]
    fn partial_success_when_end_reached_despite_cancelled_branch() {
        let mut completed_end = NodeInstance::new(Uuid::new_v4(), "end");
        completed_end.status = NodeInstanceStatus::Completed;

        let mut cancelled = NodeInstance::new(Uuid::new_v4(), "skipped");
        cancelled.status = NodeInstanceStatus::Cancelled;

        let summary = OutputSummarizer::summarize(&instance(), &[completed_end, cancelled], &[]);
        assert_eq!(summary.execution_result.result_type, ResultType::PartialSuccess);
    }

    #[test]
    fn mean_durations_average_only_rows_with_both_timestamps() {
        let mut timed_node = NodeInstance::new(Uuid::new_v4(), "a");
        timed_node.status = NodeInstanceStatus::Completed;
        timed_node.started_at = Some(Utc::now());
        timed_node.completed_at = Some(timed_node.started_at.unwrap() + chrono::Duration::milliseconds(100));

        let mut untimed_node = NodeInstance::new(Uuid::new_v4(), "b");
        untimed_node.status = NodeInstanceStatus::Completed;

        let summary = OutputSummarizer::summarize(&instance(), &[timed_node, untimed_node], &[]);
        assert_eq!(summary.execution_stats.mean_node_duration_ms, Some(100.0));
        assert_eq!(summary.execution_stats.mean_task_duration_ms, None);
    }

    #[test]
    fn lineage_derives_operation_from_node_name_and_output_shape() {
        let mut node = NodeInstance::new(Uuid::new_v4(), "filter_rows");
        node.status = NodeInstanceStatus::Completed;
        node.output = Some(serde_json::json!([1, 2, 3]));

        let summary = OutputSummarizer::summarize(&instance(), &[node], &[]);
        let step = &summary.data_lineage.transformation_steps[0];
        assert!(step.operations.contains(&"filter".to_string()));
        assert!(step.operations.contains(&"produced_collection".to_string()));
    }
}
