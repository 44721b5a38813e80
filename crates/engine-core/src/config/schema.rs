use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `engine.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub cleanup: CleanupConfig,
}

/// Agent dispatcher configuration: worker pool sizing and call timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatcherConfig {
    pub worker_pool_size: usize,
    pub agent_call_timeout_seconds: u64,
    pub agent_call_timeout_tool_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            agent_call_timeout_seconds: 120,
            agent_call_timeout_tool_seconds: 600,
        }
    }
}

/// Scheduler / execution-engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub monitor_interval_seconds: u64,
    pub instance_capacity: Option<usize>,
    pub task_retry_limit: u32,
    pub advisory_instance_deadline_minutes: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: 15,
            instance_capacity: None,
            task_retry_limit: 0,
            advisory_instance_deadline_minutes: None,
        }
    }
}

/// Resource cleanup manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CleanupConfig {
    pub context_cleanup_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            context_cleanup_ttl_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}
