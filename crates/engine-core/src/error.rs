use thiserror::Error;

/// Top-level error type for the workflow execution engine.
///
/// Variants mirror the error taxonomy of the design: each is surfaced to
/// callers verbatim and never silently retried except where the engine's
/// own retry policy explicitly applies (see `engine::ExecutionEngine`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Referenced template, instance, node, or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation applied to a wrong-state entity.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Static template validation found a dependency cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// The instance manager refused creation; caller may retry after backoff.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An agent call exceeded its configured budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Persistence or AI-client failure, recorded on the owning row.
    #[error("external error: {0}")]
    ExternalError(String),

    /// Task or instance was cancelled cooperatively.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Operation attempted against an `InstanceContext` after `cleanup()`.
    #[error("context closed: {0}")]
    ContextClosed(String),

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Unexpected internal failure; the current transition fails closed.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;
