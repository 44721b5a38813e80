pub mod agent_client;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod dependency;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod repository;
pub mod summary;

pub use error::{EngineError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("workflow engine tracing initialised");
}
