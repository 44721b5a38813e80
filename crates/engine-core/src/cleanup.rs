//! Resource cleanup manager: periodic reclamation of terminal instance
//! contexts, tracked temp files past their TTL, and caller-registered
//! custom cleaners. Grounded on the retention sweep in the teacher's
//! artifact retention module, generalized from a one-shot directory scan
//! into a recurring in-memory sweep over the instance manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manager::InstanceManager;

/// A caller-registered cleaner invoked once per sweep, isolated from the
/// built-in context/temp-file reclamation: a failing cleaner never stops
/// the sweep or affects other cleaners.
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &str;
    fn clean(&self) -> Result<u64, String>;
}

struct TrackedFile {
    path: PathBuf,
    registered_at: DateTime<Utc>,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub instances_reclaimed: u64,
    pub temp_files_removed: u64,
    pub custom_cleaner_runs: u64,
    pub custom_cleaner_failures: u64,
}

struct Registry {
    temp_files: HashMap<PathBuf, TrackedFile>,
    cleaners: Vec<Box<dyn Cleaner>>,
    stats: CleanupStats,
}

/// Owns a background sweep task over the `InstanceManager`'s terminal
/// contexts, tracked temp files, and registered cleaners.
pub struct ResourceCleanupManager {
    manager: std::sync::Arc<InstanceManager>,
    registry: Mutex<Registry>,
    sweep_interval: Duration,
    context_ttl: Duration,
    stop: std::sync::Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceCleanupManager {
    pub fn new(
        manager: std::sync::Arc<InstanceManager>,
        sweep_interval: Duration,
        context_ttl: Duration,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            manager,
            registry: Mutex::new(Registry {
                temp_files: HashMap::new(),
                cleaners: Vec::new(),
                stats: CleanupStats::default(),
            }),
            sweep_interval,
            context_ttl,
            stop: std::sync::Arc::new(Notify::new()),
            handle: Mutex::new(None),
        })
    }

    pub fn register_cleaner(&self, cleaner: Box<dyn Cleaner>) {
        self.registry.lock().unwrap().cleaners.push(cleaner);
    }

    /// Track a temp file for removal once `ttl` elapses from now.
    pub fn track_temp_file(&self, path: PathBuf, ttl: Duration) {
        let mut registry = self.registry.lock().unwrap();
        registry.temp_files.insert(
            path.clone(),
            TrackedFile {
                path,
                registered_at: Utc::now(),
                ttl,
            },
        );
    }

    pub fn stats(&self) -> CleanupStats {
        self.registry.lock().unwrap().stats
    }

    /// Spawn the periodic sweep task. No-op if already started.
    pub fn start(self: &std::sync::Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(tokio::spawn(async move {
            this.run_loop().await;
        }));
    }

    pub async fn stop(&self) {
        self.stop.notify_one();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = self.stop.notified() => {
                    debug!("cleanup manager sweep loop stopping");
                    return;
                }
            }
        }
    }

    /// Run one sweep pass synchronously: reclaim terminal instances, remove
    /// expired temp files, run registered cleaners. Exposed directly so
    /// callers (and tests) can force a sweep without waiting on the timer.
    pub fn force_cleanup_all(&self) -> CleanupStats {
        self.sweep_once();
        self.stats()
    }

    fn sweep_once(&self) {
        let terminal = self.manager.terminal_instances_older_than(self.context_ttl);
        let mut reclaimed = 0u64;
        for instance_id in terminal {
            match self.manager.remove(instance_id, false) {
                Ok(()) => {
                    reclaimed += 1;
                    debug!(%instance_id, "reclaimed terminal instance context");
                }
                Err(e) => warn!(%instance_id, error = %e, "failed to reclaim instance context"),
            }
        }

        let now = Utc::now();
        let mut registry = self.registry.lock().unwrap();
        let expired: Vec<PathBuf> = registry
            .temp_files
            .values()
            .filter(|f| {
                now.signed_duration_since(f.registered_at)
                    >= chrono::Duration::from_std(f.ttl).unwrap_or(chrono::Duration::zero())
            })
            .map(|f| f.path.clone())
            .collect();

        let mut removed = 0u64;
        for path in &expired {
            registry.temp_files.remove(path);
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove tracked temp file"),
            }
        }

        let mut custom_runs = 0u64;
        let mut custom_failures = 0u64;
        for cleaner in &registry.cleaners {
            match cleaner.clean() {
                Ok(n) => {
                    custom_runs += 1;
                    debug!(cleaner = cleaner.name(), removed = n, "custom cleaner ran");
                }
                Err(e) => {
                    custom_failures += 1;
                    warn!(cleaner = cleaner.name(), error = %e, "custom cleaner failed");
                }
            }
        }

        registry.stats.instances_reclaimed += reclaimed;
        registry.stats.temp_files_removed += removed;
        registry.stats.custom_cleaner_runs += custom_runs;
        registry.stats.custom_cleaner_failures += custom_failures;

        if reclaimed > 0 || removed > 0 {
            info!(reclaimed, removed, "cleanup sweep completed");
        }
    }

    pub fn context_ttl(&self) -> Duration {
        self.context_ttl
    }
}
