//! Dependency tracker: process-global, cached upstream/downstream lookups
//! and topological ordering over a `WorkflowTemplate`'s immutable DAG.
//!
//! The tracker treats templates as read-only once registered. Caches are
//! keyed by `template_id` and hold until `invalidate` is called, mirroring
//! the upstream/downstream dict caches of the original dependency tracker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{NodeType, WorkflowTemplate};

/// Cache hit/miss counters, exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct TemplateGraph {
    template: WorkflowTemplate,
    upstream: HashMap<String, Vec<String>>,
    downstream: HashMap<String, Vec<String>>,
    execution_order: Vec<Vec<String>>,
}

#[derive(Default)]
struct Inner {
    graphs: HashMap<Uuid, TemplateGraph>,
    stats: CacheStats,
}

/// Caches and serves dependency queries over registered workflow templates.
///
/// Guarded by a single `RwLock`: readers (the common case, queries against
/// an already-built graph) never block each other; only `build_graph` and
/// `invalidate` take the write side.
pub struct DependencyTracker {
    inner: RwLock<Inner>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Validate the template's DAG (no cycles, no dangling `depends_on`
    /// references) and cache its upstream/downstream/execution-order views.
    ///
    /// Idempotent: re-registering the same `template_id` rebuilds the cache
    /// entry, since templates are expected to be immutable per id in
    /// practice but a caller may legitimately reload one.
    pub fn build_graph(&self, template: &WorkflowTemplate) -> Result<()> {
        let ids: HashSet<&str> = template.nodes.iter().map(|n| n.node_id.as_str()).collect();

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        for node in &template.nodes {
            upstream.entry(node.node_id.clone()).or_default();
            downstream.entry(node.node_id.clone()).or_default();
        }

        for node in &template.nodes {
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::IllegalState(format!(
                        "node '{}' depends on unknown node '{dep}'",
                        node.node_id
                    )));
                }
                upstream.get_mut(&node.node_id).unwrap().push(dep.clone());
                downstream.get_mut(dep).unwrap().push(node.node_id.clone());
            }
        }

        let execution_order = topological_levels(template, &upstream)?;

        let mut inner = self.inner.write().unwrap();
        inner.graphs.insert(
            template.template_id,
            TemplateGraph {
                template: template.clone(),
                upstream,
                downstream,
                execution_order,
            },
        );
        Ok(())
    }

    /// Drop the cached graph for a template, forcing the next query to
    /// error until `build_graph` is called again.
    pub fn invalidate(&self, template_id: Uuid) {
        self.inner.write().unwrap().graphs.remove(&template_id);
    }

    /// Immediate upstream (direct dependency) node ids of `node_id`.
    pub fn upstream(&self, template_id: Uuid, node_id: &str) -> Result<Vec<String>> {
        self.lookup(template_id, |g| {
            g.upstream
                .get(node_id)
                .cloned()
                .ok_or_else(|| node_not_found(template_id, node_id))
        })
    }

    /// Immediate downstream (direct dependent) node ids of `node_id`.
    pub fn downstream(&self, template_id: Uuid, node_id: &str) -> Result<Vec<String>> {
        self.lookup(template_id, |g| {
            g.downstream
                .get(node_id)
                .cloned()
                .ok_or_else(|| node_not_found(template_id, node_id))
        })
    }

    /// Full topological execution order as parallelizable levels: every
    /// node in a level has all its dependencies satisfied by the nodes in
    /// prior levels.
    pub fn execution_order(&self, template_id: Uuid) -> Result<Vec<Vec<String>>> {
        self.lookup(template_id, |g| Ok(g.execution_order.clone()))
    }

    /// Nodes whose dependencies are all present in `completed`, excluding
    /// any node already in `completed`. Used by the engine to derive the
    /// next batch ready to run after a completion event.
    pub fn ready_nodes(&self, template_id: Uuid, completed: &HashSet<String>) -> Result<Vec<String>> {
        self.lookup(template_id, |g| {
            Ok(g.template
                .nodes
                .iter()
                .filter(|n| !completed.contains(&n.node_id))
                .filter(|n| n.depends_on.iter().all(|d| completed.contains(d)))
                .map(|n| n.node_id.clone())
                .collect())
        })
    }

    /// Re-validate a template's DAG without mutating the cache.
    pub fn validate(&self, template: &WorkflowTemplate) -> Result<()> {
        let ids: HashSet<&str> = template.nodes.iter().map(|n| n.node_id.as_str()).collect();
        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        for node in &template.nodes {
            upstream.entry(node.node_id.clone()).or_default();
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::IllegalState(format!(
                        "node '{}' depends on unknown node '{dep}'",
                        node.node_id
                    )));
                }
                upstream.get_mut(&node.node_id).unwrap().push(dep.clone());
            }
        }
        topological_levels(template, &upstream).map(|_| ())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.read().unwrap().stats
    }

    fn lookup<T>(
        &self,
        template_id: Uuid,
        f: impl FnOnce(&TemplateGraph) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.write().unwrap();
        let hit = inner.graphs.contains_key(&template_id);
        if hit {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        let graph = inner.graphs.get(&template_id).ok_or_else(|| {
            EngineError::NotFound(format!("template '{template_id}' has no cached graph"))
        })?;
        f(graph)
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn node_not_found(template_id: Uuid, node_id: &str) -> EngineError {
    EngineError::NotFound(format!("node '{node_id}' not found in template '{template_id}'"))
}

/// Kahn's algorithm, grouping same-depth nodes into parallelizable levels.
/// Node ids are sorted within a level for deterministic output.
fn topological_levels(
    template: &WorkflowTemplate,
    upstream: &HashMap<String, Vec<String>>,
) -> Result<Vec<Vec<String>>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in &template.nodes {
        in_degree.insert(&node.node_id, upstream[&node.node_id].len());
        dependents.entry(&node.node_id).or_default();
    }
    for node in &template.nodes {
        for dep in &node.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&node.node_id);
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect::<Vec<_>>()
        .into_iter()
        .collect();

    let mut queue_vec: Vec<&str> = queue.drain(..).collect();
    queue_vec.sort();

    let mut levels = Vec::new();
    let mut processed = 0usize;

    while !queue_vec.is_empty() {
        let level: Vec<String> = queue_vec.iter().map(|s| s.to_string()).collect();
        let mut next = Vec::new();

        for node_id in &queue_vec {
            processed += 1;
            if let Some(deps) = dependents.get(node_id) {
                for dep in deps {
                    let deg = in_degree.get_mut(dep).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(*dep);
                    }
                }
            }
        }

        levels.push(level);
        next.sort();
        queue_vec = next;
    }

    if processed != template.nodes.len() {
        return Err(EngineError::CycleDetected(format!(
            "template '{}' contains a dependency cycle",
            template.template_id
        )));
    }

    Ok(levels)
}

/// Start nodes never declare `depends_on`, but the `NodeType::Start`
/// designation is separately enforced during validation so the engine
/// can assert an instance's entrypoints without walking the whole graph.
pub fn validate_start_nodes(template: &WorkflowTemplate) -> Result<()> {
    for node in &template.nodes {
        if node.node_type == NodeType::Start && !node.depends_on.is_empty() {
            return Err(EngineError::IllegalState(format!(
                "start node '{}' must not declare dependencies",
                node.node_id
            )));
        }
    }
    Ok(())
}
