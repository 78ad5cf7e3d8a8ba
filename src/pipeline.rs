//! Owns the DAG of nodes, derives dependency edges from their configs,
//! picks an execution strategy, and threads a shared [`Context`] to every
//! node.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bon::Builder;
use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context as _, eyre::bail};
use dashmap::DashMap;
use tokio::{sync::Notify, task::JoinSet};
use tracing::{info, instrument, warn};

use crate::{
    Locked,
    cache::FsCacheStore,
    config::HookRegistry,
    context::{Context, NodeOutputsTable},
    node::{Node, NodeOutput},
    worker_pool::{WorkerPool, WorkloadRegistry},
};

/// How independent nodes are scheduled relative to one another.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ExecutionMode {
    /// One node at a time, in topological order.
    Sequential,
    /// Nodes grouped into depth-based waves; all nodes in a wave run
    /// concurrently.
    WaveParallel,
    /// Start any node as soon as its dependencies complete. Strictly at
    /// least as parallel as wave mode.
    #[default]
    DynamicReady,
}

/// Pipeline-wide configuration.
#[derive(Clone, Debug, Builder)]
pub struct PipelineConfig {
    /// Staging directory for intermediate artifacts.
    #[builder(into, default = Utf8PathBuf::from("build"))]
    pub build_dir: Utf8PathBuf,
    /// Persistent cache directory; defaults to the platform user cache dir.
    #[builder(into)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[builder(default)]
    pub execution_mode: ExecutionMode,
    #[builder(default = num_cpus::get())]
    pub worker_pool_size: usize,
}

/// A pipeline: the DAG, the per-node output snapshot table, and the shared
/// cache store and worker pool every node's [`Context`] is built from.
pub struct Pipeline {
    config: PipelineConfig,
    cwd: Utf8PathBuf,
    nodes: Vec<Arc<dyn Node>>,
    index_by_name: HashMap<String, usize>,
    cache: Arc<FsCacheStore<Locked>>,
    worker_pool: Arc<WorkerPool>,
    workload_registry: WorkloadRegistry,
    node_outputs: NodeOutputsTable,
    hooks: HookRegistry,
}

impl Pipeline {
    /// Open (and lock) the cache store, spawn the worker pool, and return an
    /// empty pipeline ready for [`Pipeline::add_node`].
    #[instrument(skip(config))]
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let cache_root = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => crate::fs::user_global_cache_path()
                .await
                .context("determine default cache directory")?,
        };
        let cache = FsCacheStore::open_dir(cache_root)
            .await
            .context("open cache store")?
            .lock()
            .await
            .context("lock cache store")?;

        let cwd = std::env::current_dir()
            .context("read working directory")
            .and_then(|p| {
                Utf8PathBuf::from_path_buf(p)
                    .map_err(|p| color_eyre::eyre::eyre!("working directory is not utf8: {p:?}"))
            })?;

        let workload_registry = WorkloadRegistry::new();
        let worker_pool = WorkerPool::new(config.worker_pool_size, workload_registry.clone());

        Ok(Self {
            config,
            cwd,
            nodes: Vec::new(),
            index_by_name: HashMap::new(),
            cache: Arc::new(cache),
            worker_pool: Arc::new(worker_pool),
            workload_registry,
            node_outputs: Arc::new(DashMap::new()),
            hooks: HookRegistry::new(),
        })
    }

    /// The named-hook registry, exposed so callers can register
    /// [`crate::config::ConfigValue::Hook`]/output-shaping transforms before
    /// running.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// The workload registry backing the shared worker pool. Nodes that
    /// dispatch per-item work (see [`crate::runtime::run_items`]) register
    /// their workload here, typically from [`Node::on_added_to_pipeline`].
    pub fn workload_registry(&self) -> &WorkloadRegistry {
        &self.workload_registry
    }

    /// The staging directory for intermediate artifacts. Reference node
    /// implementations read this from [`Node::on_added_to_pipeline`] to
    /// build a standalone [`crate::worker_pool::Workload`] that shapes
    /// output paths the same way [`crate::runtime::run_items`] does.
    pub fn build_dir(&self) -> &camino::Utf8Path {
        &self.config.build_dir
    }

    /// The process working directory captured at [`Pipeline::new`].
    pub fn cwd(&self) -> &camino::Utf8Path {
        &self.cwd
    }

    /// Add a node to the pipeline, firing its `on_added_to_pipeline` hook.
    /// Names must be unique.
    pub fn add_node(&mut self, node: Arc<dyn Node>) -> Result<()> {
        let name = node.name().to_string();
        if self.index_by_name.contains_key(&name) {
            bail!("duplicate node name {name:?}");
        }
        let index = self.nodes.len();
        self.nodes.push(Arc::clone(&node));
        self.index_by_name.insert(name, index);
        node.on_added_to_pipeline(self)
    }

    /// All outputs a given node has emitted so far.
    pub fn node_outputs_of(&self, name: &str) -> Option<Vec<NodeOutput>> {
        self.node_outputs.get(name).map(|v| v.clone())
    }

    fn build_edges(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .iter()
            .map(|n| (n.name().to_string(), BTreeSet::new()))
            .collect();

        for node in &self.nodes {
            let mut deps = BTreeSet::new();
            node.config()
                .walk_node_refs(&mut |producer, _output, _glob| {
                    deps.insert(producer.to_string());
                });
            deps.extend(node.explicit_dependencies().iter().cloned());

            for dep in &deps {
                if !self.index_by_name.contains_key(dep) {
                    bail!("node {:?} depends on unknown node {dep:?}", node.name());
                }
            }
            edges.insert(node.name().to_string(), deps);
        }
        Ok(edges)
    }

    /// Resolve the DAG, pick an execution strategy, and run every node to
    /// completion. Consumes the pipeline: a pipeline runs exactly once.
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let edges = self.build_edges().context("resolve dependency graph")?;
        if let Some(cycle) = detect_cycle(&edges) {
            bail!("dependency cycle detected: {}", cycle.join(" -> "));
        }
        let depths = compute_depths(&edges);

        let running: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let supervisor = self.spawn_supervisor(Arc::clone(&running));

        let result = match self.config.execution_mode {
            ExecutionMode::Sequential => self.run_sequential(&depths, &running).await,
            ExecutionMode::WaveParallel => self.run_wave_parallel(&depths, &running).await,
            ExecutionMode::DynamicReady => self.run_dynamic(&edges, &running).await,
        };

        supervisor.notify.notify_one();
        if let Err(err) = supervisor.handle.await {
            warn!(%err, "supervisor task did not shut down cleanly");
        }

        result
    }

    async fn run_sequential(
        &self,
        depths: &HashMap<String, usize>,
        running: &Arc<DashMap<String, ()>>,
    ) -> Result<()> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&index| (depths[self.nodes[index].name()], index));

        for index in order {
            let node = Arc::clone(&self.nodes[index]);
            let name = node.name().to_string();
            let (_, result) = run_node(
                self.config.build_dir.clone(),
                self.cwd.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.worker_pool),
                Arc::clone(&self.node_outputs),
                self.hooks.clone(),
                Arc::clone(running),
                name,
                node,
            )
            .await;
            result?;
        }
        Ok(())
    }

    async fn run_wave_parallel(
        &self,
        depths: &HashMap<String, usize>,
        running: &Arc<DashMap<String, ()>>,
    ) -> Result<()> {
        let mut waves: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            waves.entry(depths[node.name()]).or_default().push(index);
        }

        let mut first_error = None;
        for indices in waves.into_values() {
            if first_error.is_some() {
                break;
            }
            let mut set = JoinSet::new();
            for index in indices {
                let node = Arc::clone(&self.nodes[index]);
                let name = node.name().to_string();
                set.spawn(run_node(
                    self.config.build_dir.clone(),
                    self.cwd.clone(),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.worker_pool),
                    Arc::clone(&self.node_outputs),
                    self.hooks.clone(),
                    Arc::clone(running),
                    name,
                    node,
                ));
            }
            while let Some(joined) = set.join_next().await {
                let (name, result) = joined.context("node task panicked")?;
                if let Err(err) = result {
                    warn!(node = name, %err, "node failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_dynamic(
        &self,
        edges: &BTreeMap<String, BTreeSet<String>>,
        running: &Arc<DashMap<String, ()>>,
    ) -> Result<()> {
        let mut completed: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut set: JoinSet<(String, Result<Vec<NodeOutput>>)> = JoinSet::new();
        let mut first_error = None;

        loop {
            if first_error.is_none() {
                for (name, deps) in edges {
                    if started.contains(name) {
                        continue;
                    }
                    if deps.iter().all(|dep| completed.contains(dep)) {
                        started.insert(name.clone());
                        let node = Arc::clone(&self.nodes[self.index_by_name[name]]);
                        set.spawn(run_node(
                            self.config.build_dir.clone(),
                            self.cwd.clone(),
                            Arc::clone(&self.cache),
                            Arc::clone(&self.worker_pool),
                            Arc::clone(&self.node_outputs),
                            self.hooks.clone(),
                            Arc::clone(running),
                            name.clone(),
                            node,
                        ));
                    }
                }
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (name, result) = joined.context("node task panicked")?;
            match result {
                Ok(_) => {
                    completed.insert(name);
                }
                Err(err) => {
                    warn!(node = name, %err, "node failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_supervisor(&self, running: Arc<DashMap<String, ()>>) -> Supervisor {
        let notify = Arc::new(Notify::new());
        let stop = Arc::clone(&notify);
        let worker_pool = Arc::clone(&self.worker_pool);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3));
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let names: Vec<String> = running.iter().map(|e| e.key().clone()).collect();
                        if !names.is_empty() {
                            info!(
                                running = ?names,
                                active_worker_jobs = worker_pool.active_jobs().len(),
                                "pipeline progress",
                            );
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        });

        Supervisor { notify, handle }
    }
}

struct Supervisor {
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

/// Run one node: mark it active for the supervisor, build its `Context`,
/// execute it, record its outputs, and mark it inactive again.
async fn run_node(
    build_dir: Utf8PathBuf,
    cwd: Utf8PathBuf,
    cache: Arc<FsCacheStore<Locked>>,
    worker_pool: Arc<WorkerPool>,
    node_outputs: NodeOutputsTable,
    hooks: HookRegistry,
    running: Arc<DashMap<String, ()>>,
    name: String,
    node: Arc<dyn Node>,
) -> (String, Result<Vec<NodeOutput>>) {
    running.insert(name.clone(), ());
    let ctx = Context::new(
        build_dir,
        cwd,
        cache,
        worker_pool,
        Arc::clone(&node_outputs),
        hooks,
    );
    let result = node.run(&ctx).await;
    running.remove(&name);
    if let Ok(outputs) = &result {
        node_outputs.insert(name.clone(), outputs.clone());
    }
    (name, result)
}

/// Detect a dependency cycle via 3-color DFS, returning the offending chain
/// of node names if one exists.
fn detect_cycle(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        color: &mut HashMap<String, Color>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match color.get(node) {
            Some(Color::Black) => return None,
            Some(Color::Gray) => {
                stack.push(node.to_string());
                return Some(stack.clone());
            }
            _ => {}
        }
        color.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if let Some(cycle) = visit(dep, edges, color, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        color.insert(node.to_string(), Color::Black);
        None
    }

    let mut color: HashMap<String, Color> = HashMap::new();
    for name in edges.keys() {
        if !matches!(color.get(name), Some(Color::Black)) {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(name, edges, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// `1 + max(depth of deps)`, leaves at depth `0`.
fn compute_depths(edges: &BTreeMap<String, BTreeSet<String>>) -> HashMap<String, usize> {
    fn depth_of(
        node: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        depths: &mut HashMap<String, usize>,
    ) -> usize {
        if let Some(&d) = depths.get(node) {
            return d;
        }
        let d = edges
            .get(node)
            .map(|deps| deps.iter().map(|dep| depth_of(dep, edges, depths) + 1).max().unwrap_or(0))
            .unwrap_or(0);
        depths.insert(node.to_string(), d);
        d
    }

    let mut depths = HashMap::new();
    for name in edges.keys() {
        depth_of(name, edges, &mut depths);
    }
    depths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges_from(pairs: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn detect_cycle_finds_direct_cycle() {
        let edges = edges_from(&[("a", &["b"]), ("b", &["a"])]);
        assert!(detect_cycle(&edges).is_some());
    }

    #[test]
    fn detect_cycle_accepts_dag() {
        let edges = edges_from(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(detect_cycle(&edges).is_none());
    }

    #[test]
    fn compute_depths_assigns_leaves_zero() {
        let edges = edges_from(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        let depths = compute_depths(&edges);
        assert_eq!(depths["a"], 0);
        assert_eq!(depths["b"], 1);
        assert_eq!(depths["c"], 2);
    }
}
