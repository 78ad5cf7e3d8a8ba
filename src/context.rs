//! The per-run environment threaded into every node's `run`.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::Result;

use dashmap::DashMap;

use crate::{
    Locked,
    cache::{FsCacheStore, UpstreamSignatureLookup},
    config::HookRegistry,
    input::{Input, NodeOutputLookup},
    node::{NodeOutput, flatten},
    worker_pool::WorkerPool,
};

/// Outputs emitted by every node that has run so far this pipeline
/// invocation, keyed by node name. Single writer per key (the coordinator,
/// once per node), many concurrent readers.
pub type NodeOutputsTable = Arc<DashMap<String, Vec<NodeOutput>>>;

/// The per-run environment passed to each node's `run`.
///
/// Exposes input resolution, logging (via `tracing`, ambient — no field
/// needed), the cache store, the worker pool, the build directory, and
/// path-shaping helpers.
pub struct Context {
    pub(crate) build_dir: Utf8PathBuf,
    pub(crate) cwd: Utf8PathBuf,
    pub(crate) cache: Arc<FsCacheStore<Locked>>,
    pub(crate) worker_pool: Arc<WorkerPool>,
    pub(crate) node_outputs: NodeOutputsTable,
    pub(crate) hooks: HookRegistry,
}

impl Context {
    pub fn new(
        build_dir: Utf8PathBuf,
        cwd: Utf8PathBuf,
        cache: Arc<FsCacheStore<Locked>>,
        worker_pool: Arc<WorkerPool>,
        node_outputs: NodeOutputsTable,
        hooks: HookRegistry,
    ) -> Self {
        Self {
            build_dir,
            cwd,
            cache,
            worker_pool,
            node_outputs,
            hooks,
        }
    }

    /// Resolve an [`Input`] descriptor against the current pipeline
    /// snapshot.
    pub fn resolve_input(&self, input: &Input) -> Result<Vec<Utf8PathBuf>> {
        input.resolve(self)
    }

    /// The staging directory for intermediate artifacts.
    pub fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    /// The locked cache store.
    pub fn cache(&self) -> &FsCacheStore<Locked> {
        &self.cache
    }

    /// The shared worker pool.
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    /// The named-hook registry used for `ConfigValue::Hook`/output-shaping
    /// path transforms.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// The default output path for an input under a node: cleans the
    /// input path and joins it under `<buildDir>/<name>`, optionally
    /// replacing the extension.
    pub fn build_path_for(&self, node_name: &str, input: &Utf8Path, ext: Option<&str>) -> Utf8PathBuf {
        let cleaned = crate::output_shaping::clean_input_path(input, &self.build_dir, &self.cwd);
        let path = self.build_dir.join(node_name).join(cleaned);
        match ext {
            Some(ext) => path.with_extension(ext),
            None => path,
        }
    }

    /// The inverse of [`Context::build_path_for`]: strip `<buildDir>/<node>/`
    /// from `path`, if present.
    pub fn strip_build_prefix(&self, path: &Utf8Path) -> Utf8PathBuf {
        crate::output_shaping::clean_input_path(path, &self.build_dir, &self.cwd)
    }

    /// All outputs a given node has emitted so far, or `None` if it hasn't
    /// run yet this invocation.
    pub fn node_outputs_of(&self, name: &str) -> Option<Vec<NodeOutput>> {
        self.node_outputs.get(name).map(|v| v.clone())
    }

    /// Record a node's outputs. Called once by the pipeline coordinator
    /// after a node finishes.
    pub(crate) fn record_node_outputs(&self, name: &str, outputs: Vec<NodeOutput>) {
        self.node_outputs.insert(name.to_string(), outputs);
    }
}

impl NodeOutputLookup for Context {
    fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    fn node_output(&self, producer: &str, output: &str) -> Option<Vec<Utf8PathBuf>> {
        self.node_outputs
            .get(producer)
            .map(|records| flatten(&records, output))
    }
}

impl UpstreamSignatureLookup for Context {
    fn current_signature(
        &self,
        producer: &str,
        output_key: &str,
        glob: Option<&str>,
    ) -> Result<String> {
        let records = self
            .node_outputs
            .get(producer)
            .ok_or_else(|| color_eyre::eyre::eyre!("node {producer:?} has not run yet"))?;
        let paths = flatten(&records, output_key);
        let paths = match glob {
            None => paths,
            Some(pattern) => {
                let matcher = glob::Pattern::new(pattern)
                    .map_err(|err| color_eyre::eyre::eyre!("invalid glob {pattern:?}: {err}"))?;
                paths
                    .into_iter()
                    .filter(|p| matcher.matches_path(p.as_std_path()))
                    .collect()
            }
        };
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert(output_key.to_string(), paths);
        Ok(FsCacheStore::<Locked>::compute_output_signature(&outputs))
    }
}
