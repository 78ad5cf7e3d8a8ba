//! The contract a concrete node implements.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use color_eyre::Result;

use crate::{config::ConfigValue, context::Context, output_shaping::OutputConfig, pipeline::Pipeline};

/// A mapping from output name to the ordered list of paths produced under
/// that name. A node may emit several of these (one per processed item);
/// downstream consumers flatten them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeOutput {
    pub entries: Vec<(String, Utf8PathBuf)>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, path: Utf8PathBuf) {
        self.entries.push((key.into(), path));
    }

    /// Flatten to the ordered list of paths for a single output key.
    pub fn paths_for(&self, key: &str) -> Vec<Utf8PathBuf> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// Flatten a slice of [`NodeOutput`] records for a single output key,
/// preserving the order in which they were produced.
pub fn flatten(outputs: &[NodeOutput], key: &str) -> Vec<Utf8PathBuf> {
    outputs.iter().flat_map(|o| o.paths_for(key)).collect()
}

/// One vertex of the pipeline DAG.
///
/// `name` is unique within a pipeline and is used both as a cache-directory
/// segment and as the default build-subdirectory segment. `config`
/// contributes to the content signature (see [`crate::config::content_signature`]);
/// `output_config` shapes destination paths and is excluded from it.
#[async_trait]
pub trait Node: Send + Sync {
    /// A stable identifier for this node's implementation, used as the
    /// content-signature type tag. Distinct from `name`, which identifies
    /// this particular instance within the pipeline.
    fn type_tag(&self) -> &str;

    /// This node instance's unique name within its pipeline.
    fn name(&self) -> &str;

    /// The processing configuration. Contributes to the content signature.
    fn config(&self) -> &ConfigValue;

    /// Destination-shaping configuration. Excluded from the content
    /// signature.
    fn output_config(&self) -> &OutputConfig;

    /// Node names this node depends on beyond what's implied by
    /// `config`'s embedded node references.
    fn explicit_dependencies(&self) -> &[String] {
        &[]
    }

    /// Fires once, when the node is added to a pipeline. Composite nodes
    /// use this to inject child nodes (see `nodes::aggregate`).
    fn on_added_to_pipeline(&self, _pipeline: &mut Pipeline) -> Result<()> {
        Ok(())
    }

    /// Execute this node, returning one or more output records.
    async fn run(&self, ctx: &Context) -> Result<Vec<NodeOutput>>;
}
