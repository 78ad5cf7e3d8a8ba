//! A generic node wrapping any [`Workload`] implementation, for pipeline
//! definitions that want to plug in a per-item transform without writing a
//! new [`Node`] impl.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context as _};

use crate::{
    config::ConfigValue,
    context::Context,
    input::Input,
    node::{Node, NodeOutput},
    output_shaping::OutputConfig,
    pipeline::Pipeline,
    runtime::{RunItemsRequest, run_items},
    worker_pool::Workload,
};

pub struct TransformNode {
    name: String,
    type_tag: String,
    input: Input,
    config: ConfigValue,
    output_config: OutputConfig,
    primary_output_key: String,
    workload: Arc<dyn Workload>,
}

impl TransformNode {
    /// `type_tag` is this transform's content-signature prefix; two
    /// `TransformNode`s sharing a `type_tag` and `config` are treated as the
    /// same kind of work for cache-reuse purposes regardless of `name` or
    /// which `workload` instance happens to be wired up — callers are
    /// responsible for keeping those in sync.
    pub fn new(
        name: impl Into<String>,
        type_tag: impl Into<String>,
        input: Input,
        config: ConfigValue,
        workload: Arc<dyn Workload>,
    ) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            input,
            config,
            output_config: OutputConfig::default(),
            primary_output_key: "out".to_string(),
            workload,
        }
    }

    pub fn with_output_config(mut self, output_config: OutputConfig) -> Self {
        self.output_config = output_config;
        self
    }

    pub fn with_primary_output_key(mut self, key: impl Into<String>) -> Self {
        self.primary_output_key = key.into();
        self
    }

    fn workload_tag(&self) -> String {
        format!("{}:{}", self.type_tag, self.name)
    }
}

#[async_trait]
impl Node for TransformNode {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ConfigValue {
        &self.config
    }

    fn output_config(&self) -> &OutputConfig {
        &self.output_config
    }

    fn on_added_to_pipeline(&self, pipeline: &mut Pipeline) -> Result<()> {
        pipeline.workload_registry().register(self.workload_tag(), Arc::clone(&self.workload));
        Ok(())
    }

    async fn run(&self, ctx: &Context) -> Result<Vec<NodeOutput>> {
        let items = ctx.resolve_input(&self.input).context("resolve input")?;
        let results = run_items(
            ctx,
            RunItemsRequest {
                node_type_tag: &self.type_tag,
                node_name: &self.name,
                config: &self.config,
                output_config: &self.output_config,
                workload_tag: &self.workload_tag(),
                primary_output_key: &self.primary_output_key,
                items,
            },
        )
        .await
        .context("run items")?;

        Ok(results
            .into_iter()
            .map(|item| {
                let mut output = NodeOutput::new();
                for (key, path) in item.outputs {
                    output.push(key, path);
                }
                output
            })
            .collect())
    }
}
