//! `U`: uppercase each item's bytes, prefixed by a configured string.
//!
//! Exists only to exercise the engine end to end (see the pipeline tests):
//! it has exactly one piece of config (`prefix`), one output key (`out`),
//! and no interesting failure modes of its own.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context as _};

use crate::{
    config::{ConfigValue, HookRegistry},
    context::Context,
    input::Input,
    node::{Node, NodeOutput},
    output_shaping::{OutputConfig, default_output_path},
    pipeline::Pipeline,
    runtime::{RunItemsRequest, run_items},
    worker_pool::{JobOutcome, Workload},
};

const TYPE_TAG: &str = "Uppercase";
const OUTPUT_KEY: &str = "out";

pub struct UppercaseNode {
    name: String,
    input: Input,
    prefix: String,
    config: ConfigValue,
    output_config: OutputConfig,
}

impl UppercaseNode {
    pub fn new(name: impl Into<String>, input: Input, prefix: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = prefix.into();

        let mut fields: Vec<(String, ConfigValue)> =
            vec![("prefix".to_string(), ConfigValue::String(prefix.clone()))];
        if let Input::NodeRef { producer, output, glob } = &input {
            fields.push((
                "input".to_string(),
                ConfigValue::NodeRef {
                    producer: producer.clone(),
                    output: output.clone(),
                    glob: glob.clone(),
                },
            ));
        }

        Self {
            name,
            input,
            prefix,
            config: ConfigValue::map(fields),
            output_config: OutputConfig::default(),
        }
    }

    pub fn with_output_config(mut self, output_config: OutputConfig) -> Self {
        self.output_config = output_config;
        self
    }

    fn workload_tag(&self) -> String {
        format!("{TYPE_TAG}:{}", self.name)
    }
}

#[async_trait]
impl Node for UppercaseNode {
    fn type_tag(&self) -> &str {
        TYPE_TAG
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
        let workload = UppercaseWorkload {
            node_name: self.name.clone(),
            prefix: self.prefix.clone(),
            output_config: self.output_config.clone(),
            build_dir: pipeline.build_dir().to_path_buf(),
            cwd: pipeline.cwd().to_path_buf(),
            hooks: pipeline.hooks().clone(),
        };
        pipeline.workload_registry().register(self.workload_tag(), Arc::new(workload));
        Ok(())
    }

    async fn run(&self, ctx: &Context) -> Result<Vec<NodeOutput>> {
        let items = ctx.resolve_input(&self.input).context("resolve input")?;
        let results = run_items(
            ctx,
            RunItemsRequest {
                node_type_tag: TYPE_TAG,
                node_name: &self.name,
                config: &self.config,
                output_config: &self.output_config,
                workload_tag: &self.workload_tag(),
                primary_output_key: OUTPUT_KEY,
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

struct UppercaseWorkload {
    node_name: String,
    prefix: String,
    output_config: OutputConfig,
    build_dir: Utf8PathBuf,
    cwd: Utf8PathBuf,
    hooks: HookRegistry,
}

impl Workload for UppercaseWorkload {
    fn perform(&self, item: &Utf8Path) -> Result<JobOutcome> {
        let expected = default_output_path(
            &self.output_config,
            &self.node_name,
            &self.build_dir,
            &self.cwd,
            &self.hooks,
            item,
        )?;

        let raw = std::fs::read_to_string(item.as_std_path())
            .with_context(|| format!("read input {item}"))?;
        let transformed = format!("{}{}", self.prefix, raw.to_uppercase());

        if let Some(parent) = expected.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .with_context(|| format!("create output directory {parent}"))?;
        }
        std::fs::write(expected.as_std_path(), transformed)
            .with_context(|| format!("write output {expected}"))?;

        Ok(JobOutcome {
            outputs: vec![(OUTPUT_KEY.to_string(), expected)],
            discovered_deps: vec![],
        })
    }
}
