//! Copies each resolved item to its shaped output path, unchanged.

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

const TYPE_TAG: &str = "Copy";
const OUTPUT_KEY: &str = "out";

pub struct CopyNode {
    name: String,
    input: Input,
    config: ConfigValue,
    output_config: OutputConfig,
}

impl CopyNode {
    pub fn new(name: impl Into<String>, input: Input) -> Self {
        let name = name.into();

        let mut fields: Vec<(String, ConfigValue)> = Vec::new();
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
impl Node for CopyNode {
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
        let workload = CopyWorkload {
            node_name: self.name.clone(),
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

struct CopyWorkload {
    node_name: String,
    output_config: OutputConfig,
    build_dir: Utf8PathBuf,
    cwd: Utf8PathBuf,
    hooks: HookRegistry,
}

impl Workload for CopyWorkload {
    fn perform(&self, item: &Utf8Path) -> Result<JobOutcome> {
        let expected = default_output_path(
            &self.output_config,
            &self.node_name,
            &self.build_dir,
            &self.cwd,
            &self.hooks,
            item,
        )?;

        if let Some(parent) = expected.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .with_context(|| format!("create output directory {parent}"))?;
        }
        std::fs::copy(item.as_std_path(), expected.as_std_path())
            .with_context(|| format!("copy {item} to {expected}"))?;

        Ok(JobOutcome {
            outputs: vec![(OUTPUT_KEY.to_string(), expected)],
            discovered_deps: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn workload_copies_bytes_verbatim() {
        let dir = tempdir().unwrap();
        let cwd = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let build_dir = cwd.join("build");
        let input = cwd.join("a.txt");
        std::fs::write(input.as_std_path(), "hello").unwrap();

        let workload = CopyWorkload {
            node_name: "C".to_string(),
            output_config: OutputConfig::default(),
            build_dir,
            cwd,
            hooks: HookRegistry::new(),
        };

        let outcome = workload.perform(&input).unwrap();
        let (key, path) = &outcome.outputs[0];
        assert_eq!(key, OUTPUT_KEY);
        assert_eq!(std::fs::read_to_string(path.as_std_path()).unwrap(), "hello");
    }
}
