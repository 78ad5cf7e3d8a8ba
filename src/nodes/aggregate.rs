//! A composite node that groups several child nodes under one name.
//!
//! The children are injected into the pipeline from
//! [`Node::on_added_to_pipeline`], the moment the aggregate itself is added;
//! the aggregate's own `run` is a trivial collector that reads its
//! children's already-computed outputs and re-keys them under its own
//! output names. It declares explicit dependencies on its children so the
//! scheduler won't start it before every child has completed.

use async_trait::async_trait;
use color_eyre::{Result, eyre::eyre};

use crate::{
    config::ConfigValue,
    context::Context,
    node::{Node, NodeOutput},
    output_shaping::OutputConfig,
    pipeline::Pipeline,
};

pub struct AggregateNode {
    name: String,
    children: Vec<std::sync::Arc<dyn Node>>,
    child_names: Vec<String>,
    config: ConfigValue,
    output_config: OutputConfig,
}

impl AggregateNode {
    pub fn new(name: impl Into<String>, children: Vec<std::sync::Arc<dyn Node>>) -> Self {
        let child_names = children.iter().map(|c| c.name().to_string()).collect();
        Self {
            name: name.into(),
            children,
            child_names,
            config: ConfigValue::Null,
            output_config: OutputConfig::default(),
        }
    }
}

#[async_trait]
impl Node for AggregateNode {
    fn type_tag(&self) -> &str {
        "Aggregate"
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

    fn explicit_dependencies(&self) -> &[String] {
        &self.child_names
    }

    fn on_added_to_pipeline(&self, pipeline: &mut Pipeline) -> Result<()> {
        for child in &self.children {
            pipeline.add_node(std::sync::Arc::clone(child))?;
        }
        Ok(())
    }

    async fn run(&self, ctx: &Context) -> Result<Vec<NodeOutput>> {
        let mut merged = NodeOutput::new();
        for child in &self.children {
            let child_outputs = ctx
                .node_outputs_of(child.name())
                .ok_or_else(|| eyre!("child node {:?} has not produced output yet", child.name()))?;
            for output in child_outputs {
                for (key, path) in output.entries {
                    merged.push(key, path);
                }
            }
        }
        Ok(vec![merged])
    }
}
