use crate::context::BuildContext;
use crate::icons::IconAssetGenerator;
use crate::pipeline::{BuildTask, TaskResult};
use crate::tools::ToolRunner;
use std::sync::Arc;

pub struct IconTask {
    generator: IconAssetGenerator,
}

impl IconTask {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            generator: IconAssetGenerator::new(runner),
        }
    }
}

impl BuildTask for IconTask {
    fn name(&self) -> &str {
        "icons"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        self.generator.generate(ctx)
    }
}
