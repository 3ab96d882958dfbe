use super::copy_tree;
use crate::archive::is_excluded_from_source_archive;
use crate::context::BuildContext;
use crate::pipeline::{BuildTask, TaskOutcome, TaskResult};
use std::fs;
use std::path::Path;
use tracing::info;

/// Copies the project's compiled sources and assets into the bundle.
///
/// `src/` lands in `<app>/src` and `assets/` in `<app>/assets`. Profiles,
/// block files and extension directories are left behind.
pub struct CompileSourcesTask;

impl BuildTask for CompileSourcesTask {
    fn name(&self) -> &str {
        "compile-sources"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let mut copied = 0;
        for (dir, name) in [(&ctx.paths.sources_dir, "src"), (&ctx.paths.assets_dir, "assets")] {
            if !dir.is_dir() {
                continue;
            }
            let target = ctx.paths.app_bundle.join(name);
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            copied += copy_tree(dir, &target, |rel| {
                is_excluded_from_source_archive(&Path::new(name).join(rel))
            })?;
        }
        info!(files = copied, "project files copied into bundle");
        Ok(TaskOutcome::Done)
    }
}
