//! The standard build tasks and the table that wires them into phases.

mod compile;
mod icon;
mod metadata;
mod package;
mod prepare;
mod sign;

pub use compile::CompileSourcesTask;
pub use icon::IconTask;
pub use metadata::{EntitlementsTask, InfoPlistTask};
pub use package::{OtaManifestTask, PackageIpaTask, SourceArchiveTask, UploadTask};
pub use prepare::{ExtractProfileTask, PrepareBundleTask, ValidateCredentialsTask};
pub use sign::SignTask;

use crate::config::{BuildConfig, OutputFormat};
use crate::pipeline::{Phase, PipelineBuilder};
use crate::signing::{CredentialRegistry, SecurityRegistry};
use crate::tools::{SystemToolRunner, ToolRunner};
use crate::Result;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

const ALL: &[OutputFormat] = OutputFormat::ALL;
const SIGNED: &[OutputFormat] = &[OutputFormat::AdHoc, OutputFormat::AppStore];
const AD_HOC: &[OutputFormat] = &[OutputFormat::AdHoc];
const APP_STORE: &[OutputFormat] = &[OutputFormat::AppStore];

/// Host integrations the tasks depend on.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn ToolRunner>,
    pub registry: Arc<dyn CredentialRegistry>,
}

impl Services {
    /// Real tools and the user keychain search list.
    pub fn system(config: &BuildConfig) -> Self {
        let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner);
        let registry = Arc::new(SecurityRegistry::new(runner.clone(), config.tools.security.clone()));
        Self { runner, registry }
    }
}

/// The task table for every supported output format.
///
/// | phase    | task                 | formats           |
/// |----------|----------------------|-------------------|
/// | prepare  | validate-credentials | app-store         |
/// | prepare  | prepare-bundle       | all               |
/// | prepare  | extract-profile      | ad-hoc, app-store |
/// | icon     | icons                | all               |
/// | metadata | info-plist           | all               |
/// | metadata | entitlements         | ad-hoc, app-store |
/// | compile  | compile-sources      | all               |
/// | sign     | sign                 | ad-hoc, app-store |
/// | package  | ipa                  | all               |
/// | package  | ota-manifest         | ad-hoc            |
/// | package  | source-archive       | all               |
/// | package  | upload               | app-store         |
pub fn standard_pipeline(services: &Services) -> PipelineBuilder {
    PipelineBuilder::new()
        .register(Phase::Prepare, APP_STORE, ValidateCredentialsTask)
        .register(Phase::Prepare, ALL, PrepareBundleTask)
        .register(Phase::Prepare, SIGNED, ExtractProfileTask)
        .register(Phase::Icon, ALL, IconTask::new(services.runner.clone()))
        .register(Phase::Metadata, ALL, InfoPlistTask)
        .register(Phase::Metadata, SIGNED, EntitlementsTask)
        .register(Phase::Compile, ALL, CompileSourcesTask)
        .register(
            Phase::Sign,
            SIGNED,
            SignTask::new(services.runner.clone(), services.registry.clone()),
        )
        .register(Phase::Package, ALL, PackageIpaTask)
        .register(Phase::Package, AD_HOC, OtaManifestTask)
        .register(Phase::Package, ALL, SourceArchiveTask)
        .register(Phase::Package, APP_STORE, UploadTask::new(services.runner.clone()))
}

/// Recursively copies `src` into `dst`, skipping entries for which
/// `exclude` returns true (paths relative to `src`). Symlinks are
/// recreated, not followed.
pub(crate) fn copy_tree(src: &Path, dst: &Path, exclude: impl Fn(&Path) -> bool) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(src)
                .map(|rel| !exclude(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let destination = fs::read_link(link)?;
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(destination, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::copy(link, target)?;
    Ok(())
}
