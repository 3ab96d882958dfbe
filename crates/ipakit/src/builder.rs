//! IpaBuilder API
//!
//! Provides a builder pattern interface over the packaging pipeline: point
//! it at a project, a build configuration and output directories, then
//! call [`IpaBuilder::build`].

use crate::config::BuildConfig;
use crate::context::{BuildContext, BuildPaths, ProjectDescriptor};
use crate::pipeline::{BuildResult, Pipeline};
use crate::tasks::{standard_pipeline, Services};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// iOS packaging pipeline with builder pattern API.
///
/// # Example
///
/// ```ignore
/// use ipakit::{BuildConfig, IpaBuilder};
///
/// let outputs = IpaBuilder::new()
///     .project("projects/MyApp")
///     .config(BuildConfig::load("build.toml")?)
///     .deploy_dir("out")
///     .build()?;
/// ```
#[derive(Clone, Default)]
pub struct IpaBuilder {
    project_root: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    deploy_dir: Option<PathBuf>,
    config: Option<BuildConfig>,
    services: Option<Services>,
}

impl IpaBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the project directory (the one holding `assets/` and `src/`).
    pub fn project(mut self, path: impl AsRef<Path>) -> Self {
        self.project_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the scratch directory. Defaults to `<project>/build/ios`.
    pub fn work_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.work_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set where artifacts are written. Defaults to `<project>/build/deploy`.
    pub fn deploy_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.deploy_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn config(mut self, config: BuildConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the host tools and keychain registry.
    pub fn services(mut self, services: Services) -> Self {
        self.services = Some(services);
        self
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if the project or configuration is missing, or the
    /// configuration itself is invalid.
    pub fn validate(&self) -> Result<()> {
        let root = self
            .project_root
            .as_ref()
            .ok_or_else(|| Error::Config("No project directory set".into()))?;
        if !root.is_dir() {
            return Err(Error::missing_asset(format!(
                "Project directory {} does not exist",
                root.display()
            )));
        }
        self.config
            .as_ref()
            .ok_or_else(|| Error::Config("No build configuration set".into()))?
            .validate()
    }

    /// Loads the project and assembles the pipeline and its context
    /// without running anything.
    pub fn prepare(self) -> Result<(Pipeline, BuildContext)> {
        self.validate()?;
        let Self {
            project_root,
            work_dir,
            deploy_dir,
            config,
            services,
        } = self;
        let (Some(root), Some(config)) = (project_root, config) else {
            return Err(Error::Config("Incomplete builder".into()));
        };

        let project = ProjectDescriptor::load(&root)?;
        let work_dir = work_dir.unwrap_or_else(|| root.join("build").join("ios"));
        let deploy_dir = deploy_dir.unwrap_or_else(|| root.join("build").join("deploy"));
        let paths = BuildPaths::new(&root, work_dir, deploy_dir, &project.name);

        let services = services.unwrap_or_else(|| Services::system(&config));
        let pipeline = standard_pipeline(&services).build(config.format)?;

        Ok((pipeline, BuildContext::new(project, paths, config)))
    }

    /// Runs the full pipeline and returns the produced files.
    pub fn build(self) -> BuildResult {
        let (pipeline, mut ctx) = self.prepare()?;
        info!(
            project = %ctx.project.name,
            format = %pipeline.format(),
            steps = ?pipeline.plan(),
            "packaging"
        );
        pipeline.run(&mut ctx)
    }
}
