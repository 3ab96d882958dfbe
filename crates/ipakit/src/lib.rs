pub mod archive;
pub mod builder;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod icons;
pub mod pipeline;
pub mod plist_editor;
pub mod provisioning;
pub mod signing;
pub mod tasks;
pub mod tools;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use archive::{create_ipa, ArchiveWriter, CompressionLevel};
pub use builder::IpaBuilder;
pub use config::{BuildConfig, OutputFormat};
pub use context::{BuildContext, BuildPaths, ProjectDescriptor};
pub use error::{Error, ErrorKind};
pub use pipeline::{BuildResult, BuildTask, Phase, Pipeline, PipelineBuilder, TaskOutcome, TaskResult};
pub use plist_editor::PropertyList;
pub use provisioning::{DistributionScope, ProvisioningProfile};
pub use signing::{with_scoped_resource, CredentialRegistry, InMemoryRegistry, SecurityRegistry, SigningSession};
pub use tasks::{standard_pipeline, Services};
pub use tools::{SystemToolRunner, ToolOutput, ToolRunner};
pub use upload::Uploader;

pub type Result<T> = std::result::Result<T, Error>;
