//! Error types for ipakit builds.
//!
//! Every task in the pipeline returns [`crate::Result<T>`], which uses the
//! [`enum@Error`] enum defined here. The pipeline never recovers from an
//! error: the first one returned becomes the build's only diagnostic.
//!
//! Use [`Error::kind`] to classify a failure into the four user-facing
//! tiers (missing asset, external tool failure, format error,
//! distribution conflict).

use thiserror::Error;

/// Error type for ipakit operations.
///
/// # Examples
///
/// ```no_run
/// use ipakit::{Error, ErrorKind};
///
/// fn report(err: &Error) {
///     match err.kind() {
///         ErrorKind::MissingAsset => eprintln!("fix the project: {err}"),
///         ErrorKind::DistributionConflict => eprintln!("{err}"),
///         _ => eprintln!("build failed: {err}"),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A required input is absent (provisioning profile, signing
    /// certificate, private key, distribution credentials).
    ///
    /// Not retried; the user has to supply the asset.
    #[error("Missing asset: {0}")]
    MissingAsset(String),

    /// An external tool exited non-zero or could not be started.
    ///
    /// `message` carries the tool's diagnostic output verbatim.
    #[error("{tool} failed: {message}")]
    ExternalTool {
        /// Program name as invoked.
        tool: String,
        /// Captured stderr (or stdout when stderr was empty).
        message: String,
    },

    /// Malformed structured document (property list, signed-data
    /// container, certificate, icon manifest).
    #[error("Format error: {0}")]
    Format(String),

    /// The distribution endpoint already holds a build with this number.
    #[error("This build number was already delivered; increase your build number and try again")]
    DistributionConflict,

    /// Invalid or mismatched signing certificate or key.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Invalid build configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pipeline has no signing task but its output format requires one.
    #[error("Output format {0} cannot be produced without signing")]
    UnsignedBuildNotAllowed(String),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Image decoding, resampling or encoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON manifest serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`enum@Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required input is absent; requires user action.
    MissingAsset,
    /// A shelled-out tool failed; diagnostic passed through.
    ExternalTool,
    /// Malformed structured document.
    Format,
    /// Same build number already submitted.
    DistributionConflict,
    /// I/O and other plumbing failures.
    Internal,
}

impl Error {
    pub fn missing_asset(message: impl Into<String>) -> Self {
        Self::MissingAsset(message.into())
    }

    pub fn external_tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Returns the user-facing tier of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAsset(_) => ErrorKind::MissingAsset,
            Error::ExternalTool { .. } => ErrorKind::ExternalTool,
            Error::Format(_) | Error::Plist(_) | Error::Certificate(_) => ErrorKind::Format,
            Error::DistributionConflict => ErrorKind::DistributionConflict,
            Error::Io(_)
            | Error::Config(_)
            | Error::UnsignedBuildNotAllowed(_)
            | Error::Zip(_)
            | Error::Image(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }
}
