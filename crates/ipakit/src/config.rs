//! Build configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! format = "ad-hoc"
//! template_app = "/opt/ipakit/Runtime.app"
//! base_url = "https://builds.example.com/ota/1234"
//!
//! [signing]
//! key_path = "/secure/accounts/42/signing-key.pem"
//!
//! [distribution]
//! username = "dev@example.com"
//! password = "app-specific-password"
//! ```

use crate::provisioning::{DistributionScope, DEFAULT_BUNDLE_ID_PREFIX};
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Target package flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Signed IPA plus OTA manifest for enumerated devices.
    AdHoc,
    /// Signed IPA uploaded to App Store Connect.
    AppStore,
    /// Unsigned IPA, for simulator and pipeline tests.
    Unsigned,
}

impl OutputFormat {
    pub const ALL: &'static [OutputFormat] =
        &[OutputFormat::AdHoc, OutputFormat::AppStore, OutputFormat::Unsigned];

    /// Provisioning scope this format signs for, if it signs at all.
    pub fn scope(&self) -> Option<DistributionScope> {
        match self {
            OutputFormat::AdHoc => Some(DistributionScope::AdHoc),
            OutputFormat::AppStore => Some(DistributionScope::Store),
            OutputFormat::Unsigned => None,
        }
    }

    /// Whether a pipeline with no sign-phase task may produce this format.
    pub fn signing_optional(&self) -> bool {
        matches!(self, OutputFormat::Unsigned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::AdHoc => "ad-hoc",
            OutputFormat::AppStore => "app-store",
            OutputFormat::Unsigned => "unsigned",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OutputFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::Config(format!("Unknown output format: {}", s)))
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Private key half of the account's signing identity.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// PEM or DER private key generated for this account.
    pub key_path: PathBuf,
    #[serde(default)]
    pub key_password: Option<SecretString>,
}

/// App Store Connect credentials for the upload step.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributionCredentials {
    pub username: String,
    pub password: SecretString,
    /// Provider short name; discovered from `altool` output when absent.
    #[serde(default)]
    pub provider_short_name: Option<String>,
    /// Attempts for transient network failures during upload.
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
}

fn default_upload_attempts() -> u32 {
    3
}

/// Locations of the external tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub codesign: String,
    pub security: String,
    pub actool: String,
    pub xcrun: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            codesign: "/usr/bin/codesign".into(),
            security: "/usr/bin/security".into(),
            actool: "/Applications/Xcode.app/Contents/Developer/usr/bin/actool".into(),
            xcrun: "/usr/bin/xcrun".into(),
        }
    }
}

/// Everything a single build needs besides the project tree.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub format: OutputFormat,
    /// Compiled runtime bundle copied into the work directory.
    pub template_app: PathBuf,
    #[serde(default)]
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub distribution: Option<DistributionCredentials>,
    /// Prefix for bundle ids derived from wildcard profiles.
    #[serde(default = "default_bundle_id_prefix")]
    pub bundle_id_prefix: String,
    /// Public URL of the deploy directory, used in the OTA manifest.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_minimum_os_version")]
    pub minimum_os_version: String,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub tools: ToolPaths,
}

fn default_bundle_id_prefix() -> String {
    DEFAULT_BUNDLE_ID_PREFIX.to_string()
}

fn default_minimum_os_version() -> String {
    "12.0".to_string()
}

fn default_compression_level() -> u32 {
    6
}

impl BuildConfig {
    /// Minimal configuration; everything else takes its default.
    pub fn new(format: OutputFormat, template_app: impl Into<PathBuf>) -> Self {
        Self {
            format,
            template_app: template_app.into(),
            signing: None,
            distribution: None,
            bundle_id_prefix: default_bundle_id_prefix(),
            base_url: None,
            minimum_os_version: default_minimum_os_version(),
            compression_level: default_compression_level(),
            tools: ToolPaths::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid build config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Checks format-specific requirements that do not need the project.
    ///
    /// Signing material and distribution credentials are validated by the
    /// pipeline tasks that use them, so their absence surfaces as a
    /// [`Error::MissingAsset`] from the right task.
    pub fn validate(&self) -> Result<()> {
        if self.bundle_id_prefix.is_empty() || self.bundle_id_prefix.ends_with('.') {
            return Err(Error::Config(format!(
                "Invalid bundle id prefix: {:?}",
                self.bundle_id_prefix
            )));
        }
        if self.compression_level > 9 {
            return Err(Error::Config(format!(
                "Compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}
