//! Per-build state shared by every pipeline task.

use crate::config::BuildConfig;
use crate::provisioning::ProvisioningProfile;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Location of the project properties file inside a project tree.
pub const PROJECT_PROPERTIES: &str = "youngandroidproject/project.properties";

/// What the project says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDescriptor {
    /// Identifier-safe name; also the bundle and executable directory name.
    pub name: String,
    pub display_name: String,
    pub version_name: String,
    pub version_code: String,
    /// Icon file name relative to `assets/`.
    pub icon: Option<String>,
    /// Component types the app uses (drive Info.plist usage strings).
    pub component_types: BTreeSet<String>,
}

impl ProjectDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version_name: "1.0".into(),
            version_code: "1".into(),
            icon: None,
            component_types: BTreeSet::new(),
        }
    }

    /// Reads `youngandroidproject/project.properties` under `project_root`.
    ///
    /// Recognised keys: `name`, `aname` (display name), `versionname`,
    /// `versioncode`, `icon`, `components` (comma separated).
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self> {
        let path = project_root.as_ref().join(PROJECT_PROPERTIES);
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::missing_asset(format!("{}: {}", path.display(), e)))?;
        Self::from_properties(&text)
    }

    pub fn from_properties(text: &str) -> Result<Self> {
        let props = parse_properties(text);
        let name = props
            .get("name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::format("project.properties has no name"))?;

        let mut project = Self::new(name.clone());
        if let Some(display) = props.get("aname").filter(|v| !v.is_empty()) {
            project.display_name = display.clone();
        }
        if let Some(v) = props.get("versionname").filter(|v| !v.is_empty()) {
            project.version_name = v.clone();
        }
        if let Some(v) = props.get("versioncode").filter(|v| !v.is_empty()) {
            project.version_code = v.clone();
        }
        project.icon = props.get("icon").filter(|v| !v.is_empty()).cloned();
        if let Some(components) = props.get("components") {
            project.component_types = components
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(project)
    }
}

/// `key=value` lines; `#` and `!` start comments.
fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Filesystem layout of one build.
#[derive(Debug, Clone)]
pub struct BuildPaths {
    pub project_root: PathBuf,
    pub assets_dir: PathBuf,
    pub sources_dir: PathBuf,
    /// Scratch directory owned by this build.
    pub work_dir: PathBuf,
    /// `<work>/Payload/<Name>.app`
    pub app_bundle: PathBuf,
    /// `<app>/Frameworks`
    pub frameworks_dir: PathBuf,
    /// Where final artifacts are written.
    pub deploy_dir: PathBuf,
}

impl BuildPaths {
    pub fn new(
        project_root: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        deploy_dir: impl Into<PathBuf>,
        app_name: &str,
    ) -> Self {
        let project_root = project_root.into();
        let work_dir = work_dir.into();
        let app_bundle = work_dir.join("Payload").join(format!("{}.app", app_name));
        Self {
            assets_dir: project_root.join("assets"),
            sources_dir: project_root.join("src"),
            frameworks_dir: app_bundle.join("Frameworks"),
            app_bundle,
            project_root,
            work_dir,
            deploy_dir: deploy_dir.into(),
        }
    }

    /// `<work>/entitlements.plist`
    pub fn entitlements_file(&self) -> PathBuf {
        self.work_dir.join("entitlements.plist")
    }

    /// `<work>/actool-info.plist`, the keys `actool` wants merged into
    /// Info.plist.
    pub fn actool_info_plist(&self) -> PathBuf {
        self.work_dir.join("actool-info.plist")
    }

    /// `<work>/Assets.xcassets`
    pub fn asset_catalog(&self) -> PathBuf {
        self.work_dir.join("Assets.xcassets")
    }
}

/// Signing facts accumulated during the build.
#[derive(Debug, Clone, Default)]
pub struct SigningState {
    pub team_id: Option<String>,
    pub bundle_id: Option<String>,
    pub certificate_pem: Option<String>,
    pub certificate_fingerprint: Option<String>,
    pub profile: Option<ProvisioningProfile>,
    pub profile_path: Option<PathBuf>,
}

/// Mutable aggregate for one build invocation.
#[derive(Debug)]
pub struct BuildContext {
    pub project: ProjectDescriptor,
    pub paths: BuildPaths,
    pub config: BuildConfig,
    pub signing: SigningState,
    /// Files produced so far, in production order.
    pub outputs: Vec<PathBuf>,
}

impl BuildContext {
    pub fn new(project: ProjectDescriptor, paths: BuildPaths, config: BuildConfig) -> Self {
        Self {
            project,
            paths,
            config,
            signing: SigningState::default(),
            outputs: Vec::new(),
        }
    }

    /// Bundle id, once the provisioning profile has been extracted.
    pub fn bundle_id(&self) -> Result<&str> {
        self.signing
            .bundle_id
            .as_deref()
            .ok_or_else(|| Error::missing_asset("Bundle id not yet derived from a provisioning profile"))
    }

    pub fn team_id(&self) -> Result<&str> {
        self.signing
            .team_id
            .as_deref()
            .ok_or_else(|| Error::missing_asset("Team id not yet derived from a provisioning profile"))
    }

    /// Path of the assembled IPA in the deploy directory.
    pub fn ipa_path(&self) -> PathBuf {
        self.paths.deploy_dir.join(format!("{}.ipa", self.project.name))
    }
}
