use crate::archive::{create_ipa, is_excluded_from_source_archive, ArchiveWriter, CompressionLevel};
use crate::context::{BuildContext, PROJECT_PROPERTIES};
use crate::icons::{ota_icon_path, OTA_ICON_SIZES};
use crate::pipeline::{BuildTask, TaskOutcome, TaskResult};
use crate::plist_editor::PropertyList;
use crate::tools::ToolRunner;
use crate::upload::Uploader;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// File name of the over-the-air install manifest.
pub const OTA_MANIFEST: &str = "manifest.plist";

fn compression(ctx: &BuildContext) -> CompressionLevel {
    CompressionLevel::new(ctx.config.compression_level)
}

/// Zips `Payload/<Name>.app` into `<deploy>/<Name>.ipa`.
pub struct PackageIpaTask;

impl BuildTask for PackageIpaTask {
    fn name(&self) -> &str {
        "ipa"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let output = ctx.ipa_path();
        if output.exists() {
            fs::remove_file(&output)?;
        }
        let ipa = create_ipa(&ctx.paths.app_bundle, &output, compression(ctx))?;
        info!(ipa = %ipa.display(), "IPA written");
        Ok(TaskOutcome::Files(vec![ipa]))
    }
}

/// Writes the OTA install manifest and its two icons to the deploy
/// directory.
pub struct OtaManifestTask;

impl OtaManifestTask {
    fn manifest(ctx: &BuildContext, base_url: &str) -> Result<PropertyList> {
        let base_url = base_url.trim_end_matches('/');
        let asset = |kind: &str, file: String| {
            let mut dict = Dictionary::new();
            dict.insert("kind".into(), Value::String(kind.into()));
            dict.insert("url".into(), Value::String(format!("{}/{}", base_url, file)));
            Value::Dictionary(dict)
        };

        let assets = vec![
            asset("software-package", format!("{}.ipa", ctx.project.name)),
            asset("display-image", ota_icon_file(OTA_ICON_SIZES[0])),
            asset("full-size-image", ota_icon_file(OTA_ICON_SIZES[1])),
        ];

        let mut metadata = Dictionary::new();
        metadata.insert("bundle-identifier".into(), Value::String(ctx.bundle_id()?.into()));
        metadata.insert(
            "bundle-version".into(),
            Value::String(ctx.project.version_name.clone()),
        );
        metadata.insert("kind".into(), Value::String("software".into()));
        metadata.insert("title".into(), Value::String(ctx.project.display_name.clone()));

        let mut item = Dictionary::new();
        item.insert("assets".into(), Value::Array(assets));
        item.insert("metadata".into(), Value::Dictionary(metadata));

        let mut manifest = PropertyList::new();
        manifest.push("items", Value::Dictionary(item))?;
        Ok(manifest)
    }
}

fn ota_icon_file(size: u32) -> String {
    format!("icon-{}.png", size)
}

impl BuildTask for OtaManifestTask {
    fn name(&self) -> &str {
        "ota-manifest"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let base_url = ctx
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("base_url is required for ad-hoc builds".into()))?;
        let manifest = Self::manifest(ctx, base_url)?;

        let deploy = &ctx.paths.deploy_dir;
        let manifest_path = deploy.join(OTA_MANIFEST);
        manifest.save_to(&manifest_path)?;

        let mut files = vec![manifest_path];
        for size in OTA_ICON_SIZES {
            let target = deploy.join(ota_icon_file(size));
            fs::copy(ota_icon_path(ctx, size), &target)?;
            files.push(target);
        }
        info!(manifest = %files[0].display(), "OTA manifest written");
        Ok(TaskOutcome::Files(files))
    }
}

/// Archives the project tree as `<deploy>/<Name>-source.zip`.
pub struct SourceArchiveTask;

impl SourceArchiveTask {
    fn sources(root: &Path) -> Vec<PathBuf> {
        let properties_dir = Path::new(PROJECT_PROPERTIES)
            .parent()
            .map(|p| root.join(p))
            .unwrap_or_else(|| root.to_path_buf());
        [properties_dir, root.join("src"), root.join("assets")]
            .into_iter()
            .filter(|p| p.exists())
            .collect()
    }
}

impl BuildTask for SourceArchiveTask {
    fn name(&self) -> &str {
        "source-archive"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let root = &ctx.paths.project_root;
        let output = ctx
            .paths
            .deploy_dir
            .join(format!("{}-source.zip", ctx.project.name));
        let sources = Self::sources(root);
        let archive = ArchiveWriter::new(compression(ctx))
            .exclude(is_excluded_from_source_archive)
            .write_zip(root, sources.as_slice(), &output)?;
        info!(archive = %archive.display(), "source archive written");
        Ok(TaskOutcome::Files(vec![archive]))
    }
}

/// Uploads the IPA to App Store Connect.
pub struct UploadTask {
    uploader: Uploader,
}

impl UploadTask {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            uploader: Uploader::new(runner),
        }
    }
}

impl BuildTask for UploadTask {
    fn name(&self) -> &str {
        "upload"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        self.uploader.upload(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, OutputFormat};
    use crate::context::{BuildPaths, ProjectDescriptor};
    use std::io::Read;
    use tempfile::TempDir;

    fn context(root: &Path) -> BuildContext {
        let mut project = ProjectDescriptor::new("MyApp");
        project.display_name = "My App".into();
        project.version_name = "1.4".into();
        let mut config = BuildConfig::new(OutputFormat::AdHoc, root.join("Runtime.app"));
        config.base_url = Some("https://builds.example.com/ota/42/".into());
        let mut ctx = BuildContext::new(
            project,
            BuildPaths::new(root.join("project"), root.join("work"), root.join("deploy"), "MyApp"),
            config,
        );
        ctx.signing.bundle_id = Some("com.example.MyApp".into());
        fs::create_dir_all(&ctx.paths.deploy_dir).unwrap();
        ctx
    }

    fn string_at<'a>(value: &'a Value, keys: &[&str]) -> &'a str {
        keys.iter()
            .fold(value, |v, k| v.as_dictionary().unwrap().get(k).unwrap())
            .as_string()
            .unwrap()
    }

    #[test]
    fn test_ipa_contains_payload() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        fs::create_dir_all(&ctx.paths.app_bundle).unwrap();
        fs::write(ctx.paths.app_bundle.join("Info.plist"), b"plist").unwrap();

        let outcome = PackageIpaTask.run(&mut ctx).unwrap();
        assert_eq!(outcome, TaskOutcome::Files(vec![ctx.ipa_path()]));

        let mut zip = zip::ZipArchive::new(fs::File::open(ctx.ipa_path()).unwrap()).unwrap();
        let mut contents = String::new();
        zip.by_name("Payload/MyApp.app/Info.plist")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "plist");
    }

    #[test]
    fn test_ota_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        for size in OTA_ICON_SIZES {
            let path = ota_icon_path(&ctx, size);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"png").unwrap();
        }

        let TaskOutcome::Files(files) = OtaManifestTask.run(&mut ctx).unwrap() else {
            panic!("manifest task reports its files");
        };
        assert_eq!(files.len(), 3);
        assert!(ctx.paths.deploy_dir.join("icon-57.png").is_file());
        assert!(ctx.paths.deploy_dir.join("icon-512.png").is_file());

        let manifest: Value = plist::from_file(ctx.paths.deploy_dir.join(OTA_MANIFEST)).unwrap();
        let items = manifest.as_dictionary().unwrap().get("items").unwrap();
        let item = &items.as_array().unwrap()[0];
        let assets = item
            .as_dictionary()
            .unwrap()
            .get("assets")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(string_at(&assets[0], &["kind"]), "software-package");
        assert_eq!(
            string_at(&assets[0], &["url"]),
            "https://builds.example.com/ota/42/MyApp.ipa"
        );
        assert_eq!(
            string_at(&assets[1], &["url"]),
            "https://builds.example.com/ota/42/icon-57.png"
        );
        assert_eq!(string_at(&assets[2], &["kind"]), "full-size-image");
        assert_eq!(string_at(item, &["metadata", "bundle-identifier"]), "com.example.MyApp");
        assert_eq!(string_at(item, &["metadata", "bundle-version"]), "1.4");
        assert_eq!(string_at(item, &["metadata", "kind"]), "software");
        assert_eq!(string_at(item, &["metadata", "title"]), "My App");
    }

    #[test]
    fn test_ota_manifest_needs_base_url() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        ctx.config.base_url = None;
        assert!(matches!(OtaManifestTask.run(&mut ctx).unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_source_archive_excludes_private_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path());
        let root = ctx.paths.project_root.clone();
        fs::create_dir_all(root.join("youngandroidproject")).unwrap();
        fs::create_dir_all(root.join("src/appinventor")).unwrap();
        fs::create_dir_all(root.join("assets/external_comps")).unwrap();
        fs::write(root.join(PROJECT_PROPERTIES), b"name=MyApp\n").unwrap();
        fs::write(root.join("src/appinventor/Screen1.scm"), b"scm").unwrap();
        fs::write(root.join("src/appinventor/Screen1.bky"), b"bky").unwrap();
        fs::write(root.join("assets/kitty.png"), b"png").unwrap();
        fs::write(root.join("assets/adhoc.mobileprovision"), b"cms").unwrap();
        fs::write(root.join("assets/external_comps/ext.aix"), b"aix").unwrap();

        SourceArchiveTask.run(&mut ctx).unwrap();

        let zip = zip::ZipArchive::new(
            fs::File::open(ctx.paths.deploy_dir.join("MyApp-source.zip")).unwrap(),
        )
        .unwrap();
        let names: Vec<&str> = zip.file_names().collect();
        assert!(names.contains(&"youngandroidproject/project.properties"));
        assert!(names.contains(&"src/appinventor/Screen1.scm"));
        assert!(names.contains(&"assets/kitty.png"));
        assert!(!names.iter().any(|n| n.ends_with(".bky")));
        assert!(!names.iter().any(|n| n.ends_with(".mobileprovision")));
        assert!(!names.iter().any(|n| n.contains("external_comps")));
    }
}
