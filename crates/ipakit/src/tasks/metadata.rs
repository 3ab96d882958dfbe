use crate::config::OutputFormat;
use crate::context::BuildContext;
use crate::pipeline::{BuildTask, TaskOutcome, TaskResult};
use crate::plist_editor::PropertyList;
use crate::{Error, Result};
use plist::Value;
use tracing::{debug, info};

/// Usage-description keys required by component types that touch
/// privacy-protected hardware or data.
const USAGE_DESCRIPTIONS: &[(&str, &str, &str)] = &[
    ("Camera", "NSCameraUsageDescription", "This app uses the camera to take pictures."),
    ("Camcorder", "NSCameraUsageDescription", "This app uses the camera to record video."),
    ("Camcorder", "NSMicrophoneUsageDescription", "This app records audio with video."),
    ("SoundRecorder", "NSMicrophoneUsageDescription", "This app records audio."),
    ("SpeechRecognizer", "NSMicrophoneUsageDescription", "This app listens for speech."),
    ("SpeechRecognizer", "NSSpeechRecognitionUsageDescription", "This app converts speech to text."),
    ("LocationSensor", "NSLocationWhenInUseUsageDescription", "This app uses your location."),
    ("Map", "NSLocationWhenInUseUsageDescription", "This app shows your location on a map."),
    ("ImagePicker", "NSPhotoLibraryUsageDescription", "This app picks images from your photo library."),
    ("Camera", "NSPhotoLibraryAddUsageDescription", "This app saves pictures to your photo library."),
];

/// Patches the bundle's Info.plist with the project's identity.
pub struct InfoPlistTask;

impl InfoPlistTask {
    fn bundle_id(ctx: &BuildContext) -> String {
        match &ctx.signing.bundle_id {
            Some(id) => id.clone(),
            None => format!("{}.{}", ctx.config.bundle_id_prefix, ctx.project.name),
        }
    }
}

impl BuildTask for InfoPlistTask {
    fn name(&self) -> &str {
        "info-plist"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let path = ctx.paths.app_bundle.join("Info.plist");
        let mut info = if path.is_file() {
            PropertyList::open(&path)?
        } else {
            PropertyList::new()
        };

        let project = &ctx.project;
        info.set_string("CFBundleIdentifier", Self::bundle_id(ctx))
            .set_string("CFBundleName", project.name.clone())
            .set_string("CFBundleDisplayName", project.display_name.clone())
            .set_string("CFBundleShortVersionString", project.version_name.clone())
            .set_string("CFBundleVersion", project.version_code.clone())
            .set_string("MinimumOSVersion", ctx.config.minimum_os_version.clone());
        if info.get_string("CFBundleExecutable").is_none() {
            info.set_string("CFBundleExecutable", project.name.clone());
        }

        for (component, key, text) in USAGE_DESCRIPTIONS {
            if project.component_types.contains(*component) && info.get(key).is_none() {
                info.set_string(key, *text);
            }
        }

        let partial = ctx.paths.actool_info_plist();
        if partial.is_file() {
            let actool = PropertyList::open(&partial)?;
            for (key, value) in actool.dictionary() {
                info.set(key, value.clone());
            }
            debug!(keys = actool.dictionary().len(), "merged actool Info.plist keys");
        }

        info.save_to(&path)?;
        info!(bundle_id = %Self::bundle_id(ctx), version = %project.version_code, "Info.plist written");
        Ok(TaskOutcome::Done)
    }
}

/// Writes `<work>/entitlements.plist` from the provisioning profile.
pub struct EntitlementsTask;

impl EntitlementsTask {
    fn entitlements(ctx: &BuildContext) -> Result<PropertyList> {
        let profile = ctx
            .signing
            .profile
            .as_ref()
            .ok_or_else(|| Error::missing_asset("No provisioning profile extracted"))?;
        let team_id = ctx.team_id()?;
        let bundle_id = ctx.bundle_id()?;

        let mut entitlements = PropertyList::from_dictionary(profile.entitlements().clone());
        entitlements
            .set_string("application-identifier", format!("{}.{}", team_id, bundle_id))
            .set_string("com.apple.developer.team-identifier", team_id);
        if ctx.config.format == OutputFormat::AppStore {
            entitlements.remove("get-task-allow");
        } else if entitlements.get("get-task-allow").is_none() {
            entitlements.set("get-task-allow", Value::Boolean(false));
        }
        Ok(entitlements)
    }
}

impl BuildTask for EntitlementsTask {
    fn name(&self) -> &str {
        "entitlements"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let entitlements = Self::entitlements(ctx)?;
        let path = ctx.paths.entitlements_file();
        entitlements.save_to(&path)?;
        debug!(path = %path.display(), "entitlements written");
        Ok(TaskOutcome::Done)
    }
}
