//! App Store Connect upload through `xcrun altool`.

use crate::context::BuildContext;
use crate::pipeline::{TaskOutcome, TaskResult};
use crate::tools::{args, ToolOutput, ToolRunner};
use crate::{Error, Result};
use secrecy::ExposeSecret;
use std::ffi::OsString;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Marker altool prints when the build number was already uploaded.
const ALREADY_DELIVERED: &str = "already been successfully delivered";

/// Output fragments that mark a failure as worth retrying.
const TRANSIENT_MARKERS: &[&str] = &["network", "timed out"];

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Uploads the IPA to App Store Connect.
pub struct Uploader {
    runner: Arc<dyn ToolRunner>,
    retry_delay: Duration,
}

impl Uploader {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Submits `<deploy>/<Name>.ipa` for the build's team.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingAsset`] without credentials or a team id.
    /// - [`Error::DistributionConflict`] if the build number was already
    ///   delivered.
    /// - [`Error::ExternalTool`] for any other altool failure, after
    ///   retrying transient network errors.
    pub fn upload(&self, ctx: &BuildContext) -> TaskResult {
        let credentials = ctx
            .config
            .distribution
            .as_ref()
            .ok_or_else(|| Error::missing_asset("No App Store Connect credentials"))?;
        let team_id = ctx.team_id()?;
        let ipa = ctx.ipa_path();
        if !ipa.is_file() {
            return Err(Error::missing_asset(format!("{} does not exist", ipa.display())));
        }

        let provider = match &credentials.provider_short_name {
            Some(short_name) => short_name.clone(),
            None => self.discover_provider(ctx, team_id)?,
        };

        let argv = args([
            "altool".into(),
            "--upload-app".into(),
            "-t".into(),
            "ios".into(),
            "-f".into(),
            ipa.clone().into_os_string(),
            "-u".into(),
            credentials.username.clone().into(),
            "-p".into(),
            credentials.password.expose_secret().into(),
            "--asc-provider".into(),
            OsString::from(&provider),
        ]);

        let attempts = credentials.upload_attempts.max(1);
        for attempt in 1..=attempts {
            info!(ipa = %ipa.display(), provider = %provider, attempt, "uploading to App Store Connect");
            let output = self.runner.run(&ctx.config.tools.xcrun, &argv)?;

            match classify(&output) {
                Outcome::Delivered => {
                    info!(ipa = %ipa.display(), "upload accepted");
                    return Ok(TaskOutcome::Done);
                }
                Outcome::Duplicate => return Err(Error::DistributionConflict),
                Outcome::Transient if attempt < attempts => {
                    warn!(attempt, "upload failed with a transient error; retrying: {}", output.diagnostic().trim());
                    thread::sleep(self.retry_delay);
                }
                Outcome::Transient | Outcome::Failed => {
                    return Err(Error::external_tool(&ctx.config.tools.xcrun, output.diagnostic()));
                }
            }
        }

        Err(Error::external_tool(&ctx.config.tools.xcrun, "upload was not attempted"))
    }

    fn discover_provider(&self, ctx: &BuildContext, team_id: &str) -> Result<String> {
        let Some(credentials) = ctx.config.distribution.as_ref() else {
            return Err(Error::missing_asset("No App Store Connect credentials"));
        };
        let argv = args([
            "altool".into(),
            "--list-providers".into(),
            "-u".into(),
            credentials.username.clone().into(),
            "-p".into(),
            OsString::from(credentials.password.expose_secret()),
        ]);
        let output = self.runner.run_checked(&ctx.config.tools.xcrun, &argv)?;
        provider_short_name(&output.stdout, team_id).ok_or_else(|| {
            Error::missing_asset(format!(
                "No App Store Connect provider for team {}",
                team_id
            ))
        })
    }
}

enum Outcome {
    Delivered,
    Duplicate,
    Transient,
    Failed,
}

fn classify(output: &ToolOutput) -> Outcome {
    let text = format!("{}\n{}", output.stdout, output.stderr);
    if text.contains(ALREADY_DELIVERED) {
        return Outcome::Duplicate;
    }
    if output.success() {
        return Outcome::Delivered;
    }
    let lower = text.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        Outcome::Transient
    } else {
        Outcome::Failed
    }
}

/// Finds the provider short name for `team_id` in `--list-providers` output.
///
/// Provider names may contain spaces, so columns are counted from the end:
/// `ProviderName ProviderShortname PublicID WWDRTeamID`.
pub fn provider_short_name(listing: &str, team_id: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            [.., short_name, _public_id, team] if *team == team_id => Some(short_name.to_string()),
            _ => None,
        }
    })
}
