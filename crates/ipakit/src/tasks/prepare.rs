use super::copy_tree;
use crate::context::BuildContext;
use crate::pipeline::{BuildTask, TaskOutcome, TaskResult};
use crate::provisioning::{select_profile, split_application_identifier};
use crate::{Error, Result};
use secrecy::ExposeSecret;
use std::fs;
use tracing::{debug, info};

/// File name of the profile copy inside the bundle.
pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";

/// Fails fast when an App Store build lacks what the later tasks need.
pub struct ValidateCredentialsTask;

impl BuildTask for ValidateCredentialsTask {
    fn name(&self) -> &str {
        "validate-credentials"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let credentials = ctx
            .config
            .distribution
            .as_ref()
            .ok_or_else(|| Error::missing_asset("App Store builds need distribution credentials"))?;
        if credentials.username.trim().is_empty() {
            return Err(Error::missing_asset("Distribution username is empty"));
        }
        if credentials.password.expose_secret().is_empty() {
            return Err(Error::missing_asset("Distribution password is empty"));
        }

        let signing = ctx
            .config
            .signing
            .as_ref()
            .ok_or_else(|| Error::missing_asset("App Store builds need a signing key"))?;
        if !signing.key_path.is_file() {
            return Err(Error::missing_asset(format!(
                "Signing key {} does not exist",
                signing.key_path.display()
            )));
        }
        Ok(TaskOutcome::Done)
    }
}

/// Copies the template bundle into a fresh `<work>/Payload/<Name>.app`.
pub struct PrepareBundleTask;

impl BuildTask for PrepareBundleTask {
    fn name(&self) -> &str {
        "prepare-bundle"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let template = &ctx.config.template_app;
        if !template.is_dir() {
            return Err(Error::missing_asset(format!(
                "Template app {} does not exist",
                template.display()
            )));
        }

        let bundle = &ctx.paths.app_bundle;
        if bundle.exists() {
            fs::remove_dir_all(bundle)?;
        }
        let copied = copy_tree(template, bundle, |_| false)?;
        fs::create_dir_all(&ctx.paths.deploy_dir)?;

        info!(template = %template.display(), bundle = %bundle.display(), files = copied, "bundle prepared");
        Ok(TaskOutcome::Done)
    }
}

/// Selects the provisioning profile and records the signing facts it
/// carries. Runs at most once per build.
pub struct ExtractProfileTask;

impl ExtractProfileTask {
    fn extract(ctx: &mut BuildContext) -> Result<()> {
        let scope = ctx
            .config
            .format
            .scope()
            .ok_or_else(|| Error::Config(format!("{} builds have no provisioning scope", ctx.config.format)))?;
        let (path, profile) = select_profile(&ctx.paths.assets_dir, scope)?;

        let app_id = split_application_identifier(
            profile.application_identifier(),
            &ctx.project.name,
            &ctx.config.bundle_id_prefix,
        )?;
        let certificate = profile.signing_certificate()?;

        fs::create_dir_all(&ctx.paths.app_bundle)?;
        fs::copy(&path, ctx.paths.app_bundle.join(EMBEDDED_PROFILE))?;

        info!(
            profile = %path.display(),
            team = %app_id.team_id,
            bundle_id = %app_id.bundle_id,
            certificate = %certificate.fingerprint,
            "provisioning profile selected"
        );

        let signing = &mut ctx.signing;
        signing.team_id = Some(app_id.team_id);
        signing.bundle_id = Some(app_id.bundle_id);
        signing.certificate_pem = Some(certificate.pem);
        signing.certificate_fingerprint = Some(certificate.fingerprint);
        signing.profile = Some(profile);
        signing.profile_path = Some(path);
        Ok(())
    }
}

impl BuildTask for ExtractProfileTask {
    fn name(&self) -> &str {
        "extract-profile"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        if ctx.signing.profile.is_some() {
            debug!("provisioning profile already extracted");
            return Ok(TaskOutcome::Done);
        }
        Self::extract(ctx)?;
        Ok(TaskOutcome::Done)
    }
}
