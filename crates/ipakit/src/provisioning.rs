//! Provisioning profile extraction.
//!
//! A `.mobileprovision` file is a CMS signed-data envelope whose
//! encapsulated content is an XML property list. The plist carries the
//! developer certificates allowed to sign with the profile, the
//! entitlements (including `application-identifier`, of the form
//! `<team-id>.<bundle-id>`), and a `ProvisionedDevices` list for ad-hoc
//! profiles.
//!
//! The envelope's own signature is not verified against a trust root; the
//! build only needs the plaintext.

use crate::{Error, Result};
use cryptographic_message_syntax::SignedData;
use plist::{Dictionary, Value};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use x509_certificate::CapturedX509Certificate;

/// Bundle id prefix used when a profile's app id ends in a wildcard.
pub const DEFAULT_BUNDLE_ID_PREFIX: &str = "com.example";

/// Which devices a profile may install on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionScope {
    /// Restricted to an explicit device list.
    AdHoc,
    /// App Store distribution, no device list.
    Store,
}

impl std::fmt::Display for DistributionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionScope::AdHoc => f.write_str("ad-hoc"),
            DistributionScope::Store => f.write_str("app store"),
        }
    }
}

/// A parsed provisioning profile.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    document: Dictionary,
    entitlements: Dictionary,
    application_identifier: String,
    developer_certificates: Vec<Vec<u8>>,
}

impl ProvisioningProfile {
    /// Parses a signed-data container and its embedded plist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the container is not valid signed data,
    /// carries no content, or the content is not a profile dictionary with
    /// an `Entitlements` dictionary and an `application-identifier`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let signed = SignedData::parse_ber(data)
            .map_err(|e| Error::format(format!("Invalid provisioning profile container: {}", e)))?;

        let content = signed
            .signed_content()
            .ok_or_else(|| Error::format("Provisioning profile has no embedded content"))?;

        Self::from_plist(content)
    }

    /// Parses the plaintext plist of a profile.
    pub fn from_plist(content: &[u8]) -> Result<Self> {
        let value: Value = plist::from_bytes(content)
            .map_err(|e| Error::format(format!("Failed to parse profile plist: {}", e)))?;

        let document = value
            .into_dictionary()
            .ok_or_else(|| Error::format("Profile is not a dictionary"))?;

        let entitlements = document
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .ok_or_else(|| Error::format("No Entitlements in profile"))?;

        let application_identifier = entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or_else(|| Error::format("No application-identifier in profile entitlements"))?;

        let developer_certificates = document
            .get("DeveloperCertificates")
            .and_then(Value::as_array)
            .map(|certs| {
                certs
                    .iter()
                    .filter_map(Value::as_data)
                    .map(<[u8]>::to_vec)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            document,
            entitlements,
            application_identifier,
            developer_certificates,
        })
    }

    /// The full profile document.
    pub fn document(&self) -> &Dictionary {
        &self.document
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    pub fn application_identifier(&self) -> &str {
        &self.application_identifier
    }

    pub fn name(&self) -> Option<&str> {
        self.document.get("Name").and_then(Value::as_string)
    }

    /// Ad-hoc profiles enumerate the devices they provision.
    pub fn scope(&self) -> DistributionScope {
        if self.document.contains_key("ProvisionedDevices") {
            DistributionScope::AdHoc
        } else {
            DistributionScope::Store
        }
    }

    /// Extracts the first developer certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingAsset`] if the profile lists no certificate
    /// and [`Error::Format`] if the certificate does not parse.
    pub fn signing_certificate(&self) -> Result<SigningCertificate> {
        let der = self
            .developer_certificates
            .first()
            .ok_or_else(|| Error::missing_asset("Provisioning profile contains no developer certificate"))?;
        SigningCertificate::from_der(der)
    }
}

/// A developer certificate re-encoded for the signing session.
#[derive(Debug, Clone)]
pub struct SigningCertificate {
    pub der: Vec<u8>,
    pub pem: String,
    /// Uppercase hex SHA-1 of the DER encoding; `codesign` and the keychain
    /// identify identities by this value.
    pub fingerprint: String,
}

impl SigningCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let certificate = CapturedX509Certificate::from_der(der.to_vec())
            .map_err(|e| Error::format(format!("Invalid developer certificate: {}", e)))?;

        Ok(Self {
            der: der.to_vec(),
            pem: certificate.encode_pem(),
            fingerprint: sha1_fingerprint(der),
        })
    }
}

/// Uppercase hex SHA-1 digest.
pub fn sha1_fingerprint(data: &[u8]) -> String {
    Sha1::digest(data)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

/// Team and bundle identifiers derived from an `application-identifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentifier {
    pub team_id: String,
    pub bundle_id: String,
}

/// Splits `<team-id>.<bundle-id>` on the first `.`.
///
/// A bare `*` bundle id becomes `<prefix>.<project_name>`; a trailing
/// `.*` is replaced by `.<project_name>`.
///
/// ```
/// use ipakit::provisioning::split_application_identifier;
///
/// let id = split_application_identifier("ABCDE12345.*", "MyApp", "com.example").unwrap();
/// assert_eq!(id.team_id, "ABCDE12345");
/// assert_eq!(id.bundle_id, "com.example.MyApp");
/// ```
pub fn split_application_identifier(
    application_identifier: &str,
    project_name: &str,
    bundle_id_prefix: &str,
) -> Result<AppIdentifier> {
    let (team_id, bundle) = application_identifier
        .split_once('.')
        .filter(|(team, bundle)| !team.is_empty() && !bundle.is_empty())
        .ok_or_else(|| {
            Error::format(format!(
                "Malformed application-identifier: {}",
                application_identifier
            ))
        })?;

    let bundle_id = if bundle == "*" {
        format!("{}.{}", bundle_id_prefix, project_name)
    } else if let Some(stem) = bundle.strip_suffix(".*") {
        format!("{}.{}", stem, project_name)
    } else {
        bundle.to_string()
    };

    Ok(AppIdentifier {
        team_id: team_id.to_string(),
        bundle_id,
    })
}

/// Finds the single profile in `assets_dir` whose scope matches `scope`.
///
/// # Errors
///
/// Returns [`Error::MissingAsset`] when no profile matches or when more
/// than one does; the choice is never left to directory listing order.
/// Malformed profiles are reported as [`Error::Format`], even when another
/// file would have matched.
pub fn select_profile(
    assets_dir: impl AsRef<Path>,
    scope: DistributionScope,
) -> Result<(PathBuf, ProvisioningProfile)> {
    let assets_dir = assets_dir.as_ref();
    let mut candidates: Vec<PathBuf> = match fs::read_dir(assets_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|ext| ext == "mobileprovision")
                        .unwrap_or(false)
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    candidates.sort();

    let mut matches = Vec::new();
    for path in candidates {
        let profile = ProvisioningProfile::parse(&fs::read(&path)?)
            .map_err(|e| Error::format(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), scope = %profile.scope(), "found provisioning profile");
        if profile.scope() == scope {
            matches.push((path, profile));
        }
    }

    match matches.len() {
        0 => Err(Error::missing_asset(format!(
            "No {} provisioning profile found in {}",
            scope,
            assets_dir.display()
        ))),
        1 => {
            let (path, profile) = matches.remove(0);
            info!(path = %path.display(), "selected provisioning profile");
            Ok((path, profile))
        }
        n => Err(Error::missing_asset(format!(
            "Multiple matching {} provisioning profiles ({}) in {}; keep exactly one",
            scope,
            n,
            assets_dir.display()
        ))),
    }
}
