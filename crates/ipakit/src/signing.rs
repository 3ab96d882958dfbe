//! Keychain-scoped code signing.
//!
//! `codesign` only finds identities that live in a keychain on the user's
//! search list. A [`SigningSession`] therefore:
//!
//! 1. creates an ephemeral keychain named after the certificate
//!    fingerprint, with a random password, first discarding one that a
//!    killed build left at the same path;
//! 2. imports the private key and developer certificate as PKCS#12;
//! 3. adds the keychain to the search list through a
//!    [`CredentialRegistry`];
//! 4. signs every `.dylib`, then every `.framework`, then the app bundle;
//! 5. removes the keychain from the search list and deletes it, on every
//!    exit path.
//!
//! The search list is host-global, so steps 1-3 and 5 run under one
//! process-wide lock. Signing itself runs outside the lock.

use crate::context::BuildContext;
use crate::crypto::SigningIdentity;
use crate::pipeline::{TaskOutcome, TaskResult};
use crate::tools::{args, ToolRunner};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Serializes keychain creation, registration and teardown.
static KEYCHAIN_LOCK: Mutex<()> = Mutex::new(());

fn keychain_lock() -> MutexGuard<'static, ()> {
    KEYCHAIN_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serializes read-modify-write edits of the user search list. Always taken
/// after [`KEYCHAIN_LOCK`] when both are held.
static SEARCH_LIST_LOCK: Mutex<()> = Mutex::new(());

fn search_list_lock() -> MutexGuard<'static, ()> {
    SEARCH_LIST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keychain lock timeout set on creation, in seconds.
const KEYCHAIN_TIMEOUT_SECS: &str = "21600";

/// Partition list that lets Apple tools use imported keys without a prompt.
const KEY_PARTITIONS: &str = "apple-tool:,apple:,codesign:";

/// Metadata `codesign` keeps when re-signing embedded frameworks.
const FRAMEWORK_PRESERVED_METADATA: &str = "--preserve-metadata=identifier,entitlements,flags";

/// Host-global list of keychains searched for signing identities.
pub trait CredentialRegistry: Send + Sync {
    fn register(&self, keychain: &Path) -> Result<()>;

    fn unregister(&self, keychain: &Path) -> Result<()>;
}

/// The user keychain search list, edited with `security list-keychains`.
///
/// Each edit reads the list and writes it back whole. Edits from every
/// `SecurityRegistry` in the process are serialized internally, so
/// concurrent registrations never drop each other's entries.
pub struct SecurityRegistry {
    runner: Arc<dyn ToolRunner>,
    security: String,
}

impl SecurityRegistry {
    pub fn new(runner: Arc<dyn ToolRunner>, security: impl Into<String>) -> Self {
        Self {
            runner,
            security: security.into(),
        }
    }

    fn current(&self) -> Result<Vec<PathBuf>> {
        let output = self
            .runner
            .run_checked(&self.security, &args(["list-keychains", "-d", "user"]))?;
        Ok(parse_search_list(&output.stdout))
    }

    fn replace(&self, keychains: &[PathBuf]) -> Result<()> {
        let mut argv = args(["list-keychains", "-d", "user", "-s"]);
        argv.extend(keychains.iter().map(|p| p.clone().into_os_string()));
        self.runner.run_checked(&self.security, &argv)?;
        Ok(())
    }
}

impl CredentialRegistry for SecurityRegistry {
    fn register(&self, keychain: &Path) -> Result<()> {
        let _lock = search_list_lock();
        let mut list = self.current()?;
        if !list.iter().any(|p| p == keychain) {
            list.push(keychain.to_path_buf());
        }
        self.replace(&list)
    }

    fn unregister(&self, keychain: &Path) -> Result<()> {
        let _lock = search_list_lock();
        let mut list = self.current()?;
        list.retain(|p| p != keychain);
        self.replace(&list)
    }
}

/// `security list-keychains` prints one quoted path per line.
fn parse_search_list(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('"'))
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Registry kept in memory, for tests and hosts without a search list.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: Vec<PathBuf>,
    registrations: usize,
    unregistrations: usize,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keychains currently on the list.
    pub fn active(&self) -> Vec<PathBuf> {
        self.lock().active.clone()
    }

    /// `(register calls, unregister calls)` so far.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.registrations, state.unregistrations)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialRegistry for InMemoryRegistry {
    fn register(&self, keychain: &Path) -> Result<()> {
        let mut state = self.lock();
        state.registrations += 1;
        state.active.push(keychain.to_path_buf());
        Ok(())
    }

    fn unregister(&self, keychain: &Path) -> Result<()> {
        let mut state = self.lock();
        state.unregistrations += 1;
        state.active.retain(|p| p != keychain);
        Ok(())
    }
}

/// Runs `body` with a resource that is released on every exit path.
///
/// `release` runs after `body` returns an error, after it succeeds, and
/// during unwinding if it panics. A failing release is logged and never
/// replaces `body`'s result. If `acquire` fails nothing is released; it
/// must clean up its own partial work.
pub fn with_scoped_resource<R, T>(
    acquire: impl FnOnce() -> Result<R>,
    release: impl FnOnce(&R) -> Result<()>,
    body: impl FnOnce(&R) -> Result<T>,
) -> Result<T> {
    let resource = acquire()?;
    let guard = ReleaseGuard {
        resource: &resource,
        release: Some(release),
    };
    let result = body(&resource);
    drop(guard);
    result
}

struct ReleaseGuard<'a, R, F: FnOnce(&R) -> Result<()>> {
    resource: &'a R,
    release: Option<F>,
}

impl<R, F: FnOnce(&R) -> Result<()>> Drop for ReleaseGuard<'_, R, F> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(e) = release(self.resource) {
                warn!("Failed to release scoped resource: {}", e);
            }
        }
    }
}

/// An ephemeral keychain on disk.
#[derive(Debug)]
pub struct Keychain {
    path: PathBuf,
    scratch_dir: PathBuf,
    password: SecretString,
    registered: bool,
}

impl Keychain {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Signs the app bundle in a context with an ephemeral keychain.
pub struct SigningSession {
    runner: Arc<dyn ToolRunner>,
    registry: Arc<dyn CredentialRegistry>,
}

impl SigningSession {
    pub fn new(runner: Arc<dyn ToolRunner>, registry: Arc<dyn CredentialRegistry>) -> Self {
        Self { runner, registry }
    }

    /// Runs `body` while the build's signing identity is installed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingAsset`] before touching any tool if the
    /// certificate, fingerprint or private key is unavailable. Tool failures
    /// during setup and `body`'s own error are returned as-is; teardown
    /// failures are only logged.
    pub fn with_signing_identity(
        &self,
        ctx: &BuildContext,
        body: impl FnOnce(&Keychain) -> TaskResult,
    ) -> TaskResult {
        let fingerprint = ctx
            .signing
            .certificate_fingerprint
            .clone()
            .ok_or_else(|| Error::missing_asset("No signing certificate fingerprint"))?;
        let identity = self.load_identity(ctx)?;
        let scratch_dir = ctx.paths.work_dir.join("keychains");

        with_scoped_resource(
            || {
                let _lock = keychain_lock();
                self.acquire(ctx, &identity, &fingerprint, &scratch_dir)
            },
            |keychain| {
                let _lock = keychain_lock();
                self.release(ctx, keychain)
            },
            body,
        )
    }

    fn load_identity(&self, ctx: &BuildContext) -> Result<SigningIdentity> {
        let cert_pem = ctx
            .signing
            .certificate_pem
            .as_deref()
            .ok_or_else(|| Error::missing_asset("No signing certificate"))?;
        let signing = ctx
            .config
            .signing
            .as_ref()
            .ok_or_else(|| Error::missing_asset("No signing key configured"))?;
        let key = fs::read(&signing.key_path).map_err(|e| {
            Error::missing_asset(format!(
                "Signing key {}: {}",
                signing.key_path.display(),
                e
            ))
        })?;
        SigningIdentity::from_pem(cert_pem.as_bytes(), &key, signing.key_password.as_ref())
    }

    fn security(&self, ctx: &BuildContext, argv: &[std::ffi::OsString]) -> Result<()> {
        self.runner.run_checked(&ctx.config.tools.security, argv)?;
        Ok(())
    }

    fn acquire(
        &self,
        ctx: &BuildContext,
        identity: &SigningIdentity,
        fingerprint: &str,
        scratch_dir: &Path,
    ) -> Result<Keychain> {
        fs::create_dir_all(scratch_dir)?;
        let path = scratch_dir.join(format!("{}.keychain-db", fingerprint));
        if path.exists() {
            self.discard_stale(ctx, &path)?;
        }
        let password = SecretString::new(uuid::Uuid::new_v4().as_hyphenated().to_string());

        info!(keychain = %path.display(), "creating signing keychain");
        self.security(
            ctx,
            &args([
                "create-keychain".into(),
                "-p".into(),
                password.expose_secret().into(),
                path.clone().into_os_string(),
            ]),
        )?;

        let mut keychain = Keychain {
            path,
            scratch_dir: scratch_dir.to_path_buf(),
            password,
            registered: false,
        };

        if let Err(e) = self.populate(ctx, identity, &mut keychain) {
            if let Err(cleanup) = self.release(ctx, &keychain) {
                warn!("Failed to remove partially created keychain: {}", cleanup);
            }
            return Err(e);
        }
        Ok(keychain)
    }

    /// Removes a keychain left behind by a build that never reached
    /// teardown. `create-keychain` refuses to overwrite it.
    fn discard_stale(&self, ctx: &BuildContext, path: &Path) -> Result<()> {
        warn!(keychain = %path.display(), "removing stale signing keychain");
        if let Err(e) = self.registry.unregister(path) {
            warn!(keychain = %path.display(), "Failed to unregister stale keychain: {}", e);
        }
        if let Err(e) = self.security(
            ctx,
            &args(["delete-keychain".into(), path.as_os_str().to_os_string()]),
        ) {
            warn!(keychain = %path.display(), "Failed to delete stale keychain: {}", e);
        }
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn populate(
        &self,
        ctx: &BuildContext,
        identity: &SigningIdentity,
        keychain: &mut Keychain,
    ) -> Result<()> {
        let path = keychain.path.clone().into_os_string();
        let password = keychain.password.expose_secret().clone();

        self.security(
            ctx,
            &args([
                "set-keychain-settings".into(),
                "-lut".into(),
                KEYCHAIN_TIMEOUT_SECS.into(),
                path.clone(),
            ]),
        )?;
        self.security(
            ctx,
            &args([
                "unlock-keychain".into(),
                "-p".into(),
                password.clone().into(),
                path.clone(),
            ]),
        )?;

        let p12_password = SecretString::new(uuid::Uuid::new_v4().as_hyphenated().to_string());
        let p12_path = keychain.scratch_dir.join("identity.p12");
        fs::write(&p12_path, identity.to_pkcs12(&ctx.project.name, &p12_password)?)?;

        let imported = self.security(
            ctx,
            &args([
                "import".into(),
                p12_path.clone().into_os_string(),
                "-k".into(),
                path.clone(),
                "-t".into(),
                "agg".into(),
                "-f".into(),
                "pkcs12".into(),
                "-P".into(),
                p12_password.expose_secret().into(),
                "-T".into(),
                ctx.config.tools.codesign.clone().into(),
            ]),
        );
        if let Err(e) = fs::remove_file(&p12_path) {
            warn!("Failed to remove {}: {}", p12_path.display(), e);
        }
        imported?;

        self.security(
            ctx,
            &args([
                "set-key-partition-list".into(),
                "-S".into(),
                KEY_PARTITIONS.into(),
                "-s".into(),
                "-k".into(),
                password.into(),
                path,
            ]),
        )?;

        self.registry.register(&keychain.path)?;
        keychain.registered = true;
        debug!(keychain = %keychain.path.display(), "keychain registered");
        Ok(())
    }

    fn release(&self, ctx: &BuildContext, keychain: &Keychain) -> Result<()> {
        let mut first_error = None;

        if keychain.registered {
            if let Err(e) = self.registry.unregister(&keychain.path) {
                warn!(keychain = %keychain.path.display(), "Failed to unregister keychain: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.security(
            ctx,
            &args(["delete-keychain".into(), keychain.path.clone().into_os_string()]),
        ) {
            warn!(keychain = %keychain.path.display(), "Failed to delete keychain: {}", e);
            first_error.get_or_insert(e);
        }

        if keychain.path.exists() {
            if let Err(e) = fs::remove_file(&keychain.path) {
                warn!("Failed to remove {}: {}", keychain.path.display(), e);
            }
        }

        info!(keychain = %keychain.path.display(), "signing keychain removed");
        first_error.map_or(Ok(()), Err)
    }

    /// Signs shared libraries, then frameworks, then the bundle.
    ///
    /// Each `codesign` run must exit zero before the next starts; the
    /// bundle signature seals hashes of everything signed before it.
    pub fn sign_bundle(&self, ctx: &BuildContext) -> TaskResult {
        let fingerprint = ctx
            .signing
            .certificate_fingerprint
            .as_deref()
            .ok_or_else(|| Error::missing_asset("No signing certificate fingerprint"))?;
        let bundle = &ctx.paths.app_bundle;

        for dylib in find_dylibs(bundle) {
            self.codesign(ctx, fingerprint, &[], &dylib)?;
        }

        for framework in find_frameworks(&ctx.paths.frameworks_dir)? {
            self.codesign(ctx, fingerprint, &[FRAMEWORK_PRESERVED_METADATA.to_string()], &framework)?;
        }

        let entitlements = ctx.paths.entitlements_file();
        let extra = if entitlements.exists() {
            vec!["--entitlements".to_string(), entitlements.display().to_string()]
        } else {
            warn!("No entitlements file; signing bundle without entitlements");
            Vec::new()
        };
        self.codesign(ctx, fingerprint, &extra, bundle)?;

        info!(bundle = %bundle.display(), "bundle signed");
        Ok(TaskOutcome::Done)
    }

    fn codesign(&self, ctx: &BuildContext, fingerprint: &str, extra: &[String], path: &Path) -> Result<()> {
        let mut argv = args(["--force", "--sign", fingerprint, "--timestamp=none"]);
        argv.extend(extra.iter().map(Into::into));
        argv.push(path.as_os_str().to_os_string());

        debug!(path = %path.display(), "codesign");
        self.runner.run_checked(&ctx.config.tools.codesign, &argv)?;
        Ok(())
    }
}

/// Every `.dylib` in the bundle, outside `_CodeSignature` directories.
fn find_dylibs(bundle: &Path) -> Vec<PathBuf> {
    WalkDir::new(bundle)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.is_file()
                && p.extension().map(|ext| ext == "dylib").unwrap_or(false)
                && !p.components().any(|c| c.as_os_str() == "_CodeSignature")
        })
        .collect()
}

/// Immediate `.framework` children of the frameworks directory.
fn find_frameworks(frameworks_dir: &Path) -> Result<Vec<PathBuf>> {
    if !frameworks_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut frameworks: Vec<PathBuf> = fs::read_dir(frameworks_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().map(|ext| ext == "framework").unwrap_or(false))
        .collect();
    frameworks.sort();
    Ok(frameworks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, OutputFormat, SigningConfig};
    use crate::context::{BuildPaths, ProjectDescriptor};
    use crate::provisioning::SigningCertificate;
    use crate::test_support::{failed, ok, test_identity, ScriptedRunner};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Fault {
        None,
        Import,
        Register,
        Codesign,
        BodyError,
        BodyPanic,
    }

    struct FailingRegistry;

    impl CredentialRegistry for FailingRegistry {
        fn register(&self, _: &Path) -> Result<()> {
            Err(Error::external_tool("security", "list-keychains: permission denied"))
        }

        fn unregister(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Simulates `security` on disk and fails the requested step.
    fn host_tools(fault: Fault) -> ScriptedRunner {
        ScriptedRunner::new(move |program, argv| {
            let sub = argv.first().map(String::as_str).unwrap_or("");
            if program.ends_with("security") {
                match sub {
                    "create-keychain" => {
                        let path = Path::new(argv.last().unwrap());
                        if path.exists() {
                            return failed(
                                "security: SecKeychainCreate: A keychain with the same name already exists.",
                            );
                        }
                        fs::write(path, b"keychain").unwrap();
                    }
                    "delete-keychain" => {
                        let _ = fs::remove_file(argv.last().unwrap());
                    }
                    "import" if fault == Fault::Import => {
                        return failed("security: SecKeychainItemImport: MAC verification failed");
                    }
                    _ => {}
                }
                return ok("");
            }
            if program.ends_with("codesign") && fault == Fault::Codesign {
                return failed("code object is not signed at all");
            }
            ok("")
        })
    }

    fn signed_context(temp_dir: &Path) -> BuildContext {
        let (key, cert) = test_identity();
        let key_path = temp_dir.join("key.pem");
        fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let mut config = BuildConfig::new(OutputFormat::AdHoc, temp_dir.join("Runtime.app"));
        config.signing = Some(SigningConfig {
            key_path,
            key_password: None,
        });

        let paths = BuildPaths::new(temp_dir.join("project"), temp_dir.join("work"), temp_dir.join("deploy"), "MyApp");
        fs::create_dir_all(paths.frameworks_dir.join("Runtime.framework")).unwrap();
        fs::create_dir_all(paths.frameworks_dir.join("Alpha.framework")).unwrap();
        fs::write(paths.frameworks_dir.join("libswiftCore.dylib"), b"dylib").unwrap();
        fs::write(paths.app_bundle.join("MyApp"), b"exe").unwrap();
        fs::write(paths.entitlements_file(), b"<plist/>").unwrap();

        let mut ctx = BuildContext::new(ProjectDescriptor::new("MyApp"), paths, config);
        let signing = SigningCertificate::from_der(&cert.to_der().unwrap()).unwrap();
        ctx.signing.certificate_pem = Some(signing.pem);
        ctx.signing.certificate_fingerprint = Some(signing.fingerprint);
        ctx
    }

    fn run_session(
        session: &SigningSession,
        ctx: &BuildContext,
        fault: Fault,
    ) -> std::thread::Result<TaskResult> {
        catch_unwind(AssertUnwindSafe(|| {
            session.with_signing_identity(ctx, |_| match fault {
                Fault::BodyError => Err(Error::missing_asset("body failed")),
                Fault::BodyPanic => panic!("body panicked"),
                _ => session.sign_bundle(ctx),
            })
        }))
    }

    #[test]
    fn test_successful_session_signs_in_dependency_order() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = signed_context(temp_dir.path());
        let runner = Arc::new(host_tools(Fault::None));
        let registry = Arc::new(InMemoryRegistry::new());
        let session = SigningSession::new(runner.clone(), registry.clone());

        let outcome = run_session(&session, &ctx, Fault::None).unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Done);

        let signed: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|(p, _)| p.ends_with("codesign"))
            .map(|(_, a)| a.last().unwrap().clone())
            .collect();
        assert_eq!(signed.len(), 4);
        assert!(signed[0].ends_with("libswiftCore.dylib"));
        assert!(signed[1].ends_with("Alpha.framework"));
        assert!(signed[2].ends_with("Runtime.framework"));
        assert!(signed[3].ends_with("MyApp.app"));

        let fingerprint = ctx.signing.certificate_fingerprint.clone().unwrap();
        let bundle_call = runner.calls().into_iter().rev().find(|(p, _)| p.ends_with("codesign")).unwrap().1;
        assert_eq!(&bundle_call[..4], &["--force", "--sign", fingerprint.as_str(), "--timestamp=none"]);
        assert_eq!(bundle_call[4], "--entitlements");

        let import = &runner.calls_to("/usr/bin/security", "import")[0];
        assert_eq!(&import[2..8], &["-k", import[3].as_str(), "-t", "agg", "-f", "pkcs12"]);
        assert_eq!(&import[10..], &["-T", "/usr/bin/codesign"]);

        let keychain = ctx.paths.work_dir.join(format!("keychains/{}.keychain-db", fingerprint));
        assert!(!keychain.exists());
        assert!(registry.active().is_empty());
        assert!(!ctx.paths.work_dir.join("keychains/identity.p12").exists());
    }

    #[test]
    fn test_missing_certificate_runs_no_tool() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = signed_context(temp_dir.path());
        ctx.signing.certificate_pem = None;
        let runner = Arc::new(host_tools(Fault::None));
        let session = SigningSession::new(runner.clone(), Arc::new(InMemoryRegistry::new()));

        let err = session.with_signing_identity(&ctx, |_| Ok(TaskOutcome::Done)).unwrap_err();
        assert!(matches!(err, Error::MissingAsset(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_codesign_failure_is_surfaced_verbatim() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = signed_context(temp_dir.path());
        let runner = Arc::new(host_tools(Fault::Codesign));
        let session = SigningSession::new(runner.clone(), Arc::new(InMemoryRegistry::new()));

        let err = run_session(&session, &ctx, Fault::Codesign).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "/usr/bin/codesign failed: code object is not signed at all");
        assert_eq!(runner.calls_to("/usr/bin/security", "delete-keychain").len(), 1);
    }

    #[test]
    fn test_registration_failure_still_deletes_keychain() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = signed_context(temp_dir.path());
        let runner = Arc::new(host_tools(Fault::None));
        let session = SigningSession::new(runner.clone(), Arc::new(FailingRegistry));

        let err = run_session(&session, &ctx, Fault::None).unwrap().unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
        assert_eq!(runner.calls_to("/usr/bin/security", "create-keychain").len(), 1);
        assert_eq!(runner.calls_to("/usr/bin/security", "delete-keychain").len(), 1);
        assert!(runner.calls().iter().all(|(p, _)| !p.ends_with("codesign")));
    }

    #[test]
    fn test_teardown_matches_creation_under_random_faults() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = signed_context(temp_dir.path());
        let mut rng = StdRng::seed_from_u64(0x1babe);
        let faults = [
            Fault::None,
            Fault::Import,
            Fault::Register,
            Fault::Codesign,
            Fault::BodyError,
            Fault::BodyPanic,
        ];

        for _ in 0..100 {
            let fault = faults[rng.gen_range(0..faults.len())];
            let runner = Arc::new(host_tools(fault));
            let registry = Arc::new(InMemoryRegistry::new());
            let registry_dyn: Arc<dyn CredentialRegistry> = if fault == Fault::Register {
                Arc::new(FailingRegistry)
            } else {
                registry.clone()
            };
            let session = SigningSession::new(runner.clone(), registry_dyn);

            let result = run_session(&session, &ctx, fault);
            match fault {
                Fault::None => assert!(matches!(result, Ok(Ok(_)))),
                Fault::BodyPanic => assert!(result.is_err()),
                _ => assert!(matches!(result, Ok(Err(_)))),
            }

            let created = runner.calls_to("/usr/bin/security", "create-keychain").len();
            let deleted = runner.calls_to("/usr/bin/security", "delete-keychain").len();
            assert_eq!(created, 1, "{:?}", fault);
            assert_eq!(created, deleted, "{:?}", fault);

            let (registered, unregistered) = registry.counts();
            assert_eq!(registered, unregistered, "{:?}", fault);
            assert!(registry.active().is_empty());
            assert!(!temp_dir
                .path()
                .join("work/keychains")
                .read_dir()
                .unwrap()
                .any(|e| e.unwrap().path().extension().map(|x| x == "keychain-db").unwrap_or(false)));
        }
    }

    #[test]
    fn test_stale_keychain_from_killed_build_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = signed_context(temp_dir.path());
        let fingerprint = ctx.signing.certificate_fingerprint.clone().unwrap();
        let stale = ctx.paths.work_dir.join(format!("keychains/{}.keychain-db", fingerprint));
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"left over").unwrap();

        let runner = Arc::new(host_tools(Fault::None));
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(&stale).unwrap();
        let session = SigningSession::new(runner.clone(), registry.clone());

        let outcome = run_session(&session, &ctx, Fault::None).unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Done);

        let security: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|(p, _)| p.ends_with("security"))
            .map(|(_, a)| a[0].clone())
            .collect();
        assert_eq!(security[0], "delete-keychain");
        assert_eq!(security[1], "create-keychain");
        assert_eq!(runner.calls_to("/usr/bin/security", "delete-keychain").len(), 2);
        assert!(!stale.exists());
        assert!(registry.active().is_empty());
        assert_eq!(registry.counts(), (2, 2));
    }

    /// Fails the test if two callers are ever inside it at once.
    struct ExclusiveRegistry {
        busy: AtomicBool,
        inner: InMemoryRegistry,
    }

    impl ExclusiveRegistry {
        fn enter(&self) {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "registry entered concurrently");
            thread::sleep(Duration::from_millis(5));
        }

        fn leave(&self) {
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    impl CredentialRegistry for ExclusiveRegistry {
        fn register(&self, keychain: &Path) -> Result<()> {
            self.enter();
            let result = self.inner.register(keychain);
            self.leave();
            result
        }

        fn unregister(&self, keychain: &Path) -> Result<()> {
            self.enter();
            let result = self.inner.unregister(keychain);
            self.leave();
            result
        }
    }

    #[test]
    fn test_concurrent_sessions_serialize_keychain_setup_and_teardown() {
        let registry = Arc::new(ExclusiveRegistry {
            busy: AtomicBool::new(false),
            inner: InMemoryRegistry::new(),
        });
        let runner = Arc::new(host_tools(Fault::None));

        let temp_dirs: Vec<TempDir> = (0..4).map(|_| TempDir::new().unwrap()).collect();
        let contexts: Vec<BuildContext> = temp_dirs.iter().map(|d| signed_context(d.path())).collect();

        thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .iter()
                .map(|ctx| {
                    let session = SigningSession::new(runner.clone(), registry.clone());
                    scope.spawn(move || {
                        session
                            .with_signing_identity(ctx, |_| {
                                thread::sleep(Duration::from_millis(5));
                                session.sign_bundle(ctx)
                            })
                            .unwrap()
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), TaskOutcome::Done);
            }
        });

        assert!(registry.inner.active().is_empty());
        assert_eq!(registry.inner.counts(), (4, 4));
        assert_eq!(runner.calls_to("/usr/bin/security", "create-keychain").len(), 4);
        assert_eq!(runner.calls_to("/usr/bin/security", "delete-keychain").len(), 4);
    }

    #[test]
    fn test_security_registry_concurrent_edits_keep_every_entry() {
        let search_list = Arc::new(Mutex::new(vec!["/Library/Keychains/System.keychain".to_string()]));
        let list = search_list.clone();
        let runner = Arc::new(ScriptedRunner::new(move |_, argv| {
            if argv.len() == 3 {
                let current = list.lock().unwrap().clone();
                thread::sleep(Duration::from_millis(5));
                ok(&current.iter().map(|p| format!("    \"{}\"\n", p)).collect::<String>())
            } else {
                *list.lock().unwrap() = argv[4..].to_vec();
                ok("")
            }
        }));

        thread::scope(|scope| {
            for i in 0..4 {
                let registry = SecurityRegistry::new(runner.clone(), "security");
                scope.spawn(move || {
                    registry
                        .register(Path::new(&format!("/tmp/kc/{}.keychain-db", i)))
                        .unwrap();
                });
            }
        });

        let list = search_list.lock().unwrap().clone();
        assert_eq!(list.len(), 5);
        for i in 0..4 {
            assert!(list.contains(&format!("/tmp/kc/{}.keychain-db", i)));
        }
    }

    #[test]
    fn test_scoped_resource_release_error_does_not_mask_result() {
        let result: Result<u32> = with_scoped_resource(
            || Ok(7),
            |_| Err(Error::external_tool("security", "delete failed")),
            |r| Ok(*r * 6),
        );
        assert_eq!(result.unwrap(), 42);

        let result: Result<u32> = with_scoped_resource(
            || Ok(7),
            |_| Err(Error::external_tool("security", "delete failed")),
            |_| Err(Error::missing_asset("body")),
        );
        assert!(matches!(result.unwrap_err(), Error::MissingAsset(_)));
    }

    #[test]
    fn test_scoped_resource_not_released_when_acquire_fails() {
        let released = std::cell::Cell::new(false);
        let result: Result<()> = with_scoped_resource(
            || Err::<(), _>(Error::missing_asset("nope")),
            |_| {
                released.set(true);
                Ok(())
            },
            |_| Ok(()),
        );
        assert!(result.is_err());
        assert!(!released.get());
    }

    #[test]
    fn test_security_registry_edits_search_list() {
        let runner = Arc::new(ScriptedRunner::new(|_, argv| {
            if argv.len() == 3 && argv[0] == "list-keychains" {
                ok("    \"/Users/ci/Library/Keychains/login.keychain-db\"\n    \"/Library/Keychains/System.keychain\"\n")
            } else {
                ok("")
            }
        }));
        let registry = SecurityRegistry::new(runner.clone(), "security");
        let keychain = Path::new("/tmp/work/keychains/ABC.keychain-db");

        registry.register(keychain).unwrap();
        let set = runner.calls()[1].1.clone();
        assert_eq!(
            set,
            vec![
                "list-keychains",
                "-d",
                "user",
                "-s",
                "/Users/ci/Library/Keychains/login.keychain-db",
                "/Library/Keychains/System.keychain",
                "/tmp/work/keychains/ABC.keychain-db",
            ]
        );

        registry.unregister(keychain).unwrap();
        let set = runner.calls()[3].1.clone();
        assert_eq!(set.len(), 6);
        assert!(!set.iter().any(|a| a.contains("ABC")));
    }
}
