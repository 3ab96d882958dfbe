//! Zip archive construction.
//!
//! Builds the IPA (`Payload/<App>.app/...`) and the plain source archive
//! from directory trees. Entries are stored with paths relative to a
//! caller-supplied base directory, and every directory entry is written
//! before the entries of its children.
//!
//! # Examples
//!
//! ```no_run
//! use ipakit::archive::{create_ipa, CompressionLevel};
//!
//! create_ipa("work/Payload/MyApp.app", "deploy/MyApp.ipa", CompressionLevel::DEFAULT)?;
//! # Ok::<(), ipakit::Error>(())
//! ```

use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// ZIP compression level.
///
/// ```
/// use ipakit::archive::CompressionLevel;
///
/// assert_eq!(CompressionLevel::new(15).level(), 9);
/// assert_eq!(CompressionLevel::default().level(), 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// No compression (level 0), entries are stored.
    pub const NONE: CompressionLevel = CompressionLevel(0);

    /// Default compression (level 6).
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    /// Maximum compression (level 9).
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Creates a compression level from 0-9; larger values are clamped.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn options(&self) -> SimpleFileOptions {
        if self.0 == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.0 as i64))
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

type ExcludeFn = dyn Fn(&Path) -> bool + Send + Sync;

/// Writes directory trees into a zip archive.
///
/// The exclusion predicate is called with each entry's path relative to the
/// base directory. An excluded directory is skipped together with its whole
/// subtree.
pub struct ArchiveWriter {
    compression: CompressionLevel,
    exclude: Box<ExcludeFn>,
}

impl ArchiveWriter {
    pub fn new(compression: CompressionLevel) -> Self {
        Self {
            compression,
            exclude: Box::new(|_| false),
        }
    }

    /// Sets the exclusion predicate.
    pub fn exclude(mut self, predicate: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.exclude = Box::new(predicate);
        self
    }

    /// Zips each of `sources` (files or directories under `base`) into
    /// `output` and returns the output path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a source lies outside `base` or cannot be
    /// read, and [`Error::Zip`] if the archive cannot be written.
    pub fn write_zip<P: AsRef<Path>>(
        &self,
        base: impl AsRef<Path>,
        sources: &[P],
        output: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let base = base.as_ref();
        let output = output.as_ref();

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(output)?;
        let mut zip = ZipWriter::new(file);
        let options = self.compression.options();
        let mut entries = 0usize;

        for source in sources {
            let source = source.as_ref();
            if !source.exists() {
                debug!(path = %source.display(), "archive source missing, skipping");
                continue;
            }

            let walker = WalkDir::new(source)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| match e.path().strip_prefix(base) {
                    Ok(rel) => rel.as_os_str().is_empty() || !(self.exclude)(rel),
                    Err(_) => true,
                });

            for entry in walker {
                let entry = entry.map_err(|e| {
                    Error::Io(io::Error::other(format!("Failed to walk directory: {}", e)))
                })?;
                let path = entry.path();
                let relative = path.strip_prefix(base).map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not under {}", path.display(), base.display()),
                    ))
                })?;
                if relative.as_os_str().is_empty() {
                    continue;
                }

                let archive_path = zip_path(relative);
                let metadata = fs::symlink_metadata(path)?;

                if metadata.is_dir() {
                    zip.add_directory(format!("{}/", archive_path), options)?;
                } else if metadata.file_type().is_symlink() {
                    let target = fs::read_link(path)?;
                    zip.add_symlink(archive_path.as_str(), target.to_string_lossy(), options)?;
                } else {
                    #[cfg(unix)]
                    let options = {
                        use std::os::unix::fs::PermissionsExt;
                        options.unix_permissions(metadata.permissions().mode())
                    };

                    zip.start_file(archive_path.as_str(), options)?;
                    zip.write_all(&fs::read(path)?)?;
                }
                entries += 1;
            }
        }

        zip.finish()?;
        debug!(output = %output.display(), entries, "wrote archive");
        Ok(output.to_path_buf())
    }
}

/// Zip entry names always use `/`.
fn zip_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Creates an IPA from an app bundle that already sits in a `Payload/`
/// directory (`<work>/Payload/<App>.app`).
///
/// # Errors
///
/// Returns [`Error::Io`] if the bundle does not exist, is not a directory,
/// or is not inside a directory named `Payload`.
pub fn create_ipa(
    app_bundle_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    compression_level: CompressionLevel,
) -> Result<PathBuf> {
    let app_bundle_path = app_bundle_path.as_ref();

    if !app_bundle_path.is_dir() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("App bundle not found: {}", app_bundle_path.display()),
        )));
    }

    let payload = app_bundle_path
        .parent()
        .filter(|p| p.file_name().map(|n| n == "Payload").unwrap_or(false))
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not inside Payload/", app_bundle_path.display()),
            ))
        })?;
    let base = payload.parent().unwrap_or(Path::new(""));

    ArchiveWriter::new(compression_level).write_zip(base, &[payload], output_path)
}

/// Exclusion rules for the redistributable source archive: provisioning
/// profiles, block files and extension directories stay out.
pub fn is_excluded_from_source_archive(relative: &Path) -> bool {
    if relative
        .extension()
        .map(|ext| ext == "mobileprovision" || ext == "bky")
        .unwrap_or(false)
    {
        return true;
    }
    relative.starts_with("assets/external_comps")
}
