//! ExifTool backend wrapper
//!
//! All metadata operations shell out to the system `exiftool` binary (no
//! linking, one short-lived process per operation). The [`ExifTool::resolve`]
//! constructor doubles as the startup dependency guard: it must succeed
//! before any batch worker is spawned, so a missing backend fails the whole
//! run up front instead of deep inside a worker.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{CaptionError, Result};

/// Conventional install locations probed when `exiftool` is not on PATH.
const KNOWN_LOCATIONS: &[&str] = &[
    "/usr/local/bin/exiftool",
    "/usr/bin/exiftool",
    "/opt/homebrew/bin/exiftool",
];

const INSTALL_HINT: &str = "install ExifTool (Debian/Ubuntu: `sudo apt-get install \
libimage-exiftool-perl`, macOS: `brew install exiftool`) or pass --exiftool <path>";

/// Explicit backend configuration. Passed in by the caller; the backend never
/// reads or mutates process-wide environment variables itself.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Explicit path to the exiftool executable. When `None`, PATH and the
    /// conventional locations are probed.
    pub executable: Option<PathBuf>,
}

/// A resolved, verified exiftool backend.
#[derive(Debug, Clone)]
pub struct ExifTool {
    executable: PathBuf,
    version: String,
    /// Upper-cased file extensions exiftool can write to (`-listwf`).
    writable: HashSet<String>,
}

impl ExifTool {
    /// Dependency guard: locate and verify the exiftool backend.
    ///
    /// Probes the configured path first, then `exiftool` on PATH, then the
    /// conventional install locations. Any failure is
    /// [`CaptionError::DependencyMissing`] with a remediation hint.
    pub fn resolve(config: &BackendConfig) -> Result<Self> {
        if let Some(path) = &config.executable {
            return Self::with_executable(path);
        }

        let mut candidates: Vec<PathBuf> = vec![PathBuf::from("exiftool")];
        candidates.extend(KNOWN_LOCATIONS.iter().map(PathBuf::from));

        for candidate in &candidates {
            if let Ok(backend) = Self::with_executable(candidate) {
                return Ok(backend);
            }
        }

        Err(CaptionError::DependencyMissing {
            hint: INSTALL_HINT.to_string(),
        })
    }

    /// Build a backend from a specific executable path, verifying it answers
    /// `-ver` and loading its writable-format list.
    pub fn with_executable(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let version = probe_version(path).ok_or_else(|| CaptionError::DependencyMissing {
            hint: format!("`{}` did not respond to -ver; {INSTALL_HINT}", path.display()),
        })?;

        let output = Command::new(path)
            .arg("-listwf")
            .output()
            .map_err(|e| CaptionError::DependencyMissing {
                hint: format!("failed to run `{} -listwf`: {e}", path.display()),
            })?;
        let writable = parse_writable_formats(&String::from_utf8_lossy(&output.stdout));

        debug!(
            "exiftool {} at {} ({} writable formats)",
            version,
            path.display(),
            writable.len()
        );

        Ok(Self {
            executable: path.to_path_buf(),
            version,
            writable,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn writable_format_count(&self) -> usize {
        self.writable.len()
    }

    /// Whether exiftool can commit metadata into files with this extension.
    pub fn can_write_extension(&self, ext: &str) -> bool {
        self.writable.contains(&ext.to_ascii_uppercase())
    }

    /// Read the raw IPTC caption bytes. An absent tag yields an empty vec,
    /// not an error; an unreadable file is a backend error.
    pub fn read_caption(&self, path: &Path) -> Result<Vec<u8>> {
        self.run(&[
            OsStr::new("-b"),
            OsStr::new("-IPTC:Caption-Abstract"),
            path.as_os_str(),
        ])
    }

    /// Write the caption into the IPTC block at `dest`, carrying the
    /// unmodified image payload over from `src` when the paths differ.
    pub fn save_caption_as(&self, src: &Path, dest: &Path, caption: &str) -> Result<()> {
        if src != dest {
            std::fs::copy(src, dest)?;
        }

        let tag = format!("-IPTC:Caption-Abstract={caption}");
        self.run(&[
            OsStr::new("-overwrite_original"),
            OsStr::new("-charset"),
            OsStr::new("iptc=UTF8"),
            OsStr::new("-IPTC:CodedCharacterSet=UTF8"),
            OsStr::new(&tag),
            dest.as_os_str(),
        ])?;
        Ok(())
    }

    /// Open the XMP block of `path` for update. The file must exist; an
    /// absent XMP block is fine (the backend creates one on commit).
    pub fn open_xmp(&self, path: &Path) -> Result<XmpFile<'_>> {
        if !path.is_file() {
            return Err(CaptionError::Backend(format!(
                "cannot open XMP block: {} does not exist",
                path.display()
            )));
        }
        Ok(XmpFile {
            backend: self,
            path: path.to_path_buf(),
            pending: None,
            committed: false,
        })
    }

    fn run(&self, args: &[&OsStr]) -> Result<Vec<u8>> {
        let output = Command::new(&self.executable).args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptionError::Backend(stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }

    #[cfg(test)]
    pub(crate) fn fake(writable: &[&str]) -> Self {
        Self {
            executable: PathBuf::from("exiftool"),
            version: "0.0".to_string(),
            writable: writable.iter().map(|s| s.to_ascii_uppercase()).collect(),
        }
    }
}

/// Scoped handle on one file's XMP block.
///
/// Mutations are staged with [`XmpFile::set_description`] and only reach the
/// file on [`XmpFile::put`]. Dropping the handle releases it on every exit
/// path; an uncommitted change is discarded with a debug note.
pub struct XmpFile<'a> {
    backend: &'a ExifTool,
    path: PathBuf,
    pending: Option<String>,
    committed: bool,
}

impl XmpFile<'_> {
    /// Existing `dc:description` value, or `None` when the block or property
    /// is absent.
    pub fn description(&self) -> Result<Option<String>> {
        let bytes = self.backend.run(&[
            OsStr::new("-b"),
            OsStr::new("-XMP-dc:Description"),
            self.path.as_os_str(),
        ])?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Stage the first language-alternative item of `dc:description`.
    pub fn set_description(&mut self, text: &str) {
        self.pending = Some(text.to_string());
    }

    /// Whether the backend reports this file's format as writable.
    pub fn can_put(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.backend.can_write_extension(e))
            .unwrap_or(false)
    }

    /// Commit the staged description to the file.
    pub fn put(&mut self) -> Result<()> {
        let text = self.pending.take().ok_or_else(|| {
            CaptionError::Backend("no staged XMP change to commit".to_string())
        })?;
        let tag = format!("-XMP-dc:Description={text}");
        self.backend.run(&[
            OsStr::new("-overwrite_original"),
            OsStr::new(&tag),
            self.path.as_os_str(),
        ])?;
        self.committed = true;
        Ok(())
    }

    /// Explicit release. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for XmpFile<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(
                "closing XMP handle on {} with uncommitted description ({} chars)",
                self.path.display(),
                pending.len()
            );
        }
    }
}

fn probe_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("-ver").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Parse `exiftool -listwf` output: a header line followed by whitespace-
/// separated extensions.
fn parse_writable_formats(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip(1)
        .flat_map(str::split_whitespace)
        .map(|ext| ext.to_ascii_uppercase())
        .collect()
}
