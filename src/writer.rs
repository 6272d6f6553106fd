//! Per-file metadata rewrite
//!
//! One read-modify-write cycle per image: read the legacy IPTC caption,
//! transcode it, persist the IPTC change to the destination, then update the
//! XMP description in the same destination file. Nothing is cached across
//! files.

use std::path::Path;
use tracing::{info, warn};

use crate::error::{CaptionError, Result};
use crate::exiftool::ExifTool;
use crate::transcode::transcode;

/// Outcome of processing a single image. Serialized across the worker
/// process boundary as part of a result entry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Caption rewritten. `xmp_written` is false when the backend rejected
    /// the XMP commit for this format (the IPTC write still landed); that
    /// partial effect is surfaced here rather than silently swallowed.
    Success { xmp_written: bool },
    Failure { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

pub struct MetadataWriter {
    backend: ExifTool,
}

impl MetadataWriter {
    pub fn new(backend: ExifTool) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &ExifTool {
        &self.backend
    }

    /// Rewrite one image's caption metadata from `src` into `dest`.
    ///
    /// Never panics and never aborts a batch: every error is reduced to
    /// [`Outcome::Failure`] with a reason string.
    pub fn process_image(&self, src: &Path, dest: &Path) -> Outcome {
        match self.try_process(src, dest) {
            Ok(xmp_written) => Outcome::Success { xmp_written },
            Err(e) => Outcome::Failure {
                reason: e.to_string(),
            },
        }
    }

    fn try_process(&self, src: &Path, dest: &Path) -> Result<bool> {
        let raw = self.backend.read_caption(src)?;
        let description = decode_description(&raw);

        if description.trim().is_empty() {
            return Err(CaptionError::EmptyDescription);
        }

        let clean = transcode(&description);
        self.backend.save_caption_as(src, dest, &clean)?;

        let mut xmp = self.backend.open_xmp(dest)?;
        xmp.set_description(&clean);

        if !xmp.can_put() {
            warn!(
                "XMP not writable for {}; IPTC caption updated, XMP skipped",
                dest.display()
            );
            xmp.close();
            return Ok(false);
        }

        xmp.put()?;
        xmp.close();
        info!("XMP description saved to {}", dest.display());
        Ok(true)
    }
}

/// Invalid byte sequences become replacement characters; a mangled caption
/// is still a caption, never a hard failure.
fn decode_description(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
