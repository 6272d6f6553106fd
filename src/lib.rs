//! recaption - batch IPTC/XMP caption rewriter
//!
//! Reads the legacy pipe-delimited `IPTC:Caption-Abstract` field from archive
//! images, reformats it into clean comma-separated text, and writes it back
//! into both the IPTC and XMP blocks of the output files. All metadata
//! operations shell out to the system `exiftool` binary (no linking); each
//! batch runs in an isolated worker process.

pub mod batch;
pub mod error;
pub mod exiftool;
pub mod rally;
pub mod transcode;
pub mod writer;

pub use batch::{
    scan_images, CancelToken, Orchestrator, ProgressSink, ResultEntry, RunConfig, RunSummary,
    WorkerJob, WorkerReport, DEFAULT_OUTPUT_SUBFOLDER, IMAGE_EXTENSIONS,
};
pub use error::{CaptionError, Result};
pub use exiftool::{BackendConfig, ExifTool, XmpFile};
pub use transcode::transcode;
pub use writer::{MetadataWriter, Outcome};
