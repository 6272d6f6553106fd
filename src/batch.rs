//! Batch orchestration
//!
//! The coordinator partitions the scanned file list into fixed-size batches
//! and runs each batch in an isolated worker *process* (the metadata backend
//! is not proven safe for concurrent writers inside one process). Batches run
//! strictly sequentially: batch i+1 is not dispatched until batch i's worker
//! has exited and its results have been applied.
//!
//! Coordinator and worker speak JSON over the child's stdin/stdout: one
//! [`WorkerJob`] in, one [`WorkerReport`] out. The report is a single
//! document, so a batch's results always arrive atomically. The coordinator
//! drains the report through an mpsc channel with a non-blocking poll loop,
//! which keeps any attached shell responsive while the worker runs.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CaptionError, Result};
use crate::exiftool::ExifTool;
use crate::writer::{MetadataWriter, Outcome};

/// File extensions the scanner accepts, matched case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tiff", "bmp", "gif"];

/// Default output subfolder under the input folder.
pub const DEFAULT_OUTPUT_SUBFOLDER: &str = "MSUK";

/// Delay between result-channel polls while a worker is computing.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One run's parameters, handed from the shell to the orchestrator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub batch_size: usize,
    /// Worker-pool size accepted from the shell. The baseline pipeline
    /// dispatches one batch at a time, so this only bounds future concurrent
    /// dispatch; it is validated and logged.
    pub workers: usize,
    /// Explicit backend executable, forwarded to each worker so no worker
    /// re-derives it from ambient environment.
    pub exiftool: PathBuf,
    /// Executable spawned with the `worker` subcommand. Normally the current
    /// binary; overridable so tests can point at the built CLI.
    pub worker_exe: PathBuf,
}

/// A batch assignment shipped to one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub exiftool: PathBuf,
    pub input_folder: PathBuf,
    pub output_folder: PathBuf,
    pub files: Vec<String>,
}

/// Everything a worker produced for its batch, emitted as one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub results: Vec<ResultEntry>,
}

/// One file's processing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub filename: String,
    pub outcome: Outcome,
}

impl ResultEntry {
    /// The log-line form the shell displays for this entry.
    pub fn log_line(&self) -> String {
        match &self.outcome {
            Outcome::Success { .. } => format!("Processed: {}", self.filename),
            Outcome::Failure { reason } => {
                format!("Error processing {}: {}", self.filename, reason)
            }
        }
    }
}

/// Progress surface the shell plugs into the orchestrator. No UI state leaks
/// the other way.
pub trait ProgressSink {
    /// Called once per file, in the order entries arrive from the worker.
    fn file_result(&mut self, entry: &ResultEntry);
    /// Called after each batch with the running processed count.
    fn batch_complete(&mut self, processed: usize, total: usize);
}

/// Cooperative cancellation flag, checked between batch dispatches. A batch
/// already running always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final tally returned to the shell.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub processed: usize,
    pub total: usize,
    pub output: PathBuf,
}

/// Scan a flat folder for image files (non-recursive). Returns sorted
/// filenames for deterministic batching.
pub fn scan_images(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let matches = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if matches {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Worker body: process every file in the job and collect one entry each.
///
/// Runs inside the spawned `worker` subcommand, but is an ordinary function
/// so tests can call it in-process. Per-file errors never escape; the report
/// always carries exactly one entry per input file.
pub fn run_worker(job: &WorkerJob) -> WorkerReport {
    let writer = match ExifTool::with_executable(&job.exiftool) {
        Ok(backend) => MetadataWriter::new(backend),
        Err(e) => {
            // The coordinator guards before spawning, so this is a changed
            // environment mid-run. Report it per file rather than dying.
            let reason = e.to_string();
            return WorkerReport {
                results: job
                    .files
                    .iter()
                    .map(|f| ResultEntry {
                        filename: f.clone(),
                        outcome: Outcome::Failure {
                            reason: reason.clone(),
                        },
                    })
                    .collect(),
            };
        }
    };

    let results = job
        .files
        .iter()
        .map(|filename| {
            let src = job.input_folder.join(filename);
            let dest = job.output_folder.join(filename);
            let outcome = writer.process_image(&src, &dest);
            debug!("{filename}: {outcome:?}");
            ResultEntry {
                filename: filename.clone(),
                outcome,
            }
        })
        .collect();

    WorkerReport { results }
}

pub struct Orchestrator {
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Drive the sequential batch pipeline to completion.
    ///
    /// The output folder is created before the first dispatch. Per-file
    /// failures are reported through the sink and never abort the run; a
    /// broken result channel logs the batch as lost and moves on.
    pub fn run(
        &self,
        files: Vec<String>,
        sink: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunSummary> {
        let total = files.len();
        std::fs::create_dir_all(&self.config.output)?;

        let batches: Vec<&[String]> = files.chunks(self.config.batch_size.max(1)).collect();
        info!(
            "processing {} files in {} batches of up to {} (worker pool size {})",
            total,
            batches.len(),
            self.config.batch_size.max(1),
            self.config.workers.max(1)
        );

        let mut processed = 0usize;
        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("cancelled before batch {index}; {processed}/{total} files processed");
                break;
            }

            match self.dispatch_and_await(index, batch, sink) {
                Ok(()) => {}
                Err(e) => {
                    // Channel-level breakdown, not a per-file failure. The
                    // batch's outcome is unknown; keep going.
                    error!("batch {index} lost: {e}");
                }
            }

            processed += batch.len();
            sink.batch_complete(processed, total);
        }

        Ok(RunSummary {
            processed,
            total,
            output: self.config.output.clone(),
        })
    }

    /// Spawn the worker for one batch, poll for its report, apply results,
    /// and reap the child before returning.
    fn dispatch_and_await(
        &self,
        index: usize,
        batch: &[String],
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let job = WorkerJob {
            exiftool: self.config.exiftool.clone(),
            input_folder: self.config.input.clone(),
            output_folder: self.config.output.clone(),
            files: batch.to_vec(),
        };

        debug!("dispatching batch {index} ({} files)", batch.len());
        let mut child = self.spawn_worker(&job)?;
        let rx = collect_report(&mut child);

        // Non-blocking poll so a single-threaded shell stays responsive.
        let received = loop {
            match rx.try_recv() {
                Ok(report) => break report,
                Err(mpsc::TryRecvError::Empty) => thread::sleep(POLL_INTERVAL),
                Err(mpsc::TryRecvError::Disconnected) => {
                    break Err(CaptionError::Channel(
                        "worker reader thread vanished".to_string(),
                    ))
                }
            }
        };

        // Reap the worker on every path so the next dispatch never overlaps.
        let status = child.wait()?;
        if !status.success() {
            warn!("batch {index} worker exited with {status}");
        }

        let report = received?;
        for entry in &report.results {
            sink.file_result(entry);
        }
        Ok(())
    }

    /// Spawn one worker and hand it its job. A child that dies before the
    /// handoff completes is reaped here; the caller only ever owns a child
    /// that received its job.
    fn spawn_worker(&self, job: &WorkerJob) -> Result<Child> {
        let payload = serde_json::to_string(job)?;
        let mut child = Command::new(&self.config.worker_exe)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let Some(mut stdin) = child.stdin.take() else {
            reap(&mut child);
            return Err(CaptionError::Channel(
                "failed to open worker stdin".to_string(),
            ));
        };
        if let Err(e) = stdin.write_all(payload.as_bytes()) {
            // The worker exited without reading its job (broken pipe). Wait
            // for it here so it never lingers as a zombie.
            drop(stdin);
            reap(&mut child);
            return Err(CaptionError::Channel(format!("writing worker job: {e}")));
        }
        drop(stdin); // EOF signals the job is complete

        Ok(child)
    }
}

/// Terminate and wait for a child whose handoff failed. Errors are ignored:
/// the child is usually already dead and there is nothing left to salvage.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// One-way result channel: a reader thread drains the worker's stdout to EOF
/// and forwards the parsed report.
fn collect_report(child: &mut Child) -> mpsc::Receiver<Result<WorkerReport>> {
    let (tx, rx) = mpsc::channel();
    let stdout = child.stdout.take();
    thread::spawn(move || {
        let result = match stdout {
            Some(mut stdout) => {
                let mut buf = String::new();
                match stdout.read_to_string(&mut buf) {
                    Ok(_) => serde_json::from_str::<WorkerReport>(&buf)
                        .map_err(|e| CaptionError::Channel(format!("bad worker report: {e}"))),
                    Err(e) => Err(CaptionError::Channel(format!("reading worker stdout: {e}"))),
                }
            }
            None => Err(CaptionError::Channel(
                "worker stdout not captured".to_string(),
            )),
        };
        // Coordinator may already have moved on after a cancel; ignore.
        let _ = tx.send(result);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_lens(n: usize, size: usize) -> Vec<usize> {
        let files: Vec<String> = (0..n).map(|i| format!("f{i}.jpg")).collect();
        files.chunks(size).map(|c| c.len()).collect()
    }

    #[test]
    fn test_partition_last_batch_short() {
        assert_eq!(batch_lens(7, 3), vec![3, 3, 1]);
        assert_eq!(batch_lens(6, 3), vec![3, 3]);
        assert_eq!(batch_lens(2, 100), vec![2]);
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.JPG", "a.jpeg", "notes.txt", "c.gif", "d.webp"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let files = scan_images(dir.path()).unwrap();
        assert_eq!(files, vec!["a.jpeg", "b.JPG", "c.gif"]);
    }

    #[test]
    fn test_scan_ignores_extensionless() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert!(scan_images(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_log_line_forms() {
        let ok = ResultEntry {
            filename: "a.jpg".to_string(),
            outcome: Outcome::Success { xmp_written: true },
        };
        assert_eq!(ok.log_line(), "Processed: a.jpg");

        let bad = ResultEntry {
            filename: "b.jpg".to_string(),
            outcome: Outcome::Failure {
                reason: "No description found".to_string(),
            },
        };
        assert_eq!(bad.log_line(), "Error processing b.jpg: No description found");
    }

    #[test]
    fn test_worker_job_round_trips_as_json() {
        let job = WorkerJob {
            exiftool: PathBuf::from("/usr/bin/exiftool"),
            input_folder: PathBuf::from("/in"),
            output_folder: PathBuf::from("/out"),
            files: vec!["a.jpg".to_string(), "b.png".to_string()],
        };
        let wire = serde_json::to_string(&job).unwrap();
        let back: WorkerJob = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.files, job.files);
        assert_eq!(back.exiftool, job.exiftool);
    }
}
