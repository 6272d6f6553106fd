//! Integration tests for the caption rewrite pipeline
//!
//! Tests that exercise real metadata I/O need the system `exiftool` binary
//! and skip with a notice when it is absent. The orchestrator-level tests
//! that only exercise dispatch/channel behavior run everywhere.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use recaption::batch::{self, CancelToken, Orchestrator, ProgressSink, ResultEntry, RunConfig};
use recaption::exiftool::{BackendConfig, ExifTool};
use recaption::writer::{MetadataWriter, Outcome};
use tempfile::TempDir;

/// Path of the built CLI, used as the worker executable.
fn cli_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_recaption"))
}

fn backend() -> Option<ExifTool> {
    match ExifTool::resolve(&BackendConfig::default()) {
        Ok(b) => Some(b),
        Err(_) => {
            eprintln!("skipping: exiftool not installed");
            None
        }
    }
}

/// Write a small valid JPEG at `path`.
fn write_fixture_jpeg(path: &Path) {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([128, 128, 128]));
    img.save(path).expect("write fixture jpeg");
}

/// Seed a legacy-format caption into the fixture via exiftool itself.
fn seed_caption(backend: &ExifTool, path: &Path, caption: &str) {
    let status = Command::new(backend.executable())
        .arg("-overwrite_original")
        .arg(format!("-IPTC:Caption-Abstract={caption}"))
        .arg(path)
        .status()
        .expect("run exiftool");
    assert!(status.success(), "seeding caption failed");
}

#[derive(Default)]
struct RecordingSink {
    entries: Vec<ResultEntry>,
    batch_marks: Vec<(usize, usize)>,
}

impl ProgressSink for RecordingSink {
    fn file_result(&mut self, entry: &ResultEntry) {
        self.entries.push(entry.clone());
    }

    fn batch_complete(&mut self, processed: usize, total: usize) {
        self.batch_marks.push((processed, total));
    }
}

fn run_config(input: &Path, output: &Path, batch_size: usize, exiftool: PathBuf) -> RunConfig {
    RunConfig {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        batch_size,
        workers: 1,
        exiftool,
        worker_exe: cli_exe(),
    }
}

#[test]
fn test_process_image_rewrites_both_blocks() {
    let Some(backend) = backend() else { return };
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("stage1.jpg");
    let dest = dir.path().join("out.jpg");
    write_fixture_jpeg(&src);
    seed_caption(&backend, &src, "loc:Paris|x|date:2024-01-01T10:00:00");

    // Fresh fixture carries no XMP block yet.
    assert_eq!(backend.open_xmp(&src).unwrap().description().unwrap(), None);

    let writer = MetadataWriter::new(backend);
    let outcome = writer.process_image(&src, &dest);
    assert_eq!(outcome, Outcome::Success { xmp_written: true });

    let backend = writer.backend();
    let caption = String::from_utf8_lossy(&backend.read_caption(&dest).unwrap()).into_owned();
    assert_eq!(caption, "Paris, 2024-01-01T10:00:00");
    assert_eq!(
        backend.open_xmp(&dest).unwrap().description().unwrap().as_deref(),
        Some("Paris, 2024-01-01T10:00:00")
    );

    // Source untouched
    let original = String::from_utf8_lossy(&backend.read_caption(&src).unwrap()).into_owned();
    assert_eq!(original, "loc:Paris|x|date:2024-01-01T10:00:00");
}

#[test]
fn test_empty_caption_is_reported_not_fatal() {
    let Some(backend) = backend() else { return };
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("blank.jpg");
    write_fixture_jpeg(&src);

    let writer = MetadataWriter::new(backend);
    match writer.process_image(&src, &dir.path().join("out.jpg")) {
        Outcome::Failure { reason } => assert_eq!(reason, "No description found"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_invalid_caption_bytes_are_tolerated() {
    let Some(backend) = backend() else { return };
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("latin.jpg");
    let dest = dir.path().join("out.jpg");
    write_fixture_jpeg(&src);

    // Latin-1 caption bytes marked as UTF-8: 0xE9 is not valid UTF-8, which
    // is exactly what mislabeled legacy archives contain. The value comes
    // from a file so no shell or charset layer can repair it; `-m` lets
    // exiftool store the malformed bytes as-is.
    let raw = dir.path().join("caption.bin");
    std::fs::write(&raw, b"loc:Caf\xe9|x|stage:Night").unwrap();
    let status = Command::new(backend.executable())
        .arg("-overwrite_original")
        .arg("-m")
        .arg("-IPTC:CodedCharacterSet=UTF8")
        .arg(format!("-IPTC:Caption-Abstract<={}", raw.display()))
        .arg(&src)
        .status()
        .expect("run exiftool");
    assert!(status.success(), "seeding malformed caption failed");

    let writer = MetadataWriter::new(backend);
    let outcome = writer.process_image(&src, &dest);
    assert_eq!(
        outcome,
        Outcome::Success { xmp_written: true },
        "bad bytes must be tolerated, not fatal"
    );

    let caption =
        String::from_utf8_lossy(&writer.backend().read_caption(&dest).unwrap()).into_owned();
    assert_eq!(caption, "Caf\u{fffd}, Night");
}

#[test]
fn test_batch_run_mixed_outcomes() {
    let Some(backend) = backend() else { return };
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    std::fs::create_dir(&input).unwrap();

    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        write_fixture_jpeg(&input.join(name));
    }
    // b.jpg keeps an empty caption; the other two get legacy descriptions.
    seed_caption(&backend, &input.join("a.jpg"), "driver:Smith|car:Fiesta");
    seed_caption(&backend, &input.join("c.jpg"), "stage:Myherin");

    let files = batch::scan_images(&input).unwrap();
    assert_eq!(files, vec!["a.jpg", "b.jpg", "c.jpg"]);

    let config = run_config(&input, &output, 2, backend.executable().to_path_buf());
    let orchestrator = Orchestrator::new(config);
    let mut sink = RecordingSink::default();
    let summary = orchestrator.run(files, &mut sink, &CancelToken::new()).unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.total, 3);
    assert!(output.is_dir(), "output folder must be created before writes");

    assert_eq!(sink.entries.len(), 3);
    let failures: Vec<_> = sink
        .entries
        .iter()
        .filter(|e| !e.outcome.is_success())
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].filename, "b.jpg");
    assert_eq!(
        failures[0].log_line(),
        "Error processing b.jpg: No description found"
    );

    // Batches observed in index order, counts advancing per batch.
    assert_eq!(sink.batch_marks, vec![(2, 3), (3, 3)]);

    assert!(output.join("a.jpg").is_file());
    assert!(output.join("c.jpg").is_file());
    assert!(
        !output.join("b.jpg").is_file(),
        "failed file should not be written"
    );

    let writer = MetadataWriter::new(backend);
    let caption = String::from_utf8_lossy(
        &writer.backend().read_caption(&output.join("a.jpg")).unwrap(),
    )
    .into_owned();
    assert_eq!(caption, "Smith, Fiesta");
}

#[test]
fn test_worker_subcommand_protocol() {
    let Some(backend) = backend() else { return };
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("blank.jpg");
    write_fixture_jpeg(&src);

    let job = recaption::WorkerJob {
        exiftool: backend.executable().to_path_buf(),
        input_folder: dir.path().to_path_buf(),
        output_folder: dir.path().join("out"),
        files: vec!["blank.jpg".to_string()],
    };

    let mut child = Command::new(cli_exe())
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(serde_json::to_string(&job).unwrap().as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let report: recaption::WorkerReport = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(!report.results[0].outcome.is_success());
}

#[test]
fn test_guard_failure_spawns_nothing() {
    let config = BackendConfig {
        executable: Some(PathBuf::from("/nonexistent/exiftool")),
    };
    let err = ExifTool::resolve(&config).unwrap_err();
    assert!(matches!(
        err,
        recaption::CaptionError::DependencyMissing { .. }
    ));
    // The shell resolves the backend before constructing the orchestrator, so
    // a guard failure means no worker and no destination writes ever happen.
}

#[test]
fn test_cancelled_run_dispatches_no_batches() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    std::fs::create_dir(&input).unwrap();

    let token = CancelToken::new();
    token.cancel();

    let config = run_config(&input, &output, 10, PathBuf::from("exiftool"));
    let mut sink = RecordingSink::default();
    let summary = Orchestrator::new(config)
        .run(vec!["a.jpg".to_string()], &mut sink, &token)
        .unwrap();

    assert_eq!(summary.processed, 0);
    assert!(sink.entries.is_empty());
    assert!(sink.batch_marks.is_empty());
}

#[test]
fn test_broken_worker_does_not_stall_the_run() {
    // A worker that produces no report is a channel failure for its batch;
    // the run still advances through every batch.
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    std::fs::create_dir(&input).unwrap();

    let mut config = run_config(&input, &output, 1, PathBuf::from("exiftool"));
    config.worker_exe = PathBuf::from("/bin/false");

    let files = vec!["a.jpg".to_string(), "b.jpg".to_string()];
    let mut sink = RecordingSink::default();
    let summary = Orchestrator::new(config)
        .run(files, &mut sink, &CancelToken::new())
        .unwrap();

    assert_eq!(summary.processed, 2);
    assert!(sink.entries.is_empty(), "no per-file results from a dead worker");
    assert_eq!(sink.batch_marks, vec![(1, 2), (2, 2)]);
}

#[test]
fn test_worker_dying_mid_handoff_is_reaped() {
    // A job larger than the stdin pipe buffer guarantees the handoff write
    // hits the closed pipe once the worker exits without reading. The
    // coordinator must reap that child and carry on with the next batch.
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    std::fs::create_dir(&input).unwrap();

    let files: Vec<String> = (0..20_000).map(|i| format!("frame_{i:05}.jpg")).collect();
    let total = files.len();

    let mut config = run_config(&input, &output, total, PathBuf::from("exiftool"));
    config.worker_exe = PathBuf::from("/bin/false");

    let mut sink = RecordingSink::default();
    let summary = Orchestrator::new(config)
        .run(files, &mut sink, &CancelToken::new())
        .unwrap();

    assert_eq!(summary.processed, total);
    assert!(sink.entries.is_empty());
    assert_eq!(sink.batch_marks, vec![(total, total)]);
}
