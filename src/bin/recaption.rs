// recaption - batch IPTC/XMP caption rewriter
// Terminal shell around the core pipeline, plus the hidden worker entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use recaption::batch::{self, CancelToken, Orchestrator, ProgressSink, ResultEntry, RunConfig};
use recaption::exiftool::{BackendConfig, ExifTool};
use recaption::rally::{self, RallyClient};
use recaption::CaptionError;

#[derive(Parser)]
#[command(name = "recaption", version, about = "Rewrite legacy IPTC captions into clean IPTC+XMP descriptions")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Process a folder of images in batches
    Process {
        /// Folder containing the source images (flat, non-recursive)
        #[arg(long)]
        input: PathBuf,

        /// Destination folder; defaults to <input>/MSUK
        #[arg(long)]
        output: Option<PathBuf>,

        /// Files per worker batch
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Worker pool size
        #[arg(long, default_value_t = default_workers())]
        workers: usize,

        /// Explicit path to the exiftool executable
        #[arg(long)]
        exiftool: Option<PathBuf>,
    },

    /// Verify the exiftool backend is available
    Check {
        /// Explicit path to the exiftool executable
        #[arg(long)]
        exiftool: Option<PathBuf>,
    },

    /// Fetch a rally entry list and export it as CSV
    Rally {
        /// Any URL on the timing server; the entry feed lives next to it
        #[arg(long)]
        url: String,

        /// Output directory for the CSV
        #[arg(long)]
        out: PathBuf,

        /// Output filename
        #[arg(long, default_value = rally::DEFAULT_CSV_FILENAME)]
        filename: String,
    },

    /// Internal: process one batch read as JSON from stdin (spawned per batch)
    #[command(hide = true)]
    Worker,
}

fn default_workers() -> usize {
    (num_cpus::get().saturating_sub(1)).max(1)
}

/// Prints per-file log lines and a progress counter after each batch.
struct TerminalSink;

impl ProgressSink for TerminalSink {
    fn file_result(&mut self, entry: &ResultEntry) {
        println!("{}", entry.log_line());
    }

    fn batch_complete(&mut self, processed: usize, total: usize) {
        println!("[{processed}/{total}]");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        CliCommand::Process {
            input,
            output,
            batch_size,
            workers,
            exiftool,
        } => run_process(input, output, batch_size, workers, exiftool),
        CliCommand::Check { exiftool } => run_check(exiftool),
        CliCommand::Rally { url, out, filename } => run_rally(&url, &out, &filename),
        CliCommand::Worker => run_worker(),
    }
}

fn run_process(
    input: PathBuf,
    output: Option<PathBuf>,
    batch_size: usize,
    workers: usize,
    exiftool: Option<PathBuf>,
) -> Result<()> {
    if !input.is_dir() {
        bail!("input folder {} does not exist", input.display());
    }
    if batch_size == 0 {
        bail!("batch size must be at least 1");
    }

    // Dependency guard runs before anything touches the filesystem or a
    // worker is spawned.
    let backend = resolve_backend(exiftool)?;

    let files = batch::scan_images(&input).context("scanning input folder")?;
    if files.is_empty() {
        println!("No images found in {}", input.display());
        return Ok(());
    }

    let output = output.unwrap_or_else(|| input.join(batch::DEFAULT_OUTPUT_SUBFOLDER));
    let config = RunConfig {
        input,
        output,
        batch_size,
        workers: workers.max(1),
        exiftool: backend.executable().to_path_buf(),
        worker_exe: std::env::current_exe().context("locating own executable")?,
    };

    let orchestrator = Orchestrator::new(config);
    let summary = orchestrator.run(files, &mut TerminalSink, &CancelToken::new())?;

    println!(
        "Processed {} images. Output folder: {}",
        summary.processed,
        summary.output.display()
    );
    Ok(())
}

fn run_check(exiftool: Option<PathBuf>) -> Result<()> {
    let backend = resolve_backend(exiftool)?;
    println!(
        "exiftool {} at {} ({} writable formats)",
        backend.version(),
        backend.executable().display(),
        backend.writable_format_count()
    );
    Ok(())
}

fn run_rally(url: &str, out: &std::path::Path, filename: &str) -> Result<()> {
    let client = RallyClient::from_url(url)?;
    let entries = client.fetch_entries().with_context(|| format!("fetching entries near {url}"))?;
    let rows = rally::flatten(&entries);
    let path = rally::export_csv(&rows, out, filename)?;
    println!("Data exported to {}", path.display());
    Ok(())
}

/// Worker entry point: one JSON job on stdin, one JSON report on stdout.
fn run_worker() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading worker job from stdin")?;
    let job = serde_json::from_str(&input).context("parsing worker job")?;

    let report = batch::run_worker(&job);
    println!("{}", serde_json::to_string(&report)?);

    info!("worker finished {} files", report.results.len());
    Ok(())
}

fn resolve_backend(executable: Option<PathBuf>) -> Result<ExifTool> {
    match ExifTool::resolve(&BackendConfig { executable }) {
        Ok(backend) => Ok(backend),
        Err(CaptionError::DependencyMissing { hint }) => {
            error!("exiftool backend not available");
            bail!("exiftool backend not available: {hint}");
        }
        Err(e) => Err(e.into()),
    }
}
