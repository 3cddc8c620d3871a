//! CLI binary for notes2script.
//!
//! A thin shim over the library crate: it maps CLI flags to
//! `ServiceConfig`, submits each input to a local `ScriptService` and copies
//! the finished script documents into the output directory.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use notes2script::input::resolve_local;
use notes2script::stream::task_events;
use notes2script::{
    DeckReader, JobEvent, JsonDeckReader, JsonScriptWriter, RenderTools, ScriptService,
    ServiceConfig, TaskState, ThumbnailCache,
};
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one deck into ./talk_script.json
  notes2script talk.json

  # Several decks, results in ./scripts
  notes2script day1.json day2.json -o scripts

  # Longer script slides, no thumbnail cache
  notes2script --max-chars 300 --no-cache talk.json

  # Cache maintenance
  notes2script --stats
  notes2script --clear-cache

THUMBNAILS:
  Tried in order until one succeeds for the whole deck:
    1. thumbnail cache
    2. LibreOffice → PDF → pdfium, rasterised in batches
    3. PowerPoint export (Windows / macOS only)
    4. LibreOffice direct PNG export
    5. built-in renderer, placeholder image as last resort

ENVIRONMENT VARIABLES:
  PDFIUM_LIB_PATH            Directory containing libpdfium
  NOTES2SCRIPT_CACHE_DIR     Thumbnail cache directory
  RUST_LOG                   Override log filter (e.g. notes2script=debug)
"#;

/// Turn presentation speaker notes into large script slides.
#[derive(Parser, Debug)]
#[command(
    name = "notes2script",
    version,
    about = "Turn presentation speaker notes into large script slides",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Presentation files to convert.
    inputs: Vec<PathBuf>,

    /// Directory receiving `<name>_script.json` files.
    #[arg(short, long, env = "NOTES2SCRIPT_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Thumbnail cache directory.
    #[arg(long, env = "NOTES2SCRIPT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Thumbnail cache size limit in MB.
    #[arg(long, env = "NOTES2SCRIPT_CACHE_MAX_MB", default_value_t = 200)]
    cache_max_mb: u64,

    /// Do not read or write the thumbnail cache.
    #[arg(long, env = "NOTES2SCRIPT_NO_CACHE")]
    no_cache: bool,

    /// Empty the thumbnail cache before converting.
    #[arg(long)]
    clear_cache: bool,

    /// Print thumbnail cache statistics.
    #[arg(long)]
    stats: bool,

    /// Maximum characters on one script slide.
    #[arg(long, env = "NOTES2SCRIPT_MAX_CHARS", default_value_t = 200,
          value_parser = clap::value_parser!(u64).range(10..=2000))]
    max_chars: u64,

    /// Refuse work above this resident memory in MB.
    #[arg(long, env = "NOTES2SCRIPT_MEMORY_CEILING_MB", default_value_t = 400)]
    memory_ceiling_mb: u64,

    /// Use only the built-in renderer (skip LibreOffice, pdfium, PowerPoint).
    #[arg(long)]
    internal_only: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "NOTES2SCRIPT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "NOTES2SCRIPT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "NOTES2SCRIPT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner shows the job log, so INFO library logs are suppressed
    // while it is active.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    // ── Cache maintenance ────────────────────────────────────────────────
    if cli.clear_cache || cli.stats {
        let cache = ThumbnailCache::open(&config.cache_dir, config.cache_max_bytes)
            .context("Failed to open thumbnail cache")?;
        if cli.clear_cache {
            cache.clear();
            if !cli.quiet {
                eprintln!("{} cache cleared: {}", green("✔"), cache.dir().display());
            }
        }
        if cli.stats {
            let s = cache.stats();
            println!("Cache dir:    {}", cache.dir().display());
            println!("Files:        {}", s.file_count);
            println!(
                "Size:         {:.2}MB / {:.0}MB ({}%)",
                s.total_size_mb(),
                s.max_size_bytes as f64 / (1024.0 * 1024.0),
                s.usage_percent
            );
        }
        if cli.inputs.is_empty() {
            return Ok(());
        }
    }
    if cli.inputs.is_empty() {
        bail!("no input files given");
    }

    // ── Run conversions ──────────────────────────────────────────────────
    let tools = if cli.internal_only {
        RenderTools::internal_only()
    } else {
        RenderTools::detect()
    };
    let reader = Arc::new(JsonDeckReader);
    let service = ScriptService::new(
        config,
        tools,
        reader.clone(),
        Arc::new(JsonScriptWriter::default()),
    );
    tokio::fs::create_dir_all(&cli.output_dir)
        .await
        .with_context(|| format!("Failed to create {}", cli.output_dir.display()))?;

    let mut failed = 0usize;
    for input in &cli.inputs {
        match convert_one(&service, reader.as_ref(), input, &cli, show_progress).await {
            Ok(out) => {
                if !cli.quiet {
                    eprintln!("{} {}  →  {}", green("✔"), input.display(), bold(&out.display().to_string()));
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {:#}", red("✘"), input.display(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} conversions failed", cli.inputs.len());
    }
    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .cache_enabled(!cli.no_cache)
        .cache_max_mb(cli.cache_max_mb)
        .memory_ceiling_mb(cli.memory_ceiling_mb)
        .max_chars_per_slide(cli.max_chars as usize);
    if let Some(dir) = &cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    builder.build().context("Invalid configuration")
}

async fn convert_one(
    service: &ScriptService,
    reader: &dyn DeckReader,
    input: &Path,
    cli: &Cli,
    show_progress: bool,
) -> Result<PathBuf> {
    let path = resolve_local(input, reader)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Subscribe first so the Queued event is not missed.
    let rx = service.subscribe();
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // Keeping the source mtime lets the thumbnail cache recognise the file.
    let modified = file.metadata().await.and_then(|m| m.modified()).ok();
    let receipt = service.submit_with_modified(&name, file, modified).await?;

    let bar = show_progress.then(|| spinner(&name));
    let mut events = task_events(service.queue(), rx, receipt.task_id);
    while let Some(event) = events.next().await {
        match (&bar, event) {
            (Some(bar), JobEvent::Queued { position, .. }) => {
                bar.set_message(format!("queued at position {position}"))
            }
            (Some(bar), JobEvent::Log { line, .. }) => bar.set_message(line),
            (_, JobEvent::Finished { .. }) => break,
            _ => {}
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    let status = service.status(&receipt.task_id)?;
    if status.status != TaskState::Completed {
        if cli.verbose {
            for line in &status.logs {
                eprintln!("  {}", dim(line));
            }
        }
        bail!("{}", status.message);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deck".to_string());
    let dest = cli.output_dir.join(format!("{stem}_script.json"));
    let mut download = service.download(&receipt.task_id).await?;
    let mut out = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    tokio::io::copy(&mut download, &mut out)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    Ok(dest)
}

fn spinner(name: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    bar.set_style(style);
    bar.set_prefix(name.to_string());
    bar.set_message("Uploading…");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}
