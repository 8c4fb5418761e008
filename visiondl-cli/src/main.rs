//! visiondl CLI — bulk download of dated market-data archives.
//!
//! Commands:
//! - `download` — expand a selection into work units and fetch them,
//!   resuming across interrupted runs
//! - `status` — report the progress store snapshot
//! - `list` — enumerate the valid segments, data kinds, and intervals

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use visiondl_core::{
    run_batch, BatchSpec, DataKind, HttpArchiveHost, Interval, KindSelection, ProgressStore,
    RetryPolicy, SessionSettings, StdoutReporter, VenueSegment,
};

#[derive(Parser)]
#[command(
    name = "visiondl",
    about = "Bulk downloader for Binance Vision historical archives"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a matrix of archives: segment × kinds × symbols ×
    /// intervals × date range.
    Download {
        /// Symbols to download (e.g., BTCUSDT ETHUSDT).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Venue segment: spot, um, cm.
        #[arg(long, default_value = "spot")]
        segment: String,

        /// Data kind, repeatable (see `list kinds`).
        #[arg(long = "kind", default_value = "klines")]
        kinds: Vec<String>,

        /// Comma-separated intervals for candle-like kinds (e.g., 1m,1h,1d).
        #[arg(long)]
        intervals: Option<String>,

        /// Start date (YYYY-MM-DD). Defaults to January 1st of the current year.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Destination directory for the mirrored archive tree.
        #[arg(long, default_value = "data")]
        output_dir: PathBuf,

        /// Upstream HTTP proxy URL (e.g., http://proxy:8080).
        #[arg(long)]
        proxy: Option<String>,

        /// Ignore prior progress records (valid local files are still honored).
        #[arg(long, default_value_t = false)]
        no_resume: bool,

        /// Progress file path. Defaults to .visiondl-progress.json in the output directory.
        #[arg(long)]
        progress_file: Option<PathBuf>,

        /// Maximum fetch attempts per unit.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Report the progress store snapshot: counts per status and failed keys.
    Status {
        /// Progress file path.
        #[arg(long, default_value = "data/.visiondl-progress.json")]
        progress_file: PathBuf,
    },
    /// List valid venue segments, data kinds, or intervals.
    List {
        #[command(subcommand)]
        table: ListTable,
    },
}

#[derive(Subcommand)]
enum ListTable {
    /// Venue segments.
    Segments,
    /// Data kinds.
    Kinds,
    /// Candle intervals.
    Intervals,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            symbols,
            segment,
            kinds,
            intervals,
            start,
            end,
            output_dir,
            proxy,
            no_resume,
            progress_file,
            max_retries,
            timeout,
        } => run_download(DownloadArgs {
            symbols,
            segment,
            kinds,
            intervals,
            start,
            end,
            output_dir,
            proxy,
            no_resume,
            progress_file,
            max_retries,
            timeout,
        }),
        Commands::Status { progress_file } => run_status(&progress_file),
        Commands::List { table } => {
            run_list(table);
            Ok(())
        }
    }
}

struct DownloadArgs {
    symbols: Vec<String>,
    segment: String,
    kinds: Vec<String>,
    intervals: Option<String>,
    start: Option<String>,
    end: Option<String>,
    output_dir: PathBuf,
    proxy: Option<String>,
    no_resume: bool,
    progress_file: Option<PathBuf>,
    max_retries: u32,
    timeout: u64,
}

fn run_download(args: DownloadArgs) -> Result<()> {
    let segment: VenueSegment = args.segment.parse().map_err(anyhow::Error::msg)?;

    let intervals = parse_intervals(args.intervals.as_deref())?;
    let mut kinds = Vec::new();
    for name in &args.kinds {
        let kind: DataKind = name.parse().map_err(anyhow::Error::msg)?;
        if kind.is_candle_like() && intervals.is_empty() {
            bail!("data kind '{kind}' requires --intervals (e.g., --intervals 1h,1d)");
        }
        kinds.push(KindSelection {
            kind,
            intervals: if kind.is_candle_like() {
                intervals.clone()
            } else {
                Vec::new()
            },
        });
    }

    let today = chrono::Local::now().date_naive();
    let start = match args.start.as_deref() {
        Some(s) => parse_date(s)?,
        None => NaiveDate::from_ymd_opt(today.year(), 1, 1).expect("January 1st is valid"),
    };
    let end = match args.end.as_deref() {
        Some(s) => parse_date(s)?,
        None => today,
    };

    let spec = BatchSpec {
        segment,
        kinds,
        symbols: args.symbols,
        start,
        end,
    };

    let mut settings = SessionSettings::new(args.output_dir);
    if let Some(path) = args.progress_file {
        settings.progress_path = path;
    }
    settings.resume = !args.no_resume;
    settings.retry = RetryPolicy {
        max_attempts: args.max_retries.max(1),
        ..RetryPolicy::default()
    };
    settings.timeout = Duration::from_secs(args.timeout);
    settings.proxy = args.proxy;

    let host = HttpArchiveHost::new(settings.timeout, settings.proxy.as_deref())
        .context("failed to build HTTP client (is the proxy URL valid?)")?;

    let cancel = install_cancel_flag()?;
    let summary = run_batch(&spec, &settings, &host, &StdoutReporter, &cancel)?;

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Ctrl-C flips the shared flag; the in-flight unit finishes and every
/// unreached unit stays pending for the next resumed run.
fn install_cancel_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
        eprintln!();
        eprintln!("Interrupt received: finishing the current unit, then stopping.");
    })
    .context("failed to install interrupt handler")?;
    Ok(flag)
}

fn run_status(progress_file: &PathBuf) -> Result<()> {
    if !progress_file.exists() {
        println!("No progress file at {}.", progress_file.display());
        return Ok(());
    }

    let store = ProgressStore::open(progress_file)?;
    let snap = store.snapshot();

    println!("Progress: {}", progress_file.display());
    println!("{:<16} {:>6}", "total", snap.total);
    println!("{:<16} {:>6}", "pending", snap.pending);
    println!("{:<16} {:>6}", "in_progress", snap.in_progress);
    println!("{:<16} {:>6}", "completed", snap.completed);
    println!("{:<16} {:>6}", "skipped_no_data", snap.skipped_no_data);
    println!("{:<16} {:>6}", "failed", snap.failed);

    if !snap.failed_keys.is_empty() {
        println!();
        println!("Failed units:");
        for key in &snap.failed_keys {
            println!("  {key}");
        }
    }
    Ok(())
}

fn run_list(table: ListTable) {
    match table {
        ListTable::Segments => {
            for seg in VenueSegment::ALL {
                println!("{:<6} {}", seg.code(), seg.description());
            }
        }
        ListTable::Kinds => {
            for kind in DataKind::ALL {
                println!("{:<20} {}", kind.archive_name(), kind.description());
            }
        }
        ListTable::Intervals => {
            for iv in Interval::ALL {
                println!("{}", iv.code());
            }
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{s}' (expected YYYY-MM-DD)"))
}

fn parse_intervals(s: Option<&str>) -> Result<Vec<Interval>> {
    let Some(s) = s else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(part.parse::<Interval>().map_err(anyhow::Error::msg)?);
    }
    Ok(out)
}
