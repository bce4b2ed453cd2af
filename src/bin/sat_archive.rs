use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use sat_archive::cache::{ReconciliationCache, ScanKey};
use sat_archive::config::{ConfigLoader, ResolvedConfig};
use sat_archive::domain::{Product, Satellite, Timestamp};
use sat_archive::error::ArchiveError;
use sat_archive::fetch::FetchCoordinator;
use sat_archive::output::{JsonOutput, OutputMode, TextSink};
use sat_archive::progress::{CancelToken, ProgressSink};
use sat_archive::reconcile::{AbsencePolicy, Reconciler, ScanOptions};
use sat_archive::remote::ArchiveBackend;

#[derive(Parser)]
#[command(name = "sat-archive")]
#[command(about = "Finds and fills gaps in a local satellite imagery archive")]
#[command(version, author)]
struct Cli {
    /// Path to the config file (defaults to ./sat-archive.json).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON instead of progress text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Report frames missing from the local archive")]
    Scan(ScanArgs),
    #[command(about = "Scan, then download the missing frames")]
    Fetch(FetchArgs),
    #[command(about = "Drop the stored scan result for a key")]
    Invalidate(KeyArgs),
}

#[derive(Args)]
struct KeyArgs {
    /// Satellite (defaults to the configured one).
    #[arg(long)]
    satellite: Option<Satellite>,

    /// Product variant (defaults to the first configured one).
    #[arg(long)]
    product: Option<Product>,

    /// Range start, e.g. 202608230000 or 2026-08-23T00:00Z.
    #[arg(long)]
    start: String,

    /// Range end, inclusive when it lands on the grid.
    #[arg(long)]
    end: String,

    /// Expected spacing in minutes; 0 auto-detects.
    #[arg(long, default_value_t = 0)]
    interval: u32,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Recompute even when a stored result exists.
    #[arg(long)]
    force: bool,

    /// Probe the backend so frames absent upstream are not reported missing.
    #[arg(long)]
    probe_remote: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    scan: ScanArgs,

    /// Worker count override for this run.
    #[arg(long)]
    concurrency: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(archive) = report.downcast_ref::<ArchiveError>() {
            return ExitCode::from(map_exit_code(archive));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ArchiveError) -> u8 {
    match error {
        ArchiveError::MissingConfig => 2,
        ArchiveError::ScheduleUndetectable(_) => 2,
        ArchiveError::RemoteNotFound(_) => 2,
        ArchiveError::RemoteTransient(_) | ArchiveError::RemotePermanent { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let resolved = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;

    match cli.command {
        Commands::Scan(args) => run_scan(args, &resolved, output_mode),
        Commands::Fetch(args) => run_fetch(args, &resolved, output_mode),
        Commands::Invalidate(args) => run_invalidate(args, &resolved),
    }
}

fn scan_key(args: &KeyArgs, resolved: &ResolvedConfig) -> miette::Result<ScanKey> {
    let satellite = args.satellite.unwrap_or(resolved.satellite);
    let product = args
        .product
        .or_else(|| resolved.products.first().copied())
        .ok_or_else(|| miette::Report::msg("no product configured (try --product)"))?;
    let start: Timestamp = args.start.parse().into_diagnostic()?;
    let end: Timestamp = args.end.parse().into_diagnostic()?;
    let interval = if args.interval > 0 {
        args.interval
    } else {
        resolved.interval_minutes
    };
    Ok(ScanKey {
        satellite,
        product,
        start,
        end,
        interval_minutes: interval,
    })
}

fn open_session(
    resolved: &ResolvedConfig,
) -> miette::Result<(Reconciler<ArchiveBackend>, ReconciliationCache)> {
    let backend = resolved
        .remote
        .build(resolved.archive.request_timeout())
        .into_diagnostic()?;
    let cache =
        ReconciliationCache::open(resolved.archive.cache_root.clone()).into_diagnostic()?;
    let reconciler = Reconciler::new(resolved.archive.clone(), cache.clone(), backend);
    Ok((reconciler, cache))
}

fn progress_sink(mode: OutputMode) -> Box<dyn ProgressSink> {
    match mode {
        OutputMode::Text => Box::new(TextSink),
        OutputMode::Json => Box::new(JsonOutput),
    }
}

fn run_scan(args: ScanArgs, resolved: &ResolvedConfig, mode: OutputMode) -> miette::Result<()> {
    let key = scan_key(&args.key, resolved)?;
    let (reconciler, cache) = open_session(resolved)?;
    let sink = progress_sink(mode);
    let options = ScanOptions {
        force_rescan: args.force,
        absence_policy: if args.probe_remote {
            AbsencePolicy::ProbeRemote
        } else {
            AbsencePolicy::LocalOnly
        },
    };

    let result = reconciler.start_scan(&key, options, &CancelToken::new(), sink.as_ref());
    cache.close();
    let result = result.into_diagnostic()?;

    match mode {
        OutputMode::Json => JsonOutput::print_scan(&result).into_diagnostic()?,
        OutputMode::Text => {
            println!(
                "{} of {} frames present, {} missing (interval {} min)",
                result.found_count,
                result.expected_count,
                result.missing.len(),
                result.detected_interval
            );
            for timestamp in &result.missing {
                println!("  missing {timestamp}");
            }
        }
    }
    Ok(())
}

fn run_fetch(args: FetchArgs, resolved: &ResolvedConfig, mode: OutputMode) -> miette::Result<()> {
    let key = scan_key(&args.scan.key, resolved)?;
    let (reconciler, cache) = open_session(resolved)?;
    let sink = progress_sink(mode);
    let options = ScanOptions {
        force_rescan: args.scan.force,
        absence_policy: if args.scan.probe_remote {
            AbsencePolicy::ProbeRemote
        } else {
            AbsencePolicy::LocalOnly
        },
    };
    let cancel = CancelToken::new();

    let scan = reconciler.start_scan(&key, options, &cancel, sink.as_ref());
    cache.close();
    let scan = scan.into_diagnostic()?;

    let mut config = resolved.archive.clone();
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    let backend = resolved
        .remote
        .build(resolved.archive.request_timeout())
        .into_diagnostic()?;
    let coordinator = FetchCoordinator::new(config, backend);
    let report = coordinator
        .run(key.satellite, key.product, &scan.missing, &cancel, sink.as_ref())
        .into_diagnostic()?;

    match mode {
        OutputMode::Json => JsonOutput::print_fetch(&report).into_diagnostic()?,
        OutputMode::Text => {
            println!(
                "fetched {} frames, {} failed, {} cancelled",
                report.succeeded, report.failed, report.cancelled
            );
            for task in report.tasks.iter().filter(|task| task.error.is_some()) {
                println!(
                    "  {} {:?}: {}",
                    task.timestamp,
                    task.status,
                    task.error.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
    Ok(())
}

fn run_invalidate(args: KeyArgs, resolved: &ResolvedConfig) -> miette::Result<()> {
    let key = scan_key(&args, resolved)?;
    let cache =
        ReconciliationCache::open(resolved.archive.cache_root.clone()).into_diagnostic()?;
    let outcome = cache.invalidate(&key);
    cache.close();
    outcome.into_diagnostic()?;
    println!("dropped stored result for {}", key.storage_name());
    Ok(())
}
