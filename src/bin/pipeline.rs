//! Pipeline entry point: encode supplier archives, replay them through
//! the reconstruction engines, and write the daily feature tensors.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin pipeline -- \
//!     --start 20240102 --end 20240131 \
//!     --archives /data/l2_archives \
//!     --database /data/l2_database \
//!     --output   /data/output \
//!     --catalog  config/instruments.json
//! ```
//!
//! Exit codes: 0 on success, 1 on configuration errors, 2 on a failed
//! run (corrupted inputs aborting the pipeline), 130 on SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;

use ashare_lob_reconstructor::pipeline::{self, PipelineConfig, SharedState, ShutdownFlag};
use ashare_lob_reconstructor::store::{schema, FeatureStore, PersistMode};
use ashare_lob_reconstructor::{InstrumentCatalog, PipelineError};

struct Args {
    start: String,
    end: String,
    archives: PathBuf,
    database: PathBuf,
    output: PathBuf,
    catalog: PathBuf,
    encode_workers: usize,
    sequential_workers: usize,
    max_temp_dirs: usize,
    unified: bool,
    no_pin: bool,
    encode_only: bool,
}

fn print_help() {
    eprintln!(
        "\
pipeline - A-share L2 reconstruction and feature extraction

USAGE:
    pipeline [OPTIONS] --start <YYYYMMDD> --end <YYYYMMDD> --database <DIR> --catalog <FILE>

OPTIONS:
    -s, --start <DATE>         First trading date (YYYYMMDD)
    -e, --end <DATE>           Last trading date (YYYYMMDD)
    -a, --archives <DIR>       Day-packed archive tree (optional when resuming)
    -d, --database <DIR>       Encoded binary tree (created if missing)
    -o, --output <DIR>         Feature output root [default: output]
    -c, --catalog <FILE>       Instrument catalog JSON
        --encode-workers <N>   Encoding worker threads [default: 4]
        --seq-workers <N>      Sequential worker threads [default: 4]
        --max-temp-dirs <N>    Concurrent extraction cap [default: 8]
        --unified              Write one unified feature file per day
        --no-pin               Disable CPU core pinning
        --encode-only          Stop after the encoding phase
    -h, --help                 Show this help"
    );
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = std::env::args().collect();

    let mut start = None;
    let mut end = None;
    let mut archives = None;
    let mut database = None;
    let mut output = PathBuf::from("output");
    let mut catalog = None;
    let mut encode_workers = 4usize;
    let mut sequential_workers = 4usize;
    let mut max_temp_dirs = 8usize;
    let mut unified = false;
    let mut no_pin = false;
    let mut encode_only = false;

    let mut i = 1;
    while i < argv.len() {
        let take = |i: &mut usize| -> Result<String, String> {
            *i += 1;
            argv.get(*i)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", argv[*i - 1]))
        };
        match argv[i].as_str() {
            "--start" | "-s" => start = Some(take(&mut i)?),
            "--end" | "-e" => end = Some(take(&mut i)?),
            "--archives" | "-a" => archives = Some(PathBuf::from(take(&mut i)?)),
            "--database" | "-d" => database = Some(PathBuf::from(take(&mut i)?)),
            "--output" | "-o" => output = PathBuf::from(take(&mut i)?),
            "--catalog" | "-c" => catalog = Some(PathBuf::from(take(&mut i)?)),
            "--encode-workers" => {
                encode_workers = take(&mut i)?.parse().map_err(|e| format!("workers: {e}"))?
            }
            "--seq-workers" => {
                sequential_workers = take(&mut i)?.parse().map_err(|e| format!("workers: {e}"))?
            }
            "--max-temp-dirs" => {
                max_temp_dirs = take(&mut i)?.parse().map_err(|e| format!("cap: {e}"))?
            }
            "--unified" => unified = true,
            "--no-pin" => no_pin = true,
            "--encode-only" => encode_only = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args {
        start: start.ok_or("--start is required")?,
        end: end.ok_or("--end is required")?,
        archives: archives.unwrap_or_default(),
        database: database.ok_or("--database is required")?,
        output,
        catalog: catalog.ok_or("--catalog is required")?,
        encode_workers,
        sequential_workers,
        max_temp_dirs,
        unified,
        no_pin,
        encode_only,
    })
}

/// Supplier CSV parsing is an external collaborator; this binary only
/// replays trees that either carry pre-parsed binaries (resume) or are
/// fed through a reader provided by the embedding research harness.
struct UnavailableReader;

impl pipeline::SupplierReader for UnavailableReader {
    fn read_day(
        &self,
        _dir: &std::path::Path,
        asset_code: &str,
    ) -> ashare_lob_reconstructor::Result<(
        Vec<ashare_lob_reconstructor::SnapshotRecord>,
        Vec<ashare_lob_reconstructor::TickEvent>,
    )> {
        Err(PipelineError::Input {
            asset: asset_code.to_string(),
            date: "?".to_string(),
            detail: "no supplier reader wired into this build; encode from a harness or resume \
                     from existing binaries"
                .to_string(),
        })
    }
}

fn run(args: Args) -> Result<(), PipelineError> {
    schema::validate_schemas()?;

    let config = PipelineConfig {
        start_date: args.start,
        end_date: args.end,
        archive_base: args.archives,
        database_base: args.database,
        output_base: args.output,
        encode_workers: args.encode_workers,
        sequential_workers: args.sequential_workers,
        max_temp_dirs: args.max_temp_dirs,
        persist_mode: if args.unified {
            PersistMode::Unified
        } else {
            PersistMode::Separate
        },
        pin_cores: !args.no_pin,
        ..Default::default()
    };
    config.validate()?;

    let catalog = InstrumentCatalog::from_json_file(&args.catalog)?;
    if catalog.entries.is_empty() {
        return Err(PipelineError::Config("catalog has no instruments".into()));
    }

    let shutdown = ShutdownFlag::new();
    shutdown.install_sigint()?;

    let state = SharedState::initialize(&config, &catalog)?;
    log::info!(
        "{} instruments, {} trading dates, {}/{} pairs already encoded",
        state.assets.len(),
        state.all_dates.len(),
        state.total_encoded(),
        state.total_pairs()
    );

    // Phase 1: encode whatever is not already on disk.
    let encoding = pipeline::encoding::run_encoding_phase(
        &state,
        &config,
        &UnavailableReader,
        &shutdown,
    )?;
    for (asset, date, error) in &encoding.failed {
        log::warn!("not encoded: {asset} {date}: {error}");
    }
    if shutdown.requested() {
        return Err(PipelineError::Shutdown);
    }
    if args.encode_only {
        log::info!(
            "encode-only run complete: {} encoded, {} skipped, {} failed",
            encoding.encoded,
            encoding.skipped,
            encoding.failed.len()
        );
        return Ok(());
    }

    // Phases 2-4: sequential + cross-sectional + IO, concurrently.
    let store = FeatureStore::new(
        catalog.entries.len(),
        config.sequential_workers,
        config.tensor_pool_size,
    );
    let report = pipeline::run_analysis(&state, &config, &store, &shutdown)?;

    log::info!(
        "analysis complete: {} pairs ({} orders) processed, {} dates cross-sectioned, {} flushed",
        report.sequential.pairs_processed,
        report.sequential.orders_processed,
        report.cross_section.dates_completed,
        report.dates_flushed
    );
    for (asset, date, error) in &report.sequential.failed {
        log::warn!("failed pair: {asset} {date}: {error}");
    }

    if shutdown.requested() {
        return Err(PipelineError::Shutdown);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}\n");
            print_help();
            return ExitCode::from(1);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(PipelineError::Shutdown) => {
            log::warn!("interrupted");
            ExitCode::from(130)
        }
        Err(e @ PipelineError::Config(_)) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(2)
        }
    }
}
