//! Pipeline orchestration: shared state, configuration and the worker
//! phases.
//!
//! The pipeline runs in two stages. The *encoding* stage turns day-packed
//! supplier archives into compressed per-(asset, date) event logs; the
//! *analysis* stage replays those logs through per-instrument books,
//! producing the feature tensors, with the cross-sectional and IO workers
//! running concurrently against the progress fence.
//!
//! All shared bookkeeping lives in [`SharedState`]: per-asset, per-date
//! file paths and status bits written once by the encoding phase and read
//! lock-free afterwards.

pub mod affinity;
pub mod cross_section;
pub mod encoding;
pub mod io;
pub mod sequential;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::extract_count_from_filename;
use crate::error::{PipelineError, Result};
use crate::store::{FeatureStore, PersistMode};
use crate::types::Venue;

pub use cross_section::CrossSectionReport;
pub use encoding::{EncodingReport, SupplierReader};
pub use sequential::SequentialReport;

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline configuration. All paths and tunables are explicit; nothing
/// is read from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Inclusive `YYYYMMDD` date range.
    pub start_date: String,
    pub end_date: String,

    /// Root of the day-packed archive tree `YYYY/YYYYMM/YYYYMMDD.<ext>`.
    pub archive_base: PathBuf,
    /// Root of the encoded per-(asset, date) binary tree.
    pub database_base: PathBuf,
    /// Root for feature output (`<output>/features/...`).
    pub output_base: PathBuf,

    pub encode_workers: usize,
    pub sequential_workers: usize,

    /// Cap on concurrently extracted temp folders (disk-space governor).
    pub max_temp_dirs: usize,
    /// Day tensors kept in the recycling pool.
    pub tensor_pool_size: usize,
    pub persist_mode: PersistMode,

    /// Archive format and the external unpacker invocation.
    pub archive_ext: String,
    pub unpack_tool: String,
    pub unpack_args: Vec<String>,

    /// Skip (asset, date) pairs whose binaries already exist.
    pub skip_existing: bool,
    /// Remove extracted text files once encoded.
    pub cleanup_after_encode: bool,

    /// Pin workers to cores when the platform supports it.
    pub pin_cores: bool,
    /// Leftover call-auction makers flush at reported price at 09:30.
    pub flush_auction_at_reported_price: bool,
    /// Expected per-day order count used to size book lookups.
    pub expected_orders_per_day: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start_date: String::new(),
            end_date: String::new(),
            archive_base: PathBuf::new(),
            database_base: PathBuf::new(),
            output_base: PathBuf::from("output"),
            encode_workers: 4,
            sequential_workers: 4,
            max_temp_dirs: 8,
            tensor_pool_size: 3,
            persist_mode: PersistMode::Separate,
            archive_ext: "rar".to_string(),
            unpack_tool: "unrar".to_string(),
            unpack_args: vec!["x".to_string()],
            skip_existing: true,
            cleanup_after_encode: false,
            pin_cores: true,
            flush_auction_at_reported_price: true,
            expected_orders_per_day: 65_536,
        }
    }
}

fn is_yyyymmdd(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

impl PipelineConfig {
    /// Validate before any work starts; configuration errors are global
    /// failures.
    pub fn validate(&self) -> Result<()> {
        if !is_yyyymmdd(&self.start_date) || !is_yyyymmdd(&self.end_date) {
            return Err(PipelineError::Config(format!(
                "dates must be YYYYMMDD, got '{}'..'{}'",
                self.start_date, self.end_date
            )));
        }
        if self.start_date > self.end_date {
            return Err(PipelineError::Config("start date after end date".into()));
        }
        if self.encode_workers == 0 || self.sequential_workers == 0 {
            return Err(PipelineError::Config("worker counts must be nonzero".into()));
        }
        if self.max_temp_dirs == 0 {
            return Err(PipelineError::Config("max_temp_dirs must be nonzero".into()));
        }
        if self.tensor_pool_size == 0 {
            return Err(PipelineError::Config("tensor_pool_size must be nonzero".into()));
        }
        if self.database_base.as_os_str().is_empty() {
            return Err(PipelineError::Config("database_base is required".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Instrument catalog
// ============================================================================

/// One catalog entry as supplied by the research configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub code: String,
    pub name: String,
    pub list_date: String,
    /// `None` = still listed at the end of the horizon.
    #[serde(default)]
    pub delist_date: Option<String>,
}

/// Instrument catalog: code -> (name, listing window).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentCatalog {
    pub entries: Vec<CatalogEntry>,
}

impl InstrumentCatalog {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ============================================================================
// Paths
// ============================================================================

/// `<base>/YYYY/YYYYMM/YYYYMMDD.<ext>`
pub fn archive_path(base: &Path, date: &str, ext: &str) -> PathBuf {
    base.join(&date[0..4])
        .join(&date[0..6])
        .join(format!("{date}.{ext}"))
}

/// `<base>/YYYY/MM/DD/<asset>`
pub fn asset_date_dir(base: &Path, date: &str, asset: &str) -> PathBuf {
    base.join(&date[0..4])
        .join(&date[4..6])
        .join(&date[6..8])
        .join(asset)
}

// ============================================================================
// Shared state
// ============================================================================

/// Per-(asset, date) bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct DateInfo {
    /// Order count, learned at encode time or from the filename on resume.
    pub order_count: usize,
    pub encoded: bool,
    pub analyzed: bool,
    /// Encoded binary directory for this pair.
    pub data_dir: PathBuf,
    pub snapshots_file: Option<PathBuf>,
    pub orders_file: Option<PathBuf>,
}

impl DateInfo {
    pub fn has_binaries(&self) -> bool {
        self.snapshots_file.is_some() || self.orders_file.is_some()
    }
}

/// One instrument's immutable metadata plus per-date status.
#[derive(Debug)]
pub struct AssetInfo {
    pub id: usize,
    pub code: String,
    pub name: String,
    pub venue: Venue,
    pub list_date: String,
    pub delist_date: Option<String>,
    /// Sorted by date (BTreeMap keys).
    pub dates: BTreeMap<String, DateInfo>,
    /// Sequential-phase worker assignment.
    pub assigned_worker: Option<usize>,
}

impl AssetInfo {
    pub fn total_order_count(&self) -> usize {
        self.dates.values().map(|d| d.order_count).sum()
    }

    pub fn encoded_count(&self) -> usize {
        self.dates.values().filter(|d| d.encoded).count()
    }

    pub fn missing_dates(&self) -> Vec<String> {
        self.dates
            .iter()
            .filter(|(_, d)| !d.encoded)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Scan `data_dir` for binaries left by a previous run.
    fn scan_existing_binaries(&mut self) {
        for info in self.dates.values_mut() {
            let Ok(entries) = fs::read_dir(&info.data_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.ends_with(".bin") {
                    continue;
                }
                if name.starts_with(&format!("{}_snapshots_", self.code)) {
                    info.snapshots_file = Some(path);
                } else if name.starts_with(&format!("{}_orders_", self.code)) {
                    info.order_count = extract_count_from_filename(&path)
                        .unwrap_or(0) as usize;
                    info.orders_file = Some(path);
                }
            }
            if info.has_binaries() {
                info.encoded = true;
            }
        }
    }
}

/// All assets plus the global trading-date sequence. Assets are wrapped
/// in mutexes so encoding workers can update their own entries while the
/// registry itself stays shared.
pub struct SharedState {
    pub assets: Vec<Mutex<AssetInfo>>,
    pub all_dates: Vec<String>,
}

impl SharedState {
    /// Build from the catalog and the filesystem: collect trading dates
    /// (from archives, falling back to encoded binaries), filter by the
    /// configured range and each instrument's listing window, set up
    /// per-pair paths and scan for resume state.
    pub fn initialize(config: &PipelineConfig, catalog: &InstrumentCatalog) -> Result<Self> {
        let mut dates = collect_dates_from_archives(&config.archive_base);
        if dates.is_empty() {
            dates = collect_dates_from_binaries(&config.database_base);
        }
        dates.retain(|d| *d >= config.start_date && *d <= config.end_date);
        dates.sort();
        dates.dedup();

        if dates.is_empty() {
            return Err(PipelineError::Config(format!(
                "no trading dates found in {}..{}",
                config.start_date, config.end_date
            )));
        }

        let mut assets = Vec::with_capacity(catalog.entries.len());
        for (id, entry) in catalog.entries.iter().enumerate() {
            let mut asset = AssetInfo {
                id,
                code: entry.code.clone(),
                name: entry.name.clone(),
                venue: Venue::from_instrument_code(&entry.code),
                list_date: entry.list_date.clone(),
                delist_date: entry.delist_date.clone(),
                dates: BTreeMap::new(),
                assigned_worker: None,
            };
            for date in &dates {
                let listed = *date >= asset.list_date
                    && asset.delist_date.as_ref().map_or(true, |d| date <= d);
                if listed {
                    asset.dates.insert(
                        date.clone(),
                        DateInfo {
                            data_dir: asset_date_dir(&config.database_base, date, &asset.code),
                            ..Default::default()
                        },
                    );
                }
            }
            asset.scan_existing_binaries();
            assets.push(Mutex::new(asset));
        }

        Ok(Self {
            assets,
            all_dates: dates,
        })
    }

    pub fn total_pairs(&self) -> usize {
        self.assets.iter().map(|a| a.lock().dates.len()).sum()
    }

    pub fn total_encoded(&self) -> usize {
        self.assets.iter().map(|a| a.lock().encoded_count()).sum()
    }
}

fn collect_dates_from_archives(base: &Path) -> Vec<String> {
    let mut dates = Vec::new();
    let Ok(years) = fs::read_dir(base) else {
        return dates;
    };
    for year in years.flatten() {
        let Ok(months) = fs::read_dir(year.path()) else {
            continue;
        };
        for month in months.flatten() {
            let Ok(files) = fs::read_dir(month.path()) else {
                continue;
            };
            for file in files.flatten() {
                if let Some(stem) = file.path().file_stem().and_then(|s| s.to_str()) {
                    if is_yyyymmdd(stem) {
                        dates.push(stem.to_string());
                    }
                }
            }
        }
    }
    dates
}

fn collect_dates_from_binaries(base: &Path) -> Vec<String> {
    let mut dates = Vec::new();
    let Ok(years) = fs::read_dir(base) else {
        return dates;
    };
    for year in years.flatten() {
        let year_str = year.file_name().to_string_lossy().to_string();
        let Ok(months) = fs::read_dir(year.path()) else {
            continue;
        };
        for month in months.flatten() {
            let month_str = month.file_name().to_string_lossy().to_string();
            let Ok(days) = fs::read_dir(month.path()) else {
                continue;
            };
            for day in days.flatten() {
                if !day.path().is_dir() {
                    continue;
                }
                let day_str = day.file_name().to_string_lossy().to_string();
                let date = format!("{year_str}{month_str}{day_str}");
                if is_yyyymmdd(&date) {
                    dates.push(date);
                }
            }
        }
    }
    dates
}

// ============================================================================
// Shutdown
// ============================================================================

/// Process-wide cooperative shutdown flag. Worker loops check it at
/// iteration boundaries; nothing is interrupted mid-pair.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Install a SIGINT handler that trips the flag.
    pub fn install_sigint(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            log::warn!("SIGINT received, draining workers");
            flag.request();
        })
        .map_err(|e| PipelineError::Config(format!("signal handler: {e}")))
    }
}

// ============================================================================
// Analysis orchestration
// ============================================================================

/// Combined report of the analysis stage.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    pub sequential: SequentialReport,
    pub cross_section: CrossSectionReport,
    pub dates_flushed: usize,
}

/// Run the sequential, cross-sectional and IO workers concurrently over
/// the encoded event logs. Returns once every date is flushed (or
/// shutdown was requested).
pub fn run_analysis(
    state: &SharedState,
    config: &PipelineConfig,
    store: &FeatureStore,
    shutdown: &ShutdownFlag,
) -> Result<AnalysisReport> {
    sequential::assign_workers_lpt(state, config.sequential_workers);

    let mut report = AnalysisReport::default();
    let seq_results: Mutex<Vec<SequentialReport>> = Mutex::new(Vec::new());
    let cs_result: Mutex<Option<Result<CrossSectionReport>>> = Mutex::new(None);
    let io_result: Mutex<Result<usize>> = Mutex::new(Ok(0));

    thread::scope(|scope| {
        for worker in 0..config.sequential_workers {
            let seq_results = &seq_results;
            scope.spawn(move || {
                let r = sequential::run_sequential_worker(state, config, store, worker, shutdown);
                seq_results.lock().push(r);
            });
        }

        {
            let cs_result = &cs_result;
            scope.spawn(move || {
                let r = cross_section::run_cross_section_worker(
                    state, config, store, shutdown,
                );
                if r.is_err() {
                    shutdown.request();
                }
                *cs_result.lock() = Some(r);
            });
        }

        {
            let io_result = &io_result;
            let total_dates = state.all_dates.len();
            scope.spawn(move || {
                let r = io::run_io_worker(store, config, total_dates, shutdown);
                if r.is_err() {
                    shutdown.request();
                }
                *io_result.lock() = r;
            });
        }
    });

    for r in seq_results.into_inner() {
        report.sequential.merge(r);
    }
    if let Some(cs) = cs_result.into_inner() {
        report.cross_section = cs?;
    }
    report.dates_flushed = io_result.into_inner()?;
    Ok(report)
}
