//! Encoding phase: supplier archives -> compressed per-(asset, date)
//! event logs.
//!
//! Workers drain a shared asset queue. Each worker walks its asset's
//! trading days in *shuffled* order so that concurrent workers spread
//! their pressure across different day archives instead of stampeding the
//! same one; extraction of any single archive is serialised by a
//! per-archive lock, and a temp-folder governor caps how many extracted
//! directories exist at once (disk-space back-pressure).
//!
//! Parsing the supplier's text files is an external concern: the phase
//! hands each extracted directory to a [`SupplierReader`] and encodes
//! whatever record batches come back. Per-pair failures never halt other
//! workers; they are aggregated into the phase report.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::codec::{write_orders_file, write_snapshots_file};
use crate::error::{PipelineError, Result};
use crate::types::{SnapshotRecord, TickEvent};

use super::{affinity, archive_path, PipelineConfig, SharedState, ShutdownFlag};

/// Parses one extracted supplier directory into normalized record
/// batches. Implementations own the text-format details (the supplier
/// ships three comma-separated tables per instrument per day: quote
/// snapshots, tick trades and tick orders; trades and orders merge into
/// one time-sorted event stream).
pub trait SupplierReader: Send + Sync {
    /// Read the snapshot and merged order/trade streams for one
    /// (asset, date) directory. Orders must come back sorted by time.
    fn read_day(
        &self,
        dir: &Path,
        asset_code: &str,
    ) -> Result<(Vec<SnapshotRecord>, Vec<TickEvent>)>;
}

/// Aggregated outcome of the encoding phase.
#[derive(Debug, Default)]
pub struct EncodingReport {
    pub encoded: usize,
    pub skipped: usize,
    /// (asset, date, error) for pairs that failed; reported at phase end.
    pub failed: Vec<(String, String, String)>,
}

impl EncodingReport {
    fn merge(&mut self, other: EncodingReport) {
        self.encoded += other.encoded;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

// ============================================================================
// Shared coordination
// ============================================================================

/// Per-archive extraction locks, created on first touch.
#[derive(Default)]
struct ArchiveLocks {
    locks: Mutex<AHashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ArchiveLocks {
    fn lock_for(&self, archive: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(archive.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Caps concurrently extracted temp folders. `acquire` spins with a short
/// sleep so a slow disk throttles the whole phase instead of filling up.
struct TempDirGovernor {
    in_flight: AtomicUsize,
    cap: usize,
}

impl TempDirGovernor {
    fn new(cap: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            cap,
        }
    }

    fn acquire(&self, shutdown: &ShutdownFlag) -> Result<GovernorGuard<'_>> {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current < self.cap {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(GovernorGuard { governor: self });
                }
                continue;
            }
            if shutdown.requested() {
                return Err(PipelineError::Shutdown);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct GovernorGuard<'a> {
    governor: &'a TempDirGovernor,
}

impl Drop for GovernorGuard<'_> {
    fn drop(&mut self) {
        self.governor.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Phase driver
// ============================================================================

/// Run the encoding phase to completion (or shutdown).
pub fn run_encoding_phase(
    state: &SharedState,
    config: &PipelineConfig,
    reader: &dyn SupplierReader,
    shutdown: &ShutdownFlag,
) -> Result<EncodingReport> {
    let (tx, rx) = unbounded::<usize>();
    for id in 0..state.assets.len() {
        tx.send(id).expect("queue open");
    }
    drop(tx);

    let locks = ArchiveLocks::default();
    let governor = TempDirGovernor::new(config.max_temp_dirs);
    let reports: Mutex<Vec<EncodingReport>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for worker in 0..config.encode_workers {
            let rx = rx.clone();
            let locks = &locks;
            let governor = &governor;
            let reports = &reports;
            scope.spawn(move || {
                if config.pin_cores {
                    affinity::pin_to_core(worker);
                }
                let report =
                    encoding_worker(state, config, reader, rx, locks, governor, shutdown);
                reports.lock().push(report);
            });
        }
    });

    let mut merged = EncodingReport::default();
    for r in reports.into_inner() {
        merged.merge(r);
    }

    if !merged.failed.is_empty() {
        log::warn!(
            "encoding phase: {} pair(s) failed, {} encoded, {} skipped",
            merged.failed.len(),
            merged.encoded,
            merged.skipped
        );
    } else {
        log::info!(
            "encoding phase: {} encoded, {} skipped",
            merged.encoded,
            merged.skipped
        );
    }
    Ok(merged)
}

fn encoding_worker(
    state: &SharedState,
    config: &PipelineConfig,
    reader: &dyn SupplierReader,
    queue: Receiver<usize>,
    locks: &ArchiveLocks,
    governor: &TempDirGovernor,
    shutdown: &ShutdownFlag,
) -> EncodingReport {
    let mut report = EncodingReport::default();
    let mut rng = rand::thread_rng();

    while let Ok(asset_id) = queue.recv() {
        if shutdown.requested() {
            break;
        }

        let (code, mut date_keys) = {
            let asset = state.assets[asset_id].lock();
            (asset.code.clone(), asset.dates.keys().cloned().collect::<Vec<_>>())
        };
        // Shuffle so parallel workers hit different day archives.
        date_keys.shuffle(&mut rng);

        for date in date_keys {
            if shutdown.requested() {
                break;
            }

            let (already_encoded, data_dir) = {
                let asset = state.assets[asset_id].lock();
                let info = &asset.dates[&date];
                (info.encoded, info.data_dir.clone())
            };
            if already_encoded && config.skip_existing {
                report.skipped += 1;
                continue;
            }

            match encode_pair(
                state, config, reader, locks, governor, shutdown, asset_id, &code, &date,
                &data_dir,
            ) {
                Ok(true) => report.encoded += 1,
                Ok(false) => report.skipped += 1,
                Err(PipelineError::Shutdown) => break,
                Err(e) => {
                    log::warn!("encode failed for {code} {date}: {e}");
                    report.failed.push((code.clone(), date.clone(), e.to_string()));
                }
            }
        }
    }
    report
}

#[allow(clippy::too_many_arguments)]
fn encode_pair(
    state: &SharedState,
    config: &PipelineConfig,
    reader: &dyn SupplierReader,
    locks: &ArchiveLocks,
    governor: &TempDirGovernor,
    shutdown: &ShutdownFlag,
    asset_id: usize,
    code: &str,
    date: &str,
    data_dir: &Path,
) -> Result<bool> {
    // A directory left by a previous extraction is used as-is.
    if !data_dir.is_dir() {
        let archive = archive_path(&config.archive_base, date, &config.archive_ext);
        if !archive.is_file() {
            return Ok(false);
        }
        let _governor = governor.acquire(shutdown)?;
        let archive_lock = locks.lock_for(&archive);
        let _extraction = archive_lock.lock();
        extract_from_archive(config, &archive, code, date, data_dir)?;
    }

    let (snapshots, orders) = reader.read_day(data_dir, code)?;

    let snapshots_file = write_snapshots_file(data_dir, code, &snapshots)?;
    let orders_file = write_orders_file(data_dir, code, &orders)?;

    if config.cleanup_after_encode {
        remove_non_binaries(data_dir);
    }

    let mut asset = state.assets[asset_id].lock();
    let info = asset.dates.get_mut(date).expect("date key from this asset");
    info.order_count = orders.len();
    info.snapshots_file = Some(snapshots_file);
    info.orders_file = Some(orders_file);
    info.encoded = true;
    Ok(true)
}

/// Invoke the external unpacker for one asset's folder inside a day
/// archive, then move it into its final location.
fn extract_from_archive(
    config: &PipelineConfig,
    archive: &Path,
    code: &str,
    date: &str,
    data_dir: &Path,
) -> Result<()> {
    let parent = data_dir
        .parent()
        .ok_or_else(|| PipelineError::generic("data dir has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let temp_dir = parent.join(format!("tmp_{code}_{date}"));
    std::fs::create_dir_all(&temp_dir)?;

    let member = format!("{date}/{code}/*");
    let status = Command::new(&config.unpack_tool)
        .args(&config.unpack_args)
        .arg(archive)
        .arg(&member)
        .arg(&temp_dir)
        .arg("-y")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let cleanup = |e: PipelineError| {
        let _ = std::fs::remove_dir_all(&temp_dir);
        e
    };

    let status = status.map_err(|e| {
        cleanup(PipelineError::Input {
            asset: code.to_string(),
            date: date.to_string(),
            detail: format!("unpacker spawn failed: {e}"),
        })
    })?;
    if !status.success() {
        return Err(cleanup(PipelineError::Input {
            asset: code.to_string(),
            date: date.to_string(),
            detail: format!("unpacker exited with {status}"),
        }));
    }

    let extracted = temp_dir.join(date).join(code);
    if !extracted.is_dir() {
        return Err(cleanup(PipelineError::Input {
            asset: code.to_string(),
            date: date.to_string(),
            detail: "archive did not contain the asset directory".to_string(),
        }));
    }

    if data_dir.exists() {
        std::fs::remove_dir_all(data_dir)?;
    }
    std::fs::rename(&extracted, data_dir)?;
    std::fs::remove_dir_all(&temp_dir)?;
    Ok(())
}

fn remove_non_binaries(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_bin = path
            .extension()
            .map_or(false, |e| e == "bin");
        if path.is_file() && !is_bin {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CatalogEntry, InstrumentCatalog};
    use crate::types::Side;
    use std::fs;

    struct StubReader;

    impl SupplierReader for StubReader {
        fn read_day(
            &self,
            dir: &Path,
            asset_code: &str,
        ) -> Result<(Vec<SnapshotRecord>, Vec<TickEvent>)> {
            // Fail on demand so tests can exercise the failure path.
            if dir.join("poison").exists() {
                return Err(PipelineError::Input {
                    asset: asset_code.to_string(),
                    date: "?".to_string(),
                    detail: "poisoned".to_string(),
                });
            }
            let orders = vec![
                TickEvent::maker(Side::Bid, 1, 1000, 10),
                TickEvent::maker(Side::Ask, 2, 1001, 5),
                TickEvent::taker(Side::Bid, 3, 2, 1001, 5),
            ];
            Ok((vec![SnapshotRecord::default()], orders))
        }
    }

    fn setup(tag: &str, dates: &[&str]) -> (PathBuf, PipelineConfig, SharedState) {
        let root = std::env::temp_dir().join(format!("encoding_{}_{}", std::process::id(), tag));
        let _ = fs::remove_dir_all(&root);
        let db = root.join("db");

        // Pre-extracted directories stand in for archive extraction.
        for date in dates {
            fs::create_dir_all(super::super::asset_date_dir(&db, date, "600519")).unwrap();
        }

        let config = PipelineConfig {
            start_date: dates.first().unwrap().to_string(),
            end_date: dates.last().unwrap().to_string(),
            archive_base: root.join("archives"),
            database_base: db,
            encode_workers: 2,
            pin_cores: false,
            ..Default::default()
        };
        let catalog = InstrumentCatalog {
            entries: vec![CatalogEntry {
                code: "600519".into(),
                name: "test".into(),
                list_date: "20200101".into(),
                delist_date: None,
            }],
        };
        let state = SharedState::initialize(&config, &catalog).unwrap();
        (root, config, state)
    }

    #[test]
    fn test_phase_encodes_preextracted_pairs() {
        let (root, config, state) = setup("ok", &["20240102", "20240103"]);
        let shutdown = ShutdownFlag::new();

        let report = run_encoding_phase(&state, &config, &StubReader, &shutdown).unwrap();
        assert_eq!(report.encoded, 2);
        assert!(report.failed.is_empty());

        let asset = state.assets[0].lock();
        for date in ["20240102", "20240103"] {
            let info = &asset.dates[date];
            assert!(info.encoded);
            assert_eq!(info.order_count, 3);
            assert!(info.orders_file.as_ref().unwrap().exists());
            assert!(info.snapshots_file.as_ref().unwrap().exists());
            // Filename embeds the record count.
            assert!(info
                .orders_file
                .as_ref()
                .unwrap()
                .to_str()
                .unwrap()
                .ends_with("600519_orders_3.bin"));
        }
        drop(asset);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_pair_failure_does_not_halt_phase() {
        let (root, config, state) = setup("poison", &["20240102", "20240103"]);
        // Poison one pair; the other must still encode.
        let dir = {
            let asset = state.assets[0].lock();
            asset.dates["20240102"].data_dir.clone()
        };
        fs::write(dir.join("poison"), b"x").unwrap();

        let shutdown = ShutdownFlag::new();
        let report = run_encoding_phase(&state, &config, &StubReader, &shutdown).unwrap();
        assert_eq!(report.encoded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].1, "20240102");

        let asset = state.assets[0].lock();
        assert!(!asset.dates["20240102"].encoded);
        assert!(asset.dates["20240103"].encoded);
        drop(asset);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_skip_existing_on_rerun() {
        let (root, config, state) = setup("rerun", &["20240102"]);
        let shutdown = ShutdownFlag::new();

        let first = run_encoding_phase(&state, &config, &StubReader, &shutdown).unwrap();
        assert_eq!(first.encoded, 1);

        let second = run_encoding_phase(&state, &config, &StubReader, &shutdown).unwrap();
        assert_eq!(second.encoded, 0);
        assert_eq!(second.skipped, 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_governor_caps_inflight() {
        let governor = TempDirGovernor::new(2);
        let shutdown = ShutdownFlag::new();
        let a = governor.acquire(&shutdown).unwrap();
        let _b = governor.acquire(&shutdown).unwrap();
        assert_eq!(governor.in_flight.load(Ordering::Acquire), 2);

        // A third acquire under shutdown aborts instead of waiting forever.
        shutdown.request();
        assert!(matches!(
            governor.acquire(&shutdown),
            Err(PipelineError::Shutdown)
        ));

        drop(a);
        assert_eq!(governor.in_flight.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_archive_locks_are_per_path() {
        let locks = ArchiveLocks::default();
        let a1 = locks.lock_for(Path::new("/a/x.rar"));
        let a2 = locks.lock_for(Path::new("/a/x.rar"));
        let b = locks.lock_for(Path::new("/a/y.rar"));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        // Same archive serialises; different archives are independent.
        let _held = a1.lock();
        assert!(a2.try_lock().is_none());
        assert!(b.try_lock().is_some());
    }
}
