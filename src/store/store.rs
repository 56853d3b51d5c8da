//! The date-keyed tensor pool and on-disk persistence.
//!
//! A small pool of pre-allocated [`DailyTensor`]s cycles through dates:
//! producers take an `in_use` tensor keyed by date, the cross-sectional
//! worker marks it `cs_done`, and the IO worker flushes the *oldest*
//! complete date (the active map is insertion-ordered) before recycling
//! the tensor. Pool exhaustion is back-pressure, not an error: callers
//! back off and retry while the IO worker drains.
//!
//! File formats (host byte order, spec'd for same-machine research use):
//! - separate: `features_L{0,1,2}.bin`, each `(T, F, A)` as three u64s
//!   then the `[T, F, A]` f16 body.
//! - unified: `features.bin`, `[T_L0, F_L0+F_L1+F_L2, A]`, L1/L2 rows
//!   repeated at each L0 row's link index.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};

use super::schema::{field_offset, Level, LEVEL0_FIELDS};
use super::tensor::{DailyTensor, TensorState};

/// Output layout selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// One `features.bin` per day with L1/L2 upsampled through the links
    Unified,
    /// Three `features_L<n>.bin` files per day
    Separate,
}

struct PoolInner {
    /// Insertion order == date order: the IO worker flushes front-first.
    active: IndexMap<String, Arc<DailyTensor>>,
    free: Vec<Arc<DailyTensor>>,
}

/// Shared feature store for all workers.
pub struct FeatureStore {
    assets: usize,
    workers: usize,
    pool: Mutex<PoolInner>,
}

impl FeatureStore {
    /// Allocate a store for `assets` instruments, `workers` sequential
    /// producers and a recycling pool of `pool_size` day tensors.
    pub fn new(assets: usize, workers: usize, pool_size: usize) -> Self {
        let free = (0..pool_size.max(1))
            .map(|_| Arc::new(DailyTensor::new(assets, workers)))
            .collect();
        Self {
            assets,
            workers,
            pool: Mutex::new(PoolInner {
                active: IndexMap::new(),
                free,
            }),
        }
    }

    pub fn assets(&self) -> usize {
        self.assets
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Tensor for `date`, binding a recycled one on first touch.
    ///
    /// # Errors
    /// [`PipelineError::PoolExhausted`] when every pooled tensor is still
    /// in flight; the caller should back off and retry.
    pub fn tensor_for_date(&self, date: &str) -> Result<Arc<DailyTensor>> {
        let mut pool = self.pool.lock();
        if let Some(tensor) = pool.active.get(date) {
            return Ok(Arc::clone(tensor));
        }
        let tensor = pool
            .free
            .pop()
            .ok_or_else(|| PipelineError::PoolExhausted(format!("no free tensor for {date}")))?;
        tensor.rebind(date)?;
        pool.active.insert(date.to_string(), Arc::clone(&tensor));
        Ok(tensor)
    }

    /// Tensor for `date` if it is currently active.
    pub fn get(&self, date: &str) -> Option<Arc<DailyTensor>> {
        self.pool.lock().active.get(date).map(Arc::clone)
    }

    /// Dates currently bound, oldest first.
    pub fn active_dates(&self) -> Vec<String> {
        self.pool.lock().active.keys().cloned().collect()
    }

    /// Cross-sectional completion for a date: `in_use -> cs_done`.
    pub fn mark_cs_done(&self, date: &str) -> Result<()> {
        let tensor = self
            .get(date)
            .ok_or_else(|| PipelineError::StoreMisuse(format!("unknown date {date}")))?;
        tensor.try_transition(TensorState::InUse, TensorState::CsDone)
    }

    /// Flush the oldest `cs_done` tensor to disk and recycle it.
    /// Returns the flushed date, or `None` when nothing is ready.
    pub fn io_flush_once(&self, output_root: &Path, mode: PersistMode) -> Result<Option<String>> {
        let candidate = {
            let pool = self.pool.lock();
            pool.active
                .iter()
                .find(|(_, t)| t.state() == TensorState::CsDone)
                .map(|(date, t)| (date.clone(), Arc::clone(t)))
        };
        let Some((date, tensor)) = candidate else {
            return Ok(None);
        };

        tensor.try_transition(TensorState::CsDone, TensorState::Flushing)?;

        let dir = date_dir(output_root, &date)?;
        fs::create_dir_all(&dir)?;
        match mode {
            PersistMode::Separate => save_separate(&tensor, &dir)?,
            PersistMode::Unified => save_unified(&tensor, &dir)?,
        }

        tensor.try_transition(TensorState::Flushing, TensorState::Unused)?;

        let mut pool = self.pool.lock();
        pool.active.shift_remove(&date);
        pool.free.push(tensor);
        Ok(Some(date))
    }
}

/// `<root>/features/YYYY/MM/DD/` for a `YYYYMMDD` date string.
fn date_dir(root: &Path, date: &str) -> Result<PathBuf> {
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PipelineError::StoreMisuse(format!("bad date {date}")));
    }
    Ok(root
        .join("features")
        .join(&date[0..4])
        .join(&date[4..6])
        .join(&date[6..8]))
}

// ============================================================================
// Persistence
// ============================================================================

fn write_header(w: &mut impl Write, t: usize, f: usize, a: usize) -> Result<()> {
    w.write_all(&(t as u64).to_ne_bytes())?;
    w.write_all(&(f as u64).to_ne_bytes())?;
    w.write_all(&(a as u64).to_ne_bytes())?;
    Ok(())
}

/// Write the three per-level files.
pub fn save_separate(tensor: &DailyTensor, dir: &Path) -> Result<()> {
    for level in [Level::L0, Level::L1, Level::L2] {
        let lvl = tensor.level(level);
        let (t, f, a) = lvl.dims();
        let path = dir.join(format!("features_L{}.bin", level.index()));
        let mut w = BufWriter::new(File::create(path)?);
        write_header(&mut w, t, f, a)?;
        for ti in 0..t {
            for fi in 0..f {
                for ai in 0..a {
                    w.write_all(&lvl.cell_bits(ti, fi, ai).to_ne_bytes())?;
                }
            }
        }
        w.flush()?;
    }
    Ok(())
}

/// Write one `[T_L0, F_total, A]` file, upsampling L1/L2 rows through the
/// link features embedded in L0.
pub fn save_unified(tensor: &DailyTensor, dir: &Path) -> Result<()> {
    let l0 = tensor.level(Level::L0);
    let l1 = tensor.level(Level::L1);
    let l2 = tensor.level(Level::L2);
    let (t0, f0, a) = l0.dims();
    let (t1, f1, _) = l1.dims();
    let (t2, f2, _) = l2.dims();
    let f_total = f0 + f1 + f2;

    let link_minute = field_offset(LEVEL0_FIELDS, "link_minute")
        .ok_or_else(|| PipelineError::StoreMisuse("schema lacks link_minute".into()))?;
    let link_hour = field_offset(LEVEL0_FIELDS, "link_hour")
        .ok_or_else(|| PipelineError::StoreMisuse("schema lacks link_hour".into()))?;

    let path = dir.join("features.bin");
    let mut w = BufWriter::new(File::create(path)?);
    write_header(&mut w, t0, f_total, a)?;

    for t in 0..t0 {
        // L0 slab as stored.
        for f in 0..f0 {
            for ai in 0..a {
                w.write_all(&l0.cell_bits(t, f, ai).to_ne_bytes())?;
            }
        }
        // L1/L2 rows repeated at each asset's link index.
        for f in 0..f1 {
            for ai in 0..a {
                let lt = (l0.read_cell(t, link_minute, ai) as usize).min(t1 - 1);
                w.write_all(&l1.cell_bits(lt, f, ai).to_ne_bytes())?;
            }
        }
        for f in 0..f2 {
            for ai in 0..a {
                let lt = (l0.read_cell(t, link_hour, ai) as usize).min(t2 - 1);
                w.write_all(&l2.cell_bits(lt, f, ai).to_ne_bytes())?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

/// Read a feature file back: `((T, F, A), f16 bit patterns)`.
pub fn load_tensor_file(path: &Path) -> Result<((u64, u64, u64), Vec<u16>)> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;
    let t = u64::from_ne_bytes(header[0..8].try_into().expect("fixed size"));
    let f = u64::from_ne_bytes(header[8..16].try_into().expect("fixed size"));
    let a = u64::from_ne_bytes(header[16..24].try_into().expect("fixed size"));

    let expected = (t * f * a) as usize * 2;
    let mut body = Vec::with_capacity(expected);
    file.read_to_end(&mut body)?;
    if body.len() != expected {
        return Err(PipelineError::corrupt(
            "feature_file",
            format!("body {} bytes, header implies {expected}", body.len()),
        ));
    }

    let cells = body
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
    Ok(((t, f, a), cells))
}
