//! One trading day's feature tensors and their lifecycle.
//!
//! Cells are 16-bit floats stored as `AtomicU16` bit patterns so that the
//! sequential workers (disjoint time-series feature columns, one asset
//! each) and the cross-sectional worker (disjoint cross-sectional
//! columns) can write the same tensor without locks. Cell stores are
//! relaxed; the per-worker progress counters carry the release/acquire
//! edge that makes producer writes visible to the cross-sectional reader.
//!
//! Lifecycle: `Unused -> InUse -> CsDone -> Flushing -> Unused`, one atomic
//! per tensor, no inverse edges.

use std::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};

use half::f16;
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};

use super::schema::{Level, LEVEL_COUNT};

/// Tensor pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TensorState {
    Unused = 0,
    InUse = 1,
    CsDone = 2,
    Flushing = 3,
}

impl TensorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TensorState::Unused,
            1 => TensorState::InUse,
            2 => TensorState::CsDone,
            3 => TensorState::Flushing,
            _ => unreachable!("tensor state out of range"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TensorState::Unused => "unused",
            TensorState::InUse => "in_use",
            TensorState::CsDone => "cs_done",
            TensorState::Flushing => "flushing",
        }
    }

    /// The single legal successor of each state.
    fn successor(self) -> TensorState {
        match self {
            TensorState::Unused => TensorState::InUse,
            TensorState::InUse => TensorState::CsDone,
            TensorState::CsDone => TensorState::Flushing,
            TensorState::Flushing => TensorState::Unused,
        }
    }
}

/// One level's `[T, F, A]` array plus its producer progress counters.
#[derive(Debug)]
pub struct LevelTensor {
    t: usize,
    f: usize,
    a: usize,
    cells: Vec<AtomicU16>,
    /// `progress[w]` = next time index worker `w` will write (monotone)
    progress: Vec<AtomicUsize>,
}

impl LevelTensor {
    fn new(level: Level, assets: usize, workers: usize) -> Self {
        let t = level.buckets_per_day();
        let f = level.field_count();
        let total = t * f * assets;
        let mut cells = Vec::with_capacity(total);
        cells.resize_with(total, || AtomicU16::new(0));
        let mut progress = Vec::with_capacity(workers);
        progress.resize_with(workers, || AtomicUsize::new(0));
        Self {
            t,
            f,
            a: assets,
            cells,
            progress,
        }
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.t, self.f, self.a)
    }

    /// `data[t*F*A + f*A + a]`
    #[inline(always)]
    fn offset(&self, t: usize, f: usize, a: usize) -> usize {
        debug_assert!(t < self.t && f < self.f && a < self.a);
        t * self.f * self.a + f * self.a + a
    }

    /// Time-series write: one instrument's feature slice at `(t, a)`,
    /// starting at feature `start`. Stride-A scatter.
    #[inline]
    pub fn write_ts(&self, t: usize, a: usize, start: usize, values: &[f32]) {
        for (i, &v) in values.iter().enumerate() {
            self.cells[self.offset(t, start + i, a)]
                .store(f16::from_f32(v).to_bits(), Ordering::Relaxed);
        }
    }

    /// Cross-sectional write: all assets of one feature at `t`.
    /// Contiguous stride-1 run.
    #[inline]
    pub fn write_cs(&self, t: usize, f: usize, values: &[f32]) {
        debug_assert_eq!(values.len(), self.a);
        let base = self.offset(t, f, 0);
        for (a, &v) in values.iter().enumerate() {
            self.cells[base + a].store(f16::from_f32(v).to_bits(), Ordering::Relaxed);
        }
    }

    /// Cross-sectional read: copy the contiguous `A`-length slab into
    /// `out`, widening to f32.
    #[inline]
    pub fn read_cs_slab(&self, t: usize, f: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.a);
        let base = self.offset(t, f, 0);
        for (a, slot) in out.iter_mut().enumerate() {
            *slot = f16::from_bits(self.cells[base + a].load(Ordering::Relaxed)).to_f32();
        }
    }

    /// Single-cell read.
    #[inline]
    pub fn read_cell(&self, t: usize, f: usize, a: usize) -> f32 {
        f16::from_bits(self.cells[self.offset(t, f, a)].load(Ordering::Relaxed)).to_f32()
    }

    /// Raw f16 bits of one cell (persistence).
    #[inline]
    pub(crate) fn cell_bits(&self, t: usize, f: usize, a: usize) -> u16 {
        self.cells[self.offset(t, f, a)].load(Ordering::Relaxed)
    }

    /// Advance one worker's progress counter to `next_t`. Release pairs
    /// with the acquire in [`LevelTensor::progress_min`].
    #[inline]
    pub fn advance_progress(&self, worker: usize, next_t: usize) {
        debug_assert!(next_t >= self.progress[worker].load(Ordering::Relaxed));
        self.progress[worker].store(next_t, Ordering::Release);
    }

    /// Minimum progress across all workers: time indexes strictly below
    /// this are fully produced.
    #[inline]
    pub fn progress_min(&self) -> usize {
        self.progress
            .iter()
            .map(|p| p.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    fn zero(&self) {
        for cell in &self.cells {
            cell.store(0, Ordering::Relaxed);
        }
        for p in &self.progress {
            p.store(0, Ordering::Relaxed);
        }
    }
}

/// All three levels for one trading date, plus the lifecycle state.
#[derive(Debug)]
pub struct DailyTensor {
    date: Mutex<String>,
    state: AtomicU8,
    levels: [LevelTensor; LEVEL_COUNT],
}

impl DailyTensor {
    /// Allocate a tensor for `assets` instruments and `workers` producers.
    /// Starts `Unused` with an empty date label.
    pub fn new(assets: usize, workers: usize) -> Self {
        Self {
            date: Mutex::new(String::new()),
            state: AtomicU8::new(TensorState::Unused as u8),
            levels: [
                LevelTensor::new(Level::L0, assets, workers),
                LevelTensor::new(Level::L1, assets, workers),
                LevelTensor::new(Level::L2, assets, workers),
            ],
        }
    }

    pub fn level(&self, level: Level) -> &LevelTensor {
        &self.levels[level.index()]
    }

    pub fn date(&self) -> String {
        self.date.lock().clone()
    }

    pub fn state(&self) -> TensorState {
        TensorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt the `from -> to` lifecycle edge. Only the four forward
    /// edges are legal; anything else is a protocol violation.
    pub fn try_transition(&self, from: TensorState, to: TensorState) -> Result<()> {
        if from.successor() != to {
            return Err(PipelineError::InvalidTensorTransition {
                date: self.date(),
                from: from.name(),
                to: to.name(),
            });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| PipelineError::InvalidTensorTransition {
                date: self.date(),
                from: TensorState::from_u8(actual).name(),
                to: to.name(),
            })?;
        Ok(())
    }

    /// Rebind a recycled tensor to a new date: zero every cell and
    /// progress counter, then take `Unused -> InUse`.
    pub fn rebind(&self, date: &str) -> Result<()> {
        self.try_transition(TensorState::Unused, TensorState::InUse)?;
        for level in &self.levels {
            level.zero();
        }
        *self.date.lock() = date.to_string();
        Ok(())
    }
}
