//! Cross-sectional phase: consume the progress fence and compute
//! across-instrument transforms.
//!
//! The worker follows dates in global order. For each time slot it polls
//! the per-worker progress minima (bounded 1 ms sleep) until every
//! producer has written past the slot, then computes rank / z-score /
//! inverse-normal transforms over the contiguous asset slab and writes
//! the results into the cross-sectional feature range. It never takes a
//! producer's lock; the fence is the entire synchronisation protocol.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::store::schema::{
    field_offset, kind_range, FieldKind, Level, Normalization, LEVEL0_FIELDS, LEVEL1_FIELDS,
};
use crate::store::tensor::LevelTensor;
use crate::store::FeatureStore;

use super::{PipelineConfig, SharedState, ShutdownFlag};

/// Bounded polling interval against the progress counters.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of the cross-sectional phase.
#[derive(Debug, Default)]
pub struct CrossSectionReport {
    pub dates_completed: usize,
    pub slots_processed: u64,
}

/// `(source field, destination field)` pairs per level; the destination's
/// declared normalization picks the transform.
const L0_DERIVATIONS: &[(&str, &str)] = &[
    ("spread", "cs_spread_rank"),
    ("tob_imbalance", "cs_imbalance_z"),
];
const L1_DERIVATIONS: &[(&str, &str)] = &[("vwap", "cs_vwap_rank")];

/// Run the cross-sectional worker across all dates.
pub fn run_cross_section_worker(
    state: &SharedState,
    config: &PipelineConfig,
    store: &FeatureStore,
    shutdown: &ShutdownFlag,
) -> Result<CrossSectionReport> {
    let _ = config;
    let mut report = CrossSectionReport::default();

    for date in &state.all_dates {
        // Wait for a sequential worker to bind the date.
        let tensor = loop {
            if let Some(t) = store.get(date) {
                break t;
            }
            if shutdown.requested() {
                return Ok(report);
            }
            thread::sleep(POLL_INTERVAL);
        };

        for (level, table, derivations) in [
            (Level::L0, LEVEL0_FIELDS, L0_DERIVATIONS),
            (Level::L1, LEVEL1_FIELDS, L1_DERIVATIONS),
        ] {
            let lvl = tensor.level(level);
            let valid_field = field_offset(table, "asset_valid").expect("schema has asset_valid");
            let cs_range = kind_range(table, FieldKind::CrossSectional);

            for t in 0..level.buckets_per_day() {
                // Fence: every producer must have written past t.
                while lvl.progress_min() <= t {
                    if shutdown.requested() {
                        return Ok(report);
                    }
                    thread::sleep(POLL_INTERVAL);
                }

                if cs_range.is_some() {
                    compute_slot(lvl, table, derivations, valid_field, t, store.assets());
                }
                report.slots_processed += 1;
            }
        }

        // L2 carries no cross-sectional fields, but the date is complete
        // only once its producers are done too.
        let l2 = tensor.level(Level::L2);
        while l2.progress_min() < Level::L2.buckets_per_day() {
            if shutdown.requested() {
                return Ok(report);
            }
            thread::sleep(POLL_INTERVAL);
        }

        store.mark_cs_done(date)?;
        report.dates_completed += 1;
        log::debug!("cross-section complete for {date}");
    }
    Ok(report)
}

/// Compute every derived cross-sectional feature for one `(level, t)`.
fn compute_slot(
    lvl: &LevelTensor,
    table: &[crate::store::schema::FieldDef],
    derivations: &[(&str, &str)],
    valid_field: usize,
    t: usize,
    assets: usize,
) {
    let mut valid_flags = vec![0.0f32; assets];
    lvl.read_cs_slab(t, valid_field, &mut valid_flags);
    let valid: Vec<usize> = valid_flags
        .iter()
        .enumerate()
        .filter(|(_, &v)| v > 0.5)
        .map(|(a, _)| a)
        .collect();
    if valid.is_empty() {
        return;
    }

    let mut input = vec![0.0f32; assets];
    let mut output = vec![0.0f32; assets];

    for &(src, dst) in derivations {
        let src_idx = field_offset(table, src).expect("derivation source declared");
        let dst_idx = field_offset(table, dst).expect("derivation target declared");

        lvl.read_cs_slab(t, src_idx, &mut input);
        output.fill(0.0);
        match table[dst_idx].normalization {
            Normalization::RankNormal => rank_inverse_normal(&input, &valid, &mut output),
            Normalization::ZScore => zscore(&input, &valid, &mut output),
            Normalization::None => output[..].copy_from_slice(&input),
        }
        lvl.write_cs(t, dst_idx, &output);
    }
}

// ============================================================================
// Transforms
// ============================================================================

/// Inverse normal CDF (Beasley-Springer-Moro approximation).
pub fn inverse_normal_cdf(p: f32) -> f32 {
    const A0: f32 = 2.506_628_2;
    const A1: f32 = -18.615_f32;
    const A2: f32 = 41.391_197;
    const A3: f32 = -25.441_06;
    const B0: f32 = -8.473_511;
    const B1: f32 = 23.083_368;
    const B2: f32 = -21.062_241;
    const B3: f32 = 3.130_829;

    let q = p - 0.5;
    if q.abs() <= 0.425 {
        let r = 0.180_625 - q * q;
        return q * (((A3 * r + A2) * r + A1) * r + A0)
            / ((((B3 * r + B2) * r + B1) * r + B0) * r + 1.0);
    }

    let r = if q < 0.0 { p } else { 1.0 - p };
    let r = (-r.ln()).sqrt();
    let sign = if q < 0.0 { -1.0 } else { 1.0 };
    sign * (2.515_517 + 0.802_853 * r + 0.010_328 * r * r)
        / (1.0 + 1.432_788 * r + 0.189_269 * r * r + 0.001_308 * r * r * r)
}

/// Rank the valid entries and map percentiles through the inverse normal
/// CDF. Invalid entries stay at zero.
pub fn rank_inverse_normal(input: &[f32], valid: &[usize], output: &mut [f32]) {
    let n = valid.len();
    if n == 0 {
        return;
    }
    let mut indexed: Vec<(f32, usize)> = valid.iter().map(|&a| (input[a], a)).collect();
    indexed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    for (rank, &(_, asset)) in indexed.iter().enumerate() {
        let percentile = (rank as f32 + 0.5) / n as f32;
        output[asset] = inverse_normal_cdf(percentile);
    }
}

/// Cross-sectional z-score over the valid entries. Invalid entries stay
/// at zero.
pub fn zscore(input: &[f32], valid: &[usize], output: &mut [f32]) {
    let n = valid.len();
    if n == 0 {
        return;
    }
    let mean = valid.iter().map(|&a| input[a] as f64).sum::<f64>() / n as f64;
    let var = valid
        .iter()
        .map(|&a| {
            let d = input[a] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    let stddev = var.sqrt();

    for &a in valid {
        output[a] = if stddev > 1e-8 {
            ((input[a] as f64 - mean) / stddev) as f32
        } else {
            0.0
        };
    }
}
