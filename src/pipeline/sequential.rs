//! Sequential phase: replay encoded order streams through per-instrument
//! books and produce time-series features.
//!
//! Assets are bucketed onto workers by accumulated order count (greedy
//! longest-processing-time-first), then every worker visits dates in the
//! *global* order so the cross-sectional consumer can follow one date at
//! a time. Within a date a worker replays its assets one after another;
//! its per-level progress counter carries the minimum position across its
//! assets, which is what the fence protocol requires.
//!
//! A panic while replaying one (asset, date) pair is caught, converted
//! into a failed pair, and the book is rebuilt; a defective tape never
//! takes down the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;

use crate::codec::decode_orders_file;
use crate::error::PipelineError;
use crate::lob::{Book, BookConfig, FeatureSink, RunBar};
use crate::store::schema::{
    kind_range, time_index, FieldKind, Level, Level0Row, Level1Row, Level2Row, LEVEL0_FIELDS,
    LEVEL1_FIELDS, LEVEL2_FIELDS,
};
use crate::store::tensor::DailyTensor;
use crate::store::FeatureStore;
use crate::types::{EventKind, TickEvent};

use super::{affinity, PipelineConfig, SharedState, ShutdownFlag};

/// Aggregated outcome of the sequential phase.
#[derive(Debug, Default)]
pub struct SequentialReport {
    pub pairs_processed: usize,
    pub orders_processed: u64,
    /// (asset, date, error) for pairs that failed
    pub failed: Vec<(String, String, String)>,
}

impl SequentialReport {
    pub fn merge(&mut self, other: SequentialReport) {
        self.pairs_processed += other.pairs_processed;
        self.orders_processed += other.orders_processed;
        self.failed.extend(other.failed);
    }
}

// ============================================================================
// Worker assignment
// ============================================================================

/// Greedy LPT: sort assets by accumulated order count descending and
/// always hand the next one to the least-loaded worker.
pub fn assign_workers_lpt(state: &SharedState, workers: usize) {
    let mut order: Vec<(usize, usize)> = state
        .assets
        .iter()
        .enumerate()
        .map(|(id, a)| (id, a.lock().total_order_count()))
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut load = vec![0usize; workers];
    for (asset_id, weight) in order {
        let lightest = load
            .iter()
            .enumerate()
            .min_by_key(|(_, &l)| l)
            .map(|(w, _)| w)
            .expect("workers > 0");
        load[lightest] += weight.max(1);
        state.assets[asset_id].lock().assigned_worker = Some(lightest);
    }
}

// ============================================================================
// Feature production
// ============================================================================

/// Per-(asset, date) producer: turns accepted events into L0 rows and
/// aggregates them into L1/L2 rows, writing each bucket as the stream
/// moves past it. Field formulas here are the small demonstration set;
/// the substrate (bucketing, links, disjoint write ranges, progress) is
/// the contract.
struct FeatureProducer {
    tensor: Arc<DailyTensor>,
    asset: usize,

    l0_t: usize,
    l0_row: Level0Row,
    l0_active: bool,

    l1_t: usize,
    l1_row: Level1Row,
    l1_vwap_value: f64,
    l1_vwap_volume: f64,
    l1_active: bool,

    l2_t: usize,
    l2_row: Level2Row,
    l2_vwap_value: f64,
    l2_vwap_volume: f64,
    l2_minute_closes: Vec<f32>,
    l2_active: bool,

    /// L0 buckets fully written (everything below this index is final).
    position: usize,
}

impl FeatureProducer {
    fn new(tensor: Arc<DailyTensor>, asset: usize) -> Self {
        Self {
            tensor,
            asset,
            l0_t: 0,
            l0_row: Level0Row::default(),
            l0_active: false,
            l1_t: 0,
            l1_row: Level1Row::default(),
            l1_vwap_value: 0.0,
            l1_vwap_volume: 0.0,
            l1_active: false,
            l2_t: 0,
            l2_row: Level2Row::default(),
            l2_vwap_value: 0.0,
            l2_vwap_volume: 0.0,
            l2_minute_closes: Vec::with_capacity(60),
            l2_active: false,
            position: 0,
        }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn flush_l0(&mut self) {
        if !self.l0_active {
            return;
        }
        let mut cells = [0.0f32; Level0Row::FIELD_COUNT];
        self.l0_row.write_to(&mut cells);

        let lvl = self.tensor.level(Level::L0);
        let ts = kind_range(LEVEL0_FIELDS, FieldKind::TimeSeries).expect("schema has TS fields");
        let meta = kind_range(LEVEL0_FIELDS, FieldKind::Meta).expect("schema has meta fields");
        lvl.write_ts(self.l0_t, self.asset, ts.start, &cells[ts.clone()]);
        lvl.write_ts(self.l0_t, self.asset, meta.start, &cells[meta.clone()]);
        self.l0_active = false;
    }

    fn flush_l1(&mut self) {
        if !self.l1_active {
            return;
        }
        if self.l1_vwap_volume > 0.0 {
            self.l1_row.vwap = (self.l1_vwap_value / self.l1_vwap_volume) as f32;
        }
        let mut cells = [0.0f32; Level1Row::FIELD_COUNT];
        self.l1_row.write_to(&mut cells);

        let lvl = self.tensor.level(Level::L1);
        let ts = kind_range(LEVEL1_FIELDS, FieldKind::TimeSeries).expect("schema has TS fields");
        let meta = kind_range(LEVEL1_FIELDS, FieldKind::Meta).expect("schema has meta fields");
        lvl.write_ts(self.l1_t, self.asset, ts.start, &cells[ts.clone()]);
        lvl.write_ts(self.l1_t, self.asset, meta.start, &cells[meta.clone()]);

        self.l2_minute_closes.push(self.l1_row.close);
        self.l1_row = Level1Row::default();
        self.l1_vwap_value = 0.0;
        self.l1_vwap_volume = 0.0;
        self.l1_active = false;
    }

    fn flush_l2(&mut self) {
        if !self.l2_active {
            return;
        }
        if self.l2_vwap_volume > 0.0 {
            self.l2_row.vwap = (self.l2_vwap_value / self.l2_vwap_volume) as f32;
        }
        self.l2_row.volatility = stddev(&self.l2_minute_closes);
        let mut cells = [0.0f32; Level2Row::FIELD_COUNT];
        self.l2_row.write_to(&mut cells);

        let lvl = self.tensor.level(Level::L2);
        let ts = kind_range(LEVEL2_FIELDS, FieldKind::TimeSeries).expect("schema has TS fields");
        let meta = kind_range(LEVEL2_FIELDS, FieldKind::Meta).expect("schema has meta fields");
        lvl.write_ts(self.l2_t, self.asset, ts.start, &cells[ts.clone()]);
        lvl.write_ts(self.l2_t, self.asset, meta.start, &cells[meta.clone()]);

        self.l2_minute_closes.clear();
        self.l2_row = Level2Row::default();
        self.l2_vwap_value = 0.0;
        self.l2_vwap_volume = 0.0;
        self.l2_active = false;
    }

    /// Move the bucket cursor forward to `new_t0`, flushing every
    /// completed bucket boundary on the way.
    fn advance_to(&mut self, new_t0: usize) {
        if new_t0 <= self.l0_t {
            return;
        }
        self.flush_l0();
        if new_t0 / 60 > self.l1_t {
            self.flush_l1();
            self.l1_t = new_t0 / 60;
        }
        if new_t0 / 3600 > self.l2_t {
            self.flush_l2();
            self.l2_t = new_t0 / 3600;
        }
        self.l0_t = new_t0;
        self.position = new_t0;
    }

    /// Flush the tail and mark the full day produced.
    fn finish_day(&mut self) {
        self.flush_l0();
        self.flush_l1();
        self.flush_l2();
        self.position = Level::L0.buckets_per_day();
    }
}

impl FeatureSink for FeatureProducer {
    fn on_event(&mut self, event: &TickEvent, book: &Book) {
        let t0 = time_index(Level::L0, event.hour, event.minute, event.second);
        self.advance_to(t0);

        let bid = book.best_bid();
        let ask = book.best_ask();
        let mid = if bid != 0 && ask != 0 {
            (bid as f32 + ask as f32) / 2.0
        } else {
            0.0
        };
        let spread = if bid != 0 && ask != 0 {
            ask as f32 - bid as f32
        } else {
            0.0
        };

        let bid_qty = if bid != 0 {
            book.level_net_quantity(bid).unwrap_or(0).max(0) as f32
        } else {
            0.0
        };
        let ask_qty = if ask != 0 {
            (-book.level_net_quantity(ask).unwrap_or(0)).max(0) as f32
        } else {
            0.0
        };
        let imbalance = if bid_qty + ask_qty > 0.0 {
            (bid_qty - ask_qty) / (bid_qty + ask_qty)
        } else {
            0.0
        };

        // L0 bucket state (last write in the bucket wins).
        self.l0_row.mid_price = mid;
        self.l0_row.spread = spread;
        self.l0_row.tob_imbalance = imbalance;
        self.l0_row.link_minute = (t0 / 60) as f32;
        self.l0_row.link_hour = (t0 / 3600) as f32;
        self.l0_row.asset_valid = 1.0;
        self.l0_active = true;

        if event.kind == EventKind::Taker {
            self.l0_row.trade_volume += event.volume as f32;
            let value = event.price as f64 * event.volume as f64;
            self.l1_vwap_value += value;
            self.l1_vwap_volume += event.volume as f64;
            self.l2_vwap_value += value;
            self.l2_vwap_volume += event.volume as f64;
        }

        // Minute aggregates.
        if mid > 0.0 {
            if !self.l1_active || mid > self.l1_row.high {
                self.l1_row.high = mid;
            }
            if !self.l1_active || (self.l1_row.low == 0.0 || mid < self.l1_row.low) {
                self.l1_row.low = mid;
            }
            self.l1_row.close = mid;

            if !self.l2_active || mid > self.l2_row.high {
                self.l2_row.high = mid;
            }
            if !self.l2_active || (self.l2_row.low == 0.0 || mid < self.l2_row.low) {
                self.l2_row.low = mid;
            }
        }
        self.l1_row.tick_count += 1.0;
        self.l1_row.asset_valid = 1.0;
        self.l1_active = true;
        self.l2_row.asset_valid = 1.0;
        self.l2_active = true;
    }

    fn on_run_bar(&mut self, _bar: &RunBar, _book: &Book) {
        // Run bars are a sampling trigger for downstream factor research;
        // the demonstration schema has no bar-keyed fields.
    }
}

fn stddev(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}

// ============================================================================
// Worker loop
// ============================================================================

/// How often (in events) a worker re-derives its progress minimum.
const PROGRESS_STRIDE: usize = 256;

/// Run one sequential worker over its assigned assets, date-first.
pub fn run_sequential_worker(
    state: &SharedState,
    config: &PipelineConfig,
    store: &FeatureStore,
    worker: usize,
    shutdown: &ShutdownFlag,
) -> SequentialReport {
    if config.pin_cores {
        affinity::pin_to_core(config.encode_workers + worker);
    }

    let mut report = SequentialReport::default();

    let my_assets: Vec<usize> = state
        .assets
        .iter()
        .enumerate()
        .filter(|(_, a)| a.lock().assigned_worker == Some(worker))
        .map(|(id, _)| id)
        .collect();

    // Books persist across dates: the run-bar sampler calibrates on
    // yesterday's tape.
    let mut books: AHashMap<usize, Book> = my_assets
        .iter()
        .map(|&id| {
            let asset = state.assets[id].lock();
            let book_config = BookConfig::new(asset.venue)
                .with_expected_orders(config.expected_orders_per_day)
                .with_auction_flush(config.flush_auction_at_reported_price);
            (id, Book::with_config(book_config))
        })
        .collect();

    let t_full = Level::L0.buckets_per_day();

    for date in &state.all_dates {
        if shutdown.requested() {
            return report;
        }

        // Bind (or join) the date tensor, backing off while the pool
        // drains through the IO worker.
        let tensor = loop {
            match store.tensor_for_date(date) {
                Ok(t) => break t,
                Err(PipelineError::PoolExhausted(_)) => {
                    if shutdown.requested() {
                        return report;
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    // Unrecoverable: stop the whole pipeline, otherwise
                    // the fence consumers would wait forever.
                    log::error!("worker {worker}: tensor bind failed for {date}: {e}");
                    shutdown.request();
                    return report;
                }
            }
        };

        let mut positions = vec![0usize; my_assets.len()];
        let mut published = 0usize;

        for (slot, &asset_id) in my_assets.iter().enumerate() {
            if shutdown.requested() {
                return report;
            }

            let (code, orders_file) = {
                let asset = state.assets[asset_id].lock();
                let file = asset
                    .dates
                    .get(date.as_str())
                    .and_then(|d| d.orders_file.clone());
                (asset.code.clone(), file)
            };

            let Some(orders_file) = orders_file else {
                // Not listed or not encoded: the asset contributes only
                // zero rows, which are valid immediately.
                positions[slot] = t_full;
                publish_progress(&tensor, worker, &positions, &mut published);
                continue;
            };

            let book = books.get_mut(&asset_id).expect("book per assigned asset");
            let mut producer = FeatureProducer::new(Arc::clone(&tensor), asset_id);

            let outcome = {
                let positions = &mut positions;
                let published = &mut published;
                catch_unwind(AssertUnwindSafe(|| {
                    replay_pair(&orders_file, book, &mut producer, &mut |pos| {
                        positions[slot] = pos;
                        publish_progress(&tensor, worker, positions, published);
                    })
                }))
            };

            match outcome {
                Ok(Ok(order_count)) => {
                    producer.finish_day();
                    positions[slot] = t_full;
                    report.pairs_processed += 1;
                    report.orders_processed += order_count as u64;
                    state.assets[asset_id]
                        .lock()
                        .dates
                        .get_mut(date.as_str())
                        .expect("date key")
                        .analyzed = true;
                }
                Ok(Err(e)) => {
                    log::warn!("worker {worker}: {code} {date} failed: {e}");
                    report.failed.push((code, date.clone(), e.to_string()));
                    positions[slot] = t_full;
                }
                Err(_) => {
                    log::error!("worker {worker}: panic replaying {code} {date}");
                    report
                        .failed
                        .push((code, date.clone(), "panic during replay".to_string()));
                    positions[slot] = t_full;
                }
            }

            book.clear();
            publish_progress(&tensor, worker, &positions, &mut published);
        }

        // Date complete for this worker (also when it owns no assets).
        publish_progress_full(&tensor, worker, t_full, &mut published);
    }

    report
}

fn replay_pair(
    orders_file: &std::path::Path,
    book: &mut Book,
    producer: &mut FeatureProducer,
    refresh: &mut dyn FnMut(usize),
) -> crate::error::Result<usize> {
    let orders = decode_orders_file(orders_file)?;
    for (i, event) in orders.iter().enumerate() {
        book.process_with(event, producer)?;
        if i % PROGRESS_STRIDE == PROGRESS_STRIDE - 1 {
            refresh(producer.position());
        }
    }
    Ok(orders.len())
}

/// Publish the min position across this worker's assets to every level.
fn publish_progress(
    tensor: &DailyTensor,
    worker: usize,
    positions: &[usize],
    published: &mut usize,
) {
    let min = positions.iter().copied().min().unwrap_or(0);
    if min > *published {
        *published = min;
        tensor.level(Level::L0).advance_progress(worker, min);
        tensor.level(Level::L1).advance_progress(worker, min / 60);
        tensor.level(Level::L2).advance_progress(worker, min / 3600);
    }
}

fn publish_progress_full(
    tensor: &DailyTensor,
    worker: usize,
    t_full: usize,
    published: &mut usize,
) {
    *published = t_full;
    tensor.level(Level::L0).advance_progress(worker, t_full);
    tensor
        .level(Level::L1)
        .advance_progress(worker, Level::L1.buckets_per_day());
    tensor
        .level(Level::L2)
        .advance_progress(worker, Level::L2.buckets_per_day());
}
