//! Single-instrument LOB reconstruction engine.
//!
//! The book is rebuilt by *deduction*: every event contributes a signed
//! volume against a target order id, and the cell for that id simply
//! accumulates until it hits zero. This makes the engine robust to the
//! venue's adversarial cases without per-case matching logic:
//!
//! - **Out-of-order arrivals** (~2-5%): a taker or cancel may precede its
//!   maker. The early event waits in the deferred queue; when the maker
//!   lands, the volumes annihilate.
//! - **Call auctions** (09:15-09:30, and 14:57-15:00 in Shenzhen): maker
//!   prices are provisional, so makers queue until a taker brings the
//!   uniform clearing price or the 09:30:00 flush places the leftovers at
//!   their reported price.
//! - **Special makers**: market orders and best-of-book orders report
//!   price 0 and wait for a taker to reveal the execution price.
//! - **Zero-price cancels**: Shenzhen omits the price on cancels; the
//!   resident maker (or the queue) supplies it.
//!
//! Ordering policy: the deferred queue is consulted *first* on every slow
//! path event. Roughly 96% of events never touch it: the fast path is one
//! hash lookup and an add.
//!
//! Levels live in a bump arena addressed by index; the order lookup maps
//! id -> (level index, slot in level). Side is never stored: it is the
//! sign of a level's net quantity.

use std::cell::Cell;

use ahash::AHashMap;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticObserver};
use crate::error::{PipelineError, Result};
use crate::pool::bump::{ArenaIdx, BumpArena};
use crate::pool::{PoolHashMap, PriceBitmap};
use crate::types::{session, EventKind, OrderId, Price, Qty, Side, TickEvent, Venue};

use super::run_bar::{RunBar, RunBarConfig, RunBarSampler};

/// Expected orders resting at one price level; sizes each level's vec.
const EXPECTED_LEVEL_QUEUE: usize = 128;

/// Distance from the top of book (in ticks) beyond which a wrong-signed
/// level is reported as a data anomaly.
const ANOMALY_MIN_DISTANCE: u16 = 5;

// ============================================================================
// Cells and levels
// ============================================================================

/// A deduction cell: the running signed quantity attributed to one id.
#[derive(Debug, Clone, Copy)]
struct OrderCell {
    qty: Qty,
    id: OrderId,
    /// Packed tick of first reference, kept for diagnostics.
    created_tick: u32,
}

/// One price level. `net_quantity` is the cached sum of cell quantities;
/// its sign is the level's side.
#[derive(Debug)]
struct Level {
    price: Price,
    net_quantity: Qty,
    order_count: u16,
    orders: Vec<OrderCell>,
}

impl Level {
    fn new(price: Price) -> Self {
        Self {
            price,
            net_quantity: 0,
            order_count: 0,
            orders: Vec::with_capacity(EXPECTED_LEVEL_QUEUE),
        }
    }

    #[inline]
    fn push(&mut self, cell: OrderCell) {
        self.net_quantity += cell.qty;
        self.orders.push(cell);
        self.order_count += 1;
    }

    /// Swap-and-pop removal. Returns the id of the cell that moved into
    /// `slot`, if any, so the caller can patch its lookup entry.
    #[inline]
    fn remove(&mut self, slot: usize) -> Option<OrderId> {
        debug_assert!(slot < self.orders.len());
        self.net_quantity -= self.orders[slot].qty;
        let last = self.orders.len() - 1;
        let moved = if slot != last {
            self.orders.swap(slot, last);
            Some(self.orders[slot].id)
        } else {
            None
        };
        self.orders.pop();
        self.order_count -= 1;
        moved
    }

    #[inline]
    fn is_unreferenced(&self) -> bool {
        self.order_count == 0
    }

    #[inline]
    fn has_visible_quantity(&self) -> bool {
        self.net_quantity != 0
    }
}

/// Location of an order inside the level arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OrderRef {
    level: u32,
    slot: u32,
}

// ============================================================================
// Deferred queue
// ============================================================================

/// Why an event is parked in the deferred queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferReason {
    /// Taker/cancel arrived before its maker
    OutOfOrder,
    /// Maker inside a call-auction window; price provisional until 09:30
    CallAuction,
    /// Maker with price 0 (market / best-of-book order)
    SpecialMaker,
    /// Cancel with price 0 (Shenzhen reporting convention)
    ZeroPriceCancel,
}

#[derive(Debug, Clone, Copy)]
struct DeferredEntry {
    signed_volume: Qty,
    reported_price: Price,
    tick: u32,
    reason: DeferReason,
    is_bid: bool,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for one book instance.
#[derive(Debug, Clone)]
pub struct BookConfig {
    /// Listing venue; gates closing auction and zero-price cancel handling.
    pub venue: Venue,

    /// Expected peak order count for the day; sizes the lookup table,
    /// which never rehashes afterwards.
    pub expected_orders: usize,

    /// At 09:30:00, place leftover call-auction makers into the book at
    /// their reported price (`true`, the venue-observed behaviour) or drop
    /// them with a diagnostic (`false`, for suppliers that already stamp
    /// clearing prices on post-09:25 rows).
    pub flush_auction_at_reported_price: bool,

    /// Emit `log` warnings alongside observer diagnostics.
    pub log_warnings: bool,

    /// Run-bar sampler tuning.
    pub run_bar: RunBarConfig,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            venue: Venue::Shanghai,
            expected_orders: 65_536,
            flush_auction_at_reported_price: true,
            log_warnings: true,
            run_bar: RunBarConfig::default(),
        }
    }
}

impl BookConfig {
    /// Create a config for the given venue.
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            ..Default::default()
        }
    }

    /// Set the expected peak order count.
    pub fn with_expected_orders(mut self, n: usize) -> Self {
        self.expected_orders = n;
        self
    }

    /// Set the 09:30 leftover-flush policy.
    pub fn with_auction_flush(mut self, flush: bool) -> Self {
        self.flush_auction_at_reported_price = flush;
        self
    }

    /// Enable/disable warning logs.
    pub fn with_logging(mut self, log: bool) -> Self {
        self.log_warnings = log;
        self
    }
}

/// Counters for monitoring book health.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookStats {
    /// Events handed to `process`
    pub events_processed: u64,
    /// Events that changed book or queue state
    pub events_accepted: u64,
    /// Events resolved on the single-lookup fast path
    pub fast_path: u64,
    /// Entries pushed into the deferred queue
    pub deferred_enqueued: u64,
    /// Entries consumed/flushed out of the deferred queue
    pub deferred_resolved: u64,
    /// Events ignored (zero volume/id, refused cancels)
    pub ignored: u64,
    /// Run bars emitted
    pub run_bars: u64,
}

// ============================================================================
// Feature trigger
// ============================================================================

/// Observer invoked by the engine after every accepted event.
///
/// Feature formulas themselves are out of scope for the engine; this trait
/// is the trigger point through which producers feed the feature store.
pub trait FeatureSink {
    /// Called after an event has been applied. `book` reflects the
    /// post-event state.
    fn on_event(&mut self, event: &TickEvent, book: &Book);

    /// Called when the taker flow closes a volume-imbalance run bar.
    fn on_run_bar(&mut self, bar: &RunBar, book: &Book) {
        let _ = (bar, book);
    }
}

/// No-op sink for pure reconstruction runs.
pub struct NullSink;

impl FeatureSink for NullSink {
    fn on_event(&mut self, _event: &TickEvent, _book: &Book) {}
}

// ============================================================================
// The engine
// ============================================================================

/// Single-instrument deduction-based LOB engine.
pub struct Book {
    config: BookConfig,

    // Level storage: bump arena + price index. Removed levels stay in the
    // arena until `clear`; the index and bitmap define liveness.
    levels: BumpArena<Level>,
    price_index: AHashMap<Price, ArenaIdx>,

    // Order tracking
    lookup: PoolHashMap<OrderId, OrderRef>,
    deferred: AHashMap<OrderId, DeferredEntry>,

    // Visible price tracking
    visible: PriceBitmap,

    // Top of book cache. Interior mutability: accessors recompute lazily.
    best_bid: Cell<Price>,
    best_ask: Cell<Price>,
    tob_dirty: Cell<bool>,

    // Tick registers
    curr_tick: u32,
    /// Count of queued `CallAuction` entries, so the 09:30 boundary check
    /// stays O(1) on the hot path.
    auction_pending: usize,

    resampler: RunBarSampler,
    /// Bar closed by the current event, handed to the sink afterwards
    pending_bar: Option<RunBar>,

    // Anomaly dedup: levels already reported today
    reported_anomalies: ahash::AHashSet<Price>,
    observer: Option<Box<dyn DiagnosticObserver + Send>>,

    stats: BookStats,
}

impl Book {
    /// Create a book for `venue` with default configuration.
    pub fn new(venue: Venue) -> Self {
        Self::with_config(BookConfig::new(venue))
    }

    /// Create a book with custom configuration.
    pub fn with_config(config: BookConfig) -> Self {
        let resampler = RunBarSampler::new(config.run_bar.clone());
        Self {
            levels: BumpArena::with_capacity(1024),
            price_index: AHashMap::with_capacity(1024),
            lookup: PoolHashMap::with_capacity(config.expected_orders),
            deferred: AHashMap::with_capacity(256),
            visible: PriceBitmap::new(),
            best_bid: Cell::new(0),
            best_ask: Cell::new(0),
            tob_dirty: Cell::new(true),
            curr_tick: 0,
            auction_pending: 0,
            resampler,
            pending_bar: None,
            reported_anomalies: ahash::AHashSet::new(),
            observer: None,
            config,
            stats: BookStats::default(),
        }
    }

    /// Attach a diagnostic observer (anomaly reports, refused events).
    pub fn set_observer(&mut self, observer: Box<dyn DiagnosticObserver + Send>) {
        self.observer = Some(observer);
    }

    pub fn config(&self) -> &BookConfig {
        &self.config
    }

    pub fn stats(&self) -> &BookStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Main entry points
    // ------------------------------------------------------------------------

    /// Process one event. Returns `Ok(true)` if it changed book or queue
    /// state, `Ok(false)` if it was ignored.
    ///
    /// # Errors
    /// `UnsupportedEvent` for `change` events: the schema reserves the
    /// tag but no venue is known to emit it, so silence would hide format
    /// drift.
    pub fn process(&mut self, event: &TickEvent) -> Result<bool> {
        self.curr_tick = event.packed_tick();
        self.stats.events_processed += 1;

        // 09:30:00 boundary: the first continuous-session tick flushes
        // whatever the auction did not execute. Keying on the session
        // (rather than a seen-the-matching-window latch) also covers
        // tapes that jump straight from collection into continuous.
        let in_call_auction = session::is_call_auction(
            self.curr_tick,
            self.config.venue.has_closing_auction(),
        );
        if self.auction_pending > 0
            && !in_call_auction
            && session::is_continuous(self.curr_tick)
        {
            self.flush_call_auction_deferred();
        }

        // Directional volume feeds the run-bar sampler on every trade.
        if event.kind == EventKind::Taker {
            if let Some(bar) =
                self.resampler
                    .process(self.curr_tick, event.side.is_bid(), event.volume as u32)
            {
                self.stats.run_bars += 1;
                self.pending_bar = Some(bar);
            }
        }

        let accepted = self.update_lob(event, in_call_auction)?;
        if accepted {
            self.stats.events_accepted += 1;
        } else {
            self.stats.ignored += 1;
        }
        Ok(accepted)
    }

    /// Process one event and notify `sink` if it was accepted.
    pub fn process_with<S: FeatureSink>(&mut self, event: &TickEvent, sink: &mut S) -> Result<bool> {
        let accepted = self.process(event)?;
        if let Some(bar) = self.pending_bar.take() {
            sink.on_run_bar(&bar, self);
        }
        if accepted {
            sink.on_event(event, self);
        }
        Ok(accepted)
    }

    fn update_lob(&mut self, event: &TickEvent, in_call_auction: bool) -> Result<bool> {
        if event.kind == EventKind::Change {
            return Err(PipelineError::UnsupportedEvent(event.kind.to_tag()));
        }

        let signed_volume = event.signed_volume();
        let target_id = event.target_id();
        if signed_volume == 0 || target_id == 0 {
            return Ok(false);
        }

        // Venue rule: Shanghai always reports cancel prices, so a zero
        // price there is corruption, not a convention.
        if event.kind == EventKind::Cancel
            && event.price == 0
            && !self.config.venue.allows_zero_price_cancel()
        {
            self.report(Diagnostic {
                kind: DiagnosticKind::ZeroPriceCancelRefused,
                tick: self.curr_tick,
                order_id: Some(target_id),
                price: None,
                detail: String::new(),
            });
            return Ok(false);
        }

        let found = self.lookup.contains_key(&target_id);

        // --------------------------------------------------------------------
        // Fast path: taker/cancel with a resident target, empty queue
        // --------------------------------------------------------------------
        if matches!(event.kind, EventKind::Taker | EventKind::Cancel)
            && found
            && self.deferred.is_empty()
        {
            self.stats.fast_path += 1;
            let price = self.level_of(target_id).expect("lookup/arena desync");
            let fully_consumed = self.apply_volume_change(target_id, price, signed_volume);
            if event.kind == EventKind::Taker {
                self.update_tob_after_trade(event.side, fully_consumed, price);
            }
            return Ok(true);
        }

        // --------------------------------------------------------------------
        // Fast path: priced maker in continuous session, empty queue
        // --------------------------------------------------------------------
        if event.kind == EventKind::Maker
            && session::is_continuous(self.curr_tick)
            && self.deferred.is_empty()
            && event.price != 0
        {
            self.stats.fast_path += 1;
            self.apply_volume_change(target_id, event.price, signed_volume);
            return Ok(true);
        }

        self.update_lob_deferred(event, target_id, signed_volume, found, in_call_auction)
    }

    // ------------------------------------------------------------------------
    // Slow path
    // ------------------------------------------------------------------------

    #[cold]
    fn update_lob_deferred(
        &mut self,
        event: &TickEvent,
        target_id: OrderId,
        mut signed_volume: Qty,
        found: bool,
        in_call_auction: bool,
    ) -> Result<bool> {
        let has_deferred = self.deferred.contains_key(&target_id);

        match event.kind {
            EventKind::Maker => {
                let in_auction_extended =
                    in_call_auction || session::is_auction_matching(self.curr_tick);

                // A maker flushing an earlier taker/cancel absorbs its
                // volume; whatever survives is the resting remainder.
                if has_deferred {
                    let entry = self.remove_deferred(target_id).expect("checked above");
                    self.stats.deferred_resolved += 1;
                    signed_volume += entry.signed_volume;
                    if signed_volume == 0 {
                        return Ok(true);
                    }
                }

                if event.price == 0 {
                    // Market / best-of-book order: the taker will bring the
                    // execution price.
                    self.enqueue(
                        target_id,
                        DeferredEntry {
                            signed_volume,
                            reported_price: 0,
                            tick: self.curr_tick,
                            reason: DeferReason::SpecialMaker,
                            is_bid: event.side.is_bid(),
                        },
                    );
                    return Ok(true);
                }

                if in_auction_extended {
                    // Auction makers wait: either a matching-period taker
                    // consumes them at the clearing price, or the 09:30
                    // flush places them at the reported price.
                    self.enqueue(
                        target_id,
                        DeferredEntry {
                            signed_volume,
                            reported_price: event.price,
                            tick: self.curr_tick,
                            reason: DeferReason::CallAuction,
                            is_bid: event.side.is_bid(),
                        },
                    );
                    return Ok(true);
                }

                self.apply_volume_change(target_id, event.price, signed_volume);
                Ok(true)
            }

            EventKind::Taker => {
                // Queue first: any queued entry under this id is the
                // counterparty, whatever its defer reason.
                if has_deferred {
                    self.deduct_from_queue(target_id, signed_volume);
                    self.cleanup_special_self(event, target_id);
                    return Ok(true);
                }

                if found {
                    let price = self.level_of(target_id).expect("lookup/arena desync");
                    let fully_consumed =
                        self.apply_volume_change(target_id, price, signed_volume);
                    self.update_tob_after_trade(event.side, fully_consumed, price);
                    self.cleanup_special_self(event, target_id);
                    return Ok(true);
                }

                // Counterparty not seen yet: out-of-order arrival.
                self.enqueue(
                    target_id,
                    DeferredEntry {
                        signed_volume,
                        reported_price: event.price,
                        tick: self.curr_tick,
                        reason: DeferReason::OutOfOrder,
                        is_bid: event.side.is_bid(),
                    },
                );
                Ok(true)
            }

            EventKind::Cancel => {
                if has_deferred {
                    self.deduct_from_queue(target_id, signed_volume);
                    return Ok(true);
                }

                if found {
                    let price = self.level_of(target_id).expect("lookup/arena desync");
                    self.apply_volume_change(target_id, price, signed_volume);
                    return Ok(true);
                }

                let reason = if event.price == 0 {
                    DeferReason::ZeroPriceCancel
                } else {
                    DeferReason::OutOfOrder
                };
                self.enqueue(
                    target_id,
                    DeferredEntry {
                        signed_volume,
                        reported_price: event.price,
                        tick: self.curr_tick,
                        reason,
                        is_bid: event.side.is_bid(),
                    },
                );
                Ok(true)
            }

            EventKind::Change => unreachable!("rejected before dispatch"),
        }
    }

    fn enqueue(&mut self, id: OrderId, entry: DeferredEntry) {
        self.stats.deferred_enqueued += 1;
        if self.config.log_warnings {
            log::debug!(
                "deferred enqueue id={} reason={:?} vol={} px={}",
                id,
                entry.reason,
                entry.signed_volume,
                entry.reported_price
            );
        }
        if entry.reason == DeferReason::CallAuction {
            self.auction_pending += 1;
        }
        self.deferred.insert(id, entry);
    }

    fn remove_deferred(&mut self, id: OrderId) -> Option<DeferredEntry> {
        let entry = self.deferred.remove(&id)?;
        if entry.reason == DeferReason::CallAuction {
            self.auction_pending -= 1;
        }
        Some(entry)
    }

    /// Unified deduction against a queued maker: add the signed volumes;
    /// a zero or sign-flipped result means the maker is fully consumed.
    fn deduct_from_queue(&mut self, id: OrderId, incoming: Qty) {
        let maker_volume = self
            .deferred
            .get(&id)
            .expect("caller checked presence")
            .signed_volume;
        let net = maker_volume + incoming;

        let fully_consumed =
            net == 0 || (maker_volume > 0 && net <= 0) || (maker_volume < 0 && net >= 0);

        if fully_consumed {
            self.remove_deferred(id);
        } else {
            self.deferred
                .get_mut(&id)
                .expect("checked above")
                .signed_volume = net;
        }
        self.stats.deferred_resolved += 1;
    }

    /// Market orders enter the stream as price-0 makers, then trade as the
    /// aggressor. Once their trade prints, the parked maker entry is spent.
    fn cleanup_special_self(&mut self, event: &TickEvent, target_id: OrderId) {
        let self_id = event.self_id();
        if self_id == 0 || self_id == target_id {
            return;
        }
        if let Some(entry) = self.deferred.get(&self_id) {
            if entry.reason == DeferReason::SpecialMaker {
                self.remove_deferred(self_id);
                self.stats.deferred_resolved += 1;
            }
        }
    }

    /// 09:30:00 boundary: leftover call-auction makers are the orders the
    /// auction did not execute. They join the book at their reported price
    /// (or are dropped, per configuration).
    fn flush_call_auction_deferred(&mut self) {
        let mut ids: Vec<OrderId> = self
            .deferred
            .iter()
            .filter(|(_, e)| e.reason == DeferReason::CallAuction)
            .map(|(&id, _)| id)
            .collect();
        if ids.is_empty() {
            return;
        }
        // Deterministic flush order regardless of hash seeding.
        ids.sort_unstable();

        for id in ids {
            let entry = self.remove_deferred(id).expect("collected above");
            self.stats.deferred_resolved += 1;

            if !self.config.flush_auction_at_reported_price {
                self.report(Diagnostic {
                    kind: DiagnosticKind::AuctionLeftoverDropped,
                    tick: self.curr_tick,
                    order_id: Some(id),
                    price: Some(entry.reported_price),
                    detail: format!(
                        "queued_at={:#010x} is_bid={} vol={}",
                        entry.tick, entry.is_bid, entry.signed_volume
                    ),
                });
                continue;
            }
            self.apply_volume_change(id, entry.reported_price, entry.signed_volume);
        }

        self.tob_dirty.set(true);
    }

    // ------------------------------------------------------------------------
    // Core level/cell mutation
    // ------------------------------------------------------------------------

    /// Price of the level holding `id`, if resident.
    fn level_of(&self, id: OrderId) -> Option<Price> {
        let r = self.lookup.get(&id)?;
        Some(self.levels.get(ArenaIdx(r.level)).price)
    }

    /// Apply `signed_volume` against `target_id` at `price`.
    ///
    /// If the id is resident the cell accumulates; a zero result removes
    /// cell (swap-and-pop, lookup patched), possibly hiding or removing
    /// the level. If the id is absent a fresh cell is created, also for
    /// negative partials, which is what makes out-of-order intervals safe.
    ///
    /// Returns true when the cell was fully consumed.
    fn apply_volume_change(&mut self, target_id: OrderId, price: Price, signed_volume: Qty) -> bool {
        if let Some(&OrderRef { level, slot }) = self.lookup.get(&target_id) {
            let level_idx = ArenaIdx(level);
            let slot = slot as usize;
            let lvl = self.levels.get_mut(level_idx);
            debug_assert_eq!(
                lvl.order_count as usize,
                lvl.orders.len(),
                "level count desync"
            );
            let old_qty = lvl.orders[slot].qty;
            let new_qty = old_qty + signed_volume;

            if new_qty == 0 {
                let moved = lvl.remove(slot);
                self.lookup.remove(&target_id);
                if let Some(moved_id) = moved {
                    if let Some(r) = self.lookup.get_mut(&moved_id) {
                        r.slot = slot as u32;
                    }
                }

                let lvl = self.levels.get(level_idx);
                if lvl.is_unreferenced() {
                    let price = lvl.price;
                    self.price_index.remove(&price);
                    self.visible.clear(price);
                } else {
                    self.refresh_visibility(level_idx);
                }
                true
            } else {
                lvl.net_quantity += signed_volume;
                lvl.orders[slot].qty = new_qty;
                self.refresh_visibility(level_idx);
                self.check_anomaly(level_idx);
                false
            }
        } else {
            // First reference under this id: create the cell, even when the
            // resulting quantity is a negative partial.
            let level_idx = match self.price_index.get(&price) {
                Some(&idx) => idx,
                None => {
                    let idx = self.levels.alloc(Level::new(price));
                    self.price_index.insert(price, idx);
                    idx
                }
            };
            let lvl = self.levels.get_mut(level_idx);
            let slot = lvl.orders.len() as u32;
            lvl.push(OrderCell {
                qty: signed_volume,
                id: target_id,
                created_tick: self.curr_tick,
            });
            self.lookup.insert(
                target_id,
                OrderRef {
                    level: level_idx.0,
                    slot,
                },
            );
            self.refresh_visibility(level_idx);
            false
        }
    }

    #[inline]
    fn refresh_visibility(&mut self, level_idx: ArenaIdx) {
        let lvl = self.levels.get(level_idx);
        if lvl.has_visible_quantity() {
            self.visible.set(lvl.price);
        } else {
            self.visible.clear(lvl.price);
        }
    }

    // ------------------------------------------------------------------------
    // Top of book
    // ------------------------------------------------------------------------

    /// Best visible bid price (0 when unknown).
    pub fn best_bid(&self) -> Price {
        self.refresh_tob();
        self.best_bid.get()
    }

    /// Best visible ask price (0 when unknown).
    pub fn best_ask(&self) -> Price {
        self.refresh_tob();
        self.best_ask.get()
    }

    /// Recompute TOB from the bitmap when flagged dirty (bootstrap, reset,
    /// auction flush) or when a side is still unknown. Side is derived
    /// from the sign of each level's net quantity; it is stored nowhere
    /// else.
    fn refresh_tob(&self) {
        let dirty = self.tob_dirty.get();
        if !dirty && self.best_bid.get() != 0 && self.best_ask.get() != 0 {
            return;
        }

        if dirty || self.best_bid.get() == 0 {
            let mut best_bid = 0u16;
            let mut cursor = self.visible.last_set();
            while let Some(price) = cursor {
                if let Some(&idx) = self.price_index.get(&price) {
                    if self.levels.get(idx).net_quantity > 0 {
                        best_bid = price;
                        break;
                    }
                }
                cursor = self.visible.find_prev(price);
            }
            self.best_bid.set(best_bid);
        }

        if dirty || self.best_ask.get() == 0 {
            let mut best_ask = 0u16;
            let mut cursor = self.visible.first_set();
            while let Some(price) = cursor {
                if let Some(&idx) = self.price_index.get(&price) {
                    if self.levels.get(idx).net_quantity < 0 {
                        best_ask = price;
                        break;
                    }
                }
                cursor = self.visible.find_next(price);
            }
            self.best_ask.set(best_ask);
        }

        self.tob_dirty.set(false);
    }

    /// Takers own TOB maintenance: full consumption advances the touched
    /// side along the bitmap; a partial fill pins it at the trade price.
    fn update_tob_after_trade(&mut self, aggressor: Side, fully_consumed: bool, trade_price: Price) {
        if fully_consumed && self.visible.test(trade_price) {
            // Other ids still rest at this price; the level survives.
            if aggressor.is_bid() {
                self.best_ask.set(trade_price);
            } else {
                self.best_bid.set(trade_price);
            }
            self.tob_dirty.set(false);
            return;
        }

        if fully_consumed {
            if aggressor.is_bid() {
                self.best_ask
                    .set(self.visible.find_next(trade_price).unwrap_or(0));
            } else {
                self.best_bid
                    .set(self.visible.find_prev(trade_price).unwrap_or(0));
            }
        } else if aggressor.is_bid() {
            self.best_ask.set(trade_price);
        } else {
            self.best_bid.set(trade_price);
        }
        self.tob_dirty.set(false);
    }

    // ------------------------------------------------------------------------
    // Anomaly diagnostic
    // ------------------------------------------------------------------------

    /// A level whose sign disagrees with its side well inside the book
    /// during continuous trading points at supplier data loss. Reported
    /// once per level per day; never fatal.
    fn check_anomaly(&mut self, level_idx: ArenaIdx) {
        if !session::is_continuous(self.curr_tick) {
            return;
        }
        let bid = self.best_bid.get();
        let ask = self.best_ask.get();
        if bid == 0 || ask == 0 {
            return;
        }

        let lvl = self.levels.get(level_idx);
        let price = lvl.price;
        let net = lvl.net_quantity;
        let oldest = lvl.orders.iter().map(|c| c.created_tick).min().unwrap_or(0);

        let wrong_sign = (net < 0 && price.saturating_add(ANOMALY_MIN_DISTANCE) <= bid)
            || (net > 0 && price >= ask.saturating_add(ANOMALY_MIN_DISTANCE));
        if !wrong_sign || self.reported_anomalies.contains(&price) {
            return;
        }
        self.reported_anomalies.insert(price);

        if self.config.log_warnings {
            log::warn!(
                "sign anomaly at price {}: net={} with TOB {}/{}",
                price,
                net,
                bid,
                ask
            );
        }
        self.report(Diagnostic {
            kind: DiagnosticKind::SignAnomaly,
            tick: self.curr_tick,
            order_id: None,
            price: Some(price),
            detail: format!("net={net} bid={bid} ask={ask} oldest_tick={oldest:#010x}"),
        });
    }

    fn report(&mut self, diag: Diagnostic) {
        if let Some(obs) = self.observer.as_mut() {
            obs.on_diagnostic(&diag);
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Number of tracked order cells.
    pub fn total_orders(&self) -> usize {
        self.lookup.len()
    }

    /// Number of live price levels.
    pub fn total_levels(&self) -> usize {
        self.price_index.len()
    }

    /// Number of parked deferred entries.
    pub fn total_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Deferred entries parked for a specific reason.
    pub fn deferred_by_reason(&self, reason: DeferReason) -> usize {
        self.deferred.values().filter(|e| e.reason == reason).count()
    }

    /// True if `id` has a resident cell.
    pub fn contains_order(&self, id: OrderId) -> bool {
        self.lookup.contains_key(&id)
    }

    /// Net quantity at `price`, if a live level exists there.
    pub fn level_net_quantity(&self, price: Price) -> Option<Qty> {
        let &idx = self.price_index.get(&price)?;
        Some(self.levels.get(idx).net_quantity)
    }

    /// Cells resting at `price` as `(id, qty)` pairs, if the level lives.
    pub fn level_orders(&self, price: Price) -> Option<Vec<(OrderId, Qty)>> {
        let &idx = self.price_index.get(&price)?;
        Some(
            self.levels
                .get(idx)
                .orders
                .iter()
                .map(|c| (c.id, c.qty))
                .collect(),
        )
    }

    /// Visit visible bid levels from the top down, best first.
    pub fn for_each_visible_bid(&self, max_levels: usize, mut f: impl FnMut(Price, Qty)) {
        let best = self.best_bid();
        if best == 0 {
            return;
        }
        let mut cursor = Some(best);
        let mut n = 0;
        while let (Some(price), true) = (cursor, n < max_levels) {
            if let Some(net) = self.level_net_quantity(price) {
                if net != 0 {
                    f(price, net);
                    n += 1;
                }
            }
            cursor = self.visible.find_prev(price);
        }
    }

    /// Visit visible ask levels from the top down, best first.
    pub fn for_each_visible_ask(&self, max_levels: usize, mut f: impl FnMut(Price, Qty)) {
        let best = self.best_ask();
        if best == 0 {
            return;
        }
        let mut cursor = Some(best);
        let mut n = 0;
        while let (Some(price), true) = (cursor, n < max_levels) {
            if let Some(net) = self.level_net_quantity(price) {
                if net != 0 {
                    f(price, net);
                    n += 1;
                }
            }
            cursor = self.visible.find_next(price);
        }
    }

    /// Verify the structural invariants relating cells, counts, bitmap
    /// and lookup. Used by tests; panics on violation.
    #[doc(hidden)]
    pub fn assert_invariants(&self) {
        for (&price, &idx) in &self.price_index {
            let lvl = self.levels.get(idx);
            assert_eq!(lvl.price, price);
            let sum: Qty = lvl.orders.iter().map(|c| c.qty).sum();
            assert_eq!(sum, lvl.net_quantity, "net sum mismatch at {price}");
            assert_eq!(
                lvl.order_count as usize,
                lvl.orders.len(),
                "count mismatch at {price}"
            );
            assert_eq!(
                self.visible.test(price),
                lvl.net_quantity != 0,
                "bitmap mismatch at {price}"
            );
            for (slot, cell) in lvl.orders.iter().enumerate() {
                let r = self
                    .lookup
                    .get(&cell.id)
                    .unwrap_or_else(|| panic!("cell {} missing from lookup", cell.id));
                assert_eq!(r.level, idx.0);
                assert_eq!(r.slot as usize, slot);
            }
        }
    }

    /// Assert the TOB is not crossed. Valid only at quiescent points of a
    /// clean stream; during out-of-order windows the cached TOB may be
    /// briefly wrong by design.
    #[doc(hidden)]
    pub fn assert_tob_uncrossed(&self) {
        let bid = self.best_bid();
        let ask = self.best_ask();
        if bid != 0 && ask != 0 {
            assert!(bid < ask, "crossed TOB: {bid} >= {ask}");
        }
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// Empty all engine state, preparing for the next trading day. The
    /// run-bar sampler keeps its calibration history across days.
    pub fn clear(&mut self) {
        self.levels.reset();
        self.price_index.clear();
        self.lookup.clear();
        self.deferred.clear();
        self.visible.clear_all();
        self.best_bid.set(0);
        self.best_ask.set(0);
        self.tob_dirty.set(true);
        self.curr_tick = 0;
        self.auction_pending = 0;
        self.reported_anomalies.clear();
        self.stats = BookStats::default();
        self.pending_bar = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shenzhen_book() -> Book {
        Book::with_config(BookConfig::new(Venue::Shenzhen).with_logging(false))
    }

    fn shanghai_book() -> Book {
        Book::with_config(BookConfig::new(Venue::Shanghai).with_logging(false))
    }

    #[test]
    fn test_maker_creates_level() {
        let mut book = shanghai_book();
        let ev = TickEvent::maker(Side::Bid, 1, 1000, 10);
        assert!(book.process(&ev).unwrap());

        assert_eq!(book.total_orders(), 1);
        assert_eq!(book.total_levels(), 1);
        assert_eq!(book.level_net_quantity(1000), Some(10));
        assert_eq!(book.level_orders(1000).unwrap(), vec![(1, 10)]);
        book.assert_invariants();
    }

    #[test]
    fn test_ask_maker_is_negative() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Ask, 2, 1010, 7)).unwrap();
        assert_eq!(book.level_net_quantity(1010), Some(-7));
        book.assert_invariants();
    }

    #[test]
    fn test_taker_partial_fill_keeps_level() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
        // Sell taker consumes the resting bid partially.
        book.process(&TickEvent::taker(Side::Ask, 1, 99, 1000, 4)).unwrap();

        assert_eq!(book.level_net_quantity(1000), Some(6));
        assert_eq!(book.level_orders(1000).unwrap(), vec![(1, 6)]);
        assert!(book.total_deferred() == 0);
        assert_eq!(book.best_bid(), 1000);
        book.assert_invariants();
    }

    #[test]
    fn test_taker_full_fill_removes_level() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
        book.process(&TickEvent::taker(Side::Ask, 1, 99, 1000, 10)).unwrap();

        assert_eq!(book.total_orders(), 0);
        assert_eq!(book.total_levels(), 0);
        assert_eq!(book.level_net_quantity(1000), None);
        book.assert_invariants();
    }

    #[test]
    fn test_cancel_removes_order() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 7, 1100, 5)).unwrap();
        book.process(&TickEvent::cancel(Side::Bid, 7, 1100, 5)).unwrap();

        assert!(!book.contains_order(7));
        assert_eq!(book.total_levels(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_zero_price_cancel_uses_level_price_shenzhen() {
        let mut book = shenzhen_book();
        book.process(&TickEvent::maker(Side::Bid, 7, 1100, 5)).unwrap();
        book.process(&TickEvent::cancel(Side::Bid, 7, 0, 5)).unwrap();

        assert!(!book.contains_order(7));
        assert_eq!(book.level_net_quantity(1100), None);
        assert_eq!(book.total_deferred(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_zero_price_cancel_refused_shanghai() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 7, 1100, 5)).unwrap();
        let accepted = book.process(&TickEvent::cancel(Side::Bid, 7, 0, 5)).unwrap();

        assert!(!accepted);
        // The maker stays untouched.
        assert!(book.contains_order(7));
        assert_eq!(book.level_net_quantity(1100), Some(5));
        book.assert_invariants();
    }

    #[test]
    fn test_zero_price_cancel_defers_when_maker_absent() {
        let mut book = shenzhen_book();
        book.process(&TickEvent::cancel(Side::Bid, 42, 0, 5)).unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::ZeroPriceCancel), 1);

        // The maker lands later; volumes annihilate.
        book.process(&TickEvent::maker(Side::Bid, 42, 1200, 5)).unwrap();
        assert_eq!(book.total_deferred(), 0);
        assert!(!book.contains_order(42));
        book.assert_invariants();
    }

    #[test]
    fn test_out_of_order_taker_then_maker() {
        let mut book = shanghai_book();
        // Buy taker targets ask id 5 before its maker arrived.
        book.process(&TickEvent::taker(Side::Bid, 9, 5, 2000, 3)).unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::OutOfOrder), 1);
        assert_eq!(book.total_levels(), 0);

        book.process(&TickEvent::maker(Side::Ask, 5, 2000, 10)).unwrap();
        assert_eq!(book.total_deferred(), 0);
        assert_eq!(book.level_net_quantity(2000), Some(-7));
        book.assert_invariants();
    }

    #[test]
    fn test_out_of_order_exact_annihilation() {
        let mut book = shanghai_book();
        book.process(&TickEvent::taker(Side::Bid, 9, 5, 2000, 10)).unwrap();
        book.process(&TickEvent::maker(Side::Ask, 5, 2000, 10)).unwrap();
        assert_eq!(book.total_deferred(), 0);
        assert_eq!(book.total_levels(), 0);
        assert_eq!(book.total_orders(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_call_auction_maker_deferred_and_flushed() {
        let mut book = shanghai_book();
        let maker = TickEvent::maker(Side::Bid, 42, 990, 100).at(9, 20, 0, 0);
        book.process(&maker).unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::CallAuction), 1);
        assert_eq!(book.total_levels(), 0);

        // Matching window: still deferred.
        let maker2 = TickEvent::maker(Side::Bid, 43, 991, 50).at(9, 26, 0, 0);
        book.process(&maker2).unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::CallAuction), 2);

        // First continuous tick triggers the flush.
        let opener = TickEvent::maker(Side::Bid, 44, 989, 10).at(9, 30, 0, 0);
        book.process(&opener).unwrap();

        assert_eq!(book.deferred_by_reason(DeferReason::CallAuction), 0);
        assert_eq!(book.level_net_quantity(990), Some(100));
        assert_eq!(book.level_net_quantity(991), Some(50));
        assert_eq!(book.level_net_quantity(989), Some(10));
        assert_eq!(book.best_bid(), 991);
        book.assert_invariants();
    }

    #[test]
    fn test_auction_flush_drop_policy() {
        let mut book = Book::with_config(
            BookConfig::new(Venue::Shanghai)
                .with_logging(false)
                .with_auction_flush(false),
        );
        book.process(&TickEvent::maker(Side::Bid, 42, 990, 100).at(9, 20, 0, 0))
            .unwrap();
        book.process(&TickEvent::maker(Side::Bid, 44, 989, 10).at(9, 30, 0, 0))
            .unwrap();

        // Leftover dropped instead of flushed.
        assert_eq!(book.level_net_quantity(990), None);
        assert_eq!(book.level_net_quantity(989), Some(10));
        assert_eq!(book.total_deferred(), 0);
    }

    #[test]
    fn test_matching_period_taker_consumes_queued_maker() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Ask, 5, 1005, 10).at(9, 20, 0, 0))
            .unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::CallAuction), 1);

        // Matching-period taker carries the clearing price and consumes
        // the queued maker directly; the book itself is untouched.
        book.process(&TickEvent::taker(Side::Bid, 1, 5, 1002, 4).at(9, 26, 0, 0))
            .unwrap();
        assert_eq!(book.total_levels(), 0);
        assert_eq!(book.deferred_by_reason(DeferReason::CallAuction), 1);

        book.process(&TickEvent::taker(Side::Bid, 2, 5, 1002, 6).at(9, 27, 0, 0))
            .unwrap();
        assert_eq!(book.total_deferred(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_special_maker_consumed_by_taker() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 9, 0, 8)).unwrap();
        assert_eq!(book.deferred_by_reason(DeferReason::SpecialMaker), 1);
        assert_eq!(book.total_levels(), 0);

        // Sell taker hits the parked bid with the real execution price.
        book.process(&TickEvent::taker(Side::Ask, 9, 77, 1050, 8)).unwrap();
        assert_eq!(book.total_deferred(), 0);
        assert_eq!(book.total_levels(), 0);
        assert_eq!(book.total_orders(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_special_maker_self_cleanup_after_trade() {
        let mut book = shanghai_book();
        // Market buy order enters as a price-0 maker...
        book.process(&TickEvent::maker(Side::Bid, 11, 0, 5)).unwrap();
        // ...and a resting ask exists in the book.
        book.process(&TickEvent::maker(Side::Ask, 22, 1010, 5)).unwrap();

        // Its trade prints as a buy taker with self id 11 against ask 22.
        book.process(&TickEvent::taker(Side::Bid, 11, 22, 1010, 5)).unwrap();

        // Both the resting ask and the parked special maker are gone.
        assert_eq!(book.total_deferred(), 0);
        assert_eq!(book.total_orders(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_tob_advances_on_full_consumption() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Ask, 1, 1000, 5)).unwrap();
        book.process(&TickEvent::maker(Side::Ask, 2, 1001, 5)).unwrap();

        // Establish the ask TOB with a partial hit.
        book.process(&TickEvent::taker(Side::Bid, 10, 1, 1000, 2)).unwrap();
        assert_eq!(book.best_ask(), 1000);

        // Emptying 1000 advances to 1001.
        book.process(&TickEvent::taker(Side::Bid, 11, 1, 1000, 3)).unwrap();
        assert_eq!(book.best_ask(), 1001);
        book.assert_invariants();
    }

    #[test]
    fn test_tob_pinned_when_level_survives_cell_consumption() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Ask, 1, 1000, 5)).unwrap();
        book.process(&TickEvent::maker(Side::Ask, 2, 1000, 5)).unwrap();
        book.process(&TickEvent::maker(Side::Ask, 3, 1001, 5)).unwrap();

        // Fully consume cell 1; the 1000 level still shows quantity.
        book.process(&TickEvent::taker(Side::Bid, 10, 1, 1000, 5)).unwrap();
        assert_eq!(book.best_ask(), 1000);
        book.assert_invariants();
    }

    #[test]
    fn test_swap_and_pop_patches_lookup() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
        book.process(&TickEvent::maker(Side::Bid, 2, 1000, 20)).unwrap();
        book.process(&TickEvent::maker(Side::Bid, 3, 1000, 30)).unwrap();

        // Removing the first cell swaps the last into its slot.
        book.process(&TickEvent::cancel(Side::Bid, 1, 1000, 10)).unwrap();
        assert_eq!(book.level_net_quantity(1000), Some(50));
        book.assert_invariants();

        // The moved order must still be addressable.
        book.process(&TickEvent::cancel(Side::Bid, 3, 1000, 30)).unwrap();
        assert_eq!(book.level_net_quantity(1000), Some(20));
        book.assert_invariants();
    }

    #[test]
    fn test_hidden_level_reappears() {
        let mut book = shanghai_book();
        book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
        book.process(&TickEvent::maker(Side::Bid, 2, 1000, 5)).unwrap();

        // Drive the level's net to zero without emptying it: an oversized
        // out-of-order cancel on id 1 leaves a negative cell.
        book.process(&TickEvent::cancel(Side::Bid, 1, 1000, 15)).unwrap();
        assert_eq!(book.level_net_quantity(1000), Some(0));
        assert_eq!(book.total_levels(), 1);
        book.assert_invariants();

        // New quantity at the price makes it visible again.
        book.process(&TickEvent::maker(Side::Bid, 4, 1000, 3)).unwrap();
        assert_eq!(book.level_net_quantity(1000), Some(3));
        book.assert_invariants();
    }

    #[test]
    fn test_change_event_is_hard_error() {
        let mut book = shanghai_book();
        let mut ev = TickEvent::maker(Side::Bid, 1, 1000, 10);
        ev.kind = EventKind::Change;
        let err = book.process(&ev).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedEvent(2)));
    }

    #[test]
    fn test_zero_volume_and_zero_id_ignored() {
        let mut book = shanghai_book();
        assert!(!book.process(&TickEvent::maker(Side::Bid, 1, 1000, 0)).unwrap());
        assert!(!book.process(&TickEvent::maker(Side::Bid, 0, 1000, 10)).unwrap());
        assert_eq!(book.total_orders(), 0);
        assert_eq!(book.stats().ignored, 2);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut book = shenzhen_book();
        book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
        book.process(&TickEvent::maker(Side::Ask, 2, 1010, 10)).unwrap();
        book.process(&TickEvent::cancel(Side::Bid, 99, 0, 5)).unwrap();
        assert!(book.total_orders() > 0);
        assert!(book.total_deferred() > 0);

        book.clear();
        assert_eq!(book.total_orders(), 0);
        assert_eq!(book.total_levels(), 0);
        assert_eq!(book.total_deferred(), 0);
        assert_eq!(book.best_bid(), 0);
        assert_eq!(book.best_ask(), 0);
        assert_eq!(book.stats().events_processed, 0);
    }

    #[test]
    fn test_fast_path_dominates_clean_stream() {
        let mut book = shanghai_book();
        for i in 0..100u32 {
            book.process(&TickEvent::maker(Side::Bid, i + 1, 1000 + (i % 5) as u16, 10))
                .unwrap();
        }
        for i in 0..100u32 {
            book.process(&TickEvent::cancel(
                Side::Bid,
                i + 1,
                1000 + (i % 5) as u16,
                10,
            ))
            .unwrap();
        }
        assert_eq!(book.stats().fast_path, 200);
        assert_eq!(book.total_orders(), 0);
        book.assert_invariants();
    }

    #[test]
    fn test_visible_iteration_order() {
        let mut book = shanghai_book();
        for (id, px) in [(1u32, 1000u16), (2, 998), (3, 999)] {
            book.process(&TickEvent::maker(Side::Bid, id, px, 10)).unwrap();
        }
        for (id, px) in [(11u32, 1002u16), (12, 1004), (13, 1003)] {
            book.process(&TickEvent::maker(Side::Ask, id, px, 10)).unwrap();
        }
        // Seed the TOB from a trade.
        book.process(&TickEvent::taker(Side::Bid, 99, 11, 1002, 1)).unwrap();

        let mut bids = Vec::new();
        book.for_each_visible_bid(10, |p, q| bids.push((p, q)));
        assert_eq!(bids.iter().map(|&(p, _)| p).collect::<Vec<_>>(), vec![1000, 999, 998]);

        let mut asks = Vec::new();
        book.for_each_visible_ask(2, |p, q| asks.push((p, q)));
        assert_eq!(asks.iter().map(|&(p, _)| p).collect::<Vec<_>>(), vec![1002, 1003]);
    }

    #[test]
    fn test_feature_sink_called_on_accepted_events() {
        struct Counter {
            events: usize,
        }
        impl FeatureSink for Counter {
            fn on_event(&mut self, _: &TickEvent, _: &Book) {
                self.events += 1;
            }
        }

        let mut book = shanghai_book();
        let mut sink = Counter { events: 0 };
        book.process_with(&TickEvent::maker(Side::Bid, 1, 1000, 10), &mut sink)
            .unwrap();
        // Ignored event: no callback.
        book.process_with(&TickEvent::maker(Side::Bid, 0, 1000, 10), &mut sink)
            .unwrap();
        assert_eq!(sink.events, 1);
    }
}
