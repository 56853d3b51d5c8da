//! Core data types for tick events and book state.
//!
//! These types mirror the supplier's per-instrument event log after schema
//! normalization:
//! - Prices are `u16` in 0.01 CNY units; 0 is the "unknown price" sentinel
//!   used by market orders, best-of-book orders and Shenzhen cancels.
//! - Quantities are signed `i32`: positive = net bid volume, negative = net
//!   ask volume. The deduction model intentionally allows negative partial
//!   cells while the stream is locally out of order.
//! - Every event carries both order ids; which one is the target depends on
//!   the event type (takers address their counterparty).

use serde::{Deserialize, Serialize};

/// Price in 0.01 CNY units. 0 means "price unknown" (see deferred handling).
pub type Price = u16;

/// Signed net quantity in lots of 100 shares. Sign encodes side.
pub type Qty = i32;

/// Exchange-assigned order identifier. 0 means "no id on this side".
pub type OrderId = u32;

/// Number of representable prices (the full `u16` range).
pub const PRICE_RANGE: usize = (u16::MAX as usize) + 1;

/// Event type from the merged order/trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Passive order joining the book
    Maker = 0,
    /// Withdrawal of a resting order
    Cancel = 1,
    /// Reserved by the supplier schema; never produced by known venues.
    /// The engine refuses it loudly (see `Book::apply`).
    Change = 2,
    /// Aggressive order consuming resting liquidity
    Taker = 3,
}

impl EventKind {
    /// Parse from the 2-bit on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EventKind::Maker),
            1 => Some(EventKind::Cancel),
            2 => Some(EventKind::Change),
            3 => Some(EventKind::Taker),
            _ => None,
        }
    }

    /// Convert to the on-disk tag.
    #[inline]
    pub fn to_tag(self) -> u8 {
        self as u8
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Side {
    Bid = 0,
    Ask = 1,
}

impl Side {
    /// Parse from the 1-bit on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Side::Bid),
            1 => Some(Side::Ask),
            _ => None,
        }
    }

    #[inline]
    pub fn to_tag(self) -> u8 {
        self as u8
    }

    #[inline(always)]
    pub fn is_bid(self) -> bool {
        matches!(self, Side::Bid)
    }
}

/// Listing venue. Gates closing call auction and zero-price cancel handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    /// Shanghai Stock Exchange: no closing auction window in the event
    /// stream, cancels always carry a price.
    Shanghai,
    /// Shenzhen Stock Exchange: closing call auction 14:57-15:00, cancels
    /// may omit the price.
    Shenzhen,
}

impl Venue {
    /// Infer the venue from the 6-digit instrument code.
    ///
    /// `6xxxxx` lists in Shanghai; `0xxxxx` and `3xxxxx` in Shenzhen.
    /// Unknown prefixes default to Shanghai (the stricter venue).
    pub fn from_instrument_code(code: &str) -> Self {
        match code.as_bytes().first() {
            Some(b'0') | Some(b'3') => Venue::Shenzhen,
            _ => Venue::Shanghai,
        }
    }

    /// Whether this venue runs a closing call auction (14:57-15:00).
    #[inline]
    pub fn has_closing_auction(self) -> bool {
        matches!(self, Venue::Shenzhen)
    }

    /// Whether cancels from this venue may legally omit the price.
    #[inline]
    pub fn allows_zero_price_cancel(self) -> bool {
        matches!(self, Venue::Shenzhen)
    }
}

/// One tick-by-tick event from the merged order/trade stream.
///
/// `centisecond` is in 10 ms units (the supplier's resolution).
/// Which of `bid_id`/`ask_id` is populated depends on `(kind, side)`:
///
/// | kind, side    | bid_id          | ask_id           |
/// |---------------|-----------------|------------------|
/// | maker,  bid   | maker id        | 0                |
/// | maker,  ask   | 0               | maker id         |
/// | cancel, bid   | cancelled id    | 0                |
/// | cancel, ask   | 0               | cancelled id     |
/// | taker,  bid   | taker id        | resting maker id |
/// | taker,  ask   | resting maker id| taker id         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 10 ms units, 0-99
    pub centisecond: u8,
    pub kind: EventKind,
    pub side: Side,
    pub price: Price,
    /// Unsigned volume in lots; sign is derived from (kind, side)
    pub volume: u16,
    pub bid_id: OrderId,
    pub ask_id: OrderId,
}

impl TickEvent {
    /// Construct a maker event.
    pub fn maker(side: Side, id: OrderId, price: Price, volume: u16) -> Self {
        let (bid_id, ask_id) = match side {
            Side::Bid => (id, 0),
            Side::Ask => (0, id),
        };
        Self {
            hour: 10,
            minute: 0,
            second: 0,
            centisecond: 0,
            kind: EventKind::Maker,
            side,
            price,
            volume,
            bid_id,
            ask_id,
        }
    }

    /// Construct a cancel event.
    pub fn cancel(side: Side, id: OrderId, price: Price, volume: u16) -> Self {
        let mut ev = Self::maker(side, id, price, volume);
        ev.kind = EventKind::Cancel;
        ev
    }

    /// Construct a taker event. `side` is the aggressor's side; both ids
    /// must be supplied because takers address their counterparty.
    pub fn taker(side: Side, bid_id: OrderId, ask_id: OrderId, price: Price, volume: u16) -> Self {
        Self {
            hour: 10,
            minute: 0,
            second: 0,
            centisecond: 0,
            kind: EventKind::Taker,
            side,
            price,
            volume,
            bid_id,
            ask_id,
        }
    }

    /// Override the event time (builder style).
    pub fn at(mut self, hour: u8, minute: u8, second: u8, centisecond: u8) -> Self {
        self.hour = hour;
        self.minute = minute;
        self.second = second;
        self.centisecond = centisecond;
        self
    }

    /// Packed timestamp `(h<<24)|(m<<16)|(s<<8)|cs` used for ordering,
    /// session checks and the run-bar time guard.
    #[inline(always)]
    pub fn packed_tick(&self) -> u32 {
        ((self.hour as u32) << 24)
            | ((self.minute as u32) << 16)
            | ((self.second as u32) << 8)
            | self.centisecond as u32
    }

    /// Signed volume per the deduction table: makers add liquidity with the
    /// sign of their own side, cancels subtract it, takers consume the
    /// *counterparty's* liquidity.
    #[inline(always)]
    pub fn signed_volume(&self) -> Qty {
        let vol = self.volume as Qty;
        match (self.kind, self.side) {
            (EventKind::Maker, Side::Bid) => vol,
            (EventKind::Maker, Side::Ask) => -vol,
            (EventKind::Cancel, Side::Bid) => -vol,
            (EventKind::Cancel, Side::Ask) => vol,
            (EventKind::Taker, Side::Bid) => vol,
            (EventKind::Taker, Side::Ask) => -vol,
            (EventKind::Change, _) => 0,
        }
    }

    /// The order id this event operates on. Makers and cancels address
    /// themselves; takers address the resting counterparty.
    #[inline(always)]
    pub fn target_id(&self) -> OrderId {
        match (self.kind, self.side) {
            (EventKind::Maker, Side::Bid) | (EventKind::Cancel, Side::Bid) => self.bid_id,
            (EventKind::Maker, Side::Ask) | (EventKind::Cancel, Side::Ask) => self.ask_id,
            (EventKind::Taker, Side::Bid) => self.ask_id,
            (EventKind::Taker, Side::Ask) => self.bid_id,
            (EventKind::Change, _) => 0,
        }
    }

    /// The aggressor's own id on a taker event (0 if absent).
    #[inline(always)]
    pub fn self_id(&self) -> OrderId {
        match self.side {
            Side::Bid => self.bid_id,
            Side::Ask => self.ask_id,
        }
    }
}

// ============================================================================
// Trading session windows (China A-share)
// ============================================================================

/// Session window classification helpers, all keyed on the packed tick.
pub mod session {
    /// Morning collection auction start, 09:15.
    pub const CALL_AUCTION_START: (u8, u8) = (9, 15);
    /// Collection ends / matching begins, 09:25.
    pub const MATCHING_START: (u8, u8) = (9, 25);
    /// Continuous trading begins, 09:30.
    pub const CONTINUOUS_START: (u8, u8) = (9, 30);
    /// Closing call auction (Shenzhen), 14:57.
    pub const CLOSING_AUCTION_START: (u8, u8) = (14, 57);
    /// Market close, 15:00.
    pub const CLOSE: (u8, u8) = (15, 0);

    #[inline(always)]
    fn hm(tick: u32) -> (u8, u8) {
        (((tick >> 24) & 0xff) as u8, ((tick >> 16) & 0xff) as u8)
    }

    /// Collection phase of a call auction: 09:15-09:25, plus 14:57-15:00
    /// when the venue runs a closing auction.
    #[inline]
    pub fn is_call_auction(tick: u32, closing_auction: bool) -> bool {
        let (h, m) = hm(tick);
        if h == CALL_AUCTION_START.0 && m >= CALL_AUCTION_START.1 && m < MATCHING_START.1 {
            return true;
        }
        if closing_auction {
            if h == CLOSING_AUCTION_START.0 && m >= CLOSING_AUCTION_START.1 {
                return true;
            }
            if h == CLOSE.0 && m == CLOSE.1 {
                return true;
            }
        }
        false
    }

    /// Matching phase of the morning auction: 09:25-09:30. Takers here
    /// carry the real uniform clearing price.
    #[inline]
    pub fn is_auction_matching(tick: u32) -> bool {
        let (h, m) = hm(tick);
        h == MATCHING_START.0 && m >= MATCHING_START.1 && m < CONTINUOUS_START.1
    }

    /// Continuous trading: 09:30-11:30 and 13:00-14:57.
    #[inline]
    pub fn is_continuous(tick: u32) -> bool {
        let (h, m) = hm(tick);
        let minutes = h as u32 * 60 + m as u32;
        (minutes >= 9 * 60 + 30 && minutes < 11 * 60 + 30)
            || (minutes >= 13 * 60 && minutes < 14 * 60 + 57)
    }
}

// ============================================================================
// Snapshot record (one per exchange quote push)
// ============================================================================

/// A 10-level market snapshot as normalized from the supplier's quote file.
///
/// Prices in 0.01 CNY units, volumes in lots, VWAPs in 0.001 CNY units,
/// turnover in CNY. Snapshots arrive asynchronously to the order stream and
/// are persisted alongside it for fuzzy correction only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub trade_count: u8,
    pub volume: u16,
    pub turnover: u32,
    pub high: u16,
    pub low: u16,
    pub close: u16,
    pub bid_prices: [u16; 10],
    pub bid_volumes: [u16; 10],
    pub ask_prices: [u16; 10],
    pub ask_volumes: [u16; 10],
    /// false = buy pressure, true = sell pressure (vwap falling)
    pub direction: bool,
    pub all_bid_vwap: u16,
    pub all_ask_vwap: u16,
    pub all_bid_volume: u32,
    pub all_ask_volume: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_tags() {
        assert_eq!(EventKind::from_tag(0), Some(EventKind::Maker));
        assert_eq!(EventKind::from_tag(1), Some(EventKind::Cancel));
        assert_eq!(EventKind::from_tag(2), Some(EventKind::Change));
        assert_eq!(EventKind::from_tag(3), Some(EventKind::Taker));
        assert_eq!(EventKind::from_tag(4), None);
        assert_eq!(EventKind::Taker.to_tag(), 3);
    }

    #[test]
    fn test_side_tags() {
        assert_eq!(Side::from_tag(0), Some(Side::Bid));
        assert_eq!(Side::from_tag(1), Some(Side::Ask));
        assert_eq!(Side::from_tag(2), None);
        assert!(Side::Bid.is_bid());
        assert!(!Side::Ask.is_bid());
    }

    #[test]
    fn test_venue_inference() {
        assert_eq!(Venue::from_instrument_code("600519"), Venue::Shanghai);
        assert_eq!(Venue::from_instrument_code("000001"), Venue::Shenzhen);
        assert_eq!(Venue::from_instrument_code("300750"), Venue::Shenzhen);
        assert!(Venue::Shenzhen.allows_zero_price_cancel());
        assert!(!Venue::Shanghai.allows_zero_price_cancel());
    }

    #[test]
    fn test_packed_tick_ordering() {
        let a = TickEvent::maker(Side::Bid, 1, 1000, 10).at(9, 30, 0, 0);
        let b = TickEvent::maker(Side::Bid, 2, 1000, 10).at(9, 30, 0, 1);
        let c = TickEvent::maker(Side::Bid, 3, 1000, 10).at(9, 29, 59, 99);
        assert!(a.packed_tick() < b.packed_tick());
        assert!(c.packed_tick() < a.packed_tick());
    }

    #[test]
    fn test_signed_volume_table() {
        let vol = 10u16;
        let cases = [
            (EventKind::Maker, Side::Bid, 10),
            (EventKind::Maker, Side::Ask, -10),
            (EventKind::Cancel, Side::Bid, -10),
            (EventKind::Cancel, Side::Ask, 10),
            (EventKind::Taker, Side::Bid, 10),
            (EventKind::Taker, Side::Ask, -10),
        ];
        for (kind, side, expected) in cases {
            let mut ev = TickEvent::maker(side, 1, 1000, vol);
            ev.kind = kind;
            assert_eq!(ev.signed_volume(), expected, "{kind:?}/{side:?}");
        }
    }

    #[test]
    fn test_target_id_reversal_for_takers() {
        // Buy taker consumes the resting ask maker
        let ev = TickEvent::taker(Side::Bid, 11, 22, 1000, 5);
        assert_eq!(ev.target_id(), 22);
        assert_eq!(ev.self_id(), 11);

        // Sell taker consumes the resting bid maker
        let ev = TickEvent::taker(Side::Ask, 11, 22, 1000, 5);
        assert_eq!(ev.target_id(), 11);
        assert_eq!(ev.self_id(), 22);

        // Makers and cancels address themselves
        let ev = TickEvent::maker(Side::Ask, 7, 1000, 5);
        assert_eq!(ev.target_id(), 7);
        let ev = TickEvent::cancel(Side::Bid, 9, 1000, 5);
        assert_eq!(ev.target_id(), 9);
    }

    #[test]
    fn test_session_windows() {
        let tick = |h: u8, m: u8| ((h as u32) << 24) | ((m as u32) << 16);

        assert!(session::is_call_auction(tick(9, 15), false));
        assert!(session::is_call_auction(tick(9, 24), false));
        assert!(!session::is_call_auction(tick(9, 25), false));

        assert!(session::is_auction_matching(tick(9, 25)));
        assert!(session::is_auction_matching(tick(9, 29)));
        assert!(!session::is_auction_matching(tick(9, 30)));

        assert!(session::is_continuous(tick(9, 30)));
        assert!(session::is_continuous(tick(11, 29)));
        assert!(!session::is_continuous(tick(11, 30)));
        assert!(!session::is_continuous(tick(12, 30)));
        assert!(session::is_continuous(tick(13, 0)));
        assert!(session::is_continuous(tick(14, 56)));
        assert!(!session::is_continuous(tick(14, 57)));

        // Closing auction only exists on venues that run one
        assert!(session::is_call_auction(tick(14, 57), true));
        assert!(session::is_call_auction(tick(15, 0), true));
        assert!(!session::is_call_auction(tick(14, 57), false));
    }

    #[test]
    fn test_change_events_are_inert() {
        let mut ev = TickEvent::maker(Side::Bid, 1, 1000, 10);
        ev.kind = EventKind::Change;
        assert_eq!(ev.signed_volume(), 0);
        assert_eq!(ev.target_id(), 0);
    }
}
