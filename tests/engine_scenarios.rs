//! Black-box reconstruction scenarios.
//!
//! Each test drives the engine through a short, realistic event sequence
//! and checks the externally observable book state: levels, TOB, the
//! deferred queue, and the structural invariants.

use ashare_lob_reconstructor::lob::DeferReason;
use ashare_lob_reconstructor::{Book, BookConfig, Side, TickEvent, Venue};

fn book(venue: Venue) -> Book {
    Book::with_config(BookConfig::new(venue).with_logging(false))
}

// ============================================================================
// The concrete input -> output scenarios
// ============================================================================

#[test]
fn scenario_simple_maker_then_taker() {
    let mut b = book(Venue::Shanghai);

    b.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
    // Sell taker consumes 4 of the resting bid.
    b.process(&TickEvent::taker(Side::Ask, 1, 99, 1000, 4)).unwrap();

    assert_eq!(b.best_bid(), 1000);
    assert_eq!(b.level_net_quantity(1000), Some(6));
    assert_eq!(b.level_orders(1000).unwrap(), vec![(1, 6)]);
    assert_eq!(b.total_deferred(), 0);
    b.assert_invariants();
}

#[test]
fn scenario_out_of_order_taker() {
    let mut b = book(Venue::Shanghai);

    // Buy taker arrives before its counterparty ask maker.
    b.process(&TickEvent::taker(Side::Bid, 1, 5, 2000, 3)).unwrap();
    assert_eq!(b.total_deferred(), 1);
    assert_eq!(b.deferred_by_reason(DeferReason::OutOfOrder), 1);
    assert_eq!(b.total_levels(), 0);

    // The maker lands; +3 and -10 meet, leaving -7 resting.
    b.process(&TickEvent::maker(Side::Ask, 5, 2000, 10)).unwrap();
    assert_eq!(b.total_deferred(), 0);
    assert_eq!(b.level_net_quantity(2000), Some(-7));
    b.assert_invariants();
}

#[test]
fn scenario_call_auction_flush_at_0930() {
    let mut b = book(Venue::Shanghai);

    // 09:20: auction maker is parked, not booked.
    b.process(&TickEvent::maker(Side::Bid, 42, 990, 100).at(9, 20, 0, 0))
        .unwrap();
    assert_eq!(b.deferred_by_reason(DeferReason::CallAuction), 1);
    assert_eq!(b.total_levels(), 0);

    // Matching window keeps it parked.
    b.process(&TickEvent::maker(Side::Ask, 50, 1005, 30).at(9, 26, 0, 0))
        .unwrap();
    assert_eq!(b.deferred_by_reason(DeferReason::CallAuction), 2);

    // The 09:30:00 tick finalises the auction: leftovers flush to the
    // book at their reported prices.
    b.process(&TickEvent::maker(Side::Bid, 60, 985, 5).at(9, 30, 0, 0))
        .unwrap();

    assert_eq!(b.deferred_by_reason(DeferReason::CallAuction), 0);
    assert_eq!(b.level_net_quantity(990), Some(100));
    assert_eq!(b.level_net_quantity(1005), Some(-30));
    assert_eq!(b.best_bid(), 990);
    assert_eq!(b.best_ask(), 1005);
    b.assert_invariants();
    b.assert_tob_uncrossed();
}

#[test]
fn scenario_zero_price_cancel_after_maker() {
    let mut b = book(Venue::Shenzhen);

    b.process(&TickEvent::maker(Side::Bid, 7, 1100, 5)).unwrap();
    // Shenzhen cancel without a price: the resident maker supplies it.
    b.process(&TickEvent::cancel(Side::Bid, 7, 0, 5)).unwrap();

    assert_eq!(b.level_net_quantity(1100), None);
    assert!(!b.contains_order(7));
    assert_eq!(b.total_deferred(), 0);
    b.assert_invariants();
}

#[test]
fn scenario_special_maker_then_taker() {
    let mut b = book(Venue::Shanghai);

    // Market order enters as a price-0 maker and waits for its price.
    b.process(&TickEvent::maker(Side::Bid, 9, 0, 8)).unwrap();
    assert_eq!(b.deferred_by_reason(DeferReason::SpecialMaker), 1);
    assert_eq!(b.total_levels(), 0);

    // The trade prints against it with the real execution price.
    b.process(&TickEvent::taker(Side::Ask, 9, 70, 1050, 8)).unwrap();

    assert_eq!(b.total_deferred(), 0);
    assert_eq!(b.total_levels(), 0);
    assert_eq!(b.total_orders(), 0);
    b.assert_invariants();
}

#[test]
fn scenario_tob_advance_on_full_consumption() {
    let mut b = book(Venue::Shanghai);

    b.process(&TickEvent::maker(Side::Ask, 1, 1000, 5)).unwrap();
    b.process(&TickEvent::maker(Side::Ask, 2, 1001, 7)).unwrap();
    assert_eq!(b.best_ask(), 1000);

    // Buy taker consumes all of 1000.
    b.process(&TickEvent::taker(Side::Bid, 10, 1, 1000, 5)).unwrap();
    assert_eq!(b.best_ask(), 1001);
    assert_eq!(b.level_net_quantity(1000), None);
    b.assert_invariants();
    b.assert_tob_uncrossed();
}

// ============================================================================
// Boundary behaviours and longer sequences
// ============================================================================

#[test]
fn auction_queue_is_empty_of_call_auction_entries_after_0930() {
    let mut b = book(Venue::Shanghai);

    for (id, px, vol) in [(1u32, 990u16, 10u16), (2, 991, 20), (3, 992, 30)] {
        b.process(&TickEvent::maker(Side::Bid, id, px, vol).at(9, 16, 0, 0))
            .unwrap();
    }
    // An out-of-order cancel is NOT an auction entry; it must survive
    // the flush untouched.
    b.process(&TickEvent::cancel(Side::Bid, 99, 988, 5).at(9, 29, 0, 0))
        .unwrap();
    assert_eq!(b.total_deferred(), 4);

    b.process(&TickEvent::maker(Side::Bid, 4, 989, 1).at(9, 30, 0, 0))
        .unwrap();

    assert_eq!(b.deferred_by_reason(DeferReason::CallAuction), 0);
    assert_eq!(b.deferred_by_reason(DeferReason::OutOfOrder), 1);
    assert_eq!(b.level_net_quantity(990), Some(10));
    assert_eq!(b.level_net_quantity(991), Some(20));
    assert_eq!(b.level_net_quantity(992), Some(30));
    b.assert_invariants();
}

#[test]
fn matching_period_takers_consume_at_clearing_price() {
    let mut b = book(Venue::Shanghai);

    // Two auction makers on opposite sides.
    b.process(&TickEvent::maker(Side::Bid, 1, 1003, 10).at(9, 18, 0, 0))
        .unwrap();
    b.process(&TickEvent::maker(Side::Ask, 2, 997, 10).at(9, 19, 0, 0))
        .unwrap();

    // The auction crosses them at a single clearing price; each trade
    // report consumes one queued maker.
    b.process(&TickEvent::taker(Side::Bid, 1, 2, 1000, 10).at(9, 25, 0, 1))
        .unwrap();
    b.process(&TickEvent::taker(Side::Ask, 1, 2, 1000, 10).at(9, 25, 0, 2))
        .unwrap();

    assert_eq!(b.total_deferred(), 0);
    // Nothing reaches the book: the auction fully matched both.
    assert_eq!(b.total_levels(), 0);

    // The 09:30 transition has nothing left to flush.
    b.process(&TickEvent::maker(Side::Bid, 5, 995, 1).at(9, 30, 0, 0))
        .unwrap();
    assert_eq!(b.total_levels(), 1);
    b.assert_invariants();
}

#[test]
fn partial_cancels_deplete_a_queued_maker_gradually() {
    let mut b = book(Venue::Shenzhen);

    // Auction maker for 100 lots.
    b.process(&TickEvent::maker(Side::Bid, 8, 1000, 100).at(9, 20, 0, 0))
        .unwrap();

    // Two partial cancels inside the auction window shrink it in place.
    b.process(&TickEvent::cancel(Side::Bid, 8, 1000, 30).at(9, 21, 0, 0))
        .unwrap();
    b.process(&TickEvent::cancel(Side::Bid, 8, 1000, 30).at(9, 22, 0, 0))
        .unwrap();
    assert_eq!(b.deferred_by_reason(DeferReason::CallAuction), 1);

    // Flush books the remaining 40.
    b.process(&TickEvent::maker(Side::Ask, 9, 1010, 5).at(9, 30, 0, 0))
        .unwrap();
    assert_eq!(b.level_net_quantity(1000), Some(40));

    // A final over-cancel empties it (sign flip counts as consumed).
    b.process(&TickEvent::cancel(Side::Bid, 8, 1000, 40).at(9, 31, 0, 0))
        .unwrap();
    assert_eq!(b.level_net_quantity(1000), None);
    b.assert_invariants();
}

#[test]
fn interleaved_stress_preserves_invariants() {
    let mut b = book(Venue::Shenzhen);

    // A deterministic pseudo-random mix of makers, cancels and takers,
    // including out-of-order pairs, across a tight price band.
    let mut seed = 0x2545f491u32;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    let mut live_ids: Vec<(u32, Side)> = Vec::new();
    for i in 0..5000u32 {
        let r = next();
        let minute = 31 + (i / 500) as u8;
        let px = 1000 + (r % 11) as u16;
        let vol = (r % 50) as u16 + 1;

        match r % 10 {
            // Makers dominate.
            0..=4 => {
                let id = i + 1;
                let side = if r % 2 == 0 { Side::Bid } else { Side::Ask };
                b.process(&TickEvent::maker(side, id, px, vol).at(9, minute, (i % 60) as u8, 0))
                    .unwrap();
                live_ids.push((id, side));
            }
            // Cancels target a random live id with a random amount.
            5 | 6 => {
                if let Some(&(id, side)) = live_ids.get(r as usize % live_ids.len().max(1)) {
                    b.process(&TickEvent::cancel(side, id, px, vol).at(9, minute, (i % 60) as u8, 0))
                        .unwrap();
                }
            }
            // Takers hit a random live id as counterparty.
            7 | 8 => {
                if let Some(&(id, side)) = live_ids.get(r as usize % live_ids.len().max(1)) {
                    let ev = match side {
                        Side::Ask => TickEvent::taker(Side::Bid, i + 1, id, px, vol),
                        Side::Bid => TickEvent::taker(Side::Ask, id, i + 1, px, vol),
                    };
                    b.process(&ev.at(9, minute, (i % 60) as u8, 0)).unwrap();
                }
            }
            // Out-of-order: cancel an id that never existed.
            _ => {
                b.process(
                    &TickEvent::cancel(Side::Bid, 1_000_000 + i, px, vol)
                        .at(9, minute, (i % 60) as u8, 0),
                )
                .unwrap();
            }
        }

        if i % 500 == 0 {
            b.assert_invariants();
        }
    }
    b.assert_invariants();
    assert!(b.stats().events_processed >= 4000);
}

#[test]
fn clear_then_replay_is_deterministic() {
    let tape: Vec<TickEvent> = vec![
        TickEvent::maker(Side::Bid, 1, 1000, 10).at(9, 31, 0, 0),
        TickEvent::maker(Side::Ask, 2, 1002, 8).at(9, 31, 1, 0),
        TickEvent::taker(Side::Bid, 3, 2, 1002, 3).at(9, 31, 2, 0),
        TickEvent::cancel(Side::Bid, 1, 1000, 4).at(9, 31, 3, 0),
        TickEvent::maker(Side::Bid, 4, 1001, 6).at(9, 31, 4, 0),
    ];

    let snapshot = |b: &Book| {
        let mut bids = Vec::new();
        b.for_each_visible_bid(10, |p, q| bids.push((p, q)));
        let mut asks = Vec::new();
        b.for_each_visible_ask(10, |p, q| asks.push((p, q)));
        (b.best_bid(), b.best_ask(), bids, asks, b.total_orders())
    };

    let mut b = book(Venue::Shanghai);
    for ev in &tape {
        b.process(ev).unwrap();
    }
    let first = snapshot(&b);

    b.clear();
    for ev in &tape {
        b.process(ev).unwrap();
    }
    let second = snapshot(&b);

    assert_eq!(first, second);
    b.assert_invariants();
}
