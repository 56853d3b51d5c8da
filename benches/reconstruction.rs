//! Reconstruction throughput benchmarks.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ashare_lob_reconstructor::codec::{decode_orders_bytes, encode_orders};
use ashare_lob_reconstructor::{Book, BookConfig, Side, TickEvent, Venue};

/// A clean continuous-session tape: makers joined by cancels and takers,
/// prices clustered around the touch: the ~96% fast-path mix.
fn clean_tape(n: usize) -> Vec<TickEvent> {
    let mut events = Vec::with_capacity(n);
    let mut seed = 0x9e3779b9u32;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    let mut live: Vec<(u32, Side, u16, u16)> = Vec::new();
    let mut id = 0u32;
    for i in 0..n {
        let r = next();
        let minute = 30 + ((i / 20_000) % 60) as u8;
        let px = 1000 + (r % 15) as u16;
        let vol = (r % 80) as u16 + 1;

        let ev = match r % 10 {
            0..=5 => {
                id += 1;
                let side = if r & 8 == 0 { Side::Bid } else { Side::Ask };
                live.push((id, side, px, vol));
                TickEvent::maker(side, id, px, vol)
            }
            6 | 7 => {
                if let Some((cid, side, cpx, cvol)) = live.pop() {
                    TickEvent::cancel(side, cid, cpx, cvol)
                } else {
                    id += 1;
                    TickEvent::maker(Side::Bid, id, px, vol)
                }
            }
            _ => {
                if let Some(&(mid, side, mpx, mvol)) = live.last() {
                    live.pop();
                    match side {
                        Side::Ask => TickEvent::taker(Side::Bid, id + 900_000, mid, mpx, mvol),
                        Side::Bid => TickEvent::taker(Side::Ask, mid, id + 900_000, mpx, mvol),
                    }
                } else {
                    id += 1;
                    TickEvent::maker(Side::Ask, id, px, vol)
                }
            }
        };
        events.push(ev.at(9 + (minute / 60), minute % 60, (i % 60) as u8, 0));
    }
    events
}

fn bench_book_replay(c: &mut Criterion) {
    let tape = clean_tape(100_000);

    let mut group = c.benchmark_group("book_replay");
    group.throughput(Throughput::Elements(tape.len() as u64));
    group.bench_function("clean_100k", |b| {
        b.iter(|| {
            let mut book = Book::with_config(
                BookConfig::new(Venue::Shanghai).with_logging(false),
            );
            for ev in &tape {
                let _ = black_box(book.process(ev));
            }
            black_box(book.total_levels())
        })
    });
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let tape = clean_tape(100_000);
    let encoded = encode_orders(&tape).unwrap();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(tape.len() as u64));
    group.bench_function("encode_100k", |b| {
        b.iter(|| black_box(encode_orders(black_box(&tape)).unwrap()))
    });
    group.bench_function("decode_100k", |b| {
        b.iter(|| black_box(decode_orders_bytes(black_box(&encoded)).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_book_replay, bench_codec);
criterion_main!(benches);
