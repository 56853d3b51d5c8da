//! Record-batch encoding to the on-disk event log format.
//!
//! File layout: a little-endian `u64` record count, then one column block
//! per schema entry in schema order. The record count is also embedded in
//! the filename (`<asset>_orders_<N>.bin`), which lets the pipeline learn
//! a day's order count from a directory listing without opening the file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{SnapshotRecord, TickEvent};

use super::column::encode_column;
use super::{ColumnMeta, ORDER_SCHEMA, SNAPSHOT_SCHEMA};

/// Filename for an encoded order stream.
pub fn orders_filename(asset: &str, count: usize) -> String {
    format!("{asset}_orders_{count}.bin")
}

/// Filename for an encoded snapshot stream.
pub fn snapshots_filename(asset: &str, count: usize) -> String {
    format!("{asset}_snapshots_{count}.bin")
}

fn gather(meta: &ColumnMeta, n: usize, mut cell: impl FnMut(usize, usize) -> u64) -> Vec<u64> {
    let mut values = Vec::with_capacity(n * meta.cells_per_record);
    for rec in 0..n {
        for c in 0..meta.cells_per_record {
            values.push(cell(rec, c));
        }
    }
    values
}

/// Encode an order stream into the file body (count header included).
pub fn encode_orders(orders: &[TickEvent]) -> Result<Vec<u8>> {
    let n = orders.len();
    let mut out = Vec::with_capacity(16 + n * 4);
    out.extend_from_slice(&(n as u64).to_le_bytes());

    for meta in &ORDER_SCHEMA {
        let values = gather(meta, n, |rec, _| {
            let ev = &orders[rec];
            match meta.name {
                "hour" => ev.hour as u64,
                "minute" => ev.minute as u64,
                "second" => ev.second as u64,
                "centisecond" => ev.centisecond as u64,
                "kind" => ev.kind.to_tag() as u64,
                "side" => ev.side.to_tag() as u64,
                "price" => ev.price as u64,
                "volume" => ev.volume as u64,
                "bid_id" => ev.bid_id as u64,
                "ask_id" => ev.ask_id as u64,
                other => unreachable!("unknown order column {other}"),
            }
        });
        encode_column(meta, &values, &mut out)?;
    }
    Ok(out)
}

/// Encode a snapshot stream into the file body (count header included).
pub fn encode_snapshots(snapshots: &[SnapshotRecord]) -> Result<Vec<u8>> {
    let n = snapshots.len();
    let mut out = Vec::with_capacity(16 + n * 16);
    out.extend_from_slice(&(n as u64).to_le_bytes());

    for meta in &SNAPSHOT_SCHEMA {
        let values = gather(meta, n, |rec, c| {
            let s = &snapshots[rec];
            match meta.name {
                "hour" => s.hour as u64,
                "minute" => s.minute as u64,
                "second" => s.second as u64,
                "trade_count" => s.trade_count as u64,
                "volume" => s.volume as u64,
                "turnover" => s.turnover as u64,
                "high" => s.high as u64,
                "low" => s.low as u64,
                "close" => s.close as u64,
                "bid_price_ticks" => s.bid_prices[c] as u64,
                "bid_volumes" => s.bid_volumes[c] as u64,
                "ask_price_ticks" => s.ask_prices[c] as u64,
                "ask_volumes" => s.ask_volumes[c] as u64,
                "direction" => s.direction as u64,
                "all_bid_vwap" => s.all_bid_vwap as u64,
                "all_ask_vwap" => s.all_ask_vwap as u64,
                "all_bid_volume" => s.all_bid_volume as u64,
                "all_ask_volume" => s.all_ask_volume as u64,
                other => unreachable!("unknown snapshot column {other}"),
            }
        });
        encode_column(meta, &values, &mut out)?;
    }
    Ok(out)
}

/// Encode and write an order stream under `dir`. Returns the file path.
pub fn write_orders_file(dir: &Path, asset: &str, orders: &[TickEvent]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(orders_filename(asset, orders.len()));
    fs::write(&path, encode_orders(orders)?)?;
    Ok(path)
}

/// Encode and write a snapshot stream under `dir`. Returns the file path.
pub fn write_snapshots_file(
    dir: &Path,
    asset: &str,
    snapshots: &[SnapshotRecord],
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(snapshots_filename(asset, snapshots.len()));
    fs::write(&path, encode_snapshots(snapshots)?)?;
    Ok(path)
}
