//! Strict decoding of the on-disk event log format.
//!
//! The decoder refuses, never repairs: a truncated header, a column whose
//! declared count disagrees with the file header, trailing garbage, or a
//! filename whose embedded count contradicts the header all fail the file
//! with a codec error. Corruption here means the (asset, date) pair is
//! marked failed upstream; silently truncated tapes would poison every
//! feature computed from them.

use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::types::{EventKind, Side, SnapshotRecord, TickEvent};

use super::column::decode_column;
use super::{ORDER_SCHEMA, SNAPSHOT_SCHEMA};

/// Parse the record count embedded in `<asset>_<stream>_<N>.bin`.
pub fn extract_count_from_filename(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let tail = stem.rsplit('_').next()?;
    tail.parse().ok()
}

fn read_file_header(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(PipelineError::corrupt("file_header", "truncated count header"));
    }
    Ok(u64::from_le_bytes(bytes[..8].try_into().expect("length checked")))
}

/// Decode an order stream from the raw file body.
pub fn decode_orders_bytes(bytes: &[u8]) -> Result<Vec<TickEvent>> {
    let n = read_file_header(bytes)? as usize;
    let mut cursor = 8usize;

    let mut columns = Vec::with_capacity(ORDER_SCHEMA.len());
    for meta in &ORDER_SCHEMA {
        columns.push(decode_column(meta, bytes, &mut cursor, n * meta.cells_per_record)?);
    }
    if cursor != bytes.len() {
        return Err(PipelineError::corrupt(
            "file_body",
            format!("{} trailing bytes", bytes.len() - cursor),
        ));
    }

    let mut orders = Vec::with_capacity(n);
    for i in 0..n {
        let kind_tag = columns[4][i] as u8;
        let side_tag = columns[5][i] as u8;
        let kind = EventKind::from_tag(kind_tag)
            .ok_or_else(|| PipelineError::corrupt("kind", format!("bad tag {kind_tag}")))?;
        let side = Side::from_tag(side_tag)
            .ok_or_else(|| PipelineError::corrupt("side", format!("bad tag {side_tag}")))?;

        orders.push(TickEvent {
            hour: columns[0][i] as u8,
            minute: columns[1][i] as u8,
            second: columns[2][i] as u8,
            centisecond: columns[3][i] as u8,
            kind,
            side,
            price: columns[6][i] as u16,
            volume: columns[7][i] as u16,
            bid_id: columns[8][i] as u32,
            ask_id: columns[9][i] as u32,
        });
    }
    Ok(orders)
}

/// Decode a snapshot stream from the raw file body.
pub fn decode_snapshots_bytes(bytes: &[u8]) -> Result<Vec<SnapshotRecord>> {
    let n = read_file_header(bytes)? as usize;
    let mut cursor = 8usize;

    let mut columns = Vec::with_capacity(SNAPSHOT_SCHEMA.len());
    for meta in &SNAPSHOT_SCHEMA {
        columns.push(decode_column(meta, bytes, &mut cursor, n * meta.cells_per_record)?);
    }
    if cursor != bytes.len() {
        return Err(PipelineError::corrupt(
            "file_body",
            format!("{} trailing bytes", bytes.len() - cursor),
        ));
    }

    let mut snapshots = Vec::with_capacity(n);
    for i in 0..n {
        let mut s = SnapshotRecord {
            hour: columns[0][i] as u8,
            minute: columns[1][i] as u8,
            second: columns[2][i] as u8,
            trade_count: columns[3][i] as u8,
            volume: columns[4][i] as u16,
            turnover: columns[5][i] as u32,
            high: columns[6][i] as u16,
            low: columns[7][i] as u16,
            close: columns[8][i] as u16,
            direction: columns[13][i] != 0,
            all_bid_vwap: columns[14][i] as u16,
            all_ask_vwap: columns[15][i] as u16,
            all_bid_volume: columns[16][i] as u32,
            all_ask_volume: columns[17][i] as u32,
            ..Default::default()
        };
        for lvl in 0..10 {
            s.bid_prices[lvl] = columns[9][i * 10 + lvl] as u16;
            s.bid_volumes[lvl] = columns[10][i * 10 + lvl] as u16;
            s.ask_prices[lvl] = columns[11][i * 10 + lvl] as u16;
            s.ask_volumes[lvl] = columns[12][i * 10 + lvl] as u16;
        }
        snapshots.push(s);
    }
    Ok(snapshots)
}

fn check_filename_count(path: &Path, header_count: u64) -> Result<()> {
    if let Some(filename_count) = extract_count_from_filename(path) {
        if filename_count != header_count {
            return Err(PipelineError::FileCountMismatch {
                path: path.to_path_buf(),
                filename_count,
                header_count,
            });
        }
    }
    Ok(())
}

/// Decode an order file, cross-checking the filename-embedded count.
pub fn decode_orders_file(path: &Path) -> Result<Vec<TickEvent>> {
    let bytes = fs::read(path)?;
    check_filename_count(path, read_file_header(&bytes)?)?;
    decode_orders_bytes(&bytes)
}

/// Decode a snapshot file, cross-checking the filename-embedded count.
pub fn decode_snapshots_file(path: &Path) -> Result<Vec<SnapshotRecord>> {
    let bytes = fs::read(path)?;
    check_filename_count(path, read_file_header(&bytes)?)?;
    decode_snapshots_bytes(&bytes)
}
