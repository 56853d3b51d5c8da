//! Column compression codec for the persisted event log.
//!
//! Each record type (order, snapshot) has a schema: an ordered list of
//! columns with a logical cell width, signedness, a storage bit width and
//! a delta flag. Encoding gathers one column at a time into a `u64`
//! working buffer, optionally delta-encodes it (wrapping within the cell
//! width so unsigned round trips stay bit-exact), and hands it to one of
//! the column codecs in [`column`]. Decoding reverses the pipeline and
//! refuses anything inconsistent (a truncated header, a count mismatch,
//! an unknown algorithm tag) rather than guessing.

pub mod column;
pub mod decoder;
pub mod encoder;

pub use column::ColumnCodec;
pub use decoder::{
    decode_orders_bytes, decode_orders_file, decode_snapshots_bytes, decode_snapshots_file,
    extract_count_from_filename,
};
pub use encoder::{
    encode_orders, encode_snapshots, orders_filename, snapshots_filename, write_orders_file,
    write_snapshots_file,
};

/// Static description of one column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMeta {
    pub name: &'static str,
    /// Whether the source data (or its deltas) is sign-bearing
    pub signed: bool,
    /// Storage bit width from the schema (used by static bitpacking)
    pub bit_width: u8,
    /// Delta-encode before compression
    pub use_delta: bool,
    /// Codec selection for this column
    pub codec: ColumnCodec,
    /// Logical cell width in bytes (1, 2 or 4)
    pub value_size: usize,
    /// Cells per record (arrays flatten, e.g. the 10-level ladders)
    pub cells_per_record: usize,
}

impl ColumnMeta {
    const fn scalar(
        name: &'static str,
        signed: bool,
        bit_width: u8,
        use_delta: bool,
        codec: ColumnCodec,
        value_size: usize,
    ) -> Self {
        Self {
            name,
            signed,
            bit_width,
            use_delta,
            codec,
            value_size,
            cells_per_record: 1,
        }
    }

    const fn ladder(
        name: &'static str,
        bit_width: u8,
        use_delta: bool,
        codec: ColumnCodec,
    ) -> Self {
        Self {
            name,
            signed: true,
            bit_width,
            use_delta,
            codec,
            value_size: 2,
            cells_per_record: 10,
        }
    }
}

/// Order stream schema: 10 columns.
///
/// Times are delta-friendly (runs of zeros); prices and ids are delta +
/// dynamic widths; the two enum columns dictionary-compress to almost
/// nothing.
pub const ORDER_SCHEMA: [ColumnMeta; 10] = [
    ColumnMeta::scalar("hour", true, 5, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("minute", true, 6, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("second", true, 6, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("centisecond", true, 7, true, ColumnCodec::BitpackDynamic, 1),
    ColumnMeta::scalar("kind", false, 2, false, ColumnCodec::Dict, 1),
    ColumnMeta::scalar("side", false, 1, false, ColumnCodec::Dict, 1),
    ColumnMeta::scalar("price", true, 14, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::scalar("volume", false, 16, false, ColumnCodec::BitpackStatic, 2),
    ColumnMeta::scalar("bid_id", true, 32, true, ColumnCodec::Auto, 4),
    ColumnMeta::scalar("ask_id", true, 32, true, ColumnCodec::Auto, 4),
];

/// Snapshot stream schema: 18 columns (ladders flatten to 10 cells each).
pub const SNAPSHOT_SCHEMA: [ColumnMeta; 18] = [
    ColumnMeta::scalar("hour", true, 5, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("minute", true, 6, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("second", true, 6, true, ColumnCodec::Rle, 1),
    ColumnMeta::scalar("trade_count", false, 8, false, ColumnCodec::Auto, 1),
    ColumnMeta::scalar("volume", false, 16, false, ColumnCodec::BitpackStatic, 2),
    ColumnMeta::scalar("turnover", false, 32, false, ColumnCodec::Auto, 4),
    ColumnMeta::scalar("high", true, 14, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::scalar("low", true, 14, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::scalar("close", true, 14, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::ladder("bid_price_ticks", 14, true, ColumnCodec::BitpackDynamic),
    ColumnMeta::ladder("bid_volumes", 14, false, ColumnCodec::BitpackDynamic),
    ColumnMeta::ladder("ask_price_ticks", 14, true, ColumnCodec::BitpackDynamic),
    ColumnMeta::ladder("ask_volumes", 14, false, ColumnCodec::BitpackDynamic),
    ColumnMeta::scalar("direction", false, 1, false, ColumnCodec::Dict, 1),
    ColumnMeta::scalar("all_bid_vwap", true, 15, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::scalar("all_ask_vwap", true, 15, true, ColumnCodec::BitpackDynamic, 2),
    ColumnMeta::scalar("all_bid_volume", true, 22, true, ColumnCodec::BitpackDynamic, 4),
    ColumnMeta::scalar("all_ask_volume", true, 22, true, ColumnCodec::BitpackDynamic, 4),
];

// ============================================================================
// Delta encoding
// ============================================================================

/// Modular mask for a cell width in bytes.
#[inline]
pub(crate) fn cell_mask(value_size: usize) -> u64 {
    match value_size {
        8 => u64::MAX,
        n => (1u64 << (8 * n)) - 1,
    }
}

/// In-place delta encoding: `x[i] -= x[i-1]`, wrapping within the cell
/// width; `x[0]` stays as the base value.
pub(crate) fn encode_deltas(values: &mut [u64], value_size: usize) {
    let mask = cell_mask(value_size);
    for i in (1..values.len()).rev() {
        values[i] = values[i].wrapping_sub(values[i - 1]) & mask;
    }
}

/// In-place delta decoding: `x[i] += x[i-1]`, wrapping within the cell
/// width.
pub(crate) fn decode_deltas(values: &mut [u64], value_size: usize) {
    let mask = cell_mask(value_size);
    for i in 1..values.len() {
        values[i] = values[i].wrapping_add(values[i - 1]) & mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shapes() {
        assert_eq!(ORDER_SCHEMA.len(), 10);
        assert_eq!(SNAPSHOT_SCHEMA.len(), 18);
        // Ladders carry ten cells per record.
        let ladder = SNAPSHOT_SCHEMA
            .iter()
            .find(|c| c.name == "bid_price_ticks")
            .unwrap();
        assert_eq!(ladder.cells_per_record, 10);
        assert_eq!(ladder.value_size, 2);
    }

    #[test]
    fn test_delta_roundtrip() {
        let original = vec![100u64, 105, 103, 103, 200, 1];
        let mut values = original.clone();
        encode_deltas(&mut values, 2);
        assert_eq!(values[0], 100);
        assert_eq!(values[1], 5);
        // 1 - 200 wraps within u16
        assert_eq!(values[5], (1u64.wrapping_sub(200)) & 0xffff);

        decode_deltas(&mut values, 2);
        assert_eq!(values, original);
    }

    #[test]
    fn test_delta_roundtrip_u32_extremes() {
        let original = vec![u32::MAX as u64, 0, u32::MAX as u64, 1, 2];
        let mut values = original.clone();
        encode_deltas(&mut values, 4);
        decode_deltas(&mut values, 4);
        assert_eq!(values, original);
    }

    #[test]
    fn test_cell_mask() {
        assert_eq!(cell_mask(1), 0xff);
        assert_eq!(cell_mask(2), 0xffff);
        assert_eq!(cell_mask(4), 0xffff_ffff);
        assert_eq!(cell_mask(8), u64::MAX);
    }
}
