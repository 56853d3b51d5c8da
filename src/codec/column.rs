//! The per-column codecs.
//!
//! Block layout on the wire:
//!
//! ```text
//! u64le num_values | u64le value_size | codec-specific header + body
//! ```
//!
//! All cells travel through a `u64` working domain; the block header's
//! `value_size` is the logical cell width the decoder narrows back to.
//! Every decoder validates the header against the consumer's expectation
//! and refuses truncated or inconsistent blocks.

use ahash::AHashMap;

use crate::error::{PipelineError, Result};

use super::{decode_deltas, encode_deltas, ColumnMeta};

/// Codec selection for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCodec {
    /// Raw cells
    None,
    /// Run-length encoding, runs capped at 255
    Rle,
    /// Dictionary of up to 255 unique values, raw fallback beyond that
    Dict,
    /// Fixed bit width from the schema
    BitpackStatic,
    /// Width from the 95th percentile, overflow table for the tail
    BitpackDynamic,
    /// Try candidates, keep the smallest, tag the winner
    Auto,
}

/// Algorithm tags used by the auto-select wrapper.
const AUTO_RLE: u8 = 0;
const AUTO_DICT: u8 = 1;
const AUTO_BITPACK_DYNAMIC: u8 = 2;
const AUTO_NONE: u8 = 3;

// ============================================================================
// Block-level entry points
// ============================================================================

/// Encode one column into `out`. `values` holds the widened cells in
/// record order (ladders already flattened).
pub fn encode_column(meta: &ColumnMeta, values: &[u64], out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&(values.len() as u64).to_le_bytes());
    out.extend_from_slice(&(meta.value_size as u64).to_le_bytes());

    let mut work;
    let values = if meta.use_delta {
        work = values.to_vec();
        encode_deltas(&mut work, meta.value_size);
        &work[..]
    } else {
        values
    };

    encode_body(meta.codec, meta, values, out)
}

/// Decode one column at `cursor`, expecting exactly `expected` cells.
/// Advances the cursor past the block.
pub fn decode_column(
    meta: &ColumnMeta,
    bytes: &[u8],
    cursor: &mut usize,
    expected: usize,
) -> Result<Vec<u64>> {
    let num_values = read_u64le(meta.name, bytes, cursor)? as usize;
    let value_size = read_u64le(meta.name, bytes, cursor)? as usize;

    if num_values != expected {
        return Err(PipelineError::CountMismatch {
            column: meta.name,
            expected,
            found: num_values,
        });
    }
    if value_size != meta.value_size {
        return Err(PipelineError::corrupt(
            meta.name,
            format!("cell width {} != schema {}", value_size, meta.value_size),
        ));
    }

    let mut values = decode_body(meta.codec, meta, bytes, cursor, num_values)?;
    if meta.use_delta {
        decode_deltas(&mut values, meta.value_size);
    }
    Ok(values)
}

// ============================================================================
// Codec bodies
// ============================================================================

fn encode_body(
    codec: ColumnCodec,
    meta: &ColumnMeta,
    values: &[u64],
    out: &mut Vec<u8>,
) -> Result<()> {
    match codec {
        ColumnCodec::None => {
            encode_raw(values, meta.value_size, out);
            Ok(())
        }
        ColumnCodec::Rle => {
            encode_rle(values, meta.value_size, out);
            Ok(())
        }
        ColumnCodec::Dict => {
            encode_dict(values, meta.value_size, out);
            Ok(())
        }
        ColumnCodec::BitpackStatic => encode_bitpack_static(meta, values, out),
        ColumnCodec::BitpackDynamic => {
            encode_bitpack_dynamic(values, out);
            Ok(())
        }
        ColumnCodec::Auto => encode_auto(meta, values, out),
    }
}

fn decode_body(
    codec: ColumnCodec,
    meta: &ColumnMeta,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
) -> Result<Vec<u64>> {
    match codec {
        ColumnCodec::None => decode_raw(meta.name, bytes, cursor, n, meta.value_size),
        ColumnCodec::Rle => decode_rle(meta.name, bytes, cursor, n, meta.value_size),
        ColumnCodec::Dict => decode_dict(meta.name, bytes, cursor, n, meta.value_size),
        ColumnCodec::BitpackStatic => decode_bitpack_static(meta.name, bytes, cursor, n),
        ColumnCodec::BitpackDynamic => decode_bitpack_dynamic(meta.name, bytes, cursor, n),
        ColumnCodec::Auto => decode_auto(meta, bytes, cursor, n),
    }
}

// ----------------------------------------------------------------------------
// Raw
// ----------------------------------------------------------------------------

fn encode_raw(values: &[u64], value_size: usize, out: &mut Vec<u8>) {
    for &v in values {
        out.extend_from_slice(&v.to_le_bytes()[..value_size]);
    }
}

fn decode_raw(
    col: &'static str,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
    value_size: usize,
) -> Result<Vec<u64>> {
    let need = n * value_size;
    if bytes.len() < *cursor + need {
        return Err(PipelineError::corrupt(col, "truncated raw body"));
    }
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        values.push(read_cell(&bytes[*cursor + i * value_size..], value_size));
    }
    *cursor += need;
    Ok(values)
}

// ----------------------------------------------------------------------------
// RLE
// ----------------------------------------------------------------------------

fn encode_rle(values: &[u64], value_size: usize, out: &mut Vec<u8>) {
    let mut i = 0;
    while i < values.len() {
        let mut run = 1usize;
        while run < 255 && i + run < values.len() && values[i + run] == values[i] {
            run += 1;
        }
        out.push(run as u8);
        out.extend_from_slice(&values[i].to_le_bytes()[..value_size]);
        i += run;
    }
}

fn decode_rle(
    col: &'static str,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
    value_size: usize,
) -> Result<Vec<u64>> {
    let mut values = Vec::with_capacity(n);
    while values.len() < n {
        if bytes.len() < *cursor + 1 + value_size {
            return Err(PipelineError::corrupt(col, "truncated RLE run"));
        }
        let run = bytes[*cursor] as usize;
        *cursor += 1;
        if run == 0 {
            return Err(PipelineError::corrupt(col, "zero-length RLE run"));
        }
        if values.len() + run > n {
            return Err(PipelineError::corrupt(col, "RLE run overflows value count"));
        }
        let value = read_cell(&bytes[*cursor..], value_size);
        *cursor += value_size;
        values.resize(values.len() + run, value);
    }
    Ok(values)
}

// ----------------------------------------------------------------------------
// Dictionary
// ----------------------------------------------------------------------------

fn encode_dict(values: &[u64], value_size: usize, out: &mut Vec<u8>) {
    let mut index_of: AHashMap<u64, u8> = AHashMap::new();
    let mut dict: Vec<u64> = Vec::new();

    for &v in values {
        if !index_of.contains_key(&v) {
            if dict.len() >= 255 {
                // Too many uniques: 0 marks the raw fallback.
                out.push(0);
                encode_raw(values, value_size, out);
                return;
            }
            index_of.insert(v, dict.len() as u8);
            dict.push(v);
        }
    }

    out.push(dict.len() as u8);
    for &v in &dict {
        out.extend_from_slice(&v.to_le_bytes()[..value_size]);
    }
    for &v in values {
        out.push(index_of[&v]);
    }
}

fn decode_dict(
    col: &'static str,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
    value_size: usize,
) -> Result<Vec<u64>> {
    if bytes.len() < *cursor + 1 {
        return Err(PipelineError::corrupt(col, "truncated dictionary header"));
    }
    let n_unique = bytes[*cursor] as usize;
    *cursor += 1;

    if n_unique == 0 {
        return decode_raw(col, bytes, cursor, n, value_size);
    }

    if bytes.len() < *cursor + n_unique * value_size + n {
        return Err(PipelineError::corrupt(col, "truncated dictionary body"));
    }
    let mut dict = Vec::with_capacity(n_unique);
    for i in 0..n_unique {
        dict.push(read_cell(&bytes[*cursor + i * value_size..], value_size));
    }
    *cursor += n_unique * value_size;

    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let idx = bytes[*cursor + i] as usize;
        if idx >= n_unique {
            return Err(PipelineError::corrupt(
                col,
                format!("dictionary index {idx} out of range {n_unique}"),
            ));
        }
        values.push(dict[idx]);
    }
    *cursor += n;
    Ok(values)
}

// ----------------------------------------------------------------------------
// Bit packing
// ----------------------------------------------------------------------------

/// Minimum bits to represent `max_value` (1 for zero).
fn bits_needed(max_value: u64) -> u8 {
    if max_value == 0 {
        1
    } else {
        (64 - max_value.leading_zeros()) as u8
    }
}

fn pack_bits(values: &[u64], width: u8, out: &mut Vec<u8>) {
    let total_bits = values.len() * width as usize;
    let start = out.len();
    out.resize(start + total_bits.div_ceil(8), 0);

    let mut bit_pos = 0usize;
    for &v in values {
        for bit in 0..width {
            if v & (1u64 << bit) != 0 {
                out[start + bit_pos / 8] |= 1 << (bit_pos % 8);
            }
            bit_pos += 1;
        }
    }
}

fn unpack_bits(bytes: &[u8], n: usize, width: u8) -> Vec<u64> {
    let mut values = Vec::with_capacity(n);
    let mut bit_pos = 0usize;
    for _ in 0..n {
        let mut v = 0u64;
        for bit in 0..width {
            if bytes[bit_pos / 8] & (1 << (bit_pos % 8)) != 0 {
                v |= 1u64 << bit;
            }
            bit_pos += 1;
        }
        values.push(v);
    }
    values
}

fn encode_bitpack_static(meta: &ColumnMeta, values: &[u64], out: &mut Vec<u8>) -> Result<()> {
    let width = meta.bit_width;
    let limit = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    if let Some(&bad) = values.iter().find(|&&v| v > limit) {
        return Err(PipelineError::corrupt(
            meta.name,
            format!("value {bad} exceeds static width {width}"),
        ));
    }
    out.push(width);
    pack_bits(values, width, out);
    Ok(())
}

fn decode_bitpack_static(
    col: &'static str,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
) -> Result<Vec<u64>> {
    if bytes.len() < *cursor + 1 {
        return Err(PipelineError::corrupt(col, "truncated bitpack header"));
    }
    let width = bytes[*cursor];
    *cursor += 1;
    if width == 0 || width > 64 {
        return Err(PipelineError::corrupt(col, format!("bad bit width {width}")));
    }

    let packed = (n * width as usize).div_ceil(8);
    if bytes.len() < *cursor + packed {
        return Err(PipelineError::corrupt(col, "truncated bitpack body"));
    }
    let values = unpack_bits(&bytes[*cursor..*cursor + packed], n, width);
    *cursor += packed;
    Ok(values)
}

/// 95th-percentile magnitude, the dynamic packer's width anchor.
fn percentile_95(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() * 95) / 100).min(values.len() - 1);
    sorted[idx]
}

fn encode_bitpack_dynamic(values: &[u64], out: &mut Vec<u8>) {
    let width = bits_needed(percentile_95(values));
    let cap = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };

    // Values beyond the packed range are clamped in the main body and
    // restored from the overflow table.
    let mut packed_values = Vec::with_capacity(values.len());
    let mut overflow: Vec<(u32, u64)> = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        if v > cap {
            overflow.push((i as u32, v));
            packed_values.push(cap);
        } else {
            packed_values.push(v);
        }
    }

    out.push(width);
    out.extend_from_slice(&(overflow.len() as u32).to_le_bytes());
    pack_bits(&packed_values, width, out);
    for (idx, v) in overflow {
        out.extend_from_slice(&idx.to_le_bytes());
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn decode_bitpack_dynamic(
    col: &'static str,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
) -> Result<Vec<u64>> {
    if bytes.len() < *cursor + 1 + 4 {
        return Err(PipelineError::corrupt(col, "truncated dynamic bitpack header"));
    }
    let width = bytes[*cursor];
    *cursor += 1;
    if width == 0 || width > 64 {
        return Err(PipelineError::corrupt(col, format!("bad bit width {width}")));
    }
    let overflow_count = read_u32le(col, bytes, cursor)? as usize;

    let packed = (n * width as usize).div_ceil(8);
    if bytes.len() < *cursor + packed + overflow_count * 12 {
        return Err(PipelineError::corrupt(col, "truncated dynamic bitpack body"));
    }
    let mut values = unpack_bits(&bytes[*cursor..*cursor + packed], n, width);
    *cursor += packed;

    for _ in 0..overflow_count {
        let idx = read_u32le(col, bytes, cursor)? as usize;
        let v = read_u64le(col, bytes, cursor)?;
        if idx >= n {
            return Err(PipelineError::corrupt(
                col,
                format!("overflow index {idx} out of range {n}"),
            ));
        }
        values[idx] = v;
    }
    Ok(values)
}

// ----------------------------------------------------------------------------
// Auto-select
// ----------------------------------------------------------------------------

fn encode_auto(meta: &ColumnMeta, values: &[u64], out: &mut Vec<u8>) -> Result<()> {
    let mut best_tag = AUTO_NONE;
    let mut best = Vec::new();
    encode_raw(values, meta.value_size, &mut best);

    let mut candidate = Vec::new();
    encode_rle(values, meta.value_size, &mut candidate);
    if candidate.len() < best.len() {
        best_tag = AUTO_RLE;
        best = std::mem::take(&mut candidate);
    }

    candidate.clear();
    encode_dict(values, meta.value_size, &mut candidate);
    if candidate.len() < best.len() {
        best_tag = AUTO_DICT;
        best = std::mem::take(&mut candidate);
    }

    candidate.clear();
    encode_bitpack_dynamic(values, &mut candidate);
    if candidate.len() < best.len() {
        best_tag = AUTO_BITPACK_DYNAMIC;
        best = std::mem::take(&mut candidate);
    }

    out.push(best_tag);
    out.extend_from_slice(&best);
    Ok(())
}

fn decode_auto(
    meta: &ColumnMeta,
    bytes: &[u8],
    cursor: &mut usize,
    n: usize,
) -> Result<Vec<u64>> {
    if bytes.len() < *cursor + 1 {
        return Err(PipelineError::corrupt(meta.name, "truncated auto-select tag"));
    }
    let tag = bytes[*cursor];
    *cursor += 1;
    match tag {
        AUTO_RLE => decode_rle(meta.name, bytes, cursor, n, meta.value_size),
        AUTO_DICT => decode_dict(meta.name, bytes, cursor, n, meta.value_size),
        AUTO_BITPACK_DYNAMIC => decode_bitpack_dynamic(meta.name, bytes, cursor, n),
        AUTO_NONE => decode_raw(meta.name, bytes, cursor, n, meta.value_size),
        other => Err(PipelineError::UnknownAlgorithm(other)),
    }
}

// ----------------------------------------------------------------------------
// Little-endian readers
// ----------------------------------------------------------------------------

#[inline]
fn read_cell(bytes: &[u8], value_size: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..value_size].copy_from_slice(&bytes[..value_size]);
    u64::from_le_bytes(buf)
}

fn read_u64le(col: &'static str, bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    if bytes.len() < *cursor + 8 {
        return Err(PipelineError::corrupt(col, "truncated u64 field"));
    }
    let v = u64::from_le_bytes(bytes[*cursor..*cursor + 8].try_into().expect("length checked"));
    *cursor += 8;
    Ok(v)
}

fn read_u32le(col: &'static str, bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if bytes.len() < *cursor + 4 {
        return Err(PipelineError::corrupt(col, "truncated u32 field"));
    }
    let v = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().expect("length checked"));
    *cursor += 4;
    Ok(v)
}
