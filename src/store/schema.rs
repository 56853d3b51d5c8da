//! Feature schema: the single source of truth for per-level fields.
//!
//! Each level declares its fields once through `level_schema!`, which
//! expands to both the `FieldDef` table (offsets, kinds, normalization)
//! and the `LevelNRow` record producers fill. Field order in the table is
//! field order in storage, so per-kind contiguity is a property of the
//! declaration; `validate_schemas` checks it at pipeline startup.
//!
//! Time-series and cross-sectional fields occupy disjoint contiguous
//! ranges by construction, which is what lets the sequential and
//! cross-sectional workers write the same row concurrently without
//! overlap.

use crate::error::{PipelineError, Result};

/// Storage level (time resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// One bucket per trading second
    L0,
    /// One bucket per trading minute
    L1,
    /// One bucket per trading hour
    L2,
}

pub const LEVEL_COUNT: usize = 3;

/// Trading seconds per day: 09:30-11:30 plus 13:00-15:00.
const SESSION_SECONDS: usize = 2 * 3600 + 2 * 3600;

impl Level {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Level::L0 => 0,
            Level::L1 => 1,
            Level::L2 => 2,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Level::L0),
            1 => Some(Level::L1),
            2 => Some(Level::L2),
            _ => None,
        }
    }

    /// Seconds per bucket at this level.
    #[inline]
    pub fn bucket_seconds(self) -> usize {
        match self {
            Level::L0 => 1,
            Level::L1 => 60,
            Level::L2 => 3600,
        }
    }

    /// Fixed time-axis length for one trading day.
    #[inline]
    pub fn buckets_per_day(self) -> usize {
        SESSION_SECONDS / self.bucket_seconds()
    }

    /// Field table for this level.
    pub fn schema(self) -> &'static [FieldDef] {
        match self {
            Level::L0 => LEVEL0_FIELDS,
            Level::L1 => LEVEL1_FIELDS,
            Level::L2 => LEVEL2_FIELDS,
        }
    }

    /// Field count for this level.
    #[inline]
    pub fn field_count(self) -> usize {
        self.schema().len()
    }
}

/// Map a wall-clock time to the session-relative second, clamped into the
/// session. Pre-open (auction) maps to 0; the 15:00 close maps to the
/// last bucket.
pub fn session_second(hour: u8, minute: u8, second: u8) -> usize {
    let t = hour as usize * 3600 + minute as usize * 60 + second as usize;
    let morning_open = 9 * 3600 + 30 * 60;
    let morning_close = 11 * 3600 + 30 * 60;
    let afternoon_open = 13 * 3600;
    let afternoon_close = 15 * 3600;

    if t < morning_open {
        0
    } else if t < morning_close {
        t - morning_open
    } else if t < afternoon_open {
        morning_close - morning_open - 1
    } else if t < afternoon_close {
        (morning_close - morning_open) + (t - afternoon_open)
    } else {
        SESSION_SECONDS - 1
    }
}

/// Bucket index at `level` for a wall-clock time.
#[inline]
pub fn time_index(level: Level, hour: u8, minute: u8, second: u8) -> usize {
    session_second(hour, minute, second) / level.bucket_seconds()
}

/// How the field participates in computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Written per-instrument by sequential workers
    TimeSeries,
    /// Written across instruments by the cross-sectional worker
    CrossSectional,
    /// Training label, filled by downstream tooling
    Label,
    /// Copied from exchange snapshots
    Snapshot,
    /// Bookkeeping (validity flags, link indices)
    Meta,
}

/// Normalization policy attached to a field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    None,
    /// Cross-sectional z-score
    ZScore,
    /// Cross-sectional rank mapped through the inverse normal CDF
    RankNormal,
}

/// One field declaration.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub code: &'static str,
    pub kind: FieldKind,
    pub normalization: Normalization,
    pub description: &'static str,
}

/// Declare one level's schema: the field table and the producer-facing
/// row record, from a single list.
macro_rules! level_schema {
    ($table:ident, $row:ident, $( ($field:ident, $kind:ident, $norm:ident, $desc:literal) ),+ $(,)?) => {
        pub const $table: &[FieldDef] = &[
            $( FieldDef {
                code: stringify!($field),
                kind: FieldKind::$kind,
                normalization: Normalization::$norm,
                description: $desc,
            }, )+
        ];

        /// Producer-side record; field order matches the storage layout.
        #[derive(Debug, Clone, Copy, Default, PartialEq)]
        pub struct $row {
            $( pub $field: f32, )+
        }

        impl $row {
            pub const FIELD_COUNT: usize = $table.len();

            /// Copy the record into a storage row slice.
            pub fn write_to(&self, dst: &mut [f32]) {
                let mut i = 0;
                $( dst[i] = self.$field; i += 1; )+
                let _ = i;
            }
        }
    };
}

level_schema!(
    LEVEL0_FIELDS,
    Level0Row,
    (mid_price, TimeSeries, None, "Mid price in 0.01 CNY"),
    (spread, TimeSeries, None, "Best ask minus best bid in ticks"),
    (tob_imbalance, TimeSeries, None, "Net TOB quantity imbalance in [-1,1]"),
    (trade_volume, TimeSeries, None, "Lots traded in this bucket"),
    (cs_spread_rank, CrossSectional, RankNormal, "Spread rank across instruments"),
    (cs_imbalance_z, CrossSectional, ZScore, "Imbalance z-score across instruments"),
    (link_minute, Meta, None, "L1 time index of this row"),
    (link_hour, Meta, None, "L2 time index of this row"),
    (asset_valid, Meta, None, "1.0 when the instrument traded this bucket"),
);

level_schema!(
    LEVEL1_FIELDS,
    Level1Row,
    (vwap, TimeSeries, None, "Volume-weighted average trade price"),
    (high, TimeSeries, None, "Highest mid price in the minute"),
    (low, TimeSeries, None, "Lowest mid price in the minute"),
    (close, TimeSeries, None, "Last mid price in the minute"),
    (tick_count, TimeSeries, None, "Accepted events in the minute"),
    (cs_vwap_rank, CrossSectional, RankNormal, "VWAP rank across instruments"),
    (asset_valid, Meta, None, "1.0 when the instrument traded this minute"),
);

level_schema!(
    LEVEL2_FIELDS,
    Level2Row,
    (vwap, TimeSeries, None, "Volume-weighted average trade price"),
    (high, TimeSeries, None, "Highest mid price in the hour"),
    (low, TimeSeries, None, "Lowest mid price in the hour"),
    (volatility, TimeSeries, None, "Std of minute closes within the hour"),
    (asset_valid, Meta, None, "1.0 when the instrument traded this hour"),
);

/// Offset of `code` in `table`, if declared.
pub fn field_offset(table: &[FieldDef], code: &str) -> Option<usize> {
    table.iter().position(|f| f.code == code)
}

/// Contiguous `[start, end)` range of `kind` fields in `table`.
/// Returns `None` when the kind is absent.
pub fn kind_range(table: &[FieldDef], kind: FieldKind) -> Option<std::ops::Range<usize>> {
    let start = table.iter().position(|f| f.kind == kind)?;
    let end = table.len() - table.iter().rev().position(|f| f.kind == kind).expect("start found");
    Some(start..end)
}

/// Validate that every kind present in every level occupies one
/// contiguous range. Run once at pipeline startup.
pub fn validate_schemas() -> Result<()> {
    for level in [Level::L0, Level::L1, Level::L2] {
        let table = level.schema();
        for kind in [
            FieldKind::TimeSeries,
            FieldKind::CrossSectional,
            FieldKind::Label,
            FieldKind::Snapshot,
            FieldKind::Meta,
        ] {
            if let Some(range) = kind_range(table, kind) {
                for (i, f) in table.iter().enumerate() {
                    let inside = range.contains(&i);
                    if (f.kind == kind) != inside {
                        return Err(PipelineError::Config(format!(
                            "{level:?} schema: {kind:?} fields are not contiguous at '{}'",
                            f.code
                        )));
                    }
                }
            }
        }

        // Duplicate codes would make offsets ambiguous.
        for (i, f) in table.iter().enumerate() {
            if table[..i].iter().any(|g| g.code == f.code) {
                return Err(PipelineError::Config(format!(
                    "{level:?} schema: duplicate field '{}'",
                    f.code
                )));
            }
        }
    }
    Ok(())
}
