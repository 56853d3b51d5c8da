//! Diagnostic tracking for reconstruction anomalies.
//!
//! Engine anomalies are *diagnostics*, not fatals: they point at supplier
//! data problems (dropped events, venue quirks) that the deduction model
//! absorbs but that are worth surfacing for root-cause analysis. The book
//! reports through the [`DiagnosticObserver`] interface; the default
//! [`DiagnosticTracker`] aggregates, deduplicates by construction at the
//! call sites, and exports JSON for supplier debugging.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Price;

/// Category of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Level sign disagrees with its book side well inside the book
    /// during continuous trading (emitted once per level per day)
    SignAnomaly,
    /// Zero-price cancel from a venue that always reports cancel prices
    ZeroPriceCancelRefused,
    /// Call-auction leftover dropped at 09:30 (flush policy disabled)
    AuctionLeftoverDropped,
    /// Event stream carried an unsupported type tag
    UnsupportedEvent,
    /// Compressed input refused by the decoder
    CodecRefused,
}

impl DiagnosticKind {
    /// Human-readable name for summaries and logs.
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticKind::SignAnomaly => "SIGN_ANOMALY",
            DiagnosticKind::ZeroPriceCancelRefused => "ZERO_PRICE_CANCEL_REFUSED",
            DiagnosticKind::AuctionLeftoverDropped => "AUCTION_LEFTOVER_DROPPED",
            DiagnosticKind::UnsupportedEvent => "UNSUPPORTED_EVENT",
            DiagnosticKind::CodecRefused => "CODEC_REFUSED",
        }
    }
}

/// A single diagnostic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Packed tick at emission time
    pub tick: u32,
    pub order_id: Option<u32>,
    pub price: Option<Price>,
    /// Free-form context
    pub detail: String,
}

/// Observer interface through which the engine delivers diagnostics.
pub trait DiagnosticObserver {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic);
}

/// Summary counts by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub total: u64,
    pub by_kind: Vec<(String, u64)>,
}

/// Aggregating tracker with bounded record retention.
///
/// Counting is unbounded; full records are kept only up to `max_records`
/// so a pathological day cannot balloon memory.
#[derive(Debug)]
pub struct DiagnosticTracker {
    records: Vec<Diagnostic>,
    counts: ahash::AHashMap<DiagnosticKind, u64>,
    max_records: usize,
    dropped: u64,
    /// Instrument / context label stamped into exports
    label: String,
}

impl DiagnosticTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_max_records(label, 10_000)
    }

    pub fn with_max_records(label: impl Into<String>, max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            counts: ahash::AHashMap::new(),
            max_records,
            dropped: 0,
            label: label.into(),
        }
    }

    /// Record a diagnostic.
    pub fn record(&mut self, diagnostic: Diagnostic) {
        *self.counts.entry(diagnostic.kind).or_insert(0) += 1;
        if self.records.len() < self.max_records {
            self.records.push(diagnostic);
        } else {
            self.dropped += 1;
        }
    }

    /// Total diagnostics seen (including ones whose records were dropped).
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Count for one kind.
    pub fn count(&self, kind: DiagnosticKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Retained records.
    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    /// Build a summary, kinds sorted by descending count.
    pub fn summary(&self) -> DiagnosticSummary {
        let mut by_kind: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|(k, &v)| (k.name().to_string(), v))
            .collect();
        by_kind.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        DiagnosticSummary {
            total: self.total(),
            by_kind,
        }
    }

    /// Export retained records as JSON lines.
    pub fn export_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Clear all records and counts (new trading day).
    pub fn clear(&mut self) {
        self.records.clear();
        self.counts.clear();
        self.dropped = 0;
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl DiagnosticObserver for DiagnosticTracker {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.record(diagnostic.clone());
    }
}

/// Thread-shareable tracker handle. Each book gets a clone; the pipeline
/// keeps one to aggregate and report at phase end.
#[derive(Clone)]
pub struct SharedTracker(Arc<Mutex<DiagnosticTracker>>);

impl SharedTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(DiagnosticTracker::new(label))))
    }

    /// Run `f` against the inner tracker.
    pub fn with<R>(&self, f: impl FnOnce(&DiagnosticTracker) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        self.0.lock().record(diagnostic);
    }

    pub fn total(&self) -> u64 {
        self.0.lock().total()
    }

    pub fn summary(&self) -> DiagnosticSummary {
        self.0.lock().summary()
    }
}

impl DiagnosticObserver for SharedTracker {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.0.lock().record(diagnostic.clone());
    }
}
