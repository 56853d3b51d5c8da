//! # ashare-lob-reconstructor
//!
//! Limit order book reconstruction and feature extraction for Chinese
//! A-share tick-by-tick (L2) data.
//!
//! The crate rebuilds a per-instrument LOB from the merged order/trade
//! event stream with a *deduction model*: every event applies a signed
//! volume to a target order id, and a unified deferred queue absorbs the
//! venue's adversarial cases (out-of-order arrivals, call auctions,
//! price-less market orders, Shenzhen's price-less cancels). Around the
//! engine sit a column-compression codec for the persisted event log, a
//! pooled f16 feature store with a progress-fence synchronisation
//! protocol, and a multi-phase worker pipeline.
//!
//! ## Quick start
//!
//! ```rust
//! use ashare_lob_reconstructor::{Book, Side, TickEvent, Venue};
//!
//! let mut book = Book::new(Venue::Shanghai);
//!
//! // A resting bid, then a partial fill by a sell taker.
//! book.process(&TickEvent::maker(Side::Bid, 1, 1000, 10)).unwrap();
//! book.process(&TickEvent::taker(Side::Ask, 1, 77, 1000, 4)).unwrap();
//!
//! assert_eq!(book.best_bid(), 1000);
//! assert_eq!(book.level_net_quantity(1000), Some(6));
//! ```
//!
//! ## Module overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Event model: `TickEvent`, `EventKind`, `Side`, `Venue`, session windows |
//! | [`lob`] | The deduction engine (`Book`) and the run-bar sampler |
//! | [`codec`] | Column compression for the persisted event log |
//! | [`store`] | `[T, F, A]` f16 feature tensors, schema, pool, persistence |
//! | [`pool`] | Bump arena, slot pool, pool-backed hash map, price bitmap |
//! | [`pipeline`] | Encoding / sequential / cross-sectional / IO workers |
//! | [`diagnostics`] | Anomaly observer and tracker |

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod lob;
pub mod pipeline;
pub mod pool;
pub mod store;
pub mod types;

// Re-exports - core types
pub use error::{PipelineError, Result};
pub use types::{EventKind, OrderId, Price, Qty, Side, SnapshotRecord, TickEvent, Venue};

// Re-exports - LOB reconstruction
pub use lob::{Book, BookConfig, BookStats, DeferReason, FeatureSink, RunBar, RunBarSampler};

// Re-exports - feature store
pub use store::{DailyTensor, FeatureStore, Level, PersistMode, TensorState};

// Re-exports - pipeline
pub use pipeline::{InstrumentCatalog, PipelineConfig, SharedState, ShutdownFlag, SupplierReader};

// Re-exports - diagnostics
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticObserver, DiagnosticTracker};
