//! Limit order book reconstruction.
//!
//! [`Book`] is the single-instrument deduction engine; [`RunBarSampler`]
//! resamples its taker flow into volume-imbalance bars. Parallelism is
//! across instruments; one book is strictly single-threaded.

pub mod book;
pub mod run_bar;

pub use book::{Book, BookConfig, BookStats, DeferReason, FeatureSink};
pub use run_bar::{RunBar, RunBarConfig, RunBarSampler};
