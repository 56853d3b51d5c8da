//! IO phase: flush completed day tensors and recycle them.
//!
//! One worker repeatedly scans the pool for the oldest `cs_done` tensor,
//! writes it under `output/features/YYYY/MM/DD/`, and returns it to the
//! free list. The bounded sleep between empty scans is the only waiting
//! it ever does; it shares no locks with producers.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::store::FeatureStore;

use super::{PipelineConfig, ShutdownFlag};

/// Sleep between empty pool scans.
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// Flush day tensors until `total_dates` have been written (or shutdown).
/// Returns the number of dates flushed.
pub fn run_io_worker(
    store: &FeatureStore,
    config: &PipelineConfig,
    total_dates: usize,
    shutdown: &ShutdownFlag,
) -> Result<usize> {
    let mut flushed = 0usize;

    while flushed < total_dates {
        if shutdown.requested() {
            log::warn!("io worker stopping at {flushed}/{total_dates} after shutdown");
            break;
        }

        match store.io_flush_once(&config.output_base, config.persist_mode)? {
            Some(date) => {
                flushed += 1;
                log::info!("flushed features for {date} ({flushed}/{total_dates})");
            }
            None => thread::sleep(IDLE_INTERVAL),
        }
    }
    Ok(flushed)
}
