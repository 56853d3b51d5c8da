//! Optional CPU pinning.
//!
//! Pinning is a platform-detected capability, never a requirement: when
//! the platform cannot enumerate cores (or has fewer cores than workers)
//! the pipeline runs under ordinary scheduling with no functional change.

use core_affinity::CoreId;

/// Core ids available for pinning, if the platform exposes them.
pub fn available_cores() -> Option<Vec<CoreId>> {
    core_affinity::get_core_ids().filter(|ids| !ids.is_empty())
}

/// True when pinning can be attempted on this platform.
pub fn supported() -> bool {
    available_cores().is_some()
}

/// Pin the calling thread to the core at `index` (modulo the available
/// set). Returns whether the pin took effect.
pub fn pin_to_core(index: usize) -> bool {
    match available_cores() {
        Some(cores) => {
            let core = cores[index % cores.len()];
            let ok = core_affinity::set_for_current(core);
            if ok {
                log::debug!("pinned worker to core {:?}", core.id);
            } else {
                log::debug!("core pinning refused for core {:?}", core.id);
            }
            ok
        }
        None => false,
    }
}
