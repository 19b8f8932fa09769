//! CPU topology helpers and the steal-loop backoff.

use std::time::{Duration, Instant};

use core_affinity::CoreId;

/// Spin this long after a steal round starts before yielding to the OS.
const SPIN_WINDOW: Duration = Duration::from_millis(10);

/// Number of schedulable cores.
pub(crate) fn count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Assign cores to worker threads round-robin, plus a core hint for the
/// async-I/O subsystem. Pinning degrades to no-ops when the platform cannot
/// enumerate cores.
pub(crate) fn assign(
    n: usize,
    nopin: bool,
    pinasio: bool,
) -> (Vec<Option<CoreId>>, Option<usize>) {
    let ids = core_affinity::get_core_ids().unwrap_or_default();

    let cpus = (0..n)
        .map(|i| {
            if nopin || ids.is_empty() {
                None
            } else {
                Some(ids[i % ids.len()])
            }
        })
        .collect();

    let asio_cpu = if pinasio && !ids.is_empty() {
        Some(ids[n % ids.len()].id)
    } else {
        None
    };

    (cpus, asio_cpu)
}

/// Pin the calling thread to the given core.
pub(crate) fn pin_current(id: CoreId) {
    let _ = core_affinity::set_for_current(id);
}

/// Back off between steal attempts.
///
/// Within the spin window a pause hint keeps the core hot for an immediate
/// retry; past it the thread yields, unless yielding was disabled at init.
pub(crate) fn pause(tsc: Instant, tsc2: Instant, use_yield: bool) {
    if !use_yield || tsc2.duration_since(tsc) < SPIN_WINDOW {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}
