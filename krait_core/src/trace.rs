//! Runtime tracing adapter.
//!
//! The instrumentation facility — SanitizerCoverage pc-guards when the
//! `sancov` feature is enabled, or direct [`cov_hit`] calls from manually
//! instrumented targets — reports the current location on every
//! control-flow transfer. The adapter keeps a thread-local previous
//! location so the recorded edge is `(prev, cur)`, then shifts
//! `prev <- cur >> 1` to keep A->B distinct from B->A.

use crate::coverage::{CoverageMap, Edge};
use std::cell::Cell;
use std::sync::{LazyLock, Mutex};

// The per-process edge set. A worker process exists solely to run the
// target, so process-global trace state is acceptable here.
static EDGES: LazyLock<Mutex<CoverageMap>> = LazyLock::new(|| Mutex::new(CoverageMap::new()));

thread_local! {
    static PREV: Cell<u64> = const { Cell::new(0) };
}

/// Records a control-flow transfer into location `cur`.
pub fn cov_hit(cur: u64) {
    let prev = PREV.with(|p| p.replace(cur >> 1));
    EDGES.lock().unwrap().observe(Edge(prev, cur));
}

/// Clears the recorded coverage and the previous-location register.
pub fn reset() {
    PREV.with(|p| p.set(0));
    *EDGES.lock().unwrap() = CoverageMap::new();
}

/// Returns the coverage recorded since the last [`reset`] and clears it.
pub fn drain() -> CoverageMap {
    PREV.with(|p| p.set(0));
    std::mem::take(&mut *EDGES.lock().unwrap())
}

#[cfg(feature = "sancov")]
mod pcguard {
    use std::sync::atomic::{AtomicU32, Ordering};

    // Guard index 0 is reserved so uninitialized tables stay silent.
    static NEXT_GUARD: AtomicU32 = AtomicU32::new(1);

    #[no_mangle]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
        let location = *guard;
        if location == 0 {
            return;
        }
        super::cov_hit(location as u64);
    }

    #[no_mangle]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(
        mut start: *mut u32,
        stop: *mut u32,
    ) {
        // Module tables are handed in exactly once; an already-numbered
        // table is left alone.
        if start == stop || *start != 0 {
            return;
        }
        while start < stop {
            *start = NEXT_GUARD.fetch_add(1, Ordering::Relaxed);
            start = start.offset(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cov_hit, drain, reset};
    use crate::coverage::Edge;

    // The edge registry is process-global, so every assertion lives in one
    // test to keep concurrent test threads off it.
    #[test]
    fn records_edges_with_shifted_prev() {
        reset();

        cov_hit(4);
        cov_hit(6);
        cov_hit(6);

        let cov = drain();
        assert_eq!(cov.len(), 3);
        assert_eq!(cov.count(&Edge(0, 4)), 1);
        // prev after hitting 4 is 4 >> 1.
        assert_eq!(cov.count(&Edge(2, 6)), 1);
        // prev after hitting 6 is 6 >> 1.
        assert_eq!(cov.count(&Edge(3, 6)), 1);

        // Drain cleared everything, including the previous location.
        assert!(drain().is_empty());
        cov_hit(4);
        let cov = drain();
        assert_eq!(cov.count(&Edge(0, 4)), 1);

        // Hit counts accumulate on repeated transfers.
        reset();
        cov_hit(0);
        cov_hit(0);
        cov_hit(0);
        let cov = drain();
        assert_eq!(cov.len(), 1);
        assert_eq!(cov.count(&Edge(0, 0)), 3);
    }
}
