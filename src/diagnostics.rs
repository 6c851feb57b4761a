//! Leak detection and allocator statistics for the leak tests and the `leak_harness` binary.

#[cfg(any(test, feature = "diagnostics", feature = "mem-profiling"))]
pub mod leaks {
    pub use crate::memory::{LeakDetector, MemoryLedger, MemoryStats};
}

#[cfg(feature = "mem-profiling")]
pub mod jemalloc_stats {
    use log::warn;
    use tikv_jemalloc_ctl::{epoch, stats};

    /// Bytes currently allocated through jemalloc, or 0 when the counters
    /// cannot be read.
    pub fn allocated_bytes() -> u64 {
        if let Err(err) = epoch::advance() {
            warn!("stale jemalloc statistics: {err}");
        }
        match stats::allocated::read() {
            Ok(bytes) => bytes as u64,
            Err(err) => {
                warn!("cannot read jemalloc allocated bytes: {err}");
                0
            }
        }
    }
}
