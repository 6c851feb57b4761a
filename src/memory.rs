use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-allocation counters shared by everything one solver allocates.
///
/// Every engine-native buffer (state vectors, sensitivity arrays and
/// linear-solver matrices) holds an [`Allocation`] against the
/// ledger of the solver that created it, so a solver can report exactly what
/// it still owns.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    buffers: AtomicUsize,
    elements: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track(self: &Arc<Self>, elements: usize) -> Allocation {
        self.buffers.fetch_add(1, Ordering::SeqCst);
        self.elements.fetch_add(elements, Ordering::SeqCst);
        Allocation {
            ledger: Arc::clone(self),
            elements,
        }
    }

    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            buffers: self.buffers.load(Ordering::SeqCst),
            elements: self.elements.load(Ordering::SeqCst),
        }
    }
}

/// Guard for one tracked allocation; releases its share of the ledger on drop.
#[derive(Debug)]
pub struct Allocation {
    ledger: Arc<MemoryLedger>,
    elements: usize,
}

impl Allocation {
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.ledger.buffers.fetch_sub(1, Ordering::SeqCst);
        self.ledger.elements.fetch_sub(self.elements, Ordering::SeqCst);
    }
}

/// Heap-backed `f64` buffer that is accounted against a [`MemoryLedger`].
#[derive(Debug)]
pub(crate) struct HostBuffer {
    data: Vec<f64>,
    allocation: Allocation,
}

impl HostBuffer {
    pub fn zeros(len: usize, ledger: &Arc<MemoryLedger>) -> Self {
        Self {
            data: vec![0.0; len],
            allocation: ledger.track(len),
        }
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        self.allocation.ledger()
    }
}

impl Deref for HostBuffer {
    type Target = [f64];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub buffers: usize,
    pub elements: usize,
}

impl MemoryStats {
    pub fn delta(self, other: MemoryStats) -> MemoryStats {
        MemoryStats {
            buffers: self.buffers.saturating_sub(other.buffers),
            elements: self.elements.saturating_sub(other.elements),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers == 0 && self.elements == 0
    }
}

/// Asserts that a ledger returns to its starting level.
pub struct LeakDetector {
    label: &'static str,
    ledger: Arc<MemoryLedger>,
    start: MemoryStats,
    consumed: bool,
}

impl LeakDetector {
    pub fn new(label: &'static str, ledger: &Arc<MemoryLedger>) -> Self {
        Self {
            label,
            ledger: Arc::clone(ledger),
            start: ledger.snapshot(),
            consumed: false,
        }
    }

    pub fn assert_clean(mut self) {
        self.consumed = true;
        let delta = self.ledger.snapshot().delta(self.start);
        assert_eq!(
            delta.buffers, 0,
            "memory leak detected in {} (buffers: +{}, elements: +{})",
            self.label, delta.buffers, delta.elements
        );
        assert_eq!(
            delta.elements, 0,
            "memory leak detected in {} (elements: +{})",
            self.label, delta.elements
        );
    }
}

impl Drop for LeakDetector {
    fn drop(&mut self) {
        if !self.consumed {
            let delta = self.ledger.snapshot().delta(self.start);
            if !delta.is_empty() && !std::thread::panicking() {
                panic!(
                    "memory leak detected in {} (buffers: +{}, elements: +{})",
                    self.label, delta.buffers, delta.elements
                );
            }
        }
    }
}
