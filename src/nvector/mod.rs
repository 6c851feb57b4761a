//! Engine-native state vectors and the numeric backends that operate on them.
//!
//! Vector arithmetic goes through a [`VectorBackend`] chosen once from the
//! configured thread count. Code that works with [`NVector`] never needs to
//! know which backend it is running on.

mod serial;
mod threaded;

use std::fmt;
use std::sync::Arc;

pub use serial::SerialBackend;
pub use threaded::ThreadedBackend;

use crate::error::SolverResult;
use crate::memory::{HostBuffer, MemoryLedger};

/// Elementwise kernels used by the integration engine.
///
/// Slices passed to one call always have equal length.
pub trait VectorBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn threads(&self) -> usize;

    /// `z = c`
    fn fill(&self, c: f64, z: &mut [f64]);

    /// `z = c * z`
    fn scale(&self, c: f64, z: &mut [f64]);

    /// `y = y + a * x`
    fn axpy(&self, a: f64, x: &[f64], y: &mut [f64]);

    /// `z = a * x + b * y`
    fn linear_sum(&self, a: f64, x: &[f64], b: f64, y: &[f64], z: &mut [f64]);

    /// Weighted root-mean-square norm `sqrt(sum((x_i * w_i)^2) / n)`.
    fn wrms_norm(&self, x: &[f64], w: &[f64]) -> f64;

    /// `w_i = 1 / (rtol * |y_i| + atol_i)`. Returns `false` if any denominator
    /// is not strictly positive.
    fn error_weights(&self, rtol: f64, atol: &[f64], y: &[f64], w: &mut [f64]) -> bool;
}

pub type BackendHandle = Arc<dyn VectorBackend>;

/// Serial for a single thread, a dedicated rayon pool otherwise.
pub fn backend_for_threads(threads: usize) -> SolverResult<BackendHandle> {
    if threads <= 1 {
        return Ok(Arc::new(SerialBackend));
    }
    Ok(Arc::new(ThreadedBackend::new(threads)?))
}

/// A state-shaped vector owned by the solver.
pub struct NVector {
    data: HostBuffer,
    backend: BackendHandle,
}

impl fmt::Debug for NVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NVector")
            .field("len", &self.len())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl NVector {
    pub fn zeros(len: usize, backend: &BackendHandle, ledger: &Arc<MemoryLedger>) -> Self {
        Self {
            data: HostBuffer::zeros(len, ledger),
            backend: Arc::clone(backend),
        }
    }

    pub fn from_slice(values: &[f64], backend: &BackendHandle, ledger: &Arc<MemoryLedger>) -> Self {
        let mut v = Self::zeros(values.len(), backend, ledger);
        v.as_mut_slice().copy_from_slice(values);
        v
    }

    /// New zeroed vector with the same length, backend and ledger.
    pub fn clone_empty(&self) -> Self {
        Self::zeros(self.len(), &self.backend, self.data.ledger())
    }

    pub fn clone_array(&self, count: usize) -> Vec<NVector> {
        (0..count).map(|_| self.clone_empty()).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        self.data.ledger()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn copy_from(&mut self, other: &NVector) {
        self.data.copy_from_slice(other.as_slice());
    }

    pub fn fill(&mut self, c: f64) {
        self.backend.fill(c, &mut self.data);
    }

    pub fn scale(&mut self, c: f64) {
        self.backend.scale(c, &mut self.data);
    }

    pub fn axpy(&mut self, a: f64, x: &NVector) {
        self.backend.axpy(a, x.as_slice(), &mut self.data);
    }

    pub fn linear_sum(&mut self, a: f64, x: &NVector, b: f64, y: &NVector) {
        self.backend
            .linear_sum(a, x.as_slice(), b, y.as_slice(), &mut self.data);
    }

    pub fn wrms_norm(&self, w: &NVector) -> f64 {
        self.backend.wrms_norm(&self.data, w.as_slice())
    }

    /// Overwrites `self` with error weights computed from `y`.
    pub fn set_error_weights(&mut self, rtol: f64, atol: &NVector, y: &NVector) -> bool {
        self.backend
            .error_weights(rtol, atol.as_slice(), y.as_slice(), &mut self.data)
    }
}
