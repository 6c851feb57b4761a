//! Jacobian storage handed to caller Jacobian callbacks and the linear
//! solver selection that goes with it.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::memory::{Allocation, MemoryLedger};
use crate::nvector::NVector;

/// Jacobian matrix handed to caller Jacobian callbacks.
///
/// A band matrix only accepts entries `(i, j)` with `j - mu <= i <= j + ml`;
/// writes outside the band are dropped.
#[derive(Debug)]
pub struct SystemMatrix {
    values: DMatrix<f64>,
    band: Option<(usize, usize)>,
    _allocation: Allocation,
}

impl SystemMatrix {
    pub fn dense(n: usize, ledger: &Arc<MemoryLedger>) -> Self {
        Self {
            values: DMatrix::zeros(n, n),
            band: None,
            _allocation: ledger.track(n * n),
        }
    }

    pub fn band(n: usize, mu: usize, ml: usize, ledger: &Arc<MemoryLedger>) -> Self {
        let stored = (mu + ml + 1).min(n.max(1));
        Self {
            values: DMatrix::zeros(n, n),
            band: Some((mu, ml)),
            _allocation: ledger.track(stored * n),
        }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_band(&self) -> bool {
        self.band.is_some()
    }

    /// `(upper, lower)` for band matrices.
    pub fn bandwidths(&self) -> Option<(usize, usize)> {
        self.band
    }

    fn in_band(&self, i: usize, j: usize) -> bool {
        match self.band {
            None => true,
            Some((mu, ml)) => i + mu >= j && i <= j + ml,
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if !self.in_band(i, j) {
            return 0.0;
        }
        self.values.get((i, j)).copied().unwrap_or(0.0)
    }

    /// Writes outside the matrix (or outside the band) are dropped.
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        if !self.in_band(i, j) {
            return;
        }
        if let Some(slot) = self.values.get_mut((i, j)) {
            *slot = value;
        }
    }

    pub fn zero(&mut self) {
        self.values.fill(0.0);
    }

    /// `out = J v`
    pub(crate) fn mul_into(&self, v: &[f64], out: &mut [f64]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = self
                .values
                .row(i)
                .iter()
                .zip(v)
                .map(|(a, b)| a * b)
                .sum();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearSolverKind {
    Dense,
    Band,
}

/// Direct linear solver selection bound to one Jacobian matrix.
///
/// The factorization itself happens inside the engine; this handle owns the
/// matrix the caller's Jacobian is written into.
#[derive(Debug)]
pub struct LinearSolver {
    kind: LinearSolverKind,
    jacobian: SystemMatrix,
}

impl LinearSolver {
    /// `None` unless `matrix` is dense and sized like `template`.
    pub fn dense(template: &NVector, matrix: SystemMatrix) -> Option<Self> {
        if matrix.is_band() || matrix.nrows() != template.len() {
            return None;
        }
        Some(Self {
            kind: LinearSolverKind::Dense,
            jacobian: matrix,
        })
    }

    /// `None` unless `matrix` is banded and sized like `template`.
    pub fn band(template: &NVector, matrix: SystemMatrix) -> Option<Self> {
        if !matrix.is_band() || matrix.nrows() != template.len() {
            return None;
        }
        Some(Self {
            kind: LinearSolverKind::Band,
            jacobian: matrix,
        })
    }

    pub fn kind(&self) -> LinearSolverKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.jacobian.nrows()
    }

    pub fn jacobian(&self) -> &SystemMatrix {
        &self.jacobian
    }

    pub fn jacobian_mut(&mut self) -> &mut SystemMatrix {
        &mut self.jacobian
    }
}
