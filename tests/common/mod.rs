#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::DMatrix;
use odebridge::{
    CallbackResult, OdeProblem, OdeSolver, SensitivityRhsInput, SolverCaller, SystemMatrix,
};

/// `y_i' = -k y_i`. `k` is the first sensitivity parameter when there is
/// one, `rate` otherwise.
#[derive(Clone, Debug)]
pub struct Decay {
    pub rate: f64,
    pub analytic_jacobian: bool,
    pub analytic_sensitivities: bool,
    pub band: Option<(usize, usize)>,
}

impl Decay {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            analytic_jacobian: false,
            analytic_sensitivities: false,
            band: None,
        }
    }

    pub fn with_jacobian(mut self) -> Self {
        self.analytic_jacobian = true;
        self
    }

    pub fn with_sensitivity_rhs(mut self) -> Self {
        self.analytic_sensitivities = true;
        self
    }

    pub fn banded(mut self, mu: usize, ml: usize) -> Self {
        self.band = Some((mu, ml));
        self
    }

    fn k(&self, parameters: &[f64]) -> f64 {
        parameters.first().copied().unwrap_or(self.rate)
    }
}

impl SolverCaller for Decay {
    fn rhs(&self, _t: f64, y: &[f64], parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        let k = self.k(parameters);
        for (d, v) in ydot.iter_mut().zip(y) {
            *d = -k * v;
        }
        CallbackResult::Ok
    }

    fn has_jacobian(&self) -> bool {
        self.analytic_jacobian
    }

    fn jacobian(
        &self,
        _t: f64,
        y: &[f64],
        parameters: &[f64],
        _fy: &[f64],
        jac: &mut SystemMatrix,
    ) -> CallbackResult {
        let k = self.k(parameters);
        for i in 0..y.len() {
            jac.set(i, i, -k);
        }
        CallbackResult::Ok
    }

    fn has_sensitivity_rhs(&self) -> bool {
        self.analytic_sensitivities
    }

    fn sensitivity_rhs(&self, input: &SensitivityRhsInput<'_>, ys_dot: &mut [f64]) -> CallbackResult {
        let k = self.k(input.parameters);
        for ((d, s), v) in ys_dot.iter_mut().zip(input.ys).zip(input.y) {
            *d = -k * s - v;
        }
        CallbackResult::Ok
    }

    fn uses_band_linear_solver(&self) -> bool {
        self.band.is_some()
    }

    fn upper_bandwidth(&self) -> usize {
        self.band.map_or(0, |(mu, _)| mu)
    }

    fn lower_bandwidth(&self) -> usize {
        self.band.map_or(0, |(_, ml)| ml)
    }
}

/// Harmonic oscillator `y0' = y1, y1' = -y0`.
#[derive(Clone, Copy, Debug)]
pub struct Oscillator;

impl SolverCaller for Oscillator {
    fn rhs(&self, _t: f64, y: &[f64], _parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        ydot[0] = y[1];
        ydot[1] = -y[0];
        CallbackResult::Ok
    }
}

/// A caller that does not provide a right-hand side.
#[derive(Clone, Copy, Debug)]
pub struct NoRhs;

impl SolverCaller for NoRhs {
    fn has_rhs(&self) -> bool {
        false
    }

    fn rhs(&self, _t: f64, _y: &[f64], _parameters: &[f64], _ydot: &mut [f64]) -> CallbackResult {
        CallbackResult::UnrecoverableError
    }
}

/// Fails every evaluation with the given result.
#[derive(Clone, Copy, Debug)]
pub struct Failing(pub CallbackResult);

impl SolverCaller for Failing {
    fn rhs(&self, _t: f64, _y: &[f64], _parameters: &[f64], _ydot: &mut [f64]) -> CallbackResult {
        self.0
    }
}

/// `y' = -y` whose right-hand side reports a recoverable error the first
/// `failures` times it is evaluated past `after`.
#[derive(Debug)]
pub struct Flaky {
    pub after: f64,
    pub failures: usize,
    pub seen: AtomicUsize,
}

impl Flaky {
    pub fn new(after: f64, failures: usize) -> Self {
        Self {
            after,
            failures,
            seen: AtomicUsize::new(0),
        }
    }
}

impl SolverCaller for Flaky {
    fn rhs(&self, t: f64, y: &[f64], _parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        if t > self.after && self.seen.load(Ordering::SeqCst) < self.failures {
            self.seen.fetch_add(1, Ordering::SeqCst);
            return CallbackResult::RecoverableError;
        }
        for (d, v) in ydot.iter_mut().zip(y) {
            *d = -v;
        }
        CallbackResult::Ok
    }
}

/// Decay whose sensitivity right-hand side always fails unrecoverably.
#[derive(Clone, Copy, Debug)]
pub struct BrokenSensitivities;

impl SolverCaller for BrokenSensitivities {
    fn rhs(&self, _t: f64, y: &[f64], parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        let k = parameters.first().copied().unwrap_or(1.0);
        for (d, v) in ydot.iter_mut().zip(y) {
            *d = -k * v;
        }
        CallbackResult::Ok
    }

    fn has_sensitivity_rhs(&self) -> bool {
        true
    }

    fn sensitivity_rhs(&self, _input: &SensitivityRhsInput<'_>, _ys_dot: &mut [f64]) -> CallbackResult {
        CallbackResult::UnrecoverableError
    }
}

pub fn decay_problem(y0: Vec<f64>) -> OdeProblem {
    OdeProblem::new(0.0, y0).with_rel_tol(1e-9).with_uniform_abs_tol(1e-10)
}

/// Two-component decay with `k = 1` as its only sensitivity parameter.
pub fn decay_with_sensitivity(caller: Decay) -> OdeSolver {
    let problem = decay_problem(vec![1.0, 1.0]).with_sensitivity_parameters(vec![1.0]);
    let mut solver = OdeSolver::new(Arc::new(caller), problem);
    solver.init().expect("init");
    solver
}

pub fn no_sensitivities(n: usize) -> DMatrix<f64> {
    DMatrix::zeros(n, 0)
}
