//! The contract a model must implement to be integrated by [`crate::OdeSolver`].

use crate::engine::SystemMatrix;

/// Outcome of one caller evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackResult {
    Ok,
    /// The engine may retry with a smaller step.
    RecoverableError,
    /// Abort the current integration attempt.
    UnrecoverableError,
}

impl CallbackResult {
    /// Engine return convention: 0, positive, negative.
    pub fn to_engine(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::RecoverableError => 1,
            Self::UnrecoverableError => -1,
        }
    }
}

/// Arguments of a sensitivity right-hand side evaluation.
#[derive(Clone, Copy, Debug)]
pub struct SensitivityRhsInput<'a> {
    pub t: f64,
    pub y: &'a [f64],
    pub ydot: &'a [f64],
    /// Current values of the sensitivity parameters.
    pub parameters: &'a [f64],
    /// Which parameter `ys` belongs to.
    pub index: usize,
    pub ys: &'a [f64],
}

/// Model-side evaluation logic.
///
/// `parameters` always holds the current sensitivity parameter values (empty
/// when the problem has none). The engine may perturb them between calls
/// while it approximates sensitivity right-hand sides.
pub trait SolverCaller {
    fn has_rhs(&self) -> bool {
        true
    }

    fn rhs(&self, t: f64, y: &[f64], parameters: &[f64], ydot: &mut [f64]) -> CallbackResult;

    fn has_jacobian(&self) -> bool {
        false
    }

    /// Fills `jac` with `df/dy`. Only called when [`SolverCaller::has_jacobian`]
    /// returns `true`.
    fn jacobian(
        &self,
        _t: f64,
        _y: &[f64],
        _parameters: &[f64],
        _fy: &[f64],
        _jac: &mut SystemMatrix,
    ) -> CallbackResult {
        CallbackResult::UnrecoverableError
    }

    fn has_sensitivity_rhs(&self) -> bool {
        false
    }

    /// `ys_dot = J ys + df/dp_index`. Only called when
    /// [`SolverCaller::has_sensitivity_rhs`] returns `true`.
    fn sensitivity_rhs(&self, _input: &SensitivityRhsInput<'_>, _ys_dot: &mut [f64]) -> CallbackResult {
        CallbackResult::UnrecoverableError
    }

    fn uses_band_linear_solver(&self) -> bool {
        false
    }

    fn upper_bandwidth(&self) -> usize {
        0
    }

    fn lower_bandwidth(&self) -> usize {
        0
    }
}
