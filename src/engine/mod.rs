//! Integration engine interface.
//!
//! The adapter talks to an engine only through [`IntegrationEngine`]: integer
//! status codes in, plain function-pointer callbacks out, and an opaque
//! `&dyn Any` user-data value threaded through every callback invocation.
//! [`DiffsolEngine`] implements it on top of diffsol.

mod driver;
mod evaluator;
mod jacobian;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub use driver::DiffsolEngine;
pub use jacobian::{LinearSolver, LinearSolverKind, SystemMatrix};

use crate::nvector::NVector;

/// Engine status code. Non-negative values are successful returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EngineCode(pub i32);

impl EngineCode {
    pub const SUCCESS: Self = Self(0);
    pub const TSTOP_RETURN: Self = Self(1);
    pub const ROOT_RETURN: Self = Self(2);
    pub const WARNING: Self = Self(99);

    pub const TOO_MUCH_WORK: Self = Self(-1);
    pub const TOO_MUCH_ACC: Self = Self(-2);
    pub const ERR_FAILURE: Self = Self(-3);
    pub const CONV_FAILURE: Self = Self(-4);
    pub const LINIT_FAIL: Self = Self(-5);
    pub const LSETUP_FAIL: Self = Self(-6);
    pub const LSOLVE_FAIL: Self = Self(-7);
    pub const RHSFUNC_FAIL: Self = Self(-8);
    pub const FIRST_RHSFUNC_ERR: Self = Self(-9);
    pub const REPTD_RHSFUNC_ERR: Self = Self(-10);
    pub const UNREC_RHSFUNC_ERR: Self = Self(-11);
    pub const RTFUNC_FAIL: Self = Self(-12);

    pub const MEM_FAIL: Self = Self(-20);
    pub const MEM_NULL: Self = Self(-21);
    pub const ILL_INPUT: Self = Self(-22);
    pub const NO_MALLOC: Self = Self(-23);
    pub const BAD_K: Self = Self(-24);
    pub const BAD_T: Self = Self(-25);
    pub const BAD_DKY: Self = Self(-26);
    pub const TOO_CLOSE: Self = Self(-27);
    pub const LMEM_NULL: Self = Self(-30);

    pub const NO_SENS: Self = Self(-40);
    pub const SRHSFUNC_FAIL: Self = Self(-41);
    pub const FIRST_SRHSFUNC_ERR: Self = Self(-42);
    pub const REPTD_SRHSFUNC_ERR: Self = Self(-43);
    pub const UNREC_SRHSFUNC_ERR: Self = Self(-44);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Codes returned before the engine produced any state.
    pub fn is_input_error(self) -> bool {
        matches!(
            self,
            Self::ILL_INPUT | Self::BAD_T | Self::MEM_NULL | Self::NO_MALLOC | Self::TOO_CLOSE
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "SUCCESS",
            Self::TSTOP_RETURN => "TSTOP_RETURN",
            Self::ROOT_RETURN => "ROOT_RETURN",
            Self::WARNING => "WARNING",
            Self::TOO_MUCH_WORK => "TOO_MUCH_WORK",
            Self::TOO_MUCH_ACC => "TOO_MUCH_ACC",
            Self::ERR_FAILURE => "ERR_FAILURE",
            Self::CONV_FAILURE => "CONV_FAILURE",
            Self::LINIT_FAIL => "LINIT_FAIL",
            Self::LSETUP_FAIL => "LSETUP_FAIL",
            Self::LSOLVE_FAIL => "LSOLVE_FAIL",
            Self::RHSFUNC_FAIL => "RHSFUNC_FAIL",
            Self::FIRST_RHSFUNC_ERR => "FIRST_RHSFUNC_ERR",
            Self::REPTD_RHSFUNC_ERR => "REPTD_RHSFUNC_ERR",
            Self::UNREC_RHSFUNC_ERR => "UNREC_RHSFUNC_ERR",
            Self::RTFUNC_FAIL => "RTFUNC_FAIL",
            Self::MEM_FAIL => "MEM_FAIL",
            Self::MEM_NULL => "MEM_NULL",
            Self::ILL_INPUT => "ILL_INPUT",
            Self::NO_MALLOC => "NO_MALLOC",
            Self::BAD_K => "BAD_K",
            Self::BAD_T => "BAD_T",
            Self::BAD_DKY => "BAD_DKY",
            Self::TOO_CLOSE => "TOO_CLOSE",
            Self::LMEM_NULL => "LMEM_NULL",
            Self::NO_SENS => "NO_SENS",
            Self::SRHSFUNC_FAIL => "SRHSFUNC_FAIL",
            Self::FIRST_SRHSFUNC_ERR => "FIRST_SRHSFUNC_ERR",
            Self::REPTD_SRHSFUNC_ERR => "REPTD_SRHSFUNC_ERR",
            Self::UNREC_SRHSFUNC_ERR => "UNREC_SRHSFUNC_ERR",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for EngineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Integration method family, fixed when the engine is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MethodFamily {
    /// Non-stiff family. Accepts order limits up to 12; [`DiffsolEngine`]
    /// integrates it with a fixed-order ESDIRK34 method.
    Adams,
    /// Backward differentiation formulas, orders 1..=5; suited to stiff problems.
    #[default]
    Bdf,
}

impl MethodFamily {
    pub fn max_order(self) -> usize {
        match self {
            Self::Adams => 12,
            Self::Bdf => 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// Integrate up to `tout`, interpolating if the engine is already past it.
    Normal,
    /// Take one internal step and return.
    OneStep,
}

/// `ydot = f(t, y)`. Returns 0 on success, > 0 recoverable, < 0 fatal.
pub type RhsFn = fn(t: f64, y: &[f64], ydot: &mut [f64], user_data: &dyn Any) -> i32;

/// Fills `jac` with `df/dy` at `(t, y)`; `fy` is `f(t, y)`.
pub type JacFn =
    fn(t: f64, y: &[f64], fy: &[f64], jac: &mut SystemMatrix, user_data: &dyn Any) -> i32;

/// Right-hand side of the sensitivity equation for parameter `is`.
pub type SensRhsFn = fn(
    t: f64,
    y: &[f64],
    ydot: &[f64],
    is: usize,
    ys: &[f64],
    ys_dot: &mut [f64],
    user_data: &dyn Any,
) -> i32;

/// Parameter array registered with the engine for sensitivity analysis.
///
/// The engine perturbs entries in place when it approximates sensitivity
/// right-hand sides by finite differences, so the handle is shared with
/// whoever evaluates `f(t, y, p)`.
#[derive(Clone, Debug, Default)]
pub struct SharedParameters(Arc<Mutex<Vec<f64>>>);

impl SharedParameters {
    pub fn new(values: Vec<f64>) -> Self {
        Self(Arc::new(Mutex::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.0.lock().get(index).copied()
    }

    pub fn set(&self, index: usize, value: f64) {
        if let Some(slot) = self.0.lock().get_mut(index) {
            *slot = value;
        }
    }

    pub fn replace(&self, values: &[f64]) {
        let mut guard = self.0.lock();
        guard.clear();
        guard.extend_from_slice(values);
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.0.lock().clone()
    }

    /// Runs `f` with the current values. The lock is held for the duration
    /// of the call, so `f` must not touch this handle again.
    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        let guard = self.0.lock();
        f(&guard)
    }
}

/// Counters maintained by an engine.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineStats {
    pub steps: usize,
    pub rhs_evals: usize,
    pub jac_evals: usize,
    pub sens_rhs_evals: usize,
    /// Steps retaken with a smaller size after a recoverable callback failure.
    pub step_retries: usize,
    pub current_order: usize,
    pub max_order_used: usize,
    pub last_step: f64,
    pub current_time: f64,
}

/// The engine capability driven by [`crate::OdeSolver`].
///
/// Releasing an engine is `Drop`. Every setter returns an [`EngineCode`];
/// anything other than [`EngineCode::SUCCESS`] means the call had no effect.
pub trait IntegrationEngine: Sized {
    fn create(method: MethodFamily) -> Option<Self>;

    fn init(&mut self, rhs: RhsFn, t0: f64, y0: &NVector) -> EngineCode;

    /// Restart at `(t0, y0)` keeping allocations, tolerances and options.
    fn reinit(&mut self, t0: f64, y0: &NVector) -> EngineCode;

    fn set_tolerances(&mut self, rtol: f64, atol: &NVector) -> EngineCode;

    fn set_max_order(&mut self, max_order: usize) -> EngineCode;

    /// `0` removes the limit.
    fn set_max_num_steps(&mut self, max_steps: usize) -> EngineCode;

    fn set_max_hnil_warnings(&mut self, max_warnings: i32) -> EngineCode;

    /// `0` lets the engine estimate the first step.
    fn set_initial_step(&mut self, h0: f64) -> EngineCode;

    /// `0` removes the bound.
    fn set_max_step(&mut self, h_max: f64) -> EngineCode;

    fn set_min_step(&mut self, h_min: f64) -> EngineCode;

    fn set_linear_solver(&mut self, solver: LinearSolver) -> EngineCode;

    /// `None` falls back to difference-quotient Jacobians.
    fn set_jacobian_fn(&mut self, jac: Option<JacFn>) -> EngineCode;

    /// Enable forward sensitivities corrected in staggered fashion: once per
    /// step, after the state correction has converged and passed its error
    /// test. `None` selects finite-difference sensitivity right-hand sides.
    fn sens_init_staggered(&mut self, rhs: Option<SensRhsFn>, ys0: &[NVector]) -> EngineCode;

    fn sens_reinit(&mut self, ys0: &[NVector]) -> EngineCode;

    /// Derive sensitivity tolerances from the state tolerances and the
    /// parameter scaling factors.
    fn sens_ee_tolerances(&mut self) -> EngineCode;

    fn set_sens_error_control(&mut self, include: bool) -> EngineCode;

    fn set_sens_params(&mut self, params: SharedParameters, scaling: &[f64]) -> EngineCode;

    /// Advance towards `tout`. Returns the status and the time that `yout`
    /// corresponds to.
    fn advance(
        &mut self,
        tout: f64,
        yout: &mut NVector,
        task: Task,
        user_data: &dyn Any,
    ) -> (EngineCode, f64);

    /// Sensitivities at the time of the last successful return from
    /// [`IntegrationEngine::advance`].
    fn get_sens(&self, ys: &mut [NVector]) -> (EngineCode, f64);

    fn stats(&self) -> EngineStats;
}
