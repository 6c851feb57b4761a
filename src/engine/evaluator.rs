//! Evaluation of the registered callbacks on behalf of the integrator.
//!
//! The integrator's equation closures cannot report errors, so every
//! callback failure is recorded here and the offending output is filled
//! with NaN. The stepping loop inspects the record after each attempt.

use std::any::Any;
use std::cell::{Cell, RefCell};

use super::jacobian::SystemMatrix;
use super::{EngineCode, JacFn, RhsFn, SensRhsFn, SharedParameters};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Source {
    Rhs,
    Jacobian,
    SensitivityRhs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CallbackFailure {
    pub source: Source,
    pub fatal: bool,
}

impl CallbackFailure {
    /// Code for a failure while building the initial state.
    pub fn first_call_code(self) -> EngineCode {
        match (self.source, self.fatal) {
            (Source::Rhs, false) => EngineCode::FIRST_RHSFUNC_ERR,
            (Source::Rhs, true) => EngineCode::RHSFUNC_FAIL,
            (Source::SensitivityRhs, false) => EngineCode::FIRST_SRHSFUNC_ERR,
            (Source::SensitivityRhs, true) => EngineCode::SRHSFUNC_FAIL,
            (Source::Jacobian, _) => EngineCode::LSETUP_FAIL,
        }
    }

    /// Code for a fatal failure, or a recoverable one that kept recurring.
    pub fn step_code(self) -> EngineCode {
        match (self.source, self.fatal) {
            (Source::Rhs, false) => EngineCode::REPTD_RHSFUNC_ERR,
            (Source::Rhs, true) => EngineCode::RHSFUNC_FAIL,
            (Source::SensitivityRhs, false) => EngineCode::REPTD_SRHSFUNC_ERR,
            (Source::SensitivityRhs, true) => EngineCode::SRHSFUNC_FAIL,
            (Source::Jacobian, false) => EngineCode::CONV_FAILURE,
            (Source::Jacobian, true) => EngineCode::LSETUP_FAIL,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub rhs: usize,
    pub jacobian: usize,
    pub sensitivity_rhs: usize,
}

/// Difference-quotient sensitivity right-hand sides perturb the shared
/// parameters by `scaling[j] * delta`.
pub(crate) struct ParameterPerturbation<'a> {
    pub values: &'a SharedParameters,
    pub scaling: &'a [f64],
    pub delta: f64,
}

/// `f(t, y)` at the last point it was requested for.
#[derive(Default)]
struct Linearization {
    point: Option<(f64, Vec<f64>)>,
    fy: Vec<f64>,
    jacobian_ready: bool,
}

impl Linearization {
    fn matches(&self, t: f64, y: &[f64]) -> bool {
        matches!(&self.point, Some((tp, yp)) if *tp == t && yp.as_slice() == y)
    }
}

pub(crate) struct Evaluator<'a> {
    rhs: RhsFn,
    jac: Option<JacFn>,
    sens_rhs: Option<SensRhsFn>,
    parameters: Option<ParameterPerturbation<'a>>,
    sensitivity_count: usize,
    user_data: &'a dyn Any,
    jacobian: Option<RefCell<&'a mut SystemMatrix>>,
    linearization: RefCell<Linearization>,
    failure: Cell<Option<CallbackFailure>>,
    counters: Cell<Counters>,
}

impl<'a> Evaluator<'a> {
    pub fn new(rhs: RhsFn, user_data: &'a dyn Any) -> Self {
        Self {
            rhs,
            jac: None,
            sens_rhs: None,
            parameters: None,
            sensitivity_count: 0,
            user_data,
            jacobian: None,
            linearization: RefCell::new(Linearization::default()),
            failure: Cell::new(None),
            counters: Cell::new(Counters::default()),
        }
    }

    /// A caller Jacobian is only used together with a matrix to write it into.
    pub fn with_jacobian(mut self, jac: Option<JacFn>, matrix: Option<&'a mut SystemMatrix>) -> Self {
        if let (Some(jac), Some(matrix)) = (jac, matrix) {
            self.jac = Some(jac);
            self.jacobian = Some(RefCell::new(matrix));
        }
        self
    }

    pub fn with_sensitivities(
        mut self,
        count: usize,
        rhs: Option<SensRhsFn>,
        parameters: Option<ParameterPerturbation<'a>>,
    ) -> Self {
        self.sensitivity_count = count;
        self.sens_rhs = rhs;
        self.parameters = parameters;
        self
    }

    pub fn counters(&self) -> Counters {
        self.counters.get()
    }

    /// Clears and returns the failure recorded since the last call.
    pub fn take_failure(&self) -> Option<CallbackFailure> {
        self.failure.take()
    }

    fn record(&self, source: Source, ret: i32) {
        let fatal = ret < 0;
        match self.failure.get() {
            Some(previous) if previous.fatal || !fatal => {}
            _ => self.failure.set(Some(CallbackFailure { source, fatal })),
        }
    }

    fn count(&self, update: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.get();
        update(&mut counters);
        self.counters.set(counters);
    }

    fn eval_rhs(&self, source: Source, t: f64, y: &[f64], ydot: &mut [f64]) -> bool {
        let ret = (self.rhs)(t, y, ydot, self.user_data);
        self.count(|c| c.rhs += 1);
        if ret != 0 {
            self.record(source, ret);
            ydot.fill(f64::NAN);
            return false;
        }
        true
    }

    /// `ydot = f(t, y)`
    pub fn rhs(&self, t: f64, y: &[f64], ydot: &mut [f64]) {
        self.eval_rhs(Source::Rhs, t, y, ydot);
    }

    /// Refreshes the cached `f(t, y)`. Returns `false` if the evaluation failed.
    fn linearize(&self, t: f64, y: &[f64]) -> bool {
        if self.linearization.borrow().matches(t, y) {
            return true;
        }
        let mut fy = vec![0.0; y.len()];
        if !self.eval_rhs(Source::Rhs, t, y, &mut fy) {
            return false;
        }
        let mut cache = self.linearization.borrow_mut();
        cache.point = Some((t, y.to_vec()));
        cache.fy = fy;
        cache.jacobian_ready = false;
        true
    }

    /// `out = J(t, y) v`, from the caller's Jacobian when there is one and
    /// from a directional difference quotient otherwise.
    pub fn jac_mul(&self, t: f64, y: &[f64], v: &[f64], out: &mut [f64]) {
        if !self.linearize(t, y) {
            out.fill(f64::NAN);
            return;
        }
        match (self.jac, self.jacobian.as_ref()) {
            (Some(jac), Some(matrix)) => {
                let mut cache = self.linearization.borrow_mut();
                let mut matrix = matrix.borrow_mut();
                if !cache.jacobian_ready {
                    matrix.zero();
                    let ret = jac(t, y, &cache.fy, &mut **matrix, self.user_data);
                    self.count(|c| c.jacobian += 1);
                    if ret != 0 {
                        self.record(Source::Jacobian, ret);
                        out.fill(f64::NAN);
                        return;
                    }
                    cache.jacobian_ready = true;
                }
                matrix.mul_into(v, out);
            }
            _ => self.difference_quotient(t, y, v, out),
        }
    }

    fn difference_quotient(&self, t: f64, y: &[f64], v: &[f64], out: &mut [f64]) {
        let v_norm = v.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
        if v_norm == 0.0 {
            out.fill(0.0);
            return;
        }
        let y_norm = y.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
        let sigma = f64::EPSILON.sqrt() * (1.0 + y_norm) / v_norm;
        let shifted: Vec<f64> = y.iter().zip(v).map(|(a, b)| a + sigma * b).collect();
        let mut f_shifted = vec![0.0; y.len()];
        if !self.eval_rhs(Source::Rhs, t, &shifted, &mut f_shifted) {
            out.fill(f64::NAN);
            return;
        }
        let cache = self.linearization.borrow();
        for ((o, fs), f) in out.iter_mut().zip(&f_shifted).zip(&cache.fy) {
            *o = (fs - f) / sigma;
        }
    }

    /// `out = (df/dp) v` over the sensitivity parameters.
    pub fn sens_mul(&self, t: f64, y: &[f64], v: &[f64], out: &mut [f64]) {
        out.fill(0.0);
        let count = self.sensitivity_count.min(v.len());
        if count == 0 {
            return;
        }
        if let Some(sens_rhs) = self.sens_rhs {
            if !self.linearize(t, y) {
                out.fill(f64::NAN);
                return;
            }
            let fy = self.linearization.borrow().fy.clone();
            let zeros = vec![0.0; y.len()];
            let mut column = vec![0.0; y.len()];
            for (j, &weight) in v.iter().enumerate().take(count) {
                if weight == 0.0 {
                    continue;
                }
                let ret = sens_rhs(t, y, &fy, j, &zeros, &mut column, self.user_data);
                self.count(|c| c.sensitivity_rhs += 1);
                if ret != 0 {
                    self.record(Source::SensitivityRhs, ret);
                    out.fill(f64::NAN);
                    return;
                }
                for (o, c) in out.iter_mut().zip(&column) {
                    *o += weight * c;
                }
            }
            return;
        }

        let Some(perturbation) = self.parameters.as_ref() else {
            self.record(Source::SensitivityRhs, -1);
            out.fill(f64::NAN);
            return;
        };
        let mut forward = vec![0.0; y.len()];
        let mut backward = vec![0.0; y.len()];
        for (j, &weight) in v.iter().enumerate().take(count) {
            if weight == 0.0 {
                continue;
            }
            let Some(p) = perturbation.values.get(j) else {
                continue;
            };
            let delta = perturbation.scaling.get(j).copied().unwrap_or(1.0) * perturbation.delta;
            perturbation.values.set(j, p + delta);
            let ok_forward = self.eval_rhs(Source::SensitivityRhs, t, y, &mut forward);
            perturbation.values.set(j, p - delta);
            let ok_backward = self.eval_rhs(Source::SensitivityRhs, t, y, &mut backward);
            perturbation.values.set(j, p);
            self.count(|c| c.sensitivity_rhs += 1);
            if !(ok_forward && ok_backward) {
                out.fill(f64::NAN);
                return;
            }
            for ((o, f), b) in out.iter_mut().zip(&forward).zip(&backward) {
                *o += weight * (f - b) / (2.0 * delta);
            }
        }
    }
}
