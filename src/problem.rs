use crate::error::{SolverError, SolverResult};

pub const DEFAULT_REL_TOL: f64 = 1e-9;
pub const DEFAULT_ABS_TOL: f64 = 1e-10;

/// Problem size, initial condition, tolerances and sensitivity parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct OdeProblem {
    initial_time: f64,
    initial_values: Vec<f64>,
    abs_tol: Vec<f64>,
    rel_tol: f64,
    sensitivity_parameters: Vec<f64>,
}

impl OdeProblem {
    pub fn new(initial_time: f64, initial_values: Vec<f64>) -> Self {
        let abs_tol = vec![DEFAULT_ABS_TOL; initial_values.len()];
        Self {
            initial_time,
            initial_values,
            abs_tol,
            rel_tol: DEFAULT_REL_TOL,
            sensitivity_parameters: Vec::new(),
        }
    }

    pub fn with_abs_tol(mut self, abs_tol: Vec<f64>) -> Self {
        self.abs_tol = abs_tol;
        self
    }

    pub fn with_uniform_abs_tol(mut self, abs_tol: f64) -> Self {
        self.abs_tol = vec![abs_tol; self.initial_values.len()];
        self
    }

    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    /// Initial values of the parameters to compute sensitivities for.
    pub fn with_sensitivity_parameters(mut self, parameters: Vec<f64>) -> Self {
        self.sensitivity_parameters = parameters;
        self
    }

    pub fn size(&self) -> usize {
        self.initial_values.len()
    }

    pub fn initial_time(&self) -> f64 {
        self.initial_time
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn abs_tol(&self) -> &[f64] {
        &self.abs_tol
    }

    pub fn rel_tol(&self) -> f64 {
        self.rel_tol
    }

    pub fn sensitivity_parameters(&self) -> &[f64] {
        &self.sensitivity_parameters
    }

    pub fn num_sensitivity_parameters(&self) -> usize {
        self.sensitivity_parameters.len()
    }

    pub fn validate(&self) -> SolverResult<()> {
        const ORIGIN: &str = "OdeProblem::validate";
        if self.initial_values.is_empty() {
            return Err(SolverError::config(ORIGIN, "problem size must be positive"));
        }
        if !self.initial_time.is_finite() || self.initial_values.iter().any(|y| !y.is_finite()) {
            return Err(SolverError::config(ORIGIN, "initial time and values must be finite"));
        }
        if self.abs_tol.len() != self.size() {
            return Err(SolverError::config(
                ORIGIN,
                format!(
                    "{} absolute tolerances given for a problem of size {}",
                    self.abs_tol.len(),
                    self.size()
                ),
            ));
        }
        if !(self.rel_tol >= 0.0 && self.rel_tol.is_finite())
            || self.abs_tol.iter().any(|a| !(*a >= 0.0 && a.is_finite()))
        {
            return Err(SolverError::config(ORIGIN, "tolerances must be finite and non-negative"));
        }
        if self.sensitivity_parameters.iter().any(|p| !p.is_finite()) {
            return Err(SolverError::config(ORIGIN, "sensitivity parameters must be finite"));
        }
        Ok(())
    }

    /// Replaces the initial condition, keeping size and tolerances.
    pub fn reset_state(&mut self, initial_time: f64, initial_values: &[f64]) -> SolverResult<()> {
        if initial_values.len() != self.size() {
            return Err(SolverError::Shape(format!(
                "expected {} initial values, got {}",
                self.size(),
                initial_values.len()
            )));
        }
        if !initial_time.is_finite() || initial_values.iter().any(|y| !y.is_finite()) {
            return Err(SolverError::config(
                "OdeProblem::reset_state",
                "initial time and values must be finite",
            ));
        }
        self.initial_time = initial_time;
        self.initial_values.copy_from_slice(initial_values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_problem_size() {
        let problem = OdeProblem::new(0.0, vec![1.0, 2.0, 3.0]);
        assert_eq!(problem.abs_tol(), &[DEFAULT_ABS_TOL; 3]);
        assert_eq!(problem.rel_tol(), DEFAULT_REL_TOL);
        assert_eq!(problem.num_sensitivity_parameters(), 0);
        problem.validate().unwrap();
    }

    #[test]
    fn validation_failures_are_configuration_errors() {
        let cases = [
            OdeProblem::new(0.0, vec![]),
            OdeProblem::new(0.0, vec![1.0]).with_abs_tol(vec![1e-6, 1e-6]),
            OdeProblem::new(0.0, vec![1.0]).with_rel_tol(-1.0),
            OdeProblem::new(f64::NAN, vec![1.0]),
        ];
        for problem in cases {
            assert!(problem.validate().unwrap_err().is_configuration());
        }
    }

    #[test]
    fn reset_state_checks_length() {
        let mut problem = OdeProblem::new(0.0, vec![1.0, 1.0]);
        assert!(matches!(problem.reset_state(1.0, &[1.0]), Err(SolverError::Shape(_))));
        problem.reset_state(2.0, &[3.0, 4.0]).unwrap();
        assert_eq!(problem.initial_time(), 2.0);
        assert_eq!(problem.initial_values(), &[3.0, 4.0]);
    }
}
