use std::sync::Arc;

use crate::engine::SharedParameters;
use crate::interface::SolverCaller;

/// Sensitivity parameter values and their scaling factors.
#[derive(Clone, Debug, Default)]
pub struct SensitivityParameters {
    values: SharedParameters,
    initial: Vec<f64>,
    scaling: Vec<f64>,
}

impl SensitivityParameters {
    pub fn new(initial: &[f64]) -> Self {
        let scaling = initial
            .iter()
            .map(|p| if *p != 0.0 { p.abs() } else { 1.0 })
            .collect();
        Self {
            values: SharedParameters::new(initial.to_vec()),
            initial: initial.to_vec(),
            scaling,
        }
    }

    pub fn len(&self) -> usize {
        self.initial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_empty()
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    /// Always strictly positive: `|p|` for nonzero initial values, 1 otherwise.
    pub fn scaling(&self) -> &[f64] {
        &self.scaling
    }

    pub fn current(&self) -> Vec<f64> {
        self.values.snapshot()
    }

    pub fn shared(&self) -> &SharedParameters {
        &self.values
    }

    /// Restores the initial values.
    pub fn reset(&self) {
        self.values.replace(&self.initial);
    }
}

/// Per-solver bundle passed opaquely through every engine callback.
pub struct NumericContext {
    caller: Arc<dyn SolverCaller>,
    parameters: SensitivityParameters,
}

impl NumericContext {
    pub fn new(caller: Arc<dyn SolverCaller>, parameters: SensitivityParameters) -> Self {
        Self { caller, parameters }
    }

    pub fn caller(&self) -> &dyn SolverCaller {
        self.caller.as_ref()
    }

    pub fn parameters(&self) -> &SensitivityParameters {
        &self.parameters
    }
}

impl std::fmt::Debug for NumericContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumericContext")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}
