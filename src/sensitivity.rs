//! Forward sensitivity setup, restart and read-back.

use log::debug;
use nalgebra::DMatrix;

use crate::callbacks;
use crate::context::SensitivityParameters;
use crate::engine::{IntegrationEngine, SensRhsFn};
use crate::error::{SolverError, SolverResult};
use crate::interface::SolverCaller;
use crate::nvector::NVector;

/// Registers staggered forward sensitivities with the engine. Returns `None`
/// when there are no sensitivity parameters.
pub(crate) fn setup<E: IntegrationEngine>(
    engine: &mut E,
    caller: &dyn SolverCaller,
    parameters: &SensitivityParameters,
    template: &NVector,
) -> SolverResult<Option<Vec<NVector>>> {
    const ORIGIN: &str = "sensitivity::setup";
    if parameters.is_empty() {
        return Ok(None);
    }

    let values = template.clone_array(parameters.len());
    let rhs = caller
        .has_sensitivity_rhs()
        .then_some(callbacks::sensitivity_rhs as SensRhsFn);
    SolverError::check(
        engine.sens_init_staggered(rhs, &values),
        ORIGIN,
        "cannot enable forward sensitivities",
    )?;
    SolverError::check(
        engine.sens_ee_tolerances(),
        ORIGIN,
        "cannot derive sensitivity tolerances",
    )?;
    SolverError::check(
        engine.set_sens_error_control(false),
        ORIGIN,
        "cannot exclude sensitivities from error control",
    )?;
    SolverError::check(
        engine.set_sens_params(parameters.shared().clone(), parameters.scaling()),
        ORIGIN,
        "cannot register sensitivity parameters",
    )?;
    debug!(
        "forward sensitivities enabled for {} parameters ({} right-hand side)",
        parameters.len(),
        if rhs.is_some() { "user" } else { "difference-quotient" }
    );
    Ok(Some(values))
}

/// Restores initial parameter values and zero initial sensitivities.
pub(crate) fn reinit<E: IntegrationEngine>(
    engine: &mut E,
    parameters: &SensitivityParameters,
    values: &mut [NVector],
) -> SolverResult<()> {
    parameters.reset();
    for v in values.iter_mut() {
        v.fill(0.0);
    }
    SolverError::check(
        engine.sens_reinit(values),
        "sensitivity::reinit",
        "cannot restart forward sensitivities",
    )
}

/// Copies `values` into `out` so that `out[(i, j)] = dy_i / dp_j`.
pub(crate) fn copy_into(values: &[NVector], out: &mut DMatrix<f64>) -> SolverResult<()> {
    let rows = values.first().map_or(0, NVector::len);
    if out.ncols() != values.len() || out.nrows() != rows {
        return Err(SolverError::Shape(format!(
            "sensitivity output is {}x{}, expected {}x{}",
            out.nrows(),
            out.ncols(),
            rows,
            values.len()
        )));
    }
    for (j, v) in values.iter().enumerate() {
        out.column_mut(j).copy_from_slice(v.as_slice());
    }
    Ok(())
}
