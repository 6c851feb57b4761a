//! Engine-facing trampolines. The engine hands back the `&dyn Any` it was
//! given, which must be the solver's [`NumericContext`].

use std::any::Any;

use log::error;

use crate::context::NumericContext;
use crate::engine::SystemMatrix;
use crate::interface::SensitivityRhsInput;

fn resolve<'a>(user_data: &'a dyn Any, origin: &str) -> &'a NumericContext {
    match user_data.downcast_ref::<NumericContext>() {
        Some(context) => context,
        None => {
            error!("{origin}: engine user data is not a NumericContext");
            panic!("{origin}: missing numeric context");
        }
    }
}

pub(crate) fn rhs(t: f64, y: &[f64], ydot: &mut [f64], user_data: &dyn Any) -> i32 {
    let context = resolve(user_data, "rhs");
    context
        .parameters()
        .shared()
        .with(|p| context.caller().rhs(t, y, p, ydot))
        .to_engine()
}

pub(crate) fn jacobian(
    t: f64,
    y: &[f64],
    fy: &[f64],
    jac: &mut SystemMatrix,
    user_data: &dyn Any,
) -> i32 {
    let context = resolve(user_data, "jacobian");
    let caller = context.caller();
    if !caller.has_jacobian() {
        error!("jacobian: caller provides no Jacobian");
        panic!("jacobian callback registered for a caller without a Jacobian");
    }
    context
        .parameters()
        .shared()
        .with(|p| caller.jacobian(t, y, p, fy, jac))
        .to_engine()
}

pub(crate) fn sensitivity_rhs(
    t: f64,
    y: &[f64],
    ydot: &[f64],
    is: usize,
    ys: &[f64],
    ys_dot: &mut [f64],
    user_data: &dyn Any,
) -> i32 {
    let context = resolve(user_data, "sensitivity_rhs");
    context
        .parameters()
        .shared()
        .with(|parameters| {
            let input = SensitivityRhsInput {
                t,
                y,
                ydot,
                parameters,
                index: is,
                ys,
            };
            context.caller().sensitivity_rhs(&input, ys_dot)
        })
        .to_engine()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::SensitivityParameters;
    use crate::interface::{CallbackResult, SolverCaller};

    struct Scaled;

    impl SolverCaller for Scaled {
        fn rhs(&self, t: f64, y: &[f64], p: &[f64], ydot: &mut [f64]) -> CallbackResult {
            if t < 0.0 {
                return CallbackResult::RecoverableError;
            }
            if t > 10.0 {
                return CallbackResult::UnrecoverableError;
            }
            ydot[0] = p[0] * y[0];
            CallbackResult::Ok
        }

        fn has_sensitivity_rhs(&self) -> bool {
            true
        }

        fn sensitivity_rhs(&self, input: &SensitivityRhsInput<'_>, ys_dot: &mut [f64]) -> CallbackResult {
            ys_dot[0] = input.parameters[input.index] * input.ys[0] + input.y[0];
            CallbackResult::Ok
        }
    }

    fn context() -> NumericContext {
        NumericContext::new(Arc::new(Scaled), SensitivityParameters::new(&[3.0]))
    }

    #[test]
    fn rhs_forwards_parameters_and_maps_results() {
        let ctx = context();
        let mut ydot = [0.0];
        assert_eq!(rhs(1.0, &[2.0], &mut ydot, &ctx), 0);
        assert_eq!(ydot, [6.0]);
        assert_eq!(rhs(-1.0, &[2.0], &mut ydot, &ctx), 1);
        assert_eq!(rhs(11.0, &[2.0], &mut ydot, &ctx), -1);
    }

    #[test]
    fn sensitivity_rhs_sees_parameter_index() {
        let ctx = context();
        let mut out = [0.0];
        assert_eq!(sensitivity_rhs(0.0, &[1.0], &[3.0], 0, &[0.5], &mut out, &ctx), 0);
        assert_eq!(out, [2.5]);
    }

    #[test]
    #[should_panic(expected = "missing numeric context")]
    fn foreign_user_data_is_a_contract_violation() {
        let mut ydot = [0.0];
        rhs(0.0, &[1.0], &mut ydot, &42_u32);
    }
}
