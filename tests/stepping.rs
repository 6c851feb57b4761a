mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use approx::assert_relative_eq;
use common::{decay_problem, no_sensitivities, Decay, Failing, Flaky, Oscillator};
use odebridge::{
    CallbackResult, EngineCode, MethodFamily, OdeProblem, OdeSolver, SolverOptions, StatusKind,
    StepMode,
};

#[test]
fn exact_mode_reaches_each_output_time() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(2.0)), decay_problem(vec![1.0, 3.0]));
    solver.init().unwrap();
    let mut y = vec![0.0; 2];
    let mut ys = no_sensitivities(2);
    for &t in &[0.1, 0.5, 1.0, 2.0] {
        let outcome = solver.perform_solver_step(t, &mut y, &mut ys, StepMode::Exact).unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.status.kind, StatusKind::Ok);
        assert_eq!(outcome.t_reached, t);
        assert_relative_eq!(y[0], (-2.0 * t).exp(), max_relative = 1e-6);
        assert_relative_eq!(y[1], 3.0 * (-2.0 * t).exp(), max_relative = 1e-6);
    }
    assert_eq!(solver.read_solution().unwrap(), y);
}

#[test]
fn single_mode_takes_internal_steps_until_output_time() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]));
    solver.init().unwrap();
    let mut y = vec![0.0];
    let mut ys = no_sensitivities(1);

    let mut calls = 0;
    let mut last_t = 0.0;
    loop {
        let outcome = solver.perform_solver_step(1.0, &mut y, &mut ys, StepMode::Single).unwrap();
        assert!(outcome.status.is_ok());
        calls += 1;
        if outcome.completed {
            assert_eq!(outcome.t_reached, 1.0);
            break;
        }
        assert!(outcome.t_reached > last_t && outcome.t_reached < 1.0);
        assert_relative_eq!(y[0], (-outcome.t_reached).exp(), max_relative = 1e-6);
        last_t = outcome.t_reached;
        assert!(calls < 10_000);
    }
    assert!(calls > 1);
    assert_relative_eq!(y[0], (-1.0f64).exp(), max_relative = 1e-6);
}

#[test]
fn single_mode_enforces_step_limit() {
    let options = SolverOptions::default().with_max_steps(1);
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]))
        .with_options(options);
    solver.init().unwrap();
    let mut y = vec![0.0];
    let mut ys = no_sensitivities(1);

    let first = solver.perform_solver_step(10.0, &mut y, &mut ys, StepMode::Single).unwrap();
    assert!(first.status.is_ok());
    assert!(!first.completed);

    let second = solver.perform_solver_step(10.0, &mut y, &mut ys, StepMode::Single).unwrap();
    assert_eq!(second.status.code, EngineCode::TOO_MUCH_WORK);
    assert_eq!(second.status.kind, StatusKind::TooMuchWork);
    assert!(!second.completed);
}

#[test]
fn exact_mode_reports_engine_step_limit() {
    let options = SolverOptions::default().with_max_steps(3);
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]))
        .with_options(options);
    solver.init().unwrap();
    let mut y = vec![0.0];
    let outcome = solver
        .perform_solver_step(100.0, &mut y, &mut no_sensitivities(1), StepMode::Exact)
        .unwrap();
    assert_eq!(outcome.status.kind, StatusKind::TooMuchWork);
    assert!(!outcome.completed);
    assert!(outcome.t_reached > 0.0 && outcome.t_reached < 100.0);
    assert!(y[0] < 1.0 && y[0] > 0.0);
    assert!(solver.status_message(outcome.status.code).contains('3'));
}

#[test]
fn adams_integrates_oscillator() {
    let options = SolverOptions::default().with_method(MethodFamily::Adams);
    let problem = OdeProblem::new(0.0, vec![0.0, 1.0]).with_rel_tol(1e-10).with_uniform_abs_tol(1e-12);
    let mut solver = OdeSolver::new(Arc::new(Oscillator), problem).with_options(options);
    solver.init().unwrap();
    let mut y = vec![0.0; 2];
    let t = 2.0;
    let outcome = solver
        .perform_solver_step(t, &mut y, &mut no_sensitivities(2), StepMode::Exact)
        .unwrap();
    assert!(outcome.status.is_ok());
    assert_relative_eq!(y[0], f64::sin(t), max_relative = 1e-6);
    assert_relative_eq!(y[1], f64::cos(t), epsilon = 1e-6);
}

#[test]
fn analytic_jacobian_and_band_solver_match_dense_difference_quotients() {
    let y0: Vec<f64> = (1..=6).map(f64::from).collect();
    let callers = [
        Decay::new(4.0),
        Decay::new(4.0).with_jacobian(),
        Decay::new(4.0).banded(1, 1),
        Decay::new(4.0).banded(0, 0).with_jacobian(),
    ];
    let mut results = Vec::new();
    for caller in callers {
        let mut solver = OdeSolver::new(Arc::new(caller), decay_problem(y0.clone()));
        solver.init().unwrap();
        let mut y = vec![0.0; y0.len()];
        let outcome = solver
            .perform_solver_step(0.75, &mut y, &mut no_sensitivities(y0.len()), StepMode::Exact)
            .unwrap();
        assert!(outcome.status.is_ok());
        results.push(y);
    }
    let decay = (-3.0f64).exp();
    for y in &results {
        for (v, v0) in y.iter().zip(&y0) {
            assert_relative_eq!(*v, v0 * decay, max_relative = 1e-6);
        }
    }
}

#[test]
fn rhs_failures_surface_as_failure_status() {
    for result in [CallbackResult::RecoverableError, CallbackResult::UnrecoverableError] {
        let mut solver = OdeSolver::new(Arc::new(Failing(result)), decay_problem(vec![1.0, 2.0]));
        solver.init().unwrap();
        let mut y = vec![0.0; 2];
        let outcome = solver
            .perform_solver_step(1.0, &mut y, &mut no_sensitivities(2), StepMode::Exact)
            .unwrap();
        assert_eq!(outcome.status.kind, StatusKind::Failure);
        assert!(!outcome.completed);
        assert_eq!(y, vec![1.0, 2.0]);
    }
}

#[test]
fn recoverable_rhs_errors_are_retried_with_a_smaller_step() {
    let caller = Arc::new(Flaky::new(0.5, 2));
    let mut solver = OdeSolver::new(caller.clone(), decay_problem(vec![1.0]));
    solver.init().unwrap();
    let mut y = vec![0.0];
    let outcome = solver
        .perform_solver_step(1.0, &mut y, &mut no_sensitivities(1), StepMode::Exact)
        .unwrap();
    assert!(outcome.status.is_ok());
    assert!(outcome.completed);
    assert_eq!(outcome.t_reached, 1.0);
    assert_relative_eq!(y[0], 0.3678794442, max_relative = 1e-6);
    assert_eq!(caller.seen.load(Ordering::SeqCst), 2);
    assert!(solver.engine_stats().unwrap().step_retries >= 1);
}

#[test]
fn output_buffer_length_is_checked() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0, 2.0]));
    solver.init().unwrap();
    let mut y = vec![0.0; 3];
    assert!(solver
        .perform_solver_step(1.0, &mut y, &mut no_sensitivities(2), StepMode::Exact)
        .is_err());
}

#[test]
fn max_order_option_caps_order_used() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]));
    solver.set_option("MaxOrd", 3.0).unwrap();
    solver.init().unwrap();
    let mut y = vec![0.0];
    solver
        .perform_solver_step(20.0, &mut y, &mut no_sensitivities(1), StepMode::Exact)
        .unwrap();
    let stats = solver.engine_stats().unwrap();
    assert!(stats.max_order_used <= 3);
    assert!(stats.steps > 0);
}
