mod common;

use std::sync::Arc;

use approx::assert_relative_eq;
use common::{decay_problem, no_sensitivities, Decay, NoRhs};
use nalgebra::DMatrix;
use odebridge::{OdeProblem, OdeSolver, SolverError, StepMode};

#[test]
fn solution_before_first_step_is_initial_state() {
    let y0 = vec![1.0, -2.5, 3.25, 0.0];
    let mut solver = OdeSolver::new(Arc::new(Decay::new(0.3)), decay_problem(y0.clone()));
    solver.init().unwrap();
    assert!(solver.is_initialized());
    assert_eq!(solver.read_solution().unwrap(), y0);
}

#[test]
fn missing_rhs_is_a_configuration_error_and_leaves_nothing_allocated() {
    let mut solver = OdeSolver::new(Arc::new(NoRhs), decay_problem(vec![1.0]));
    let err = solver.init().unwrap_err();
    assert!(err.is_configuration());
    assert!(!solver.is_initialized());
    assert!(solver.live_allocations().is_empty());
    assert!(matches!(solver.read_solution(), Err(SolverError::NotInitialized)));
}

#[test]
fn invalid_problem_fails_init_cleanly() {
    let problem = OdeProblem::new(0.0, vec![1.0, 2.0]).with_abs_tol(vec![1e-8]);
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), problem);
    assert!(solver.init().unwrap_err().is_configuration());
    assert!(solver.live_allocations().is_empty());
}

#[test]
fn terminate_is_idempotent() {
    let mut never_initialized = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]));
    never_initialized.terminate();
    never_initialized.terminate();
    assert!(never_initialized.live_allocations().is_empty());

    let mut solver = OdeSolver::new(
        Arc::new(Decay::new(1.0)),
        decay_problem(vec![1.0, 1.0]).with_sensitivity_parameters(vec![1.0]),
    );
    solver.init().unwrap();
    assert!(!solver.live_allocations().is_empty());
    solver.terminate();
    assert!(solver.live_allocations().is_empty());
    solver.terminate();
    assert!(solver.live_allocations().is_empty());
    assert!(!solver.is_initialized());
}

#[test]
fn init_twice_does_not_accumulate_resources() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0, 2.0]));
    solver.init().unwrap();
    let first = solver.live_allocations();
    solver.init().unwrap();
    assert_eq!(solver.live_allocations(), first);
}

#[test]
fn stepping_requires_init() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0]));
    let mut y = vec![0.0];
    let err = solver
        .perform_solver_step(1.0, &mut y, &mut no_sensitivities(1), StepMode::Exact)
        .unwrap_err();
    assert!(matches!(err, SolverError::NotInitialized));
    assert!(matches!(solver.reinit(0.0, &[1.0]), Err(SolverError::NotInitialized)));
}

#[test]
fn reinit_then_exact_step_at_restart_time_returns_new_state() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(0.5)), decay_problem(vec![1.0, 2.0]));
    solver.init().unwrap();
    let mut y = vec![0.0; 2];
    let mut ys = no_sensitivities(2);
    solver.perform_solver_step(1.0, &mut y, &mut ys, StepMode::Exact).unwrap();

    let status = solver.reinit(3.0, &[4.0, -1.0]).unwrap();
    assert!(status.is_ok());
    assert_eq!(solver.read_solution().unwrap(), vec![4.0, -1.0]);

    let outcome = solver.perform_solver_step(3.0, &mut y, &mut ys, StepMode::Exact).unwrap();
    assert!(outcome.status.is_ok());
    assert!(outcome.completed);
    assert_relative_eq!(y[0], 4.0, max_relative = 1e-12);
    assert_relative_eq!(y[1], -1.0, max_relative = 1e-12);

    let outcome = solver.perform_solver_step(4.0, &mut y, &mut ys, StepMode::Exact).unwrap();
    assert!(outcome.status.is_ok());
    assert_relative_eq!(y[0], 4.0 * (-0.5f64).exp(), max_relative = 1e-6);
    assert_relative_eq!(y[1], -(-0.5f64).exp(), max_relative = 1e-6);
}

#[test]
fn reinit_rejects_wrong_state_length() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0, 2.0]));
    solver.init().unwrap();
    assert!(matches!(solver.reinit(0.0, &[1.0]), Err(SolverError::Shape(_))));
}

#[test]
fn rejected_reinit_keeps_the_running_integration() {
    let mut solver = OdeSolver::new(Arc::new(Decay::new(0.5)), decay_problem(vec![1.0, 2.0]));
    solver.init().unwrap();
    let mut y = vec![0.0; 2];
    let mut ys = no_sensitivities(2);
    solver.perform_solver_step(1.0, &mut y, &mut ys, StepMode::Exact).unwrap();

    solver.set_option("HMax", -1.0).unwrap();
    assert!(solver.reinit(5.0, &[2.0, 2.0]).is_err());
    assert_eq!(solver.problem().initial_time(), 0.0);
    assert_eq!(solver.problem().initial_values(), &[1.0, 2.0]);
    let current = solver.read_solution().unwrap();
    assert_relative_eq!(current[0], (-0.5f64).exp(), max_relative = 1e-6);

    let outcome = solver.perform_solver_step(2.0, &mut y, &mut ys, StepMode::Exact).unwrap();
    assert!(outcome.status.is_ok());
    assert_relative_eq!(outcome.t_reached, 2.0);
    assert_relative_eq!(y[0], (-1.0f64).exp(), max_relative = 1e-6);
    assert_relative_eq!(y[1], 2.0 * (-1.0f64).exp(), max_relative = 1e-6);
}

#[test]
fn reinit_restarts_sensitivities_at_zero() {
    let mut solver = common::decay_with_sensitivity(Decay::new(1.0));
    let mut y = vec![0.0; 2];
    let mut ys = DMatrix::zeros(2, 1);
    solver.perform_solver_step(1.0, &mut y, &mut ys, StepMode::Exact).unwrap();
    assert!(ys[(0, 0)] < -0.3);

    solver.reinit(0.0, &[1.0, 1.0]).unwrap();
    assert_eq!(solver.read_sensitivities().unwrap(), DMatrix::zeros(2, 1));

    solver.perform_solver_step(1.0, &mut y, &mut ys, StepMode::Exact).unwrap();
    let expected = -(-1.0f64).exp();
    assert_relative_eq!(ys[(0, 0)], expected, max_relative = 1e-6);
    assert_relative_eq!(ys[(1, 0)], expected, max_relative = 1e-6);
}

#[test]
fn dropping_the_solver_releases_its_ledger() {
    let ledger;
    {
        let mut solver = OdeSolver::new(Arc::new(Decay::new(1.0)), decay_problem(vec![1.0; 8]));
        solver.init().unwrap();
        ledger = Arc::clone(solver.memory_ledger());
        assert!(!ledger.snapshot().is_empty());
    }
    assert!(ledger.snapshot().is_empty());
}
