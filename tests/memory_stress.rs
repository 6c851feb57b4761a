#![cfg(feature = "diagnostics")]

use std::sync::Arc;

use nalgebra::DMatrix;
use odebridge::diagnostics::leaks::{LeakDetector, MemoryLedger};
use odebridge::{CallbackResult, OdeProblem, OdeSolver, SolverCaller, StepMode};

struct Logistic;

impl SolverCaller for Logistic {
    fn rhs(&self, _t: f64, y: &[f64], parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        let r = parameters.first().copied().unwrap_or(0.5);
        for (d, u) in ydot.iter_mut().zip(y) {
            *d = r * u * (1.0 - u);
        }
        CallbackResult::Ok
    }
}

fn problem(sensitivities: bool) -> OdeProblem {
    let problem = OdeProblem::new(0.0, vec![0.1, 0.2, 0.4]).with_rel_tol(1e-6).with_uniform_abs_tol(1e-8);
    if sensitivities {
        problem.with_sensitivity_parameters(vec![0.5])
    } else {
        problem
    }
}

fn times() -> Vec<f64> {
    (1..64).map(|i| i as f64 * 0.05).collect()
}

#[test]
fn repeated_init_and_terminate_does_not_leak() {
    let mut solver = OdeSolver::new(Arc::new(Logistic), problem(true));
    let ledger: Arc<MemoryLedger> = Arc::clone(solver.memory_ledger());
    let guard = LeakDetector::new("init-terminate", &ledger);
    for _ in 0..64 {
        solver.init().unwrap();
        solver.terminate();
    }
    guard.assert_clean();
}

#[test]
fn stepping_and_reinit_keep_allocations_flat() {
    let mut solver = OdeSolver::new(Arc::new(Logistic), problem(true));
    solver.init().unwrap();
    let level = solver.live_allocations();
    let mut y = vec![0.0; 3];
    let mut ys = DMatrix::zeros(3, 1);
    for _ in 0..16 {
        for &t in &times() {
            let outcome = solver.perform_solver_step(t, &mut y, &mut ys, StepMode::Exact).unwrap();
            assert!(outcome.status.is_ok());
        }
        solver.reinit(0.0, &[0.1, 0.2, 0.4]).unwrap();
        assert_eq!(solver.live_allocations(), level);
    }
    let ledger = Arc::clone(solver.memory_ledger());
    drop(solver);
    assert!(ledger.snapshot().is_empty());
}

#[test]
fn single_mode_long_run() {
    let mut solver = OdeSolver::new(Arc::new(Logistic), problem(false));
    let ledger = Arc::clone(solver.memory_ledger());
    let guard = LeakDetector::new("single-mode", &ledger);
    solver.init().unwrap();
    let mut y = vec![0.0; 3];
    let mut ys = DMatrix::zeros(3, 0);
    for _ in 0..8 {
        while !solver
            .perform_solver_step(3.0, &mut y, &mut ys, StepMode::Single)
            .unwrap()
            .completed
        {}
        solver.reinit(0.0, &[0.1, 0.2, 0.4]).unwrap();
    }
    solver.terminate();
    guard.assert_clean();
}
