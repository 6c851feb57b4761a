#![cfg(feature = "mem-profiling")]

use std::sync::Arc;

use nalgebra::DMatrix;
use odebridge::{
    diagnostics::{jemalloc_stats, leaks::LeakDetector},
    CallbackResult, OdeProblem, OdeSolver, SolverCaller, StepMode,
};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Logistic growth `u' = k u (1 - u)` on a chain of independent cells.
struct Logistic;

impl SolverCaller for Logistic {
    fn rhs(&self, _t: f64, y: &[f64], parameters: &[f64], ydot: &mut [f64]) -> CallbackResult {
        let k = parameters.first().copied().unwrap_or(0.8);
        for (d, u) in ydot.iter_mut().zip(y) {
            *d = k * u * (1.0 - u);
        }
        CallbackResult::Ok
    }

    fn uses_band_linear_solver(&self) -> bool {
        true
    }
}

fn main() {
    run_harness();
}

fn run_harness() {
    let times: Vec<f64> = (1..256).map(|i| i as f64 * 0.02).collect();
    let y0 = vec![0.05; 32];
    let problem = OdeProblem::new(0.0, y0.clone()).with_sensitivity_parameters(vec![0.8]);
    let mut solver = OdeSolver::new(Arc::new(Logistic), problem);
    let ledger = Arc::clone(solver.memory_ledger());

    let before = jemalloc_stats::allocated_bytes();
    {
        let guard = LeakDetector::new("leak-harness", &ledger);
        for _ in 0..32 {
            solver.init().expect("solver initialization failed");
            exercise(&mut solver, &y0, &times);
            solver.terminate();
        }
        guard.assert_clean();
    }
    let after = jemalloc_stats::allocated_bytes();

    const MAX_DRIFT_BYTES: u64 = 32 * 1024;
    if after > before + MAX_DRIFT_BYTES {
        panic!(
            "jemalloc allocated bytes increased by {} (> {} threshold)",
            after.saturating_sub(before),
            MAX_DRIFT_BYTES
        );
    }
}

fn exercise(solver: &mut OdeSolver, y0: &[f64], times: &[f64]) {
    let mut y = vec![0.0; y0.len()];
    let mut ys = DMatrix::zeros(y0.len(), 1);
    for round in 0..4 {
        let mode = if round % 2 == 0 { StepMode::Exact } else { StepMode::Single };
        for &t in times {
            loop {
                let outcome = solver
                    .perform_solver_step(t, &mut y, &mut ys, mode)
                    .expect("step failed");
                assert!(outcome.status.is_ok(), "{:?}", outcome.status);
                if outcome.completed {
                    break;
                }
            }
        }
        solver.reinit(0.0, y0).expect("reinit failed");
    }
}
