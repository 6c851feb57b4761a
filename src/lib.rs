//! Adapter between models that evaluate `y' = f(t, y, p)` and diffsol's
//! implicit integrators, with forward parameter sensitivities.

mod callbacks;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod interface;
pub mod memory;
pub mod nvector;
pub mod options;
pub mod problem;
mod sensitivity;
pub mod solver;
pub mod status;

pub use engine::{DiffsolEngine, EngineCode, EngineStats, IntegrationEngine, SystemMatrix};
pub use error::{SolverError, SolverResult};
pub use interface::{CallbackResult, SensitivityRhsInput, SolverCaller};
pub use options::{MethodFamily, OptionInfo, SolverOptions};
pub use problem::OdeProblem;
pub use solver::{OdeSolver, StepMode, StepOutcome};
pub use status::{SolverStatus, StatusKind};
