//! The solver adapter: owns the engine and its native resources, drives the
//! lifecycle and the stepping protocol.

use std::any::Any;
use std::sync::Arc;

use log::{debug, trace, warn};
use nalgebra::DMatrix;

use crate::callbacks;
use crate::context::{NumericContext, SensitivityParameters};
use crate::engine::{
    DiffsolEngine, EngineCode, EngineStats, IntegrationEngine, JacFn, LinearSolver, SystemMatrix,
    Task,
};
use crate::error::{SolverError, SolverResult};
use crate::interface::SolverCaller;
use crate::memory::{MemoryLedger, MemoryStats};
use crate::nvector::{backend_for_threads, NVector};
use crate::options::{self, OptionInfo, SolverOptions};
use crate::problem::OdeProblem;
use crate::sensitivity;
use crate::status::{describe, SolverStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    /// Integrate up to the output time in one engine call.
    Exact,
    /// Take one internal step per call until the output time is reached.
    Single,
}

/// Result of [`OdeSolver::perform_solver_step`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutcome {
    pub status: SolverStatus,
    /// Time the output buffers correspond to.
    pub t_reached: f64,
    /// `true` once the output time has been reached.
    pub completed: bool,
}

/// Drives an [`IntegrationEngine`] on behalf of a [`SolverCaller`].
///
/// Every engine-native resource lives in an `Option` field so that
/// [`OdeSolver::terminate`] can release whatever is present and be called any
/// number of times.
pub struct OdeSolver<E: IntegrationEngine = DiffsolEngine> {
    caller: Arc<dyn SolverCaller>,
    problem: OdeProblem,
    options: SolverOptions,
    ledger: Arc<MemoryLedger>,
    initial_data: Option<NVector>,
    solution: Option<NVector>,
    abs_tol: Option<NVector>,
    sensitivity_values: Option<Vec<NVector>>,
    engine: Option<E>,
    context: Option<NumericContext>,
    step: usize,
    initialized: bool,
}

impl OdeSolver {
    /// Adapter over the diffsol-backed [`DiffsolEngine`].
    pub fn new(caller: Arc<dyn SolverCaller>, problem: OdeProblem) -> Self {
        Self::with_engine(caller, problem)
    }

    /// Every option [`OdeSolver::set_option`] accepts.
    pub fn solver_options_info() -> Vec<OptionInfo> {
        options::solver_options_info()
    }
}

impl<E: IntegrationEngine> OdeSolver<E> {
    pub fn with_engine(caller: Arc<dyn SolverCaller>, problem: OdeProblem) -> Self {
        Self {
            caller,
            problem,
            options: SolverOptions::default(),
            ledger: MemoryLedger::new(),
            initial_data: None,
            solution: None,
            abs_tol: None,
            sensitivity_values: None,
            engine: None,
            context: None,
            step: 0,
            initialized: false,
        }
    }

    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn problem(&self) -> &OdeProblem {
        &self.problem
    }

    /// Takes effect at the next [`OdeSolver::init`] or [`OdeSolver::reinit`].
    pub fn set_option(&mut self, name: &str, value: f64) -> SolverResult<()> {
        self.options.set(name, value)
    }

    pub fn number_of_threads(&self) -> usize {
        self.options.threads()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn status_message(&self, code: EngineCode) -> String {
        describe(code, self.options.max_steps())
    }

    pub fn memory_ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// Engine-native buffers currently held by this solver.
    pub fn live_allocations(&self) -> MemoryStats {
        self.ledger.snapshot()
    }

    pub fn engine_stats(&self) -> Option<EngineStats> {
        self.engine.as_ref().map(IntegrationEngine::stats)
    }

    /// Builds the engine and every native resource from the problem and the
    /// current options. On failure nothing stays allocated.
    pub fn init(&mut self) -> SolverResult<()> {
        self.terminate();
        match self.try_init() {
            Ok(()) => {
                self.initialized = true;
                debug!(
                    "solver initialized: n = {}, {:?}, {} sensitivity parameters, {} threads",
                    self.problem.size(),
                    self.options.method(),
                    self.problem.num_sensitivity_parameters(),
                    self.options.threads()
                );
                Ok(())
            }
            Err(err) => {
                debug!("solver initialization failed: {err}");
                self.terminate();
                Err(err)
            }
        }
    }

    fn try_init(&mut self) -> SolverResult<()> {
        const ORIGIN: &str = "OdeSolver::init";
        self.problem.validate()?;
        if !self.caller.has_rhs() {
            return Err(SolverError::config(ORIGIN, "no right-hand side function provided"));
        }

        let backend = backend_for_threads(self.options.threads())?;
        let initial = NVector::from_slice(self.problem.initial_values(), &backend, &self.ledger);
        self.solution = Some(NVector::from_slice(
            self.problem.initial_values(),
            &backend,
            &self.ledger,
        ));

        let engine = self.engine.insert(
            E::create(self.options.method())
                .ok_or_else(|| SolverError::config(ORIGIN, "cannot create integration engine"))?,
        );
        SolverError::check(
            engine.init(callbacks::rhs, self.problem.initial_time(), &initial),
            ORIGIN,
            "engine initialization failed",
        )?;
        self.abs_tol = Some(apply_options(engine, &self.options, &self.problem, &initial)?);
        self.step = 0;

        let caller = self.caller.as_ref();
        let n = self.problem.size();
        let linear_solver = if caller.uses_band_linear_solver() {
            let (mu, ml) = (caller.upper_bandwidth(), caller.lower_bandwidth());
            debug!("band linear solver: mu = {mu}, ml = {ml}");
            LinearSolver::band(&initial, SystemMatrix::band(n, mu, ml, &self.ledger))
        } else {
            debug!("dense linear solver");
            LinearSolver::dense(&initial, SystemMatrix::dense(n, &self.ledger))
        }
        .ok_or_else(|| SolverError::config(ORIGIN, "cannot create linear solver"))?;
        SolverError::check(
            engine.set_linear_solver(linear_solver),
            ORIGIN,
            "cannot attach linear solver",
        )?;

        let jacobian = caller.has_jacobian().then_some(callbacks::jacobian as JacFn);
        SolverError::check(
            engine.set_jacobian_fn(jacobian),
            ORIGIN,
            "cannot register Jacobian function",
        )?;

        let parameters = SensitivityParameters::new(self.problem.sensitivity_parameters());
        self.sensitivity_values = sensitivity::setup(engine, caller, &parameters, &initial)?;
        self.context = Some(NumericContext::new(Arc::clone(&self.caller), parameters));
        self.initial_data = Some(initial);
        Ok(())
    }

    /// Restarts integration at `(t0, y0)` keeping the engine instance.
    /// Sensitivities restart at zero with the initial parameter values.
    pub fn reinit(&mut self, t0: f64, y0: &[f64]) -> SolverResult<SolverStatus> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }
        // Validate against a copy so a rejected restart leaves the problem alone.
        let mut restarted = self.problem.clone();
        restarted.reset_state(t0, y0)?;
        let (Some(engine), Some(solution), Some(context)) = (
            self.engine.as_mut(),
            self.solution.as_mut(),
            self.context.as_ref(),
        ) else {
            return Err(SolverError::NotInitialized);
        };

        let initial = NVector::from_slice(y0, solution.backend(), &self.ledger);
        let abs_tol = apply_options(engine, &self.options, &restarted, &initial)?;

        let code = engine.reinit(t0, &initial);
        if code != EngineCode::SUCCESS {
            warn!("engine rejected reinitialization: {code}");
            return Ok(SolverStatus::from(code));
        }
        solution.copy_from(&initial);
        if let Some(values) = self.sensitivity_values.as_mut() {
            sensitivity::reinit(engine, context.parameters(), values)?;
        }
        self.problem = restarted;
        self.abs_tol = Some(abs_tol);
        self.initial_data = Some(initial);
        self.step = 0;
        debug!("solver reinitialized at t0 = {t0}");
        Ok(SolverStatus::from(code))
    }

    /// Advances towards `tout` and copies the state into `y` and, when there
    /// are sensitivity parameters, `dy_i/dp_j` into `y_sens[(i, j)]`.
    ///
    /// In [`StepMode::Single`] each call takes one internal step; calls that
    /// stop short of `tout` return `completed: false` with the internal-step
    /// state, and the call that reaches `tout` returns the state at `tout`.
    pub fn perform_solver_step(
        &mut self,
        tout: f64,
        y: &mut [f64],
        y_sens: &mut DMatrix<f64>,
        mode: StepMode,
    ) -> SolverResult<StepOutcome> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }
        let n = self.problem.size();
        if y.len() != n {
            return Err(SolverError::Shape(format!(
                "solution output has length {}, expected {n}",
                y.len()
            )));
        }
        let (Some(engine), Some(solution), Some(context)) = (
            self.engine.as_mut(),
            self.solution.as_mut(),
            self.context.as_ref(),
        ) else {
            return Err(SolverError::NotInitialized);
        };
        let user_data: &dyn Any = context;

        let (code, t_reached, completed) = match mode {
            StepMode::Exact => {
                let (code, t) = engine.advance(tout, solution, Task::Normal, user_data);
                (code, t, code.is_success())
            }
            StepMode::Single => {
                let forward = tout >= self.problem.initial_time();
                let tn = engine.stats().current_time;
                if (forward && tn >= tout) || (!forward && tn <= tout) {
                    // An earlier internal step already covers tout.
                    self.step = 0;
                    let (code, t) = engine.advance(tout, solution, Task::Normal, user_data);
                    (code, t, code.is_success())
                } else {
                    let (code, t) = engine.advance(tout, solution, Task::OneStep, user_data);
                    self.step += 1;
                    let max_steps = self.options.max_steps();
                    if max_steps != 0 && self.step > max_steps {
                        warn!("{} single steps taken before reaching t = {tout}", self.step);
                        if !code.is_input_error() {
                            y.copy_from_slice(solution.as_slice());
                        }
                        return Ok(StepOutcome {
                            status: SolverStatus::from(EngineCode::TOO_MUCH_WORK),
                            t_reached: t,
                            completed: false,
                        });
                    }
                    let short = if forward { t < tout } else { t > tout };
                    if code == EngineCode::SUCCESS && short {
                        trace!("single step reached t = {t}, output time {tout}");
                        (code, t, false)
                    } else if code == EngineCode::SUCCESS {
                        self.step = 0;
                        let (code, t) = engine.advance(tout, solution, Task::Normal, user_data);
                        (code, t, code.is_success())
                    } else {
                        (code, t, false)
                    }
                }
            }
        };

        if !code.is_input_error() {
            y.copy_from_slice(solution.as_slice());
        }
        let mut status = SolverStatus::from(code);
        if code == EngineCode::SUCCESS {
            if let Some(values) = self.sensitivity_values.as_mut() {
                let (sens_code, _) = engine.get_sens(values);
                if sens_code == EngineCode::SUCCESS {
                    sensitivity::copy_into(values, y_sens)?;
                } else {
                    warn!("cannot read sensitivities at t = {t_reached}: {sens_code}");
                    status = SolverStatus::from(sens_code);
                }
            }
        } else {
            debug!(
                "step towards t = {tout} failed: {}",
                describe(code, self.options.max_steps())
            );
        }
        Ok(StepOutcome {
            status,
            t_reached,
            completed: completed && status.is_ok(),
        })
    }

    /// Current contents of the solution buffer.
    pub fn read_solution(&self) -> SolverResult<Vec<f64>> {
        self.solution
            .as_ref()
            .map(|v| v.as_slice().to_vec())
            .ok_or(SolverError::NotInitialized)
    }

    /// Last sensitivities read from the engine as an `n x k` matrix; zero
    /// right after initialization.
    pub fn read_sensitivities(&self) -> SolverResult<DMatrix<f64>> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }
        let n = self.problem.size();
        match self.sensitivity_values.as_deref() {
            Some(values) => {
                let mut out = DMatrix::zeros(n, values.len());
                sensitivity::copy_into(values, &mut out)?;
                Ok(out)
            }
            None => Ok(DMatrix::zeros(n, 0)),
        }
    }

    /// Releases every native resource. Safe to call repeatedly and on a
    /// solver that was never initialized.
    pub fn terminate(&mut self) {
        let held = self.ledger.snapshot();
        self.solution = None;
        self.initial_data = None;
        self.abs_tol = None;
        self.sensitivity_values = None;
        // The engine owns the linear solver and its matrices.
        self.engine = None;
        self.context = None;
        self.step = 0;
        if self.initialized || !held.is_empty() {
            debug!(
                "solver terminated: released {} buffers ({} elements)",
                held.buffers, held.elements
            );
        }
        self.initialized = false;
    }
}

impl<E: IntegrationEngine> Drop for OdeSolver<E> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Pushes tolerances and step controls into the engine. Returns the
/// absolute-tolerance vector the engine was given.
fn apply_options<E: IntegrationEngine>(
    engine: &mut E,
    options: &SolverOptions,
    problem: &OdeProblem,
    template: &NVector,
) -> SolverResult<NVector> {
    const ORIGIN: &str = "OdeSolver::apply_options";
    let abs_tol = NVector::from_slice(problem.abs_tol(), template.backend(), template.ledger());
    SolverError::check(
        engine.set_tolerances(problem.rel_tol(), &abs_tol),
        ORIGIN,
        "tolerances rejected",
    )?;
    SolverError::check(
        engine.set_max_order(options.max_order()),
        ORIGIN,
        "maximum order rejected",
    )?;
    SolverError::check(
        engine.set_max_num_steps(options.max_steps()),
        ORIGIN,
        "maximum number of steps rejected",
    )?;
    SolverError::check(
        engine.set_max_hnil_warnings(options.max_hnil_warnings()),
        ORIGIN,
        "maximum number of t + h == t warnings rejected",
    )?;
    SolverError::check(
        engine.set_initial_step(options.initial_step()),
        ORIGIN,
        "initial step rejected",
    )?;
    SolverError::check(
        engine.set_max_step(options.max_step()),
        ORIGIN,
        "maximum step rejected",
    )?;
    SolverError::check(
        engine.set_min_step(options.min_step()),
        ORIGIN,
        "minimum step rejected",
    )?;
    Ok(abs_tol)
}
