//! [`DiffsolEngine`]: the [`IntegrationEngine`] backed by diffsol's BDF and
//! ESDIRK integrators.
//!
//! diffsol solvers borrow their problem, and the problem's equation closures
//! borrow the per-call user data. The engine therefore keeps only the
//! integrator state between calls and rebuilds problem and solver around it
//! on every [`IntegrationEngine::advance`].

use std::any::Any;

use diffsol::error::DiffsolError;
use diffsol::{
    BdfState, NalgebraContext, NalgebraLU, NalgebraMat, NalgebraVec, OdeBuilder, OdeEquations,
    OdeEquationsImplicitSens, OdeSolverMethod, OdeSolverProblem, RkState,
    Vector, VectorHost,
};
use log::{debug, trace, warn};

use super::evaluator::{Counters, Evaluator, ParameterPerturbation};
use super::jacobian::LinearSolver;
use super::{
    EngineCode, EngineStats, IntegrationEngine, JacFn, MethodFamily, RhsFn, SensRhsFn,
    SharedParameters, Task,
};
use crate::nvector::NVector;

type StateMatrix = NalgebraMat<f64>;
type StateVector = NalgebraVec<f64>;
type Context = NalgebraContext;
type LinearSolverBackend = NalgebraLU<f64>;

/// Attempts per internal step before a recurring recoverable callback
/// failure is reported.
const MAX_CALLBACK_RETRIES: usize = 10;
/// Step-size reduction after a recoverable callback failure.
const RETRY_STEP_FACTOR: f64 = 0.25;

#[derive(Clone, Copy, Debug)]
struct Settings {
    max_order: usize,
    max_steps: usize,
    max_hnil_warnings: i32,
    h_init: f64,
    h_min: f64,
    /// `0` means unbounded.
    h_max: f64,
}

impl Settings {
    fn new(method: MethodFamily) -> Self {
        Self {
            max_order: method.max_order(),
            max_steps: 500,
            max_hnil_warnings: 10,
            h_init: 0.0,
            h_min: 0.0,
            h_max: 0.0,
        }
    }
}

struct Sensitivities {
    rhs: Option<SensRhsFn>,
    initial: Vec<Vec<f64>>,
    ee_tolerances: bool,
    error_control: bool,
    params: Option<SharedParameters>,
    scaling: Vec<f64>,
    /// Values at the time of the last successful return.
    latest: Vec<Vec<f64>>,
}

impl Sensitivities {
    fn count(&self) -> usize {
        self.initial.len()
    }
}

/// Integrator state carried between calls.
enum Trajectory {
    Bdf(BdfState<StateVector>),
    Esdirk(RkState<StateVector>),
}

struct Memory {
    rhs: RhsFn,
    t0: f64,
    y0: Vec<f64>,
    rtol: f64,
    atol: Option<Vec<f64>>,
    linear_solver: Option<LinearSolver>,
    jac: Option<JacFn>,
    sens: Option<Sensitivities>,
    trajectory: Option<Trajectory>,
    direction: f64,
    /// Time of the last successful return.
    t_last: f64,
    current: Vec<f64>,
    nhnil: i32,
    stats: EngineStats,
}

impl Memory {
    fn new(rhs: RhsFn, t0: f64, y0: &NVector) -> Self {
        Self {
            rhs,
            t0,
            y0: y0.as_slice().to_vec(),
            rtol: 0.0,
            atol: None,
            linear_solver: None,
            jac: None,
            sens: None,
            trajectory: None,
            direction: 1.0,
            t_last: t0,
            current: y0.as_slice().to_vec(),
            nhnil: 0,
            stats: EngineStats {
                current_time: t0,
                ..EngineStats::default()
            },
        }
    }

    fn n(&self) -> usize {
        self.y0.len()
    }

    fn restart(&mut self, t0: f64, y0: &[f64]) {
        self.t0 = t0;
        self.y0.copy_from_slice(y0);
        self.current.copy_from_slice(y0);
        self.trajectory = None;
        self.t_last = t0;
        self.nhnil = 0;
        self.stats.current_time = t0;
        self.stats.current_order = 0;
        self.stats.last_step = 0.0;
        if let Some(sens) = self.sens.as_mut() {
            sens.latest.clone_from(&sens.initial);
        }
    }
}

/// What one call to `advance` produced.
struct Output {
    /// Time `y` corresponds to.
    t: f64,
    /// Internal integrator time.
    t_internal: f64,
    y: Vec<f64>,
    sens: Vec<Vec<f64>>,
    steps: usize,
    retries: usize,
    max_order_used: usize,
    order: usize,
    h: f64,
    nhnil: i32,
    counters: Counters,
}

impl Output {
    fn new(mem: &Memory) -> Self {
        Self {
            t: mem.t_last,
            t_internal: mem.stats.current_time,
            y: mem.current.clone(),
            sens: Vec::new(),
            steps: 0,
            retries: 0,
            max_order_used: 0,
            order: mem.stats.current_order,
            h: mem.stats.last_step,
            nhnil: mem.nhnil,
            counters: Counters::default(),
        }
    }
}

/// [`IntegrationEngine`] over diffsol. [`MethodFamily::Bdf`] selects diffsol's
/// variable-order BDF; [`MethodFamily::Adams`] selects its ESDIRK34 method,
/// the non-stiff alternative it offers.
pub struct DiffsolEngine {
    method: MethodFamily,
    settings: Settings,
    mem: Option<Memory>,
}

impl std::fmt::Debug for DiffsolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffsolEngine")
            .field("method", &self.method)
            .field("settings", &self.settings)
            .field("initialized", &self.mem.is_some())
            .finish()
    }
}

impl DiffsolEngine {
    pub fn method(&self) -> MethodFamily {
        self.method
    }

    fn sens_mut(&mut self) -> Result<&mut Sensitivities, EngineCode> {
        let mem = self.mem.as_mut().ok_or(EngineCode::NO_MALLOC)?;
        mem.sens.as_mut().ok_or(EngineCode::NO_SENS)
    }
}

/// Inputs of one problem build.
struct ProblemSpec<'s> {
    t0: f64,
    y0: &'s [f64],
    ys0: &'s [Vec<f64>],
    rtol: f64,
    atol: &'s [f64],
    parameters: Vec<f64>,
    h0: f64,
    /// Parameter scaling when sensitivities take part in error control.
    sens_scaling: Option<&'s [f64]>,
}

/// Builds the diffsol problem whose equation closures call back through `ev`.
fn build_problem<'a>(
    ev: &'a Evaluator<'a>,
    spec: &ProblemSpec<'_>,
) -> Result<
    OdeSolverProblem<
        impl OdeEquationsImplicitSens<M = StateMatrix, V = StateVector, T = f64, C = Context> + 'a,
    >,
    DiffsolError,
> {
    let n = spec.y0.len();
    let y0 = spec.y0.to_vec();
    let ys0 = spec.ys0.to_vec();
    let mut problem = OdeBuilder::<StateMatrix>::new()
        .t0(spec.t0)
        .h0(spec.h0)
        .rtol(spec.rtol)
        .atol(spec.atol.to_vec())
        .p(spec.parameters.clone())
        .rhs_sens_implicit(
            move |x, _p, t, y| ev.rhs(t, x.as_slice(), y.as_mut_slice()),
            move |x, _p, t, v, y| ev.jac_mul(t, x.as_slice(), v.as_slice(), y.as_mut_slice()),
            move |x, _p, t, v, y| ev.sens_mul(t, x.as_slice(), v.as_slice(), y.as_mut_slice()),
        )
        .init_sens(
            move |_p, _t, y| y.as_mut_slice().copy_from_slice(&y0),
            move |_p, _t, v, y| {
                let out = y.as_mut_slice();
                out.fill(0.0);
                for (weight, column) in v.as_slice().iter().zip(&ys0) {
                    for (o, c) in out.iter_mut().zip(column) {
                        *o += weight * c;
                    }
                }
            },
            n,
        )
        .build()?;

    if let Some(scaling) = spec.sens_scaling {
        // One tolerance vector covers every parameter, so take the tightest.
        let largest = scaling.iter().copied().fold(1.0_f64, f64::max);
        let sens_atol: Vec<f64> = spec.atol.iter().map(|a| a / largest).collect();
        problem.sens_rtol = Some(spec.rtol);
        problem.sens_atol = Some(StateVector::from_slice(&sens_atol, Context::default()));
    }
    Ok(problem)
}

/// Per-call stepping parameters.
struct Run<'r, 'e> {
    ev: &'r Evaluator<'e>,
    settings: &'r Settings,
    direction: f64,
    tout: f64,
    task: Task,
    /// The order ceiling only applies to the BDF family.
    cap_order: bool,
    /// The trajectory was created by this call.
    fresh: bool,
}

/// Takes one internal step. After a recoverable callback failure the step
/// is retaken from the saved state with a smaller size, on a solver rebuilt
/// by `rebuild` so that no Jacobian from the failed attempt is reused.
/// Returns the number of retries.
fn step_once<'p, Eqn, S, R>(solver: &mut S, run: &Run<'_, '_>, rebuild: &R) -> Result<usize, EngineCode>
where
    Eqn: OdeEquations<V = StateVector, T = f64> + 'p,
    S: OdeSolverMethod<'p, Eqn>,
    R: Fn(S::State) -> Result<S, DiffsolError>,
{
    let mut saved = solver.state_clone();
    let mut h = solver.state().h;
    let mut retries = 0;
    loop {
        let result = solver.step();
        let Some(failure) = run.ev.take_failure() else {
            return match result {
                Ok(_) => Ok(retries),
                Err(err) => {
                    warn!("integrator step failed at t = {}: {err}", solver.state().t);
                    Err(EngineCode::CONV_FAILURE)
                }
            };
        };
        retries += 1;
        *solver = match rebuild(saved) {
            Ok(restored) => restored,
            Err(err) => {
                warn!("cannot restore the integrator after a callback failure: {err}");
                return Err(EngineCode::LSETUP_FAIL);
            }
        };
        if failure.fatal || retries >= MAX_CALLBACK_RETRIES {
            debug!(
                "{:?} callback failed at t = {} after {retries} attempts",
                failure.source,
                solver.state().t
            );
            return Err(failure.step_code());
        }
        if let Err(err) = solver.set_stop_time(run.tout) {
            debug!("stop time {} rejected after a retry: {err}", run.tout);
            return Err(EngineCode::BAD_T);
        }
        saved = solver.state_clone();
        h *= RETRY_STEP_FACTOR;
        trace!(
            "recoverable {:?} failure at t = {}, retrying with h = {h}",
            failure.source,
            solver.state().t
        );
        *solver.state_mut().h = h;
    }
}

/// Applies the order ceiling and step bounds before the next step. Touching
/// the step size restarts the method at first order.
fn enforce_limits<'p, Eqn, S>(solver: &mut S, settings: &Settings, cap_order: bool)
where
    Eqn: OdeEquations<V = StateVector, T = f64> + 'p,
    S: OdeSolverMethod<'p, Eqn>,
{
    let h = solver.state().h;
    let mut bounded = h.abs();
    if settings.h_max > 0.0 {
        bounded = bounded.min(settings.h_max);
    }
    if settings.h_min > 0.0 {
        bounded = bounded.max(settings.h_min);
    }
    let over_order = cap_order && solver.order() > settings.max_order;
    if bounded != h.abs() || over_order {
        *solver.state_mut().h = bounded.copysign(h);
    }
}

fn copy_state<'p, Eqn, S>(solver: &S, out: &mut Output)
where
    Eqn: OdeEquations<V = StateVector, T = f64> + 'p,
    S: OdeSolverMethod<'p, Eqn>,
{
    let state = solver.state();
    out.t = state.t;
    out.t_internal = state.t;
    out.h = state.h;
    out.y.copy_from_slice(state.y.as_slice());
    out.sens = state.s.iter().map(|s| s.as_slice().to_vec()).collect();
}

/// Steps `solver` towards `run.tout`. [`Task::Normal`] lands on `tout`
/// exactly; [`Task::OneStep`] returns after one internal step that does not
/// pass it.
fn drive<'p, Eqn, S, R>(solver: &mut S, rebuild: &R, run: &Run<'_, '_>, out: &mut Output) -> EngineCode
where
    Eqn: OdeEquations<V = StateVector, T = f64> + 'p,
    S: OdeSolverMethod<'p, Eqn>,
    R: Fn(S::State) -> Result<S, DiffsolError>,
{
    let (tout, settings) = (run.tout, run.settings);
    let t = solver.state().t;
    if (t - tout) * run.direction >= 0.0 {
        if t == tout {
            copy_state(solver, out);
            return EngineCode::SUCCESS;
        }
        if run.task == Task::Normal {
            return match (solver.interpolate(tout), solver.interpolate_sens(tout)) {
                (Ok(y), Ok(sens)) => {
                    out.t = tout;
                    out.y.copy_from_slice(y.as_slice());
                    out.sens = sens.iter().map(|s| s.as_slice().to_vec()).collect();
                    EngineCode::SUCCESS
                }
                (Err(err), _) | (_, Err(err)) => {
                    debug!("cannot interpolate at t = {tout} from t = {t}: {err}");
                    EngineCode::BAD_T
                }
            };
        }
    }
    if let Err(err) = solver.set_stop_time(tout) {
        debug!("stop time {tout} rejected at t = {t}: {err}");
        return EngineCode::BAD_T;
    }

    loop {
        if settings.max_steps > 0 && out.steps >= settings.max_steps {
            debug!(
                "{} steps taken before reaching tout = {tout}, stopping at t = {}",
                settings.max_steps,
                solver.state().t
            );
            copy_state(solver, out);
            return EngineCode::TOO_MUCH_WORK;
        }
        enforce_limits(solver, settings, run.cap_order);

        let (t, h) = (solver.state().t, solver.state().h);
        if t + h == t {
            out.nhnil += 1;
            if out.nhnil <= settings.max_hnil_warnings {
                warn!("internal t = {t} and step h = {h} are such that t + h = t on the next step");
            }
            if out.nhnil == settings.max_hnil_warnings {
                warn!(
                    "the t + h = t warning has been issued {} times and will not be issued again",
                    out.nhnil
                );
            }
        }

        // A capped order has just forced a first-order restart.
        let order = if run.cap_order && solver.order() > settings.max_order {
            1
        } else {
            solver.order()
        };
        match step_once(solver, run, rebuild) {
            Ok(retries) => out.retries += retries,
            Err(code) => {
                copy_state(solver, out);
                return code;
            }
        }
        out.steps += 1;
        out.order = order;
        out.max_order_used = out.max_order_used.max(order);

        let reached = (solver.state().t - tout) * run.direction >= 0.0;
        if run.task == Task::OneStep || reached {
            copy_state(solver, out);
            if reached {
                out.t = tout;
            }
            return EngineCode::SUCCESS;
        }
    }
}

/// Builds a solver around `state` with `rebuild`, runs it, and hands the
/// state back.
fn execute<'p, Eqn, S, R>(
    state: S::State,
    rebuild: R,
    run: &Run<'_, '_>,
    out: &mut Output,
) -> Result<(EngineCode, S::State), DiffsolError>
where
    Eqn: OdeEquations<V = StateVector, T = f64> + 'p,
    S: OdeSolverMethod<'p, Eqn>,
    R: Fn(S::State) -> Result<S, DiffsolError>,
{
    let mut solver = rebuild(state)?;
    if run.fresh && run.settings.h_init > 0.0 {
        *solver.state_mut().h = run.settings.h_init * run.direction;
    }
    let code = drive(&mut solver, &rebuild, run, out);
    Ok((code, solver.into_state()))
}

fn advance_memory(
    mem: &mut Memory,
    settings: &Settings,
    method: MethodFamily,
    atol: &[f64],
    tout: f64,
    task: Task,
    user_data: &dyn Any,
) -> (EngineCode, Output) {
    let mut out = Output::new(mem);
    let direction = mem.direction;
    let delta = mem.rtol.max(f64::EPSILON).sqrt();
    let sens_count = mem.sens.as_ref().map_or(0, Sensitivities::count);
    let sens_rhs = mem.sens.as_ref().and_then(|s| s.rhs);
    // diffsol integrates one sensitivity per entry of `p`.
    let mut parameters = mem
        .sens
        .as_ref()
        .and_then(|s| s.params.as_ref())
        .map_or_else(Vec::new, SharedParameters::snapshot);
    parameters.resize(sens_count, 0.0);
    let perturbation = mem.sens.as_ref().and_then(|s| {
        s.params.as_ref().map(|values| ParameterPerturbation {
            values,
            scaling: &s.scaling,
            delta,
        })
    });
    let matrix = mem.linear_solver.as_mut().map(LinearSolver::jacobian_mut);
    let ev = Evaluator::new(mem.rhs, user_data)
        .with_jacobian(mem.jac, matrix)
        .with_sensitivities(sens_count, sens_rhs, perturbation);

    let spec = ProblemSpec {
        t0: mem.t0,
        y0: &mem.y0,
        ys0: mem.sens.as_ref().map_or(&[][..], |s| s.initial.as_slice()),
        rtol: mem.rtol,
        atol,
        parameters,
        h0: direction * if settings.h_init > 0.0 { settings.h_init } else { 1.0 },
        sens_scaling: mem
            .sens
            .as_ref()
            .filter(|s| s.error_control)
            .map(|s| s.scaling.as_slice()),
    };
    let problem = match build_problem(&ev, &spec) {
        Ok(problem) => problem,
        Err(err) => {
            warn!("cannot build the integration problem: {err}");
            return (EngineCode::ILL_INPUT, out);
        }
    };

    let fresh = mem.trajectory.is_none();
    let trajectory = match mem.trajectory.take() {
        Some(trajectory) => trajectory,
        None => {
            let created = match (method, sens_count > 0) {
                (MethodFamily::Bdf, false) => problem
                    .bdf_state::<LinearSolverBackend>()
                    .map(Trajectory::Bdf),
                (MethodFamily::Bdf, true) => problem
                    .bdf_state_sens::<LinearSolverBackend>()
                    .map(Trajectory::Bdf),
                (MethodFamily::Adams, false) => problem
                    .esdirk34::<LinearSolverBackend>()
                    .map(|solver| Trajectory::Esdirk(solver.into_state())),
                (MethodFamily::Adams, true) => problem
                    .esdirk34_sens::<LinearSolverBackend>()
                    .map(|solver| Trajectory::Esdirk(solver.into_state())),
            };
            out.counters = ev.counters();
            if let Some(failure) = ev.take_failure() {
                debug!("{:?} callback failed at the initial state", failure.source);
                return (failure.first_call_code(), out);
            }
            match created {
                Ok(trajectory) => trajectory,
                Err(err) => {
                    warn!("cannot compute the initial integrator state: {err}");
                    return (EngineCode::ILL_INPUT, out);
                }
            }
        }
    };

    let run = Run {
        ev: &ev,
        settings,
        direction,
        tout,
        task,
        cap_order: method == MethodFamily::Bdf,
        fresh,
    };
    let with_sens = sens_count > 0;
    let result = match trajectory {
        Trajectory::Bdf(state) if with_sens => execute(
            state,
            |state: BdfState<StateVector>| problem.bdf_solver_sens::<LinearSolverBackend>(state),
            &run,
            &mut out,
        )
        .map(|(code, state)| (code, Trajectory::Bdf(state))),
        Trajectory::Bdf(state) => execute(
            state,
            |state: BdfState<StateVector>| problem.bdf_solver::<LinearSolverBackend>(state),
            &run,
            &mut out,
        )
        .map(|(code, state)| (code, Trajectory::Bdf(state))),
        Trajectory::Esdirk(state) if with_sens => execute(
            state,
            |state: RkState<StateVector>| problem.esdirk34_solver_sens::<LinearSolverBackend>(state),
            &run,
            &mut out,
        )
        .map(|(code, state)| (code, Trajectory::Esdirk(state))),
        Trajectory::Esdirk(state) => execute(
            state,
            |state: RkState<StateVector>| problem.esdirk34_solver::<LinearSolverBackend>(state),
            &run,
            &mut out,
        )
        .map(|(code, state)| (code, Trajectory::Esdirk(state))),
    };
    out.counters = ev.counters();

    match result {
        Ok((code, trajectory)) => {
            mem.trajectory = Some(trajectory);
            (code, out)
        }
        Err(err) => {
            let code = ev
                .take_failure()
                .map_or(EngineCode::LSETUP_FAIL, |failure| failure.step_code());
            warn!("cannot set up the integrator at t = {}: {err}", out.t_internal);
            (code, out)
        }
    }
}

impl IntegrationEngine for DiffsolEngine {
    fn create(method: MethodFamily) -> Option<Self> {
        Some(Self {
            method,
            settings: Settings::new(method),
            mem: None,
        })
    }

    fn init(&mut self, rhs: RhsFn, t0: f64, y0: &NVector) -> EngineCode {
        if y0.is_empty() || !t0.is_finite() {
            return EngineCode::ILL_INPUT;
        }
        self.mem = Some(Memory::new(rhs, t0, y0));
        debug!(
            "{:?} engine initialized: n = {}, t0 = {}, backend = {}",
            self.method,
            y0.len(),
            t0,
            y0.backend().name()
        );
        EngineCode::SUCCESS
    }

    fn reinit(&mut self, t0: f64, y0: &NVector) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        if y0.len() != mem.n() || !t0.is_finite() {
            return EngineCode::ILL_INPUT;
        }
        mem.restart(t0, y0.as_slice());
        debug!("engine reinitialized at t0 = {t0}");
        EngineCode::SUCCESS
    }

    fn set_tolerances(&mut self, rtol: f64, atol: &NVector) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        if !(rtol >= 0.0 && rtol.is_finite())
            || atol.len() != mem.n()
            || atol.as_slice().iter().any(|a| !(*a >= 0.0 && a.is_finite()))
        {
            return EngineCode::ILL_INPUT;
        }
        mem.rtol = rtol;
        mem.atol = Some(atol.as_slice().to_vec());
        EngineCode::SUCCESS
    }

    fn set_max_order(&mut self, max_order: usize) -> EngineCode {
        if max_order == 0 || max_order > self.method.max_order() {
            return EngineCode::ILL_INPUT;
        }
        self.settings.max_order = max_order;
        EngineCode::SUCCESS
    }

    fn set_max_num_steps(&mut self, max_steps: usize) -> EngineCode {
        self.settings.max_steps = max_steps;
        EngineCode::SUCCESS
    }

    fn set_max_hnil_warnings(&mut self, max_warnings: i32) -> EngineCode {
        self.settings.max_hnil_warnings = max_warnings;
        EngineCode::SUCCESS
    }

    fn set_initial_step(&mut self, h0: f64) -> EngineCode {
        if !h0.is_finite() {
            return EngineCode::ILL_INPUT;
        }
        self.settings.h_init = h0;
        EngineCode::SUCCESS
    }

    fn set_max_step(&mut self, h_max: f64) -> EngineCode {
        if !(h_max >= 0.0) || (h_max > 0.0 && self.settings.h_min > h_max) {
            return EngineCode::ILL_INPUT;
        }
        self.settings.h_max = h_max;
        EngineCode::SUCCESS
    }

    fn set_min_step(&mut self, h_min: f64) -> EngineCode {
        if !(h_min >= 0.0 && h_min.is_finite())
            || (self.settings.h_max > 0.0 && h_min > self.settings.h_max)
        {
            return EngineCode::ILL_INPUT;
        }
        self.settings.h_min = h_min;
        EngineCode::SUCCESS
    }

    fn set_linear_solver(&mut self, solver: LinearSolver) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        if solver.size() != mem.n() {
            return EngineCode::ILL_INPUT;
        }
        // diffsol factors with a dense LU whatever storage the caller asked for.
        debug!("attached {:?} linear solver", solver.kind());
        mem.linear_solver = Some(solver);
        mem.jac = None;
        EngineCode::SUCCESS
    }

    fn set_jacobian_fn(&mut self, jac: Option<JacFn>) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        if mem.linear_solver.is_none() {
            return EngineCode::LMEM_NULL;
        }
        mem.jac = jac;
        EngineCode::SUCCESS
    }

    fn sens_init_staggered(&mut self, rhs: Option<SensRhsFn>, ys0: &[NVector]) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        if ys0.is_empty() || ys0.iter().any(|ys| ys.len() != mem.n()) || mem.trajectory.is_some() {
            return EngineCode::ILL_INPUT;
        }
        let initial: Vec<Vec<f64>> = ys0.iter().map(|ys| ys.as_slice().to_vec()).collect();
        mem.sens = Some(Sensitivities {
            rhs,
            latest: initial.clone(),
            initial,
            ee_tolerances: false,
            error_control: true,
            params: None,
            scaling: Vec::new(),
        });
        debug!(
            "staggered sensitivities enabled for {} parameters ({})",
            ys0.len(),
            if rhs.is_some() { "caller rhs" } else { "difference quotients" }
        );
        EngineCode::SUCCESS
    }

    fn sens_reinit(&mut self, ys0: &[NVector]) -> EngineCode {
        let Some(mem) = self.mem.as_mut() else {
            return EngineCode::NO_MALLOC;
        };
        let n = mem.n();
        let started = mem.trajectory.is_some();
        let Some(sens) = mem.sens.as_mut() else {
            return EngineCode::NO_SENS;
        };
        if ys0.len() != sens.count() || ys0.iter().any(|ys| ys.len() != n) || started {
            return EngineCode::ILL_INPUT;
        }
        sens.initial = ys0.iter().map(|ys| ys.as_slice().to_vec()).collect();
        sens.latest.clone_from(&sens.initial);
        EngineCode::SUCCESS
    }

    fn sens_ee_tolerances(&mut self) -> EngineCode {
        match self.sens_mut() {
            Ok(sens) => {
                sens.ee_tolerances = true;
                EngineCode::SUCCESS
            }
            Err(code) => code,
        }
    }

    fn set_sens_error_control(&mut self, include: bool) -> EngineCode {
        match self.sens_mut() {
            Ok(sens) => {
                sens.error_control = include;
                EngineCode::SUCCESS
            }
            Err(code) => code,
        }
    }

    fn set_sens_params(&mut self, params: SharedParameters, scaling: &[f64]) -> EngineCode {
        let sens = match self.sens_mut() {
            Ok(sens) => sens,
            Err(code) => return code,
        };
        if scaling.len() != sens.count()
            || scaling.iter().any(|s| !(*s > 0.0 && s.is_finite()))
            || params.len() < sens.count()
        {
            return EngineCode::ILL_INPUT;
        }
        sens.params = Some(params);
        sens.scaling = scaling.to_vec();
        EngineCode::SUCCESS
    }

    fn advance(
        &mut self,
        tout: f64,
        yout: &mut NVector,
        task: Task,
        user_data: &dyn Any,
    ) -> (EngineCode, f64) {
        let settings = self.settings;
        let method = self.method;
        let Some(mem) = self.mem.as_mut() else {
            return (EngineCode::NO_MALLOC, tout);
        };
        if yout.len() != mem.n() || !tout.is_finite() {
            return (EngineCode::ILL_INPUT, mem.t_last);
        }
        let Some(atol) = mem.atol.clone() else {
            return (EngineCode::ILL_INPUT, mem.t_last);
        };
        if mem.linear_solver.is_none() {
            return (EngineCode::LINIT_FAIL, mem.t_last);
        }
        if let Some(sens) = &mem.sens {
            if !sens.ee_tolerances || (sens.rhs.is_none() && sens.params.is_none()) {
                return (EngineCode::ILL_INPUT, mem.t_last);
            }
        }
        if mem.trajectory.is_none() {
            if tout == mem.t0 {
                yout.as_mut_slice().copy_from_slice(&mem.y0);
                mem.t_last = tout;
                return (EngineCode::SUCCESS, tout);
            }
            mem.direction = (tout - mem.t0).signum();
        }

        let (code, output) = advance_memory(mem, &settings, method, &atol, tout, task, user_data);
        mem.stats.steps += output.steps;
        mem.stats.rhs_evals += output.counters.rhs;
        mem.stats.jac_evals += output.counters.jacobian;
        mem.stats.sens_rhs_evals += output.counters.sensitivity_rhs;
        mem.stats.step_retries += output.retries;
        mem.stats.max_order_used = mem.stats.max_order_used.max(output.max_order_used);
        mem.nhnil = output.nhnil;
        if output.steps > 0 {
            mem.stats.current_order = output.order;
            mem.stats.last_step = output.h;
            mem.stats.current_time = output.t_internal;
        }
        if !code.is_input_error() {
            mem.current.copy_from_slice(&output.y);
        }
        yout.as_mut_slice().copy_from_slice(&mem.current);
        if code.is_success() {
            mem.t_last = output.t;
            if let Some(sens) = mem.sens.as_mut() {
                if output.sens.len() == sens.count() {
                    sens.latest = output.sens;
                }
            }
        }
        (code, output.t)
    }

    fn get_sens(&self, ys: &mut [NVector]) -> (EngineCode, f64) {
        let Some(mem) = self.mem.as_ref() else {
            return (EngineCode::NO_MALLOC, 0.0);
        };
        let Some(sens) = mem.sens.as_ref() else {
            return (EngineCode::NO_SENS, mem.t_last);
        };
        if ys.len() != sens.count() || ys.iter().any(|v| v.len() != mem.n()) {
            return (EngineCode::BAD_DKY, mem.t_last);
        }
        for (out, latest) in ys.iter_mut().zip(&sens.latest) {
            out.as_mut_slice().copy_from_slice(latest);
        }
        (EngineCode::SUCCESS, mem.t_last)
    }

    fn stats(&self) -> EngineStats {
        self.mem.as_ref().map_or_else(EngineStats::default, |mem| mem.stats)
    }
}
