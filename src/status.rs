//! Translation of engine status codes into the caller-facing taxonomy.

use std::fmt;

use crate::engine::EngineCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Ok,
    IllegalInput,
    TooMuchWork,
    TooMuchAccuracy,
    ErrorTestFailure,
    ConvergenceFailure,
    Failure,
}

impl StatusKind {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::IllegalInput => "illegal input",
            Self::TooMuchWork => "too much work",
            Self::TooMuchAccuracy => "too much accuracy requested",
            Self::ErrorTestFailure => "repeated error test failures",
            Self::ConvergenceFailure => "convergence failure",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Total over the code space; anything without a dedicated kind is
/// [`StatusKind::Failure`].
pub fn classify(code: EngineCode) -> StatusKind {
    match code {
        EngineCode::SUCCESS
        | EngineCode::TSTOP_RETURN
        | EngineCode::ROOT_RETURN
        | EngineCode::WARNING => StatusKind::Ok,
        EngineCode::ILL_INPUT => StatusKind::IllegalInput,
        EngineCode::TOO_MUCH_WORK => StatusKind::TooMuchWork,
        EngineCode::TOO_MUCH_ACC => StatusKind::TooMuchAccuracy,
        EngineCode::ERR_FAILURE => StatusKind::ErrorTestFailure,
        EngineCode::CONV_FAILURE => StatusKind::ConvergenceFailure,
        _ => StatusKind::Failure,
    }
}

/// Human-readable description of `code`. `max_steps` is the configured step
/// limit, quoted in the too-much-work message.
pub fn describe(code: EngineCode, max_steps: usize) -> String {
    let text = match code {
        EngineCode::SUCCESS => "the engine succeeded and no roots were found",
        EngineCode::TOO_MUCH_WORK => {
            return format!(
                "the solver took {max_steps} internal steps but could not reach the output time ({})",
                code.name()
            )
        }
        EngineCode::TSTOP_RETURN => "the engine succeeded by reaching the stopping point",
        EngineCode::ROOT_RETURN => "the engine succeeded and found one or more roots",
        EngineCode::WARNING => "the engine succeeded but issued a warning",
        EngineCode::MEM_NULL => "the engine memory was missing",
        EngineCode::MEM_FAIL => "the engine could not allocate memory",
        EngineCode::NO_MALLOC => "the engine memory was not allocated by a call to init",
        EngineCode::ILL_INPUT => {
            "one of the inputs to the engine was illegal or missing: tolerances not set, \
             a component of the error weight vector became zero during internal time-stepping, \
             or the linear solver was not attached"
        }
        EngineCode::TOO_CLOSE => {
            "the initial time and the output time are too close to each other and no initial step size was given"
        }
        EngineCode::TOO_MUCH_ACC => {
            "the solver could not satisfy the accuracy demanded for some internal step"
        }
        EngineCode::ERR_FAILURE => {
            "error test failures occurred too many times during one internal step, or with |h| = hmin"
        }
        EngineCode::CONV_FAILURE => {
            "convergence test failures occurred too many times during one internal step, or with |h| = hmin"
        }
        EngineCode::LINIT_FAIL => "the linear solver's initialization failed",
        EngineCode::LSETUP_FAIL => "the linear solver's setup failed in an unrecoverable manner",
        EngineCode::LSOLVE_FAIL => "the linear solver's solve failed in an unrecoverable manner",
        EngineCode::LMEM_NULL => "no linear solver is attached",
        EngineCode::RHSFUNC_FAIL => "the right-hand side function failed in an unrecoverable manner",
        EngineCode::FIRST_RHSFUNC_ERR => {
            "the right-hand side function had a recoverable error at the first call"
        }
        EngineCode::REPTD_RHSFUNC_ERR => {
            "convergence test failures occurred too many times due to repeated recoverable errors \
             in the right-hand side function"
        }
        EngineCode::UNREC_RHSFUNC_ERR => {
            "the right-hand side function had a recoverable error after an error test failure at order one, \
             and no recovery was possible"
        }
        EngineCode::RTFUNC_FAIL => "the rootfinding function failed",
        EngineCode::BAD_K | EngineCode::BAD_DKY => "an interpolation request was invalid",
        EngineCode::BAD_T => "the requested time lies outside the last internal step",
        EngineCode::NO_SENS => "sensitivities were requested but never initialized",
        EngineCode::SRHSFUNC_FAIL => {
            "the sensitivity right-hand side function failed in an unrecoverable manner"
        }
        EngineCode::FIRST_SRHSFUNC_ERR => {
            "the sensitivity right-hand side function had a recoverable error at the first call"
        }
        EngineCode::REPTD_SRHSFUNC_ERR => {
            "convergence test failures occurred too many times due to repeated recoverable errors \
             in the sensitivity right-hand side function"
        }
        EngineCode::UNREC_SRHSFUNC_ERR => {
            "the sensitivity right-hand side function had a recoverable error and no recovery was possible"
        }
        _ => return format!("unknown error ({})", code.0),
    };
    format!("{text} ({})", code.name())
}

/// Engine status together with its classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SolverStatus {
    pub code: EngineCode,
    pub kind: StatusKind,
}

impl SolverStatus {
    pub fn from_code(code: EngineCode) -> Self {
        Self {
            code,
            kind: classify(code),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind.is_ok()
    }
}

impl From<EngineCode> for SolverStatus {
    fn from(code: EngineCode) -> Self {
        Self::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_returns_are_ok() {
        for code in [EngineCode::SUCCESS, EngineCode::TSTOP_RETURN, EngineCode::ROOT_RETURN] {
            assert_eq!(classify(code), StatusKind::Ok);
        }
    }

    #[test]
    fn warning_is_a_successful_return() {
        assert!(EngineCode::WARNING.is_success());
        assert_eq!(classify(EngineCode::WARNING), StatusKind::Ok);
        assert!(SolverStatus::from(EngineCode::WARNING).is_ok());
    }

    #[test]
    fn dedicated_kinds() {
        assert_eq!(classify(EngineCode::ILL_INPUT), StatusKind::IllegalInput);
        assert_eq!(classify(EngineCode::TOO_MUCH_WORK), StatusKind::TooMuchWork);
        assert_eq!(classify(EngineCode::TOO_MUCH_ACC), StatusKind::TooMuchAccuracy);
        assert_eq!(classify(EngineCode::ERR_FAILURE), StatusKind::ErrorTestFailure);
        assert_eq!(classify(EngineCode::CONV_FAILURE), StatusKind::ConvergenceFailure);
    }

    #[test]
    fn everything_else_is_a_generic_failure() {
        for code in [
            EngineCode::RHSFUNC_FAIL,
            EngineCode::LSETUP_FAIL,
            EngineCode::REPTD_SRHSFUNC_ERR,
            EngineCode(-999),
            EngineCode(12345),
        ] {
            assert_eq!(classify(code), StatusKind::Failure);
        }
    }

    #[test]
    fn too_much_work_quotes_the_step_limit() {
        let msg = describe(EngineCode::TOO_MUCH_WORK, 250);
        assert!(msg.contains("250 internal steps"));
        assert!(msg.ends_with("(TOO_MUCH_WORK)"));
    }

    #[test]
    fn unknown_codes_are_described() {
        assert_eq!(describe(EngineCode(-999), 10), "unknown error (-999)");
        assert!(describe(EngineCode::FIRST_RHSFUNC_ERR, 10).contains("first call"));
    }
}
