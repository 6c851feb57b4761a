use thiserror::Error;

use crate::engine::EngineCode;

pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("{origin}: {message}")]
    Configuration {
        origin: &'static str,
        message: String,
    },
    #[error("{origin}: {message} (engine code {code})")]
    Engine {
        origin: &'static str,
        code: EngineCode,
        message: String,
    },
    #[error("unknown solver option passed: {0}")]
    UnknownOption(String),
    #[error("invalid value {value} for solver option {name}")]
    InvalidOption { name: &'static str, value: f64 },
    #[error("solver was not initialized")]
    NotInitialized,
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("cannot build vector thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SolverError {
    pub(crate) fn config(origin: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            origin,
            message: message.into(),
        }
    }

    pub(crate) fn engine(origin: &'static str, code: EngineCode, message: impl Into<String>) -> Self {
        Self::Engine {
            origin,
            code,
            message: message.into(),
        }
    }

    /// `Ok` only for [`EngineCode::SUCCESS`].
    pub(crate) fn check(code: EngineCode, origin: &'static str, message: &str) -> SolverResult<()> {
        if code == EngineCode::SUCCESS {
            Ok(())
        } else {
            Err(Self::engine(origin, code, message))
        }
    }

    /// Every variant except [`SolverError::NotInitialized`] and
    /// [`SolverError::Shape`] belongs to the configuration class.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::NotInitialized | Self::Shape(_))
    }
}
