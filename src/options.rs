//! Solver options: typed configuration plus the string-keyed setter used by
//! option files.

use std::num::NonZeroUsize;

use crate::error::{SolverError, SolverResult};

pub use crate::engine::MethodFamily;

/// Highest order accepted by the `MaxOrd` option.
pub const MAX_ORDER_LIMIT: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct SolverOptions {
    method: MethodFamily,
    max_order: usize,
    max_steps: usize,
    max_hnil_warnings: i32,
    threads: Option<NonZeroUsize>,
    initial_step: f64,
    min_step: f64,
    max_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: MethodFamily::Bdf,
            max_order: MAX_ORDER_LIMIT,
            max_steps: 100_000,
            max_hnil_warnings: 10,
            threads: None,
            initial_step: 0.0,
            min_step: 0.0,
            max_step: 60.0,
        }
    }
}

impl SolverOptions {
    pub fn with_method(mut self, method: MethodFamily) -> Self {
        self.method = method;
        self
    }

    pub fn with_max_order(mut self, max_order: usize) -> SolverResult<Self> {
        if !(1..=MAX_ORDER_LIMIT).contains(&max_order) {
            return Err(SolverError::InvalidOption {
                name: "MaxOrd",
                value: max_order as f64,
            });
        }
        self.max_order = max_order;
        Ok(self)
    }

    /// `0` removes the limit.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_hnil_warnings(mut self, max_warnings: i32) -> Self {
        self.max_hnil_warnings = max_warnings;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> SolverResult<Self> {
        self.threads = Some(NonZeroUsize::new(threads).ok_or(SolverError::InvalidOption {
            name: "NumberOfThreads",
            value: threads as f64,
        })?);
        Ok(self)
    }

    pub fn with_initial_step(mut self, h0: f64) -> Self {
        self.initial_step = h0;
        self
    }

    pub fn with_min_step(mut self, h_min: f64) -> Self {
        self.min_step = h_min;
        self
    }

    pub fn with_max_step(mut self, h_max: f64) -> Self {
        self.max_step = h_max;
        self
    }

    pub fn method(&self) -> MethodFamily {
        self.method
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn max_hnil_warnings(&self) -> i32 {
        self.max_hnil_warnings
    }

    pub fn initial_step(&self) -> f64 {
        self.initial_step
    }

    pub fn min_step(&self) -> f64 {
        self.min_step
    }

    pub fn max_step(&self) -> f64 {
        self.max_step
    }

    /// Configured thread count, or hardware parallelism minus one (at least 1).
    pub fn threads(&self) -> usize {
        self.threads.map_or_else(default_threads, NonZeroUsize::get)
    }

    /// Sets an option by name (case-insensitive). Integer options truncate
    /// `value` towards zero.
    pub fn set(&mut self, name: &str, value: f64) -> SolverResult<()> {
        let truncated = value as i64;
        match name.to_ascii_uppercase().as_str() {
            "LMM" => {
                self.method = match truncated {
                    0 => MethodFamily::Adams,
                    1 => MethodFamily::Bdf,
                    _ => return Err(SolverError::InvalidOption { name: "LMM", value }),
                };
            }
            // Iteration type is always Newton; kept so old option sets still load.
            "ITER" => {}
            "MAXORD" => {
                if !(1..=MAX_ORDER_LIMIT as i64).contains(&truncated) {
                    return Err(SolverError::InvalidOption { name: "MaxOrd", value });
                }
                self.max_order = truncated as usize;
            }
            "MXHNIL" => self.max_hnil_warnings = truncated.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            "NUMBEROFTHREADS" => {
                if truncated < 1 {
                    return Err(SolverError::InvalidOption {
                        name: "NumberOfThreads",
                        value,
                    });
                }
                self.threads = NonZeroUsize::new(truncated as usize);
            }
            "MXSTEP" => {
                if truncated < 0 {
                    return Err(SolverError::InvalidOption { name: "MxStep", value });
                }
                self.max_steps = truncated as usize;
            }
            "H0" => self.initial_step = value,
            "HMIN" => self.min_step = value,
            "HMAX" => self.max_step = value,
            _ => return Err(SolverError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Descriptor of a list-valued option, for display purposes.
#[derive(Clone, Debug, PartialEq)]
pub struct OptionInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub default_value: f64,
    pub values: Vec<(f64, &'static str)>,
}

pub fn solver_options_info() -> Vec<OptionInfo> {
    vec![OptionInfo {
        name: "LMM",
        description: "Linear multistep method",
        default_value: 1.0,
        values: vec![(1.0, "BDF"), (0.0, "ADAMS")],
    }]
}
