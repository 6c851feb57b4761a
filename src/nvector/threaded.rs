use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::VectorBackend;

/// Below this length the pool hand-off costs more than the kernel itself.
const MIN_PARALLEL_LEN: usize = 4096;

/// Data-parallel kernels running on a private rayon pool.
pub struct ThreadedBackend {
    pool: ThreadPool,
    threads: usize,
}

impl std::fmt::Debug for ThreadedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedBackend")
            .field("threads", &self.threads)
            .finish()
    }
}

impl ThreadedBackend {
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("odebridge-vec-{i}"))
            .build()?;
        Ok(Self { pool, threads })
    }

    fn run<F>(&self, len: usize, op: F)
    where
        F: FnOnce(bool) + Send,
    {
        if len < MIN_PARALLEL_LEN {
            op(false);
        } else {
            self.pool.install(|| op(true));
        }
    }
}

impl VectorBackend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn threads(&self) -> usize {
        self.threads
    }

    fn fill(&self, c: f64, z: &mut [f64]) {
        self.run(z.len(), |parallel| {
            if parallel {
                z.par_iter_mut().for_each(|zi| *zi = c);
            } else {
                z.iter_mut().for_each(|zi| *zi = c);
            }
        });
    }

    fn scale(&self, c: f64, z: &mut [f64]) {
        self.run(z.len(), |parallel| {
            if parallel {
                z.par_iter_mut().for_each(|zi| *zi *= c);
            } else {
                z.iter_mut().for_each(|zi| *zi *= c);
            }
        });
    }

    fn axpy(&self, a: f64, x: &[f64], y: &mut [f64]) {
        self.run(y.len(), |parallel| {
            if parallel {
                y.par_iter_mut()
                    .zip(x.par_iter())
                    .for_each(|(yi, xi)| *yi += a * xi);
            } else {
                y.iter_mut().zip(x).for_each(|(yi, xi)| *yi += a * xi);
            }
        });
    }

    fn linear_sum(&self, a: f64, x: &[f64], b: f64, y: &[f64], z: &mut [f64]) {
        self.run(z.len(), |parallel| {
            if parallel {
                z.par_iter_mut()
                    .zip(x.par_iter().zip(y.par_iter()))
                    .for_each(|(zi, (xi, yi))| *zi = a * xi + b * yi);
            } else {
                z.iter_mut()
                    .zip(x.iter().zip(y))
                    .for_each(|(zi, (xi, yi))| *zi = a * xi + b * yi);
            }
        });
    }

    fn wrms_norm(&self, x: &[f64], w: &[f64]) -> f64 {
        if x.is_empty() {
            return 0.0;
        }
        let mut sum = 0.0;
        self.run(x.len(), |parallel| {
            sum = if parallel {
                x.par_iter()
                    .zip(w.par_iter())
                    .map(|(xi, wi)| (xi * wi).powi(2))
                    .sum()
            } else {
                x.iter().zip(w).map(|(xi, wi)| (xi * wi).powi(2)).sum()
            };
        });
        (sum / x.len() as f64).sqrt()
    }

    fn error_weights(&self, rtol: f64, atol: &[f64], y: &[f64], w: &mut [f64]) -> bool {
        let weight = |(wi, (ai, yi)): (&mut f64, (&f64, &f64))| {
            let denom = rtol * yi.abs() + ai;
            if denom <= 0.0 {
                *wi = 0.0;
                false
            } else {
                *wi = 1.0 / denom;
                true
            }
        };
        let mut valid = true;
        self.run(w.len(), |parallel| {
            valid = if parallel {
                w.par_iter_mut()
                    .zip(atol.par_iter().zip(y.par_iter()))
                    .map(weight)
                    .reduce(|| true, |a, b| a && b)
            } else {
                w.iter_mut()
                    .zip(atol.iter().zip(y))
                    .map(weight)
                    .fold(true, |a, b| a && b)
            };
        });
        valid
    }
}
