use super::VectorBackend;

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl VectorBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn threads(&self) -> usize {
        1
    }

    fn fill(&self, c: f64, z: &mut [f64]) {
        z.iter_mut().for_each(|zi| *zi = c);
    }

    fn scale(&self, c: f64, z: &mut [f64]) {
        z.iter_mut().for_each(|zi| *zi *= c);
    }

    fn axpy(&self, a: f64, x: &[f64], y: &mut [f64]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi += a * xi;
        }
    }

    fn linear_sum(&self, a: f64, x: &[f64], b: f64, y: &[f64], z: &mut [f64]) {
        for ((zi, xi), yi) in z.iter_mut().zip(x).zip(y) {
            *zi = a * xi + b * yi;
        }
    }

    fn wrms_norm(&self, x: &[f64], w: &[f64]) -> f64 {
        if x.is_empty() {
            return 0.0;
        }
        let sum: f64 = x.iter().zip(w).map(|(xi, wi)| (xi * wi).powi(2)).sum();
        (sum / x.len() as f64).sqrt()
    }

    fn error_weights(&self, rtol: f64, atol: &[f64], y: &[f64], w: &mut [f64]) -> bool {
        let mut valid = true;
        for ((wi, ai), yi) in w.iter_mut().zip(atol).zip(y) {
            let denom = rtol * yi.abs() + ai;
            if denom <= 0.0 {
                valid = false;
                *wi = 0.0;
            } else {
                *wi = 1.0 / denom;
            }
        }
        valid
    }
}
