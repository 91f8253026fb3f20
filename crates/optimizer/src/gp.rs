//! Gaussian-process surrogate with an RBF kernel, used to propose the next
//! trial point via expected improvement.
//!
//! Hyperparameters are fixed rather than fitted: with the few dozen
//! observations a tuning run produces, marginal-likelihood optimization
//! adds more variance than it removes.

use crate::space::DIM;

const LENGTH_SCALE: f64 = 0.2;
const SIGNAL_VARIANCE: f64 = 1.0;
const NOISE: f64 = 1e-6;

fn kernel(a: &[f64; DIM], b: &[f64; DIM]) -> f64 {
    let mut sq = 0.0;
    for i in 0..DIM {
        let d = a[i] - b[i];
        sq += d * d;
    }
    SIGNAL_VARIANCE * (-sq / (2.0 * LENGTH_SCALE * LENGTH_SCALE)).exp()
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite
/// matrix, with escalating diagonal jitter on near-singular input.
fn cholesky(matrix: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut jitter = 0.0;
    for _ in 0..8 {
        let mut l = vec![vec![0.0; n]; n];
        let mut ok = true;
        'outer: for i in 0..n {
            for j in 0..=i {
                let mut sum = matrix[i][j];
                if i == j {
                    sum += jitter;
                }
                for k in 0..j {
                    sum -= l[i][k] * l[j][k];
                }
                if i == j {
                    if sum <= 0.0 {
                        ok = false;
                        break 'outer;
                    }
                    l[i][j] = sum.sqrt();
                } else {
                    l[i][j] = sum / l[j][j];
                }
            }
        }
        if ok {
            return Some(l);
        }
        jitter = if jitter == 0.0 { 1e-10 } else { jitter * 10.0 };
    }
    None
}

fn solve_lower(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i][j] * x[j];
        }
        x[i] = sum / l[i][i];
    }
    x
}

fn solve_upper_from_lower(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in i + 1..n {
            sum -= l[j][i] * x[j];
        }
        x[i] = sum / l[i][i];
    }
    x
}

/// Abramowitz-Stegun erf approximation, good to ~1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

pub fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Fitted surrogate over standardized observations.
pub struct GaussianProcess {
    x: Vec<[f64; DIM]>,
    chol: Vec<Vec<f64>>,
    alpha: Vec<f64>,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    /// Fit on observed points. Returns `None` when the kernel matrix
    /// cannot be factorized even with jitter.
    pub fn fit(x: Vec<[f64; DIM]>, y: &[f64]) -> Option<Self> {
        assert_eq!(x.len(), y.len());
        let n = x.len();
        if n == 0 {
            return None;
        }

        let y_mean = y.iter().sum::<f64>() / n as f64;
        let var = y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / n as f64;
        let y_std = var.sqrt().max(1e-12);
        let y_scaled: Vec<f64> = y.iter().map(|v| (v - y_mean) / y_std).collect();

        let mut k = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..=i {
                let v = kernel(&x[i], &x[j]);
                k[i][j] = v;
                k[j][i] = v;
            }
            k[i][i] += NOISE;
        }

        let chol = cholesky(&k)?;
        let tmp = solve_lower(&chol, &y_scaled);
        let alpha = solve_upper_from_lower(&chol, &tmp);

        Some(Self {
            x,
            chol,
            alpha,
            y_mean,
            y_std,
        })
    }

    /// Posterior mean and standard deviation at one point, in the
    /// original objective units.
    pub fn predict(&self, point: &[f64; DIM]) -> (f64, f64) {
        let k_star: Vec<f64> = self.x.iter().map(|xi| kernel(xi, point)).collect();

        let mean_scaled: f64 = k_star
            .iter()
            .zip(self.alpha.iter())
            .map(|(k, a)| k * a)
            .sum();

        let v = solve_lower(&self.chol, &k_star);
        let explained: f64 = v.iter().map(|vi| vi * vi).sum();
        let var_scaled = (kernel(point, point) - explained).max(0.0);

        (
            mean_scaled * self.y_std + self.y_mean,
            var_scaled.sqrt() * self.y_std,
        )
    }

    /// Expected improvement over `best` for maximization.
    pub fn expected_improvement(&self, point: &[f64; DIM], best: f64, xi: f64) -> f64 {
        let (mean, std) = self.predict(point);
        if std <= 1e-12 {
            return 0.0;
        }
        let z = (mean - best - xi) / std;
        (mean - best - xi) * normal_cdf(z) + std * normal_pdf(z)
    }
}
