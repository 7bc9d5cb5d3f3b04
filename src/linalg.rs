//! Complex linear-algebra helpers shared by the converter and the solver.
//!
//! The decompositions themselves come from `nalgebra`; this module adds the
//! singularity checks (tolerance scaled to the infinity norm of the matrix)
//! and the natural cubic spline used to evaluate vector parameters and to
//! interpolate error terms between calibration frequencies.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::error::GridError;

/// Infinity norm (maximum absolute row sum) of a complex matrix.
pub(crate) fn inf_norm(m: &DMatrix<Complex64>) -> f64 {
    (0..m.nrows())
        .map(|i| (0..m.ncols()).map(|j| m[(i, j)].norm()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Check whether a determinant is negligible for a matrix of the given
/// infinity norm and size.
pub(crate) fn is_singular(det: Complex64, norm: f64, n: usize) -> bool {
    if norm == 0.0 {
        return true;
    }
    det.norm() <= 16.0 * f64::EPSILON * norm.powi(n as i32)
}

/// Invert a square matrix, reporting singularity instead of returning garbage.
pub(crate) fn checked_inverse(m: &DMatrix<Complex64>) -> Option<DMatrix<Complex64>> {
    let norm = inf_norm(m);
    let lu = m.clone().lu();
    if is_singular(lu.determinant(), norm, m.nrows()) {
        return None;
    }
    lu.try_inverse()
}

/// Solve the square system `A * X = B`.
pub(crate) fn solve_square(a: &DMatrix<Complex64>, b: &DMatrix<Complex64>) -> Option<DMatrix<Complex64>> {
    let norm = inf_norm(a);
    let lu = a.clone().lu();
    if is_singular(lu.determinant(), norm, a.nrows()) {
        return None;
    }
    lu.solve(b)
}

/// Determinant of a square matrix.
#[allow(dead_code)]
pub(crate) fn determinant(m: &DMatrix<Complex64>) -> Complex64 {
    m.clone().lu().determinant()
}

/// Outcome of a least-squares solve.
pub(crate) enum LstsqOutcome {
    Solution { x: DVector<Complex64>, residual_rms: f64 },
    /// The system does not determine all columns. The indices are the columns
    /// that participate in the numerical null space.
    RankDeficient { columns: Vec<usize> },
}

/// Solve `A * x = b` in the least-squares sense via Householder QR, `A` being
/// `m x n` with `m >= n`. Rank deficiency is detected from the singular-value
/// spectrum so that the caller can report which error terms were left
/// undetermined.
pub(crate) fn least_squares(a: &DMatrix<Complex64>, b: &DVector<Complex64>) -> LstsqOutcome {
    let n = a.ncols();
    if a.nrows() < n {
        return LstsqOutcome::RankDeficient {
            columns: (0..n).collect(),
        };
    }
    let svd = a.clone().svd(false, true);
    let sigma_max = svd.singular_values.max();
    let eps = f64::EPSILON * a.nrows().max(n) as f64 * sigma_max.max(f64::MIN_POSITIVE);
    let deficient: Vec<usize> = (0..svd.singular_values.len())
        .filter(|&k| svd.singular_values[k] <= eps * 1.0e3)
        .collect();
    if !deficient.is_empty() {
        // Identify the terms spanned by the null-space vectors.
        let mut columns: Vec<usize> = vec![];
        if let Some(v_t) = svd.v_t.as_ref() {
            for &k in &deficient {
                for j in 0..n {
                    if v_t[(k, j)].norm() > 1.0e-6 && !columns.contains(&j) {
                        columns.push(j);
                    }
                }
            }
        }
        columns.sort_unstable();
        return LstsqOutcome::RankDeficient { columns };
    }

    let qr = a.clone().qr();
    let rhs = qr.q().adjoint() * b;
    let r = qr.r();
    match r.solve_upper_triangular(&rhs) {
        Some(x) => {
            let residual = a * &x - b;
            let rms = (residual.iter().map(|v| v.norm_sqr()).sum::<f64>() / a.nrows() as f64).sqrt();
            LstsqOutcome::Solution { x, residual_rms: rms }
        }
        None => LstsqOutcome::RankDeficient {
            columns: (0..n).collect(),
        },
    }
}

/// Natural cubic spline through `(x_i, y_i)` with strictly increasing knots.
/// Evaluation outside the knot range clamps to the boundary value; the
/// clamped flag lets callers surface the extrapolation.
#[derive(Debug, Clone)]
pub struct Spline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots (zero at both ends).
    m: Vec<f64>,
}

impl Spline {
    /// Build the spline. One knot yields a constant, two a straight line.
    pub fn new(x: &[f64], y: &[f64]) -> Result<Self, GridError> {
        if x.len() != y.len() {
            return Err(GridError::MismatchedLength(x.len(), y.len()));
        }
        crate::util::check_frequency_vector(x)?;
        let n = x.len();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Thomas algorithm on the tridiagonal system for the interior
            // second derivatives.
            let mut diag = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                diag[i] = 2.0 * (h0 + h1);
                rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
            }
            for i in 2..n - 1 {
                let h = x[i] - x[i - 1];
                let w = h / diag[i - 1];
                diag[i] -= w * h;
                rhs[i] -= w * rhs[i - 1];
            }
            for i in (1..n - 1).rev() {
                let h = x[i + 1] - x[i];
                let upper = if i + 1 < n - 1 { h * m[i + 1] } else { 0.0 };
                m[i] = (rhs[i] - upper) / diag[i];
            }
        }
        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    /// Evaluate at `x`, clamping outside the knot range. The second element
    /// reports whether clamping occurred.
    pub fn eval_checked(&self, x: f64) -> (f64, bool) {
        let n = self.x.len();
        if x <= self.x[0] {
            return (self.y[0], x < self.x[0]);
        }
        if x >= self.x[n - 1] {
            return (self.y[n - 1], x > self.x[n - 1]);
        }
        let i = match self.x.binary_search_by(|v| v.partial_cmp(&x).unwrap()) {
            Ok(i) => return (self.y[i], false),
            Err(i) => i - 1,
        };
        let h = self.x[i + 1] - self.x[i];
        let t = x - self.x[i];
        let value = self.y[i]
            + t * ((self.y[i + 1] - self.y[i]) / h - h / 6.0 * (2.0 * self.m[i] + self.m[i + 1]))
            + t * t * self.m[i] / 2.0
            + t * t * t * (self.m[i + 1] - self.m[i]) / (6.0 * h);
        (value, false)
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.eval_checked(x).0
    }
}

/// A complex-valued spline interpolating real and imaginary parts separately.
#[derive(Debug, Clone)]
pub struct ComplexSpline {
    re: Spline,
    im: Spline,
}

impl ComplexSpline {
    pub fn new(x: &[f64], values: &[Complex64]) -> Result<Self, GridError> {
        let re: Vec<f64> = values.iter().map(|v| v.re).collect();
        let im: Vec<f64> = values.iter().map(|v| v.im).collect();
        Ok(Self {
            re: Spline::new(x, &re)?,
            im: Spline::new(x, &im)?,
        })
    }

    pub fn eval_checked(&self, x: f64) -> (Complex64, bool) {
        let (re, clamped) = self.re.eval_checked(x);
        let (im, _) = self.im.eval_checked(x);
        (Complex64::new(re, im), clamped)
    }

    pub fn eval(&self, x: f64) -> Complex64 {
        self.eval_checked(x).0
    }
}
