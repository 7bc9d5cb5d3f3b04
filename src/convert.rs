//! Closed-form conversions between network-parameter representations.
//!
//! All conversions are pure per-frequency matrix functions under a complex
//! reference-impedance vector (power-wave convention). With per-port
//! reference `z_i`, `k_i = sqrt(|Re z_i|)` and `Fd_i = k_i / (2 Re z_i)`,
//! the incident and reflected waves are
//!
//! ```text
//! a = Fd (V + Z0 I)        b = Fd (V - Z0* I)
//! ```
//!
//! which gives the matrix forms used below:
//!
//! ```text
//! S = Fd (Z - Z0*) (Z + Z0)^-1 Fd^-1
//! Z = (Fd - S Fd)^-1 (S Fd Z0 + Fd Z0*)
//! ```
//!
//! and their admittance duals. The transfer (T, U) and the classical
//! two-port (H, G, A, B) forms are defined for 2x2 matrices only.

use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::error::ConversionError;
use crate::linalg;

/// A network-parameter representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    /// Scattering parameters (power waves).
    S,
    /// Scattering-transfer parameters, port 1 referred (2x2 only).
    T,
    /// Scattering-transfer parameters, port 2 referred (2x2 only).
    U,
    /// Impedance parameters.
    Z,
    /// Admittance parameters.
    Y,
    /// Hybrid parameters (2x2 only).
    H,
    /// Inverse-hybrid parameters (2x2 only).
    G,
    /// Chain (ABCD) parameters (2x2 only).
    A,
    /// Reverse-chain parameters (2x2 only).
    B,
    /// Per-port input impedances (row vector).
    Zin,
}

impl ParameterType {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterType::S => "S",
            ParameterType::T => "T",
            ParameterType::U => "U",
            ParameterType::Z => "Z",
            ParameterType::Y => "Y",
            ParameterType::H => "H",
            ParameterType::G => "G",
            ParameterType::A => "A",
            ParameterType::B => "B",
            ParameterType::Zin => "Zin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "S" => Some(ParameterType::S),
            "T" => Some(ParameterType::T),
            "U" => Some(ParameterType::U),
            "Z" => Some(ParameterType::Z),
            "Y" => Some(ParameterType::Y),
            "H" => Some(ParameterType::H),
            "G" => Some(ParameterType::G),
            "A" => Some(ParameterType::A),
            "B" => Some(ParameterType::B),
            "ZIN" => Some(ParameterType::Zin),
            _ => None,
        }
    }

    /// Whether the representation is only defined for two-ports.
    pub fn two_port_only(&self) -> bool {
        matches!(
            self,
            ParameterType::T | ParameterType::U | ParameterType::H | ParameterType::G | ParameterType::A | ParameterType::B
        )
    }

    /// Whether the representation lives in the wave domain (needs z0 to
    /// reach the immittance domain).
    fn wave_domain(&self) -> bool {
        matches!(self, ParameterType::S | ParameterType::T | ParameterType::U)
    }

    fn immittance_domain(&self) -> bool {
        matches!(
            self,
            ParameterType::Z | ParameterType::Y | ParameterType::H | ParameterType::G | ParameterType::A | ParameterType::B
        )
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn check_z0(z0: &[Complex64], ports: usize) -> Result<(), ConversionError> {
    if z0.len() != ports {
        return Err(ConversionError::MismatchedPorts(ports, z0.len()));
    }
    for (i, z) in z0.iter().enumerate() {
        if z.re == 0.0 {
            return Err(ConversionError::BadReferenceImpedance(i + 1));
        }
    }
    Ok(())
}

fn check_two_port(m: &DMatrix<Complex64>, t: ParameterType) -> Result<(), ConversionError> {
    if m.nrows() != 2 || m.ncols() != 2 {
        return Err(ConversionError::NotTwoPort(t.name().to_string(), m.nrows(), m.ncols()));
    }
    Ok(())
}

fn check_square(m: &DMatrix<Complex64>, t: ParameterType) -> Result<(), ConversionError> {
    if m.nrows() != m.ncols() {
        return Err(ConversionError::NotSquare(t.name().to_string(), m.nrows(), m.ncols()));
    }
    Ok(())
}

/// Normalisation factors `Fd_i = k_i / (2 Re z_i)`.
fn wave_factors(z0: &[Complex64]) -> Vec<Complex64> {
    z0.iter()
        .map(|z| Complex64::new(z.re.abs().sqrt() / (2.0 * z.re), 0.0))
        .collect()
}

fn diagonal(values: &[Complex64]) -> DMatrix<Complex64> {
    let n = values.len();
    DMatrix::from_fn(n, n, |i, j| if i == j { values[i] } else { Complex64::new(0.0, 0.0) })
}

fn singular(from: ParameterType, to: ParameterType) -> ConversionError {
    ConversionError::Singular(from.name().to_string(), to.name().to_string())
}

/// Z = (Fd - S Fd)^-1 (S Fd Z0 + Fd Z0*)
fn s_to_z(s: &DMatrix<Complex64>, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    let fd = wave_factors(z0);
    let fdm = diagonal(&fd);
    let fd_z0: Vec<Complex64> = fd.iter().zip(z0).map(|(f, z)| f * z).collect();
    let fd_z0c: Vec<Complex64> = fd.iter().zip(z0).map(|(f, z)| f * z.conj()).collect();
    let lhs = &fdm - s * &fdm;
    let rhs = s * diagonal(&fd_z0) + diagonal(&fd_z0c);
    linalg::solve_square(&lhs, &rhs).ok_or_else(|| singular(ParameterType::S, ParameterType::Z))
}

/// S = Fd (Z - Z0*) (Z + Z0)^-1 Fd^-1
fn z_to_s(z: &DMatrix<Complex64>, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    let fd = wave_factors(z0);
    let fdm = diagonal(&fd);
    let fd_inv = diagonal(&fd.iter().map(|&f| 1.0 / f).collect::<Vec<_>>());
    let z0_diag = diagonal(z0);
    let z0c_diag = diagonal(&z0.iter().map(|v| v.conj()).collect::<Vec<_>>());
    let denom = z + &z0_diag;
    let inv = linalg::checked_inverse(&denom).ok_or_else(|| singular(ParameterType::Z, ParameterType::S))?;
    Ok(&fdm * (z - &z0c_diag) * inv * fd_inv)
}

/// Y = (S Fd Z0 + Fd Z0*)^-1 (Fd - S Fd)
fn s_to_y(s: &DMatrix<Complex64>, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    let fd = wave_factors(z0);
    let fdm = diagonal(&fd);
    let fd_z0: Vec<Complex64> = fd.iter().zip(z0).map(|(f, z)| f * z).collect();
    let fd_z0c: Vec<Complex64> = fd.iter().zip(z0).map(|(f, z)| f * z.conj()).collect();
    let lhs = s * diagonal(&fd_z0) + diagonal(&fd_z0c);
    let rhs = &fdm - s * &fdm;
    linalg::solve_square(&lhs, &rhs).ok_or_else(|| singular(ParameterType::S, ParameterType::Y))
}

/// S = Fd (I - Z0* Y) (I + Z0 Y)^-1 Fd^-1
fn y_to_s(y: &DMatrix<Complex64>, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    let n = y.nrows();
    let fd = wave_factors(z0);
    let fdm = diagonal(&fd);
    let fd_inv = diagonal(&fd.iter().map(|&f| 1.0 / f).collect::<Vec<_>>());
    let z0_diag = diagonal(z0);
    let z0c_diag = diagonal(&z0.iter().map(|v| v.conj()).collect::<Vec<_>>());
    let identity = DMatrix::identity(n, n);
    let denom = &identity + &z0_diag * y;
    let inv = linalg::checked_inverse(&denom).ok_or_else(|| singular(ParameterType::Y, ParameterType::S))?;
    Ok(&fdm * (&identity - &z0c_diag * y) * inv * fd_inv)
}

/// Guard for the scalar denominators of the 2x2 closed forms.
fn check_denominator(den: Complex64, m: &DMatrix<Complex64>, from: ParameterType, to: ParameterType) -> Result<(), ConversionError> {
    let norm = linalg::inf_norm(m);
    if norm == 0.0 || den.norm() <= 16.0 * f64::EPSILON * norm {
        return Err(singular(from, to));
    }
    Ok(())
}

fn two_port(m11: Complex64, m12: Complex64, m21: Complex64, m22: Complex64) -> DMatrix<Complex64> {
    DMatrix::from_row_slice(2, 2, &[m11, m12, m21, m22])
}

/// T maps (a2, b2) to (b1, a1).
fn s_to_t(s: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = s[(0, 0)] * s[(1, 1)] - s[(0, 1)] * s[(1, 0)];
    check_denominator(s[(1, 0)], s, ParameterType::S, ParameterType::T)?;
    Ok(two_port(-det / s[(1, 0)], s[(0, 0)] / s[(1, 0)], -s[(1, 1)] / s[(1, 0)], 1.0 / s[(1, 0)]))
}

fn t_to_s(t: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = t[(0, 0)] * t[(1, 1)] - t[(0, 1)] * t[(1, 0)];
    check_denominator(t[(1, 1)], t, ParameterType::T, ParameterType::S)?;
    Ok(two_port(t[(0, 1)] / t[(1, 1)], det / t[(1, 1)], 1.0 / t[(1, 1)], -t[(1, 0)] / t[(1, 1)]))
}

/// U is the port-2 referred dual of T.
fn s_to_u(s: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = s[(0, 0)] * s[(1, 1)] - s[(0, 1)] * s[(1, 0)];
    check_denominator(s[(0, 1)], s, ParameterType::S, ParameterType::U)?;
    Ok(two_port(-det / s[(0, 1)], s[(1, 1)] / s[(0, 1)], -s[(0, 0)] / s[(0, 1)], 1.0 / s[(0, 1)]))
}

fn u_to_s(u: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = u[(0, 0)] * u[(1, 1)] - u[(0, 1)] * u[(1, 0)];
    check_denominator(u[(1, 1)], u, ParameterType::U, ParameterType::S)?;
    Ok(two_port(-u[(1, 0)] / u[(1, 1)], 1.0 / u[(1, 1)], det / u[(1, 1)], u[(0, 1)] / u[(1, 1)]))
}

fn z_to_h(z: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = z[(0, 0)] * z[(1, 1)] - z[(0, 1)] * z[(1, 0)];
    check_denominator(z[(1, 1)], z, ParameterType::Z, ParameterType::H)?;
    Ok(two_port(det / z[(1, 1)], z[(0, 1)] / z[(1, 1)], -z[(1, 0)] / z[(1, 1)], 1.0 / z[(1, 1)]))
}

fn h_to_z(h: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = h[(0, 0)] * h[(1, 1)] - h[(0, 1)] * h[(1, 0)];
    check_denominator(h[(1, 1)], h, ParameterType::H, ParameterType::Z)?;
    Ok(two_port(det / h[(1, 1)], h[(0, 1)] / h[(1, 1)], -h[(1, 0)] / h[(1, 1)], 1.0 / h[(1, 1)]))
}

fn z_to_g(z: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = z[(0, 0)] * z[(1, 1)] - z[(0, 1)] * z[(1, 0)];
    check_denominator(z[(0, 0)], z, ParameterType::Z, ParameterType::G)?;
    Ok(two_port(1.0 / z[(0, 0)], -z[(0, 1)] / z[(0, 0)], z[(1, 0)] / z[(0, 0)], det / z[(0, 0)]))
}

fn g_to_z(g: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = g[(0, 0)] * g[(1, 1)] - g[(0, 1)] * g[(1, 0)];
    check_denominator(g[(0, 0)], g, ParameterType::G, ParameterType::Z)?;
    Ok(two_port(1.0 / g[(0, 0)], -g[(0, 1)] / g[(0, 0)], g[(1, 0)] / g[(0, 0)], det / g[(0, 0)]))
}

fn z_to_a(z: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = z[(0, 0)] * z[(1, 1)] - z[(0, 1)] * z[(1, 0)];
    check_denominator(z[(1, 0)], z, ParameterType::Z, ParameterType::A)?;
    Ok(two_port(z[(0, 0)] / z[(1, 0)], det / z[(1, 0)], 1.0 / z[(1, 0)], z[(1, 1)] / z[(1, 0)]))
}

fn a_to_z(a: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = a[(0, 0)] * a[(1, 1)] - a[(0, 1)] * a[(1, 0)];
    check_denominator(a[(1, 0)], a, ParameterType::A, ParameterType::Z)?;
    Ok(two_port(a[(0, 0)] / a[(1, 0)], det / a[(1, 0)], 1.0 / a[(1, 0)], a[(1, 1)] / a[(1, 0)]))
}

fn z_to_b(z: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = z[(0, 0)] * z[(1, 1)] - z[(0, 1)] * z[(1, 0)];
    check_denominator(z[(0, 1)], z, ParameterType::Z, ParameterType::B)?;
    Ok(two_port(z[(1, 1)] / z[(0, 1)], det / z[(0, 1)], 1.0 / z[(0, 1)], z[(0, 0)] / z[(0, 1)]))
}

fn b_to_z(b: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, ConversionError> {
    let det = b[(0, 0)] * b[(1, 1)] - b[(0, 1)] * b[(1, 0)];
    check_denominator(b[(1, 0)], b, ParameterType::B, ParameterType::Z)?;
    Ok(two_port(b[(1, 1)] / b[(1, 0)], 1.0 / b[(1, 0)], det / b[(1, 0)], b[(0, 0)] / b[(1, 0)]))
}

/// Convert any wave- or immittance-domain representation to S.
fn to_s(m: &DMatrix<Complex64>, from: ParameterType, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    match from {
        ParameterType::S => Ok(m.clone()),
        ParameterType::T => t_to_s(m),
        ParameterType::U => u_to_s(m),
        _ => z_to_s(&to_z(m, from, z0)?, z0),
    }
}

fn from_s(s: &DMatrix<Complex64>, to: ParameterType, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    match to {
        ParameterType::S => Ok(s.clone()),
        ParameterType::T => s_to_t(s),
        ParameterType::U => s_to_u(s),
        _ => from_z(&s_to_z(s, z0)?, to),
    }
}

/// Convert any representation to Z. Wave-domain inputs need z0.
fn to_z(m: &DMatrix<Complex64>, from: ParameterType, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    match from {
        ParameterType::Z => Ok(m.clone()),
        ParameterType::Y => linalg::checked_inverse(m).ok_or_else(|| singular(ParameterType::Y, ParameterType::Z)),
        ParameterType::H => h_to_z(m),
        ParameterType::G => g_to_z(m),
        ParameterType::A => a_to_z(m),
        ParameterType::B => b_to_z(m),
        ParameterType::S => s_to_z(m, z0),
        ParameterType::T => s_to_z(&t_to_s(m)?, z0),
        ParameterType::U => s_to_z(&u_to_s(m)?, z0),
        ParameterType::Zin => Err(ConversionError::Undefined(
            ParameterType::Zin.name().to_string(),
            ParameterType::Z.name().to_string(),
        )),
    }
}

fn from_z(z: &DMatrix<Complex64>, to: ParameterType) -> Result<DMatrix<Complex64>, ConversionError> {
    match to {
        ParameterType::Z => Ok(z.clone()),
        ParameterType::Y => linalg::checked_inverse(z).ok_or_else(|| singular(ParameterType::Z, ParameterType::Y)),
        ParameterType::H => z_to_h(z),
        ParameterType::G => z_to_g(z),
        ParameterType::A => z_to_a(z),
        ParameterType::B => z_to_b(z),
        _ => Err(ConversionError::Undefined(
            ParameterType::Z.name().to_string(),
            to.name().to_string(),
        )),
    }
}

/// Input impedances. A square input goes through the Z-matrix diagonal; a
/// rectangular S falls back to the per-port reflection form for the ports
/// that are both driven and observed.
fn to_zin(m: &DMatrix<Complex64>, from: ParameterType, z0: &[Complex64]) -> Result<DMatrix<Complex64>, ConversionError> {
    if from == ParameterType::S && m.nrows() != m.ncols() {
        let n = m.nrows().min(m.ncols());
        let mut out = DMatrix::zeros(1, n);
        for i in 0..n {
            let one = Complex64::new(1.0, 0.0);
            let den = one - m[(i, i)];
            if den.norm() <= 16.0 * f64::EPSILON {
                return Err(singular(ParameterType::S, ParameterType::Zin));
            }
            out[(0, i)] = (z0[i].conj() + z0[i] * m[(i, i)]) / den;
        }
        return Ok(out);
    }
    check_square(m, from)?;
    let z = to_z(m, from, z0)?;
    let n = z.nrows();
    Ok(DMatrix::from_fn(1, n, |_, j| z[(j, j)]))
}

/// Convert a parameter matrix between representations under the per-port
/// reference impedances `z0`.
///
/// # Arguments
///
/// * `m`: The matrix in the `from` representation.
/// * `from`: The current representation.
/// * `to`: The requested representation.
/// * `z0`: One complex reference impedance per port.
///
/// returns: `Result<DMatrix<Complex64>, ConversionError>`
pub fn convert(
    m: &DMatrix<Complex64>,
    from: ParameterType,
    to: ParameterType,
    z0: &[Complex64],
) -> Result<DMatrix<Complex64>, ConversionError> {
    if from == to {
        return Ok(m.clone());
    }
    if from == ParameterType::Zin {
        return Err(ConversionError::Undefined(from.name().to_string(), to.name().to_string()));
    }
    if from.two_port_only() || to.two_port_only() {
        check_two_port(m, from)?;
    }
    if from != ParameterType::S || to != ParameterType::Zin {
        check_square(m, from)?;
    }
    check_z0(z0, m.nrows().max(m.ncols()))?;

    if to == ParameterType::Zin {
        return to_zin(m, from, z0);
    }
    if from.immittance_domain() && to.immittance_domain() {
        return from_z(&to_z(m, from, z0)?, to);
    }
    if from.wave_domain() && to.wave_domain() {
        return from_s(&to_s(m, from, z0)?, to, z0);
    }
    from_s(&to_s(m, from, z0)?, to, z0)
}

/// Renormalise S-parameters from the reference impedances `z0_old` to
/// `z0_new`, leaving the physical network unchanged.
///
/// The wave transformation between the two references reduces to four
/// diagonal coefficient matrices with `a' = C1 a + C2 b` and
/// `b' = C3 a + C4 b`, giving `S' = (C3 + C4 S)(C1 + C2 S)^-1`.
pub fn renormalize(
    s: &DMatrix<Complex64>,
    z0_old: &[Complex64],
    z0_new: &[Complex64],
) -> Result<DMatrix<Complex64>, ConversionError> {
    check_square(s, ParameterType::S)?;
    let n = s.nrows();
    check_z0(z0_old, n)?;
    check_z0(z0_new, n)?;

    let mut c1 = vec![Complex64::new(0.0, 0.0); n];
    let mut c2 = c1.clone();
    let mut c3 = c1.clone();
    let mut c4 = c1.clone();
    for i in 0..n {
        let z = z0_old[i];
        let zp = z0_new[i];
        let k = z.re.abs().sqrt();
        let fd = k / (2.0 * z.re);
        let fdp = zp.re.abs().sqrt() / (2.0 * zp.re);
        let half = Complex64::new(1.0 / (2.0 * fd), 0.0);
        let j_im = Complex64::new(0.0, z.im);
        c1[i] = fdp * (half + (zp - j_im) / k);
        c2[i] = fdp * (half - (zp - j_im) / k);
        c3[i] = fdp * (half - (zp.conj() + j_im) / k);
        c4[i] = fdp * (half + (zp.conj() + j_im) / k);
    }
    let numer = diagonal(&c3) + diagonal(&c4) * s;
    let denom = diagonal(&c1) + diagonal(&c2) * s;
    // S' = numer * denom^-1, via the transposed system.
    let x = linalg::solve_square(&denom.transpose(), &numer.transpose())
        .ok_or_else(|| singular(ParameterType::S, ParameterType::S))?;
    Ok(x.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{assert_complex_eq, assert_matrix_eq};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn z0_real(n: usize) -> Vec<Complex64> {
        vec![c(50.0, 0.0); n]
    }

    /// A well-conditioned non-symmetric 3x3 S matrix used by round trips.
    fn sample_s3() -> DMatrix<Complex64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[
                c(0.1, -0.2),
                c(0.4, 0.1),
                c(0.05, 0.3),
                c(0.3, 0.2),
                c(-0.1, 0.1),
                c(0.2, -0.15),
                c(0.15, -0.05),
                c(0.25, 0.2),
                c(0.05, 0.1),
            ],
        )
    }

    fn complex_z0() -> Vec<Complex64> {
        vec![c(50.0, 5.0), c(50.0, 0.0), c(50.0, -5.0)]
    }

    #[test]
    fn test_s_to_z_scalar_case() {
        // S = [[0, 0.5], [0.5, 0]] with 50 ohm: Z = [[250/3, 200/3], [200/3, 250/3]].
        let s = DMatrix::from_row_slice(2, 2, &[c(0.0, 0.0), c(0.5, 0.0), c(0.5, 0.0), c(0.0, 0.0)]);
        let z = convert(&s, ParameterType::S, ParameterType::Z, &z0_real(2)).unwrap();
        let expected = DMatrix::from_row_slice(
            2,
            2,
            &[c(250.0 / 3.0, 0.0), c(200.0 / 3.0, 0.0), c(200.0 / 3.0, 0.0), c(250.0 / 3.0, 0.0)],
        );
        assert_matrix_eq(&z, &expected, 1e-9);

        let back = convert(&z, ParameterType::Z, ParameterType::S, &z0_real(2)).unwrap();
        assert_matrix_eq(&back, &s, 1e-12);
    }

    #[test]
    fn test_power_wave_identity() {
        // With V and I recovered from the wave formulas, Z I = V must hold.
        let s = sample_s3();
        let z0 = complex_z0();
        let z = convert(&s, ParameterType::S, ParameterType::Z, &z0).unwrap();

        let a = DMatrix::from_row_slice(3, 1, &[c(1.0, 0.5), c(-0.3, 0.2), c(0.4, -0.8)]);
        let b = &s * &a;
        let mut v = DMatrix::zeros(3, 1);
        let mut i_vec = DMatrix::zeros(3, 1);
        for p in 0..3 {
            let k = z0[p].re.abs().sqrt();
            let fd = k / (2.0 * z0[p].re);
            i_vec[(p, 0)] = (a[(p, 0)] - b[(p, 0)]) / k;
            v[(p, 0)] = (a[(p, 0)] + b[(p, 0)]) / (2.0 * fd) - Complex64::new(0.0, z0[p].im) * i_vec[(p, 0)];
        }
        let v_from_z = &z * &i_vec;
        assert_matrix_eq(&v_from_z, &v, 1e-9);
    }

    #[test]
    fn test_y_round_trip_complex_z0() {
        let s = sample_s3();
        let z0 = complex_z0();
        let y = convert(&s, ParameterType::S, ParameterType::Y, &z0).unwrap();
        let z = convert(&y, ParameterType::Y, ParameterType::Z, &z0).unwrap();
        let back = convert(&z, ParameterType::Z, ParameterType::S, &z0).unwrap();
        assert_matrix_eq(&back, &s, 1e-10);
    }

    #[test]
    fn test_z_y_direct_inverse() {
        let s = sample_s3();
        let z0 = complex_z0();
        let z = convert(&s, ParameterType::S, ParameterType::Z, &z0).unwrap();
        let y = convert(&z, ParameterType::Z, ParameterType::Y, &z0).unwrap();
        let identity = &z * &y;
        assert_matrix_eq(&identity, &DMatrix::identity(3, 3), 1e-9);
    }

    #[test]
    fn test_transfer_round_trips() {
        let s = DMatrix::from_row_slice(2, 2, &[c(0.2, -0.1), c(0.8, 0.3), c(0.7, -0.2), c(0.1, 0.25)]);
        for t in [ParameterType::T, ParameterType::U] {
            let m = convert(&s, ParameterType::S, t, &z0_real(2)).unwrap();
            let back = convert(&m, t, ParameterType::S, &z0_real(2)).unwrap();
            assert_matrix_eq(&back, &s, 1e-12);
        }
    }

    #[test]
    fn test_two_port_round_trips() {
        let s = DMatrix::from_row_slice(2, 2, &[c(0.2, -0.1), c(0.6, 0.3), c(0.5, -0.2), c(0.1, 0.25)]);
        let z0 = vec![c(50.0, 2.0), c(75.0, -3.0)];
        for t in [ParameterType::H, ParameterType::G, ParameterType::A, ParameterType::B] {
            let m = convert(&s, ParameterType::S, t, &z0).unwrap();
            let back = convert(&m, t, ParameterType::S, &z0).unwrap();
            assert_matrix_eq(&back, &s, 1e-10);
        }
    }

    #[test]
    fn test_transfer_requires_two_port() {
        let s = sample_s3();
        let result = convert(&s, ParameterType::S, ParameterType::T, &z0_real(3));
        assert!(matches!(result, Err(ConversionError::NotTwoPort(_, 3, 3))));
    }

    #[test]
    fn test_zero_transmission_is_singular() {
        let s = DMatrix::from_row_slice(2, 2, &[c(0.5, 0.0), c(0.3, 0.0), c(0.0, 0.0), c(0.5, 0.0)]);
        assert!(matches!(
            convert(&s, ParameterType::S, ParameterType::T, &z0_real(2)),
            Err(ConversionError::Singular(_, _))
        ));
    }

    #[test]
    fn test_zin_single_port() {
        // 1-port: zin = (z* + z s) / (1 - s).
        let s = DMatrix::from_row_slice(1, 1, &[c(0.2, 0.0)]);
        let zin = convert(&s, ParameterType::S, ParameterType::Zin, &[c(50.0, 0.0)]).unwrap();
        assert_eq!(zin.shape(), (1, 1));
        assert_complex_eq(zin[(0, 0)], c(75.0, 0.0), 1e-10);
    }

    #[test]
    fn test_zin_is_z_diagonal() {
        let s = sample_s3();
        let z0 = complex_z0();
        let z = convert(&s, ParameterType::S, ParameterType::Z, &z0).unwrap();
        let zin = convert(&s, ParameterType::S, ParameterType::Zin, &z0).unwrap();
        for i in 0..3 {
            assert_complex_eq(zin[(0, i)], z[(i, i)], 1e-9);
        }
    }

    #[test]
    fn test_zin_is_output_only() {
        let zin = DMatrix::from_row_slice(1, 2, &[c(50.0, 0.0), c(75.0, 0.0)]);
        assert!(matches!(
            convert(&zin, ParameterType::Zin, ParameterType::S, &z0_real(2)),
            Err(ConversionError::Undefined(_, _))
        ));
    }

    #[test]
    fn test_bad_reference_impedance() {
        let s = DMatrix::from_row_slice(1, 1, &[c(0.2, 0.0)]);
        assert!(matches!(
            convert(&s, ParameterType::S, ParameterType::Z, &[c(0.0, 50.0)]),
            Err(ConversionError::BadReferenceImpedance(1))
        ));
    }

    #[test]
    fn test_renormalize_identity() {
        let s = sample_s3();
        let z0 = complex_z0();
        let same = renormalize(&s, &z0, &z0).unwrap();
        assert_matrix_eq(&same, &s, 1e-12);
    }

    #[test]
    fn test_renormalize_round_trip() {
        let s = sample_s3();
        let z0 = complex_z0();
        let z0_new = vec![c(75.0, 0.0), c(40.0, 10.0), c(60.0, -2.0)];
        let renorm = renormalize(&s, &z0, &z0_new).unwrap();
        let back = renormalize(&renorm, &z0_new, &z0).unwrap();
        assert_matrix_eq(&back, &s, 1e-10);
    }

    #[test]
    fn test_all_pairwise_round_trips() {
        // Every ordered pair of matrix representations on a well-conditioned
        // two-port with complex references.
        let s = DMatrix::from_row_slice(2, 2, &[c(0.2, -0.1), c(0.6, 0.3), c(0.5, -0.2), c(0.1, 0.25)]);
        let z0 = vec![c(50.0, 2.0), c(75.0, -3.0)];
        let types = [
            ParameterType::S,
            ParameterType::T,
            ParameterType::U,
            ParameterType::Z,
            ParameterType::Y,
            ParameterType::H,
            ParameterType::G,
            ParameterType::A,
            ParameterType::B,
        ];
        for from in types {
            let x = convert(&s, ParameterType::S, from, &z0).unwrap();
            for to in types {
                let y = convert(&x, from, to, &z0).unwrap();
                let back = convert(&y, to, from, &z0).unwrap();
                assert_matrix_eq(&back, &x, 1e-8 * crate::linalg::inf_norm(&x).max(1.0));
            }
        }
    }

    #[test]
    fn test_renormalize_matches_conversion_chain() {
        // Renormalisation must agree with S -> Z under z0 then Z -> S under z0'.
        let s = sample_s3();
        let z0 = complex_z0();
        let z0_new = vec![c(75.0, 0.0), c(40.0, 10.0), c(60.0, -2.0)];
        let renorm = renormalize(&s, &z0, &z0_new).unwrap();
        let z = convert(&s, ParameterType::S, ParameterType::Z, &z0).unwrap();
        let via_z = convert(&z, ParameterType::Z, ParameterType::S, &z0_new).unwrap();
        assert_matrix_eq(&renorm, &via_z, 1e-9);
    }
}
