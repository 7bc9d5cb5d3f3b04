//! Solved calibrations and their application to raw measurements.

use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::convert::ParameterType;
use crate::data::{NetworkData, ReferenceImpedance};
use crate::error::CalibrationError;
use crate::layout::{BlockKind, CalType, Layout};
use crate::linalg::{self, ComplexSpline};

/// A solved calibration: the error-term vectors over the calibration
/// frequency grid, immutable once produced by
/// [`CalibrationBuilder::solve`](crate::builder::CalibrationBuilder::solve).
#[derive(Debug)]
pub struct Calibration {
    name: String,
    layout: Layout,
    frequencies: Vec<f64>,
    z0: ReferenceImpedance,
    /// One flat term vector per frequency, addressed through the layout.
    terms: Vec<Vec<Complex64>>,
    /// Per-frequency RMS of the solve residual, for diagnostics.
    residual_rms: Vec<f64>,
    properties: Option<serde_json::Value>,
    allow_extrapolation: bool,
}

impl Calibration {
    pub(crate) fn new_solved(
        name: String,
        layout: Layout,
        frequencies: Vec<f64>,
        z0: ReferenceImpedance,
        terms: Vec<Vec<Complex64>>,
        residual_rms: Vec<f64>,
    ) -> Self {
        Self {
            name,
            layout,
            frequencies,
            z0,
            terms,
            residual_rms,
            properties: None,
            allow_extrapolation: false,
        }
    }

    /// Reassemble a calibration from stored parts (file loaders, error-model
    /// simulation). The term vectors must match the layout of the type and
    /// dimensions.
    pub fn from_parts(
        name: &str,
        cal_type: CalType,
        rows: usize,
        columns: usize,
        frequencies: &[f64],
        z0: ReferenceImpedance,
        terms: Vec<Vec<Complex64>>,
    ) -> Result<Self, CalibrationError> {
        let layout = Layout::new(cal_type, rows, columns)?;
        crate::util::check_frequency_vector(frequencies)?;
        if terms.len() != frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(terms.len(), frequencies.len()));
        }
        for row in &terms {
            if row.len() != layout.terms_per_frequency() {
                return Err(CalibrationError::Internal(format!(
                    "term vector has {} entries, layout needs {}",
                    row.len(),
                    layout.terms_per_frequency()
                )));
            }
        }
        let count = frequencies.len();
        Ok(Self::new_solved(
            name.to_string(),
            layout,
            frequencies.to_vec(),
            z0,
            terms,
            vec![0.0; count],
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cal_type(&self) -> CalType {
        self.layout.cal_type()
    }

    pub fn rows(&self) -> usize {
        self.layout.rows()
    }

    pub fn columns(&self) -> usize {
        self.layout.columns()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn frequency_count(&self) -> usize {
        self.frequencies.len()
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn z0(&self) -> &ReferenceImpedance {
        &self.z0
    }

    /// Per-frequency RMS residual of the solve.
    pub fn residual_rms(&self) -> &[f64] {
        &self.residual_rms
    }

    /// The flat error-term vector at a calibration grid index.
    pub fn terms(&self, findex: usize) -> Result<&[Complex64], CalibrationError> {
        self.terms
            .get(findex)
            .map(|t| t.as_slice())
            .ok_or_else(|| CalibrationError::Internal(format!("frequency index {findex} out of range")))
    }

    pub fn properties(&self) -> Option<&serde_json::Value> {
        self.properties.as_ref()
    }

    pub fn set_properties(&mut self, properties: serde_json::Value) {
        self.properties = Some(properties);
    }

    /// Allow apply frequencies outside the calibration range (the error
    /// terms are then held at the boundary values). Off by default.
    pub fn set_allow_extrapolation(&mut self, allow: bool) {
        self.allow_extrapolation = allow;
    }

    /// Error terms at an arbitrary frequency, spline-interpolated from the
    /// calibration grid.
    pub fn terms_at(&self, f: f64) -> Result<Vec<Complex64>, CalibrationError> {
        let interpolator = self.interpolator()?;
        self.terms_at_with(&interpolator, f)
    }

    fn interpolator(&self) -> Result<Vec<ComplexSpline>, CalibrationError> {
        let count = self.layout.terms_per_frequency();
        let mut splines = Vec::with_capacity(count);
        for t in 0..count {
            let values: Vec<Complex64> = self.terms.iter().map(|row| row[t]).collect();
            let spline = ComplexSpline::new(&self.frequencies, &values)
                .map_err(|e| CalibrationError::Internal(e.to_string()))?;
            splines.push(spline);
        }
        Ok(splines)
    }

    fn terms_at_with(&self, interpolator: &[ComplexSpline], f: f64) -> Result<Vec<Complex64>, CalibrationError> {
        // Exact grid hit, to full precision.
        if let Some(findex) = self
            .frequencies
            .iter()
            .position(|&x| (x - f).abs() <= 1e-9 * x.abs().max(1.0))
        {
            return Ok(self.terms[findex].clone());
        }
        let (first, last) = (self.frequencies[0], *self.frequencies.last().unwrap());
        if (f < first || f > last) && !self.allow_extrapolation {
            return Err(CalibrationError::OutOfRange(f, first, last));
        }
        Ok(interpolator.iter().map(|s| s.eval(f)).collect())
    }

    /// Apply the calibration to raw measurement matrices, recovering the
    /// device-under-test S-parameters.
    ///
    /// # Arguments
    ///
    /// * `frequencies`: Where the measurements were taken (Hz). Frequencies
    ///   between calibration points are handled by spline interpolation of
    ///   the error terms.
    /// * `measurements`: One `rows x columns` matrix per frequency.
    ///
    /// returns: `Result<NetworkData, CalibrationError>`
    pub fn apply(&self, frequencies: &[f64], measurements: &[DMatrix<Complex64>]) -> Result<NetworkData, CalibrationError> {
        if measurements.len() != frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(measurements.len(), frequencies.len()));
        }
        crate::util::check_frequency_vector(frequencies)?;
        for (findex, m) in measurements.iter().enumerate() {
            if m.nrows() != self.rows() || m.ncols() != self.columns() {
                return Err(CalibrationError::MismatchedMeasurement(
                    findex,
                    self.rows(),
                    self.columns(),
                    m.nrows(),
                    m.ncols(),
                ));
            }
        }
        let interpolator = self.interpolator()?;
        let mut out = NetworkData::new(ParameterType::S, self.rows(), self.columns(), frequencies)
            .map_err(CalibrationError::Conversion)?;
        out.set_z0_variant(self.z0.clone());
        for (findex, m) in measurements.iter().enumerate() {
            let terms = self.terms_at_with(&interpolator, frequencies[findex])?;
            let s = self.recover(&terms, m, findex)?;
            out.set_matrix(findex, s).map_err(CalibrationError::Conversion)?;
        }
        Ok(out)
    }

    /// Apply the calibration to incident/reflected wave matrices
    /// (`M = B A^-1` per frequency).
    pub fn apply_ab(
        &self,
        frequencies: &[f64],
        a: &[DMatrix<Complex64>],
        b: &[DMatrix<Complex64>],
    ) -> Result<NetworkData, CalibrationError> {
        if a.len() != frequencies.len() || b.len() != frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(a.len().min(b.len()), frequencies.len()));
        }
        let mut measurements = Vec::with_capacity(a.len());
        for findex in 0..a.len() {
            let a_inv = linalg::checked_inverse(&a[findex]).ok_or(CalibrationError::SingularIncidentWave(findex))?;
            measurements.push(&b[findex] * a_inv);
        }
        self.apply(frequencies, &measurements)
    }

    /// Materialise a named block as a full matrix (zeros where the layout
    /// stores nothing).
    fn block_matrix(&self, terms: &[Complex64], kind: BlockKind, column: Option<usize>) -> DMatrix<Complex64> {
        let block = self
            .layout
            .block(kind, column)
            .expect("block kinds are fixed per cal type");
        DMatrix::from_fn(block.rows, block.columns, |i, j| match block.term_index(i, j) {
            Some(t) => terms[t],
            None => Complex64::new(0.0, 0.0),
        })
    }

    /// Subtract the off-diagonal leakage terms from a measurement.
    fn deleak(&self, terms: &[Complex64], m: &DMatrix<Complex64>) -> DMatrix<Complex64> {
        match self.layout.block(BlockKind::El, None) {
            Some(_) => m - self.block_matrix(terms, BlockKind::El, None),
            None => m.clone(),
        }
    }

    /// Invert the error-term model over one measurement.
    fn recover(&self, terms: &[Complex64], m: &DMatrix<Complex64>, findex: usize) -> Result<DMatrix<Complex64>, CalibrationError> {
        let n = self.rows();
        match self.cal_type() {
            CalType::T8 | CalType::TE10 | CalType::T16 => {
                let mp = self.deleak(terms, m);
                let ts = self.block_matrix(terms, BlockKind::Ts, None);
                let ti = self.block_matrix(terms, BlockKind::Ti, None);
                let tx = self.block_matrix(terms, BlockKind::Tx, None);
                let tm = self.block_matrix(terms, BlockKind::Tm, None);
                // M (Tx S + Tm) = Ts S + Ti  =>  (M Tx - Ts) S = Ti - M Tm
                let lhs = &mp * tx - ts;
                let rhs = ti - &mp * tm;
                linalg::solve_square(&lhs, &rhs).ok_or(CalibrationError::NotInvertible(findex))
            }
            CalType::U8 | CalType::UE10 | CalType::U16 => {
                let mp = self.deleak(terms, m);
                let us = self.block_matrix(terms, BlockKind::Us, None);
                let ui = self.block_matrix(terms, BlockKind::Ui, None);
                let ux = self.block_matrix(terms, BlockKind::Ux, None);
                let um = self.block_matrix(terms, BlockKind::Um, None);
                // S = (Us M + Ui)(Ux M + Um)^-1
                let numer = us * &mp + ui;
                let denom = ux * &mp + um;
                let x = linalg::solve_square(&denom.transpose(), &numer.transpose())
                    .ok_or(CalibrationError::NotInvertible(findex))?;
                Ok(x.transpose())
            }
            CalType::UE14 => {
                let mp = self.deleak(terms, m);
                // Columns: S (ux_c o m_c + e_c) = us_c o m_c + ui_c.
                let mut lhs = DMatrix::zeros(n, n);
                let mut rhs = DMatrix::zeros(n, n);
                for c in 0..n {
                    let us = self.block_matrix(terms, BlockKind::Us, Some(c));
                    let ui = self.block_matrix(terms, BlockKind::Ui, Some(c));
                    let ux = self.block_matrix(terms, BlockKind::Ux, Some(c));
                    let um = self
                        .layout
                        .block(BlockKind::Um, Some(c))
                        .and_then(|b| b.term_index(0, 0))
                        .map(|t| terms[t])
                        .unwrap_or_else(|| Complex64::new(1.0, 0.0));
                    for l in 0..n {
                        lhs[(l, c)] = ux[(l, l)] * mp[(l, c)] + if l == c { um } else { Complex64::new(0.0, 0.0) };
                        rhs[(l, c)] = us[(l, l)] * mp[(l, c)] + ui[(l, 0)];
                    }
                }
                // S = rhs * lhs^-1
                let x = linalg::solve_square(&lhs.transpose(), &rhs.transpose())
                    .ok_or(CalibrationError::NotInvertible(findex))?;
                Ok(x.transpose())
            }
            CalType::E12 => {
                // S~ = (m - el) / er per cell, w_c = e_c + em_c o S~_c,
                // S = S~ W^-1.
                let mut s_tilde = DMatrix::zeros(n, n);
                let mut w = DMatrix::zeros(n, n);
                for c in 0..n {
                    let el = self.block_matrix(terms, BlockKind::El, Some(c));
                    let er = self.block_matrix(terms, BlockKind::Er, Some(c));
                    let em = self.block_matrix(terms, BlockKind::Em, Some(c));
                    for i in 0..n {
                        if er[(i, 0)].norm() == 0.0 {
                            return Err(CalibrationError::NotInvertible(findex));
                        }
                        s_tilde[(i, c)] = (m[(i, c)] - el[(i, 0)]) / er[(i, 0)];
                    }
                    for l in 0..n {
                        w[(l, c)] = em[(l, 0)] * s_tilde[(l, c)] + if l == c { Complex64::new(1.0, 0.0) } else { Complex64::new(0.0, 0.0) };
                    }
                }
                let x = linalg::solve_square(&w.transpose(), &s_tilde.transpose())
                    .ok_or(CalibrationError::NotInvertible(findex))?;
                Ok(x.transpose())
            }
        }
    }

    /// Forward error model: the raw measurement the instrument described by
    /// this calibration would produce for a device with S-matrix `s`.
    pub fn simulate_measurement(&self, findex: usize, s: &DMatrix<Complex64>) -> Result<DMatrix<Complex64>, CalibrationError> {
        let n = self.rows();
        if s.nrows() != n || s.ncols() != n {
            return Err(CalibrationError::MismatchedMeasurement(findex, n, n, s.nrows(), s.ncols()));
        }
        let terms = self.terms(findex)?.to_vec();
        let leak = self
            .layout
            .block(BlockKind::El, None)
            .map(|_| self.block_matrix(&terms, BlockKind::El, None));
        match self.cal_type() {
            CalType::T8 | CalType::TE10 | CalType::T16 => {
                let ts = self.block_matrix(&terms, BlockKind::Ts, None);
                let ti = self.block_matrix(&terms, BlockKind::Ti, None);
                let tx = self.block_matrix(&terms, BlockKind::Tx, None);
                let tm = self.block_matrix(&terms, BlockKind::Tm, None);
                // M = (Ts S + Ti)(Tx S + Tm)^-1
                let numer = ts * s + ti;
                let denom = tx * s + tm;
                let x = linalg::solve_square(&denom.transpose(), &numer.transpose())
                    .ok_or(CalibrationError::NotInvertible(findex))?;
                let mut m = x.transpose();
                if let Some(el) = leak {
                    m += el;
                }
                Ok(m)
            }
            CalType::U8 | CalType::UE10 | CalType::U16 => {
                let us = self.block_matrix(&terms, BlockKind::Us, None);
                let ui = self.block_matrix(&terms, BlockKind::Ui, None);
                let ux = self.block_matrix(&terms, BlockKind::Ux, None);
                let um = self.block_matrix(&terms, BlockKind::Um, None);
                // (Us - S Ux) M = S Um - Ui
                let lhs = us - s * ux;
                let rhs = s * um - ui;
                let mut m = linalg::solve_square(&lhs, &rhs).ok_or(CalibrationError::NotInvertible(findex))?;
                if let Some(el) = leak {
                    m += el;
                }
                Ok(m)
            }
            CalType::UE14 => {
                let mut m = DMatrix::zeros(n, n);
                for c in 0..n {
                    let us = self.block_matrix(&terms, BlockKind::Us, Some(c));
                    let ui = self.block_matrix(&terms, BlockKind::Ui, Some(c));
                    let ux = self.block_matrix(&terms, BlockKind::Ux, Some(c));
                    // (diag(us) - S diag(ux)) m_c = S e_c - ui_c
                    let mut lhs = DMatrix::zeros(n, n);
                    let mut rhs = DMatrix::zeros(n, 1);
                    for i in 0..n {
                        for l in 0..n {
                            lhs[(i, l)] = -s[(i, l)] * ux[(l, l)] + if i == l { us[(i, i)] } else { Complex64::new(0.0, 0.0) };
                        }
                        rhs[(i, 0)] = s[(i, c)] - ui[(i, 0)];
                    }
                    let m_c = linalg::solve_square(&lhs, &rhs).ok_or(CalibrationError::NotInvertible(findex))?;
                    for i in 0..n {
                        m[(i, c)] = m_c[(i, 0)];
                    }
                }
                if let Some(el) = leak {
                    m += el;
                }
                Ok(m)
            }
            CalType::E12 => {
                let identity = DMatrix::identity(n, n);
                let mut m = DMatrix::zeros(n, n);
                for c in 0..n {
                    let el = self.block_matrix(&terms, BlockKind::El, Some(c));
                    let er = self.block_matrix(&terms, BlockKind::Er, Some(c));
                    let em = self.block_matrix(&terms, BlockKind::Em, Some(c));
                    let em_diag = DMatrix::from_fn(n, n, |i, j| if i == j { em[(i, 0)] } else { Complex64::new(0.0, 0.0) });
                    let lhs = &identity - s * em_diag;
                    let mut e_c = DMatrix::zeros(n, 1);
                    e_c[(c, 0)] = Complex64::new(1.0, 0.0);
                    let s_col = s * e_c;
                    let s_tilde = linalg::solve_square(&lhs, &s_col).ok_or(CalibrationError::NotInvertible(findex))?;
                    for i in 0..n {
                        m[(i, c)] = el[(i, 0)] + er[(i, 0)] * s_tilde[(i, 0)];
                    }
                }
                Ok(m)
            }
        }
    }
}
