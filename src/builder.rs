//! Calibration builder.
//!
//! The builder accumulates calibration standards together with the raw
//! measurements taken of them, then solves for the error terms of the
//! selected formulation. Standards reference parameters from a
//! [`ParameterRegistry`]; the builder holds a reference on every handle it
//! uses and drops them again when it goes out of scope.

use log::info;
use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::calibration::Calibration;
use crate::data::ReferenceImpedance;
use crate::error::CalibrationError;
use crate::layout::{CalType, Layout};
use crate::parameter::{ParameterId, ParameterRegistry};
use crate::solver;

/// How a standard was declared; the solver needs this to recognise
/// line standards for the phase-degeneracy exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StandardKind {
    Through,
    Line,
    DoubleReflect,
    Reflect,
    General,
}

/// Raw measurement of one standard over the full frequency grid.
pub(crate) enum MeasurementData {
    /// Reflected-only model: the measurement matrix itself.
    M(Vec<DMatrix<Complex64>>),
    /// Incident and reflected wave matrices; `M = B * A^-1` per frequency.
    Ab {
        a: Vec<DMatrix<Complex64>>,
        b: Vec<DMatrix<Complex64>>,
    },
}

pub(crate) struct Standard {
    pub(crate) kind: StandardKind,
    /// Full ports x ports matrix of parameter handles; cells not covered by
    /// the standard hold the canonical zero.
    pub(crate) s: Vec<Vec<ParameterId>>,
    /// Which measurement cells were actually taken.
    pub(crate) mask: Vec<Vec<bool>>,
    pub(crate) measurement: MeasurementData,
    /// Transmission parameter of a line standard.
    pub(crate) line_parameter: Option<ParameterId>,
}

pub(crate) struct LeakageMeasurement {
    pub(crate) row: usize,
    pub(crate) column: usize,
    pub(crate) values: Vec<Complex64>,
}

/// Accumulator for calibration standards and measurements.
pub struct CalibrationBuilder<'r> {
    registry: &'r mut ParameterRegistry,
    layout: Layout,
    frequencies: Vec<f64>,
    z0: ReferenceImpedance,
    standards: Vec<Standard>,
    leakage: Vec<LeakageMeasurement>,
    retained: Vec<ParameterId>,
    solved: bool,
}

impl<'r> CalibrationBuilder<'r> {
    /// Create a builder for the given error-term type and dimensions.
    ///
    /// # Arguments
    ///
    /// * `registry`: The parameter registry providing the standards' values.
    /// * `cal_type`: The error-term formulation to solve for.
    /// * `rows`: Measurement rows (ports observed by the instrument).
    /// * `columns`: Measurement columns (ports driven by the instrument).
    /// * `frequencies`: The calibration frequency grid in Hz.
    ///
    /// returns: `Result<CalibrationBuilder, CalibrationError>`
    pub fn new(
        registry: &'r mut ParameterRegistry,
        cal_type: CalType,
        rows: usize,
        columns: usize,
        frequencies: &[f64],
    ) -> Result<Self, CalibrationError> {
        let layout = Layout::new(cal_type, rows, columns)?;
        crate::util::check_frequency_vector(frequencies)?;
        Ok(Self {
            registry,
            layout,
            frequencies: frequencies.to_vec(),
            z0: ReferenceImpedance::Scalar(Complex64::new(50.0, 0.0)),
            standards: vec![],
            leakage: vec![],
            retained: vec![],
            solved: false,
        })
    }

    pub fn cal_type(&self) -> CalType {
        self.layout.cal_type()
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn ports(&self) -> usize {
        self.layout.rows()
    }

    /// Set the reference impedance shared by all ports.
    pub fn set_z0(&mut self, z0: Complex64) {
        self.z0 = ReferenceImpedance::Scalar(z0);
    }

    /// Set one reference impedance per port.
    pub fn set_z0_per_port(&mut self, z0: &[Complex64]) -> Result<(), CalibrationError> {
        if z0.len() != self.ports() {
            return Err(CalibrationError::Conversion(crate::error::ConversionError::MismatchedPorts(
                self.ports(),
                z0.len(),
            )));
        }
        self.z0 = ReferenceImpedance::PerPort(z0.to_vec());
        Ok(())
    }

    fn check_ports(&self, ports: &[usize]) -> Result<(), CalibrationError> {
        for (i, &p) in ports.iter().enumerate() {
            if p == 0 || p > self.ports() {
                return Err(CalibrationError::PortOutOfRange(p, self.ports()));
            }
            if ports[..i].contains(&p) {
                return Err(CalibrationError::DuplicatePort(p));
            }
        }
        Ok(())
    }

    fn check_full_matrices(&self, m: &[DMatrix<Complex64>]) -> Result<(), CalibrationError> {
        if m.len() != self.frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(m.len(), self.frequencies.len()));
        }
        for (findex, matrix) in m.iter().enumerate() {
            if matrix.nrows() != self.layout.rows() || matrix.ncols() != self.layout.columns() {
                return Err(CalibrationError::MismatchedMeasurement(
                    findex,
                    self.layout.rows(),
                    self.layout.columns(),
                    matrix.nrows(),
                    matrix.ncols(),
                ));
            }
        }
        Ok(())
    }

    fn retain_all(&mut self, handles: &[ParameterId]) -> Result<(), CalibrationError> {
        for &h in handles {
            self.registry.retain(h)?;
            self.retained.push(h);
        }
        Ok(())
    }

    /// Embed an n x n standard into the full port space, padding with the
    /// canonical zero.
    fn embed(&self, ports: &[usize], s: &[Vec<ParameterId>]) -> Vec<Vec<ParameterId>> {
        let n = self.ports();
        let mut full = vec![vec![ParameterId::ZERO; n]; n];
        for (k, &pk) in ports.iter().enumerate() {
            for (l, &pl) in ports.iter().enumerate() {
                full[pk - 1][pl - 1] = s[k][l];
            }
        }
        full
    }

    fn push_standard(
        &mut self,
        kind: StandardKind,
        ports: &[usize],
        s: &[Vec<ParameterId>],
        measurement: MeasurementData,
        mask: Vec<Vec<bool>>,
        line_parameter: Option<ParameterId>,
    ) -> Result<(), CalibrationError> {
        if self.solved {
            return Err(CalibrationError::AlreadySolved);
        }
        self.check_ports(ports)?;
        let handles: Vec<ParameterId> = s.iter().flatten().copied().collect();
        for &h in &handles {
            // Validate before touching any reference count.
            self.registry.value_at(h, self.frequencies[0])?;
        }
        self.retain_all(&handles)?;
        let s = self.embed(ports, s);
        self.standards.push(Standard {
            kind,
            s,
            mask,
            measurement,
            line_parameter,
        });
        Ok(())
    }

    fn full_mask(&self) -> Vec<Vec<bool>> {
        vec![vec![true; self.layout.columns()]; self.layout.rows()]
    }

    /// Add a perfect through between two VNA ports with its measurement.
    pub fn add_through(&mut self, port1: usize, port2: usize, m: &[DMatrix<Complex64>]) -> Result<(), CalibrationError> {
        self.check_full_matrices(m)?;
        let s = vec![
            vec![ParameterId::ZERO, ParameterId::OPEN],
            vec![ParameterId::OPEN, ParameterId::ZERO],
        ];
        let mask = self.full_mask();
        self.push_standard(StandardKind::Through, &[port1, port2], &s, MeasurementData::M(m.to_vec()), mask, None)
    }

    /// Add a matched line with the given transmission parameter.
    pub fn add_line(
        &mut self,
        port1: usize,
        port2: usize,
        transmission: ParameterId,
        m: &[DMatrix<Complex64>],
    ) -> Result<(), CalibrationError> {
        self.check_full_matrices(m)?;
        let s = vec![
            vec![ParameterId::ZERO, transmission],
            vec![transmission, ParameterId::ZERO],
        ];
        let mask = self.full_mask();
        self.push_standard(
            StandardKind::Line,
            &[port1, port2],
            &s,
            MeasurementData::M(m.to_vec()),
            mask,
            Some(transmission),
        )
    }

    /// Add a pair of reflect standards connected to two ports at once.
    pub fn add_double_reflect(
        &mut self,
        port1: usize,
        port2: usize,
        gamma1: ParameterId,
        gamma2: ParameterId,
        m: &[DMatrix<Complex64>],
    ) -> Result<(), CalibrationError> {
        self.check_full_matrices(m)?;
        let s = vec![vec![gamma1, ParameterId::ZERO], vec![ParameterId::ZERO, gamma2]];
        let mask = self.full_mask();
        self.push_standard(
            StandardKind::DoubleReflect,
            &[port1, port2],
            &s,
            MeasurementData::M(m.to_vec()),
            mask,
            None,
        )
    }

    /// Add a single reflect standard on one port; only the reflection cell
    /// of that port is measured.
    pub fn add_reflect(&mut self, port: usize, gamma: ParameterId, m: &[Complex64]) -> Result<(), CalibrationError> {
        if m.len() != self.frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(m.len(), self.frequencies.len()));
        }
        self.check_ports(&[port])?;
        let rows = self.layout.rows();
        let columns = self.layout.columns();
        if port > rows || port > columns {
            return Err(CalibrationError::PortOutOfRange(port, rows.min(columns)));
        }
        let matrices: Vec<DMatrix<Complex64>> = m
            .iter()
            .map(|&value| {
                let mut matrix = DMatrix::zeros(rows, columns);
                matrix[(port - 1, port - 1)] = value;
                matrix
            })
            .collect();
        let mut mask = vec![vec![false; columns]; rows];
        mask[port - 1][port - 1] = true;
        let s = vec![vec![gamma]];
        self.push_standard(StandardKind::Reflect, &[port], &s, MeasurementData::M(matrices), mask, None)
    }

    /// Add an arbitrary standard with a fully measured matrix.
    ///
    /// # Arguments
    ///
    /// * `ports`: 1-based VNA ports, one per standard port.
    /// * `s`: The standard's S-matrix as rows of parameter handles.
    /// * `m`: One measurement matrix per calibration frequency.
    ///
    /// returns: `Result<(), CalibrationError>`
    pub fn add_standard(
        &mut self,
        ports: &[usize],
        s: &[Vec<ParameterId>],
        m: &[DMatrix<Complex64>],
    ) -> Result<(), CalibrationError> {
        if s.len() != ports.len() || s.iter().any(|row| row.len() != ports.len()) {
            return Err(CalibrationError::Internal(format!(
                "standard S-matrix must be {n}x{n}",
                n = ports.len()
            )));
        }
        self.check_full_matrices(m)?;
        let mask = self.full_mask();
        self.push_standard(StandardKind::General, ports, s, MeasurementData::M(m.to_vec()), mask, None)
    }

    /// Add a standard measured as incident (`a`) and reflected (`b`) wave
    /// matrices instead of a ready-made measurement matrix.
    pub fn add_standard_ab(
        &mut self,
        ports: &[usize],
        s: &[Vec<ParameterId>],
        a: &[DMatrix<Complex64>],
        b: &[DMatrix<Complex64>],
    ) -> Result<(), CalibrationError> {
        if s.len() != ports.len() || s.iter().any(|row| row.len() != ports.len()) {
            return Err(CalibrationError::Internal(format!(
                "standard S-matrix must be {n}x{n}",
                n = ports.len()
            )));
        }
        self.check_full_matrices(a)?;
        self.check_full_matrices(b)?;
        let mask = self.full_mask();
        self.push_standard(
            StandardKind::General,
            ports,
            s,
            MeasurementData::Ab {
                a: a.to_vec(),
                b: b.to_vec(),
            },
            mask,
            None,
        )
    }

    /// Record a leakage reading for one off-diagonal cell, taken with no
    /// standard connected.
    pub fn add_leakage(&mut self, row_port: usize, column_port: usize, values: &[Complex64]) -> Result<(), CalibrationError> {
        if !self.cal_type().handles_leakage() || self.cal_type().full_blocks() {
            return Err(CalibrationError::LeakageNotSupported(self.cal_type().name().to_string()));
        }
        if row_port == column_port {
            return Err(CalibrationError::DiagonalLeakage(row_port, column_port));
        }
        self.check_ports(&[row_port])?;
        self.check_ports(&[column_port])?;
        if values.len() != self.frequencies.len() {
            return Err(CalibrationError::MismatchedFrequencyCount(values.len(), self.frequencies.len()));
        }
        self.leakage.push(LeakageMeasurement {
            row: row_port - 1,
            column: column_port - 1,
            values: values.to_vec(),
        });
        Ok(())
    }

    /// Solve the calibration. Unknown parameters are recovered per frequency
    /// and written back into the registry; the builder cannot be solved
    /// twice.
    ///
    /// # Arguments
    ///
    /// * `name`: A name stored with the calibration.
    ///
    /// returns: `Result<Calibration, CalibrationError>`
    pub fn solve(&mut self, name: &str) -> Result<Calibration, CalibrationError> {
        if self.solved {
            return Err(CalibrationError::AlreadySolved);
        }
        if self.standards.is_empty() {
            return Err(CalibrationError::NoStandards);
        }
        info!(
            "Solving {} calibration '{}' with {} standards over {} frequencies",
            self.cal_type(),
            name,
            self.standards.len(),
            self.frequencies.len()
        );

        let outcome = solver::solve(
            &self.layout,
            self.registry,
            &self.frequencies,
            &self.standards,
            &self.leakage,
        )?;

        // Write the recovered unknowns back before the handles are released.
        for (unknown_index, &id) in outcome.unknown_ids.iter().enumerate() {
            let values: Vec<Complex64> = outcome.solutions.iter().map(|s| s.unknowns[unknown_index]).collect();
            self.registry.set_solved(id, &self.frequencies, &values)?;
            info!("Recovered unknown parameter {id} over {} frequencies", values.len());
        }
        self.solved = true;

        let terms: Vec<Vec<Complex64>> = outcome.solutions.iter().map(|s| s.terms.clone()).collect();
        let rms: Vec<f64> = outcome.solutions.iter().map(|s| s.residual_rms).collect();
        Ok(Calibration::new_solved(
            name.to_string(),
            self.layout.clone(),
            self.frequencies.clone(),
            self.z0.clone(),
            terms,
            rms,
        ))
    }
}

impl Drop for CalibrationBuilder<'_> {
    fn drop(&mut self) {
        for id in self.retained.drain(..) {
            // The registry outlives the builder; a stale handle here would
            // be an internal bug, not something to surface on drop.
            let _ = self.registry.release(id);
        }
    }
}
