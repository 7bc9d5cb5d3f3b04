//! Frequency-indexed network-parameter container.

use log::warn;
use nalgebra::DMatrix;
use num_complex::Complex64;

use crate::convert::{self, ParameterType};
use crate::error::{ConversionError, GridError};

/// Reference impedances attached to a [`NetworkData`] container. The variant
/// is fixed per container; moving to a wider variant is an explicit
/// operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceImpedance {
    /// One value shared by every port and frequency.
    Scalar(Complex64),
    /// One value per port, shared by all frequencies.
    PerPort(Vec<Complex64>),
    /// One value per port and frequency (outer index is the frequency).
    PerFrequency(Vec<Vec<Complex64>>),
}

impl ReferenceImpedance {
    /// Resolve to one value per port at the given frequency index.
    pub fn resolve(&self, findex: usize, ports: usize) -> Vec<Complex64> {
        match self {
            ReferenceImpedance::Scalar(z) => vec![*z; ports],
            ReferenceImpedance::PerPort(z) => z.clone(),
            ReferenceImpedance::PerFrequency(z) => z[findex].clone(),
        }
    }
}

/// Container holding one parameter matrix per frequency together with the
/// reference impedances the values are defined against.
///
/// All matrix-type parameters store `rows x columns` matrices; `Zin` stores
/// a row vector of input impedances.
#[derive(Debug, Clone)]
pub struct NetworkData {
    parameter_type: ParameterType,
    rows: usize,
    columns: usize,
    frequencies: Vec<f64>,
    matrices: Vec<DMatrix<Complex64>>,
    z0: ReferenceImpedance,
}

impl NetworkData {
    /// Create a container filled with zeros.
    ///
    /// # Arguments
    ///
    /// * `parameter_type`: The stored representation.
    /// * `rows`: Matrix rows (1 for `Zin`).
    /// * `columns`: Matrix columns.
    /// * `frequencies`: The frequency grid in Hz, strictly increasing.
    ///
    /// returns: `Result<NetworkData, ConversionError>`
    pub fn new(
        parameter_type: ParameterType,
        rows: usize,
        columns: usize,
        frequencies: &[f64],
    ) -> Result<Self, ConversionError> {
        crate::util::check_frequency_vector(frequencies)?;
        Self::check_dimensions(parameter_type, rows, columns)?;
        Ok(Self {
            parameter_type,
            rows,
            columns,
            frequencies: frequencies.to_vec(),
            matrices: vec![DMatrix::zeros(rows, columns); frequencies.len()],
            z0: ReferenceImpedance::Scalar(Complex64::new(50.0, 0.0)),
        })
    }

    fn check_dimensions(parameter_type: ParameterType, rows: usize, columns: usize) -> Result<(), ConversionError> {
        if rows == 0 || columns == 0 {
            return Err(ConversionError::NotSquare(parameter_type.name().to_string(), rows, columns));
        }
        if parameter_type.two_port_only() && (rows != 2 || columns != 2) {
            return Err(ConversionError::NotTwoPort(parameter_type.name().to_string(), rows, columns));
        }
        if matches!(parameter_type, ParameterType::Z | ParameterType::Y) && rows != columns {
            return Err(ConversionError::NotSquare(parameter_type.name().to_string(), rows, columns));
        }
        if parameter_type == ParameterType::Zin && rows != 1 {
            return Err(ConversionError::NotSquare(parameter_type.name().to_string(), rows, columns));
        }
        Ok(())
    }

    pub fn parameter_type(&self) -> ParameterType {
        self.parameter_type
    }

    /// Relabel the stored values as another representation without touching
    /// them. The new type must accept the current dimensions; use
    /// [`NetworkData::convert`] to actually transform values.
    pub fn set_parameter_type(&mut self, parameter_type: ParameterType) -> Result<(), ConversionError> {
        Self::check_dimensions(parameter_type, self.rows, self.columns)?;
        self.parameter_type = parameter_type;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Number of VNA ports covered by the container.
    pub fn ports(&self) -> usize {
        if self.parameter_type == ParameterType::Zin {
            self.columns
        } else {
            self.rows.max(self.columns)
        }
    }

    pub fn frequency_count(&self) -> usize {
        self.frequencies.len()
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn frequency(&self, findex: usize) -> Result<f64, ConversionError> {
        self.frequencies
            .get(findex)
            .copied()
            .ok_or_else(|| self.out_of_bounds(findex, 0, 0))
    }

    /// Replace the frequency vector; the length must not change.
    pub fn set_frequencies(&mut self, frequencies: &[f64]) -> Result<(), ConversionError> {
        crate::util::check_frequency_vector(frequencies)?;
        if frequencies.len() != self.frequencies.len() {
            return Err(GridError::MismatchedLength(self.frequencies.len(), frequencies.len()).into());
        }
        self.frequencies = frequencies.to_vec();
        Ok(())
    }

    fn out_of_bounds(&self, findex: usize, row: usize, column: usize) -> ConversionError {
        ConversionError::OutOfBounds {
            findex,
            row,
            column,
            rows: self.rows,
            columns: self.columns,
            count: self.frequencies.len(),
        }
    }

    pub fn matrix(&self, findex: usize) -> Result<&DMatrix<Complex64>, ConversionError> {
        self.matrices.get(findex).ok_or_else(|| self.out_of_bounds(findex, 0, 0))
    }

    pub fn set_matrix(&mut self, findex: usize, matrix: DMatrix<Complex64>) -> Result<(), ConversionError> {
        if findex >= self.matrices.len() {
            return Err(self.out_of_bounds(findex, 0, 0));
        }
        if matrix.nrows() != self.rows || matrix.ncols() != self.columns {
            return Err(ConversionError::NotSquare(
                self.parameter_type.name().to_string(),
                matrix.nrows(),
                matrix.ncols(),
            ));
        }
        self.matrices[findex] = matrix;
        Ok(())
    }

    pub fn cell(&self, findex: usize, row: usize, column: usize) -> Result<Complex64, ConversionError> {
        if findex >= self.matrices.len() || row >= self.rows || column >= self.columns {
            return Err(self.out_of_bounds(findex, row, column));
        }
        Ok(self.matrices[findex][(row, column)])
    }

    pub fn set_cell(&mut self, findex: usize, row: usize, column: usize, value: Complex64) -> Result<(), ConversionError> {
        if findex >= self.matrices.len() || row >= self.rows || column >= self.columns {
            return Err(self.out_of_bounds(findex, row, column));
        }
        self.matrices[findex][(row, column)] = value;
        Ok(())
    }

    pub fn z0(&self) -> &ReferenceImpedance {
        &self.z0
    }

    /// Reference impedances resolved per port at a frequency index.
    pub fn z0_at(&self, findex: usize) -> Vec<Complex64> {
        self.z0.resolve(findex, self.ports())
    }

    /// Set one reference impedance for all ports and frequencies.
    pub fn set_z0(&mut self, z0: Complex64) {
        self.z0 = ReferenceImpedance::Scalar(z0);
    }

    /// Widen to one reference impedance per port.
    pub fn set_z0_per_port(&mut self, z0: &[Complex64]) -> Result<(), ConversionError> {
        if z0.len() != self.ports() {
            return Err(ConversionError::MismatchedPorts(self.ports(), z0.len()));
        }
        self.z0 = ReferenceImpedance::PerPort(z0.to_vec());
        Ok(())
    }

    /// Widen to one reference impedance per port and frequency.
    pub fn set_z0_per_frequency(&mut self, z0: &[Vec<Complex64>]) -> Result<(), ConversionError> {
        if z0.len() != self.frequencies.len() {
            return Err(ConversionError::MismatchedPorts(self.frequencies.len(), z0.len()));
        }
        for row in z0 {
            if row.len() != self.ports() {
                return Err(ConversionError::MismatchedPorts(self.ports(), row.len()));
            }
        }
        self.z0 = ReferenceImpedance::PerFrequency(z0.to_vec());
        Ok(())
    }

    pub(crate) fn set_z0_variant(&mut self, z0: ReferenceImpedance) {
        self.z0 = z0;
    }

    /// Resize the container. Existing cells inside the overlapping
    /// frequency/row/column ranges are preserved; new cells are zero.
    /// Shrinking any axis truncates.
    pub fn resize(&mut self, rows: usize, columns: usize, frequencies: &[f64]) -> Result<(), ConversionError> {
        crate::util::check_frequency_vector(frequencies)?;
        Self::check_dimensions(self.parameter_type, rows, columns)?;
        let mut matrices = vec![DMatrix::zeros(rows, columns); frequencies.len()];
        for (findex, matrix) in matrices.iter_mut().enumerate() {
            if findex >= self.matrices.len() {
                break;
            }
            let old = &self.matrices[findex];
            for i in 0..rows.min(self.rows) {
                for j in 0..columns.min(self.columns) {
                    matrix[(i, j)] = old[(i, j)];
                }
            }
        }
        if let ReferenceImpedance::PerFrequency(z) = &self.z0 {
            if z.len() != frequencies.len() {
                warn!("Per-frequency reference impedances reset to 50 ohm by frequency resize");
                self.z0 = ReferenceImpedance::Scalar(Complex64::new(50.0, 0.0));
            }
        }
        self.rows = rows;
        self.columns = columns;
        self.frequencies = frequencies.to_vec();
        self.matrices = matrices;
        Ok(())
    }

    /// Convert every per-frequency matrix to another representation under
    /// the container's reference impedances.
    pub fn convert(&self, to: ParameterType) -> Result<NetworkData, ConversionError> {
        let (out_rows, out_columns) = if to == ParameterType::Zin {
            (1, self.rows.min(self.columns))
        } else {
            (self.rows, self.columns)
        };
        let mut out = NetworkData::new(to, out_rows, out_columns, &self.frequencies)?;
        out.z0 = self.z0.clone();
        for findex in 0..self.frequencies.len() {
            let z0 = self.z0_at(findex);
            let converted = convert::convert(&self.matrices[findex], self.parameter_type, to, &z0)?;
            out.matrices[findex] = converted;
        }
        Ok(out)
    }

    /// Renormalise to new reference impedances and convert to the requested
    /// representation in one step.
    pub fn renormalize(&self, z0_new: &ReferenceImpedance, to: ParameterType) -> Result<NetworkData, ConversionError> {
        let ports = self.ports();
        if let ReferenceImpedance::PerFrequency(z) = z0_new {
            if z.len() != self.frequencies.len() {
                return Err(ConversionError::MismatchedPorts(self.frequencies.len(), z.len()));
            }
        }
        let (out_rows, out_columns) = if to == ParameterType::Zin {
            (1, self.rows.min(self.columns))
        } else {
            (self.rows, self.columns)
        };
        let mut out = NetworkData::new(to, out_rows, out_columns, &self.frequencies)?;
        out.z0 = z0_new.clone();
        for findex in 0..self.frequencies.len() {
            let z0_old = self.z0_at(findex);
            let z0_next = z0_new.resolve(findex, ports);
            let s = convert::convert(&self.matrices[findex], self.parameter_type, ParameterType::S, &z0_old)?;
            let renormed = convert::renormalize(&s, &z0_old, &z0_next)?;
            out.matrices[findex] = convert::convert(&renormed, ParameterType::S, to, &z0_next)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::assert_matrix_eq;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn sample_data() -> NetworkData {
        let mut data = NetworkData::new(ParameterType::S, 2, 2, &[1e9, 2e9, 3e9]).unwrap();
        for findex in 0..3 {
            let scale = 0.1 * (findex as f64 + 1.0);
            data.set_matrix(
                findex,
                DMatrix::from_row_slice(2, 2, &[c(scale, 0.0), c(0.5, scale), c(0.5, -scale), c(-scale, 0.1)]),
            )
            .unwrap();
        }
        data
    }

    #[test]
    fn test_dimension_checks() {
        assert!(NetworkData::new(ParameterType::T, 3, 3, &[1e9]).is_err());
        assert!(NetworkData::new(ParameterType::Zin, 2, 2, &[1e9]).is_err());
        assert!(NetworkData::new(ParameterType::Z, 2, 3, &[1e9]).is_err());
        assert!(NetworkData::new(ParameterType::S, 2, 3, &[1e9]).is_ok());
    }

    #[test]
    fn test_bounds_checked_accessors() {
        let mut data = sample_data();
        assert!(data.cell(0, 0, 0).is_ok());
        assert!(data.cell(3, 0, 0).is_err());
        assert!(data.cell(0, 2, 0).is_err());
        assert!(data.cell(0, 0, 2).is_err());
        assert!(data.set_cell(1, 1, 1, c(0.0, 0.0)).is_ok());
        assert!(data.set_cell(1, 2, 1, c(0.0, 0.0)).is_err());
        assert!(data.matrix(5).is_err());
        assert!(data
            .set_matrix(0, DMatrix::zeros(3, 3))
            .is_err());
    }

    #[test]
    fn test_z0_widening() {
        let mut data = sample_data();
        assert_eq!(data.z0_at(0), vec![c(50.0, 0.0), c(50.0, 0.0)]);
        data.set_z0_per_port(&[c(50.0, 0.0), c(75.0, 0.0)]).unwrap();
        assert_eq!(data.z0_at(1)[1], c(75.0, 0.0));
        assert!(data.set_z0_per_port(&[c(50.0, 0.0)]).is_err());

        let per_frequency: Vec<Vec<Complex64>> = (0..3).map(|i| vec![c(50.0 + i as f64, 0.0); 2]).collect();
        data.set_z0_per_frequency(&per_frequency).unwrap();
        assert_eq!(data.z0_at(2)[0], c(52.0, 0.0));
    }

    #[test]
    fn test_convert_container() {
        let data = sample_data();
        let z = data.convert(ParameterType::Z).unwrap();
        assert_eq!(z.parameter_type(), ParameterType::Z);
        let back = z.convert(ParameterType::S).unwrap();
        for findex in 0..3 {
            assert_matrix_eq(back.matrix(findex).unwrap(), data.matrix(findex).unwrap(), 1e-10);
        }
    }

    #[test]
    fn test_convert_to_zin_shape() {
        let data = sample_data();
        let zin = data.convert(ParameterType::Zin).unwrap();
        assert_eq!(zin.rows(), 1);
        assert_eq!(zin.columns(), 2);
    }

    #[test]
    fn test_renormalize_round_trip() {
        let data = sample_data();
        let renormed = data
            .renormalize(&ReferenceImpedance::PerPort(vec![c(75.0, 0.0), c(40.0, 5.0)]), ParameterType::S)
            .unwrap();
        let back = renormed
            .renormalize(&ReferenceImpedance::Scalar(c(50.0, 0.0)), ParameterType::S)
            .unwrap();
        for findex in 0..3 {
            assert_matrix_eq(back.matrix(findex).unwrap(), data.matrix(findex).unwrap(), 1e-10);
        }
    }

    #[test]
    fn test_resize_preserves_overlap() {
        let mut data = sample_data();
        let original = data.cell(1, 0, 1).unwrap();
        data.resize(3, 3, &[1e9, 2e9]).unwrap();
        assert_eq!(data.rows(), 3);
        assert_eq!(data.frequency_count(), 2);
        assert_eq!(data.cell(1, 0, 1).unwrap(), original);
        assert_eq!(data.cell(1, 2, 2).unwrap(), c(0.0, 0.0));
    }
}
