use std::io;
use thiserror::Error;

/// Classification attached to every library error. Warnings are not errors;
/// degraded-but-continuing conditions are reported through the `log` crate
/// instead of failing the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// OS, I/O or allocation failure.
    System,
    /// The caller violated a documented precondition.
    Usage,
    /// A numerical failure (singular matrix, non-convergence, tolerance violation).
    Math,
    /// Degraded but continuing. Conditions of this category never fail a
    /// call; they are reported through `log::warn!`.
    Warning,
    /// An internal invariant failed. This is a bug in the library.
    Internal,
}

#[derive(Error, Debug)]
pub enum GridError {
    #[error("The frequency vector must not be empty")]
    Empty,
    #[error("The frequency vector must be strictly increasing (violated at index {0})")]
    NotIncreasing(usize),
    #[error("The frequency and value vectors must have the same length ({0} vs {1})")]
    MismatchedLength(usize, usize),
}

#[derive(Error, Debug)]
pub enum ParameterError {
    #[error("The parameter handle {0} does not exist")]
    UnknownHandle(u32),
    #[error("The parameter handle {0} is not an unknown or correlated parameter")]
    NotUnknown(u32),
    #[error("The correlation tolerance must be larger than 0 (got {0})")]
    BadTolerance(f64),
    #[error("{0}")]
    Grid(#[from] GridError),
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("The conversion {0} -> {1} is not defined")]
    Undefined(String, String),
    #[error("{0}")]
    Grid(#[from] GridError),
    #[error("The cell (frequency {findex}, row {row}, column {column}) is out of bounds for a {rows}x{columns} container with {count} frequencies")]
    OutOfBounds {
        findex: usize,
        row: usize,
        column: usize,
        rows: usize,
        columns: usize,
        count: usize,
    },
    #[error("The {0} parameters are only defined for 2x2 matrices (got {1}x{2})")]
    NotTwoPort(String, usize, usize),
    #[error("The {0} matrix must be square (got {1}x{2})")]
    NotSquare(String, usize, usize),
    #[error("A singular matrix was encountered while converting {0} -> {1}")]
    Singular(String, String),
    #[error("The reference impedance of port {0} must have a non-zero real part")]
    BadReferenceImpedance(usize),
    #[error("The reference impedance vector must have {0} entries (got {1})")]
    MismatchedPorts(usize, usize),
}

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("The {0} error-term type requires as many rows as columns (got {1}x{2})")]
    NotSquare(String, usize, usize),
    #[error("The dimensions must be at least 1x1")]
    EmptyDimensions,
    #[error("{0}")]
    Grid(#[from] GridError),
    #[error("{0}")]
    Parameter(#[from] ParameterError),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
    #[error("The VNA port {0} is out of range (the calibration has {1} ports)")]
    PortOutOfRange(usize, usize),
    #[error("The same VNA port {0} was mapped twice for one standard")]
    DuplicatePort(usize),
    #[error("The standard has {0} measurement matrices but the calibration has {1} frequencies")]
    MismatchedFrequencyCount(usize, usize),
    #[error("The measurement matrix at index {0} must be {1}x{2} (got {3}x{4})")]
    MismatchedMeasurement(usize, usize, usize, usize, usize),
    #[error("Leakage measurements require an error-term type with leakage terms ({0} has none)")]
    LeakageNotSupported(String),
    #[error("The leakage cell ({0},{1}) must be off-diagonal")]
    DiagonalLeakage(usize, usize),
    #[error("No calibration standard was added before solving")]
    NoStandards,
    #[error("The builder was already solved")]
    AlreadySolved,
    #[error("The calibration system is underdetermined at frequency index {findex} (deficient terms: {columns:?})")]
    Underdetermined { findex: usize, columns: Vec<usize> },
    #[error("The iterative solver did not converge at frequency index {0} after {1} iterations")]
    NonConvergence(usize, usize),
    #[error("The Jacobian became singular at frequency index {0}")]
    SingularJacobian(usize),
    #[error(
        "The correlated parameter {handle} deviates from its reference by {deviation:e} \
         at frequency index {findex} (tolerance {tolerance:e})"
    )]
    CorrelationViolated {
        handle: u32,
        findex: usize,
        deviation: f64,
        tolerance: f64,
    },
    #[error("The frequency {0} is outside the calibrated range [{1}, {2}]")]
    OutOfRange(f64, f64, f64),
    #[error("The incident-wave matrix is singular at frequency index {0}")]
    SingularIncidentWave(usize),
    #[error("The error-term model could not be inverted at frequency index {0}")]
    NotInvertible(usize),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Cannot access the file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file contents at line {0}: {1}")]
    Parse(usize, String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Calibration(#[from] CalibrationError),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
}

impl GridError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Usage
    }
}

impl ParameterError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Usage
    }
}

impl ConversionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConversionError::Singular(_, _) => ErrorCategory::Math,
            _ => ErrorCategory::Usage,
        }
    }
}

impl CalibrationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CalibrationError::Underdetermined { .. }
            | CalibrationError::NonConvergence(_, _)
            | CalibrationError::SingularJacobian(_)
            | CalibrationError::CorrelationViolated { .. }
            | CalibrationError::OutOfRange(_, _, _)
            | CalibrationError::SingularIncidentWave(_)
            | CalibrationError::NotInvertible(_) => ErrorCategory::Math,
            CalibrationError::Conversion(e) => e.category(),
            CalibrationError::Internal(_) => ErrorCategory::Internal,
            _ => ErrorCategory::Usage,
        }
    }
}

impl FileError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FileError::Io(_) => ErrorCategory::System,
            FileError::Calibration(e) => e.category(),
            FileError::Conversion(e) => e.category(),
            _ => ErrorCategory::Usage,
        }
    }
}
