//! Vector network analyzer calibration and network-parameter library.
//!
//! The crate covers three tightly coupled jobs:
//!
//! 1. **Parameter algebra** ([`convert`], [`data`]): closed-form
//!    conversions between the S, T, U, Z, Y, H, G, A, B and Zin
//!    representations of a linear n-port under complex per-port reference
//!    impedances (power-wave convention), plus renormalisation to new
//!    references.
//! 2. **Calibration solving** ([`builder`], [`parameter`]): given raw
//!    measurements of known (or partially unknown) standards, recover the
//!    instrument's systematic error terms for one of the T8, U8, TE10,
//!    UE10, T16, U16, UE14 or E12 formulations. Unknown standards are
//!    solved along with the error terms.
//! 3. **Calibration application** ([`calibration`]): evaluate the solved
//!    error model at the measurement frequencies (spline interpolation
//!    between calibration points) and invert it to recover the true DUT
//!    S-parameters.
//!
//! Calibrations can be stored in `#VNACal` archive files ([`archive`]) and
//! network data exchanged as Touchstone v1/v2 ([`touchstone`]).
//!
//! ```no_run
//! use nalgebra::DMatrix;
//! use num_complex::Complex64;
//! use vnacal::{CalType, CalibrationBuilder, ParameterRegistry};
//!
//! # fn measurements() -> Vec<DMatrix<Complex64>> { unimplemented!() }
//! let frequencies: Vec<f64> = (0..50).map(|i| 4e9 + i as f64 * (28e9 / 49.0)).collect();
//! let mut registry = ParameterRegistry::new();
//! let mut builder = CalibrationBuilder::new(&mut registry, CalType::TE10, 2, 2, &frequencies)?;
//! builder.add_through(1, 2, &measurements())?;
//! let calibration = builder.solve("bench")?;
//! let dut = calibration.apply(&frequencies, &measurements())?;
//! # Ok::<(), vnacal::CalibrationError>(())
//! ```

pub mod archive;
pub mod builder;
pub mod calibration;
pub mod convert;
pub mod data;
pub mod error;
pub mod layout;
mod linalg;
pub mod parameter;
mod solver;
pub mod touchstone;
mod util;

pub use builder::CalibrationBuilder;
pub use calibration::Calibration;
pub use convert::{convert, renormalize, ParameterType};
pub use data::{NetworkData, ReferenceImpedance};
pub use error::{CalibrationError, ConversionError, ErrorCategory, FileError, GridError, ParameterError};
pub use layout::{BlockKind, CalType, Layout};
pub use linalg::{ComplexSpline, Spline};
pub use parameter::{ParameterId, ParameterRegistry};
pub use util::linspace;
