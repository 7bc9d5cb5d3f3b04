use nalgebra::DMatrix;
use num_complex::Complex64;

/// Generate `n` linearly spaced values between `start` and `end` (inclusive).
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Check that a frequency vector is non-empty and strictly increasing.
pub(crate) fn check_frequency_vector(frequencies: &[f64]) -> Result<(), crate::error::GridError> {
    if frequencies.is_empty() {
        return Err(crate::error::GridError::Empty);
    }
    for (i, pair) in frequencies.windows(2).enumerate() {
        if pair[1] <= pair[0] {
            return Err(crate::error::GridError::NotIncreasing(i + 1));
        }
    }
    Ok(())
}

/// Compare two complex numbers within an absolute tolerance.
#[allow(dead_code)]
pub(crate) fn assert_complex_eq(calculated: Complex64, expected: Complex64, tolerance: f64) {
    if (calculated - expected).norm() > tolerance {
        panic!(
            r#"assertion failed:
                actual: `{calculated:?}`,
                expected: `{expected:?}` (tolerance {tolerance:e})"#,
        )
    }
}

/// Compare two complex matrices within an absolute tolerance.
#[allow(dead_code)]
pub(crate) fn assert_matrix_eq(calculated: &DMatrix<Complex64>, expected: &DMatrix<Complex64>, tolerance: f64) {
    assert_eq!(calculated.shape(), expected.shape(), "matrix shapes differ");
    for i in 0..calculated.nrows() {
        for j in 0..calculated.ncols() {
            if (calculated[(i, j)] - expected[(i, j)]).norm() > tolerance {
                panic!(
                    r#"assertion failed on cell ({i},{j}):
                    actual: `{:?}`,
                    expected: `{:?}` (tolerance {tolerance:e})"#,
                    calculated[(i, j)],
                    expected[(i, j)],
                )
            }
        }
    }
}
