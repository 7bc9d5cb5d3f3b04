//! End-to-end calibration scenarios: synthetic error models, simulated
//! standard measurements, solve, and apply.

use nalgebra::DMatrix;
use num_complex::Complex64;
use std::f64::consts::PI;

use vnacal::{
    linspace, BlockKind, CalType, Calibration, CalibrationBuilder, CalibrationError, Layout, ParameterId,
    ParameterRegistry, ReferenceImpedance,
};

fn c(re: f64, im: f64) -> Complex64 {
    Complex64::new(re, im)
}

fn put(terms: &mut [Complex64], layout: &Layout, kind: BlockKind, col: Option<usize>, i: usize, j: usize, v: Complex64) {
    let block = layout.block(kind, col).unwrap();
    terms[block.term_index(i, j).unwrap()] = v;
}

/// Synthetic, normalised truth terms for every supported type (2x2).
fn truth_terms(cal_type: CalType) -> Vec<Complex64> {
    let layout = Layout::new(cal_type, 2, 2).unwrap();
    let mut terms = vec![c(0.0, 0.0); layout.terms_per_frequency()];
    match cal_type {
        CalType::T8 | CalType::TE10 | CalType::U8 | CalType::UE10 => {
            let (s, i, x, m) = if cal_type.t_family() {
                (BlockKind::Ts, BlockKind::Ti, BlockKind::Tx, BlockKind::Tm)
            } else {
                (BlockKind::Us, BlockKind::Ui, BlockKind::Ux, BlockKind::Um)
            };
            put(&mut terms, &layout, s, None, 0, 0, c(1.05, 0.02));
            put(&mut terms, &layout, s, None, 1, 1, c(0.97, -0.03));
            put(&mut terms, &layout, i, None, 0, 0, c(0.03, 0.01));
            put(&mut terms, &layout, i, None, 1, 1, c(-0.02, 0.02));
            put(&mut terms, &layout, x, None, 0, 0, c(0.01, -0.02));
            put(&mut terms, &layout, x, None, 1, 1, c(0.02, 0.01));
            put(&mut terms, &layout, m, None, 0, 0, c(1.0, 0.0));
            put(&mut terms, &layout, m, None, 1, 1, c(1.04, -0.05));
            if cal_type.has_leakage_block() {
                put(&mut terms, &layout, BlockKind::El, None, 0, 1, c(0.002, -0.001));
                put(&mut terms, &layout, BlockKind::El, None, 1, 0, c(-0.0015, 0.0005));
            }
        }
        CalType::T16 | CalType::U16 => {
            let (s, i, x, m) = if cal_type.t_family() {
                (BlockKind::Ts, BlockKind::Ti, BlockKind::Tx, BlockKind::Tm)
            } else {
                (BlockKind::Us, BlockKind::Ui, BlockKind::Ux, BlockKind::Um)
            };
            let ts = [c(1.05, 0.02), c(0.015, -0.01), c(0.02, 0.01), c(0.97, -0.03)];
            let ti = [c(0.03, 0.01), c(0.004, 0.002), c(-0.003, 0.001), c(-0.02, 0.02)];
            let tx = [c(0.01, -0.02), c(0.003, 0.002), c(-0.002, 0.004), c(0.02, 0.01)];
            let tm = [c(1.0, 0.0), c(0.012, -0.008), c(-0.01, 0.006), c(1.04, -0.05)];
            for (block, values) in [(s, ts), (i, ti), (x, tx), (m, tm)] {
                for (cell, &value) in values.iter().enumerate() {
                    put(&mut terms, &layout, block, None, cell / 2, cell % 2, value);
                }
            }
        }
        CalType::UE14 => {
            for col in 0..2 {
                let detune = 0.01 * col as f64;
                put(&mut terms, &layout, BlockKind::Us, Some(col), 0, 0, c(1.02 + detune, 0.03));
                put(&mut terms, &layout, BlockKind::Us, Some(col), 1, 1, c(0.96, -0.02 + detune));
                // Off-diagonal offsets live in the leakage block, so only
                // the driven-port entry of ui is populated.
                put(&mut terms, &layout, BlockKind::Ui, Some(col), col, 0, c(0.03, 0.01 + detune));
                put(&mut terms, &layout, BlockKind::Ux, Some(col), 0, 0, c(0.015, -0.01 - detune));
                put(&mut terms, &layout, BlockKind::Ux, Some(col), 1, 1, c(0.02, 0.005));
                put(&mut terms, &layout, BlockKind::Um, Some(col), 0, 0, c(1.0, 0.0));
            }
            put(&mut terms, &layout, BlockKind::El, None, 0, 1, c(0.002, -0.001));
            put(&mut terms, &layout, BlockKind::El, None, 1, 0, c(-0.0015, 0.0005));
        }
        CalType::E12 => {
            for col in 0..2 {
                let detune = 0.01 * col as f64;
                let other = 1 - col;
                put(&mut terms, &layout, BlockKind::El, Some(col), col, 0, c(0.02 + detune, 0.01));
                put(&mut terms, &layout, BlockKind::El, Some(col), other, 0, c(0.001, -0.0005 - detune));
                put(&mut terms, &layout, BlockKind::Er, Some(col), 0, 0, c(0.98, 0.04 + detune));
                put(&mut terms, &layout, BlockKind::Er, Some(col), 1, 0, c(1.03, -0.02));
                put(&mut terms, &layout, BlockKind::Em, Some(col), 0, 0, c(0.03, -0.01 + detune));
                put(&mut terms, &layout, BlockKind::Em, Some(col), 1, 0, c(-0.02, 0.02));
            }
        }
    }
    terms
}

fn truth_calibration(cal_type: CalType, frequencies: &[f64]) -> Calibration {
    let terms = truth_terms(cal_type);
    Calibration::from_parts(
        "truth",
        cal_type,
        2,
        2,
        frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        vec![terms; frequencies.len()],
    )
    .unwrap()
}

fn simulate_all(cal: &Calibration, s: &DMatrix<Complex64>) -> Vec<DMatrix<Complex64>> {
    (0..cal.frequency_count())
        .map(|findex| cal.simulate_measurement(findex, s).unwrap())
        .collect()
}

fn through_s() -> DMatrix<Complex64> {
    DMatrix::from_row_slice(2, 2, &[c(0.0, 0.0), c(1.0, 0.0), c(1.0, 0.0), c(0.0, 0.0)])
}

fn line_s(g: Complex64) -> DMatrix<Complex64> {
    DMatrix::from_row_slice(2, 2, &[c(0.0, 0.0), g, g, c(0.0, 0.0)])
}

fn reflect_s(g1: Complex64, g2: Complex64) -> DMatrix<Complex64> {
    DMatrix::from_row_slice(2, 2, &[g1, c(0.0, 0.0), c(0.0, 0.0), g2])
}

fn assert_terms_close(solved: &Calibration, truth: &Calibration, tolerance: f64) {
    for findex in 0..truth.frequency_count() {
        let solved_terms = solved.terms(findex).unwrap();
        let truth_terms = truth.terms(findex).unwrap();
        assert_eq!(solved_terms.len(), truth_terms.len());
        for (t, (a, b)) in solved_terms.iter().zip(truth_terms).enumerate() {
            assert!(
                (a - b).norm() <= tolerance * b.norm().max(1.0),
                "term {t} at frequency {findex}: solved {a:?}, truth {b:?}"
            );
        }
    }
}

/// Add the Silvonen-style known set {through, line, SS, OS, OM, MO}.
fn add_known_set(builder: &mut CalibrationBuilder, registry_line: ParameterId, truth: &Calibration, g: Complex64) {
    let open = ParameterId::OPEN;
    let short = ParameterId::SHORT;
    let matched = ParameterId::MATCH;
    builder.add_through(1, 2, &simulate_all(truth, &through_s())).unwrap();
    builder
        .add_line(1, 2, registry_line, &simulate_all(truth, &line_s(g)))
        .unwrap();
    let pairs = [
        (short, short, c(-1.0, 0.0), c(-1.0, 0.0)),
        (open, short, c(1.0, 0.0), c(-1.0, 0.0)),
        (open, matched, c(1.0, 0.0), c(0.0, 0.0)),
        (matched, open, c(0.0, 0.0), c(1.0, 0.0)),
    ];
    for (p1, p2, g1, g2) in pairs {
        builder
            .add_double_reflect(1, 2, p1, p2, &simulate_all(truth, &reflect_s(g1, g2)))
            .unwrap();
    }
}

#[test]
fn solve_recovers_error_terms_for_every_type() {
    let frequencies = [1e9, 2e9];
    let g = c(0.3, -0.9);
    for cal_type in [
        CalType::T8,
        CalType::U8,
        CalType::TE10,
        CalType::UE10,
        CalType::T16,
        CalType::U16,
        CalType::UE14,
        CalType::E12,
    ] {
        let truth = truth_calibration(cal_type, &frequencies);
        let mut registry = ParameterRegistry::new();
        let line = registry.scalar(g);
        let mut builder = CalibrationBuilder::new(&mut registry, cal_type, 2, 2, &frequencies).unwrap();
        add_known_set(&mut builder, line, &truth, g);
        let solved = builder.solve(&format!("{cal_type}")).unwrap();
        assert_terms_close(&solved, &truth, 1e-8);
        for &rms in solved.residual_rms() {
            assert!(rms < 1e-10, "{cal_type} residual {rms}");
        }

        // Round trip: simulated DUT measurements recover the DUT.
        let dut = DMatrix::from_row_slice(2, 2, &[c(0.2, -0.1), c(0.6, 0.3), c(0.55, -0.2), c(0.1, 0.25)]);
        let measurements = simulate_all(&truth, &dut);
        let recovered = solved.apply(&frequencies, &measurements).unwrap();
        for findex in 0..frequencies.len() {
            let m = recovered.matrix(findex).unwrap();
            for i in 0..2 {
                for j in 0..2 {
                    assert!(
                        (m[(i, j)] - dut[(i, j)]).norm() < 1e-8,
                        "{cal_type} cell ({i},{j}): {:?} vs {:?}",
                        m[(i, j)],
                        dut[(i, j)]
                    );
                }
            }
        }
    }
}

/// Silvonen sequence {T, D, SS, OS, OM, MO} for the 16-term models over two
/// frequencies (seed scenario f).
#[test]
fn silvonen_sequence_t16_u16() {
    let frequencies = [1e9, 2e9];
    for cal_type in [CalType::T16, CalType::U16] {
        let truth = truth_calibration(cal_type, &frequencies);
        let mut registry = ParameterRegistry::new();
        let line = registry.scalar(c(0.3, -0.9));
        let mut builder = CalibrationBuilder::new(&mut registry, cal_type, 2, 2, &frequencies).unwrap();
        add_known_set(&mut builder, line, &truth, c(0.3, -0.9));
        let solved = builder.solve("silvonen").unwrap();
        for &rms in solved.residual_rms() {
            assert!(rms < 1e-10);
        }
        assert_terms_close(&solved, &truth, 1e-8);
    }
}

/// Error boxes of the TRL seed scenario: shunt capacitor at port 1, series
/// inductor at port 2, as normalised T-form terms.
fn parasitic_terms(f: f64) -> Vec<Complex64> {
    let z0 = 50.0;
    let omega = 2.0 * PI * f;
    // Shunt capacitor, normalised admittance y = j omega C z0.
    let y = c(0.0, omega * 265.258e-15 * z0);
    let a11 = -y / (y + 2.0);
    let a21 = 2.0 / (y + 2.0);
    let box_a = (a11, a21, a21, a11);
    // Series inductor, normalised impedance z = j omega L / z0.
    let z = c(0.0, omega * 663.146e-12 / z0);
    let b11 = z / (z + 2.0);
    let b21 = 2.0 / (z + 2.0);
    let box_b = (b11, b21, b21, b11);

    // M = D1 + D2 S (I - D4 S)^-1 D3 maps onto diagonal T-form blocks.
    let terms_of = |(s11, s21, s12, s22): (Complex64, Complex64, Complex64, Complex64)| {
        let det = s11 * s22 - s12 * s21;
        // (ts, ti, tx, tm) for one port's error box.
        (-det / s21, s11 / s21, -s22 / s21, 1.0 / s21)
    };
    let (ts1, ti1, tx1, tm1) = terms_of(box_a);
    let (ts2, ti2, tx2, tm2) = terms_of(box_b);
    // Normalise to tm[0] = 1; the model is invariant under a common scale.
    let scale = tm1;
    let layout = Layout::new(CalType::TE10, 2, 2).unwrap();
    let mut terms = vec![c(0.0, 0.0); layout.terms_per_frequency()];
    put(&mut terms, &layout, BlockKind::Ts, None, 0, 0, ts1 / scale);
    put(&mut terms, &layout, BlockKind::Ts, None, 1, 1, ts2 / scale);
    put(&mut terms, &layout, BlockKind::Ti, None, 0, 0, ti1 / scale);
    put(&mut terms, &layout, BlockKind::Ti, None, 1, 1, ti2 / scale);
    put(&mut terms, &layout, BlockKind::Tx, None, 0, 0, tx1 / scale);
    put(&mut terms, &layout, BlockKind::Tx, None, 1, 1, tx2 / scale);
    put(&mut terms, &layout, BlockKind::Tm, None, 0, 0, tm1 / scale);
    put(&mut terms, &layout, BlockKind::Tm, None, 1, 1, tm2 / scale);
    terms
}

fn parasitic_calibration(frequencies: &[f64]) -> Calibration {
    let terms: Vec<Vec<Complex64>> = frequencies.iter().map(|&f| parasitic_terms(f)).collect();
    Calibration::from_parts(
        "parasitic",
        CalType::TE10,
        2,
        2,
        frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        terms,
    )
    .unwrap()
}

/// Seed scenario a: through / double-short / half-wave delay, 50 points
/// from 4 to 32 GHz, all standards known.
#[test]
fn trl_with_known_standards_recovers_parasitics() {
    let _ = env_logger::builder().is_test(true).try_init();
    let frequencies = linspace(4e9, 32e9, 50);
    let truth = parasitic_calibration(&frequencies);

    // Half-wavelength delay at 18 GHz.
    let delay: Vec<Complex64> = frequencies
        .iter()
        .map(|&f| Complex64::from_polar(1.0, -PI * f / 18e9))
        .collect();
    let delay_measurements: Vec<DMatrix<Complex64>> = (0..frequencies.len())
        .map(|findex| truth.simulate_measurement(findex, &line_s(delay[findex])).unwrap())
        .collect();

    let mut registry = ParameterRegistry::new();
    let delay_parameter = registry.vector(&frequencies, &delay).unwrap();
    let mut builder = CalibrationBuilder::new(&mut registry, CalType::TE10, 2, 2, &frequencies).unwrap();
    builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
    builder
        .add_double_reflect(
            1,
            2,
            ParameterId::SHORT,
            ParameterId::SHORT,
            &simulate_all(&truth, &reflect_s(c(-1.0, 0.0), c(-1.0, 0.0))),
        )
        .unwrap();
    builder.add_line(1, 2, delay_parameter, &delay_measurements).unwrap();
    let solved = builder.solve("tsd").unwrap();

    for findex in 0..frequencies.len() {
        let solved_terms = solved.terms(findex).unwrap();
        let truth_terms = truth.terms(findex).unwrap();
        for (a, b) in solved_terms.iter().zip(truth_terms) {
            assert!((a - b).norm() < 1e-6, "frequency {findex}: {a:?} vs {b:?}");
        }
    }

    // Seed scenario e: apply at an interior frequency via interpolation.
    let f_apply = 10e9;
    let truth_at_10 = Calibration::from_parts(
        "truth10",
        CalType::TE10,
        2,
        2,
        &[f_apply],
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        vec![parasitic_terms(f_apply)],
    )
    .unwrap();
    let dut = DMatrix::from_row_slice(2, 2, &[c(0.2, 0.1), c(0.7, -0.2), c(0.7, -0.2), c(0.15, 0.05)]);
    let measurement = truth_at_10.simulate_measurement(0, &dut).unwrap();
    let recovered = solved.apply(&[f_apply], &[measurement]).unwrap();
    let m = recovered.matrix(0).unwrap();
    for i in 0..2 {
        for j in 0..2 {
            assert!(
                (m[(i, j)] - dut[(i, j)]).norm() < 1e-5,
                "cell ({i},{j}): {:?} vs {:?}",
                m[(i, j)],
                dut[(i, j)]
            );
        }
    }
}

/// True TRL: the reflect and the line transmission are unknown and solved
/// along with the error terms.
#[test]
fn trl_with_unknown_reflect_and_line() {
    let frequencies = [4e9, 11e9, 18e9, 25e9, 32e9];
    let truth_terms: Vec<Vec<Complex64>> = frequencies
        .iter()
        .map(|&f| {
            let all = parasitic_terms(f);
            // The T8 model is the TE10 one without the leakage block.
            all[..8].to_vec()
        })
        .collect();
    let truth = Calibration::from_parts(
        "truth",
        CalType::T8,
        2,
        2,
        &frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        truth_terms,
    )
    .unwrap();

    let gamma_truth = c(-0.98, -0.1);
    // Quarter-wavelength (at 18 GHz), slightly lossy line.
    let line_truth: Vec<Complex64> = frequencies
        .iter()
        .map(|&f| Complex64::from_polar(0.98, -PI * f / 36e9))
        .collect();

    let mut registry = ParameterRegistry::new();
    let gamma = registry.unknown(ParameterId::SHORT).unwrap();
    let line = registry.unknown(ParameterId::MATCH).unwrap();

    let line_measurements: Vec<DMatrix<Complex64>> = (0..frequencies.len())
        .map(|findex| truth.simulate_measurement(findex, &line_s(line_truth[findex])).unwrap())
        .collect();

    let solved = {
        let mut builder = CalibrationBuilder::new(&mut registry, CalType::T8, 2, 2, &frequencies).unwrap();
        builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
        builder
            .add_double_reflect(1, 2, gamma, gamma, &simulate_all(&truth, &reflect_s(gamma_truth, gamma_truth)))
            .unwrap();
        builder.add_line(1, 2, line, &line_measurements).unwrap();
        builder.solve("trl").unwrap()
    };
    assert_terms_close(&solved, &truth, 1e-6);

    for (findex, &f) in frequencies.iter().enumerate() {
        let solved_gamma = registry.value_at(gamma, f).unwrap();
        assert!((solved_gamma - gamma_truth).norm() < 1e-6, "gamma at {f}: {solved_gamma:?}");
        let solved_line = registry.value_at(line, f).unwrap();
        assert!((solved_line - line_truth[findex]).norm() < 1e-6, "line at {f}: {solved_line:?}");
    }
}

/// An unknown line too close to 180 degrees is dropped at that frequency;
/// corrupt data there must not contaminate the solution.
#[test]
fn degenerate_line_phase_is_excluded() {
    let _ = env_logger::builder().is_test(true).try_init();
    let frequencies = [9e9, 18e9, 27e9];
    let truth = parasitic_calibration(&frequencies);
    // Half-wave at 18 GHz: exactly 180 degrees at the middle frequency.
    let line_truth: Vec<Complex64> = frequencies
        .iter()
        .map(|&f| Complex64::from_polar(0.98, -PI * f / 18e9))
        .collect();

    let mut registry = ParameterRegistry::new();
    let guess = registry.vector(&frequencies, &line_truth).unwrap();
    let line = registry.unknown(guess).unwrap();

    let mut line_measurements: Vec<DMatrix<Complex64>> = (0..frequencies.len())
        .map(|findex| truth.simulate_measurement(findex, &line_s(line_truth[findex])).unwrap())
        .collect();
    // Corrupt the measurement at the degenerate frequency.
    line_measurements[1] = DMatrix::from_row_slice(2, 2, &[c(9.0, 9.0), c(-9.0, 1.0), c(3.0, -7.0), c(5.0, 5.0)]);

    let mut builder = CalibrationBuilder::new(&mut registry, CalType::TE10, 2, 2, &frequencies).unwrap();
    add_known_set(&mut builder, ParameterId::OPEN, &truth, c(1.0, 0.0));
    // Replace the known unity line from the set with nothing; instead add
    // the unknown line under test.
    builder.add_line(1, 2, line, &line_measurements).unwrap();
    let solved = builder.solve("excluded-line").unwrap();
    assert_terms_close(&solved, &truth, 1e-6);
}

#[test]
fn underdetermined_system_is_reported() {
    let frequencies = [1e9];
    let truth = truth_calibration(CalType::T8, &frequencies);
    let mut registry = ParameterRegistry::new();
    let mut builder = CalibrationBuilder::new(&mut registry, CalType::T8, 2, 2, &frequencies).unwrap();
    builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
    match builder.solve("underdetermined") {
        Err(CalibrationError::Underdetermined { findex, columns }) => {
            assert_eq!(findex, 0);
            assert!(!columns.is_empty());
        }
        other => panic!("expected Underdetermined, got {other:?}"),
    }
}

#[test]
fn correlated_parameter_violation_is_detected() {
    let frequencies = [4e9, 11e9];
    let truth_terms: Vec<Vec<Complex64>> = frequencies.iter().map(|&f| parasitic_terms(f)[..8].to_vec()).collect();
    let truth = Calibration::from_parts(
        "truth",
        CalType::T8,
        2,
        2,
        &frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        truth_terms,
    )
    .unwrap();

    let gamma_truth = c(-0.98, -0.1);
    let mut registry = ParameterRegistry::new();
    // Claimed to stay within 0.05 of an ideal short; the data disagrees by
    // about 0.1.
    let gamma = registry.correlated(ParameterId::SHORT, 0.05).unwrap();
    let line = registry.scalar(Complex64::from_polar(0.98, -1.2));

    let mut builder = CalibrationBuilder::new(&mut registry, CalType::T8, 2, 2, &frequencies).unwrap();
    builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
    builder
        .add_double_reflect(1, 2, gamma, gamma, &simulate_all(&truth, &reflect_s(gamma_truth, gamma_truth)))
        .unwrap();
    builder
        .add_line(
            1,
            2,
            line,
            &simulate_all(&truth, &line_s(Complex64::from_polar(0.98, -1.2))),
        )
        .unwrap();
    match builder.solve("violated") {
        Err(CalibrationError::CorrelationViolated { tolerance, deviation, .. }) => {
            assert_eq!(tolerance, 0.05);
            assert!(deviation > 0.05 && deviation < 0.2);
        }
        other => panic!("expected CorrelationViolated, got {other:?}"),
    }
}

#[test]
fn correlated_pair_of_unknowns_solves() {
    let frequencies = [4e9, 11e9];
    let truth_terms: Vec<Vec<Complex64>> = frequencies.iter().map(|&f| parasitic_terms(f)[..8].to_vec()).collect();
    let truth = Calibration::from_parts(
        "truth",
        CalType::T8,
        2,
        2,
        &frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        truth_terms,
    )
    .unwrap();

    let gamma_truth = c(-0.97, -0.05);
    let mut registry = ParameterRegistry::new();
    let gamma1 = registry.unknown(ParameterId::SHORT).unwrap();
    let gamma2 = registry.correlated(gamma1, 0.2).unwrap();
    let line = registry.scalar(Complex64::from_polar(0.98, -1.2));

    let solved = {
        let mut builder = CalibrationBuilder::new(&mut registry, CalType::T8, 2, 2, &frequencies).unwrap();
        builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
        builder
            .add_double_reflect(1, 2, gamma1, gamma2, &simulate_all(&truth, &reflect_s(gamma_truth, gamma_truth)))
            .unwrap();
        builder
            .add_line(
                1,
                2,
                line,
                &simulate_all(&truth, &line_s(Complex64::from_polar(0.98, -1.2))),
            )
            .unwrap();
        builder.solve("correlated").unwrap()
    };
    assert_terms_close(&solved, &truth, 1e-6);
    for &f in &frequencies {
        assert!((registry.value_at(gamma1, f).unwrap() - gamma_truth).norm() < 1e-6);
        assert!((registry.value_at(gamma2, f).unwrap() - gamma_truth).norm() < 1e-6);
    }
}

/// Reference counts drain back to zero once builders are gone.
#[test]
fn parameter_handles_drain_after_solve() {
    let frequencies = [4e9, 11e9];
    let truth_terms: Vec<Vec<Complex64>> = frequencies.iter().map(|&f| parasitic_terms(f)[..8].to_vec()).collect();
    let truth = Calibration::from_parts(
        "truth",
        CalType::T8,
        2,
        2,
        &frequencies,
        ReferenceImpedance::Scalar(c(50.0, 0.0)),
        truth_terms,
    )
    .unwrap();

    let mut registry = ParameterRegistry::new();
    let gamma = registry.unknown(ParameterId::SHORT).unwrap();
    let line = registry.scalar(Complex64::from_polar(0.98, -1.2));
    {
        let mut builder = CalibrationBuilder::new(&mut registry, CalType::T8, 2, 2, &frequencies).unwrap();
        builder.add_through(1, 2, &simulate_all(&truth, &through_s())).unwrap();
        builder
            .add_double_reflect(
                1,
                2,
                gamma,
                gamma,
                &simulate_all(&truth, &reflect_s(c(-0.98, -0.1), c(-0.98, -0.1))),
            )
            .unwrap();
        builder
            .add_line(
                1,
                2,
                line,
                &simulate_all(&truth, &line_s(Complex64::from_polar(0.98, -1.2))),
            )
            .unwrap();
        builder.solve("drain").unwrap();
    }
    // The solved value outlives the builder.
    assert!((registry.value_at(gamma, 4e9).unwrap() - c(-0.98, -0.1)).norm() < 1e-6);
    assert_eq!(registry.reference_count(gamma), Some(1));
    assert_eq!(registry.reference_count(line), Some(1));
    registry.release(gamma).unwrap();
    registry.release(line).unwrap();
    assert_eq!(registry.reference_count(gamma), None);
    assert_eq!(registry.reference_count(line), None);
}
