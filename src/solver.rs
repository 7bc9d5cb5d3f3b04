//! Per-frequency error-term solver.
//!
//! Every (standard, measurement) pair contributes rows that are linear in
//! the error terms and, when standards carry unknown parameters, bilinear in
//! (error terms, unknown values). Known-standard systems are solved directly
//! by least squares; systems with unknowns go through damped Gauss-Newton
//! (Levenberg-Marquardt) seeded either from the parameter guesses or, for
//! the through/reflect/line family, from the eigenvalues of the measured
//! line-through product.

use log::warn;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rayon::prelude::*;
use std::f64::consts::PI;

use crate::builder::{LeakageMeasurement, MeasurementData, Standard, StandardKind};
use crate::error::CalibrationError;
use crate::layout::{BlockKind, CalType, Layout};
use crate::linalg::{self, LstsqOutcome};
use crate::parameter::{ParameterId, ParameterRegistry};

/// Line standards are dropped at frequencies where their transmission phase
/// is within this angle of 0 or 180 degrees; an unknown line carries no
/// information there.
const LINE_PHASE_LIMIT: f64 = 10.0 * PI / 180.0;
/// Relative step-norm convergence criterion of the iterative solver.
const CONVERGENCE_TOLERANCE: f64 = 1e-9;
const MAX_ITERATIONS: usize = 100;
const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e10;

pub(crate) struct FrequencySolution {
    pub(crate) terms: Vec<Complex64>,
    pub(crate) unknowns: Vec<Complex64>,
    pub(crate) residual_rms: f64,
}

pub(crate) struct SolveOutcome {
    pub(crate) solutions: Vec<FrequencySolution>,
    pub(crate) unknown_ids: Vec<ParameterId>,
}

/// A resolved S-matrix entry: either a value or an index into the unknown
/// vector.
#[derive(Debug, Clone, Copy)]
enum SEntry {
    Known(Complex64),
    Unknown(usize),
}

impl SEntry {
    fn is_zero(&self) -> bool {
        matches!(self, SEntry::Known(v) if v.norm() == 0.0)
    }
}

struct ResolvedStandard<'a> {
    standard: &'a Standard,
    m: DMatrix<Complex64>,
    s: Vec<Vec<SEntry>>,
    excluded: bool,
    /// All off-diagonal entries are known zeros.
    diagonal_known: bool,
}

/// Map from solver variables to flat layout term indices.
struct VarMap {
    count: usize,
    /// Flat term index -> solver variable (None for pinned and leakage
    /// terms). Unused by E12, whose variables are not stored terms.
    evar_of_term: Vec<Option<usize>>,
    term_of_evar: Vec<usize>,
    /// Flat indices of normalisation terms fixed to one.
    pinned: Vec<usize>,
}

impl VarMap {
    fn new(layout: &Layout) -> Self {
        let n = layout.rows();
        if layout.cal_type() == CalType::E12 {
            // Per column: n alpha, n beta and one directivity variable.
            return Self {
                count: n * (2 * n + 1),
                evar_of_term: vec![None; layout.terms_per_frequency()],
                term_of_evar: vec![],
                pinned: vec![],
            };
        }
        let mut evar_of_term = vec![None; layout.terms_per_frequency()];
        let mut term_of_evar = vec![];
        let mut pinned = vec![];
        for block in layout.blocks() {
            match block.kind {
                BlockKind::El => continue,
                BlockKind::Tm | BlockKind::Um => {
                    // The first cell of the normalisation block is the unity
                    // reference; per-column um blocks are single cells and
                    // therefore fully pinned.
                    for t in block.offset..block.offset + block.len() {
                        if t == block.offset {
                            pinned.push(t);
                        } else {
                            evar_of_term[t] = Some(term_of_evar.len());
                            term_of_evar.push(t);
                        }
                    }
                }
                _ => {
                    for t in block.offset..block.offset + block.len() {
                        evar_of_term[t] = Some(term_of_evar.len());
                        term_of_evar.push(t);
                    }
                }
            }
        }
        Self {
            count: term_of_evar.len(),
            evar_of_term,
            term_of_evar,
            pinned,
        }
    }
}

/// One equation: residual
/// `r = sum_t ec[t] e_t + sum (t,m,c) c u_m e_t - rc - sum_m ru[m] u_m`.
struct Row {
    e_const: Vec<Complex64>,
    bilinear: Vec<(usize, usize, Complex64)>,
    rhs_const: Complex64,
    rhs_u: Vec<Complex64>,
}

impl Row {
    fn new(evars: usize, uvars: usize) -> Self {
        Self {
            e_const: vec![Complex64::new(0.0, 0.0); evars],
            bilinear: vec![],
            rhs_const: Complex64::new(0.0, 0.0),
            rhs_u: vec![Complex64::new(0.0, 0.0); uvars],
        }
    }

    /// Add `base * entry * e_t` for a solver variable.
    fn add_evar(&mut self, evar: usize, base: Complex64, entry: Option<SEntry>) {
        match entry {
            None => self.e_const[evar] += base,
            Some(SEntry::Known(v)) => self.e_const[evar] += base * v,
            Some(SEntry::Unknown(m)) => self.bilinear.push((evar, m, base)),
        }
    }

    /// Add `base * entry` for a term pinned to one (moves to the RHS).
    fn add_pinned(&mut self, base: Complex64, entry: Option<SEntry>) {
        match entry {
            None => self.rhs_const -= base,
            Some(SEntry::Known(v)) => self.rhs_const -= base * v,
            Some(SEntry::Unknown(m)) => self.rhs_u[m] -= base,
        }
    }

    fn residual(&self, e: &[Complex64], u: &[Complex64]) -> Complex64 {
        let mut r = -self.rhs_const;
        for (t, value) in self.e_const.iter().enumerate() {
            r += value * e[t];
        }
        for &(t, m, c) in &self.bilinear {
            r += c * u[m] * e[t];
        }
        for (m, value) in self.rhs_u.iter().enumerate() {
            r -= value * u[m];
        }
        r
    }

    /// Coefficient of `e_t` at the current unknowns.
    fn e_coefficient(&self, t: usize, u: &[Complex64]) -> Complex64 {
        let mut c = self.e_const[t];
        for &(bt, m, coeff) in &self.bilinear {
            if bt == t {
                c += coeff * u[m];
            }
        }
        c
    }

    /// Coefficient of `u_m` at the current error terms.
    fn u_coefficient(&self, m: usize, e: &[Complex64]) -> Complex64 {
        let mut c = -self.rhs_u[m];
        for &(t, bm, coeff) in &self.bilinear {
            if bm == m {
                c += coeff * e[t];
            }
        }
        c
    }

    /// Right-hand side at the current unknowns (for the linear solve).
    fn rhs(&self, u: &[Complex64]) -> Complex64 {
        let mut k = self.rhs_const;
        for (m, value) in self.rhs_u.iter().enumerate() {
            k += value * u[m];
        }
        k
    }
}

/// Solve the calibration over all frequencies.
pub(crate) fn solve(
    layout: &Layout,
    registry: &ParameterRegistry,
    frequencies: &[f64],
    standards: &[Standard],
    leakage: &[LeakageMeasurement],
) -> Result<SolveOutcome, CalibrationError> {
    // Unknown parameters in insertion order.
    let mut unknown_ids: Vec<ParameterId> = vec![];
    for standard in standards {
        for row in &standard.s {
            for &id in row {
                if registry.is_unknown(id)? && !unknown_ids.contains(&id) {
                    unknown_ids.push(id);
                }
            }
        }
    }
    let varmap = VarMap::new(layout);

    let solutions: Result<Vec<FrequencySolution>, CalibrationError> = frequencies
        .par_iter()
        .enumerate()
        .map(|(findex, &f)| solve_frequency(layout, registry, &varmap, &unknown_ids, standards, leakage, findex, f))
        .collect();
    let solutions = solutions?;

    // Correlated parameters are validated against their references before
    // anything is written back.
    for (m, &id) in unknown_ids.iter().enumerate() {
        if let Some((target, tolerance)) = registry.correlation(id) {
            for (findex, solution) in solutions.iter().enumerate() {
                let target_value = match unknown_ids.iter().position(|&t| t == target) {
                    Some(mt) => solution.unknowns[mt],
                    None => registry.value_at(target, frequencies[findex])?,
                };
                let deviation = (solution.unknowns[m] - target_value).norm();
                if deviation > tolerance {
                    return Err(CalibrationError::CorrelationViolated {
                        handle: id.0,
                        findex,
                        deviation,
                        tolerance,
                    });
                }
            }
        }
    }

    Ok(SolveOutcome {
        solutions,
        unknown_ids,
    })
}

#[allow(clippy::too_many_arguments)]
fn solve_frequency(
    layout: &Layout,
    registry: &ParameterRegistry,
    varmap: &VarMap,
    unknown_ids: &[ParameterId],
    standards: &[Standard],
    leakage: &[LeakageMeasurement],
    findex: usize,
    f: f64,
) -> Result<FrequencySolution, CalibrationError> {
    let n = layout.rows();
    let subtract_leakage = layout.cal_type().has_leakage_block() || layout.cal_type() == CalType::E12;

    // Resolve standards at this frequency.
    let mut resolved: Vec<ResolvedStandard> = Vec::with_capacity(standards.len());
    for standard in standards {
        let mut excluded = false;
        let m = match &standard.measurement {
            MeasurementData::M(m) => m[findex].clone(),
            MeasurementData::Ab { a, b } => match linalg::checked_inverse(&a[findex]) {
                Some(a_inv) => &b[findex] * a_inv,
                None => {
                    warn!("Incident-wave matrix singular at frequency index {findex}; standard skipped");
                    excluded = true;
                    DMatrix::zeros(layout.rows(), layout.columns())
                }
            },
        };
        let mut s = vec![vec![SEntry::Known(Complex64::new(0.0, 0.0)); n]; n];
        for i in 0..n {
            for j in 0..n {
                let id = standard.s[i][j];
                s[i][j] = match unknown_ids.iter().position(|&u| u == id) {
                    Some(m) => SEntry::Unknown(m),
                    None => SEntry::Known(registry.value_at(id, f)?),
                };
            }
        }
        let diagonal_known = (0..n).all(|i| (0..n).all(|j| i == j || s[i][j].is_zero()));
        resolved.push(ResolvedStandard {
            standard,
            m,
            s,
            excluded,
            diagonal_known,
        });
    }

    // Leakage estimate: mean of the explicit readings and of the measured
    // off-diagonal cells of standards with no transmission path.
    let mut el = DMatrix::<Complex64>::zeros(n, n);
    if subtract_leakage {
        let mut counts = DMatrix::<u32>::zeros(n, n);
        for measurement in leakage {
            el[(measurement.row, measurement.column)] += measurement.values[findex];
            counts[(measurement.row, measurement.column)] += 1;
        }
        for r in resolved.iter() {
            if !r.diagonal_known {
                continue;
            }
            for i in 0..n {
                for j in 0..n {
                    if i != j && r.standard.mask[i][j] {
                        el[(i, j)] += r.m[(i, j)];
                        counts[(i, j)] += 1;
                    }
                }
            }
        }
        let mut missing = false;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    if counts[(i, j)] > 0 {
                        el[(i, j)] /= Complex64::new(counts[(i, j)] as f64, 0.0);
                    } else {
                        missing = true;
                    }
                }
            }
        }
        if missing && findex == 0 {
            warn!("No leakage data for some off-diagonal cells; assuming zero leakage");
        }
        for r in resolved.iter_mut() {
            for i in 0..n {
                for j in 0..n {
                    if i != j && r.standard.mask[i][j] {
                        r.m[(i, j)] -= el[(i, j)];
                    }
                }
            }
        }
    }

    // Exclude standards whose full measurement matrix is singular.
    for r in resolved.iter_mut() {
        if r.excluded || !r.standard.mask.iter().flatten().all(|&m| m) {
            continue;
        }
        if r.diagonal_known {
            // Reflection-only standards keep feeding the leakage estimate
            // and their diagonal equations even with a near-zero matrix.
            continue;
        }
        let norm = linalg::inf_norm(&r.m);
        if linalg::is_singular(r.m.clone().lu().determinant(), norm, n) {
            warn!("Singular measurement matrix at frequency index {findex}; standard skipped");
            r.excluded = true;
        }
    }

    // Initial unknown values, seeded from the guesses.
    let mut u: Vec<Complex64> = unknown_ids
        .iter()
        .map(|&id| registry.guess_at(id, f))
        .collect::<Result<_, _>>()?;

    // Phase-degeneracy exclusion for lines with unknown transmission. A
    // known line stays usable at any phase.
    for r in resolved.iter_mut() {
        if r.excluded || r.standard.kind != StandardKind::Line {
            continue;
        }
        let Some(line_id) = r.standard.line_parameter else {
            continue;
        };
        let Some(m) = unknown_ids.iter().position(|&id| id == line_id) else {
            continue;
        };
        let g = u[m];
        if g.norm() < 1e-9 {
            continue;
        }
        let phase = g.arg().rem_euclid(PI);
        if phase.min(PI - phase) < LINE_PHASE_LIMIT {
            warn!(
                "Line standard too close to a multiple of 180 degrees at frequency index {findex}; \
                 excluded at this frequency"
            );
            r.excluded = true;
        }
    }

    // Direct through/reflect/line seed for the two-port transfer types.
    if !unknown_ids.is_empty() && n == 2 && !layout.cal_type().full_blocks() && !layout.cal_type().per_column() {
        trl_seed(&resolved, &mut u);
    }

    // Assemble the equations.
    let mut rows: Vec<Row> = vec![];
    for r in &resolved {
        if r.excluded {
            continue;
        }
        emit_standard(layout, varmap, r, unknown_ids.len(), &mut rows);
    }

    // Correlation penalties couple pairs of unknowns declared to be near
    // each other. A correlation against a known parameter only seeds the
    // guess; it is validated after the solve instead of weighted in.
    for (m, &id) in unknown_ids.iter().enumerate() {
        if let Some((target, tolerance)) = registry.correlation(id) {
            if let Some(mt) = unknown_ids.iter().position(|&t| t == target) {
                let mut row = Row::new(varmap.count, unknown_ids.len());
                let weight = Complex64::new(1.0 / tolerance, 0.0);
                row.rhs_u[m] = -weight;
                row.rhs_u[mt] = weight;
                rows.push(row);
            }
        }
    }

    let (e, u, residual_rms) = if unknown_ids.is_empty() {
        let (e, rms) = solve_linear(varmap, &rows, &u, findex)?;
        (e, u, rms)
    } else {
        solve_iterative(varmap, &rows, u, findex)?
    };

    // Scatter the solution into the flat layout vector.
    let mut terms = vec![Complex64::new(0.0, 0.0); layout.terms_per_frequency()];
    if layout.cal_type() == CalType::E12 {
        e12_terms(layout, &e, &el, findex, &mut terms)?;
    } else {
        for &t in &varmap.pinned {
            terms[t] = Complex64::new(1.0, 0.0);
        }
        for (evar, &t) in varmap.term_of_evar.iter().enumerate() {
            terms[t] = e[evar];
        }
        if let Some(block) = layout.block(BlockKind::El, None) {
            for i in 0..n {
                for j in 0..n {
                    if let Some(t) = block.term_index(i, j) {
                        terms[t] = el[(i, j)];
                    }
                }
            }
        }
    }

    Ok(FrequencySolution {
        terms,
        unknowns: u,
        residual_rms,
    })
}

/// Emit the equations of one standard.
fn emit_standard(layout: &Layout, varmap: &VarMap, r: &ResolvedStandard, uvars: usize, rows: &mut Vec<Row>) {
    let n = layout.rows();
    let ctype = layout.cal_type();
    let skip_off_diagonal = r.diagonal_known && matches!(ctype, CalType::TE10 | CalType::UE10 | CalType::E12);

    if ctype.per_column() {
        for c in 0..n {
            for i in 0..n {
                if skip_off_diagonal && i != c {
                    continue;
                }
                // The equation needs m[i][c] and the column cells multiplied
                // by non-zero S entries.
                if !r.standard.mask[i][c] {
                    continue;
                }
                if (0..n).any(|d| !r.s[i][d].is_zero() && !r.standard.mask[d][c]) {
                    continue;
                }
                let row = match ctype {
                    CalType::UE14 => emit_ue14(layout, varmap, r, uvars, c, i),
                    CalType::E12 => emit_e12(r, varmap, uvars, n, c, i),
                    _ => unreachable!(),
                };
                push_row(rows, row);
            }
        }
        return;
    }

    let t_family = ctype.t_family();
    for i in 0..n {
        for j in 0..n {
            if skip_off_diagonal && i != j {
                continue;
            }
            let measured = if ctype.full_blocks() {
                // Full blocks touch a whole measurement row (T) or column (U).
                if t_family {
                    (0..n).all(|k| r.standard.mask[i][k])
                } else {
                    (0..n).all(|k| r.standard.mask[k][j])
                }
            } else if t_family {
                r.standard.mask[i][j] && (0..n).all(|k| k == j || r.s[k][j].is_zero() || r.standard.mask[i][k])
            } else {
                r.standard.mask[i][j] && (0..n).all(|d| d == i || r.s[i][d].is_zero() || r.standard.mask[d][j])
            };
            if !measured {
                continue;
            }
            let row = if t_family {
                emit_t(layout, varmap, r, uvars, i, j)
            } else {
                emit_u(layout, varmap, r, uvars, i, j)
            };
            push_row(rows, row);
        }
    }
}

fn push_row(rows: &mut Vec<Row>, row: Row) {
    let zero = row.e_const.iter().all(|c| c.norm() == 0.0)
        && row.bilinear.is_empty()
        && row.rhs_const.norm() == 0.0
        && row.rhs_u.iter().all(|c| c.norm() == 0.0);
    if !zero {
        rows.push(row);
    }
}

/// Route a term coefficient to its solver variable or the pinned unity.
fn add_term(row: &mut Row, varmap: &VarMap, term: usize, base: Complex64, entry: Option<SEntry>) {
    match varmap.evar_of_term[term] {
        Some(evar) => row.add_evar(evar, base, entry),
        None => {
            if varmap.pinned.contains(&term) {
                row.add_pinned(base, entry);
            }
        }
    }
}

/// T family equation (i, j): `M (Tx S + Tm) - Ts S - Ti = 0`.
fn emit_t(layout: &Layout, varmap: &VarMap, r: &ResolvedStandard, uvars: usize, i: usize, j: usize) -> Row {
    let n = layout.rows();
    let mut row = Row::new(varmap.count, uvars);
    let ts = layout.block(BlockKind::Ts, None).unwrap();
    let ti = layout.block(BlockKind::Ti, None).unwrap();
    let tx = layout.block(BlockKind::Tx, None).unwrap();
    let tm = layout.block(BlockKind::Tm, None).unwrap();
    let minus_one = Complex64::new(-1.0, 0.0);

    for l in 0..n {
        if let Some(t) = ts.term_index(i, l) {
            add_term(&mut row, varmap, t, minus_one, Some(r.s[l][j]));
        }
    }
    if let Some(t) = ti.term_index(i, j) {
        add_term(&mut row, varmap, t, minus_one, None);
    }
    for k in 0..n {
        for l in 0..n {
            if let Some(t) = tx.term_index(k, l) {
                add_term(&mut row, varmap, t, r.m[(i, k)], Some(r.s[l][j]));
            }
        }
        if let Some(t) = tm.term_index(k, j) {
            add_term(&mut row, varmap, t, r.m[(i, k)], None);
        }
    }
    row
}

/// U family equation (i, j): `Us M + Ui - S Ux M - S Um = 0`.
fn emit_u(layout: &Layout, varmap: &VarMap, r: &ResolvedStandard, uvars: usize, i: usize, j: usize) -> Row {
    let n = layout.rows();
    let mut row = Row::new(varmap.count, uvars);
    let us = layout.block(BlockKind::Us, None).unwrap();
    let ui = layout.block(BlockKind::Ui, None).unwrap();
    let ux = layout.block(BlockKind::Ux, None).unwrap();
    let um = layout.block(BlockKind::Um, None).unwrap();

    for k in 0..n {
        if let Some(t) = us.term_index(i, k) {
            add_term(&mut row, varmap, t, r.m[(k, j)], None);
        }
    }
    if let Some(t) = ui.term_index(i, j) {
        add_term(&mut row, varmap, t, Complex64::new(1.0, 0.0), None);
    }
    for l in 0..n {
        for k in 0..n {
            if let Some(t) = ux.term_index(l, k) {
                add_term(&mut row, varmap, t, -r.m[(k, j)], Some(r.s[i][l]));
            }
        }
        if let Some(t) = um.term_index(l, j) {
            add_term(&mut row, varmap, t, Complex64::new(-1.0, 0.0), Some(r.s[i][l]));
        }
    }
    row
}

/// UE14 equation for driven column `c`, row `i`:
/// `us_c o m_c + ui_c - S (ux_c o m_c) - S e_c = 0` with `um_c = 1`.
fn emit_ue14(layout: &Layout, varmap: &VarMap, r: &ResolvedStandard, uvars: usize, c: usize, i: usize) -> Row {
    let n = layout.rows();
    let mut row = Row::new(varmap.count, uvars);
    let us = layout.block(BlockKind::Us, Some(c)).unwrap();
    let ui = layout.block(BlockKind::Ui, Some(c)).unwrap();
    let ux = layout.block(BlockKind::Ux, Some(c)).unwrap();

    if let Some(t) = us.term_index(i, i) {
        add_term(&mut row, varmap, t, r.m[(i, c)], None);
    }
    if let Some(t) = ui.term_index(i, 0) {
        add_term(&mut row, varmap, t, Complex64::new(1.0, 0.0), None);
    }
    for d in 0..n {
        if let Some(t) = ux.term_index(d, d) {
            add_term(&mut row, varmap, t, -r.m[(d, c)], Some(r.s[i][d]));
        }
    }
    // The S e_c term against the pinned um_c = 1.
    row.add_pinned(Complex64::new(-1.0, 0.0), Some(r.s[i][c]));
    row
}

/// E12 equation in the linearised variables (alpha, beta, d) per column:
/// `alpha o m_c - S (beta o m_c) - d e_c - S e_c = 0` where
/// `alpha = 1/(er - el em)`-style combinations are converted back to the
/// el/er/em blocks after the solve.
fn emit_e12(r: &ResolvedStandard, varmap: &VarMap, uvars: usize, n: usize, c: usize, i: usize) -> Row {
    let stride = 2 * n + 1;
    let mut row = Row::new(varmap.count, uvars);
    row.add_evar(c * stride + i, r.m[(i, c)], None);
    for d in 0..n {
        row.add_evar(c * stride + n + d, -r.m[(d, c)], Some(r.s[i][d]));
    }
    if i == c {
        row.add_evar(c * stride + 2 * n, Complex64::new(-1.0, 0.0), None);
    }
    row.add_pinned(Complex64::new(-1.0, 0.0), Some(r.s[i][c]));
    row
}

/// Seed the transmission of an unknown line from the eigenvalues of the
/// measured line-through product (the classic TRL quadratic). The root
/// nearer the initial guess wins; with no usable guess the passive root
/// (|g| <= 1) is taken.
fn trl_seed(resolved: &[ResolvedStandard], u: &mut [Complex64]) {
    let through = resolved
        .iter()
        .find(|r| !r.excluded && r.standard.kind == StandardKind::Through && r.standard.mask.iter().flatten().all(|&m| m));
    let Some(through) = through else { return };
    for line in resolved.iter().filter(|r| !r.excluded && r.standard.kind == StandardKind::Line) {
        let mut unknown_index = None;
        for row in &line.s {
            for entry in row {
                if let SEntry::Unknown(m) = entry {
                    unknown_index = Some(*m);
                }
            }
        }
        let Some(m) = unknown_index else { continue };
        let Some(t_through) = wave_cascade_matrix(&through.m) else { continue };
        let Some(t_line) = wave_cascade_matrix(&line.m) else { continue };
        let Some(t_inv) = linalg::checked_inverse(&t_through) else { continue };
        let c = &t_line * t_inv;
        let tr = c[(0, 0)] + c[(1, 1)];
        let det = c[(0, 0)] * c[(1, 1)] - c[(0, 1)] * c[(1, 0)];
        let disc = (tr * tr - 4.0 * det).sqrt();
        let lambda1 = (tr + disc) / 2.0;
        let lambda2 = (tr - disc) / 2.0;
        let guess = u[m];
        u[m] = if guess.norm() > 1e-9 {
            if (lambda1 - guess).norm() <= (lambda2 - guess).norm() {
                lambda1
            } else {
                lambda2
            }
        } else if lambda1.norm() <= lambda2.norm() {
            lambda1
        } else {
            lambda2
        };
    }
}

/// Scattering-transfer form of a full 2x2 measurement.
fn wave_cascade_matrix(m: &DMatrix<Complex64>) -> Option<DMatrix<Complex64>> {
    if m.nrows() != 2 || m.ncols() != 2 {
        return None;
    }
    let m21 = m[(1, 0)];
    if m21.norm() <= 16.0 * f64::EPSILON * linalg::inf_norm(m) {
        return None;
    }
    let det = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];
    Some(DMatrix::from_row_slice(
        2,
        2,
        &[-det / m21, m[(0, 0)] / m21, -m[(1, 1)] / m21, 1.0 / m21],
    ))
}

/// Direct least-squares solve with no unknown parameters.
fn solve_linear(
    varmap: &VarMap,
    rows: &[Row],
    u: &[Complex64],
    findex: usize,
) -> Result<(Vec<Complex64>, f64), CalibrationError> {
    // Merge standards that produced identical equations.
    let mut coefficients: Vec<Vec<Complex64>> = vec![];
    let mut rhs: Vec<Complex64> = vec![];
    let mut weights: Vec<usize> = vec![];
    for row in rows {
        let c: Vec<Complex64> = (0..varmap.count).map(|t| row.e_coefficient(t, u)).collect();
        let k = row.rhs(u);
        let c_norm: f64 = c.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
        let mut merged = false;
        for (index, existing) in coefficients.iter().enumerate() {
            let diff: f64 = existing
                .iter()
                .zip(&c)
                .map(|(a, b)| (a - b).norm_sqr())
                .sum::<f64>()
                .sqrt();
            if diff <= 1e-10 * c_norm.max(1e-300) {
                rhs[index] = (rhs[index] * weights[index] as f64 + k) / (weights[index] + 1) as f64;
                weights[index] += 1;
                merged = true;
                break;
            }
        }
        if !merged {
            coefficients.push(c);
            rhs.push(k);
            weights.push(1);
        }
    }

    let h = DMatrix::from_fn(coefficients.len(), varmap.count, |r, c| coefficients[r][c]);
    let k = DVector::from_vec(rhs);
    match linalg::least_squares(&h, &k) {
        LstsqOutcome::Solution { x, residual_rms } => Ok((x.iter().copied().collect(), residual_rms)),
        LstsqOutcome::RankDeficient { columns } => {
            let columns = columns
                .into_iter()
                .map(|c| varmap.term_of_evar.get(c).copied().unwrap_or(c))
                .collect();
            Err(CalibrationError::Underdetermined { findex, columns })
        }
    }
}

/// Damped Gauss-Newton (Levenberg-Marquardt) over the error terms and the
/// unknown parameter values.
fn solve_iterative(
    varmap: &VarMap,
    rows: &[Row],
    mut u: Vec<Complex64>,
    findex: usize,
) -> Result<(Vec<Complex64>, Vec<Complex64>, f64), CalibrationError> {
    let evars = varmap.count;
    let uvars = u.len();
    let (mut e, _) = solve_linear(varmap, rows, &u, findex)?;

    let residual_norm = |e: &[Complex64], u: &[Complex64]| -> f64 {
        rows.iter().map(|row| row.residual(e, u).norm_sqr()).sum::<f64>().sqrt()
    };

    let mut lambda = INITIAL_DAMPING;
    let mut current_norm = residual_norm(&e, &u);
    for _iteration in 0..MAX_ITERATIONS {
        // Analytic Jacobian of the bilinear residual.
        let jacobian = DMatrix::from_fn(rows.len(), evars + uvars, |r, c| {
            if c < evars {
                rows[r].e_coefficient(c, &u)
            } else {
                rows[r].u_coefficient(c - evars, &e)
            }
        });
        let residuals = DVector::from_fn(rows.len(), |r, _| rows[r].residual(&e, &u));
        let gradient = jacobian.adjoint() * &residuals;
        let hessian = jacobian.adjoint() * &jacobian;

        // Try steps until one reduces the residual.
        loop {
            if lambda > MAX_DAMPING {
                return Err(CalibrationError::SingularJacobian(findex));
            }
            let damped = &hessian + DMatrix::identity(evars + uvars, evars + uvars) * Complex64::new(lambda, 0.0);
            let Some(step) = damped.lu().solve(&gradient) else {
                lambda *= 2.0;
                continue;
            };
            let e_new: Vec<Complex64> = (0..evars).map(|t| e[t] - step[t]).collect();
            let u_new: Vec<Complex64> = (0..uvars).map(|m| u[m] - step[evars + m]).collect();
            let new_norm = residual_norm(&e_new, &u_new);
            if new_norm.is_finite() && new_norm <= current_norm * (1.0 + 1e-12) {
                let step_norm = step.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
                let x_norm = e
                    .iter()
                    .chain(u.iter())
                    .map(|v| v.norm_sqr())
                    .sum::<f64>()
                    .sqrt();
                e = e_new;
                u = u_new;
                current_norm = new_norm;
                lambda = (lambda / 10.0).max(1e-14);
                if step_norm <= CONVERGENCE_TOLERANCE * x_norm.max(1.0) {
                    let rms = current_norm / (rows.len() as f64).sqrt();
                    return Ok((e, u, rms));
                }
                break;
            }
            lambda *= 2.0;
        }
    }
    Err(CalibrationError::NonConvergence(findex, MAX_ITERATIONS))
}

/// Convert the linearised E12 solution back to the el/er/em blocks.
fn e12_terms(
    layout: &Layout,
    e: &[Complex64],
    leakage: &DMatrix<Complex64>,
    findex: usize,
    terms: &mut [Complex64],
) -> Result<(), CalibrationError> {
    let n = layout.rows();
    let stride = 2 * n + 1;
    let tiny = 1e-300;
    for c in 0..n {
        let alpha_t: Vec<Complex64> = (0..n).map(|i| e[c * stride + i]).collect();
        let beta_t: Vec<Complex64> = (0..n).map(|i| e[c * stride + n + i]).collect();
        let d_t = e[c * stride + 2 * n];
        if alpha_t[c].norm() < tiny {
            return Err(CalibrationError::NotInvertible(findex));
        }
        let el_cc = d_t / alpha_t[c];
        let scale = 1.0 / (Complex64::new(1.0, 0.0) + el_cc * beta_t[c]);
        let el_block = layout.block(BlockKind::El, Some(c)).unwrap();
        let er_block = layout.block(BlockKind::Er, Some(c)).unwrap();
        let em_block = layout.block(BlockKind::Em, Some(c)).unwrap();
        for i in 0..n {
            let alpha = scale * alpha_t[i];
            if alpha.norm() < tiny {
                return Err(CalibrationError::NotInvertible(findex));
            }
            let er = 1.0 / alpha;
            let em = beta_t[i] / alpha_t[i];
            let el = if i == c { el_cc } else { leakage[(i, c)] };
            terms[el_block.term_index(i, 0).unwrap()] = el;
            terms[er_block.term_index(i, 0).unwrap()] = er;
            terms[em_block.term_index(i, 0).unwrap()] = em;
        }
    }
    Ok(())
}
