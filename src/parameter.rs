//! Calibration-standard parameters.
//!
//! A parameter resolves to one complex scalar per frequency. Parameters are
//! held in a registry arena and shared by small integer handles with
//! explicit reference counts; the four built-in ideals (open, short, match
//! and the canonical zero) always exist. Unknown and correlated parameters
//! have no value until a calibration solve recovers one and writes it back.

use log::warn;
use num_complex::Complex64;
use std::fmt;

use crate::error::{GridError, ParameterError};
use crate::linalg::ComplexSpline;

/// Handle to a parameter stored in a [`ParameterRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterId(pub(crate) u32);

impl ParameterId {
    /// The ideal open standard (+1 reflection).
    pub const OPEN: ParameterId = ParameterId(1);
    /// The ideal short standard (-1 reflection).
    pub const SHORT: ParameterId = ParameterId(2);
    /// The ideal matched load (0 reflection).
    pub const MATCH: ParameterId = ParameterId(3);
    /// The canonical zero, used for entries known to carry no signal.
    pub const ZERO: ParameterId = ParameterId(4);

    pub(crate) fn index(&self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-frequency values stored for vector parameters and for solved unknowns.
#[derive(Debug, Clone)]
pub(crate) struct VectorValues {
    frequencies: Vec<f64>,
    values: Vec<Complex64>,
}

impl VectorValues {
    fn new(frequencies: &[f64], values: &[Complex64]) -> Result<Self, GridError> {
        crate::util::check_frequency_vector(frequencies)?;
        if frequencies.len() != values.len() {
            return Err(GridError::MismatchedLength(frequencies.len(), values.len()));
        }
        Ok(Self {
            frequencies: frequencies.to_vec(),
            values: values.to_vec(),
        })
    }

    /// Evaluate at `f` via natural cubic spline on the real and imaginary
    /// parts. Returns the value and whether the frequency was clamped to the
    /// stored range.
    fn eval(&self, f: f64) -> (Complex64, bool) {
        if let Ok(i) = self
            .frequencies
            .binary_search_by(|v| v.partial_cmp(&f).unwrap())
        {
            return (self.values[i], false);
        }
        // The grids were validated at construction, so the spline build
        // cannot fail.
        let spline = ComplexSpline::new(&self.frequencies, &self.values)
            .expect("vector parameter grid was validated");
        spline.eval_checked(f)
    }
}

#[derive(Debug, Clone)]
enum ParameterKind {
    Scalar(Complex64),
    Vector(VectorValues),
    Unknown {
        guess: ParameterId,
        solved: Option<VectorValues>,
    },
    Correlated {
        target: ParameterId,
        tolerance: f64,
        solved: Option<VectorValues>,
    },
}

struct Slot {
    references: u32,
    kind: ParameterKind,
}

/// Arena of calibration-standard parameters.
pub struct ParameterRegistry {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterRegistry {
    /// Create a registry holding the four built-in ideals.
    pub fn new() -> Self {
        let builtin = |value: f64| {
            Some(Slot {
                references: 1,
                kind: ParameterKind::Scalar(Complex64::new(value, 0.0)),
            })
        };
        Self {
            slots: vec![builtin(1.0), builtin(-1.0), builtin(0.0), builtin(0.0)],
            free: vec![],
        }
    }

    fn insert(&mut self, kind: ParameterKind) -> ParameterId {
        let slot = Slot { references: 1, kind };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                ParameterId(index as u32 + 1)
            }
            None => {
                self.slots.push(Some(slot));
                ParameterId(self.slots.len() as u32)
            }
        }
    }

    fn slot(&self, id: ParameterId) -> Result<&Slot, ParameterError> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .ok_or(ParameterError::UnknownHandle(id.0))
    }

    fn slot_mut(&mut self, id: ParameterId) -> Result<&mut Slot, ParameterError> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_mut())
            .ok_or(ParameterError::UnknownHandle(id.0))
    }

    /// Create a frequency-independent parameter.
    pub fn scalar(&mut self, gamma: Complex64) -> ParameterId {
        self.insert(ParameterKind::Scalar(gamma))
    }

    /// Create a parameter tabulated over a frequency grid; it is evaluated
    /// at other frequencies via natural cubic spline.
    pub fn vector(&mut self, frequencies: &[f64], values: &[Complex64]) -> Result<ParameterId, ParameterError> {
        let values = VectorValues::new(frequencies, values)?;
        Ok(self.insert(ParameterKind::Vector(values)))
    }

    /// Create an unknown parameter to be recovered during a calibration
    /// solve. `guess` seeds the iterative solver; use
    /// [`ParameterId::MATCH`] when nothing better is known.
    pub fn unknown(&mut self, guess: ParameterId) -> Result<ParameterId, ParameterError> {
        self.slot(guess)?;
        self.retain(guess)?;
        Ok(self.insert(ParameterKind::Unknown { guess, solved: None }))
    }

    /// Create an unknown parameter constrained to stay within `tolerance` of
    /// `target`. The back-reference must already exist, so correlation
    /// chains cannot form cycles.
    pub fn correlated(&mut self, target: ParameterId, tolerance: f64) -> Result<ParameterId, ParameterError> {
        if tolerance <= 0.0 {
            return Err(ParameterError::BadTolerance(tolerance));
        }
        self.slot(target)?;
        self.retain(target)?;
        Ok(self.insert(ParameterKind::Correlated {
            target,
            tolerance,
            solved: None,
        }))
    }

    /// Increment the reference count of a handle. The built-in ideals are
    /// not counted; they live for the whole registry.
    pub fn retain(&mut self, id: ParameterId) -> Result<(), ParameterError> {
        if id.index() < 4 {
            self.slot(id)?;
            return Ok(());
        }
        self.slot_mut(id)?.references += 1;
        Ok(())
    }

    /// Decrement the reference count, freeing the slot when it reaches zero.
    /// The built-in ideals are never freed.
    pub fn release(&mut self, id: ParameterId) -> Result<(), ParameterError> {
        if id.index() < 4 {
            return Ok(());
        }
        let slot = self.slot_mut(id)?;
        slot.references -= 1;
        if slot.references == 0 {
            let kind = slot.kind.clone();
            self.slots[id.index()] = None;
            self.free.push(id.index());
            match kind {
                ParameterKind::Unknown { guess, .. } => self.release(guess)?,
                ParameterKind::Correlated { target, .. } => self.release(target)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Current reference count of a handle.
    pub fn reference_count(&self, id: ParameterId) -> Option<u32> {
        self.slots.get(id.index()).and_then(|s| s.as_ref()).map(|s| s.references)
    }

    /// Whether a handle names an unknown or correlated parameter.
    pub fn is_unknown(&self, id: ParameterId) -> Result<bool, ParameterError> {
        Ok(matches!(
            self.slot(id)?.kind,
            ParameterKind::Unknown { .. } | ParameterKind::Correlated { .. }
        ))
    }

    /// Whether a handle resolves to exactly zero at every frequency. Used to
    /// recognise no-signal paths when assembling calibration equations.
    pub(crate) fn is_known_zero(&self, id: ParameterId) -> bool {
        match self.slot(id) {
            Ok(slot) => match &slot.kind {
                ParameterKind::Scalar(v) => *v == Complex64::new(0.0, 0.0),
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// The correlation constraint of a correlated parameter.
    pub(crate) fn correlation(&self, id: ParameterId) -> Option<(ParameterId, f64)> {
        match self.slot(id).ok()?.kind {
            ParameterKind::Correlated { target, tolerance, .. } => Some((target, tolerance)),
            _ => None,
        }
    }

    /// Evaluate a parameter at a frequency. Unknowns fall back to their
    /// initial guess until a solve has written values back.
    pub fn value_at(&self, id: ParameterId, f: f64) -> Result<Complex64, ParameterError> {
        match &self.slot(id)?.kind {
            ParameterKind::Scalar(v) => Ok(*v),
            ParameterKind::Vector(values) => {
                let (value, clamped) = values.eval(f);
                if clamped {
                    warn!("Parameter {id} evaluated outside its stored frequency range at {f} Hz; clamping");
                }
                Ok(value)
            }
            ParameterKind::Unknown { guess, solved } | ParameterKind::Correlated { target: guess, solved, .. } => {
                match solved {
                    Some(values) => {
                        let (value, clamped) = values.eval(f);
                        if clamped {
                            warn!("Parameter {id} evaluated outside its solved frequency range at {f} Hz; clamping");
                        }
                        Ok(value)
                    }
                    None => self.value_at(*guess, f),
                }
            }
        }
    }

    /// Initial guess of an unknown parameter at a frequency.
    pub(crate) fn guess_at(&self, id: ParameterId, f: f64) -> Result<Complex64, ParameterError> {
        match &self.slot(id)?.kind {
            ParameterKind::Unknown { guess, .. } => self.value_at(*guess, f),
            ParameterKind::Correlated { target, .. } => self.value_at(*target, f),
            _ => self.value_at(id, f),
        }
    }

    /// Store the values recovered for an unknown parameter by a solve.
    pub(crate) fn set_solved(
        &mut self,
        id: ParameterId,
        frequencies: &[f64],
        values: &[Complex64],
    ) -> Result<(), ParameterError> {
        let solved_values = VectorValues::new(frequencies, values)?;
        match &mut self.slot_mut(id)?.kind {
            ParameterKind::Unknown { solved, .. } | ParameterKind::Correlated { solved, .. } => {
                *solved = Some(solved_values);
                Ok(())
            }
            _ => Err(ParameterError::NotUnknown(id.0)),
        }
    }
}
