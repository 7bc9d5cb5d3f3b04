//! Calibration archive files.
//!
//! An archive is a `#VNACal 1.x` header line followed by a structured body
//! holding one or more calibrations: name, error-term type, dimensions,
//! reference impedances and the per-frequency error-term blocks named after
//! the layout. Complex scalars are stored as `±mantissa±mantissaj` strings,
//! either in decimal exponential notation with configurable precision or in
//! C99 hexadecimal-float form for bit-exact round trips. Absent diagonal
//! cells of off-diagonal leakage blocks are stored as nulls.
//!
//! The body is emitted as JSON, which every YAML 1.2 parser also accepts.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::calibration::Calibration;
use crate::data::ReferenceImpedance;
use crate::error::FileError;
use crate::layout::{BlockKind, CalType, Layout};

/// How complex values are rendered on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePrecision {
    /// Decimal exponential with the given number of fractional digits.
    Decimal(usize),
    /// C99 hexadecimal floats; loads back to the identical bits.
    Hex,
}

impl Default for ArchivePrecision {
    fn default() -> Self {
        ArchivePrecision::Decimal(9)
    }
}

#[derive(Serialize, Deserialize)]
struct ArchiveDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Value>,
    calibrations: Vec<ArchiveCalibration>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveCalibration {
    name: String,
    #[serde(rename = "type")]
    cal_type: String,
    rows: usize,
    columns: usize,
    frequencies: usize,
    z0: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<Value>,
    data: Vec<ArchiveFrequencyEntry>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveFrequencyEntry {
    f: f64,
    #[serde(flatten)]
    blocks: Map<String, Value>,
}

fn format_f64(x: f64, precision: ArchivePrecision) -> String {
    match precision {
        ArchivePrecision::Decimal(digits) => format!("{:+.*e}", digits, x),
        ArchivePrecision::Hex => format_hex(x),
    }
}

fn format_hex(x: f64) -> String {
    let sign = if x.is_sign_negative() { "-" } else { "+" };
    if x == 0.0 {
        return format!("{sign}0x0p+0");
    }
    let bits = x.abs().to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & 0x000f_ffff_ffff_ffff;
    if exponent == 0 {
        format!("{sign}0x0.{mantissa:013x}p-1022")
    } else {
        format!("{sign}0x1.{mantissa:013x}p{:+}", exponent - 1023)
    }
}

fn parse_hex(text: &str) -> Option<f64> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'-' => (-1.0, &text[1..]),
        b'+' => (1.0, &text[1..]),
        _ => (1.0, text),
    };
    let rest = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    let p = rest.find(['p', 'P'])?;
    let (digits, exponent) = (&rest[..p], &rest[p + 1..]);
    let exponent: i32 = exponent.parse().ok()?;
    let mut value: u64 = 0;
    let mut fraction_digits: i32 = 0;
    let mut seen_point = false;
    for ch in digits.chars() {
        if ch == '.' {
            if seen_point {
                return None;
            }
            seen_point = true;
            continue;
        }
        let digit = ch.to_digit(16)? as u64;
        value = value.checked_mul(16)?.checked_add(digit)?;
        if seen_point {
            fraction_digits += 1;
        }
    }
    Some(sign * value as f64 * 2f64.powi(exponent - 4 * fraction_digits))
}

fn format_complex(v: Complex64, precision: ArchivePrecision) -> String {
    format!("{}{}j", format_f64(v.re, precision), format_f64(v.im, precision))
}

/// Parse `±mantissa±mantissaj` in either decimal or hexadecimal form.
fn parse_complex(text: &str) -> Option<Complex64> {
    let text = text.trim().strip_suffix(['j', 'J'])?;
    let bytes = text.as_bytes();
    // The imaginary part starts at the last sign that is not an exponent
    // sign (preceded by e/E/p/P).
    let mut split = None;
    for i in (1..bytes.len()).rev() {
        if (bytes[i] == b'+' || bytes[i] == b'-') && !matches!(bytes[i - 1], b'e' | b'E' | b'p' | b'P') {
            split = Some(i);
            break;
        }
    }
    let split = split?;
    let (re_text, im_text) = (&text[..split], &text[split..]);
    let parse_part = |s: &str| -> Option<f64> {
        if s.contains("0x") || s.contains("0X") {
            parse_hex(s)
        } else {
            s.parse().ok()
        }
    };
    Some(Complex64::new(parse_part(re_text)?, parse_part(im_text)?))
}

fn z0_to_value(z0: &ReferenceImpedance, precision: ArchivePrecision) -> Value {
    match z0 {
        ReferenceImpedance::Scalar(z) => Value::String(format_complex(*z, precision)),
        ReferenceImpedance::PerPort(z) => {
            Value::Array(z.iter().map(|v| Value::String(format_complex(*v, precision))).collect())
        }
        ReferenceImpedance::PerFrequency(z) => Value::Array(
            z.iter()
                .map(|row| Value::Array(row.iter().map(|v| Value::String(format_complex(*v, precision))).collect()))
                .collect(),
        ),
    }
}

fn z0_from_value(value: &Value, line: usize) -> Result<ReferenceImpedance, FileError> {
    let complex = |v: &Value| -> Result<Complex64, FileError> {
        v.as_str()
            .and_then(parse_complex)
            .ok_or_else(|| FileError::Parse(line, format!("invalid complex value {v}")))
    };
    match value {
        Value::String(_) => Ok(ReferenceImpedance::Scalar(complex(value)?)),
        Value::Array(items) if items.iter().all(|v| v.is_array()) => {
            let mut rows = vec![];
            for item in items {
                let row: Result<Vec<Complex64>, FileError> =
                    item.as_array().unwrap().iter().map(complex).collect();
                rows.push(row?);
            }
            Ok(ReferenceImpedance::PerFrequency(rows))
        }
        Value::Array(items) => {
            let row: Result<Vec<Complex64>, FileError> = items.iter().map(complex).collect();
            Ok(ReferenceImpedance::PerPort(row?))
        }
        _ => Err(FileError::Parse(line, "invalid z0 entry".to_string())),
    }
}

/// Serialise the error-term blocks of one frequency.
fn blocks_to_map(layout: &Layout, terms: &[Complex64], precision: ArchivePrecision) -> Map<String, Value> {
    let mut map = Map::new();
    let mut seen: Vec<BlockKind> = vec![];
    for block in layout.blocks() {
        if seen.contains(&block.kind) {
            continue;
        }
        seen.push(block.kind);
        if block.column.is_some() {
            // Per-column blocks become one sequence per driven column.
            let columns: Vec<Value> = (0..layout.columns())
                .map(|c| {
                    let b = layout.block(block.kind, Some(c)).unwrap();
                    let cells: Vec<Value> = (b.offset..b.offset + b.len())
                        .map(|t| Value::String(format_complex(terms[t], precision)))
                        .collect();
                    Value::Array(cells)
                })
                .collect();
            map.insert(block.kind.name().to_string(), Value::Array(columns));
        } else if block.off_diagonal {
            // Full matrix with nulls on the absent diagonal.
            let mut cells = vec![];
            for i in 0..block.rows {
                for j in 0..block.columns {
                    cells.push(match block.term_index(i, j) {
                        Some(t) => Value::String(format_complex(terms[t], precision)),
                        None => Value::Null,
                    });
                }
            }
            map.insert(block.kind.name().to_string(), Value::Array(cells));
        } else {
            let cells: Vec<Value> = (block.offset..block.offset + block.len())
                .map(|t| Value::String(format_complex(terms[t], precision)))
                .collect();
            map.insert(block.kind.name().to_string(), Value::Array(cells));
        }
    }
    map
}

fn blocks_from_map(layout: &Layout, map: &Map<String, Value>, line: usize) -> Result<Vec<Complex64>, FileError> {
    let mut terms = vec![Complex64::new(0.0, 0.0); layout.terms_per_frequency()];
    let complex = |v: &Value| -> Result<Complex64, FileError> {
        v.as_str()
            .and_then(parse_complex)
            .ok_or_else(|| FileError::Parse(line, format!("invalid complex value {v}")))
    };
    let mut seen: Vec<BlockKind> = vec![];
    for block in layout.blocks() {
        if seen.contains(&block.kind) {
            continue;
        }
        seen.push(block.kind);
        let value = map
            .get(block.kind.name())
            .ok_or_else(|| FileError::Parse(line, format!("missing block '{}'", block.kind.name())))?;
        let items = value
            .as_array()
            .ok_or_else(|| FileError::Parse(line, format!("block '{}' is not a sequence", block.kind.name())))?;
        if block.column.is_some() {
            for c in 0..layout.columns() {
                let b = layout.block(block.kind, Some(c)).unwrap();
                let cells = items
                    .get(c)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| FileError::Parse(line, format!("block '{}' misses column {c}", block.kind.name())))?;
                if cells.len() != b.len() {
                    return Err(FileError::Parse(
                        line,
                        format!("block '{}' column {c} has {} cells, expected {}", block.kind.name(), cells.len(), b.len()),
                    ));
                }
                for (offset, cell) in cells.iter().enumerate() {
                    terms[b.offset + offset] = complex(cell)?;
                }
            }
        } else if block.off_diagonal && items.len() == block.rows * block.columns {
            // Full matrix form with null diagonal.
            for i in 0..block.rows {
                for j in 0..block.columns {
                    let cell = &items[i * block.columns + j];
                    match block.term_index(i, j) {
                        Some(t) => terms[t] = complex(cell)?,
                        None => {
                            if !cell.is_null() {
                                return Err(FileError::Parse(
                                    line,
                                    format!("block '{}' has a value on the absent diagonal", block.kind.name()),
                                ));
                            }
                        }
                    }
                }
            }
        } else {
            if items.len() != block.len() {
                return Err(FileError::Parse(
                    line,
                    format!("block '{}' has {} cells, expected {}", block.kind.name(), items.len(), block.len()),
                ));
            }
            for (offset, cell) in items.iter().enumerate() {
                terms[block.offset + offset] = complex(cell)?;
            }
        }
    }
    Ok(terms)
}

/// Write one or more calibrations into an archive.
///
/// # Arguments
///
/// * `writer`: Where to write the archive.
/// * `calibrations`: The calibrations to store.
/// * `properties`: Optional archive-level property tree.
/// * `precision`: Complex number rendering.
///
/// returns: `Result<(), FileError>`
pub fn save<W: Write>(
    mut writer: W,
    calibrations: &[&Calibration],
    properties: Option<&Value>,
    precision: ArchivePrecision,
) -> Result<(), FileError> {
    // Per-frequency reference impedances need the 1.1 reader.
    let minor = if calibrations
        .iter()
        .any(|c| matches!(c.z0(), ReferenceImpedance::PerFrequency(_)))
    {
        1
    } else {
        0
    };
    let mut entries = vec![];
    for cal in calibrations {
        let layout = cal.layout();
        let mut data = vec![];
        for findex in 0..cal.frequency_count() {
            let terms = cal.terms(findex)?;
            data.push(ArchiveFrequencyEntry {
                f: cal.frequencies()[findex],
                blocks: blocks_to_map(layout, terms, precision),
            });
        }
        entries.push(ArchiveCalibration {
            name: cal.name().to_string(),
            cal_type: cal.cal_type().name().to_string(),
            rows: cal.rows(),
            columns: cal.columns(),
            frequencies: cal.frequency_count(),
            z0: z0_to_value(cal.z0(), precision),
            properties: cal.properties().cloned(),
            data,
        });
    }
    let document = ArchiveDocument {
        properties: properties.cloned(),
        calibrations: entries,
    };
    writeln!(writer, "#VNACal 1.{minor}")?;
    let body = serde_json::to_string_pretty(&document).map_err(|e| FileError::Unsupported(e.to_string()))?;
    writeln!(writer, "{body}")?;
    Ok(())
}

/// Read an archive back.
///
/// returns: `Result<(Vec<Calibration>, Option<Value>), FileError>`
pub fn load<R: BufRead>(mut reader: R) -> Result<(Vec<Calibration>, Option<Value>), FileError> {
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let header = header.trim_end();
    let minor: u32 = header
        .strip_prefix("#VNACal 1.")
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| FileError::Parse(1, format!("not a VNACal 1.x archive: '{header}'")))?;

    let mut body = String::new();
    for line in reader.lines() {
        body.push_str(&line?);
        body.push('\n');
    }
    let document: ArchiveDocument =
        serde_json::from_str(&body).map_err(|e| FileError::Parse(e.line() + 1, e.to_string()))?;

    let mut calibrations = vec![];
    for entry in &document.calibrations {
        let cal_type = CalType::from_name(&entry.cal_type)
            .ok_or_else(|| FileError::Parse(2, format!("unknown error-term type '{}'", entry.cal_type)))?;
        let layout = Layout::new(cal_type, entry.rows, entry.columns).map_err(FileError::Calibration)?;
        if entry.data.len() != entry.frequencies {
            return Err(FileError::Parse(
                2,
                format!("calibration '{}' has {} data entries, header says {}", entry.name, entry.data.len(), entry.frequencies),
            ));
        }
        let z0 = z0_from_value(&entry.z0, 2)?;
        if matches!(z0, ReferenceImpedance::PerFrequency(_)) && minor < 1 {
            return Err(FileError::Parse(
                2,
                "per-frequency reference impedances require a 1.1 archive".to_string(),
            ));
        }
        let mut frequencies = vec![];
        let mut terms = vec![];
        for entry_f in &entry.data {
            frequencies.push(entry_f.f);
            terms.push(blocks_from_map(&layout, &entry_f.blocks, 2)?);
        }
        let mut cal = Calibration::from_parts(&entry.name, cal_type, entry.rows, entry.columns, &frequencies, z0, terms)
            .map_err(FileError::Calibration)?;
        if let Some(properties) = &entry.properties {
            cal.set_properties(properties.clone());
        }
        calibrations.push(cal);
    }
    Ok((calibrations, document.properties))
}

/// Save an archive to a file path.
pub fn save_file<P: AsRef<Path>>(
    path: P,
    calibrations: &[&Calibration],
    properties: Option<&Value>,
    precision: ArchivePrecision,
) -> Result<(), FileError> {
    let file = File::create(path)?;
    save(file, calibrations, properties, precision)
}

/// Load an archive from a file path.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<(Vec<Calibration>, Option<Value>), FileError> {
    let file = File::open(path)?;
    load(BufReader::new(file))
}
