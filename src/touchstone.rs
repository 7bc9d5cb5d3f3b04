//! Touchstone v1 and v2 network-data files.
//!
//! Version 1 files carry an option line (frequency unit, parameter type,
//! coordinate format and normalising resistance) followed by data lines;
//! values are normalised to the option-line resistance and two-port
//! matrices use the historical column-major S11 S21 S12 S22 order. Version
//! 2 files carry explicit keyword sections, per-port real references and
//! unnormalised row-major data.

use nalgebra::DMatrix;
use num_complex::Complex64;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::convert::ParameterType;
use crate::data::{NetworkData, ReferenceImpedance};
use crate::error::FileError;

/// Coordinate rendering of complex values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordinates {
    /// Real and imaginary parts.
    Ri,
    /// Magnitude and angle in degrees.
    Ma,
    /// Magnitude in dB and angle in degrees.
    Db,
}

impl Coordinates {
    fn name(&self) -> &'static str {
        match self {
            Coordinates::Ri => "RI",
            Coordinates::Ma => "MA",
            Coordinates::Db => "DB",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "RI" => Some(Coordinates::Ri),
            "MA" => Some(Coordinates::Ma),
            "DB" => Some(Coordinates::Db),
            _ => None,
        }
    }

    fn encode(&self, v: Complex64) -> (f64, f64) {
        match self {
            Coordinates::Ri => (v.re, v.im),
            Coordinates::Ma => (v.norm(), v.arg().to_degrees()),
            Coordinates::Db => (20.0 * v.norm().log10(), v.arg().to_degrees()),
        }
    }

    fn decode(&self, first: f64, second: f64) -> Complex64 {
        match self {
            Coordinates::Ri => Complex64::new(first, second),
            Coordinates::Ma => Complex64::from_polar(first, second.to_radians()),
            Coordinates::Db => Complex64::from_polar(10f64.powf(first / 20.0), second.to_radians()),
        }
    }
}

fn frequency_scale(unit: &str) -> Option<f64> {
    match unit.to_ascii_uppercase().as_str() {
        "HZ" => Some(1.0),
        "KHZ" => Some(1e3),
        "MHZ" => Some(1e6),
        "GHZ" => Some(1e9),
        _ => None,
    }
}

fn check_supported(data: &NetworkData) -> Result<(), FileError> {
    if !matches!(
        data.parameter_type(),
        ParameterType::S | ParameterType::Z | ParameterType::Y | ParameterType::H | ParameterType::G
    ) {
        return Err(FileError::Unsupported(format!(
            "Touchstone cannot carry {} parameters",
            data.parameter_type()
        )));
    }
    if data.rows() != data.columns() {
        return Err(FileError::Unsupported("Touchstone requires square matrices".to_string()));
    }
    Ok(())
}

/// Touchstone v1 normalisation factor of cell (i, j) for one parameter
/// type. S is unitless, Z and Y scale uniformly, and the hybrid forms mix
/// units per cell.
fn v1_scale(ptype: ParameterType, i: usize, j: usize, z0: f64) -> f64 {
    match ptype {
        ParameterType::S => 1.0,
        ParameterType::Z => 1.0 / z0,
        ParameterType::Y => z0,
        ParameterType::H => match (i, j) {
            (0, 0) => 1.0 / z0,
            (1, 1) => z0,
            _ => 1.0,
        },
        ParameterType::G => match (i, j) {
            (0, 0) => z0,
            (1, 1) => 1.0 / z0,
            _ => 1.0,
        },
        _ => 1.0,
    }
}

/// Cell visit order of one frequency block: v1 uses column-major pairs for
/// two-ports, row-major everywhere else.
fn v1_order(ports: usize) -> Vec<(usize, usize)> {
    if ports == 2 {
        vec![(0, 0), (1, 0), (0, 1), (1, 1)]
    } else {
        row_major_order(ports)
    }
}

fn row_major_order(ports: usize) -> Vec<(usize, usize)> {
    let mut order = vec![];
    for i in 0..ports {
        for j in 0..ports {
            order.push((i, j));
        }
    }
    order
}

fn write_data_lines<W: Write>(writer: &mut W, fields: &[String]) -> Result<(), FileError> {
    // At most the frequency plus four value pairs on the first line,
    // continuation lines indented.
    writeln!(writer, "{}", fields[..fields.len().min(9)].join(" "))?;
    let mut at = 9;
    while at < fields.len() {
        let end = (at + 8).min(fields.len());
        writeln!(writer, "  {}", fields[at..end].join(" "))?;
        at = end;
    }
    Ok(())
}

/// Save a container as a Touchstone v1 file.
///
/// The reference impedance must be one real value shared by all ports.
pub fn save_v1<W: Write>(mut writer: W, data: &NetworkData, coordinates: Coordinates) -> Result<(), FileError> {
    check_supported(data)?;
    let z0 = match data.z0() {
        ReferenceImpedance::Scalar(z) if z.im == 0.0 && z.re > 0.0 => z.re,
        _ => {
            return Err(FileError::Unsupported(
                "Touchstone v1 requires a shared real reference impedance".to_string(),
            ))
        }
    };
    let ports = data.rows();
    writeln!(writer, "! {} parameter data, {} ports", data.parameter_type(), ports)?;
    writeln!(writer, "# HZ {} {} R {}", data.parameter_type().name(), coordinates.name(), z0)?;
    let order = v1_order(ports);
    for findex in 0..data.frequency_count() {
        let matrix = data.matrix(findex).map_err(FileError::Conversion)?;
        let mut fields = vec![format!("{:.12e}", data.frequencies()[findex])];
        for &(i, j) in &order {
            let value = matrix[(i, j)] * v1_scale(data.parameter_type(), i, j, z0);
            let (first, second) = coordinates.encode(value);
            fields.push(format!("{first:.12e}"));
            fields.push(format!("{second:.12e}"));
        }
        write_data_lines(&mut writer, &fields)?;
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct OptionLine {
    scale: f64,
    ptype: ParameterType,
    coordinates: Coordinates,
    z0: f64,
}

impl Default for OptionLine {
    fn default() -> Self {
        // Touchstone defaults: GHz, S, MA, 50 ohm.
        Self {
            scale: 1e9,
            ptype: ParameterType::S,
            coordinates: Coordinates::Ma,
            z0: 50.0,
        }
    }
}

fn parse_option_line(line: &str, lineno: usize) -> Result<OptionLine, FileError> {
    let mut options = OptionLine::default();
    let mut tokens = line.trim_start_matches('#').split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if let Some(scale) = frequency_scale(token) {
            options.scale = scale;
        } else if let Some(coordinates) = Coordinates::from_name(token) {
            options.coordinates = coordinates;
        } else if token.eq_ignore_ascii_case("R") {
            let value = tokens
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| FileError::Parse(lineno, "missing resistance after R".to_string()))?;
            options.z0 = value;
        } else if let Some(ptype) = ParameterType::from_name(token) {
            if !matches!(
                ptype,
                ParameterType::S | ParameterType::Z | ParameterType::Y | ParameterType::H | ParameterType::G
            ) {
                return Err(FileError::Parse(lineno, format!("unsupported parameter type {token}")));
            }
            options.ptype = ptype;
        } else {
            return Err(FileError::Parse(lineno, format!("unknown option '{token}'")));
        }
    }
    Ok(options)
}

fn strip_comment(line: &str) -> &str {
    match line.find('!') {
        Some(at) => &line[..at],
        None => line,
    }
}

/// Load a Touchstone v1 file. The port count comes from the file extension
/// convention (`.sNp`) and must be supplied by the caller.
pub fn load_v1<R: BufRead>(reader: R, ports: usize) -> Result<NetworkData, FileError> {
    let mut options: Option<OptionLine> = None;
    let mut values: Vec<f64> = vec![];
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = strip_comment(&line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            if options.is_none() {
                options = Some(parse_option_line(trimmed, lineno + 1)?);
            }
            continue;
        }
        for token in trimmed.split_whitespace() {
            let value: f64 = token
                .parse()
                .map_err(|_| FileError::Parse(lineno + 1, format!("invalid number '{token}'")))?;
            values.push(value);
        }
    }
    let options = options.unwrap_or_default();
    build_network(&values, ports, options, &v1_order(ports), true)
}

fn build_network(
    values: &[f64],
    ports: usize,
    options: OptionLine,
    order: &[(usize, usize)],
    normalized: bool,
) -> Result<NetworkData, FileError> {
    let per_frequency = 1 + 2 * ports * ports;
    if values.is_empty() || values.len() % per_frequency != 0 {
        return Err(FileError::Parse(
            0,
            format!("data size {} is not a multiple of {per_frequency}", values.len()),
        ));
    }
    let count = values.len() / per_frequency;
    let mut frequencies = Vec::with_capacity(count);
    let mut matrices = Vec::with_capacity(count);
    for chunk in values.chunks(per_frequency) {
        frequencies.push(chunk[0] * options.scale);
        let mut matrix = DMatrix::zeros(ports, ports);
        for (pair, &(i, j)) in order.iter().enumerate() {
            let value = options.coordinates.decode(chunk[1 + 2 * pair], chunk[2 + 2 * pair]);
            let scale = if normalized {
                v1_scale(options.ptype, i, j, options.z0)
            } else {
                1.0
            };
            matrix[(i, j)] = value / scale;
        }
        matrices.push(matrix);
    }
    let mut data = NetworkData::new(options.ptype, ports, ports, &frequencies).map_err(FileError::Conversion)?;
    for (findex, matrix) in matrices.into_iter().enumerate() {
        data.set_matrix(findex, matrix).map_err(FileError::Conversion)?;
    }
    data.set_z0(Complex64::new(options.z0, 0.0));
    Ok(data)
}

/// Save a container as a Touchstone v2 file (per-port real references,
/// unnormalised row-major data).
pub fn save_v2<W: Write>(mut writer: W, data: &NetworkData, coordinates: Coordinates) -> Result<(), FileError> {
    check_supported(data)?;
    let ports = data.rows();
    let references: Vec<f64> = match data.z0() {
        ReferenceImpedance::Scalar(z) if z.im == 0.0 && z.re > 0.0 => vec![z.re; ports],
        ReferenceImpedance::PerPort(z) if z.iter().all(|v| v.im == 0.0 && v.re > 0.0) => {
            z.iter().map(|v| v.re).collect()
        }
        _ => {
            return Err(FileError::Unsupported(
                "Touchstone v2 requires real per-port reference impedances".to_string(),
            ))
        }
    };
    writeln!(writer, "[Version] 2.0")?;
    writeln!(writer, "# HZ {} {}", data.parameter_type().name(), coordinates.name())?;
    writeln!(writer, "[Number of Ports] {ports}")?;
    if ports == 2 {
        writeln!(writer, "[Two-Port Data Order] 12_21")?;
    }
    writeln!(writer, "[Number of Frequencies] {}", data.frequency_count())?;
    writeln!(
        writer,
        "[Reference] {}",
        references.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(" ")
    )?;
    writeln!(writer, "[Matrix Format] Full")?;
    writeln!(writer, "[Network Data]")?;
    let order = row_major_order(ports);
    for findex in 0..data.frequency_count() {
        let matrix = data.matrix(findex).map_err(FileError::Conversion)?;
        let mut fields = vec![format!("{:.12e}", data.frequencies()[findex])];
        for &(i, j) in &order {
            let (first, second) = coordinates.encode(matrix[(i, j)]);
            fields.push(format!("{first:.12e}"));
            fields.push(format!("{second:.12e}"));
        }
        write_data_lines(&mut writer, &fields)?;
    }
    writeln!(writer, "[End]")?;
    Ok(())
}

/// Load a Touchstone v2 file.
pub fn load_v2<R: BufRead>(reader: R) -> Result<NetworkData, FileError> {
    let mut options: Option<OptionLine> = None;
    let mut ports: Option<usize> = None;
    let mut order_21_12 = false;
    let mut references: Option<Vec<f64>> = None;
    let mut expected_frequencies: Option<usize> = None;
    let mut values: Vec<f64> = vec![];
    let mut in_data = false;

    for (lineno, line) in reader.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line?;
        let line = strip_comment(&line);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with('[') {
            in_data = false;
            if lower.starts_with("[version]") {
                continue;
            } else if let Some(rest) = lower.strip_prefix("[number of ports]") {
                ports = Some(
                    rest.trim()
                        .parse()
                        .map_err(|_| FileError::Parse(lineno, "invalid port count".to_string()))?,
                );
            } else if let Some(rest) = lower.strip_prefix("[two-port data order]") {
                order_21_12 = rest.trim() == "21_12";
            } else if let Some(rest) = lower.strip_prefix("[number of frequencies]") {
                expected_frequencies = Some(
                    rest.trim()
                        .parse()
                        .map_err(|_| FileError::Parse(lineno, "invalid frequency count".to_string()))?,
                );
            } else if let Some(rest) = lower.strip_prefix("[reference]") {
                let refs: Result<Vec<f64>, _> = rest.split_whitespace().map(|t| t.parse::<f64>()).collect();
                references = Some(refs.map_err(|_| FileError::Parse(lineno, "invalid reference".to_string()))?);
            } else if lower.starts_with("[matrix format]") {
                if !lower.contains("full") {
                    return Err(FileError::Unsupported("only Full matrix format is supported".to_string()));
                }
            } else if lower.starts_with("[network data]") {
                in_data = true;
            } else if lower.starts_with("[end]") {
                break;
            } else if lower.starts_with("[noise data]") {
                // Noise parameters are not modelled.
                break;
            }
            continue;
        }
        if trimmed.starts_with('#') {
            options = Some(parse_option_line(trimmed, lineno)?);
            continue;
        }
        if in_data {
            for token in trimmed.split_whitespace() {
                let value: f64 = token
                    .parse()
                    .map_err(|_| FileError::Parse(lineno, format!("invalid number '{token}'")))?;
                values.push(value);
            }
        }
    }

    let ports = ports.ok_or_else(|| FileError::Parse(0, "missing [Number of Ports]".to_string()))?;
    let options = options.unwrap_or_default();
    let order = if ports == 2 && order_21_12 {
        vec![(0, 0), (1, 0), (0, 1), (1, 1)]
    } else {
        row_major_order(ports)
    };
    let data = build_network(&values, ports, options, &order, false)?;
    if let Some(expected) = expected_frequencies {
        if data.frequency_count() != expected {
            return Err(FileError::Parse(
                0,
                format!("found {} frequencies, header says {expected}", data.frequency_count()),
            ));
        }
    }
    let mut data = data;
    if let Some(references) = references {
        if references.len() != ports {
            return Err(FileError::Parse(0, "wrong [Reference] length".to_string()));
        }
        data.set_z0_per_port(&references.iter().map(|&r| Complex64::new(r, 0.0)).collect::<Vec<_>>())
            .map_err(FileError::Conversion)?;
    }
    Ok(data)
}

/// Load a Touchstone file, sniffing the version from the contents.
pub fn load<R: BufRead>(reader: R, ports: usize) -> Result<NetworkData, FileError> {
    let mut contents = String::new();
    let mut reader = reader;
    std::io::Read::read_to_string(&mut reader, &mut contents)?;
    if contents.to_ascii_lowercase().contains("[version]") {
        load_v2(contents.as_bytes())
    } else {
        load_v1(contents.as_bytes(), ports)
    }
}

/// Load a Touchstone file from a path, taking the port count from the
/// `.sNp` extension for v1 files.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<NetworkData, FileError> {
    let path = path.as_ref();
    let ports = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| {
            let e = e.to_ascii_lowercase();
            e.strip_prefix('s')?.strip_suffix('p')?.parse::<usize>().ok()
        })
        .unwrap_or(2);
    let file = File::open(path)?;
    load(BufReader::new(file), ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn sample(ports: usize) -> NetworkData {
        let mut data = NetworkData::new(ParameterType::S, ports, ports, &[1e9, 2e9, 3e9]).unwrap();
        for findex in 0..3 {
            let matrix = DMatrix::from_fn(ports, ports, |i, j| {
                c(
                    0.1 * (findex + 1) as f64 + 0.05 * i as f64 - 0.02 * j as f64,
                    0.03 * (i as f64 - j as f64) + 0.01 * findex as f64,
                )
            });
            data.set_matrix(findex, matrix).unwrap();
        }
        data
    }

    #[test]
    fn test_v1_round_trip_all_coordinates() {
        for coordinates in [Coordinates::Ri, Coordinates::Ma, Coordinates::Db] {
            let data = sample(2);
            let mut buffer = vec![];
            save_v1(&mut buffer, &data, coordinates).unwrap();
            let loaded = load_v1(buffer.as_slice(), 2).unwrap();
            assert_eq!(loaded.parameter_type(), ParameterType::S);
            assert_eq!(loaded.frequency_count(), 3);
            for findex in 0..3 {
                crate::util::assert_matrix_eq(loaded.matrix(findex).unwrap(), data.matrix(findex).unwrap(), 1e-9);
            }
        }
    }

    #[test]
    fn test_v1_two_port_column_order() {
        // S21 comes before S12 in a v1 two-port file.
        let mut data = NetworkData::new(ParameterType::S, 2, 2, &[1e9]).unwrap();
        data.set_matrix(
            0,
            DMatrix::from_row_slice(2, 2, &[c(0.11, 0.0), c(0.12, 0.0), c(0.21, 0.0), c(0.22, 0.0)]),
        )
        .unwrap();
        let mut buffer = vec![];
        save_v1(&mut buffer, &data, Coordinates::Ri).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let data_line = text.lines().find(|l| !l.starts_with(['!', '#'])).unwrap();
        let fields: Vec<f64> = data_line.split_whitespace().map(|t| t.parse().unwrap()).collect();
        assert_eq!(fields[1], 0.11);
        assert_eq!(fields[3], 0.21);
        assert_eq!(fields[5], 0.12);
        assert_eq!(fields[7], 0.22);
    }

    #[test]
    fn test_v1_z_normalisation() {
        let mut data = NetworkData::new(ParameterType::Z, 1, 1, &[1e9]).unwrap();
        data.set_matrix(0, DMatrix::from_row_slice(1, 1, &[c(100.0, 0.0)])).unwrap();
        let mut buffer = vec![];
        save_v1(&mut buffer, &data, Coordinates::Ri).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        let data_line = text.lines().find(|l| !l.starts_with(['!', '#'])).unwrap();
        let fields: Vec<f64> = data_line.split_whitespace().map(|t| t.parse().unwrap()).collect();
        // 100 ohm normalised to 50 ohm is 2.
        assert_eq!(fields[1], 2.0);
        let loaded = load_v1(buffer.as_slice(), 1).unwrap();
        assert_eq!(loaded.matrix(0).unwrap()[(0, 0)], c(100.0, 0.0));
    }

    #[test]
    fn test_v1_default_options() {
        // No option line: GHz, S, MA, 50 ohm.
        let text = "1.0 0.5 0.0 0.1 90.0 0.1 -90.0 0.5 0.0\n";
        let loaded = load_v1(text.as_bytes(), 2).unwrap();
        assert_eq!(loaded.frequencies()[0], 1e9);
        crate::util::assert_complex_eq(loaded.matrix(0).unwrap()[(0, 0)], c(0.5, 0.0), 1e-12);
        // MA with angle 90 degrees: S21 = 0.1j (v1 order).
        crate::util::assert_complex_eq(loaded.matrix(0).unwrap()[(1, 0)], c(0.0, 0.1), 1e-12);
    }

    #[test]
    fn test_v2_round_trip_with_references() {
        let mut data = sample(3);
        data.set_z0_per_port(&[c(50.0, 0.0), c(75.0, 0.0), c(50.0, 0.0)]).unwrap();
        let mut buffer = vec![];
        save_v2(&mut buffer, &data, Coordinates::Ri).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("[Version] 2.0"));

        let loaded = load(buffer.as_slice(), 3).unwrap();
        assert_eq!(loaded.z0(), data.z0());
        for findex in 0..3 {
            crate::util::assert_matrix_eq(loaded.matrix(findex).unwrap(), data.matrix(findex).unwrap(), 1e-9);
        }
    }

    #[test]
    fn test_v1_complex_z0_rejected() {
        let mut data = sample(2);
        data.set_z0(c(50.0, 5.0));
        let mut buffer = vec![];
        assert!(matches!(
            save_v1(&mut buffer, &data, Coordinates::Ri),
            Err(FileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_comment_handling() {
        let text = "! leading comment\n# HZ S RI R 50\n1e9 0.1 0.0 ! trailing\n";
        let loaded = load_v1(text.as_bytes(), 1).unwrap();
        assert_eq!(loaded.frequency_count(), 1);
        assert_eq!(loaded.matrix(0).unwrap()[(0, 0)], c(0.1, 0.0));
    }
}
