//! Text file holding calibration results.
//!
//! ```text
//! # comment
//! @fiber-latency
//! delta1:800 delta2:1800
//! @fiber-asymmetry
//! blue-wr1:91625968981.33333 violet-wr1:-91625968981.33333
//! @port-delay
//! wr-len-wr0:46407,167843
//! ```
//!
//! Values follow their `@section` header as space separated `key:value`
//! pairs, on one or more lines. Empty sections are not written.

use std::fs;
use std::path::Path;

use crate::calibration::{AsymmetryKey, CalibrationResult, FiberLatency};
use crate::error::CalFileError;

const FIBER_LATENCY: &str = "fiber-latency";
const FIBER_ASYMMETRY: &str = "fiber-asymmetry";
const PORT_DELAY: &str = "port-delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    FiberLatency,
    FiberAsymmetry,
    PortDelay,
}

impl Section {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            FIBER_LATENCY => Some(Section::FiberLatency),
            FIBER_ASYMMETRY => Some(Section::FiberAsymmetry),
            PORT_DELAY => Some(Section::PortDelay),
            _ => None,
        }
    }
}

/// Reads a calibration file.
pub fn read<P: AsRef<Path>>(path: P) -> Result<CalibrationResult, CalFileError> {
    let text = fs::read_to_string(path)?;
    parse(&text)
}

/// Writes `result` to `path`, replacing the file.
pub fn write<P: AsRef<Path>>(path: P, result: &CalibrationResult) -> Result<(), CalFileError> {
    fs::write(path, to_string(result))?;
    Ok(())
}

pub fn to_string(result: &CalibrationResult) -> String {
    let mut out = String::from("# White Rabbit link calibration\n");
    if let Some(latency) = &result.fiber_latency {
        out.push_str(&format!(
            "@{}\ndelta1:{} delta2:{}\n",
            FIBER_LATENCY, latency.delta1, latency.delta2
        ));
    }
    if !result.asymmetry.is_empty() {
        let pairs: Vec<String> = result
            .asymmetry
            .iter()
            .map(|(key, alpha_n)| format!("{}:{}", key, alpha_n))
            .collect();
        out.push_str(&format!("@{}\n{}\n", FIBER_ASYMMETRY, pairs.join(" ")));
    }
    if !result.port_delays.is_empty() {
        let pairs: Vec<String> = result
            .port_delays
            .iter()
            .map(|(key, (tx, rx))| format!("{}:{},{}", key, tx, rx))
            .collect();
        out.push_str(&format!("@{}\n{}\n", PORT_DELAY, pairs.join(" ")));
    }
    out
}

pub fn parse(text: &str) -> Result<CalibrationResult, CalFileError> {
    let mut result = CalibrationResult::default();
    let mut section = None;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        if let Some(name) = content.strip_prefix('@') {
            let name = name.trim();
            section = Some(Section::from_name(name).ok_or_else(|| CalFileError::UnknownSection {
                line,
                name: name.to_string(),
            })?);
            if section == Some(Section::FiberLatency) && result.fiber_latency.is_none() {
                result.fiber_latency = Some(FiberLatency {
                    delta1: 0.0,
                    delta2: 0.0,
                });
            }
            continue;
        }
        let section = section.ok_or(CalFileError::NoSection { line })?;

        for entry in content.split_whitespace() {
            let malformed = || CalFileError::MalformedEntry {
                line,
                entry: entry.to_string(),
            };
            let (key, value) = entry.split_once(':').ok_or_else(malformed)?;
            match section {
                Section::FiberLatency => {
                    let value: f64 = value.parse().map_err(|_| malformed())?;
                    let latency = result.fiber_latency.get_or_insert(FiberLatency {
                        delta1: 0.0,
                        delta2: 0.0,
                    });
                    match key {
                        "delta1" => latency.delta1 = value,
                        "delta2" => latency.delta2 = value,
                        _ => return Err(malformed()),
                    }
                }
                Section::FiberAsymmetry => {
                    let key: AsymmetryKey = key.parse().map_err(|_| malformed())?;
                    let value: f64 = value.parse().map_err(|_| malformed())?;
                    result.asymmetry.insert(key, value);
                }
                Section::PortDelay => {
                    let (tx, rx) = value.split_once(',').ok_or_else(malformed)?;
                    let tx: i64 = tx.parse().map_err(|_| malformed())?;
                    let rx: i64 = rx.parse().map_err(|_| malformed())?;
                    result.port_delays.insert(key.to_string(), (tx, rx));
                }
            }
        }
    }
    Ok(result)
}
