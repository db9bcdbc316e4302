//! Error types for every layer of the calibration stack.

use std::time::Duration;

use crate::calibration::Fiber;

/// Failures of the echo-verified command channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The transport could not accept the command before its write deadline.
    /// Never retried.
    #[error("write timeout while sending '{command}'")]
    WriteTimeout { command: String },
    /// The echoed line never matched the command.
    #[error("echo of '{command}' did not match after {attempts} attempt(s), last echo: '{echoed}'")]
    EchoMismatch {
        command: String,
        echoed: String,
        attempts: u32,
    },
    /// Fewer bytes than the command length were written.
    #[error("short write of '{command}': {written} of {expected} bytes after {attempts} attempt(s)")]
    ShortWrite {
        command: String,
        written: usize,
        expected: usize,
        attempts: u32,
    },
    /// The command is empty, not printable ASCII, or contains a line terminator.
    #[error("invalid command '{0}'")]
    InvalidCommand(String),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures decoding a device status line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatusError {
    /// A field required for calibration arithmetic is absent.
    #[error("incomplete status, missing {missing:?}: '{text}'")]
    IncompleteStatus {
        missing: Vec<&'static str>,
        text: String,
    },
    #[error("invalid value '{value}' for status field '{key}'")]
    InvalidField { key: &'static str, value: String },
}

/// Failures of a single device operation: either the command did not go
/// through, or its output could not be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("port {0} is not available on this device")]
    InvalidPort(u8),
    #[error("could not open device: {0}")]
    Open(#[from] serialport::Error),
}

/// Failures reported by a measurement instrument.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("instrument input channels are not set")]
    InputNotSet,
    #[error("instrument trigger levels are not set")]
    TriggerNotSet,
    #[error("instrument I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("instrument error: {0}")]
    Other(String),
}

/// Which device of the pair an error relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Failures of a calibration procedure. Every variant names enough context
/// (fiber, device, measured value) to locate a cabling mistake.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("at least 2 WR devices are needed, {found} added")]
    WrDeviceNeeded { found: usize },
    #[error("no measurement instrument added")]
    MeasurementInstrumentNeeded,
    #[error("fiber latency must be measured before fiber asymmetry")]
    FiberLatencyNeeded,
    #[error("invalid port number {0}")]
    InvalidPort(u8),
    #[error("the number of samples must be greater than zero")]
    InvalidSampleCount,
    #[error("servo of the slave never reached TRACK_PHASE on fiber {fiber} (waited {waited:?})")]
    ServoNeverLocked { fiber: Fiber, waited: Duration },
    /// The skew between PPS edges is too large to be a real fiber skew; the
    /// instrument inputs are most likely not wired to the PPS outputs.
    #[error("measured time interval {seconds:e} s on fiber {fiber} is out of range, check instrument wiring")]
    MeasuringError { fiber: Fiber, seconds: f64 },
    #[error("asymmetry coefficient is undefined for dif={dif} ps, delta2={delta2} ps")]
    MeasureError { dif: f64, delta2: f64 },
    #[error("{role} device failed on fiber {fiber}: {source}")]
    Device {
        role: Role,
        fiber: Fiber,
        #[source]
        source: DeviceError,
    },
    #[error("{role} device failed during setup: {source}")]
    Setup {
        role: Role,
        #[source]
        source: DeviceError,
    },
    #[error("measurement instrument setup failed: {0}")]
    InstrumentSetup(#[source] InstrumentError),
    #[error("measurement instrument failed on fiber {fiber}: {source}")]
    Instrument {
        fiber: Fiber,
        #[source]
        source: InstrumentError,
    },
    #[error("operator interaction failed: {0}")]
    Operator(#[source] std::io::Error),
}

/// Failures reading or writing the calibration file.
#[derive(Debug, thiserror::Error)]
pub enum CalFileError {
    #[error("line {line}: unknown section '@{name}'")]
    UnknownSection { line: usize, name: String },
    #[error("line {line}: values found outside of any section")]
    NoSection { line: usize },
    #[error("line {line}: malformed entry '{entry}'")]
    MalformedEntry { line: usize, entry: String },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Failures loading the TOML settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("device entry {index} needs either `path` or `lun`")]
    MissingDevicePath { index: usize },
}
