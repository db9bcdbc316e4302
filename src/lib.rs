//! # White Rabbit link calibration
//!
//! This library drives two White Rabbit devices, and optionally an instrument
//! measuring the skew between their PPS outputs, through the fiber swap
//! sequence that yields the fiber latency and the fiber asymmetry of a link.
//!
//! The layers, from the wire up:
//! - [`transport`]: byte access to the device console.
//! - [`channel`]: echo-verified command sending with retries.
//! - [`status`]: decoding of the device status line.
//! - [`device`]: the WR device operations and their command templates.
//! - [`calibration`]: the measurement procedure and its arithmetic.
//!
//! [`calfile`] persists results, [`settings`] loads the TOML configuration
//! and [`sim`] simulates a device shell for tests and dry runs.

pub mod calfile;
pub mod calibration;
pub mod channel;
pub mod device;
pub mod error;
pub mod instrument;
pub mod settings;
pub mod sim;
pub mod status;
pub mod transport;

pub use calibration::{
    CalibrationResult, CalibrationSettings, CalibrationState, Fiber, FiberLatency, FiberSwap,
    Session, SfpColor,
};
pub use channel::{ChannelConfig, CommandChannel};
pub use device::{DeviceConfig, DeviceKind, WrDevice, WrLen};
pub use error::{CalFileError, CalibrationError, ChannelError, DeviceError, SettingsError};
pub use instrument::MeasurementInstrument;
pub use status::{DeviceStatus, PhyDelays, ServoState};
pub use transport::{SerialTransport, Transport};
