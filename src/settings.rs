//! TOML configuration of the calibration tool.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationSettings;
use crate::channel::ChannelConfig;
use crate::device::{DeviceConfig, DeviceKind};
use crate::error::SettingsError;
use crate::transport::{SerialTiming, USB_SERIAL_PREFIX};

type Result<T> = std::result::Result<T, SettingsError>;

/// Serial link and command channel parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Pause after every written byte.
    pub inter_char_delay_us: u64,
    /// Pause between writing a command and reading its echo.
    pub settle_ms: u64,
    /// Attempts at sending one command.
    pub ntries: u32,
    /// Raw bytes read for command output, five per character.
    pub max_response_bytes: usize,
    /// Length of the shell prompt ending every response.
    pub prompt_len: usize,
    /// Processing time given to the device after every command.
    pub command_delay_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        let timing = SerialTiming::default();
        let channel = ChannelConfig::default();
        Self {
            baud_rate: timing.baud_rate,
            read_timeout_ms: timing.read_timeout.as_millis() as u64,
            write_timeout_ms: timing.write_timeout.as_millis() as u64,
            inter_char_delay_us: channel.inter_char_delay.as_micros() as u64,
            settle_ms: channel.settle_delay.as_millis() as u64,
            ntries: channel.ntries,
            max_response_bytes: channel.max_response_bytes,
            prompt_len: channel.prompt_len,
            command_delay_ms: 1000,
        }
    }
}

impl SerialSettings {
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            timing: SerialTiming {
                baud_rate: self.baud_rate,
                read_timeout: Duration::from_millis(self.read_timeout_ms),
                write_timeout: Duration::from_millis(self.write_timeout_ms),
            },
            channel: ChannelConfig {
                inter_char_delay: Duration::from_micros(self.inter_char_delay_us),
                settle_delay: Duration::from_millis(self.settle_ms),
                ntries: self.ntries,
                max_response_bytes: self.max_response_bytes,
                prompt_len: self.prompt_len,
            },
            command_delay: Duration::from_millis(self.command_delay_ms),
        }
    }
}

/// Sampling and timing of the measurement procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationSection {
    pub n_samples: u32,
    pub sample_interval_ms: u64,
    pub connect_settle_ms: u64,
    pub lock_poll_ms: u64,
    pub lock_timeout_ms: u64,
    pub port: u8,
    pub master_sfp_sn: String,
    pub slave_sfp_sn: String,
    pub trigger_v_min: f64,
    pub trigger_v_max: f64,
}

impl Default for CalibrationSection {
    fn default() -> Self {
        let defaults = CalibrationSettings::default();
        Self {
            n_samples: defaults.n_samples,
            sample_interval_ms: defaults.sample_interval.as_millis() as u64,
            connect_settle_ms: defaults.connect_settle.as_millis() as u64,
            lock_poll_ms: defaults.lock_poll.as_millis() as u64,
            lock_timeout_ms: defaults.lock_timeout.as_millis() as u64,
            port: defaults.port,
            master_sfp_sn: defaults.master_sfp_sn,
            slave_sfp_sn: defaults.slave_sfp_sn,
            trigger_v_min: defaults.trigger_v_min,
            trigger_v_max: defaults.trigger_v_max,
        }
    }
}

impl CalibrationSection {
    pub fn calibration_settings(&self) -> CalibrationSettings {
        CalibrationSettings {
            n_samples: self.n_samples,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            connect_settle: Duration::from_millis(self.connect_settle_ms),
            lock_poll: Duration::from_millis(self.lock_poll_ms),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            port: self.port,
            master_sfp_sn: self.master_sfp_sn.clone(),
            slave_sfp_sn: self.slave_sfp_sn.clone(),
            trigger_v_min: self.trigger_v_min,
            trigger_v_max: self.trigger_v_max,
        }
    }
}

/// One WR device taking part in the calibration, either by serial port path
/// or by the number of its USB serial adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub kind: DeviceKind,
    pub path: Option<String>,
    pub lun: Option<u32>,
}

impl DeviceEntry {
    /// Serial port of the device. `path` wins over `lun`.
    pub fn port_path(&self, index: usize) -> Result<String> {
        match (&self.path, self.lun) {
            (Some(path), _) => Ok(path.clone()),
            (None, Some(lun)) => Ok(format!("{}{}", USB_SERIAL_PREFIX, lun)),
            (None, None) => Err(SettingsError::MissingDevicePath { index }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub serial: SerialSettings,
    pub calibration: CalibrationSection,
    /// Master first, then slave.
    pub devices: Vec<DeviceEntry>,
}

impl Settings {
    /// Serial paths of every configured device, in order.
    pub fn device_paths(&self) -> Result<Vec<(DeviceKind, String)>> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, entry)| Ok((entry.kind, entry.port_path(index)?)))
            .collect()
    }
}

pub fn parse_settings(contents: &str) -> Result<Settings> {
    Ok(toml::from_str(contents)?)
}

pub fn read_settings_file<P: AsRef<Path>>(fname: P) -> Result<Settings> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    parse_settings(&contents)
}
