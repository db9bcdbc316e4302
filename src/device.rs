//! WR device capability and the devices that implement it.
//!
//! A WR device is driven through its command shell. [`WrDevice`] is the set of
//! operations the calibration procedure needs; status queries have default
//! implementations on top of [`WrDevice::raw_status`] so a concrete device only
//! has to know its command templates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{pause, ChannelConfig, CommandChannel};
use crate::error::DeviceError;
use crate::status::{parse_servo_state, parse_status, DeviceStatus, PhyDelays};
use crate::transport::{SerialTiming, SerialTransport, Transport};

pub trait WrDevice {
    /// Human readable device name used in log messages.
    fn name(&self) -> &str;

    /// Number of WR ports. Ports are numbered from 1.
    fn port_count(&self) -> u8;

    /// Erases the SFP calibration database.
    fn erase_sfp_config(&mut self) -> Result<(), DeviceError>;

    /// Stores the calibration of the SFP with serial number `sfp_sn` plugged
    /// into `port`.
    fn write_sfp_config(
        &mut self,
        sfp_sn: &str,
        port: u8,
        delta_tx: i64,
        delta_rx: i64,
        beta: i64,
    ) -> Result<(), DeviceError>;

    /// Matches the plugged SFPs against the database. Returns how many
    /// configurations matched.
    fn load_sfp_config(&mut self) -> Result<usize, DeviceError>;

    /// Erases the init script.
    fn erase_init(&mut self) -> Result<(), DeviceError>;

    /// Appends commands to the init script. They are not validated.
    fn add_init(&mut self, commands: &[&str]) -> Result<(), DeviceError>;

    /// Returns the SFP database as printed by the device.
    fn show_sfp_config(&mut self) -> Result<String, DeviceError>;

    fn set_master(&mut self) -> Result<(), DeviceError>;

    fn set_slaveport(&mut self, port: u8) -> Result<(), DeviceError>;

    /// Starts PTP, restarting it when already running.
    fn ptp_start(&mut self) -> Result<(), DeviceError>;

    fn ptp_stop(&mut self) -> Result<(), DeviceError>;

    /// Returns one raw status line.
    fn raw_status(&mut self) -> Result<String, DeviceError>;

    fn status(&mut self) -> Result<DeviceStatus, DeviceError> {
        let text = self.raw_status()?;
        Ok(parse_status(&text)?)
    }

    fn in_trackphase(&mut self) -> Result<bool, DeviceError> {
        let text = self.raw_status()?;
        Ok(parse_servo_state(&text).is_track_phase())
    }

    /// Round-trip time in picoseconds.
    fn get_rtt(&mut self) -> Result<i64, DeviceError> {
        Ok(self.status()?.rtt)
    }

    fn get_phy_delays(&mut self) -> Result<PhyDelays, DeviceError> {
        Ok(self.status()?.delays)
    }
}

/// Everything needed to open a device over a serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub timing: SerialTiming,
    pub channel: ChannelConfig,
    /// Time given to the device to process each command.
    pub command_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            timing: SerialTiming::default(),
            channel: ChannelConfig::default(),
            command_delay: Duration::from_secs(1),
        }
    }
}

/// The device kinds this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    WrLen,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 1] = [DeviceKind::WrLen];

    pub fn tag(&self) -> &'static str {
        match self {
            DeviceKind::WrLen => "wr-len",
        }
    }

    /// Opens a device of this kind on the serial port at `path`.
    pub fn open(&self, path: &str, config: &DeviceConfig) -> Result<Box<dyn WrDevice>, DeviceError> {
        let transport = SerialTransport::open(path, config.timing)?;
        match self {
            DeviceKind::WrLen => Ok(Box::new(
                WrLen::new(transport, config.channel.clone())
                    .with_name(format!("WR LEN ({})", path))
                    .with_command_delay(config.command_delay),
            )),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceKind::ALL
            .iter()
            .find(|kind| kind.tag() == s)
            .copied()
            .ok_or_else(|| {
                let known: Vec<_> = DeviceKind::ALL.iter().map(DeviceKind::tag).collect();
                format!("unknown device kind '{}', expected one of {:?}", s, known)
            })
    }
}

/// The WR-LEN board: a two port WR node with the WRPC command shell on its
/// USB serial console.
pub struct WrLen<T> {
    channel: CommandChannel<T>,
    name: String,
    command_delay: Duration,
}

impl<T: Transport> WrLen<T> {
    /// SFP database capacity: 2 kinds of SFP for each of the 2 ports.
    pub const PORTS: u8 = 2;

    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self {
            channel: CommandChannel::new(transport, config),
            name: String::from("WR LEN"),
            command_delay: Duration::from_secs(1),
        }
    }

    pub fn with_name(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    pub fn with_command_delay(mut self, command_delay: Duration) -> Self {
        self.command_delay = command_delay;
        self
    }

    pub fn channel(&self) -> &CommandChannel<T> {
        &self.channel
    }

    /// Sends a command and gives the board time to process it.
    fn exec(&mut self, command: &str, output: bool) -> Result<String, DeviceError> {
        let response = self.channel.send(command, output)?;
        pause(self.command_delay);
        Ok(response)
    }

    fn check_port(&self, port: u8) -> Result<(), DeviceError> {
        if port == 0 || port > Self::PORTS {
            return Err(DeviceError::InvalidPort(port));
        }
        Ok(())
    }
}

impl<T: Transport> WrDevice for WrLen<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_count(&self) -> u8 {
        Self::PORTS
    }

    fn erase_sfp_config(&mut self) -> Result<(), DeviceError> {
        self.exec("sfp erase", true)?;
        Ok(())
    }

    fn write_sfp_config(
        &mut self,
        sfp_sn: &str,
        port: u8,
        delta_tx: i64,
        delta_rx: i64,
        beta: i64,
    ) -> Result<(), DeviceError> {
        self.check_port(port)?;
        // interfaces are numbered from 0 on the device: port 1 is wr0
        let cmd = format!(
            "sfp add {} wr{} {} {} {}",
            sfp_sn,
            port - 1,
            delta_tx,
            delta_rx,
            beta
        );
        self.exec(&cmd, false)?;
        Ok(())
    }

    fn load_sfp_config(&mut self) -> Result<usize, DeviceError> {
        let mut output = String::new();
        for cmd in ["ptp stop", "sfp detect", "sfp match", "ptp start"] {
            output += &self.exec(cmd, true)?;
        }
        let matched = count_word(&output, "matched");
        debug!("{}: {} SFP configuration(s) matched", self.name, matched);
        Ok(matched)
    }

    fn erase_init(&mut self) -> Result<(), DeviceError> {
        self.exec("init erase", false)?;
        Ok(())
    }

    fn add_init(&mut self, commands: &[&str]) -> Result<(), DeviceError> {
        for cmd in commands {
            self.exec(&format!("init add {}", cmd), false)?;
        }
        Ok(())
    }

    fn show_sfp_config(&mut self) -> Result<String, DeviceError> {
        self.exec("sfp show", true)
    }

    fn set_master(&mut self) -> Result<(), DeviceError> {
        self.exec("mode master", true)?;
        Ok(())
    }

    fn set_slaveport(&mut self, port: u8) -> Result<(), DeviceError> {
        self.check_port(port)?;
        // the WR-LEN shell has no port argument for slave mode
        self.exec("mode slave", true)?;
        Ok(())
    }

    fn ptp_start(&mut self) -> Result<(), DeviceError> {
        self.exec("ptp start", true)?;
        Ok(())
    }

    fn ptp_stop(&mut self) -> Result<(), DeviceError> {
        self.exec("ptp stop", true)?;
        Ok(())
    }

    fn raw_status(&mut self) -> Result<String, DeviceError> {
        // no processing delay: status is polled in tight sampling loops
        Ok(self.channel.send("stat", true)?)
    }
}

/// Counts whole-word occurrences of `word` in `text`.
fn count_word(text: &str, word: &str) -> usize {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| *w == word)
        .count()
}
