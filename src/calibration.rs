//! The calibration procedure.
//!
//! Two WR devices are linked in turn by a short fiber `f1`, a long fiber `f2`
//! and their concatenation `f1+f2`. From the round-trip times measured on each
//! configuration the procedure derives the fiber latency deltas; with an
//! instrument measuring the skew between the master and slave PPS outputs on
//! `f1` and `f2` it then derives the fiber asymmetry coefficient.
//!
//! All device I/O is blocking and long waits are real: the link needs seconds
//! to settle after a fiber swap and the servo may take minutes to lock.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::channel::pause;
use crate::device::WrDevice;
use crate::error::{CalibrationError, DeviceError, Role};
use crate::instrument::MeasurementInstrument;
use crate::status::PhyDelays;

/// Scale of the fixed-point asymmetry coefficient.
pub const FIXED_POINT_SCALE: f64 = (1u64 << 40) as f64;

/// A PPS skew this large cannot come from a fiber.
pub const MAX_SKEW_SECONDS: f64 = 1e-6;

const PS_PER_SECOND: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fiber {
    /// The short reference fiber.
    F1,
    /// The long reference fiber.
    F2,
    /// `f1` and `f2` joined.
    F1F2,
}

impl Fiber {
    /// Measurement order of the latency procedure.
    pub const ALL: [Fiber; 3] = [Fiber::F1, Fiber::F2, Fiber::F1F2];

    pub fn label(&self) -> &'static str {
        match self {
            Fiber::F1 => "f1",
            Fiber::F2 => "f2",
            Fiber::F1F2 => "f1+f2",
        }
    }
}

impl fmt::Display for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Wavelength variant of an SFP. The two variants have the roles of the
/// forward and reverse wavelengths swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SfpColor {
    Blue,
    Violet,
}

impl fmt::Display for SfpColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SfpColor::Blue => write!(f, "blue"),
            SfpColor::Violet => write!(f, "violet"),
        }
    }
}

impl FromStr for SfpColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(SfpColor::Blue),
            "violet" => Ok(SfpColor::Violet),
            _ => Err(format!("unknown SFP color '{}'", s)),
        }
    }
}

/// Key of an asymmetry coefficient: the color of the slave SFP and the port
/// it is plugged into. Written as `<color>-wr<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsymmetryKey {
    pub color: SfpColor,
    pub port: u8,
}

impl fmt::Display for AsymmetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-wr{}", self.color, self.port)
    }
}

impl FromStr for AsymmetryKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (color, port) = s
            .split_once("-wr")
            .ok_or_else(|| format!("malformed asymmetry key '{}'", s))?;
        Ok(AsymmetryKey {
            color: color.parse()?,
            port: port
                .parse()
                .map_err(|_| format!("malformed port in asymmetry key '{}'", s))?,
        })
    }
}

/// Fiber latency deltas in picoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiberLatency {
    /// Propagation added by `f1`: `delay(f1+f2) - delay(f2)`.
    pub delta1: f64,
    /// Propagation added by `f2`: `delay(f1+f2) - delay(f1)`.
    pub delta2: f64,
}

impl FiberLatency {
    /// Zero deltas mean the latency was never measured.
    pub fn is_measured(&self) -> bool {
        self.delta1 != 0.0 && self.delta2 != 0.0
    }
}

/// What a calibration session produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationResult {
    pub fiber_latency: Option<FiberLatency>,
    /// Fixed-point asymmetry coefficients, scaled by 2^40.
    pub asymmetry: BTreeMap<AsymmetryKey, f64>,
    /// Per-port `(tx, rx)` delays, in picoseconds.
    pub port_delays: BTreeMap<String, (i64, i64)>,
}

impl CalibrationResult {
    /// Overwrites the values `other` has with those of `other`.
    pub fn merge(&mut self, other: CalibrationResult) {
        if other.fiber_latency.is_some() {
            self.fiber_latency = other.fiber_latency;
        }
        self.asymmetry.extend(other.asymmetry);
        self.port_delays.extend(other.port_delays);
    }

    /// The coefficient as the integer the device consumes.
    pub fn asymmetry_fixed_point(&self, key: &AsymmetryKey) -> Option<i64> {
        self.asymmetry.get(key).map(|alpha_n| alpha_n.round() as i64)
    }
}

/// Mean round-trip time and PHY delays measured on one fiber.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiberDelayMeasurement {
    pub fiber: Fiber,
    pub mean_rtt: f64,
    pub delays: PhyDelays,
}

impl FiberDelayMeasurement {
    /// Round-trip time without the receive-side bitslides.
    ///
    /// With every delay in the SFP database zeroed, the Rx delays the device
    /// reports are only the bitslides, which must not count as fiber delay.
    pub fn link_delay(&self) -> f64 {
        self.mean_rtt - self.delays.master_rx as f64 - self.delays.slave_rx as f64
    }
}

/// Derives the latency deltas from the three fiber measurements.
pub fn latency_deltas(
    f1: &FiberDelayMeasurement,
    f2: &FiberDelayMeasurement,
    f1f2: &FiberDelayMeasurement,
) -> FiberLatency {
    let concatenated = f1f2.link_delay();
    FiberLatency {
        delta1: concatenated - f2.link_delay(),
        delta2: concatenated - f1.link_delay(),
    }
}

/// Derives the fixed-point asymmetry coefficient from `delta2` and the PPS
/// skews measured on `f1` and `f2`, all in picoseconds.
pub fn asymmetry_coefficient(
    delta2: f64,
    skew_f1: f64,
    skew_f2: f64,
    color: SfpColor,
) -> Result<f64, CalibrationError> {
    let dif = skew_f2 - skew_f1;
    let denominator = 0.5 * delta2 - dif;
    let alpha = (2.0 * dif) / denominator;
    let alpha_n = FIXED_POINT_SCALE * ((alpha + 1.0) / (alpha + 2.0) - 0.5);
    if denominator == 0.0 || !alpha_n.is_finite() {
        return Err(CalibrationError::MeasureError { dif, delta2 });
    }
    debug!("dif = {} ps, alpha = {}, alpha_n = {}", dif, alpha, alpha_n);
    Ok(match color {
        SfpColor::Blue => alpha_n,
        SfpColor::Violet => -alpha_n,
    })
}

/// Parameters of the measurement procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    /// Samples averaged for each measurement.
    pub n_samples: u32,
    /// Pause between two samples.
    pub sample_interval: Duration,
    /// Pause after the operator connected a fiber.
    pub connect_settle: Duration,
    /// Pause between two servo state polls.
    pub lock_poll: Duration,
    /// Give up when the servo has not locked after this long.
    pub lock_timeout: Duration,
    /// Port linking the two devices.
    pub port: u8,
    pub master_sfp_sn: String,
    pub slave_sfp_sn: String,
    /// Expected PPS signal range, in volts.
    pub trigger_v_min: f64,
    pub trigger_v_max: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            n_samples: 10,
            sample_interval: Duration::from_secs(5),
            connect_settle: Duration::from_secs(1),
            lock_poll: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(600),
            port: 1,
            master_sfp_sn: String::from("AXGE-3454-0531"),
            slave_sfp_sn: String::from("AXGE-1254-0531"),
            trigger_v_min: 0.0,
            trigger_v_max: 5.0,
        }
    }
}

/// The step of a fiber measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberPhase {
    AwaitingConnection,
    Settling,
    Measuring,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Idle,
    DevicesConfigured,
    PerFiber { fiber: Fiber, phase: FiberPhase },
    AllFibersDone,
    LatencyComputed,
    AsymmetryComputed,
    Aborted(String),
}

/// The operator swapping fibers between the devices.
pub trait FiberSwap {
    /// Returns once `fiber` links the two devices.
    fn connect(&mut self, fiber: Fiber) -> io::Result<()>;
}

impl<F: FnMut(Fiber) -> io::Result<()>> FiberSwap for F {
    fn connect(&mut self, fiber: Fiber) -> io::Result<()> {
        self(fiber)
    }
}

/// A calibration session: the devices and instrument taking part, and what
/// has been measured so far. The first device added is the master, the
/// second one the slave.
pub struct Session {
    devices: Vec<Box<dyn WrDevice>>,
    instrument: Option<Box<dyn MeasurementInstrument>>,
    settings: CalibrationSettings,
    result: CalibrationResult,
    state: CalibrationState,
}

impl Session {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            devices: Vec::new(),
            instrument: None,
            settings,
            result: CalibrationResult::default(),
            state: CalibrationState::Idle,
        }
    }

    pub fn add_device(&mut self, device: Box<dyn WrDevice>) {
        info!("Added WR device {}", device.name());
        self.devices.push(device);
    }

    pub fn set_instrument(&mut self, instrument: Box<dyn MeasurementInstrument>) {
        self.instrument = Some(instrument);
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn result(&self) -> &CalibrationResult {
        &self.result
    }

    /// Replaces the in-memory result, e.g. with one read from a file.
    pub fn load_result(&mut self, result: CalibrationResult) {
        self.result = result;
    }

    pub fn into_result(self) -> CalibrationResult {
        self.result
    }

    /// Measures the fiber latency deltas and stores them in the result.
    ///
    /// On failure nothing is stored: a run must be restarted from the first
    /// fiber.
    pub fn fiber_latency(&mut self, swap: &mut dyn FiberSwap) -> Result<FiberLatency, CalibrationError> {
        self.state = CalibrationState::Idle;
        match self.run_latency(swap) {
            Ok(latency) => {
                info!(
                    "Fiber latency values: delta1 = {:.1} ps, delta2 = {:.1} ps",
                    latency.delta1, latency.delta2
                );
                self.result.fiber_latency = Some(latency);
                self.state = CalibrationState::LatencyComputed;
                Ok(latency)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Measures the asymmetry coefficient for a slave SFP of `color` on
    /// `port` and stores it in the result. Needs the fiber latency.
    pub fn fiber_asymmetry(
        &mut self,
        color: SfpColor,
        port: u8,
        swap: &mut dyn FiberSwap,
    ) -> Result<f64, CalibrationError> {
        self.state = CalibrationState::Idle;
        match self.run_asymmetry(color, port, swap) {
            Ok(alpha_n) => {
                let key = AsymmetryKey { color, port };
                info!("Fiber asymmetry {} = {}", key, alpha_n);
                self.result.asymmetry.insert(key, alpha_n);
                self.state = CalibrationState::AsymmetryComputed;
                Ok(alpha_n)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn abort(&mut self, e: CalibrationError) -> CalibrationError {
        error!("Calibration aborted: {}", e);
        self.state = CalibrationState::Aborted(e.to_string());
        e
    }

    /// Checks everything a measurement on the device pair linked by `port`
    /// needs, before any I/O.
    fn check_pair(&self, port: u8) -> Result<(), CalibrationError> {
        if self.devices.len() < 2 {
            return Err(CalibrationError::WrDeviceNeeded {
                found: self.devices.len(),
            });
        }
        let ports = self.devices[..2].iter().map(|d| d.port_count()).min().unwrap_or(0);
        if port == 0 || port > ports {
            return Err(CalibrationError::InvalidPort(port));
        }
        if self.settings.n_samples == 0 {
            return Err(CalibrationError::InvalidSampleCount);
        }
        Ok(())
    }

    fn run_latency(&mut self, swap: &mut dyn FiberSwap) -> Result<FiberLatency, CalibrationError> {
        let port = self.settings.port;
        self.check_pair(port)?;
        let Session {
            devices,
            settings,
            state,
            ..
        } = self;
        let settings = &*settings;
        let (master, slave) = pair(devices);

        configure_pair(master, slave, settings, port)?;
        *state = CalibrationState::DevicesConfigured;
        info!("Starting fiber latency measurement procedure");

        // partial measurements only live here and are dropped on error
        let mut measure = |fiber: Fiber| -> Result<FiberDelayMeasurement, CalibrationError> {
            bring_up(slave, fiber, port, settings, state, swap)?;
            *state = CalibrationState::PerFiber {
                fiber,
                phase: FiberPhase::Measuring,
            };
            measure_round_trip(slave, fiber, settings)
        };
        let f1 = measure(Fiber::F1)?;
        let f2 = measure(Fiber::F2)?;
        let f1f2 = measure(Fiber::F1F2)?;
        *state = CalibrationState::AllFibersDone;

        Ok(latency_deltas(&f1, &f2, &f1f2))
    }

    fn run_asymmetry(
        &mut self,
        color: SfpColor,
        port: u8,
        swap: &mut dyn FiberSwap,
    ) -> Result<f64, CalibrationError> {
        if self.devices.len() < 2 {
            return Err(CalibrationError::WrDeviceNeeded {
                found: self.devices.len(),
            });
        }
        if self.instrument.is_none() {
            return Err(CalibrationError::MeasurementInstrumentNeeded);
        }
        let latency = match self.result.fiber_latency {
            Some(latency) if latency.is_measured() => latency,
            _ => return Err(CalibrationError::FiberLatencyNeeded),
        };
        self.check_pair(port)?;

        let Session {
            devices,
            instrument,
            settings,
            state,
            ..
        } = self;
        let instrument = instrument
            .as_mut()
            .ok_or(CalibrationError::MeasurementInstrumentNeeded)?;
        let (master, slave) = pair(devices);

        configure_pair(master, slave, settings, port)?;
        *state = CalibrationState::DevicesConfigured;

        let (trig1, trig2) = instrument
            .trigger_level(settings.trigger_v_min, settings.trigger_v_max)
            .map_err(CalibrationError::InstrumentSetup)?;
        debug!("Trigger levels: {} V, {} V", trig1, trig2);

        let mut skews = [0.0f64; 2];
        for (skew, fiber) in skews.iter_mut().zip([Fiber::F1, Fiber::F2]) {
            bring_up(slave, fiber, port, settings, state, swap)?;
            *state = CalibrationState::PerFiber {
                fiber,
                phase: FiberPhase::Measuring,
            };
            let seconds = instrument
                .mean_time_interval(
                    settings.n_samples,
                    settings.sample_interval.as_secs_f64(),
                    trig1,
                    trig2,
                )
                .map_err(|source| CalibrationError::Instrument { fiber, source })?;
            if seconds.abs() >= MAX_SKEW_SECONDS {
                return Err(CalibrationError::MeasuringError { fiber, seconds });
            }
            *skew = seconds * PS_PER_SECOND;
            info!("Master to slave PPS skew on fiber {}: {:.1} ps", fiber, *skew);
        }
        *state = CalibrationState::AllFibersDone;

        asymmetry_coefficient(latency.delta2, skews[0], skews[1], color)
    }
}

fn pair(devices: &mut [Box<dyn WrDevice>]) -> (&mut dyn WrDevice, &mut dyn WrDevice) {
    let (master, rest) = devices.split_at_mut(1);
    (master[0].as_mut(), rest[0].as_mut())
}

fn setup_error(role: Role) -> impl Fn(DeviceError) -> CalibrationError {
    move |source| CalibrationError::Setup { role, source }
}

fn fiber_error(role: Role, fiber: Fiber) -> impl Fn(DeviceError) -> CalibrationError {
    move |source| CalibrationError::Device {
        role,
        fiber,
        source,
    }
}

/// Zeroes the SFP database of both devices so the round-trip time only holds
/// the physical delays and bitslides, then starts the link.
fn configure_pair(
    master: &mut dyn WrDevice,
    slave: &mut dyn WrDevice,
    settings: &CalibrationSettings,
    port: u8,
) -> Result<(), CalibrationError> {
    info!("Setting initial parameters in WR devices");
    master.erase_sfp_config().map_err(setup_error(Role::Master))?;
    slave.erase_sfp_config().map_err(setup_error(Role::Slave))?;

    slave
        .write_sfp_config(&settings.slave_sfp_sn, port, 0, 0, 0)
        .map_err(setup_error(Role::Slave))?;
    master
        .write_sfp_config(&settings.master_sfp_sn, port, 0, 0, 0)
        .map_err(setup_error(Role::Master))?;
    load_sfp_config(master, Role::Master)?;
    load_sfp_config(slave, Role::Slave)?;

    slave.set_slaveport(port).map_err(setup_error(Role::Slave))?;
    master.set_master().map_err(setup_error(Role::Master))?;
    master.ptp_start().map_err(setup_error(Role::Master))?;
    slave.ptp_start().map_err(setup_error(Role::Slave))?;
    Ok(())
}

fn load_sfp_config(device: &mut dyn WrDevice, role: Role) -> Result<(), CalibrationError> {
    let matched = device.load_sfp_config().map_err(setup_error(role))?;
    if matched == 0 {
        warn!("{} ({}) did not match any SFP configuration", device.name(), role);
    }
    Ok(())
}

/// Has the operator connect `fiber` and waits until the slave servo locks.
fn bring_up(
    slave: &mut dyn WrDevice,
    fiber: Fiber,
    port: u8,
    settings: &CalibrationSettings,
    state: &mut CalibrationState,
    swap: &mut dyn FiberSwap,
) -> Result<(), CalibrationError> {
    *state = CalibrationState::PerFiber {
        fiber,
        phase: FiberPhase::AwaitingConnection,
    };
    info!("Connect both WR devices with fiber {} on port {}", fiber, port);
    swap.connect(fiber).map_err(CalibrationError::Operator)?;

    *state = CalibrationState::PerFiber {
        fiber,
        phase: FiberPhase::Settling,
    };
    pause(settings.connect_settle);
    wait_track_phase(slave, fiber, settings)
}

fn wait_track_phase(
    slave: &mut dyn WrDevice,
    fiber: Fiber,
    settings: &CalibrationSettings,
) -> Result<(), CalibrationError> {
    debug!("Waiting until TRACK_PHASE");
    let start = Instant::now();
    loop {
        if slave.in_trackphase().map_err(fiber_error(Role::Slave, fiber))? {
            info!("Servo locked on fiber {} after {:?}", fiber, start.elapsed());
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= settings.lock_timeout {
            return Err(CalibrationError::ServoNeverLocked { fiber, waited });
        }
        pause(settings.lock_poll);
    }
}

/// Time spent pausing between `n` samples, if it fits in a `Duration`.
fn sampling_time(interval: Duration, n: u32) -> Option<Duration> {
    interval.checked_mul(n.saturating_sub(1))
}

fn measure_round_trip(
    slave: &mut dyn WrDevice,
    fiber: Fiber,
    settings: &CalibrationSettings,
) -> Result<FiberDelayMeasurement, CalibrationError> {
    let n = settings.n_samples;
    match sampling_time(settings.sample_interval, n) {
        Some(estimate) => info!(
            "Measuring round-trip time on fiber {} (about {:?})",
            fiber, estimate
        ),
        None => info!("Measuring round-trip time on fiber {}", fiber),
    }
    let to_error = fiber_error(Role::Slave, fiber);

    let mut sum = 0.0;
    for i in 0..n {
        let rtt = slave.get_rtt().map_err(&to_error)?;
        debug!("rtt sample {}/{}: {} ps", i + 1, n, rtt);
        sum += rtt as f64;
        if i + 1 < n {
            pause(settings.sample_interval);
        }
    }
    let mean_rtt = sum / n as f64;
    let delays = slave.get_phy_delays().map_err(&to_error)?;
    info!("Fiber {}: mean rtt {:.1} ps, delays {:?}", fiber, mean_rtt, delays);

    Ok(FiberDelayMeasurement {
        fiber,
        mean_rtt,
        delays,
    })
}
