use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use approx::assert_relative_eq;
use test_log::test;

use wrcal::calibration::{AsymmetryKey, FIXED_POINT_SCALE};
use wrcal::error::{ChannelError, DeviceError, InstrumentError, Role, StatusError};
use wrcal::sim::{SimulatedLink, WrShellSimulator};
use wrcal::status::PhyDelays;
use wrcal::{
    CalibrationError, CalibrationResult, CalibrationSettings, CalibrationState, ChannelConfig,
    Fiber, FiberLatency, MeasurementInstrument, Session, SfpColor, WrLen,
};

fn quick_settings() -> CalibrationSettings {
    CalibrationSettings {
        n_samples: 2,
        sample_interval: Duration::ZERO,
        connect_settle: Duration::ZERO,
        lock_poll: Duration::ZERO,
        lock_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn device(link: &SimulatedLink, name: &str) -> Box<WrLen<SimulatedLink>> {
    let config = ChannelConfig {
        inter_char_delay: Duration::ZERO,
        settle_delay: Duration::ZERO,
        ..Default::default()
    };
    Box::new(
        WrLen::new(link.clone(), config)
            .with_name(name.to_string())
            .with_command_delay(Duration::ZERO),
    )
}

/// A master and a slave linked by simulated consoles.
fn linked_pair(settings: CalibrationSettings) -> (Session, SimulatedLink, SimulatedLink) {
    let master = SimulatedLink::new(WrShellSimulator::new());
    master.sim_mut().plugged_sfp = settings.master_sfp_sn.clone();
    let slave = SimulatedLink::new(WrShellSimulator::new());
    slave.sim_mut().plugged_sfp = settings.slave_sfp_sn.clone();
    let mut session = Session::new(settings);
    session.add_device(device(&master, "master"));
    session.add_device(device(&slave, "slave"));
    (session, master, slave)
}

fn rtt_of(fiber: Fiber) -> i64 {
    match fiber {
        Fiber::F1 => 1000,
        Fiber::F2 => 2000,
        Fiber::F1F2 => 2800,
    }
}

fn no_swap(_: Fiber) -> io::Result<()> {
    Ok(())
}

/// Reports the PPS skews it was given, one per measurement.
struct ScriptedInstrument {
    skews: VecDeque<f64>,
}

impl ScriptedInstrument {
    fn new(skews: &[f64]) -> Self {
        Self {
            skews: skews.iter().copied().collect(),
        }
    }
}

impl MeasurementInstrument for ScriptedInstrument {
    fn trigger_level(&mut self, v_min: f64, v_max: f64) -> Result<(f64, f64), InstrumentError> {
        let level = (v_min + v_max) / 2.0;
        Ok((level, level))
    }

    fn mean_time_interval(
        &mut self,
        _n_samples: u32,
        _t_samples: f64,
        _trig1: f64,
        _trig2: f64,
    ) -> Result<f64, InstrumentError> {
        self.skews
            .pop_front()
            .ok_or_else(|| InstrumentError::Other("no more samples".to_string()))
    }
}

// --- Tests for the fiber latency procedure ---

#[test]
fn fiber_latency_from_three_fibers() {
    let (mut session, master, slave) = linked_pair(quick_settings());
    slave.sim_mut().delays = PhyDelays {
        master_tx: 0,
        master_rx: 30,
        slave_tx: 0,
        slave_rx: 20,
    };

    let mut connected = Vec::new();
    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        connected.push(fiber);
        link.sim_mut().rtt = rtt_of(fiber);
        Ok(())
    };
    let latency = session.fiber_latency(&mut swap).unwrap();

    assert_eq!(connected, Fiber::ALL.to_vec());
    assert_relative_eq!(latency.delta1, 800.0);
    assert_relative_eq!(latency.delta2, 1800.0);
    assert_eq!(session.result().fiber_latency, Some(latency));
    assert_eq!(session.state(), &CalibrationState::LatencyComputed);

    // neutral SFP configuration on both ends, then master and slave roles
    let master_cmds = master.sim().commands().to_vec();
    assert_eq!(master_cmds[0], "sfp erase");
    assert_eq!(master_cmds[1], "sfp add AXGE-3454-0531 wr0 0 0 0");
    assert!(master_cmds.contains(&"mode master".to_string()));
    let slave_cmds = slave.sim().commands().to_vec();
    assert_eq!(slave_cmds[1], "sfp add AXGE-1254-0531 wr0 0 0 0");
    assert!(slave_cmds.contains(&"mode slave".to_string()));
    assert!(!master_cmds.iter().any(|c| c == "stat"));
}

#[test]
fn round_trip_time_is_averaged() {
    let (mut session, _master, slave) = linked_pair(quick_settings());
    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        let rtt = rtt_of(fiber);
        // the first locked status line answers the servo state poll
        link.sim_mut().rtt_script = VecDeque::from(vec![0, rtt - 10, rtt + 10]);
        Ok(())
    };
    let latency = session.fiber_latency(&mut swap).unwrap();
    assert_relative_eq!(latency.delta1, 800.0);
    assert_relative_eq!(latency.delta2, 1800.0);
}

#[test]
fn garbled_echoes_are_retried() {
    let (mut session, master, slave) = linked_pair(quick_settings());
    master.sim_mut().garble_echoes = 2;
    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        link.sim_mut().rtt = rtt_of(fiber);
        Ok(())
    };
    session.fiber_latency(&mut swap).unwrap();
    assert_eq!(master.sim().commands()[0], "sfp erase");
    assert_eq!(master.sim().garble_echoes, 0);
}

#[test]
fn slave_echo_failure_names_the_fiber() {
    let (mut session, _master, slave) = linked_pair(quick_settings());
    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        link.sim_mut().rtt = rtt_of(fiber);
        if fiber == Fiber::F2 {
            // more corrupted echoes than attempts per command
            link.sim_mut().garble_echoes = 3;
        }
        Ok(())
    };

    match session.fiber_latency(&mut swap) {
        Err(CalibrationError::Device {
            role: Role::Slave,
            fiber: Fiber::F2,
            source: DeviceError::Channel(ChannelError::EchoMismatch { command, attempts, .. }),
        }) => {
            assert_eq!(command, "stat");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(session.result().fiber_latency, None);
    assert!(matches!(session.state(), CalibrationState::Aborted(_)));
}

#[test]
fn master_echo_failure_is_a_setup_error() {
    let (mut session, master, _slave) = linked_pair(quick_settings());
    master.sim_mut().garble_echoes = 3;

    match session.fiber_latency(&mut no_swap) {
        Err(CalibrationError::Setup {
            role: Role::Master,
            source: DeviceError::Channel(ChannelError::EchoMismatch { command, .. }),
        }) => assert_eq!(command, "sfp erase"),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(master.sim().commands().is_empty());
    assert_eq!(session.result().fiber_latency, None);
}

#[test]
fn status_without_slave_rx_delay_is_incomplete() {
    let (mut session, _master, slave) = linked_pair(quick_settings());
    slave.sim_mut().omitted_status_keys.push("drxs".to_string());

    match session.fiber_latency(&mut no_swap) {
        Err(CalibrationError::Device {
            role: Role::Slave,
            fiber: Fiber::F1,
            source: DeviceError::Status(StatusError::IncompleteStatus { missing, .. }),
        }) => assert_eq!(missing, ["drxs"]),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(session.result().fiber_latency, None);
}

#[test]
fn servo_that_never_locks() {
    let (mut session, _master, slave) = linked_pair(CalibrationSettings {
        lock_timeout: Duration::from_millis(20),
        ..quick_settings()
    });
    slave.sim_mut().lock_after = u32::MAX;

    let err = session.fiber_latency(&mut no_swap).unwrap_err();
    match err {
        CalibrationError::ServoNeverLocked { fiber, waited } => {
            assert_eq!(fiber, Fiber::F1);
            assert!(waited >= Duration::from_millis(20));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(matches!(session.state(), CalibrationState::Aborted(_)));
}

#[test]
fn aborted_run_keeps_the_stored_latency() {
    let (mut session, _master, slave) = linked_pair(quick_settings());
    let stored = FiberLatency {
        delta1: 5.0,
        delta2: 6.0,
    };
    session.load_result(CalibrationResult {
        fiber_latency: Some(stored),
        ..Default::default()
    });

    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        if fiber == Fiber::F1F2 {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "operator left"));
        }
        link.sim_mut().rtt = rtt_of(fiber);
        Ok(())
    };
    assert!(matches!(
        session.fiber_latency(&mut swap),
        Err(CalibrationError::Operator(_))
    ));
    assert_eq!(session.result().fiber_latency, Some(stored));
}

// --- Tests for the fiber asymmetry procedure ---

fn measured_session() -> (Session, SimulatedLink) {
    let (mut session, _master, slave) = linked_pair(quick_settings());
    let link = slave.clone();
    let mut swap = |fiber: Fiber| -> io::Result<()> {
        link.sim_mut().rtt = rtt_of(fiber);
        Ok(())
    };
    session.fiber_latency(&mut swap).unwrap();
    (session, slave)
}

#[test]
fn fiber_asymmetry_for_both_colors() {
    let (mut session, _slave) = measured_session();
    session.set_instrument(Box::new(ScriptedInstrument::new(&[
        100e-12, 250e-12, 100e-12, 250e-12,
    ])));

    let blue = session
        .fiber_asymmetry(SfpColor::Blue, 1, &mut no_swap)
        .unwrap();
    // dif = 150 ps, alpha = 0.4
    assert_relative_eq!(blue, FIXED_POINT_SCALE / 12.0, max_relative = 1e-6);
    assert_eq!(session.state(), &CalibrationState::AsymmetryComputed);

    let violet = session
        .fiber_asymmetry(SfpColor::Violet, 1, &mut no_swap)
        .unwrap();
    assert_relative_eq!(violet, -blue, max_relative = 1e-9);

    let keys: Vec<String> = session
        .result()
        .asymmetry
        .keys()
        .map(AsymmetryKey::to_string)
        .collect();
    assert_eq!(keys, ["blue-wr1", "violet-wr1"]);
}

#[test]
fn implausible_skew_is_a_wiring_error() {
    let (mut session, _slave) = measured_session();
    session.set_instrument(Box::new(ScriptedInstrument::new(&[100e-12, 2e-6])));

    match session.fiber_asymmetry(SfpColor::Blue, 1, &mut no_swap) {
        Err(CalibrationError::MeasuringError { fiber, seconds }) => {
            assert_eq!(fiber, Fiber::F2);
            assert_relative_eq!(seconds, 2e-6);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(session.result().asymmetry.is_empty());
}

#[test]
fn instrument_failure_names_the_fiber() {
    let (mut session, _slave) = measured_session();
    session.set_instrument(Box::new(ScriptedInstrument::new(&[])));
    assert!(matches!(
        session.fiber_asymmetry(SfpColor::Blue, 2, &mut no_swap),
        Err(CalibrationError::Instrument {
            fiber: Fiber::F1,
            ..
        })
    ));
}
