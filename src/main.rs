use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossterm::execute;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use wrcal::settings::{read_settings_file, Settings};
use wrcal::sim::WrShellSimulator;
use wrcal::transport::Transport;
use wrcal::{calfile, DeviceKind, Fiber, FiberSwap, Session};

#[derive(Parser)]
#[command(version, about = "Calibration of White Rabbit links")]
struct Cli {
    /// TOML settings file. Defaults apply when omitted.
    #[arg(short, long, env = "WRCAL_CONFIG")]
    config: Option<PathBuf>,
    /// Log every command exchanged with the devices.
    #[arg(long)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure the fiber latency of the reference fibers f1 and f2.
    Latency {
        /// Calibration file to store the result in. Existing values are kept.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the status of one device.
    Status {
        #[arg(short, long)]
        device: String,
        #[arg(short, long, default_value = "wr-len")]
        kind: DeviceKind,
    },
    /// Print a stored calibration file.
    Show { file: PathBuf },
    /// Serve a simulated WR device shell on a serial port.
    Simulate {
        #[arg(short, long)]
        port: String,
        #[arg(short, long, default_value_t = 115_200)]
        baud_rate: u32,
        /// Round-trip time reported once locked, in picoseconds.
        #[arg(long, default_value_t = 0)]
        rtt: i64,
        /// Status queries before the servo locks.
        #[arg(long, default_value_t = 3)]
        lock_after: u32,
    },
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let console_layer = fmt::layer()
        .with_ansi(!cfg!(windows))
        .with_file(true)
        .with_line_number(true);
    let collector = tracing_subscriber::registry().with(console_layer).with(filter);
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let settings = match &cli.config {
        Some(path) => read_settings_file(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    match cli.command {
        Command::Latency { output } => run_latency(&settings, &output),
        Command::Status { device, kind } => run_status(&settings, kind, &device),
        Command::Show { file } => run_show(&file),
        Command::Simulate {
            port,
            baud_rate,
            rtt,
            lock_after,
        } => run_simulator(&port, baud_rate, rtt, lock_after),
    }
}

/// Asks the operator on the terminal to plug a fiber, and waits for Enter.
struct OperatorPrompt;

impl FiberSwap for OperatorPrompt {
    fn connect(&mut self, fiber: Fiber) -> io::Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Color::Yellow),
            Print(format!(
                "\nConnect both WR devices with fiber {} and press Enter ",
                fiber
            )),
            ResetColor
        )?;
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "operator input closed",
            ));
        }
        Ok(())
    }
}

fn run_latency(settings: &Settings, output: &Path) -> anyhow::Result<()> {
    let device_config = settings.serial.device_config();
    let mut session = Session::new(settings.calibration.calibration_settings());
    for (kind, path) in settings.device_paths()? {
        let device = kind
            .open(&path, &device_config)
            .with_context(|| format!("opening {} device on {}", kind, path))?;
        session.add_device(device);
    }

    let latency = session.fiber_latency(&mut OperatorPrompt)?;
    println!(
        "Fiber latency: delta1 = {} ps, delta2 = {} ps",
        latency.delta1, latency.delta2
    );

    let mut stored = if output.exists() {
        calfile::read(output).with_context(|| format!("reading {}", output.display()))?
    } else {
        Default::default()
    };
    stored.merge(session.into_result());
    calfile::write(output, &stored).with_context(|| format!("writing {}", output.display()))?;
    info!("Calibration stored in {}", output.display());
    Ok(())
}

fn run_status(settings: &Settings, kind: DeviceKind, path: &str) -> anyhow::Result<()> {
    let mut device = kind.open(path, &settings.serial.device_config())?;
    let status = device.status()?;
    println!("{}", device.name());
    println!("  servo state: {}", status.servo_state);
    println!("  round-trip time: {} ps", status.rtt);
    let (master_tx, master_rx) = status.delays.master();
    let (slave_tx, slave_rx) = status.delays.slave();
    println!("  master delays: tx {} ps, rx {} ps", master_tx, master_rx);
    println!("  slave delays: tx {} ps, rx {} ps", slave_tx, slave_rx);
    Ok(())
}

fn run_show(file: &Path) -> anyhow::Result<()> {
    let result = calfile::read(file).with_context(|| format!("reading {}", file.display()))?;
    match &result.fiber_latency {
        Some(latency) if latency.is_measured() => println!(
            "fiber latency: delta1 = {} ps, delta2 = {} ps",
            latency.delta1, latency.delta2
        ),
        _ => println!("fiber latency: not measured"),
    }
    for key in result.asymmetry.keys() {
        if let Some(alpha_n) = result.asymmetry_fixed_point(key) {
            println!("fiber asymmetry {}: {}", key, alpha_n);
        }
    }
    for (key, (tx, rx)) in &result.port_delays {
        println!("port delay {}: tx {} ps, rx {} ps", key, tx, rx);
    }
    Ok(())
}

// Feeds bytes from the serial port to the simulated shell and writes its
// console output back, until the port fails.
fn run_simulator(port_name: &str, baud_rate: u32, rtt: i64, lock_after: u32) -> anyhow::Result<()> {
    let mut port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("opening {}", port_name))?;

    let mut sim = WrShellSimulator::new();
    sim.rtt = rtt;
    sim.lock_after = lock_after;
    info!(
        "Simulated WR shell listening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    let mut serial_buf = vec![0u8; 128];
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(n) => {
                for &byte in &serial_buf[..n] {
                    sim.write_byte(byte)?;
                }
                let console = sim.read_up_to(usize::MAX)?;
                if !console.is_empty() {
                    if let Some(command) = sim.commands().last() {
                        debug!("> {}", command);
                    }
                    port.write_all(&console)?;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => {
                warn!("Serial port error: {}", e);
                return Err(e.into());
            }
        }
    }
}
