//! # WR shell simulator
//!
//! An in-memory model of the WRPC command shell of a WR device. It is driven
//! through the [`Transport`] trait exactly like a serial port: bytes written by
//! the command channel are collected until a carriage return, the command is
//! executed against the simulated state, and the console output (encoded echo,
//! command output, prompt) is queued for reading.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::status::PhyDelays;
use crate::transport::Transport;

/// Four control bytes the console emits before every character it prints.
const ECHO_CONTROL: &[u8; 4] = b"\x1b[0m";
/// Prompt printed after every command output. Six bytes long.
pub const PROMPT: &str = "\nwrc# ";
/// The SFP database holds 2 kinds of SFP for each of the 2 ports.
const SFP_DB_CAPACITY: usize = 4;

// Errors reported by the simulated shell. They are printed on the console like
// the real shell does, never returned to the channel.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ShellError {
    #[error("Unrecognized command '{0}'")]
    UnknownCommand(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("Invalid argument '{0}'")]
    InvalidArgument(String),
    #[error("SFP database full")]
    DatabaseFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfpEntry {
    pub sn: String,
    pub iface: String,
    pub delta_tx: i64,
    pub delta_rx: i64,
    pub beta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Auto,
    Master,
    Slave,
}

/// The state of a simulated WR device and its console.
#[derive(Debug, Clone)]
pub struct WrShellSimulator {
    pub sfp_db: Vec<SfpEntry>,
    pub init_script: Vec<String>,
    /// Serial number of the SFP reported by `sfp detect`.
    pub plugged_sfp: String,
    pub mode: Mode,
    pub ptp_running: bool,
    /// Number of `stat` queries after `ptp start` before the servo locks.
    pub lock_after: u32,
    /// Round-trip time reported once the script is exhausted.
    pub rtt: i64,
    /// Round-trip times reported by the next locked `stat` queries.
    pub rtt_script: VecDeque<i64>,
    pub delays: PhyDelays,
    /// Keys left out of the locked status line, as by a truncated read.
    pub omitted_status_keys: Vec<String>,
    /// Number of upcoming commands whose echo gets corrupted.
    pub garble_echoes: u32,
    /// Number of upcoming written bytes the link loses.
    pub drop_bytes: usize,
    commands: Vec<String>,
    stat_queries: u32,
    line: Vec<u8>,
    output: VecDeque<u8>,
}

impl Default for WrShellSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl WrShellSimulator {
    /// Creates a device with an empty SFP database and PTP stopped.
    pub fn new() -> Self {
        Self {
            sfp_db: Vec::new(),
            init_script: Vec::new(),
            plugged_sfp: String::from("AXGE-1254-0531"),
            mode: Mode::Auto,
            ptp_running: false,
            lock_after: 0,
            rtt: 0,
            rtt_script: VecDeque::new(),
            delays: PhyDelays::default(),
            omitted_status_keys: Vec::new(),
            garble_echoes: 0,
            drop_bytes: 0,
            commands: Vec::new(),
            stat_queries: 0,
            line: Vec::new(),
            output: VecDeque::new(),
        }
    }

    /// Every complete command line received, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_locked(&self) -> bool {
        self.ptp_running && self.stat_queries >= self.lock_after
    }

    /// Executes one command line and returns what the shell prints for it.
    pub fn process_command(&mut self, command: &str) -> Result<String, ShellError> {
        let mut args = command.split_whitespace();
        let verb = args.next().unwrap_or("");
        let sub = args.next();

        match (verb, sub) {
            ("sfp", Some("erase")) => {
                self.sfp_db.clear();
                Ok(String::new())
            }
            ("sfp", Some("add")) => self.handle_sfp_add(args),
            ("sfp", Some("detect")) => Ok(self.plugged_sfp.clone()),
            ("sfp", Some("match")) => Ok(self.handle_sfp_match()),
            ("sfp", Some("show")) => Ok(self.handle_sfp_show()),
            ("init", Some("erase")) => {
                self.init_script.clear();
                Ok(String::new())
            }
            ("init", Some("add")) => {
                let rest: Vec<&str> = args.collect();
                if rest.is_empty() {
                    return Err(ShellError::MissingArgument("init command"));
                }
                self.init_script.push(rest.join(" "));
                Ok(String::new())
            }
            ("mode", Some("master")) => {
                self.mode = Mode::Master;
                Ok(String::from("Master mode"))
            }
            ("mode", Some("slave")) => {
                self.mode = Mode::Slave;
                Ok(String::from("Slave mode"))
            }
            ("ptp", Some("start")) => {
                self.ptp_running = true;
                self.stat_queries = 0;
                Ok(String::new())
            }
            ("ptp", Some("stop")) => {
                self.ptp_running = false;
                Ok(String::new())
            }
            ("stat", None) => Ok(self.handle_stat()),
            _ => Err(ShellError::UnknownCommand(command.to_string())),
        }
    }

    fn handle_sfp_add<'a>(&mut self, mut args: impl Iterator<Item = &'a str>) -> Result<String, ShellError> {
        let sn = args.next().ok_or(ShellError::MissingArgument("serial number"))?;
        let iface = args.next().ok_or(ShellError::MissingArgument("interface"))?;
        if !iface.starts_with("wr") {
            return Err(ShellError::InvalidArgument(iface.to_string()));
        }
        let mut parse = |what: &'static str| -> Result<i64, ShellError> {
            let value = args.next().ok_or(ShellError::MissingArgument(what))?;
            value
                .parse()
                .map_err(|_| ShellError::InvalidArgument(value.to_string()))
        };
        let delta_tx = parse("delta tx")?;
        let delta_rx = parse("delta rx")?;
        let beta = parse("beta")?;

        if self.sfp_db.len() >= SFP_DB_CAPACITY {
            return Err(ShellError::DatabaseFull);
        }
        self.sfp_db.push(SfpEntry {
            sn: sn.to_string(),
            iface: iface.to_string(),
            delta_tx,
            delta_rx,
            beta,
        });
        Ok(String::new())
    }

    fn handle_sfp_match(&self) -> String {
        match self.sfp_db.iter().find(|e| e.sn == self.plugged_sfp) {
            Some(e) => format!(
                "SFP matched, dTx={} dRx={} alpha={}",
                e.delta_tx, e.delta_rx, e.beta
            ),
            None => String::from("Could not match to DB"),
        }
    }

    fn handle_sfp_show(&self) -> String {
        self.sfp_db
            .iter()
            .enumerate()
            .map(|(i, e)| {
                format!(
                    "{}: PN:{} {} dTx: {} dRx: {} alpha: {}",
                    i + 1,
                    e.sn,
                    e.iface,
                    e.delta_tx,
                    e.delta_rx,
                    e.beta
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn handle_stat(&mut self) -> String {
        if !self.ptp_running {
            return String::from("lnk:0 rx:0 tx:0 lock:0 sv:0 ss:'NONE'");
        }
        let locked = self.is_locked();
        self.stat_queries = self.stat_queries.saturating_add(1);
        if !locked {
            return String::from("lnk:1 rx:12 tx:12 lock:1 sv:1 ss:'SYNC_PHASE' aux:0");
        }
        let rtt = self.rtt_script.pop_front().unwrap_or(self.rtt);
        let line = format!(
            "lnk:1 rx:8812 tx:8813 lock:1 sv:1 ss:'TRACK_PHASE' aux:0 sec:1 nsec:0 \
             mu:{} dms:{} dtxm:{} drxm:{} dtxs:{} drxs:{} asym:0",
            rtt,
            rtt / 2,
            self.delays.master_tx,
            self.delays.master_rx,
            self.delays.slave_tx,
            self.delays.slave_rx
        );
        line
            .split(' ')
            .filter(|token| {
                let key = token.split(':').next().unwrap_or("");
                !self.omitted_status_keys.iter().any(|k| k == key)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn complete_line(&mut self) {
        let command = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();

        let echoed = if self.garble_echoes > 0 {
            self.garble_echoes -= 1;
            // a character lost on the way in
            command.chars().skip(1).collect()
        } else {
            command.clone()
        };
        self.print(&echoed);
        self.print("\n");

        // a corrupted command never reaches the interpreter
        if echoed != command {
            self.print(PROMPT);
            return;
        }

        self.commands.push(command.clone());
        let printed = match self.process_command(&command) {
            Ok(text) => text,
            Err(e) => e.to_string(),
        };
        self.print(&printed);
        self.print(PROMPT);
    }

    /// Queues `text` on the console, every byte behind the control sequence.
    fn print(&mut self, text: &str) {
        for b in text.bytes() {
            self.output.extend(ECHO_CONTROL);
            self.output.push_back(b);
        }
    }
}

impl Transport for WrShellSimulator {
    fn write_byte(&mut self, byte: u8) -> io::Result<usize> {
        if self.drop_bytes > 0 {
            self.drop_bytes -= 1;
            return Ok(0);
        }
        if byte == b'\r' {
            self.complete_line();
        } else {
            self.line.push(byte);
        }
        Ok(1)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.output.clear();
        self.line.clear();
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let end = match self.output.iter().position(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => self.output.len(),
        };
        Ok(self.output.drain(..end).collect())
    }

    fn read_up_to(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let n = max.min(self.output.len());
        Ok(self.output.drain(..n).collect())
    }
}

/// A handle to a simulator shared between a device under test and the test
/// itself, which can change the link (e.g. the connected fiber) while the
/// device is owned elsewhere.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLink(Rc<RefCell<WrShellSimulator>>);

impl SimulatedLink {
    pub fn new(sim: WrShellSimulator) -> Self {
        Self(Rc::new(RefCell::new(sim)))
    }

    pub fn sim(&self) -> Ref<'_, WrShellSimulator> {
        self.0.borrow()
    }

    pub fn sim_mut(&self) -> RefMut<'_, WrShellSimulator> {
        self.0.borrow_mut()
    }
}

impl Transport for SimulatedLink {
    fn write_byte(&mut self, byte: u8) -> io::Result<usize> {
        self.0.borrow_mut().write_byte(byte)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.0.borrow_mut().clear()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.0.borrow_mut().read_line()
    }

    fn read_up_to(&mut self, max: usize) -> io::Result<Vec<u8>> {
        self.0.borrow_mut().read_up_to(max)
    }
}
