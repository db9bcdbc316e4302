//! Decoding of the `stat` line printed by a WR device.
//!
//! The line is a sequence of whitespace separated `key:value` tokens, e.g.
//!
//! ```text
//! lnk:1 rx:8812 tx:8813 lock:1 sv:1 ss:'TRACK_PHASE' aux:0 sec:1234 nsec:0 mu:1234 dms:617 dtxm:10 drxm:20 dtxs:30 drxs:40
//! ```
//!
//! Only the servo state, round-trip time and PHY delays are used; every other
//! token is ignored.

use std::fmt;

use crate::error::StatusError;

/// Servo state value printed when the link is locked, quotes included.
const TRACK_PHASE: &str = "'TRACK_PHASE'";

const MU: &str = "mu";
const DELAY_KEYS: [&str; 4] = ["dtxm", "drxm", "dtxs", "drxs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServoState {
    TrackPhase,
    /// Any other state, as printed by the device.
    Other(String),
    /// The line carried no `ss` token.
    Unknown,
}

impl ServoState {
    /// Exact match against the literal the device prints when locked.
    pub fn from_token(value: &str) -> Self {
        if value == TRACK_PHASE {
            ServoState::TrackPhase
        } else {
            ServoState::Other(value.to_string())
        }
    }

    pub fn is_track_phase(&self) -> bool {
        matches!(self, ServoState::TrackPhase)
    }
}

impl fmt::Display for ServoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServoState::TrackPhase => write!(f, "TRACK_PHASE"),
            ServoState::Other(s) => write!(f, "{}", s.trim_matches('\'')),
            ServoState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Transmit and receive delays of both ends of the link, in picoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhyDelays {
    pub master_tx: i64,
    pub master_rx: i64,
    pub slave_tx: i64,
    pub slave_rx: i64,
}

impl PhyDelays {
    pub fn master(&self) -> (i64, i64) {
        (self.master_tx, self.master_rx)
    }

    pub fn slave(&self) -> (i64, i64) {
        (self.slave_tx, self.slave_rx)
    }
}

/// A status snapshot. Always read fresh from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub servo_state: ServoState,
    /// Round-trip time in picoseconds.
    pub rtt: i64,
    pub delays: PhyDelays,
}

/// Parses a full status line. Fails with [`StatusError::IncompleteStatus`]
/// when `mu` or any of the four delay fields is absent.
///
/// When a key appears more than once, its first occurrence wins.
pub fn parse_status(text: &str) -> Result<DeviceStatus, StatusError> {
    let mut servo_state = None;
    let mut rtt = None;
    let mut delays: [Option<i64>; 4] = [None; 4];

    for (key, value) in tokens(text) {
        match key {
            "ss" => {
                servo_state.get_or_insert_with(|| ServoState::from_token(value));
            }
            MU => {
                if rtt.is_none() {
                    rtt = Some(parse_int(MU, value)?);
                }
            }
            _ => {
                if let Some(i) = DELAY_KEYS.iter().position(|k| *k == key) {
                    if delays[i].is_none() {
                        delays[i] = Some(parse_int(DELAY_KEYS[i], value)?);
                    }
                }
            }
        }
        if servo_state.is_some() && rtt.is_some() && delays.iter().all(Option::is_some) {
            break;
        }
    }

    let mut missing = Vec::new();
    if rtt.is_none() {
        missing.push(MU);
    }
    for (key, value) in DELAY_KEYS.iter().zip(delays.iter()) {
        if value.is_none() {
            missing.push(*key);
        }
    }
    match (rtt, delays) {
        (Some(rtt), [Some(master_tx), Some(master_rx), Some(slave_tx), Some(slave_rx)]) => {
            Ok(DeviceStatus {
                servo_state: servo_state.unwrap_or(ServoState::Unknown),
                rtt,
                delays: PhyDelays {
                    master_tx,
                    master_rx,
                    slave_tx,
                    slave_rx,
                },
            })
        }
        _ => Err(StatusError::IncompleteStatus {
            missing,
            text: text.trim().to_string(),
        }),
    }
}

/// Reads only the servo state. While the servo is still locking the device may
/// not print the delay fields yet, so this does not require them.
pub fn parse_servo_state(text: &str) -> ServoState {
    tokens(text)
        .find(|(key, _)| *key == "ss")
        .map(|(_, value)| ServoState::from_token(value))
        .unwrap_or(ServoState::Unknown)
}

fn tokens(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split_whitespace().filter_map(|token| token.split_once(':'))
}

fn parse_int(key: &'static str, value: &str) -> Result<i64, StatusError> {
    value.parse().map_err(|_| StatusError::InvalidField {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_complete_status() {
        let status = parse_status("ss:'TRACK_PHASE' mu:1234 dtxm:10 drxm:20 dtxs:30 drxs:40").unwrap();
        assert_eq!(status.servo_state, ServoState::TrackPhase);
        assert_eq!(status.rtt, 1234);
        assert_eq!(
            status.delays,
            PhyDelays {
                master_tx: 10,
                master_rx: 20,
                slave_tx: 30,
                slave_rx: 40,
            }
        );
        assert_eq!(status.delays.master(), (10, 20));
        assert_eq!(status.delays.slave(), (30, 40));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let line = "lnk:1 rx:8812 tx:8813 lock:1 sv:1 ss:'TRACK_PHASE' aux:0 sec:1234 \
                    nsec:0 mu:1234 dms:617 dtxm:10 drxm:20 dtxs:30 drxs:40 asym:0 temp";
        let status = parse_status(line).unwrap();
        assert_eq!(status.rtt, 1234);
        assert_eq!(status.delays.slave_rx, 40);
    }

    #[test]
    fn missing_rtt_is_incomplete() {
        let err = parse_status("ss:'TRACK_PHASE' dtxm:10 drxm:20 dtxs:30 drxs:40").unwrap_err();
        assert!(matches!(
            err,
            StatusError::IncompleteStatus { ref missing, .. } if missing == &vec!["mu"]
        ));
    }

    #[test]
    fn missing_delays_are_reported() {
        let err = parse_status("ss:'SYNC_PHASE' mu:1234 dtxm:10").unwrap_err();
        assert!(matches!(
            err,
            StatusError::IncompleteStatus { ref missing, .. }
                if missing == &vec!["drxm", "dtxs", "drxs"]
        ));
    }

    #[test]
    fn first_occurrence_wins() {
        let status =
            parse_status("ss:'TRACK_PHASE' mu:1 dtxm:1 drxm:2 dtxs:3 drxs:4 drxs:99 mu:7").unwrap();
        assert_eq!(status.delays.slave_rx, 4);
        assert_eq!(status.rtt, 1);
    }

    #[test]
    fn servo_state_is_an_exact_match() {
        assert_eq!(ServoState::from_token("'TRACK_PHASE'"), ServoState::TrackPhase);
        assert!(!ServoState::from_token("TRACK_PHASE").is_track_phase());
        assert!(!ServoState::from_token("'TRACK_PHASE_X'").is_track_phase());
        assert_eq!(parse_servo_state("lnk:1 ss:'SYNC_NSEC'").to_string(), "SYNC_NSEC");
        assert_eq!(parse_servo_state("lnk:0"), ServoState::Unknown);
    }

    #[test]
    fn malformed_number_is_rejected() {
        assert_eq!(
            parse_status("mu:12x4 dtxm:1 drxm:2 dtxs:3 drxs:4").unwrap_err(),
            StatusError::InvalidField {
                key: "mu",
                value: "12x4".to_string(),
            }
        );
    }
}
