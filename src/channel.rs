//! Echo-verified command channel to a WR device shell.
//!
//! The shell echoes every command it receives. The console emits four control
//! bytes in front of every character it prints, so the echo and the command
//! output are decoded with [`decode`] before use. A command whose echo does not match, or that
//! could not be written completely, is sent again up to `ntries` times.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::transport::Transport;

/// Offset of the first payload byte in an encoded console line.
const STRIDE_OFFSET: usize = 4;
/// One payload byte every this many bytes.
const STRIDE: usize = 5;

/// Strips console control bytes from `raw`, keeping the bytes at offsets
/// 4, 9, 14, ... Inputs shorter than 5 bytes decode to an empty string.
///
/// Apply this exactly once per raw read.
pub fn decode(raw: &[u8]) -> String {
    raw.iter()
        .skip(STRIDE_OFFSET)
        .step_by(STRIDE)
        .map(|&b| b as char)
        .collect()
}

/// Timing and retry parameters of a [`CommandChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Pause after each written byte. The device UART drops characters sent in
    /// a full-speed burst.
    pub inter_char_delay: Duration,
    /// Pause between the end of a write and the echo read.
    pub settle_delay: Duration,
    /// Total attempts for a command, including the first one.
    pub ntries: u32,
    /// Number of raw bytes requested when reading command output. The
    /// transport cannot report how many bytes are pending, so this is an
    /// over-read. Five raw bytes carry one character.
    pub max_response_bytes: usize,
    /// Characters of prompt the shell prints after the command output.
    pub prompt_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inter_char_delay: Duration::from_micros(1000),
            settle_delay: Duration::from_millis(100),
            ntries: 3,
            max_response_bytes: 5000,
            prompt_len: 6,
        }
    }
}

/// Outcome of one send attempt that did not get through.
enum AttemptFailure {
    ShortWrite { written: usize },
    EchoMismatch { echoed: String },
}

/// Sends commands to a device shell over a [`Transport`].
///
/// Not synchronized: only one caller may drive a channel at a time.
pub struct CommandChannel<T> {
    transport: T,
    config: ChannelConfig,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `command` and, when `output` is set, returns what the shell
    /// printed in response, without the trailing prompt. Without `output`
    /// the returned string is empty.
    pub fn send(&mut self, command: &str, output: bool) -> Result<String, ChannelError> {
        validate(command)?;
        debug!("\t {}", command);

        let ntries = self.config.ntries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(command)? {
                None => break,
                Some(failure) if attempt >= ntries => {
                    return Err(match failure {
                        AttemptFailure::ShortWrite { written } => ChannelError::ShortWrite {
                            command: command.to_string(),
                            written,
                            expected: command.len() + 1,
                            attempts: attempt,
                        },
                        AttemptFailure::EchoMismatch { echoed } => ChannelError::EchoMismatch {
                            command: command.to_string(),
                            echoed,
                            attempts: attempt,
                        },
                    });
                }
                Some(AttemptFailure::ShortWrite { written }) => {
                    warn!(
                        "Write of '{}' incomplete ({} of {} bytes), retrying ({}/{})",
                        command,
                        written,
                        command.len() + 1,
                        attempt,
                        ntries
                    );
                }
                Some(AttemptFailure::EchoMismatch { echoed }) => {
                    warn!(
                        "Echo of '{}' was '{}', retrying ({}/{})",
                        command, echoed, attempt, ntries
                    );
                }
            }
        }

        if !output {
            return Ok(String::new());
        }

        let raw = self.transport.read_up_to(self.config.max_response_bytes)?;
        let printed = decode(&raw);
        // the prompt is counted in decoded characters
        let keep = printed.chars().count().saturating_sub(self.config.prompt_len);
        Ok(printed.chars().take(keep).collect())
    }

    /// One write/echo cycle. `Ok(None)` means the echo matched.
    fn attempt(&mut self, command: &str) -> Result<Option<AttemptFailure>, ChannelError> {
        // stale bytes from a previous exchange would be taken for the echo
        self.transport.clear()?;

        let mut written = 0;
        for &byte in command.as_bytes().iter().chain(std::iter::once(&b'\r')) {
            written += self
                .transport
                .write_byte(byte)
                .map_err(|e| write_error(command, e))?;
            pause(self.config.inter_char_delay);
        }
        self.transport
            .flush()
            .map_err(|e| write_error(command, e))?;
        pause(self.config.settle_delay);

        if written != command.len() + 1 {
            return Ok(Some(AttemptFailure::ShortWrite { written }));
        }

        let line = self.transport.read_line()?;
        let echoed = decode(trim_line_ending(&line));
        if echoed != command {
            return Ok(Some(AttemptFailure::EchoMismatch { echoed }));
        }
        Ok(None)
    }
}

fn validate(command: &str) -> Result<(), ChannelError> {
    let printable = command.bytes().all(|b| (0x20..0x7f).contains(&b));
    if command.is_empty() || !printable {
        return Err(ChannelError::InvalidCommand(command.escape_debug().to_string()));
    }
    Ok(())
}

fn write_error(command: &str, e: std::io::Error) -> ChannelError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        ChannelError::WriteTimeout {
            command: command.to_string(),
        }
    } else {
        ChannelError::Io(e)
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Encodes `text` the way the console echoes it.
    fn encode(text: &str) -> Vec<u8> {
        let mut raw = Vec::new();
        for b in text.bytes() {
            raw.extend_from_slice(b"\x1b[0m");
            raw.push(b);
        }
        raw.push(b'\n');
        raw
    }

    /// Encodes command output followed by the prompt, as the console prints
    /// it after the echo line.
    fn encode_output(text: &str) -> Vec<u8> {
        let mut raw = encode(&format!("{}\nwrc# ", text));
        raw.pop();
        raw
    }

    /// A transport replaying one scripted echo line per attempt.
    #[derive(Default)]
    struct ScriptedTransport {
        echoes: VecDeque<Vec<u8>>,
        payload: Vec<u8>,
        written: Vec<u8>,
        clears: usize,
        // bytes silently dropped on the next write
        drop_bytes: usize,
        write_timeout: bool,
    }

    impl Transport for ScriptedTransport {
        fn write_byte(&mut self, byte: u8) -> io::Result<usize> {
            if self.write_timeout {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            if self.drop_bytes > 0 {
                self.drop_bytes -= 1;
                return Ok(0);
            }
            self.written.push(byte);
            Ok(1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn clear(&mut self) -> io::Result<()> {
            self.clears += 1;
            Ok(())
        }

        fn read_line(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.echoes.pop_front().unwrap_or_default())
        }

        fn read_up_to(&mut self, max: usize) -> io::Result<Vec<u8>> {
            let n = max.min(self.payload.len());
            Ok(self.payload.drain(..n).collect())
        }
    }

    fn quick_config(ntries: u32) -> ChannelConfig {
        ChannelConfig {
            inter_char_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ntries,
            ..Default::default()
        }
    }

    #[test]
    fn decode_takes_every_fifth_byte() {
        assert_eq!(decode(b"abcdEfghiJklmnO"), "EJO");
        assert_eq!(decode(b"abcdEfghiJkl"), "EJ");
        assert_eq!(decode(&encode("sfp show")[..40]), "sfp show");
    }

    #[test]
    fn decode_short_input_is_empty() {
        assert_eq!(decode(b""), "");
        assert_eq!(decode(b"abcd"), "");
        assert_eq!(decode(b"abcdE"), "E");
    }

    #[test]
    fn send_succeeds_on_first_echo() {
        let mut transport = ScriptedTransport::default();
        transport.echoes.push_back(encode("stat"));
        transport.payload = encode_output("lnk:1 ss:'TRACK_PHASE'");
        let mut channel = CommandChannel::new(transport, quick_config(3));

        let response = channel.send("stat", true).unwrap();
        assert_eq!(response, "lnk:1 ss:'TRACK_PHASE'");
        assert_eq!(channel.transport().written, b"stat\r");
    }

    #[test]
    fn send_retries_until_echo_matches() {
        let mut transport = ScriptedTransport::default();
        transport.echoes.push_back(encode("stXt"));
        transport.echoes.push_back(b"\x1b[0".to_vec());
        transport.echoes.push_back(encode("mode master"));
        transport.payload = encode_output("ok");
        let mut channel = CommandChannel::new(transport, quick_config(3));

        let response = channel.send("mode master", true).unwrap();
        assert_eq!(response, "ok");
        // the same command text is sent on every attempt
        assert_eq!(channel.transport().written, b"mode master\r".repeat(3));
        assert_eq!(channel.transport().clears, 3);
    }

    #[test]
    fn send_gives_up_after_ntries() {
        let mut transport = ScriptedTransport::default();
        transport.echoes.push_back(encode("garbage"));
        transport.echoes.push_back(encode("more garbage"));
        transport.echoes.push_back(encode("ptp start"));
        let mut channel = CommandChannel::new(transport, quick_config(2));

        match channel.send("ptp start", false) {
            Err(ChannelError::EchoMismatch {
                command,
                echoed,
                attempts,
            }) => {
                assert_eq!(command, "ptp start");
                assert_eq!(echoed, "more garbage");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn short_write_is_retried() {
        let mut transport = ScriptedTransport {
            drop_bytes: 2,
            ..Default::default()
        };
        transport.echoes.push_back(encode("sfp erase"));
        let mut channel = CommandChannel::new(transport, quick_config(2));

        // the first attempt loses two bytes, the second one goes through
        assert_eq!(channel.send("sfp erase", false).unwrap(), "");
    }

    #[test]
    fn short_write_surfaces_after_ntries() {
        let transport = ScriptedTransport {
            drop_bytes: 1000,
            ..Default::default()
        };
        let mut channel = CommandChannel::new(transport, quick_config(3));

        assert!(matches!(
            channel.send("sfp erase", false),
            Err(ChannelError::ShortWrite {
                written: 0,
                expected: 10,
                attempts: 3,
                ..
            })
        ));
    }

    #[test]
    fn write_timeout_is_not_retried() {
        let transport = ScriptedTransport {
            write_timeout: true,
            ..Default::default()
        };
        let mut channel = CommandChannel::new(transport, quick_config(3));

        assert!(matches!(
            channel.send("stat", true),
            Err(ChannelError::WriteTimeout { .. })
        ));
        assert_eq!(channel.transport().clears, 1);
    }

    #[test]
    fn invalid_commands_are_rejected_before_io() {
        let mut channel = CommandChannel::new(ScriptedTransport::default(), quick_config(3));
        assert!(matches!(channel.send("", false), Err(ChannelError::InvalidCommand(_))));
        assert!(matches!(
            channel.send("stat\rstat", false),
            Err(ChannelError::InvalidCommand(_))
        ));
        assert_eq!(channel.transport().clears, 0);
    }

    #[test]
    fn raw_tail_of_output_is_dropped() {
        let mut transport = ScriptedTransport::default();
        transport.echoes.push_back(encode("sfp show"));
        let mut payload = encode_output("1: PN:AXGE");
        // half a character left over from the over-read
        payload.extend_from_slice(b"\x1b[");
        transport.payload = payload;
        let mut channel = CommandChannel::new(transport, quick_config(1));

        assert_eq!(channel.send("sfp show", true).unwrap(), "1: PN:AXGE");
    }

    #[test]
    fn status_output_parses_with_default_config() {
        let line = "lnk:1 ss:'TRACK_PHASE' mu:1234 dtxm:10 drxm:20 dtxs:30 drxs:40";
        let mut transport = ScriptedTransport::default();
        transport.echoes.push_back(encode("stat"));
        transport.payload = encode_output(line);
        let config = ChannelConfig {
            inter_char_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut channel = CommandChannel::new(transport, config);

        let output = channel.send("stat", true).unwrap();
        assert_eq!(output, line);
        let status = crate::status::parse_status(&output).unwrap();
        assert_eq!(status.rtt, 1234);
        assert_eq!(status.delays.slave(), (30, 40));
    }
}
