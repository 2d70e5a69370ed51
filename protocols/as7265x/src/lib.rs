// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Serial command protocol for the ams AS7265x spectral sensor.
//!
//! The sensor speaks a half-duplex ASCII dialogue at 115200-8-N-1: one AT
//! command out, one line-terminated reply back. The crate includes the
//! sequencer which walks the bring-up handshake and the per-shot data
//! acquisition, reorders the 18 spectral channels, and emits the record
//! block for the daily log. Transport and log writing are injected through
//! [`LineSender`] and [`RecordSink`].

use glib::{error::ErrorDomain, Error, Quark};

/// The AT command tokens the sensor accepts.
pub mod commands {
    pub const AT_ACK: &str = "AT";
    pub const AT_HARDWARE_VERSION: &str = "ATVERHW";
    pub const AT_SOFTWARE_VERSION: &str = "ATVERSW";
    pub const AT_SENSORS_PRESENT: &str = "ATPRES";
    pub const AT_SET_GAIN: &str = "ATGAIN=0";
    pub const AT_SET_INTEGRATION_TIME: &str = "ATINTTIME=255";
    pub const AT_SENSOR_TEMP: &str = "ATTEMP";
    pub const AT_GAIN: &str = "ATGAIN";
    pub const AT_INTEGRATION_TIME: &str = "ATINTTIME";
    pub const AT_DATA: &str = "ATDATA";
    pub const AT_CALIBRATED_DATA: &str = "ATCDATA";
}

/// The number of spectral channels across the three sensor devices.
pub const CHANNEL_COUNT: usize = 18;

/// The device-order reply position emitted at each presentation line.
pub const CHANNEL_ORDER: [usize; CHANNEL_COUNT] =
    [8, 10, 12, 13, 14, 15, 6, 7, 9, 11, 16, 17, 0, 1, 2, 3, 4, 5];

/// The wavelength in nanometers of each device-order reply position.
pub const CHANNEL_WAVELENGTHS: [u16; CHANNEL_COUNT] = [
    610, 680, 730, 760, 810, 860, 560, 585, 645, 705, 900, 940, 410, 435, 460, 485, 510, 535,
];

/// The enumeration to represent any error of the sensor dialogue.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolError {
    /// The reply did not carry the fields the current step expects.
    MalformedReply,
    /// A reply or run request arrived outside the command/reply cadence.
    UnexpectedStep,
    Invalid(i32),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            ProtocolError::MalformedReply => "malformed-reply",
            ProtocolError::UnexpectedStep => "unexpected-step",
            ProtocolError::Invalid(_) => "invalid",
        };

        write!(f, "ProtocolError::{}", msg)
    }
}

impl ErrorDomain for ProtocolError {
    fn domain() -> Quark {
        Quark::from_str("ams-as7265x-protocol-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            ProtocolError::MalformedReply => 0,
            ProtocolError::UnexpectedStep => 1,
            ProtocolError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => ProtocolError::MalformedReply,
            1 => ProtocolError::UnexpectedStep,
            _ => ProtocolError::Invalid(code),
        };
        Some(enumeration)
    }
}

/// The operation to transmit one command line to the sensor.
pub trait LineSender {
    fn send_line(&mut self, line: &str) -> Result<usize, Error>;
}

/// The operations to append records to the current output file.
pub trait RecordSink {
    fn write_record(&mut self, line: &str) -> Result<usize, Error>;

    /// Write the timestamp captured at the shutter press.
    fn write_shot_stamp(&mut self) -> Result<usize, Error>;
}

/// The progress of the sequencer through a command run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SequencerState {
    /// No run bound; inbound lines are not consumed.
    Idle,
    /// The bring-up dialogue, reply steps 0 through 5.
    Handshake(u8),
    /// The per-shot acquisition, reply steps 0 through 4.
    Data(u8),
    /// A run failed; terminal until the next run starts clean.
    Errored,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self::Idle
    }
}

/// The AS7265x interrogation sequencer.
///
/// Strict alternation holds: a command is sent only from [`begin_handshake`],
/// [`begin_data_run`], or from [`feed_line`] consuming the previous reply.
///
/// [`begin_handshake`]: As7265xSequencer::begin_handshake
/// [`begin_data_run`]: As7265xSequencer::begin_data_run
/// [`feed_line`]: As7265xSequencer::feed_line
#[derive(Default, Debug)]
pub struct As7265xSequencer {
    state: SequencerState,
    raw_tokens: Vec<String>,
}

impl As7265xSequencer {
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Whether inbound serial lines should be fed to the sequencer.
    pub fn handler_bound(&self) -> bool {
        matches!(
            self.state,
            SequencerState::Handshake(_) | SequencerState::Data(_)
        )
    }

    /// Start the bring-up dialogue: probe the sensor, record its hardware
    /// and software versions and device presence, then fix gain 0 and
    /// integration time 255.
    pub fn begin_handshake(&mut self, port: &mut impl LineSender) -> Result<(), Error> {
        self.begin(port, SequencerState::Handshake(0), commands::AT_ACK)
    }

    /// Start the per-shot acquisition: temperatures, gain, integration time,
    /// then the raw and calibrated channel readings.
    pub fn begin_data_run(&mut self, port: &mut impl LineSender) -> Result<(), Error> {
        self.begin(port, SequencerState::Data(0), commands::AT_SENSOR_TEMP)
    }

    fn begin(
        &mut self,
        port: &mut impl LineSender,
        state: SequencerState,
        command: &str,
    ) -> Result<(), Error> {
        if self.handler_bound() {
            let msg = format!("run requested while {:?} is in progress", self.state);
            return Err(Error::new(ProtocolError::UnexpectedStep, &msg));
        }

        self.raw_tokens.clear();
        self.state = state;
        port.send_line(command).map(|_| ()).map_err(|e| {
            self.state = SequencerState::Errored;
            e
        })
    }

    /// Consume one reply line and advance the bound run. On any transport or
    /// write failure the run ends in [`SequencerState::Errored`] with the
    /// handler unbound, and the error is returned for the caller to route.
    pub fn feed_line(
        &mut self,
        reply: &str,
        port: &mut impl LineSender,
        sink: &mut impl RecordSink,
    ) -> Result<(), Error> {
        let result = match self.state {
            SequencerState::Handshake(step) => self.handshake_reply(step, reply, port, sink),
            SequencerState::Data(step) => self.data_reply(step, reply, port, sink),
            SequencerState::Idle | SequencerState::Errored => {
                let msg = "reply received with no sequence bound";
                Err(Error::new(ProtocolError::UnexpectedStep, msg))
            }
        };

        if result.is_err() {
            self.state = SequencerState::Errored;
            self.raw_tokens.clear();
        }

        result
    }

    fn handshake_reply(
        &mut self,
        step: u8,
        reply: &str,
        port: &mut impl LineSender,
        sink: &mut impl RecordSink,
    ) -> Result<(), Error> {
        match step {
            // The acknowledge reply carries nothing worth keeping.
            0 => {
                port.send_line(commands::AT_HARDWARE_VERSION)?;
                self.state = SequencerState::Handshake(1);
            }
            1 => {
                sink.write_record(&format!("AS7265x Hardware Version,{}", reply))?;
                port.send_line(commands::AT_SOFTWARE_VERSION)?;
                self.state = SequencerState::Handshake(2);
            }
            2 => {
                sink.write_record(&format!("AS7265x Sofware Version,{}", reply))?;
                port.send_line(commands::AT_SENSORS_PRESENT)?;
                self.state = SequencerState::Handshake(3);
            }
            3 => {
                sink.write_record(&format!("Sensors working,{}", reply))?;
                port.send_line(commands::AT_SET_GAIN)?;
                self.state = SequencerState::Handshake(4);
            }
            // Replies to the two set commands are bare OKs.
            4 => {
                port.send_line(commands::AT_SET_INTEGRATION_TIME)?;
                self.state = SequencerState::Handshake(5);
            }
            5 => {
                sink.write_record("")?;
                self.state = SequencerState::Idle;
            }
            _ => {
                let msg = format!("handshake reply at impossible step {}", step);
                return Err(Error::new(ProtocolError::UnexpectedStep, &msg));
            }
        }

        Ok(())
    }

    fn data_reply(
        &mut self,
        step: u8,
        reply: &str,
        port: &mut impl LineSender,
        sink: &mut impl RecordSink,
    ) -> Result<(), Error> {
        match step {
            0 => {
                // Each record block opens with the shutter-press time.
                sink.write_shot_stamp()?;

                for (i, token) in reply.split(',').enumerate() {
                    sink.write_record(&format!("Temp Sensor {},{}", i + 1, token))?;
                }

                port.send_line(commands::AT_GAIN)?;
                self.state = SequencerState::Data(1);
            }
            1 => {
                let value = trim_status_suffix(reply);
                sink.write_record(&format!("Sensor Gain,{}", value))?;
                port.send_line(commands::AT_INTEGRATION_TIME)?;
                self.state = SequencerState::Data(2);
            }
            2 => {
                let value = trim_status_suffix(reply);
                sink.write_record(&format!("Sensor Integration Time,{}", value))?;
                port.send_line(commands::AT_DATA)?;
                self.state = SequencerState::Data(3);
            }
            3 => {
                sink.write_record("Channel, Raw Data, Calibrated Data")?;
                self.raw_tokens = split_tokens(reply);
                port.send_line(commands::AT_CALIBRATED_DATA)?;
                self.state = SequencerState::Data(4);
            }
            4 => {
                let calibrated_tokens = split_tokens(reply);

                if self.raw_tokens.len() < CHANNEL_COUNT
                    || calibrated_tokens.len() < CHANNEL_COUNT
                {
                    let msg = format!(
                        "expected {} spectral readings, got {} raw and {} calibrated",
                        CHANNEL_COUNT,
                        self.raw_tokens.len(),
                        calibrated_tokens.len(),
                    );
                    return Err(Error::new(ProtocolError::MalformedReply, &msg));
                }

                for &channel in CHANNEL_ORDER.iter() {
                    sink.write_record(&format!(
                        "{},{},{}",
                        CHANNEL_WAVELENGTHS[channel],
                        self.raw_tokens[channel],
                        calibrated_tokens[channel],
                    ))?;
                }

                // Blank separator below the data readout.
                sink.write_record("")?;

                self.raw_tokens.clear();
                self.state = SequencerState::Idle;
            }
            _ => {
                let msg = format!("data reply at impossible step {}", step);
                return Err(Error::new(ProtocolError::UnexpectedStep, &msg));
            }
        }

        Ok(())
    }
}

// Gain and integration time replies carry a trailing status ("2 OK"); the
// value is everything ahead of the last two characters.
fn trim_status_suffix(reply: &str) -> &str {
    let end = reply.len().saturating_sub(2);
    reply.get(..end).unwrap_or("")
}

fn split_tokens(reply: &str) -> Vec<String> {
    reply.split(',').map(|token| token.trim().to_string()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct TestPort {
        sent: Vec<String>,
        fail: bool,
    }

    impl LineSender for TestPort {
        fn send_line(&mut self, line: &str) -> Result<usize, Error> {
            if self.fail {
                let msg = "serial transmit failed";
                return Err(Error::new(glib::FileError::Io, msg));
            }
            self.sent.push(line.to_string());
            Ok(line.len() + 1)
        }
    }

    #[derive(Default)]
    struct TestSink {
        lines: Vec<String>,
        fail_after: Option<usize>,
    }

    impl RecordSink for TestSink {
        fn write_record(&mut self, line: &str) -> Result<usize, Error> {
            if let Some(limit) = self.fail_after {
                if self.lines.len() >= limit {
                    let msg = "output file write failed";
                    return Err(Error::new(glib::FileError::Io, msg));
                }
            }
            self.lines.push(line.to_string());
            Ok(line.len() + 1)
        }

        fn write_shot_stamp(&mut self) -> Result<usize, Error> {
            self.write_record("12-34-56")
        }
    }

    #[test]
    fn channel_order_is_a_permutation() {
        let mut seen = [false; CHANNEL_COUNT];
        CHANNEL_ORDER.iter().for_each(|&i| seen[i] = true);
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn handshake_happy_path() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();
        let mut sink = TestSink::default();

        sequencer.begin_handshake(&mut port).unwrap();
        assert_eq!(sequencer.state(), SequencerState::Handshake(0));
        assert!(sequencer.handler_bound());

        for reply in &["OK", "HW1.0", "SW2.3", "aS,AS,tCS", "OK", "OK"] {
            sequencer.feed_line(reply, &mut port, &mut sink).unwrap();
        }

        assert_eq!(
            port.sent,
            vec!["AT", "ATVERHW", "ATVERSW", "ATPRES", "ATGAIN=0", "ATINTTIME=255"],
        );
        assert_eq!(
            sink.lines,
            vec![
                "AS7265x Hardware Version,HW1.0",
                "AS7265x Sofware Version,SW2.3",
                "Sensors working,aS,AS,tCS",
                "",
            ],
        );
        assert_eq!(sequencer.state(), SequencerState::Idle);
        assert!(!sequencer.handler_bound());
    }

    #[test]
    fn data_run_emits_record_block() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();
        let mut sink = TestSink::default();

        let raw: Vec<String> = (0..18).map(|i| format!("r{}", i)).collect();
        let calibrated: Vec<String> = (0..18).map(|i| format!("c{}", i)).collect();

        sequencer.begin_data_run(&mut port).unwrap();
        sequencer
            .feed_line("21.4,22.0,21.9", &mut port, &mut sink)
            .unwrap();
        sequencer.feed_line("2 OK", &mut port, &mut sink).unwrap();
        sequencer.feed_line("255 OK", &mut port, &mut sink).unwrap();
        sequencer
            .feed_line(&raw.join(","), &mut port, &mut sink)
            .unwrap();
        sequencer
            .feed_line(&calibrated.join(","), &mut port, &mut sink)
            .unwrap();

        assert_eq!(
            port.sent,
            vec!["ATTEMP", "ATGAIN", "ATINTTIME", "ATDATA", "ATCDATA"],
        );

        assert_eq!(sink.lines[0], "12-34-56");
        assert_eq!(sink.lines[1], "Temp Sensor 1,21.4");
        assert_eq!(sink.lines[2], "Temp Sensor 2,22.0");
        assert_eq!(sink.lines[3], "Temp Sensor 3,21.9");
        assert_eq!(sink.lines[4], "Sensor Gain,2");
        assert_eq!(sink.lines[5], "Sensor Integration Time,255");
        assert_eq!(sink.lines[6], "Channel, Raw Data, Calibrated Data");

        let channel_lines = &sink.lines[7..25];
        assert_eq!(channel_lines.len(), CHANNEL_COUNT);
        assert_eq!(channel_lines[0], "645,r8,c8");
        assert_eq!(channel_lines[12], "610,r0,c0");
        assert_eq!(channel_lines[17], "860,r5,c5");

        // Every wavelength appears exactly once.
        let mut seen: Vec<u16> = channel_lines
            .iter()
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        seen.sort_unstable();
        let mut expected = CHANNEL_WAVELENGTHS.to_vec();
        expected.sort_unstable();
        assert_eq!(seen, expected);

        assert_eq!(sink.lines[25], "");
        assert_eq!(sink.lines.len(), 26);
        assert_eq!(sequencer.state(), SequencerState::Idle);
    }

    #[test]
    fn short_channel_reply_is_a_protocol_error() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();
        let mut sink = TestSink::default();

        sequencer.begin_data_run(&mut port).unwrap();
        sequencer.feed_line("21.4", &mut port, &mut sink).unwrap();
        sequencer.feed_line("2 OK", &mut port, &mut sink).unwrap();
        sequencer.feed_line("255 OK", &mut port, &mut sink).unwrap();
        sequencer.feed_line("r0,r1,r2", &mut port, &mut sink).unwrap();

        let err = sequencer
            .feed_line("c0,c1,c2", &mut port, &mut sink)
            .unwrap_err();
        assert_eq!(err.kind::<ProtocolError>(), Some(ProtocolError::MalformedReply));
        assert_eq!(sequencer.state(), SequencerState::Errored);
        assert!(!sequencer.handler_bound());
    }

    #[test]
    fn write_failure_unbinds_the_run() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();
        let mut sink = TestSink {
            fail_after: Some(0),
            ..Default::default()
        };

        sequencer.begin_handshake(&mut port).unwrap();
        sequencer.feed_line("OK", &mut port, &mut sink).unwrap();
        let err = sequencer.feed_line("HW1.0", &mut port, &mut sink).unwrap_err();

        assert!(err.is::<glib::FileError>());
        assert_eq!(sequencer.state(), SequencerState::Errored);
        assert!(!sequencer.handler_bound());

        // The next run starts clean.
        port.sent.clear();
        sequencer.begin_handshake(&mut port).unwrap();
        assert_eq!(sequencer.state(), SequencerState::Handshake(0));
        assert_eq!(port.sent, vec!["AT"]);
    }

    #[test]
    fn concurrent_run_request_is_rejected() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();

        sequencer.begin_handshake(&mut port).unwrap();
        let err = sequencer.begin_data_run(&mut port).unwrap_err();
        assert_eq!(err.kind::<ProtocolError>(), Some(ProtocolError::UnexpectedStep));

        // The bound handshake is untouched by the rejected request.
        assert_eq!(sequencer.state(), SequencerState::Handshake(0));
    }

    #[test]
    fn stray_reply_without_a_run_is_rejected() {
        let mut sequencer = As7265xSequencer::default();
        let mut port = TestPort::default();
        let mut sink = TestSink::default();

        let err = sequencer.feed_line("OK", &mut port, &mut sink).unwrap_err();
        assert_eq!(err.kind::<ProtocolError>(), Some(ProtocolError::UnexpectedStep));
    }
}
