//! Simulated meter used by the unit tests.
use crate::protocol::{self as proto, EnergyPeriod, Parameter, Password};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

/// Status byte the meter sends when the channel is not open.
pub const STATUS_CHANNEL_CLOSED: u8 = 0x05;

/// Answers requests the way a Mercury 230 does, with knobs for failures.
#[derive(Debug)]
pub struct FakeMeter {
    password: Password,
    online: bool,
    corrupt: bool,
    channel_open: bool,
    values: HashMap<u8, u32>,
    energy: HashMap<u8, u32>,
    silent: HashSet<u8>,
    broken: HashSet<u8>,
    latency: Duration,
    requests: Vec<Vec<u8>>,
}

impl FakeMeter {
    pub fn new() -> Self {
        Self {
            password: Password::default(),
            online: true,
            corrupt: false,
            channel_open: false,
            values: HashMap::new(),
            energy: HashMap::new(),
            silent: HashSet::new(),
            broken: HashSet::new(),
            latency: Duration::ZERO,
            requests: Vec::new(),
        }
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Flips a checksum byte in every reply.
    pub fn corrupt_replies(&mut self, corrupt: bool) {
        self.corrupt = corrupt;
    }

    /// Simulates the meter closing the channel on its own.
    pub fn close_channel(&mut self) {
        self.channel_open = false;
    }

    pub fn set_value(&mut self, parameter: Parameter, raw: u32) {
        self.values.insert(parameter.code(), raw);
    }

    pub fn set_energy(&mut self, period: EnergyPeriod, raw: u32) {
        self.energy.insert(period.selector(), raw);
    }

    /// Never answers reads of `parameter`.
    pub fn silence(&mut self, parameter: Parameter) {
        self.silent.insert(parameter.code());
    }

    /// Fails the serial line with an I/O error on reads of `parameter`.
    pub fn break_line_on(&mut self, parameter: Parameter) {
        self.broken.insert(parameter.code());
    }

    /// Time every exchange blocks before returning.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    pub fn exchanges(&self) -> usize {
        self.requests.len()
    }

    pub fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    fn reply(&mut self, request: &[u8]) -> Vec<u8> {
        let address = request[0];
        match request[1] {
            proto::CMD_OPEN_CHANNEL => {
                self.channel_open = request[3..9] == self.password.bytes()[..];
                let status = if self.channel_open {
                    proto::STATUS_OK
                } else {
                    STATUS_CHANNEL_CLOSED
                };
                vec![address, status]
            }
            _ if !self.channel_open => vec![address, STATUS_CHANNEL_CLOSED],
            proto::CMD_READ_PARAMETER => {
                if self.silent.contains(&request[3]) {
                    return Vec::new();
                }
                let raw = self.values.get(&request[3]).copied().unwrap_or(0);
                // Direction bits set on purpose; the decoder must mask them.
                vec![
                    address,
                    ((raw >> 16) as u8 & proto::VALUE_HIGH_MASK) | 0xC0,
                    raw as u8,
                    (raw >> 8) as u8,
                ]
            }
            proto::CMD_READ_ENERGY => {
                let raw = self.energy.get(&request[2]).copied().unwrap_or(0);
                let mut frame = vec![
                    address,
                    (raw >> 16) as u8,
                    (raw >> 24) as u8,
                    raw as u8,
                    (raw >> 8) as u8,
                ];
                frame.extend_from_slice(&[0xFF; 12]);
                frame
            }
            _ => vec![address, 0x01],
        }
    }
}

impl Transport for FakeMeter {
    fn exchange(&mut self, request: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        self.requests.push(request.to_vec());
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if request[1] == proto::CMD_READ_PARAMETER && self.broken.contains(&request[3]) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line fault"));
        }
        if !self.online || !proto::verify(request) {
            return Ok(Vec::new());
        }
        let mut frame = self.reply(request);
        if frame.is_empty() {
            return Ok(frame);
        }
        let checksum = proto::crc16(&frame);
        frame.extend_from_slice(&checksum);
        if self.corrupt {
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
        }
        frame.truncate(expected_len);
        Ok(frame)
    }
}
