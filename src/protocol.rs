//! Wire protocol of the Mercury 230 three-phase meter.
//!
//! Every frame starts with the meter's network address and ends with a
//! CRC-16/MODBUS checksum, low byte first. Three exchanges are used:
//!
//! | Exchange     | Request                                   | Response |
//! |--------------|-------------------------------------------|----------|
//! | open channel | `addr 01 level p1..p6 crc crc` (11 bytes) | 4 bytes  |
//! | read value   | `addr 08 11 param crc crc` (6 bytes)      | 6 bytes  |
//! | read energy  | `addr 05 period tariff crc crc` (6 bytes) | 19 bytes |
//!
//! Read-value and read-energy responses lay out their payload bytes
//! differently; both layouts are decoded exactly as the meter sends them.

use crc::{Crc, CRC_16_MODBUS};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while building requests or interpreting responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Expected a {expected} byte response, received {received} bytes")]
    Length { expected: usize, received: usize },

    #[error("Checksum mismatch: computed {computed:02X?}, received {received:02X?}")]
    Checksum {
        computed: [u8; 2],
        received: [u8; 2],
    },

    #[error("Meter rejected the request with status 0x{0:02X}")]
    AccessDenied(u8),

    #[error("The address value {0} is outside the valid range of {min} to {max}", min = Address::MIN, max = Address::MAX)]
    AddressOutOfRange(u8),

    #[error("Invalid password: expected {len} decimal digits", len = Password::LEN)]
    InvalidPassword,

    #[error("Unsupported baud rate {0}")]
    InvalidBaudRate(u32),
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum over `bytes`, in wire order.
pub fn crc16(bytes: &[u8]) -> [u8; 2] {
    CRC16.checksum(bytes).to_le_bytes()
}

/// Returns true iff the last two bytes of `frame` are the checksum of the rest.
pub fn verify(frame: &[u8]) -> bool {
    match frame.len().checked_sub(CHECKSUM_LEN) {
        Some(split) => crc16(&frame[..split]) == frame[split..],
        None => false,
    }
}

pub const CHECKSUM_LEN: usize = 2;

pub const CMD_OPEN_CHANNEL: u8 = 0x01;
pub const CMD_READ_ENERGY: u8 = 0x05;
pub const CMD_READ_PARAMETER: u8 = 0x08;
/// Sub-function of `CMD_READ_PARAMETER` selecting the instantaneous values.
pub const READ_PARAMETER_INSTANT: u8 = 0x11;
pub const ACCESS_LEVEL_USER: u8 = 0x01;
pub const TARIFF_ALL: u8 = 0x00;
pub const STATUS_OK: u8 = 0x00;

pub const OPEN_CHANNEL_REQUEST_LEN: usize = 11;
pub const OPEN_CHANNEL_RESPONSE_LEN: usize = 4;
pub const READ_VALUE_REQUEST_LEN: usize = 6;
pub const READ_VALUE_RESPONSE_LEN: usize = 6;
pub const READ_ENERGY_REQUEST_LEN: usize = 6;
pub const READ_ENERGY_RESPONSE_LEN: usize = 19;
/// Length of the status-only frame a meter sends instead of data.
pub const STATUS_RESPONSE_LEN: usize = 4;

/// Mask removing the two direction/status bits from the first value byte.
pub const VALUE_HIGH_MASK: u8 = 0x3F;

/// Network address of the meter on the RS485 bus.
///
/// Address `0` is answered by any meter and is the factory choice for a
/// point-to-point link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct Address(u8);

impl Address {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 240;
    pub const UNIVERSAL: Address = Address(0);
}

impl std::ops::Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::AddressOutOfRange(value))
        }
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Six-digit access password; each digit travels as one byte.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String"))]
pub struct Password([u8; Password::LEN]);

impl Password {
    pub const LEN: usize = 6;

    pub fn bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl Default for Password {
    /// Factory password of the user access level, `111111`.
    fn default() -> Self {
        Self([0x01; Self::LEN])
    }
}

impl FromStr for Password {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.as_bytes();
        if digits.len() != Self::LEN || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::InvalidPassword);
        }
        let mut bytes = [0u8; Self::LEN];
        for (byte, digit) in bytes.iter_mut().zip(digits) {
            *byte = digit - b'0';
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Password {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(******)")
    }
}

/// Serial line speeds supported by the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
pub enum BaudRate {
    B300,
    B600,
    B1200,
    B2400,
    B4800,
    #[default]
    B9600,
}

impl BaudRate {
    pub const ALL: [BaudRate; 6] = [
        BaudRate::B300,
        BaudRate::B600,
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
    ];

    pub fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::B300 => 300,
            BaudRate::B600 => 600,
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
        }
    }

    /// Time on the wire for one 8N1 character (10 bits).
    pub fn char_time(&self) -> Duration {
        Duration::from_micros(10_000_000 / self.bits_per_second() as u64)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.bits_per_second() == value)
            .ok_or(Error::InvalidBaudRate(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.bits_per_second()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// Phase of the three-phase network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// Zero-based index.
    pub fn index(&self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }

    /// One-based phase number as printed on the meter.
    pub fn number(&self) -> u8 {
        self.index() as u8 + 1
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// Instantaneous value selectable with the read-value request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Active power; `None` is the sum over all phases.
    Power(Option<Phase>),
    Voltage(Phase),
    Current(Phase),
    Frequency,
}

impl Parameter {
    /// Every value polled in one cycle, in bus order.
    pub const POLLED: [Parameter; 11] = [
        Parameter::Voltage(Phase::L1),
        Parameter::Voltage(Phase::L2),
        Parameter::Voltage(Phase::L3),
        Parameter::Current(Phase::L1),
        Parameter::Current(Phase::L2),
        Parameter::Current(Phase::L3),
        Parameter::Power(None),
        Parameter::Power(Some(Phase::L1)),
        Parameter::Power(Some(Phase::L2)),
        Parameter::Power(Some(Phase::L3)),
        Parameter::Frequency,
    ];

    /// Parameter code (BWRI) sent in the request.
    pub fn code(&self) -> u8 {
        let phase_bits = |phase: &Phase| phase.number();
        match self {
            Parameter::Power(None) => 0x00,
            Parameter::Power(Some(phase)) => phase_bits(phase),
            Parameter::Voltage(phase) => 0x10 | phase_bits(phase),
            Parameter::Current(phase) => 0x20 | phase_bits(phase),
            Parameter::Frequency => 0x40,
        }
    }

    /// Implied decimal digits of the raw reading.
    pub fn scale(&self) -> u8 {
        match self {
            Parameter::Current(_) => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Power(None) => f.write_str("total power"),
            Parameter::Power(Some(phase)) => write!(f, "power {phase}"),
            Parameter::Voltage(phase) => write!(f, "voltage {phase}"),
            Parameter::Current(phase) => write!(f, "current {phase}"),
            Parameter::Frequency => f.write_str("frequency"),
        }
    }
}

/// Accumulation period selectable with the read-energy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyPeriod {
    CurrentDay,
    PreviousDay,
}

impl EnergyPeriod {
    pub const POLLED: [EnergyPeriod; 2] = [EnergyPeriod::CurrentDay, EnergyPeriod::PreviousDay];

    pub fn selector(&self) -> u8 {
        match self {
            EnergyPeriod::CurrentDay => 0x40,
            EnergyPeriod::PreviousDay => 0x50,
        }
    }
}

impl fmt::Display for EnergyPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyPeriod::CurrentDay => f.write_str("energy today"),
            EnergyPeriod::PreviousDay => f.write_str("energy yesterday"),
        }
    }
}

/// A request frame before checksum and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    OpenChannel { address: Address, password: Password },
    ReadValue { address: Address, parameter: Parameter },
    ReadEnergy { address: Address, period: EnergyPeriod },
}

impl Request {
    /// Serializes the request including its trailing checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(OPEN_CHANNEL_REQUEST_LEN);
        match self {
            Request::OpenChannel { address, password } => {
                frame.extend_from_slice(&[**address, CMD_OPEN_CHANNEL, ACCESS_LEVEL_USER]);
                frame.extend_from_slice(password.bytes());
            }
            Request::ReadValue { address, parameter } => {
                frame.extend_from_slice(&[
                    **address,
                    CMD_READ_PARAMETER,
                    READ_PARAMETER_INSTANT,
                    parameter.code(),
                ]);
            }
            Request::ReadEnergy { address, period } => {
                frame.extend_from_slice(&[**address, CMD_READ_ENERGY, period.selector(), TARIFF_ALL]);
            }
        }
        let checksum = crc16(&frame);
        frame.extend_from_slice(&checksum);
        frame
    }

    pub fn response_len(&self) -> usize {
        match self {
            Request::OpenChannel { .. } => OPEN_CHANNEL_RESPONSE_LEN,
            Request::ReadValue { .. } => READ_VALUE_RESPONSE_LEN,
            Request::ReadEnergy { .. } => READ_ENERGY_RESPONSE_LEN,
        }
    }
}

/// Checks length and checksum of a response.
///
/// A checksum-valid status-only frame received in place of a longer data
/// response is reported as [`Error::AccessDenied`] carrying its status byte.
pub fn validate(frame: &[u8], expected: usize) -> Result<&[u8], Error> {
    if frame.len() != expected {
        if frame.len() == STATUS_RESPONSE_LEN && verify(frame) && frame[1] != STATUS_OK {
            return Err(Error::AccessDenied(frame[1]));
        }
        return Err(Error::Length {
            expected,
            received: frame.len(),
        });
    }
    let split = expected - CHECKSUM_LEN;
    let computed = crc16(&frame[..split]);
    if computed != frame[split..] {
        return Err(Error::Checksum {
            computed,
            received: [frame[split], frame[split + 1]],
        });
    }
    Ok(&frame[..split])
}

pub fn decode_open_channel(frame: &[u8]) -> Result<(), Error> {
    let payload = validate(frame, OPEN_CHANNEL_RESPONSE_LEN)?;
    match payload[1] {
        STATUS_OK => Ok(()),
        status => Err(Error::AccessDenied(status)),
    }
}

/// Raw value of a read-value response: `(b1 & 0x3F) << 16 | b3 << 8 | b2`.
pub fn decode_value(frame: &[u8]) -> Result<u32, Error> {
    let payload = validate(frame, READ_VALUE_RESPONSE_LEN)?;
    Ok(((payload[1] & VALUE_HIGH_MASK) as u32) << 16
        | payload[2] as u32
        | (payload[3] as u32) << 8)
}

/// Raw active import energy (Wh) of a read-energy response.
///
/// The high word sits in bytes 1..=2 and the low word in bytes 3..=4, each
/// word little endian.
pub fn decode_energy(frame: &[u8]) -> Result<u32, Error> {
    let payload = validate(frame, READ_ENERGY_RESPONSE_LEN)?;
    Ok(payload[3] as u32
        | (payload[4] as u32) << 8
        | (payload[1] as u32) << 16
        | (payload[2] as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body));
        frame
    }

    #[test]
    fn crc_known_vectors() {
        assert_eq!(crc16(&[0x00, 0x00]), [0x01, 0xB0]);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), [0xC5, 0xCD]);
        assert_eq!(crc16(b"123456789"), 0x4B37u16.to_le_bytes());
    }

    #[test]
    fn verify_matches_trailing_checksum() {
        let frame = with_crc(&[0x00, 0x00, 0x64, 0x00]);
        assert!(verify(&frame));
        let mut broken = frame.clone();
        broken[2] ^= 0x01;
        assert!(!verify(&broken));
        assert!(!verify(&[0x01]));
        assert!(!verify(&[]));
    }

    #[test]
    fn encoded_requests_verify() {
        let address = Address::UNIVERSAL;
        let requests = [
            Request::OpenChannel {
                address,
                password: Password::default(),
            },
            Request::ReadValue {
                address,
                parameter: Parameter::Frequency,
            },
            Request::ReadEnergy {
                address,
                period: EnergyPeriod::PreviousDay,
            },
        ];
        for request in requests {
            assert!(verify(&request.encode()), "{request:?}");
        }
    }

    #[test]
    fn open_channel_request_layout() {
        let frame = Request::OpenChannel {
            address: Address::UNIVERSAL,
            password: Password::default(),
        }
        .encode();
        assert_eq!(frame.len(), OPEN_CHANNEL_REQUEST_LEN);
        assert_eq!(
            frame,
            [0x00, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x77, 0x81]
        );
    }

    #[test]
    fn read_value_request_layout() {
        let frame = Request::ReadValue {
            address: Address::UNIVERSAL,
            parameter: Parameter::Voltage(Phase::L1),
        }
        .encode();
        assert_eq!(frame, [0x00, 0x08, 0x11, 0x11, 0x4D, 0xBA]);
    }

    #[test]
    fn read_energy_request_layout() {
        let frame = Request::ReadEnergy {
            address: Address::try_from(0x2Au8).unwrap(),
            period: EnergyPeriod::CurrentDay,
        }
        .encode();
        assert_eq!(frame.len(), READ_ENERGY_REQUEST_LEN);
        assert_eq!(&frame[..4], &[0x2A, 0x05, 0x40, 0x00]);
    }

    #[test]
    fn parameter_codes() {
        assert_eq!(Parameter::Power(None).code(), 0x00);
        assert_eq!(Parameter::Power(Some(Phase::L3)).code(), 0x03);
        assert_eq!(Parameter::Voltage(Phase::L2).code(), 0x12);
        assert_eq!(Parameter::Current(Phase::L1).code(), 0x21);
        assert_eq!(Parameter::Frequency.code(), 0x40);
        assert_eq!(Parameter::Current(Phase::L1).scale(), 3);
        assert_eq!(Parameter::Frequency.scale(), 2);
    }

    #[test]
    fn decodes_value_response() {
        let frame = [0x00, 0x00, 0x64, 0x00, 0x2A, 0xE4];
        assert_eq!(decode_value(&frame), Ok(0x64));

        // Direction bits in the first byte are masked off.
        let frame = with_crc(&[0x00, 0xC1, 0x02, 0x03]);
        assert_eq!(decode_value(&frame), Ok(0x01_03_02));
    }

    #[test]
    fn decodes_energy_response_word_order() {
        let mut body = vec![0x00, 0x34, 0x12, 0x78, 0x56];
        body.extend_from_slice(&[0xEE; 12]);
        let frame = with_crc(&body);
        assert_eq!(frame.len(), READ_ENERGY_RESPONSE_LEN);
        assert_eq!(decode_energy(&frame), Ok(0x1234_5678));
    }

    #[test]
    fn open_channel_status() {
        assert_eq!(decode_open_channel(&with_crc(&[0x00, 0x00])), Ok(()));
        assert_eq!(
            decode_open_channel(&with_crc(&[0x00, 0x05])),
            Err(Error::AccessDenied(0x05))
        );
    }

    #[test]
    fn rejects_short_and_corrupt_frames() {
        assert_matches!(
            decode_value(&[0x00, 0x00, 0x64]),
            Err(Error::Length {
                expected: 6,
                received: 3
            })
        );
        let mut frame = with_crc(&[0x00, 0x00, 0x64, 0x00]);
        frame[5] ^= 0xFF;
        assert_matches!(decode_value(&frame), Err(Error::Checksum { .. }));
    }

    #[test]
    fn status_frame_instead_of_data() {
        let frame = with_crc(&[0x00, 0x05]);
        assert_eq!(decode_value(&frame), Err(Error::AccessDenied(0x05)));
        assert_matches!(decode_energy(&frame), Err(Error::AccessDenied(0x05)));
    }

    #[test]
    fn address_range() {
        assert_matches!(Address::try_from(0u8), Ok(Address::UNIVERSAL));
        assert_matches!(Address::try_from(240u8), Ok(..));
        assert_matches!(Address::try_from(241u8), Err(Error::AddressOutOfRange(241)));
        assert_eq!(Address::try_from(0x2Au8).unwrap().to_string(), "0x2A");
    }

    #[test]
    fn password_parsing() {
        let password: Password = "123450".parse().unwrap();
        assert_eq!(password.bytes(), &[1, 2, 3, 4, 5, 0]);
        assert_eq!(password.to_string(), "123450");
        assert_eq!(Password::default().to_string(), "111111");
        assert_matches!("12345".parse::<Password>(), Err(Error::InvalidPassword));
        assert_matches!("12345a".parse::<Password>(), Err(Error::InvalidPassword));
        assert_eq!(format!("{password:?}"), "Password(******)");
    }

    #[test]
    fn baud_rates() {
        assert_matches!(BaudRate::try_from(9600u32), Ok(BaudRate::B9600));
        assert_matches!(BaudRate::try_from(300u32), Ok(BaudRate::B300));
        assert_matches!(BaudRate::try_from(19200u32), Err(Error::InvalidBaudRate(19200)));
        assert_eq!(BaudRate::default(), BaudRate::B9600);
        assert_eq!(BaudRate::B9600.char_time(), Duration::from_micros(1041));
    }
}
