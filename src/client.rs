//! Synchronous client for the Mercury 230 meter.
//!
//! [`Meter`] couples a [`Transport`] with the channel [`Session`] and the frame
//! codec in [`crate::protocol`]. Every read makes sure a channel is open first;
//! if that already failed in the current poll cycle the read returns
//! [`Error::ChannelClosed`] without using the bus.
//!
//! ## Example
//!
//! ```no_run
//! use mercury230_lib::client::Meter;
//! use mercury230_lib::protocol::{Address, BaudRate, Parameter, Password};
//! use mercury230_lib::transport::Direction;
//! use std::time::Instant;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = mercury230_lib::serial::open("/dev/ttyUSB0", &BaudRate::B9600, Direction::Rts)?;
//!     let mut meter = Meter::new(transport, Address::UNIVERSAL, Password::default(), Instant::now());
//!     let raw = meter.read_value(Parameter::Frequency, Instant::now())?;
//!     println!("Frequency: {}", mercury230_lib::fixed::Hertz::from_reading(raw));
//!     Ok(())
//! }
//! ```

use crate::protocol::{self as proto, Address, EnergyPeriod, Parameter, Password, Request};
use crate::session::Session;
use crate::transport::Transport;
use crate::{Error, Result};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Meter<T> {
    transport: T,
    session: Session,
}

impl<T: Transport> Meter<T> {
    /// Creates a client; the channel is opened lazily on the first read.
    pub fn new(transport: T, address: Address, password: Password, now: Instant) -> Self {
        Self {
            transport,
            session: Session::new(address, password, now),
        }
    }

    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session = self.session.with_lifetime(lifetime);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Starts a new poll cycle, allowing one more authentication attempt.
    pub fn begin_cycle(&mut self) {
        self.session.begin_cycle();
    }

    /// Authenticates right away, regardless of the current session state.
    pub fn open_channel(&mut self, now: Instant) -> Result<()> {
        self.session.open(&mut self.transport, now)
    }

    /// Reads the raw value of an instantaneous parameter.
    pub fn read_value(&mut self, parameter: Parameter, now: Instant) -> Result<u32> {
        let request = Request::ReadValue {
            address: self.session.address(),
            parameter,
        };
        self.read(&request, now, proto::decode_value)
    }

    /// Reads the raw active import energy (Wh) accumulated in `period`.
    pub fn read_energy(&mut self, period: EnergyPeriod, now: Instant) -> Result<u32> {
        let request = Request::ReadEnergy {
            address: self.session.address(),
            period,
        };
        self.read(&request, now, proto::decode_energy)
    }

    fn read<F>(&mut self, request: &Request, now: Instant, decoder: F) -> Result<u32>
    where
        F: FnOnce(&[u8]) -> std::result::Result<u32, proto::Error>,
    {
        if !self.session.ensure_open(&mut self.transport, now) {
            return Err(Error::ChannelClosed);
        }
        let response = self
            .transport
            .exchange(&request.encode(), request.response_len())?;
        match decoder(&response) {
            Ok(value) => Ok(value),
            Err(err @ proto::Error::AccessDenied(_)) => {
                // The meter dropped the channel before we expected it to.
                self.session.invalidate(now);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}
