//! A library for polling the Mercury 230 three-phase electricity meter over RS485.
//!
//! The crate is split along the path a reading takes:
//!
//! 1.  **Wire protocol**: frame building, CRC-16/MODBUS and response decoding in
//!     [`protocol`], fixed-point quantities in [`fixed`].
//! 2.  **Link**: the half-duplex request/response exchange in [`transport`],
//!     with a real serial port behind it in `serial` (feature `serial`).
//! 3.  **Meter client**: channel authentication and its lifetime in [`session`],
//!     the typed read operations in [`client`].
//! 4.  **Telemetry**: poll cycles in [`poller`], periodic and on-demand dumps in
//!     [`dump`], and the control loop tying them together in [`station`].
//!
//! Everything runs on one thread. Time is passed in explicitly as an
//! [`std::time::Instant`], so the schedule can be driven from tests without
//! sleeping.
//!
//! ## Features
//!
//! - **Strongly-Typed API**: `Address`, `Password`, `Parameter` and the
//!   `Fixed<SCALE>` quantities rule out malformed requests and unit mixups.
//! - **Fail-Fast Polling**: a meter that refuses the channel costs one exchange
//!   per cycle, not one per parameter.
//! - **Pluggable Transport**: anything implementing [`transport::Transport`] can
//!   stand in for the serial line.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mercury230_lib::{
//!     protocol::BaudRate,
//!     station::{Station, StationConfig},
//!     transport::Direction,
//! };
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = mercury230_lib::serial::open("/dev/ttyUSB0", &BaudRate::B9600, Direction::Rts)?;
//!     let mut station = Station::new(transport, &StationConfig::default(), Instant::now());
//!
//!     let mut stdout = std::io::stdout();
//!     station.start(&mut stdout)?;
//!     loop {
//!         station.tick(Instant::now(), &mut stdout)?;
//!         std::thread::sleep(Duration::from_millis(10));
//!     }
//! }
//! ```

pub mod client;
pub mod deadline;
pub mod dump;
mod error;
pub mod fixed;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod station;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod serial;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
