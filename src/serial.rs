//! Serial port settings and the [`Bus`] implementation for a real RS485 adapter.
//!
//! The meter talks 8N1 without flow control. Direction switching is done with
//! the RTS line unless the adapter handles it on its own.
use crate::protocol as proto;
use crate::transport::{Bus, Direction, HalfDuplex};
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort};

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the meter's line settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
pub fn serial_port_builder(
    device: &str,
    baud_rate: &proto::BaudRate,
) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate.bits_per_second())
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Half-duplex transport over a real serial port.
pub type SerialTransport = HalfDuplex<Box<dyn SerialPort>>;

/// Opens `device` and wraps it into a ready-to-use half-duplex transport.
pub fn open(
    device: &str,
    baud_rate: &proto::BaudRate,
    direction: Direction,
) -> io::Result<SerialTransport> {
    let mut port = serial_port_builder(device, baud_rate).open()?;
    if direction != Direction::Auto {
        // Start in receive mode.
        port.write_request_to_send(direction == Direction::RtsInverted)?;
    }
    Ok(HalfDuplex::new(port, direction))
}

impl Bus for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(self.clear(ClearBuffer::Input)?)
    }

    fn set_write_enable(&mut self, level: bool) -> io::Result<()> {
        Ok(self.write_request_to_send(level)?)
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)?;
        // Blocks until the UART has shifted out the last byte.
        self.flush()
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_timeout(timeout)?;
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}
