//! Half-duplex request/response exchange over an RS485 line.
//!
//! [`Transport`] is the seam the meter client talks to. [`HalfDuplex`] builds
//! it on top of any [`Bus`] (a real serial port in [`crate::serial`], a
//! scripted one in tests) and owns the turnaround sequence:
//!
//! 1. drop stale bytes left over from an aborted exchange,
//! 2. assert the write-enable line and let the driver settle,
//! 3. write and flush the request, release the line,
//! 4. collect response bytes until the expected length or the timeout.
//!
//! A short read is a normal outcome on a noisy bus and is returned as `Ok`
//! with fewer bytes. Nothing at this layer retries.

use log::*;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Default settle time between asserting the driver and writing.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2);
/// Default time to wait for a complete response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(150);

/// One request/response exchange on the shared bus.
pub trait Transport {
    /// Sends `request` and returns the bytes received, at most `expected_len`.
    ///
    /// Errors are reserved for hard I/O failures; a timeout returns the bytes
    /// collected so far.
    fn exchange(&mut self, request: &[u8], expected_len: usize) -> io::Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn exchange(&mut self, request: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        (**self).exchange(request, expected_len)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn exchange(&mut self, request: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        (**self).exchange(request, expected_len)
    }
}

/// Raw line operations needed by [`HalfDuplex`].
pub trait Bus {
    /// Discards everything waiting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Drives the write-enable line.
    fn set_write_enable(&mut self, level: bool) -> io::Result<()>;

    /// Writes the whole frame and waits until it has left the UART.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Blocks up to `timeout` for incoming bytes.
    ///
    /// Returns `Ok(0)` when nothing arrived within `timeout`.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// How the RS485 driver is switched between transmit and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Direction {
    /// RTS high while transmitting.
    #[default]
    Rts,
    /// RTS low while transmitting.
    RtsInverted,
    /// The adapter switches on its own.
    Auto,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rts" => Ok(Direction::Rts),
            "rts-inverted" => Ok(Direction::RtsInverted),
            "auto" => Ok(Direction::Auto),
            other => Err(format!(
                "Unknown direction control '{other}', expected rts, rts-inverted or auto"
            )),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Rts => "rts",
            Direction::RtsInverted => "rts-inverted",
            Direction::Auto => "auto",
        })
    }
}

/// A [`Transport`] doing the turnaround sequence on top of a [`Bus`].
#[derive(Debug)]
pub struct HalfDuplex<B> {
    bus: B,
    direction: Direction,
    settle_delay: Duration,
    timeout: Duration,
}

impl<B: Bus> HalfDuplex<B> {
    pub fn new(bus: B, direction: Direction) -> Self {
        Self {
            bus,
            direction,
            settle_delay: DEFAULT_SETTLE_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_settle_delay(&mut self, delay: Duration) {
        self.settle_delay = delay;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn drive(&mut self, transmit: bool) -> io::Result<()> {
        match self.direction {
            Direction::Rts => self.bus.set_write_enable(transmit),
            Direction::RtsInverted => self.bus.set_write_enable(!transmit),
            Direction::Auto => Ok(()),
        }
    }
}

impl<B: Bus> Transport for HalfDuplex<B> {
    fn exchange(&mut self, request: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        self.bus.discard_input()?;

        self.drive(true)?;
        if self.direction != Direction::Auto && !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        let sent = self.bus.send(request);
        // Release the line even if the write failed.
        let released = self.drive(false);
        sent?;
        released?;
        trace!("TX {request:02X?}");

        let mut response = vec![0u8; expected_len];
        let mut received = 0;
        let started = Instant::now();
        while received < expected_len {
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                break;
            }
            match self.bus.receive(&mut response[received..], self.timeout - elapsed)? {
                0 => break,
                n => received += n,
            }
        }
        response.truncate(received);
        if received < expected_len {
            trace!("RX {response:02X?} (short: {received} of {expected_len} bytes)");
        } else {
            trace!("RX {response:02X?}");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Discard,
        WriteEnable(bool),
        Send(Vec<u8>),
        Receive,
    }

    /// Bus replaying scripted receive chunks and recording every call.
    #[derive(Default)]
    struct ScriptedBus {
        chunks: VecDeque<io::Result<Vec<u8>>>,
        events: Vec<Event>,
        fail_send: bool,
    }

    impl ScriptedBus {
        fn replying(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into_iter().map(Ok).collect(),
                ..Default::default()
            }
        }
    }

    impl Bus for ScriptedBus {
        fn discard_input(&mut self) -> io::Result<()> {
            self.events.push(Event::Discard);
            Ok(())
        }

        fn set_write_enable(&mut self, level: bool) -> io::Result<()> {
            self.events.push(Event::WriteEnable(level));
            Ok(())
        }

        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.events.push(Event::Send(frame.to_vec()));
            if self.fail_send {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            self.events.push(Event::Receive);
            match self.chunks.pop_front() {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    fn transport(bus: ScriptedBus, direction: Direction) -> HalfDuplex<ScriptedBus> {
        let mut transport = HalfDuplex::new(bus, direction);
        transport.set_settle_delay(Duration::ZERO);
        transport
    }

    #[test]
    fn turnaround_sequence() {
        let bus = ScriptedBus::replying(vec![vec![0x00, 0x00], vec![0x01, 0xB0]]);
        let mut transport = transport(bus, Direction::Rts);
        let response = transport.exchange(&[0x00, 0x00, 0x01, 0xB0], 4).unwrap();
        assert_eq!(response, vec![0x00, 0x00, 0x01, 0xB0]);
        assert_eq!(
            transport.bus().events,
            vec![
                Event::Discard,
                Event::WriteEnable(true),
                Event::Send(vec![0x00, 0x00, 0x01, 0xB0]),
                Event::WriteEnable(false),
                Event::Receive,
                Event::Receive,
            ]
        );
    }

    #[test]
    fn inverted_and_automatic_direction() {
        let mut inverted = transport(ScriptedBus::default(), Direction::RtsInverted);
        inverted.exchange(&[0x01], 4).unwrap();
        assert_eq!(inverted.bus().events[1], Event::WriteEnable(false));
        assert_eq!(inverted.bus().events[3], Event::WriteEnable(true));

        let mut automatic = transport(ScriptedBus::default(), Direction::Auto);
        automatic.exchange(&[0x01], 4).unwrap();
        assert!(!automatic
            .bus()
            .events
            .iter()
            .any(|event| matches!(event, Event::WriteEnable(_))));
    }

    #[test]
    fn short_read_is_not_an_error() {
        let bus = ScriptedBus::replying(vec![vec![0x00, 0x00, 0x64]]);
        let mut transport = transport(bus, Direction::Rts);
        let response = transport.exchange(&[0x00], 6).unwrap();
        assert_eq!(response, vec![0x00, 0x00, 0x64]);
    }

    #[test]
    fn stops_reading_at_expected_length() {
        let bus = ScriptedBus::replying(vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut transport = transport(bus, Direction::Rts);
        let response = transport.exchange(&[0x00], 4).unwrap();
        assert_eq!(response, vec![1, 2, 3, 4]);
        assert_eq!(transport.bus().events.last(), Some(&Event::Receive));
    }

    #[test]
    fn releases_line_when_send_fails() {
        let bus = ScriptedBus {
            fail_send: true,
            ..Default::default()
        };
        let mut transport = transport(bus, Direction::Rts);
        let err = transport.exchange(&[0x00], 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(transport.bus().events.last(), Some(&Event::WriteEnable(false)));
    }

    #[test]
    fn receive_error_propagates() {
        let mut bus = ScriptedBus::default();
        bus.chunks
            .push_back(Err(io::Error::new(io::ErrorKind::NotFound, "gone")));
        let mut transport = transport(bus, Direction::Rts);
        assert!(transport.exchange(&[0x00], 4).is_err());
    }

    /// Bus that delivers one byte per `pace`, recording the timeout of each read.
    struct TricklingBus {
        pace: Duration,
        timeouts: Vec<Duration>,
    }

    impl Bus for TricklingBus {
        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn set_write_enable(&mut self, _level: bool) -> io::Result<()> {
            Ok(())
        }

        fn send(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.timeouts.push(timeout);
            if timeout < self.pace {
                std::thread::sleep(timeout);
                return Ok(0);
            }
            std::thread::sleep(self.pace);
            buf[0] = 0xAA;
            Ok(1)
        }
    }

    #[test]
    fn gives_up_when_bytes_trickle_in() {
        let bus = TricklingBus {
            pace: Duration::from_millis(60),
            timeouts: Vec::new(),
        };
        let mut transport = HalfDuplex::new(bus, Direction::Auto);
        transport.set_timeout(Duration::from_millis(150));

        let started = Instant::now();
        let response = transport.exchange(&[0x00], 6).unwrap();
        let elapsed = started.elapsed();

        // Two bytes on an idle machine; the third would land after the timeout.
        assert!(!response.is_empty() && response.len() < 6, "{response:02X?}");
        assert!(response.iter().all(|&byte| byte == 0xAA));
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
        let timeouts = &transport.bus().timeouts;
        assert!(timeouts.len() >= 2, "{timeouts:?}");
        assert!(timeouts[0] <= Duration::from_millis(150));
        assert!(timeouts.windows(2).all(|pair| pair[1] < pair[0]), "{timeouts:?}");
    }

    #[test]
    fn direction_from_str() {
        assert_eq!("rts".parse::<Direction>(), Ok(Direction::Rts));
        assert_eq!("rts-inverted".parse::<Direction>(), Ok(Direction::RtsInverted));
        assert_eq!("auto".parse::<Direction>(), Ok(Direction::Auto));
        assert!("dtr".parse::<Direction>().is_err());
        assert_eq!(Direction::RtsInverted.to_string(), "rts-inverted");
    }
}
