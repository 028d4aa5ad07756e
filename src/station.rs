//! The control loop context.
//!
//! [`Station`] owns every piece of mutable state: the meter client with its
//! session, the measurement set, the poll cadence and the dump schedule. The
//! hosting loop calls [`Station::tick`] repeatedly with the current time and a
//! telemetry sink; each tick does, in order:
//!
//! 1. a poll cycle if one is due,
//! 2. a periodic dump if one is due,
//! 3. housekeeping (link status changes),
//! 4. a queued query dump.
//!
//! Only one exchange is ever in flight because everything runs from this one
//! call.

use crate::client::Meter;
use crate::dump::{DumpKind, DumpRecord, DumpScheduler, DumpTiming, BANNER, QUERY_COMMAND};
use crate::poller::{LinkStatus, MeasurementSet, Poller, POLL_INTERVAL};
use crate::protocol::{Address, Password};
use crate::session::SESSION_LIFETIME;
use crate::transport::Transport;
use log::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationConfig {
    pub address: Address,
    pub password: Password,
    pub poll_interval: Duration,
    pub session_lifetime: Duration,
    pub dump: DumpTiming,
    /// Also poll today's and yesterday's energy counters.
    pub energy: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            address: Address::UNIVERSAL,
            password: Password::default(),
            poll_interval: POLL_INTERVAL,
            session_lifetime: SESSION_LIFETIME,
            dump: DumpTiming::default(),
            energy: true,
        }
    }
}

#[derive(Debug)]
pub struct Station<T, R = StdRng> {
    meter: Meter<T>,
    measurements: MeasurementSet,
    poller: Poller,
    scheduler: DumpScheduler<R>,
    started: Instant,
    query_pending: bool,
    last_status: LinkStatus,
}

impl<T: Transport> Station<T, StdRng> {
    pub fn new(transport: T, config: &StationConfig, now: Instant) -> Self {
        Self::with_rng(transport, config, now, StdRng::from_os_rng())
    }
}

impl<T: Transport, R: Rng> Station<T, R> {
    pub fn with_rng(transport: T, config: &StationConfig, now: Instant, rng: R) -> Self {
        let meter = Meter::new(transport, config.address, config.password, now)
            .with_session_lifetime(config.session_lifetime);
        let measurements = MeasurementSet::new(config.energy);
        Self {
            meter,
            measurements,
            poller: Poller::new(now).with_interval(config.poll_interval),
            scheduler: DumpScheduler::with_rng(now, config.dump, rng),
            started: now,
            query_pending: false,
            last_status: measurements.status(),
        }
    }

    /// Latest measurements, for display collaborators.
    pub fn measurements(&self) -> &MeasurementSet {
        &self.measurements
    }

    pub fn status(&self) -> LinkStatus {
        self.measurements.status()
    }

    pub fn scheduler(&self) -> &DumpScheduler<R> {
        &self.scheduler
    }

    pub fn meter(&self) -> &Meter<T> {
        &self.meter
    }

    pub fn meter_mut(&mut self) -> &mut Meter<T> {
        &mut self.meter
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Writes the startup banner.
    pub fn start<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{BANNER}")?;
        out.flush()
    }

    /// Queues a dump for the next tick.
    pub fn request_query(&mut self) {
        self.query_pending = true;
    }

    /// Interprets one inbound command byte; returns true if it was recognized.
    pub fn handle_command(&mut self, byte: u8) -> bool {
        match byte {
            QUERY_COMMAND => {
                self.request_query();
                true
            }
            b'\r' | b'\n' => false,
            other => {
                debug!("Ignoring unknown command byte 0x{other:02X}");
                false
            }
        }
    }

    /// Runs one iteration of the control loop.
    ///
    /// The dump steps see `now` advanced by the wall time the poll cycle
    /// spent on the bus.
    pub fn tick<W: io::Write>(&mut self, now: Instant, out: &mut W) -> io::Result<()> {
        let cycle_started = Instant::now();
        self.poller.poll(&mut self.meter, &mut self.measurements, now);
        let now = now + cycle_started.elapsed();

        if let Some(kind) = self.scheduler.poll(now, self.measurements.ever_valid()) {
            self.emit(kind, now, out)?;
        }

        self.housekeeping();

        if std::mem::take(&mut self.query_pending) {
            if self.measurements.ever_valid() {
                self.emit(DumpKind::Query, now, out)?;
            } else {
                debug!("Query ignored, no valid readings yet");
            }
        }
        Ok(())
    }

    fn emit<W: io::Write>(&self, kind: DumpKind, now: Instant, out: &mut W) -> io::Result<()> {
        let record = DumpRecord::capture(&self.measurements, self.uptime(now), kind);
        debug!("Sending {kind:?} dump");
        record.write_to(out)
    }

    fn housekeeping(&mut self) {
        let status = self.measurements.status();
        if status != self.last_status {
            info!(
                "Meter link {} -> {} [{}] ({}/{} readings valid)",
                self.last_status,
                status,
                status.glyph(),
                self.measurements.valid(),
                self.measurements.expected()
            );
            self.last_status = status;
        }
    }
}
