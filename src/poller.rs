//! Periodic acquisition of all tracked quantities.
//!
//! One cycle reads every instantaneous value (and optionally the two daily
//! energy counters). A reading that fails for any reason simply leaves the
//! previous value in place; the only trace of it is a lower validity count.

use crate::client::Meter;
use crate::deadline::Deadline;
use crate::fixed::{Amps, Hertz, KilowattHours, Volts, Watts};
use crate::protocol::{EnergyPeriod, Parameter, Phase};
use crate::transport::Transport;
use crate::Error;
use log::*;
use std::fmt;
use std::time::{Duration, Instant};

/// Time between the starts of two poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connection quality derived from the last cycle's validity count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Total power and frequency have never been read.
    NeverConnected,
    /// Nothing could be read in the last cycle.
    Offline,
    /// Some readings failed in the last cycle.
    Degraded,
    Online,
}

impl LinkStatus {
    /// Single-character status for the display.
    pub fn glyph(&self) -> char {
        match self {
            LinkStatus::NeverConnected => '?',
            LinkStatus::Offline => '!',
            LinkStatus::Degraded => '~',
            LinkStatus::Online => '=',
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::NeverConnected => "never connected",
            LinkStatus::Offline => "offline",
            LinkStatus::Degraded => "degraded",
            LinkStatus::Online => "online",
        })
    }
}

/// Latest known value of every tracked quantity.
///
/// Instantaneous values start at zero, energy counters start unknown. A value
/// only ever changes through a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementSet {
    pub voltage: [Volts; 3],
    pub current: [Amps; 3],
    /// Index 0 is the total over all phases.
    pub power: [Watts; 4],
    pub frequency: Hertz,
    pub energy_today: KilowattHours,
    pub energy_yesterday: KilowattHours,
    tracks_energy: bool,
    valid: u8,
    seen_total_power: bool,
    seen_frequency: bool,
}

impl MeasurementSet {
    pub fn new(tracks_energy: bool) -> Self {
        Self {
            voltage: [Volts::ZERO; 3],
            current: [Amps::ZERO; 3],
            power: [Watts::ZERO; 4],
            frequency: Hertz::ZERO,
            energy_today: KilowattHours::UNKNOWN,
            energy_yesterday: KilowattHours::UNKNOWN,
            tracks_energy,
            valid: 0,
            seen_total_power: false,
            seen_frequency: false,
        }
    }

    pub fn tracks_energy(&self) -> bool {
        self.tracks_energy
    }

    /// Number of readings attempted per cycle.
    pub fn expected(&self) -> u8 {
        let energy = if self.tracks_energy {
            EnergyPeriod::POLLED.len()
        } else {
            0
        };
        (Parameter::POLLED.len() + energy) as u8
    }

    /// Number of readings that succeeded in the last cycle.
    pub fn valid(&self) -> u8 {
        self.valid
    }

    /// True once total power and frequency have both been read at least once.
    pub fn ever_valid(&self) -> bool {
        self.seen_total_power && self.seen_frequency
    }

    pub fn status(&self) -> LinkStatus {
        if !self.ever_valid() {
            LinkStatus::NeverConnected
        } else if self.valid == 0 {
            LinkStatus::Offline
        } else if self.valid < self.expected() {
            LinkStatus::Degraded
        } else {
            LinkStatus::Online
        }
    }

    pub fn store(&mut self, parameter: Parameter, raw: u32) {
        match parameter {
            Parameter::Voltage(phase) => self.voltage[phase.index()] = Volts::from_reading(raw),
            Parameter::Current(phase) => self.current[phase.index()] = Amps::from_reading(raw),
            Parameter::Power(None) => {
                self.power[0] = Watts::from_reading(raw);
                self.seen_total_power = true;
            }
            Parameter::Power(Some(phase)) => {
                self.power[phase.index() + 1] = Watts::from_reading(raw)
            }
            Parameter::Frequency => {
                self.frequency = Hertz::from_reading(raw);
                self.seen_frequency = true;
            }
        }
    }

    pub fn store_energy(&mut self, period: EnergyPeriod, raw: u32) {
        let value = KilowattHours::from_reading(raw);
        match period {
            EnergyPeriod::CurrentDay => self.energy_today = value,
            EnergyPeriod::PreviousDay => self.energy_yesterday = value,
        }
    }

    pub fn phase_power(&self, phase: Phase) -> Watts {
        self.power[phase.index() + 1]
    }

    fn finish_cycle(&mut self, valid: u8) {
        self.valid = valid;
    }
}

impl fmt::Display for MeasurementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Status: {} ({}/{} readings valid)",
            self.status(),
            self.valid,
            self.expected()
        )?;
        writeln!(f, "Frequency: {} Hz", self.frequency)?;
        writeln!(f, "Total power: {} W", self.power[0])?;
        for phase in Phase::ALL {
            writeln!(
                f,
                "{phase}: {} V, {} A, {} W",
                self.voltage[phase.index()],
                self.current[phase.index()],
                self.phase_power(phase)
            )?;
        }
        if self.tracks_energy {
            writeln!(f, "Energy today: {} kWh", self.energy_today)?;
            write!(f, "Energy yesterday: {} kWh", self.energy_yesterday)?;
        }
        Ok(())
    }
}

/// Runs poll cycles on a fixed cadence.
#[derive(Debug, Clone)]
pub struct Poller {
    cadence: Deadline,
    interval: Duration,
}

impl Poller {
    /// A poller whose first cycle is due at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            cadence: Deadline::expired_at(now),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn due(&self, now: Instant) -> bool {
        self.cadence.expired(now)
    }

    /// Runs a cycle if one is due, returning its validity count.
    pub fn poll<T: Transport>(
        &mut self,
        meter: &mut Meter<T>,
        measurements: &mut MeasurementSet,
        now: Instant,
    ) -> Option<u8> {
        if !self.due(now) {
            return None;
        }
        self.cadence.rearm(now, self.interval);
        Some(run_cycle(meter, measurements, now))
    }
}

/// Reads every tracked quantity once and returns the number of successes.
pub fn run_cycle<T: Transport>(
    meter: &mut Meter<T>,
    measurements: &mut MeasurementSet,
    now: Instant,
) -> u8 {
    meter.begin_cycle();
    let mut valid = 0;
    for parameter in Parameter::POLLED {
        match meter.read_value(parameter, now) {
            Ok(raw) => {
                measurements.store(parameter, raw);
                valid += 1;
            }
            Err(err) => log_failure(&parameter, &err),
        }
    }
    if measurements.tracks_energy() {
        for period in EnergyPeriod::POLLED {
            match meter.read_energy(period, now) {
                Ok(raw) => {
                    measurements.store_energy(period, raw);
                    valid += 1;
                }
                Err(err) => log_failure(&period, &err),
            }
        }
    }
    measurements.finish_cycle(valid);
    trace!("Poll cycle done: {valid}/{} valid", measurements.expected());
    valid
}

fn log_failure(what: &dyn fmt::Display, err: &Error) {
    match err {
        Error::ChannelClosed => trace!("Skipped {what}: {err}"),
        err if err.is_transient() => debug!("Reading {what} failed: {err}"),
        err => warn!("Reading {what} failed: {err}"),
    }
}
