//! Telemetry dumps: when to send them and what they look like.
//!
//! A dump is one summary line followed by one line per phase:
//!
//! ```text
//! [E:  312 f50.0;c004321 p012345 u00000075]*
//! [E1:  280 v230 a 1.3]
//! [E2:   32 v230 a 0.1]
//! [E3:    0 v231 a 0.0]
//! ```
//!
//! The summary carries total power (W), frequency (Hz), today's and
//! yesterday's energy (Wh, only when energy is polled) and uptime (s). The
//! trailing marker tells consumers why the dump was sent: nothing for a
//! periodic dump, `*` for the first one after boot and `?*` for an answer to a
//! query command.
//!
//! The first dump is due shortly after startup. Every later one is due a base
//! period plus a uniformly random skew after the previous one, so that several
//! reporters sharing a channel drift apart. Query dumps never move that
//! schedule.

use crate::deadline::Deadline;
use crate::fixed::{Amps, Field, Fixed, Hertz, KilowattHours, Volts, Watts};
use crate::poller::MeasurementSet;
use crate::protocol::Phase;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::{self, Write as _};
use std::io;
use std::time::{Duration, Instant};

/// Delay from startup to the first dump.
pub const INITIAL_DUMP_INTERVAL: Duration = Duration::from_secs(2);
/// Base time between two periodic dumps.
pub const DUMP_PERIOD: Duration = Duration::from_secs(60);
/// Maximum random deviation from `DUMP_PERIOD`, in both directions.
pub const DUMP_SKEW: Duration = Duration::from_secs(5);

/// Inbound command character requesting an immediate dump.
pub const QUERY_COMMAND: u8 = b'?';

/// Line sent once at startup.
pub const BANNER: &str = "[E:boot]";

const POWER_FIELD: Field = Field::new(5, 0);
const FREQUENCY_FIELD: Field = Field::new(4, 1);
const ENERGY_FIELD: Field = Field::zero_padded(6, 0);
const UPTIME_FIELD: Field = Field::zero_padded(8, 0);
const VOLTAGE_FIELD: Field = Field::new(3, 0);
const CURRENT_FIELD: Field = Field::new(4, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpTiming {
    pub initial: Duration,
    pub period: Duration,
    pub skew: Duration,
}

impl Default for DumpTiming {
    fn default() -> Self {
        Self {
            initial: INITIAL_DUMP_INTERVAL,
            period: DUMP_PERIOD,
            skew: DUMP_SKEW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Regular,
    First,
    Query,
}

impl DumpKind {
    pub fn marker(&self) -> &'static str {
        match self {
            DumpKind::Regular => "",
            DumpKind::First => "*",
            DumpKind::Query => "?*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    AwaitingFirst,
    Periodic,
}

/// Decides when periodic dumps are due.
#[derive(Debug)]
pub struct DumpScheduler<R = StdRng> {
    state: ScheduleState,
    deadline: Deadline,
    timing: DumpTiming,
    rng: R,
}

impl DumpScheduler<StdRng> {
    pub fn new(now: Instant, timing: DumpTiming) -> Self {
        Self::with_rng(now, timing, StdRng::from_os_rng())
    }
}

impl<R: Rng> DumpScheduler<R> {
    pub fn with_rng(now: Instant, timing: DumpTiming, rng: R) -> Self {
        Self {
            state: ScheduleState::AwaitingFirst,
            deadline: Deadline::armed(now, timing.initial),
            timing,
            rng,
        }
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Returns the kind of dump to send now, if any, and advances the schedule.
    ///
    /// While `ready` is false nothing is sent and the deadline stays expired, so
    /// the dump goes out on the first tick that has data.
    pub fn poll(&mut self, now: Instant, ready: bool) -> Option<DumpKind> {
        if !self.deadline.expired(now) || !ready {
            return None;
        }
        let kind = match self.state {
            ScheduleState::AwaitingFirst => {
                self.state = ScheduleState::Periodic;
                DumpKind::First
            }
            ScheduleState::Periodic => DumpKind::Regular,
        };
        let interval = self.next_interval();
        self.deadline.rearm(now, interval);
        Some(kind)
    }

    fn next_interval(&mut self) -> Duration {
        let skew = self.timing.skew.as_millis() as i64;
        let period = self.timing.period.as_millis() as i64;
        let offset = if skew > 0 {
            self.rng.random_range(-skew..=skew)
        } else {
            0
        };
        Duration::from_millis((period + offset).max(0) as u64)
    }
}

fn watt_hours(energy: KilowattHours) -> Fixed<0> {
    // 1 Wh is one raw step of a kWh value.
    Fixed::from_raw(energy.raw())
}

fn seconds(uptime: Duration) -> Fixed<0> {
    Fixed::from_raw(i32::try_from(uptime.as_secs()).unwrap_or(i32::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryLine {
    pub total_power: Watts,
    pub frequency: Hertz,
    /// Today's and yesterday's energy when energy is polled.
    pub energy: Option<(KilowattHours, KilowattHours)>,
    pub uptime: Duration,
    pub kind: DumpKind,
}

impl fmt::Display for SummaryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[E:")?;
        self.total_power.write_field(f, POWER_FIELD)?;
        f.write_str(" f")?;
        self.frequency.write_field(f, FREQUENCY_FIELD)?;
        f.write_char(';')?;
        if let Some((today, yesterday)) = self.energy {
            f.write_char('c')?;
            watt_hours(today).write_field(f, ENERGY_FIELD)?;
            f.write_str(" p")?;
            watt_hours(yesterday).write_field(f, ENERGY_FIELD)?;
            f.write_char(' ')?;
        }
        f.write_char('u')?;
        seconds(self.uptime).write_field(f, UPTIME_FIELD)?;
        f.write_char(']')?;
        f.write_str(self.kind.marker())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLine {
    pub phase: Phase,
    pub power: Watts,
    pub voltage: Volts,
    pub current: Amps,
}

impl fmt::Display for PhaseLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[E{}:", self.phase.number())?;
        self.power.write_field(f, POWER_FIELD)?;
        f.write_str(" v")?;
        self.voltage.write_field(f, VOLTAGE_FIELD)?;
        f.write_str(" a")?;
        self.current.write_field(f, CURRENT_FIELD)?;
        f.write_char(']')
    }
}

/// One complete dump, captured from a snapshot of the measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpRecord {
    pub summary: SummaryLine,
    pub phases: [PhaseLine; 3],
}

impl DumpRecord {
    pub fn capture(measurements: &MeasurementSet, uptime: Duration, kind: DumpKind) -> Self {
        let snapshot = *measurements;
        let energy = snapshot
            .tracks_energy()
            .then_some((snapshot.energy_today, snapshot.energy_yesterday));
        Self {
            summary: SummaryLine {
                total_power: snapshot.power[0],
                frequency: snapshot.frequency,
                energy,
                uptime,
                kind,
            },
            phases: Phase::ALL.map(|phase| PhaseLine {
                phase,
                power: snapshot.phase_power(phase),
                voltage: snapshot.voltage[phase.index()],
                current: snapshot.current[phase.index()],
            }),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        std::iter::once(self.summary.to_string())
            .chain(self.phases.iter().map(PhaseLine::to_string))
            .collect()
    }

    /// Writes all lines, newline terminated, and flushes.
    pub fn write_to<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", self.summary)?;
        for phase in &self.phases {
            writeln!(out, "{phase}")?;
        }
        out.flush()
    }
}
