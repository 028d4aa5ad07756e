//! Mercury 230 meter poller CLI
//!
//! A command-line application that talks to a Mercury 230 three-phase
//! electricity meter over an RS485 adapter.
//!
//! This tool allows users to:
//! - Run the telemetry loop, emitting dump lines on stdout at a jittered
//!   period and on request (`?` on stdin).
//! - Read every measurement once and print it.
//! - Check that the configured password opens a channel.
//!
//! The CLI leverages the `mercury230_lib` crate for the protocol and the
//! control loop.

use anyhow::{Context, Result, bail};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use mercury230_lib::{
    client::Meter,
    dump::DumpTiming,
    poller::{self, MeasurementSet},
    protocol as proto,
    serial::SerialTransport,
    station::{Station, StationConfig},
    transport::Direction,
};
use std::io::{self, Read};
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use std::{panic, thread};

mod commandline;
mod config;

/// Idle time between two control loop iterations.
const LOOP_IDLE: Duration = Duration::from_millis(10);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// The driver must be enabled for at least one character time before the
/// first start bit.
fn minimum_settle_delay(baud_rate: &proto::BaudRate) -> Duration {
    baud_rate.char_time()
}

/// Checks if the user-provided settle delay is sufficient; if not, uses the calculated minimum.
fn check_settle_delay(user_delay: Duration, baud_rate: &proto::BaudRate) -> Duration {
    let min_delay = minimum_settle_delay(baud_rate);
    if user_delay < min_delay {
        warn!(
            "Settle delay of {user_delay:?} is below one character time of {min_delay:?} at {baud_rate} baud. Using minimum."
        );
        min_delay
    } else {
        user_delay
    }
}

/// Serial settings after applying the daemon config overrides.
struct Link<'a> {
    device: &'a str,
    baud_rate: proto::BaudRate,
    direction: Direction,
    timeout: Duration,
    delay: Duration,
}

impl<'a> Link<'a> {
    fn from_args(args: &'a commandline::CliArgs) -> Self {
        Self {
            device: &args.device,
            baud_rate: args.baud_rate,
            direction: args.direction,
            timeout: args.timeout,
            delay: args.delay,
        }
    }

    fn open(&self) -> Result<SerialTransport> {
        info!(
            "Opening {} at {} baud (direction control: {})...",
            self.device, self.baud_rate, self.direction
        );
        let mut transport =
            mercury230_lib::serial::open(self.device, &self.baud_rate, self.direction)
                .with_context(|| {
                    format!(
                        "Cannot open serial port {} at baud {}",
                        self.device, self.baud_rate
                    )
                })?;
        transport.set_timeout(self.timeout);
        transport.set_settle_delay(check_settle_delay(self.delay, &self.baud_rate));
        Ok(transport)
    }
}

/// Forwards bytes read from stdin; the thread ends with stdin.
fn spawn_command_reader() -> Result<mpsc::Receiver<u8>> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for byte in io::stdin().lock().bytes() {
                match byte {
                    Ok(byte) => {
                        if sender.send(byte).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!("Stopped reading commands: {error}");
                        break;
                    }
                }
            }
            debug!("Command input closed");
        })
        .context("Cannot start command reader thread")?;
    Ok(receiver)
}

fn run_daemon(args: &commandline::CliArgs, config_file: Option<&Path>) -> Result<()> {
    let config = config::load(config_file)?;
    info!("Starting daemon mode: {config:?}");

    let mut link = Link::from_args(args);
    link.baud_rate = config.baud_rate.unwrap_or(link.baud_rate);
    link.direction = config.direction.unwrap_or(link.direction);
    let transport = link.open()?;

    let station_config = StationConfig {
        address: config.address.unwrap_or(args.address),
        password: config.password.unwrap_or(args.password),
        poll_interval: config.poll_interval,
        session_lifetime: config.session_lifetime,
        dump: DumpTiming {
            initial: config.initial_dump,
            period: config.dump_period,
            skew: config.dump_skew,
        },
        energy: config.energy,
    };
    let mut station = Station::new(transport, &station_config, Instant::now());
    let commands = spawn_command_reader()?;

    let mut stdout = io::stdout().lock();
    station.start(&mut stdout).context("Cannot write to stdout")?;
    loop {
        for byte in commands.try_iter() {
            station.handle_command(byte);
        }
        station
            .tick(Instant::now(), &mut stdout)
            .context("Cannot write telemetry to stdout")?;
        thread::sleep(LOOP_IDLE);
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Mercury 230 poller started. Log level: {}",
        args.verbose.log_level_filter()
    );

    match &args.command {
        commandline::CliCommands::Daemon { config } => {
            run_daemon(&args, config.as_deref())?;
        }
        commandline::CliCommands::Read { energy } => {
            info!("Executing: Read Measurements");
            let transport = Link::from_args(&args).open()?;
            let now = Instant::now();
            let mut meter = Meter::new(transport, args.address, args.password, now);
            let mut measurements = MeasurementSet::new(*energy);
            let valid = poller::run_cycle(&mut meter, &mut measurements, now);
            if valid == 0 {
                bail!("No valid reading from meter at address {}", args.address);
            }
            println!("{measurements}");
        }
        commandline::CliCommands::Open => {
            info!("Executing: Open Channel");
            let transport = Link::from_args(&args).open()?;
            let now = Instant::now();
            let mut meter = Meter::new(transport, args.address, args.password, now);
            meter.open_channel(now).with_context(|| {
                format!("Cannot open channel to meter at address {}", args.address)
            })?;
            println!("Channel to meter at address {} opened.", args.address);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_settle_delay_calculation() {
        // One 8N1 character is 10 bits.
        assert_eq!(minimum_settle_delay(&proto::BaudRate::B300).as_micros(), 33333);
        assert_eq!(minimum_settle_delay(&proto::BaudRate::B1200).as_micros(), 8333);
        assert_eq!(minimum_settle_delay(&proto::BaudRate::B4800).as_micros(), 2083);
        assert_eq!(minimum_settle_delay(&proto::BaudRate::B9600).as_micros(), 1041);
    }

    #[test]
    fn test_check_settle_delay() {
        let br_9600 = proto::BaudRate::B9600;
        let br_1200 = proto::BaudRate::B1200;

        assert_eq!(
            check_settle_delay(Duration::from_millis(2), &br_9600),
            Duration::from_millis(2)
        );
        assert_eq!(
            check_settle_delay(Duration::from_millis(2), &br_1200),
            minimum_settle_delay(&br_1200)
        );
        assert_eq!(
            check_settle_delay(Duration::ZERO, &br_9600),
            minimum_settle_delay(&br_9600)
        );
    }
}
