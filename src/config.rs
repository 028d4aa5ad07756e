use anyhow::{Context, Result};
use mercury230_lib::{
    dump::{DUMP_PERIOD, DUMP_SKEW, INITIAL_DUMP_INTERVAL},
    poller::POLL_INTERVAL,
    protocol as proto,
    session::SESSION_LIFETIME,
    transport::Direction,
};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of the `daemon` subcommand, read from a YAML file.
///
/// Meter settings given here take precedence over the command line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_session_lifetime", with = "humantime_serde")]
    pub session_lifetime: Duration,
    #[serde(default = "default_initial_dump", with = "humantime_serde")]
    pub initial_dump: Duration,
    #[serde(default = "default_dump_period", with = "humantime_serde")]
    pub dump_period: Duration,
    #[serde(default = "default_dump_skew", with = "humantime_serde")]
    pub dump_skew: Duration,
    /// Poll today's and yesterday's energy counters.
    #[serde(default = "default_energy")]
    pub energy: bool,
    #[serde(default)]
    pub address: Option<proto::Address>,
    #[serde(default)]
    pub password: Option<proto::Password>,
    #[serde(default)]
    pub baud_rate: Option<proto::BaudRate>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

fn default_poll_interval() -> Duration {
    POLL_INTERVAL
}

fn default_session_lifetime() -> Duration {
    SESSION_LIFETIME
}

fn default_initial_dump() -> Duration {
    INITIAL_DUMP_INTERVAL
}

fn default_dump_period() -> Duration {
    DUMP_PERIOD
}

fn default_dump_skew() -> Duration {
    DUMP_SKEW
}

fn default_energy() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            session_lifetime: default_session_lifetime(),
            initial_dump: default_initial_dump(),
            dump_period: default_dump_period(),
            dump_skew: default_dump_skew(),
            energy: default_energy(),
            address: None,
            password: None,
            baud_rate: None,
            direction: None,
        }
    }
}

impl DaemonConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "meterpoll.yml";

    /// Longest accepted value for any of the durations.
    pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

    fn validate(self) -> Result<Self> {
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("session_lifetime", self.session_lifetime),
            ("dump_period", self.dump_period),
        ] {
            anyhow::ensure!(!value.is_zero(), "{name} must be greater than zero");
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("session_lifetime", self.session_lifetime),
            ("initial_dump", self.initial_dump),
            ("dump_period", self.dump_period),
            ("dump_skew", self.dump_skew),
        ] {
            anyhow::ensure!(
                value <= Self::MAX_DURATION,
                "{name} ({}) must not exceed {}",
                humantime::format_duration(value),
                humantime::format_duration(Self::MAX_DURATION)
            );
        }
        anyhow::ensure!(
            self.dump_skew <= self.dump_period,
            "dump_skew ({:?}) must not exceed dump_period ({:?})",
            self.dump_skew,
            self.dump_period
        );
        Ok(self)
    }
}

/// Loads the daemon settings: from `path` if given, else from the default
/// file if it exists, else the built-in defaults.
pub fn load(path: Option<&Path>) -> Result<DaemonConfig> {
    match config_file_path(path) {
        Some(path) => {
            log::debug!("Loading config file from {path:?}");
            let config_file = File::open(&path)
                .with_context(|| format!("Cannot open config file {path:?}"))?;
            let config: DaemonConfig = serde_yaml::from_reader(&config_file)
                .with_context(|| format!("Cannot parse config file {path:?}"))?;
            config.validate()
        }
        None => {
            log::debug!("No config file found, using defaults");
            Ok(DaemonConfig::default())
        }
    }
}

fn config_file_path(path: Option<&Path>) -> Option<PathBuf> {
    let default_file = Path::new(DaemonConfig::DEFAULT_CONFIG_FILE);
    match path {
        Some(config) => Some(config.to_path_buf()),
        None if default_file.exists() => Some(default_file.to_path_buf()),
        None => None,
    }
}
