use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use mercury230_lib::{protocol as proto, transport::Direction};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

fn parse_password(s: &str) -> Result<proto::Password, String> {
    s.parse::<proto::Password>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the telemetry loop: poll the meter continuously and write dump lines
    /// to stdout. Send '?' on stdin to request an immediate dump.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// YAML file with the schedule settings.
        /// Defaults to "meterpoll.yml" in the working directory if it exists.
        #[arg(short, long, verbatim_doc_comment)]
        config: Option<PathBuf>,
    },

    /// Run one poll cycle and print every measurement.
    Read {
        /// Also read today's and yesterday's active energy.
        #[arg(short, long)]
        energy: bool,
    },

    /// Open a channel with the configured password and report the result.
    Open,
}

const fn about_text() -> &'static str {
    "Mercury 230 meter poller - Read a three-phase meter over RS485 and emit telemetry lines."
}

#[derive(Parser, Debug)]
#[command(name="meterpoll", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Serial port device name.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate for serial communication.
    /// Supported values: 300, 600, 1200, 2400, 4800, 9600.
    #[arg(global = true, long, default_value_t = proto::BaudRate::default(), value_parser = parse_baud_rate, verbatim_doc_comment)]
    pub baud_rate: proto::BaudRate,

    /// Network address of the meter (0 to 240, 0 is answered by any meter).
    /// Can be specified in decimal or hexadecimal (e.g., "0x2A").
    #[arg(global = true, short, long, default_value_t = proto::Address::default(), value_parser = parse_address, verbatim_doc_comment)]
    pub address: proto::Address,

    /// Six-digit access password.
    #[arg(global = true, short, long, default_value_t = proto::Password::default(), value_parser = parse_password)]
    pub password: proto::Password,

    /// How long to wait for a complete response.
    /// Examples: "150ms", "1s".
    #[arg(global = true, long, default_value = "150ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Settle time between enabling the RS485 driver and sending.
    /// Raised to one character time if smaller.
    /// Examples: "2ms", "5ms".
    #[arg(global = true, long, default_value = "2ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,

    /// How the RS485 driver direction is switched: rts, rts-inverted or auto.
    #[arg(global = true, long, default_value_t = Direction::default())]
    pub direction: Direction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "meterpoll",
            "read",
            "--energy",
            "--address",
            "0x2A",
            "--password",
            "123456",
            "--baud-rate",
            "4800",
            "--direction",
            "auto",
        ])
        .unwrap();
        assert_eq!(args.command, CliCommands::Read { energy: true });
        assert_eq!(*args.address, 0x2A);
        assert_eq!(args.password, "123456".parse::<proto::Password>().unwrap());
        assert_eq!(args.baud_rate, proto::BaudRate::B4800);
        assert_eq!(args.direction, Direction::Auto);
        assert_eq!(args.timeout, Duration::from_millis(150));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(CliArgs::try_parse_from(["meterpoll", "open", "--address", "241"]).is_err());
        assert!(CliArgs::try_parse_from(["meterpoll", "open", "--password", "12345"]).is_err());
        assert!(CliArgs::try_parse_from(["meterpoll", "open", "--baud-rate", "19200"]).is_err());
    }
}
