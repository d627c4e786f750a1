use crate::domain::packet::{DeviceType, MeterCommand};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "atorch-link", version, about = "Talk to Atorch BLE power meters")]
pub struct Cli {
    /// Print packets as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging (overrides the configured level).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file to use instead of the per-user one.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover a meter and print its packets until it disconnects.
    Watch(DiscoveryArgs),
    /// Discover a meter and send it one command.
    Send(SendArgs),
    /// Feed a captured notification dump (one hex fragment per line) through the decoder.
    Replay {
        file: PathBuf,
    },
    /// Decode a single complete frame given as hex.
    Decode {
        frame: String,
    },
}

#[derive(Args, Debug)]
pub struct DiscoveryArgs {
    /// Give up scanning after this many milliseconds.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    pub command: CommandArg,

    /// Meter family the command is addressed to.
    #[arg(long, value_name = "TYPE")]
    pub device: Option<DeviceArg>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CommandArg {
    ResetEnergy,
    ResetCapacity,
    ResetDuration,
    ResetAll,
    Plus,
    Minus,
    Setup,
    Enter,
    UsbPlus,
    UsbMinus,
}

impl From<CommandArg> for MeterCommand {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::ResetEnergy => Self::ResetEnergy,
            CommandArg::ResetCapacity => Self::ResetCapacity,
            CommandArg::ResetDuration => Self::ResetDuration,
            CommandArg::ResetAll => Self::ResetAll,
            CommandArg::Plus => Self::Plus,
            CommandArg::Minus => Self::Minus,
            CommandArg::Setup => Self::Setup,
            CommandArg::Enter => Self::Enter,
            CommandArg::UsbPlus => Self::UsbPlus,
            CommandArg::UsbMinus => Self::UsbMinus,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    Ac,
    Dc,
    Usb,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Ac => Self::Ac,
            DeviceArg::Dc => Self::Dc,
            DeviceArg::Usb => Self::Usb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "atorch-link",
            "send",
            "reset-all",
            "--device",
            "usb",
            "--timeout-ms",
            "5000",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.command, CommandArg::ResetAll);
        assert_eq!(args.device, Some(DeviceArg::Usb));
        assert_eq!(args.discovery.timeout_ms, Some(5000));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["atorch-link", "watch", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
    }

    #[test]
    fn rejects_unknown_command() {
        let err = Cli::try_parse_from(["atorch-link", "send", "explode"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
