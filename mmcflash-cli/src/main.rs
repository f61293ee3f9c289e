//! mmcflash CLI - Command-line tool for programming MMC-attached FPGA boot flash.
//!
//! ## Features
//!
//! - Write a bitstream image with per-page echo and read-back verification
//! - Verify flash contents against an image
//! - Reboot the FPGA from flash
//! - List available serial ports
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use mmcflash::ExitStatus;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

mod commands;
mod config;

use commands::flash::{FlashArgs, cmd_activate, cmd_flash};
use commands::ports::{cmd_list_ports, print_available_ports};
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// mmcflash - Program the FPGA boot flash behind an MMC over its serial console.
///
/// Environment variables:
///   MMCFLASH_PORT   - Default serial port
///   MMCFLASH_BAUD   - Default baud rate (default: 921600)
///   MMCFLASH_SPI    - Default SPI flash index (default: 0)
#[derive(Parser)]
#[command(name = "mmcflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port of the MMC console.
    #[arg(short, long, global = true, env = "MMCFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate [default: 921600].
    #[arg(short, long, global = true, env = "MMCFLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Write an image to flash, verifying every page.
    Flash {
        /// Binary image to write.
        file: PathBuf,

        /// Target SPI flash index.
        #[arg(short, long, env = "MMCFLASH_SPI")]
        spi: Option<u8>,

        /// Reboot the FPGA from the flash after a successful write.
        #[arg(short, long)]
        activate: bool,

        /// Fill byte for the last page (decimal or 0x-prefixed hex).
        #[arg(long, value_parser = parse_byte)]
        fill: Option<u8>,
    },

    /// Compare flash contents against an image without writing.
    Verify {
        /// Binary image to compare with.
        file: PathBuf,

        /// Target SPI flash index.
        #[arg(short, long, env = "MMCFLASH_SPI")]
        spi: Option<u8>,

        /// Reboot the FPGA from the flash after the scan.
        #[arg(short, long)]
        activate: bool,

        /// Fill byte the last page was padded with.
        #[arg(long, value_parser = parse_byte)]
        fill: Option<u8>,
    },

    /// Reboot the FPGA from flash without writing.
    Activate {
        /// Target SPI flash index.
        #[arg(short, long, env = "MMCFLASH_SPI")]
        spi: Option<u8>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// CLI failures with a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// No serial port given on the command line or in a config file.
    #[error("No serial port selected; pass --port or set MMCFLASH_PORT")]
    NoPortSelected,

    /// The programming run failed.
    #[error(transparent)]
    Flash(#[from] mmcflash::Error),
}

impl CliError {
    /// Process exit code.
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            Self::NoPortSelected => ExitStatus::NoPortSelected.code(),
            Self::Flash(e) => ExitStatus::from(e).code(),
        }
    }
}

/// Exit code for any error reaching `main`.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CliError>()
        .map_or(ExitStatus::UploadFailed.code(), CliError::exit_code)
}

/// Parse a byte given as decimal or 0x-prefixed hexadecimal.
fn parse_byte(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|e| format!("Invalid byte '{s}': {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "mmcflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            file,
            spi,
            activate,
            fill,
        } => cmd_flash(
            cli,
            &config,
            &FlashArgs {
                file,
                spi: *spi,
                verify_only: false,
                activate: *activate,
                fill: *fill,
            },
        ),
        Commands::Verify {
            file,
            spi,
            activate,
            fill,
        } => cmd_flash(
            cli,
            &config,
            &FlashArgs {
                file,
                spi: *spi,
                verify_only: true,
                activate: *activate,
                fill: *fill,
            },
        ),
        Commands::Activate { spi } => cmd_activate(cli, &config, *spi),
        Commands::ListPorts { json } => cmd_list_ports(*json),
    }
}

/// Serial port from the command line, environment or config file.
///
/// Without one, the available ports are listed and the run stops.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    if let Some(port) = &config
        .connection
        .serial
    {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    print_available_ports();
    Err(CliError::NoPortSelected.into())
}
