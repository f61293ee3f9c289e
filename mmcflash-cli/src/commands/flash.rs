//! Flash, verify and activate command implementations.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use mmcflash::port::{DEFAULT_BAUD, DEFAULT_TIMEOUT};
use mmcflash::{
    Mode, NativePort, PAGE_SIZE, Programmer, ProgrammerConfig, Progress, RunRequest, SerialConfig,
};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output};

/// Arguments shared by `flash` and `verify`.
pub(crate) struct FlashArgs<'a> {
    pub(crate) file: &'a Path,
    pub(crate) spi: Option<u8>,
    pub(crate) verify_only: bool,
    pub(crate) activate: bool,
    pub(crate) fill: Option<u8>,
}

/// Connection and run settings after merging CLI, environment and config.
#[derive(Debug, PartialEq, Eq)]
struct Settings {
    baud: u32,
    read_timeout: Duration,
    request: RunRequest,
}

fn resolve(cli: &Cli, config: &Config, args: &FlashArgs<'_>) -> Settings {
    let mode = if args.verify_only {
        Mode::VerifyOnly
    } else {
        Mode::Write
    };
    Settings {
        baud: connection_baud(cli, config),
        read_timeout: config
            .read_timeout()
            .unwrap_or(DEFAULT_TIMEOUT),
        request: RunRequest {
            spi_index: args
                .spi
                .or(config.flash.spi_index)
                .unwrap_or(0),
            mode,
            activate: args.activate || (mode == Mode::Write && config.flash.activate),
            fill_byte: args
                .fill
                .or(config.flash.fill_byte),
        },
    }
}

fn connection_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD)
}

fn open_programmer(
    port_name: &str,
    baud: u32,
    read_timeout: Duration,
) -> Result<Programmer<NativePort>> {
    let serial = SerialConfig::new(port_name, baud).with_timeout(read_timeout);
    let port = NativePort::open(&serial)
        .map_err(CliError::from)
        .with_context(|| format!("Failed to open {port_name}"))?;
    Ok(Programmer::new(port)
        .with_config(ProgrammerConfig::default().with_read_timeout(read_timeout)))
}

fn progress_bar(cli: &Cli, page_count: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(page_count);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn error_message(progress: &Progress) -> String {
    if progress.uart_errors == 0 && progress.storage_errors == 0 {
        String::new()
    } else {
        format!(
            "({} UART, {} storage errors)",
            progress.uart_errors, progress.storage_errors
        )
    }
}

/// Flash and verify command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &FlashArgs<'_>) -> Result<()> {
    let port = get_port(cli, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading image {}",
            style("📦").cyan(),
            args.file
                .display()
        );
    }
    let data = std::fs::read(args.file)
        .with_context(|| format!("Failed to read image {}", args.file.display()))?;
    if data.is_empty() {
        bail!("Image {} is empty", args.file.display());
    }
    let page_count = data
        .len()
        .div_ceil(PAGE_SIZE);

    let settings = resolve(cli, config, args);
    debug!("Resolved settings: {settings:?}");

    if !cli.quiet {
        eprintln!(
            "{} Using {port} at {} baud, flash {}, {page_count} pages",
            style("🔌").cyan(),
            settings.baud,
            settings.request.spi_index
        );
    }

    let mut programmer = open_programmer(&port, settings.baud, settings.read_timeout)?;

    let pb = progress_bar(cli, page_count as u64);
    let result = programmer.run(&data, &settings.request, |progress| {
        pb.set_position(u64::from(progress.page));
        pb.set_message(error_message(progress));
    });
    programmer.close();

    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            pb.abandon_with_message("failed");
            return Err(CliError::from(err).into());
        },
    };
    pb.finish_with_message("done");

    if !cli.quiet {
        eprintln!("\n{} {summary}", style("✓").green().bold());
    }

    Ok(())
}

/// Activate command implementation.
pub(crate) fn cmd_activate(cli: &Cli, config: &Config, spi: Option<u8>) -> Result<()> {
    let spi_index = spi
        .or(config.flash.spi_index)
        .unwrap_or(0);
    let baud = connection_baud(cli, config);
    let read_timeout = config
        .read_timeout()
        .unwrap_or(DEFAULT_TIMEOUT);

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Activating firmware on flash {spi_index} via {port}",
            style("🔄").cyan()
        );
    }

    let mut programmer = open_programmer(&port, baud, read_timeout)?;
    let result = programmer.activate(spi_index);
    programmer.close();
    let status = result.map_err(CliError::from)?;

    if !cli.quiet {
        if status.is_empty() {
            eprintln!("{} Firmware activated", style("✓").green().bold());
        } else {
            eprintln!("{} Firmware activated: {status}", style("✓").green().bold());
        }
    }

    Ok(())
}
