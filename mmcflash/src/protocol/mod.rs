//! Protocol implementations.
//!
//! [`command`] composes and classifies console lines; the helpers here move
//! them over a borrowed [`Port`]. No retries happen at this level.

pub mod command;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::image::PAGE_SIZE;
use crate::port::Port;

// Re-export common types
pub use command::{Command, INIT_CONFIRMATION, ReplyKind, ReplyLine, UploadSlot};

/// Write a command line.
pub fn send_command<P: Port + ?Sized>(port: &mut P, cmd: &Command) -> Result<()> {
    trace!("-> {cmd}");
    port.write_all_bytes(&cmd.build())
}

/// Read one reply line; may be empty or unterminated on timeout.
pub fn read_reply<P: Port + ?Sized>(port: &mut P) -> Result<ReplyLine> {
    let line = ReplyLine::new(port.read_line()?);
    trace!("<- {:?}", String::from_utf8_lossy(line.as_bytes()));
    Ok(line)
}

/// Read the acknowledgement of `cmd`.
///
/// A console that stays silent for the whole read timeout is treated as a
/// dead link. Any other unexpected line is logged and returned.
pub fn read_ack<P: Port + ?Sized>(port: &mut P, cmd: &Command) -> Result<ReplyLine> {
    let line = read_reply(port)?;
    if line.is_empty() {
        return Err(Error::Timeout(format!("no acknowledgement for '{cmd}'")));
    }
    match line.classify(cmd) {
        ReplyKind::Ack => {},
        ReplyKind::Error(text) => warn!("'{cmd}' answered with error: {text}"),
        ReplyKind::Status(text) => warn!("'{cmd}' answered with unexpected line: {text:?}"),
    }
    Ok(line)
}

/// Send `cmd` and read its acknowledgement.
pub fn execute<P: Port + ?Sized>(port: &mut P, cmd: &Command) -> Result<ReplyLine> {
    send_command(port, cmd)?;
    read_ack(port, cmd)
}

/// Read the next page worth of raw bytes; short on timeout.
pub fn read_page<P: Port + ?Sized>(port: &mut P) -> Result<Vec<u8>> {
    let data = port.read_bytes(PAGE_SIZE)?;
    trace!("<- {} raw bytes", data.len());
    Ok(data)
}
