//! MMC console command codec.
//!
//! Commands are single text lines terminated by a carriage return:
//!
//! ```text
//! <name> <arg1> <arg2> ...\r
//! ```
//!
//! The console echoes each command line back before it runs the command, and
//! prints whatever the command produced as further text lines. Binary page
//! payloads travel raw, directly after the acknowledgement.

use std::fmt;

/// Terminator appended to every outgoing command line.
pub const COMMAND_TERMINATOR: &str = "\r";

/// Status line sent after `flash_init` once the page buffer is allocated.
pub const INIT_CONFIRMATION: &str = "Initialising flash write";

/// Which page slot a `flash_upload` goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSlot {
    /// Advance to the next page slot.
    New,
    /// Overwrite the page already staged on the device.
    Repeat,
}

impl UploadSlot {
    /// Argument passed to `flash_upload`.
    pub fn flag(self) -> char {
        match self {
            Self::New => 'i',
            Self::Repeat => 'r',
        }
    }
}

/// Commands understood by the MMC flash console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Select the flash, allocate the page buffer and start erasing.
    FlashInit {
        /// Target flash unit.
        spi_index: u8,
        /// Number of pages that will follow.
        page_count: u32,
    },
    /// Stage one page; the payload follows the acknowledgement.
    FlashUpload(UploadSlot),
    /// Read one committed page back from flash.
    FlashRead {
        /// Target flash unit.
        spi_index: u8,
        /// Page to read.
        page: u32,
        /// Wait for an in-flight write to complete first.
        wait: bool,
    },
    /// Release the page buffer.
    FlashFinal {
        /// Number of pages of the image.
        page_count: u32,
    },
    /// Reboot the FPGA from the given flash.
    FlashActivateFirmware {
        /// Target flash unit.
        spi_index: u8,
    },
}

impl Command {
    /// Command name as typed on the console.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlashInit { .. } => "flash_init",
            Self::FlashUpload(_) => "flash_upload",
            Self::FlashRead { .. } => "flash_read",
            Self::FlashFinal { .. } => "flash_final",
            Self::FlashActivateFirmware { .. } => "flash_activate_firmware",
        }
    }

    /// Ordered argument list.
    pub fn args(&self) -> Vec<String> {
        match *self {
            Self::FlashInit {
                spi_index,
                page_count,
            } => vec![spi_index.to_string(), page_count.to_string()],
            Self::FlashUpload(slot) => vec![
                slot.flag()
                    .to_string(),
            ],
            Self::FlashRead {
                spi_index,
                page,
                wait,
            } => vec![
                spi_index.to_string(),
                page.to_string(),
                u8::from(wait).to_string(),
            ],
            Self::FlashFinal { page_count } => vec![page_count.to_string()],
            Self::FlashActivateFirmware { spi_index } => vec![spi_index.to_string()],
        }
    }

    /// Build the terminated command line.
    pub fn build(&self) -> Vec<u8> {
        format!("{self}{COMMAND_TERMINATOR}").into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Classification of a reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// The console echoed the command back.
    Ack,
    /// The firmware reported a failure.
    Error(String),
    /// Any other text, including an empty line.
    Status(String),
}

/// Prefixes and fragments the firmware uses when a command fails.
const ERROR_MARKERS: &[&str] = &[
    "timeout",
    "Abort",
    "out of memory",
    "Unknown flash id",
    "ERROR",
];

/// One line received from the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    raw: Vec<u8>,
}

impl ReplyLine {
    /// Wrap raw bytes as read from the port, terminator included.
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Whether nothing at all was received.
    pub fn is_empty(&self) -> bool {
        self.raw
            .is_empty()
    }

    /// Line text without terminator and surrounding whitespace.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw)
            .trim()
            .to_string()
    }

    /// Whether the line carries nothing but a line terminator.
    pub fn is_blank(&self) -> bool {
        self.text()
            .is_empty()
    }

    /// Whether the line starts with `prefix`.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.text()
            .starts_with(prefix)
    }

    /// Classify the line as a reply to `sent`.
    pub fn classify(&self, sent: &Command) -> ReplyKind {
        let text = self.text();
        if text.ends_with(&sent.to_string()) {
            ReplyKind::Ack
        } else if ERROR_MARKERS
            .iter()
            .any(|m| text.contains(m))
        {
            ReplyKind::Error(text)
        } else {
            ReplyKind::Status(text)
        }
    }
}

impl fmt::Display for ReplyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}
