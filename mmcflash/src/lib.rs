//! # mmcflash
//!
//! A library for programming the FPGA boot flash that sits behind an MMC
//! (module management controller), using the text console the MMC firmware
//! exposes on its debug UART.
//!
//! This crate provides:
//!
//! - A [`Port`] abstraction with a native `serialport` backend
//! - The console command codec (`flash_init`, `flash_upload`, `flash_read`,
//!   `flash_final`, `flash_activate_firmware`)
//! - Paging of an image into fixed 256-byte pages
//! - The write/verify/retry state machine, with the device page buffer
//!   released on every exit path
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for run summaries
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmcflash::{Mode, Programmer, RunRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("bitstream.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = mmcflash::NativePort::open_simple("/dev/ttyUSB0", 921600)?;
//!         let mut programmer = Programmer::new(port);
//!         let request = RunRequest {
//!             spi_index: 0,
//!             mode: Mode::Write,
//!             activate: true,
//!             fill_byte: None,
//!         };
//!         let summary = programmer.run(&image, &request, |p| {
//!             println!("{}/{} pages", p.page, p.page_count);
//!         })?;
//!         println!("{summary}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, ExitStatus, Result},
    image::{DEFAULT_FILL_BYTE, PAGE_SIZE, Page, PagedImage},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Command, ReplyKind, ReplyLine, UploadSlot},
    session::{Mode, Programmer, ProgrammerConfig, Progress, RunRequest, Session, State, Summary},
};
