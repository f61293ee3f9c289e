//! Device-side page buffer guard.
//!
//! A successful `flash_init` leaves a page buffer allocated in the MMC until
//! `flash_final` is sent. [`PageBuffer`] is created right after allocation and
//! sends `flash_final` exactly once: explicitly through [`PageBuffer::release`],
//! or from `Drop` if it goes out of scope without having been released.

use log::{debug, warn};

use crate::error::Result;
use crate::port::Port;
use crate::protocol::{self, Command};

/// Send `flash_final` for an image of `page_count` pages.
fn finalize<P: Port + ?Sized>(port: &mut P, page_count: u32) -> Result<()> {
    port.discard_input()?;
    let ack = protocol::execute(port, &Command::FlashFinal { page_count })?;
    debug!("Page buffer released: {ack}");
    Ok(())
}

/// Scoped ownership of the allocated device page buffer.
///
/// Borrows the port for as long as the allocation lives; all page traffic
/// goes through [`PageBuffer::port`].
pub struct PageBuffer<'p, P: Port + ?Sized> {
    port: &'p mut P,
    page_count: u32,
    released: bool,
}

impl<'p, P: Port + ?Sized> PageBuffer<'p, P> {
    /// Take ownership of a buffer that `flash_init` just allocated.
    pub fn allocated(port: &'p mut P, page_count: u32) -> Self {
        Self {
            port,
            page_count,
            released: false,
        }
    }

    /// Port to use while the buffer is held.
    pub fn port(&mut self) -> &mut P {
        &mut *self.port
    }

    /// Release the buffer with `flash_final`.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        finalize(&mut *self.port, self.page_count)
    }
}

impl<P: Port + ?Sized> Drop for PageBuffer<'_, P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!("Page buffer still allocated, sending flash_final");
        if let Err(e) = finalize(&mut *self.port, self.page_count) {
            warn!("Could not release page buffer: {e}");
        }
    }
}
