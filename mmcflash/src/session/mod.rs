//! Flash programming session.
//!
//! A write run is an explicit state machine driven by [`step`]:
//!
//! ```text
//!            +------+
//!            | Init |----------------------------> InitRejected (no buffer)
//!            +--+---+
//!               |
//!               v
//!  +------> UploadPage ------ busy / echo mismatch ------+
//!  |            |                                        |
//!  |            v                                        v
//!  |        VerifyPage ----------------------------> AdvanceOrRetry ---> RetryBudgetExhausted
//!  |                                                     |
//!  +------------------ more pages -----------------------+
//!                                                        |
//!                                                        v
//!                                                    Finalize
//! ```
//!
//! `Finalize` is performed by the [`PageBuffer`] guard, which also runs it when
//! the loop exits with an error. Activation is only attempted after a clean
//! finish. A verify run is a single linear scan without retries.

pub mod buffer;

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::{Page, PagedImage};
use crate::port::{DEFAULT_TIMEOUT, Port};
use crate::protocol::{self, Command, INIT_CONFIRMATION, UploadSlot};

pub use buffer::PageBuffer;

/// Consecutive busy replies tolerated before a write run aborts.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 100;

/// Pause after a busy reply before the page is sent again.
pub const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Pages per windowed error report.
pub const REPORT_WINDOW: u32 = 100;

/// What a run does with the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Mode {
    /// Upload every page and verify it by reading it back.
    #[default]
    Write,
    /// Only compare flash contents against the image.
    VerifyOnly,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::VerifyOnly => write!(f, "verify"),
        }
    }
}

/// Timing and retry policy of a run.
#[derive(Debug, Clone)]
pub struct ProgrammerConfig {
    /// Bounded timeout for every read except the erase wait after init.
    pub read_timeout: Duration,
    /// Pause after a busy reply.
    pub busy_backoff: Duration,
    /// Consecutive busy replies tolerated for one page.
    pub max_consecutive_timeouts: u32,
    /// Pages per windowed error report.
    pub report_window: u32,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            busy_backoff: BUSY_BACKOFF,
            max_consecutive_timeouts: MAX_CONSECUTIVE_TIMEOUTS,
            report_window: REPORT_WINDOW,
        }
    }
}

impl ProgrammerConfig {
    /// Set the bounded read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the pause after a busy reply.
    #[must_use]
    pub fn with_busy_backoff(mut self, backoff: Duration) -> Self {
        self.busy_backoff = backoff;
        self
    }

    /// Set the consecutive busy reply ceiling.
    #[must_use]
    pub fn with_max_consecutive_timeouts(mut self, max: u32) -> Self {
        self.max_consecutive_timeouts = max;
        self
    }

    /// Set the report window; 0 disables windowed reports.
    #[must_use]
    pub fn with_report_window(mut self, pages: u32) -> Self {
        self.report_window = pages;
        self
    }
}

/// Result of one upload or verify attempt, consumed by `AdvanceOrRetry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Echo and read-back matched.
    Verified,
    /// The device asked for more time.
    Busy,
    /// The UART echo differed from the page sent.
    EchoMismatch,
    /// The page read back from flash differed from the image.
    ReadbackMismatch,
}

/// States of a write run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Allocate the device page buffer.
    Init,
    /// Send the current page.
    UploadPage,
    /// Read the current page back from flash.
    VerifyPage,
    /// Decide between the next page, a retry and giving up.
    AdvanceOrRetry(Attempt),
    /// All pages are written; release the page buffer.
    Finalize,
}

/// Mutable state of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Run mode.
    pub mode: Mode,
    /// Target flash unit.
    pub spi_index: u8,
    /// Pages in the image.
    pub page_count: u32,
    /// Page cursor, `0..=page_count`.
    pub current_page: u32,
    /// Resend the staged page instead of requesting a new slot.
    pub repeat_current_page: bool,
    /// Consecutive busy replies.
    pub timeout_count: u32,
    /// UART echo mismatches in the current report window.
    pub uart_error_count: u32,
    /// Flash read-back mismatches in the current report window.
    pub storage_error_count: u32,
    /// UART echo mismatches over the whole run.
    pub total_uart_errors: u32,
    /// Flash read-back mismatches over the whole run.
    pub total_storage_errors: u32,
}

impl Session {
    /// Fresh session at page 0.
    pub fn new(mode: Mode, spi_index: u8, page_count: u32) -> Self {
        Self {
            mode,
            spi_index,
            page_count,
            current_page: 0,
            repeat_current_page: false,
            timeout_count: 0,
            uart_error_count: 0,
            storage_error_count: 0,
            total_uart_errors: 0,
            total_storage_errors: 0,
        }
    }

    fn record_uart_error(&mut self) {
        self.uart_error_count += 1;
        self.total_uart_errors += 1;
    }

    fn record_storage_error(&mut self) {
        self.storage_error_count += 1;
        self.total_storage_errors += 1;
    }

    /// Log and reset the window counters at window boundaries.
    fn report_window(&mut self, window: u32) {
        let boundary = window > 0 && self.current_page % window == 0;
        if !boundary && self.current_page != self.page_count {
            return;
        }
        info!(
            "{}/{} pages, {} UART errors, {} storage errors since last report",
            self.current_page, self.page_count, self.uart_error_count, self.storage_error_count
        );
        self.uart_error_count = 0;
        self.storage_error_count = 0;
    }

    /// Snapshot for progress reporting.
    pub fn progress(&self) -> Progress {
        Progress {
            mode: self.mode,
            page: self.current_page,
            page_count: self.page_count,
            uart_errors: self.total_uart_errors,
            storage_errors: self.total_storage_errors,
        }
    }
}

/// Progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Run mode.
    pub mode: Mode,
    /// Pages done.
    pub page: u32,
    /// Pages in the image.
    pub page_count: u32,
    /// UART echo mismatches so far.
    pub uart_errors: u32,
    /// Flash read-back mismatches so far.
    pub storage_errors: u32,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Summary {
    /// Run mode.
    pub mode: Mode,
    /// Pages in the image.
    pub page_count: u32,
    /// Pages written or checked.
    pub pages_done: u32,
    /// UART echo mismatches.
    pub uart_errors: u32,
    /// Flash read-back mismatches.
    pub storage_errors: u32,
    /// Whether the FPGA was rebooted from the flash.
    pub activated: bool,
}

impl Summary {
    fn from_session(session: &Session, activated: bool) -> Self {
        Self {
            mode: session.mode,
            page_count: session.page_count,
            pages_done: session.current_page,
            uart_errors: session.total_uart_errors,
            storage_errors: session.total_storage_errors,
            activated,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} pages, {} UART errors, {} storage errors",
            self.mode, self.pages_done, self.page_count, self.uart_errors, self.storage_errors
        )?;
        if self.activated {
            write!(f, ", firmware activated")?;
        }
        Ok(())
    }
}

/// Parameters of [`Programmer::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Target flash unit.
    pub spi_index: u8,
    /// Run mode.
    pub mode: Mode,
    /// Reboot the FPGA from the flash once the run finished without error.
    pub activate: bool,
    /// Fill byte for the final page.
    pub fill_byte: Option<u8>,
}

/// Read-only inputs of the state machine.
pub struct Context<'a> {
    /// Image being written.
    pub image: PagedImage<'a>,
    /// Policy.
    pub config: &'a ProgrammerConfig,
}

impl Context<'_> {
    fn page(&self, index: u32) -> Result<Page> {
        self.image
            .page(index)
            .ok_or_else(|| Error::Protocol(format!("page {index} is outside the image")))
    }
}

/// Perform one transition of a write run.
///
/// Consumes the session and hands back its successor together with the next
/// state. Returns [`State::Finalize`] once every page is written; callers
/// must not pass `Finalize` back in.
pub fn step<P: Port + ?Sized>(
    port: &mut P,
    ctx: &Context<'_>,
    state: State,
    session: Session,
) -> Result<(State, Session)> {
    debug!("page {}/{}: {state:?}", session.current_page, session.page_count);
    match state {
        State::Init => init(port, ctx, session),
        State::UploadPage => upload_page(port, ctx, session),
        State::VerifyPage => verify_page(port, ctx, session),
        State::AdvanceOrRetry(attempt) => advance_or_retry(ctx, attempt, session),
        State::Finalize => Err(Error::Protocol(
            "finalize is handled by the page buffer guard".into(),
        )),
    }
}

fn init<P: Port + ?Sized>(
    port: &mut P,
    ctx: &Context<'_>,
    session: Session,
) -> Result<(State, Session)> {
    port.discard_input()?;
    protocol::execute(
        port,
        &Command::FlashInit {
            spi_index: session.spi_index,
            page_count: session.page_count,
        },
    )?;

    // The erase runs before the confirmation; its duration is unknown.
    port.set_timeout(None)?;
    let status = protocol::read_reply(port);
    port.set_timeout(Some(ctx.config.read_timeout))?;
    let status = status?;

    if !status.starts_with(INIT_CONFIRMATION) {
        return Err(Error::InitRejected {
            reply: status.text(),
        });
    }
    info!(
        "Flash {} initialised for {} pages",
        session.spi_index, session.page_count
    );
    Ok((State::UploadPage, session))
}

fn upload_page<P: Port + ?Sized>(
    port: &mut P,
    ctx: &Context<'_>,
    mut session: Session,
) -> Result<(State, Session)> {
    let page = ctx.page(session.current_page)?;
    let slot = if session.repeat_current_page {
        UploadSlot::Repeat
    } else {
        UploadSlot::New
    };

    protocol::execute(port, &Command::FlashUpload(slot))?;
    port.write_all_bytes(&page.bytes)?;
    let echo = protocol::read_page(port)?;
    let status = protocol::read_reply(port)?;
    let echo_matches = echo == page.bytes;

    if !status.is_blank() {
        session.timeout_count += 1;
        if !echo_matches {
            session.record_uart_error();
        }
        warn!(
            "Device busy on page {} ({} in a row): {status}",
            page.index, session.timeout_count
        );
        thread::sleep(ctx.config.busy_backoff);
        port.discard_input()?;
        return Ok((State::AdvanceOrRetry(Attempt::Busy), session));
    }

    session.timeout_count = 0;
    if !echo_matches {
        warn!(
            "UART echo mismatch on page {} ({} of {} bytes received)",
            page.index,
            echo.len(),
            page.bytes.len()
        );
        session.repeat_current_page = true;
        session.record_uart_error();
        return Ok((State::AdvanceOrRetry(Attempt::EchoMismatch), session));
    }

    Ok((State::VerifyPage, session))
}

fn verify_page<P: Port + ?Sized>(
    port: &mut P,
    ctx: &Context<'_>,
    mut session: Session,
) -> Result<(State, Session)> {
    let page = ctx.page(session.current_page)?;
    let readback = read_back(port, session.spi_index, page.index, true)?;

    if readback != page.bytes {
        warn!("Read-back mismatch on page {}", page.index);
        session.repeat_current_page = true;
        session.record_storage_error();
        return Ok((State::AdvanceOrRetry(Attempt::ReadbackMismatch), session));
    }

    session.repeat_current_page = false;
    Ok((State::AdvanceOrRetry(Attempt::Verified), session))
}

fn advance_or_retry(
    ctx: &Context<'_>,
    attempt: Attempt,
    mut session: Session,
) -> Result<(State, Session)> {
    if attempt == Attempt::Verified {
        session.current_page += 1;
        session.report_window(ctx.config.report_window);
    }

    if session.timeout_count > ctx.config.max_consecutive_timeouts {
        return Err(Error::RetryBudgetExhausted {
            page: session.current_page,
            timeouts: session.timeout_count,
        });
    }

    if session.current_page == session.page_count {
        Ok((State::Finalize, session))
    } else {
        Ok((State::UploadPage, session))
    }
}

/// `flash_read` one page: acknowledgement, payload, trailing line.
fn read_back<P: Port + ?Sized>(
    port: &mut P,
    spi_index: u8,
    page: u32,
    wait: bool,
) -> Result<Vec<u8>> {
    protocol::execute(
        port,
        &Command::FlashRead {
            spi_index,
            page,
            wait,
        },
    )?;
    let data = protocol::read_page(port)?;
    protocol::read_reply(port)?;
    Ok(data)
}

/// Programs the boot flash behind an MMC console.
///
/// Owns the port exclusively for its whole lifetime.
pub struct Programmer<P: Port> {
    port: P,
    config: ProgrammerConfig,
}

impl<P: Port> Programmer<P> {
    /// Create a programmer on an opened port with the default policy.
    pub fn new(port: P) -> Self {
        Self {
            port,
            config: ProgrammerConfig::default(),
        }
    }

    /// Replace the timing and retry policy.
    #[must_use]
    pub fn with_config(mut self, config: ProgrammerConfig) -> Self {
        self.config = config;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the programmer and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Close the underlying port.
    pub fn close(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }

    /// Write or verify `data`, then optionally activate the firmware.
    ///
    /// `progress` is called whenever the page cursor moves.
    pub fn run<F>(
        &mut self,
        data: &[u8],
        request: &RunRequest,
        mut progress: F,
    ) -> Result<Summary>
    where
        F: FnMut(&Progress),
    {
        if data.is_empty() {
            return Err(Error::Config("image is empty".into()));
        }
        let image = match request.fill_byte {
            Some(fill) => PagedImage::with_fill_byte(data, fill),
            None => PagedImage::new(data),
        };
        self.port
            .set_timeout(Some(self.config.read_timeout))?;

        info!(
            "{} {} bytes ({} pages) on flash {} via {}",
            request.mode,
            image.len(),
            image.page_count(),
            request.spi_index,
            self.port.name()
        );

        let session = match request.mode {
            Mode::Write => self.program(image, request.spi_index, &mut progress)?,
            Mode::VerifyOnly => self.verify(image, request.spi_index, &mut progress)?,
        };

        let activated = if request.activate {
            self.activate(request.spi_index)?;
            true
        } else {
            false
        };

        let summary = Summary::from_session(&session, activated);
        info!("{summary}");
        Ok(summary)
    }

    /// Write run: init, page loop, guaranteed finalize.
    fn program(
        &mut self,
        image: PagedImage<'_>,
        spi_index: u8,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<Session> {
        let ctx = Context {
            image,
            config: &self.config,
        };
        let session = Session::new(Mode::Write, spi_index, image.page_count());

        // No buffer exists yet if this fails.
        let (mut state, mut session) = step(&mut self.port, &ctx, State::Init, session)?;
        let mut buffer = PageBuffer::allocated(&mut self.port, session.page_count);
        progress(&session.progress());

        let outcome = loop {
            if state == State::Finalize {
                break Ok(session);
            }
            let page = session.current_page;
            match step(buffer.port(), &ctx, state, session) {
                Ok((next, advanced)) => {
                    if advanced.current_page != page {
                        progress(&advanced.progress());
                    }
                    state = next;
                    session = advanced;
                },
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(session) => {
                buffer.release()?;
                Ok(session)
            },
            Err(e) => {
                warn!("Write aborted: {e}");
                if let Err(release_err) = buffer.release() {
                    warn!("Could not release page buffer: {release_err}");
                }
                Err(e)
            },
        }
    }

    /// Verify run: one read per page, in order, no retries.
    fn verify(
        &mut self,
        image: PagedImage<'_>,
        spi_index: u8,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<Session> {
        let mut session = Session::new(Mode::VerifyOnly, spi_index, image.page_count());
        self.port
            .discard_input()?;
        progress(&session.progress());

        for page in image.pages() {
            let readback = read_back(&mut self.port, spi_index, page.index, false)?;
            if readback != page.bytes {
                warn!("Page {} differs from the image", page.index);
                session.record_storage_error();
            }
            session.current_page += 1;
            session.report_window(self.config.report_window);
            progress(&session.progress());
        }

        Ok(session)
    }

    /// Reboot the FPGA from flash `spi_index`; returns the device's status.
    pub fn activate(&mut self, spi_index: u8) -> Result<String> {
        self.port
            .discard_input()?;
        protocol::execute(
            &mut self.port,
            &Command::FlashActivateFirmware { spi_index },
        )?;
        let status = protocol::read_reply(&mut self.port)?;
        info!("Firmware on flash {spi_index} activated {status}");
        Ok(status.text())
    }
}
