//! Error types for mmcflash.

use std::io;
use thiserror::Error;

/// Result type for mmcflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mmcflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device stayed silent for a whole bounded read.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device did not confirm allocation of its page buffer.
    #[error("Device rejected flash_init: {reply:?}")]
    InitRejected {
        /// Status line the device sent instead of the confirmation.
        reply: String,
    },

    /// Too many consecutive device-busy replies for one page.
    #[error("Retry budget exhausted at page {page} after {timeouts} consecutive busy replies")]
    RetryBudgetExhausted {
        /// Page the session was stuck on.
        page: u32,
        /// Consecutive busy replies seen.
        timeouts: u32,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this is an unexpected failure of the link rather than a
    /// decision made by the device or the retry policy.
    pub fn is_transport_fault(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::Protocol(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::InitRejected { .. }
            | Self::RetryBudgetExhausted { .. }
            | Self::Config(_) => false,
        }
    }
}

/// Process exit status of a programming run.
///
/// The numeric values are shared with scripts driving the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    /// The run completed.
    Success = 0,
    /// The upload or verification aborted.
    UploadFailed = 1,
    /// No serial port was given.
    NoPortSelected = 2,
    /// The device refused to start a flash write.
    InitRejected = 3,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<&Error> for ExitStatus {
    fn from(err: &Error) -> Self {
        match err {
            Error::InitRejected { .. } => Self::InitRejected,
            _ => Self::UploadFailed,
        }
    }
}
