//! Port abstraction for the serial console of the MMC.
//!
//! The programming session only talks to a [`Port`], so the protocol layer is
//! independent of the serial backend and can be driven by a simulated device
//! in tests.
//!
//! ```text
//! +--------------------+
//! | Programmer / step  |   command codec, page source
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |   Port Trait       |   write, read_line, read_bytes, discard_input
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! | NativePort         |
//! |  (serialport)      |
//! +--------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmcflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> mmcflash::Result<()> {
//!     port.discard_input()?;
//!     port.write_all_bytes(b"flash_read_id 0\r")?;
//!     let echo = port.read_line()?;
//!     let reply = port.read_line()?;
//!     println!("{:?} {:?}", echo, reply);
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Byte terminating every line the device sends.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Default baud rate of the MMC debug UART.
pub const DEFAULT_BAUD: u32 = 921_600;

/// Default bounded read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// Human readable description, if the backend provides one.
    pub description: Option<String>,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
}

/// Byte stream to the MMC console.
///
/// Reads follow the semantics of a serial line with a timeout: a read that
/// runs out of time returns what arrived so far instead of failing. A timeout
/// of `None` waits until the expected data arrives.
pub trait Port: Read + Write + Send {
    /// Set the read timeout. `None` disables it.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Option<Duration>;

    /// Drop any input received but not yet read.
    fn discard_input(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read up to and including the next [`LINE_TERMINATOR`].
    ///
    /// Returns a shorter (possibly empty) buffer without terminator when the
    /// timeout expires first.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let deadline = self
            .timeout()
            .map(|t| Instant::now() + t);
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match self.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == LINE_TERMINATOR {
                        break;
                    }
                },
                // A poll expired; the deadline check above decides.
                Err(e) if e.kind() == ErrorKind::TimedOut => {},
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }

        Ok(line)
    }

    /// Read exactly `count` bytes, or fewer if the timeout expires first.
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let deadline = self
            .timeout()
            .map(|t| Instant::now() + t);
        let mut buf = vec![0u8; count];
        let mut filled = 0;

        while filled < count {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {},
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPort;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn test_serial_config_builder() {
        let config =
            SerialConfig::new("/dev/ttyUSB0", 115_200).with_timeout(Duration::from_secs(5));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_read_line_stops_at_terminator() {
        let mut port = ScriptedPort::new(b"flash_final 2\r\nFinalising flash\r\n");
        assert_eq!(port.read_line().unwrap(), b"flash_final 2\r\n");
        assert_eq!(port.read_line().unwrap(), b"Finalising flash\r\n");
    }

    #[test]
    fn test_read_line_returns_partial_on_timeout() {
        let mut port = ScriptedPort::new(b"no newline");
        assert_eq!(port.read_line().unwrap(), b"no newline");
        assert!(port.read_line().unwrap().is_empty());
    }

    #[test]
    fn test_read_bytes_short_read() {
        let mut port = ScriptedPort::new(&[1, 2, 3]);
        assert_eq!(port.read_bytes(2).unwrap(), vec![1, 2]);
        assert_eq!(port.read_bytes(4).unwrap(), vec![3]);
    }

    #[test]
    fn test_expired_polls_keep_waiting_until_deadline() {
        let mut port = ScriptedPort::new(b"Initialising flash write\r\n").stalled_for(3);
        assert_eq!(port.read_line().unwrap(), b"Initialising flash write\r\n");

        let mut port = ScriptedPort::new(&[0xAA; 4]).stalled_for(2);
        assert_eq!(port.read_bytes(4).unwrap(), vec![0xAA; 4]);
    }

    #[test]
    fn test_bounded_read_stops_at_deadline() {
        let mut port = ScriptedPort::new(b"");
        port.set_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let start = Instant::now();
        assert!(port.read_line().unwrap().is_empty());
        assert!(port.read_bytes(8).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
