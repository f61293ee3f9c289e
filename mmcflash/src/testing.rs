//! Test doubles for [`Port`].

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::image::PAGE_SIZE;
use crate::port::Port;

const TEST_TIMEOUT: Duration = Duration::from_millis(50);

/// Port replaying a fixed byte script and recording everything written.
pub(crate) struct ScriptedPort {
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
    timeout: Option<Duration>,
    stalls: usize,
}

impl ScriptedPort {
    pub(crate) fn new(response: &[u8]) -> Self {
        Self {
            read_buf: response
                .iter()
                .copied()
                .collect(),
            write_buf: Vec::new(),
            timeout: Some(TEST_TIMEOUT),
            stalls: 0,
        }
    }

    /// Let the first `count` reads expire as driver polls do.
    pub(crate) fn stalled_for(mut self, count: usize) -> Self {
        self.stalls = count;
        self
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.write_buf
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stalls > 0 {
            self.stalls -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "poll expired"));
        }
        pop_into(&mut self.read_buf, buf)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_buf
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn discard_input(&mut self) -> Result<()> {
        self.read_buf
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn pop_into(queue: &mut VecDeque<u8>, buf: &mut [u8]) -> io::Result<usize> {
    if queue.is_empty() {
        thread::sleep(Duration::from_millis(1));
        return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
    }
    let n = buf.len().min(queue.len());
    for b in buf.iter_mut().take(n) {
        *b = queue.pop_front().unwrap();
    }
    Ok(n)
}

const BUSY_STATUS: &str = "timeout while waiting for flash. Flash status: 0x03";

/// In-memory model of the MMC flash console.
///
/// Echoes commands, stages uploaded pages into slots the way the firmware
/// does and serves read-backs from its flash array. Faults are injected per
/// upload attempt, counted from 0 across the whole run.
pub(crate) struct SimulatedDevice {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    page_in: Option<(bool, Vec<u8>)>,
    flash: Vec<[u8; PAGE_SIZE]>,
    next_slot: usize,
    commands: Vec<String>,
    timeout: Option<Duration>,
    saw_unbounded: bool,
    uploads: usize,
    init_reply: String,
    busy_replies: u32,
    echo_faults: HashSet<usize>,
    storage_faults: HashSet<usize>,
    mute_after: Option<usize>,
}

impl SimulatedDevice {
    pub(crate) fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            line: Vec::new(),
            page_in: None,
            flash: Vec::new(),
            next_slot: 0,
            commands: Vec::new(),
            timeout: Some(TEST_TIMEOUT),
            saw_unbounded: false,
            uploads: 0,
            init_reply: "Initialising flash write".into(),
            busy_replies: 0,
            echo_faults: HashSet::new(),
            storage_faults: HashSet::new(),
            mute_after: None,
        }
    }

    /// Status line sent after the `flash_init` echo.
    pub(crate) fn init_reply(mut self, reply: &str) -> Self {
        self.init_reply = reply.into();
        self
    }

    /// Answer the next `count` uploads with a busy status.
    pub(crate) fn busy_for(mut self, count: u32) -> Self {
        self.busy_replies = count;
        self
    }

    /// Corrupt the echo of the given upload attempts.
    pub(crate) fn corrupt_echo_on(mut self, attempts: &[usize]) -> Self {
        self.echo_faults
            .extend(attempts);
        self
    }

    /// Commit corrupted data for the given upload attempts.
    pub(crate) fn corrupt_storage_on(mut self, attempts: &[usize]) -> Self {
        self.storage_faults
            .extend(attempts);
        self
    }

    /// Stop answering after `count` commands.
    pub(crate) fn muted_after(mut self, count: usize) -> Self {
        self.mute_after = Some(count);
        self
    }

    /// Preload flash with `data`, padded with 0xFF.
    pub(crate) fn with_flash(mut self, data: &[u8]) -> Self {
        self.flash = data
            .chunks(PAGE_SIZE)
            .map(|chunk| {
                let mut page = [0xFF; PAGE_SIZE];
                page[..chunk.len()].copy_from_slice(chunk);
                page
            })
            .collect();
        self
    }

    /// Flip a bit in a committed page.
    pub(crate) fn damage_page(&mut self, index: usize) {
        self.flash[index][0] ^= 0x01;
    }

    /// Command lines received, without terminator.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands
            .clone()
    }

    /// Number of commands named `name`.
    pub(crate) fn count(&self, name: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .count()
    }

    /// Flash array as one byte vector.
    pub(crate) fn flash_contents(&self) -> Vec<u8> {
        self.flash
            .concat()
    }

    /// Whether the timeout was ever disabled.
    pub(crate) fn saw_unbounded_timeout(&self) -> bool {
        self.saw_unbounded
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.rx
            .extend(bytes);
    }

    fn reply_line(&mut self, text: &str) {
        self.reply(format!("{text}\r\n").as_bytes());
    }

    fn handle_command(&mut self, line: &str) {
        self.commands
            .push(line.to_string());
        if self
            .mute_after
            .is_some_and(|n| self.commands.len() > n)
        {
            return;
        }
        self.reply_line(line);

        let mut parts = line.split(' ');
        let name = parts
            .next()
            .unwrap_or_default();
        let args: Vec<usize> = parts
            .clone()
            .filter_map(|a| a.parse().ok())
            .collect();
        match name {
            "flash_init" => {
                self.flash = vec![[0xFF; PAGE_SIZE]; args[1]];
                self.next_slot = 0;
                let reply = self.init_reply.clone();
                self.reply_line(&reply);
            },
            "flash_upload" => {
                let repeat = parts
                    .next()
                    .is_some_and(|a| a.starts_with('r'));
                self.page_in = Some((repeat, Vec::with_capacity(PAGE_SIZE)));
            },
            "flash_read" => {
                let page = self
                    .flash
                    .get(args[1])
                    .copied()
                    .unwrap_or([0xFF; PAGE_SIZE]);
                self.reply(&page);
                self.reply_line("");
            },
            "flash_final" => self.reply_line("Finalising flash"),
            "flash_activate_firmware" => self.reply_line(""),
            _ => self.reply_line("Command not recognised."),
        }
    }

    fn handle_page(&mut self, repeat: bool, data: &[u8]) {
        let attempt = self.uploads;
        self.uploads += 1;

        let mut echo = data.to_vec();
        if self
            .echo_faults
            .contains(&attempt)
        {
            echo[0] ^= 0xFF;
        }
        self.reply(&echo);

        if self.busy_replies > 0 {
            self.busy_replies -= 1;
            self.reply_line(BUSY_STATUS);
            return;
        }
        self.reply_line("");

        let slot = if repeat && self.next_slot > 0 {
            self.next_slot - 1
        } else {
            self.next_slot += 1;
            self.next_slot - 1
        };
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(data);
        if self
            .storage_faults
            .contains(&attempt)
        {
            page[0] ^= 0xFF;
        }
        if let Some(target) = self
            .flash
            .get_mut(slot)
        {
            *target = page;
        }
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        pop_into(&mut self.rx, buf)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if let Some((repeat, mut page)) = self
                .page_in
                .take()
            {
                page.push(byte);
                if page.len() == PAGE_SIZE {
                    self.handle_page(repeat, &page);
                } else {
                    self.page_in = Some((repeat, page));
                }
                continue;
            }

            if byte == b'\r' {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line
                    .clear();
                self.handle_command(&line);
            } else {
                self.line
                    .push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedDevice {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if timeout.is_none() {
            self.saw_unbounded = true;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn discard_input(&mut self) -> Result<()> {
        self.rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
