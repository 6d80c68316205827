//! Command/response engine.
//!
//! [`Engine`] owns the transport, the clock and the fixed line buffers. Every
//! exchange runs through a [`Session`], which borrows the engine for exactly
//! one transaction together with the [`UrcHandler`] that receives any line
//! read while a reply is awaited but not recognised as part of it.

pub mod parse;

use core::fmt::{self, Write as _};

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::error::{Error, Status};
use crate::event::{flags, Flags};
use crate::fmt::Bytes;
use crate::transport::{Clock, Transport};

pub use parse::{fields, parse_delimited, parse_field, Fields};

/// Capacity of the outbound command buffer, line terminator included.
pub const COMMAND_BUFFER_SIZE: usize = 256;
/// Capacity of the inbound line buffer.
pub const RESPONSE_BUFFER_SIZE: usize = 256;
/// Width of one scratch row for single and tabular replies.
pub const ROW_SIZE: usize = 128;

pub type Row = String<ROW_SIZE>;

flags! {
    /// What the engine is currently doing with the transport.
    pub enum Activity {
        Reading = 0,
        Writing = 1,
        CommandRunning = 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseMode {
    /// Succeed as soon as the prefixed line is read.
    OnlyData,
    /// After the prefixed line, keep reading until `OK` or an error.
    WaitOk,
}

/// Consumer of lines that arrive outside the reply being awaited.
pub trait UrcHandler {
    /// Returns `true` if some subsystem claimed `line`.
    ///
    /// `transport` is handed over so a notification that announces a raw
    /// payload (socket data) can drain it before line reading resumes.
    fn handle_urc(&mut self, line: &str, transport: &mut dyn Transport) -> bool;
}

impl UrcHandler for () {
    fn handle_urc(&mut self, line: &str, _: &mut dyn Transport) -> bool {
        trace!("dropped urc: {}", line);
        false
    }
}

pub struct Engine<T, C> {
    transport: T,
    clock: C,
    timeout: Duration,
    activity: Flags<Activity>,
    command: String<COMMAND_BUFFER_SIZE>,
    line: [u8; RESPONSE_BUFFER_SIZE],
}

impl<T: Transport, C: Clock> Engine<T, C> {
    pub fn new(transport: T, clock: C, timeout: Duration) -> Self {
        Self {
            transport,
            clock,
            timeout,
            activity: Flags::new(),
            command: String::new(),
            line: [0; RESPONSE_BUFFER_SIZE],
        }
    }

    pub fn now(&mut self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_command_running(&self) -> bool {
        self.activity.contains(Activity::CommandRunning)
    }

    pub fn activity(&self) -> Flags<Activity> {
        self.activity
    }

    pub fn session<'s, H: UrcHandler + ?Sized>(&'s mut self, handler: &'s mut H) -> Session<'s, T, C, H> {
        self.activity.insert(Activity::CommandRunning);
        Session {
            engine: self,
            handler,
        }
    }
}

enum Line {
    Terminal(Status),
    Other,
}

/// One transaction on the transport.
///
/// Creating a session marks a command as running; dropping it clears the
/// mark on every exit path.
pub struct Session<'s, T: Transport, C: Clock, H: UrcHandler + ?Sized> {
    engine: &'s mut Engine<T, C>,
    handler: &'s mut H,
}

impl<T: Transport, C: Clock, H: UrcHandler + ?Sized> Drop for Session<'_, T, C, H> {
    fn drop(&mut self) {
        self.engine.activity.clear();
    }
}

impl<'s, T: Transport, C: Clock, H: UrcHandler + ?Sized> Session<'s, T, C, H> {
    pub fn now(&mut self) -> Instant {
        self.engine.clock.now()
    }

    pub fn default_timeout(&self) -> Duration {
        self.engine.timeout
    }

    /// State shared with the URC router, for operations that update it.
    pub fn handler(&mut self) -> &mut H {
        &mut *self.handler
    }

    pub fn clock(&mut self) -> &mut C {
        &mut self.engine.clock
    }

    /// Format a command and send it terminated by `\r\n`.
    pub fn send_command(&mut self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        self.send_command_with(args, "\r\n")
    }

    /// Format a command and send it with a custom terminator.
    pub fn send_command_with(&mut self, args: fmt::Arguments<'_>, terminator: &str) -> Result<(), Error> {
        let command = &mut self.engine.command;
        command.clear();
        command.write_fmt(args)?;
        trace!("--> {}", command.as_str());
        command.push_str(terminator).map_err(|_| Error::Overflow)?;

        let Engine {
            transport,
            command,
            activity,
            ..
        } = &mut *self.engine;
        write_all(transport, activity, command.as_bytes())
    }

    /// Write raw payload bytes.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), Error> {
        trace!("--> {:?}", Bytes(data));
        let Engine {
            transport, activity, ..
        } = &mut *self.engine;
        write_all(transport, activity, data)
    }

    /// Wait for the raw framing `token` (`>`, `CONNECT`, ...).
    ///
    /// Bytes that do not form the token are pushed back and consumed as one
    /// line, which is routed like any unsolicited line.
    pub fn wait_for_token(&mut self, token: &str, timeout: Duration) -> Status {
        let token = token.as_bytes();
        let deadline = self.deadline(timeout);
        let mut probe = [0u8; 16];
        let want = token.len().min(probe.len());

        loop {
            let Some(remaining) = self.remaining(deadline) else {
                return Status::Timeout;
            };

            let mut got = 0;
            while got < want {
                let Some(remaining) = self.remaining(deadline) else {
                    break;
                };
                let n = self.engine.transport.read(&mut probe[got..want], remaining);
                if n == 0 {
                    break;
                }
                got += n;
            }

            if got == want && probe[..want] == token[..want] {
                return Status::Ok;
            }
            if got == 0 {
                continue;
            }

            self.engine.transport.unread(got);
            if let Some(Line::Terminal(status)) = self.next_line(remaining, None, false) {
                return status;
            }
        }
    }

    /// Wait for a line starting with `prefix` and copy the rest of it, trimmed,
    /// into `rest`. For framing lines such as `CONNECT <len>` that carry no
    /// `": "` separator.
    pub fn wait_for_line<const N: usize>(&mut self, prefix: &str, rest: &mut String<N>, timeout: Duration) -> Status {
        let deadline = self.deadline(timeout);
        let mut matched = false;
        rest.clear();

        self.engine.activity.insert(Activity::Reading);
        let status = loop {
            let Some(remaining) = self.remaining(deadline) else {
                break Status::Timeout;
            };

            let step = self.next_line(remaining, Some(&mut |line: &str| {
                let Some(tail) = line.strip_prefix(prefix) else {
                    return false;
                };
                matched = true;
                push_truncated(rest, tail.trim());
                true
            }), false);

            match step {
                Some(Line::Terminal(status)) => break status,
                _ if matched => break Status::Ok,
                _ => {}
            }
        };
        self.engine.activity.remove(Activity::Reading);
        status
    }

    /// Send nothing, wait for `OK` / `ERROR`.
    pub fn expect_ok(&mut self, timeout: Duration) -> Status {
        let mut sink = String::<0>::new();
        self.get_response(None, &mut sink, ResponseMode::WaitOk, timeout)
    }

    /// Wait for the reply line starting with `prefix` and copy what follows
    /// its `": "` into `payload`.
    ///
    /// A payload longer than `payload`'s capacity is cut silently. With
    /// [`ResponseMode::WaitOk`] the call only returns once a terminal line
    /// arrives; a `None` prefix waits for the terminal line alone.
    pub fn get_response<const N: usize>(
        &mut self,
        prefix: Option<&str>,
        payload: &mut String<N>,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Status {
        let deadline = self.deadline(timeout);
        let mut matched = false;
        payload.clear();

        self.engine.activity.insert(Activity::Reading);
        let status = loop {
            let Some(remaining) = self.remaining(deadline) else {
                break Status::Timeout;
            };

            let step = self.next_line(remaining, Some(&mut |line: &str| {
                let Some(prefix) = prefix else {
                    return false;
                };
                if !line.starts_with(prefix) {
                    return false;
                }
                if !matched {
                    matched = true;
                    copy_payload(line, payload);
                }
                true
            }), mode == ResponseMode::WaitOk);

            match step {
                Some(Line::Terminal(status)) => break status,
                _ if matched && mode == ResponseMode::OnlyData => break Status::Ok,
                _ => {}
            }
        };
        self.engine.activity.remove(Activity::Reading);
        status
    }

    /// Like [`get_response`](Self::get_response), collecting every prefixed
    /// line as one row. Rows beyond `R` are dropped.
    pub fn get_multiple_response<const W: usize, const R: usize>(
        &mut self,
        prefix: &str,
        rows: &mut Vec<String<W>, R>,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Status {
        let deadline = self.deadline(timeout);
        rows.clear();

        self.engine.activity.insert(Activity::Reading);
        let status = loop {
            let Some(remaining) = self.remaining(deadline) else {
                break Status::Timeout;
            };

            let step = self.next_line(remaining, Some(&mut |line: &str| {
                if !line.starts_with(prefix) {
                    return false;
                }
                let mut row = String::new();
                copy_payload(line, &mut row);
                // Table longer than the caller expected; keep the head.
                rows.push(row).ok();
                true
            }), mode == ResponseMode::WaitOk);

            match step {
                Some(Line::Terminal(status)) => break status,
                _ if mode == ResponseMode::OnlyData && rows.is_full() => break Status::Ok,
                _ => {}
            }
        };
        self.engine.activity.remove(Activity::Reading);
        status
    }

    /// Read up to `buf.len()` raw bytes, stopping early at the deadline.
    pub fn read_data(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = self.deadline(timeout);
        let mut got = 0;
        self.engine.activity.insert(Activity::Reading);
        while got < buf.len() {
            let Some(remaining) = self.remaining(deadline) else {
                break;
            };
            got += self.engine.transport.read(&mut buf[got..], remaining);
        }
        self.engine.activity.remove(Activity::Reading);
        got
    }

    /// Read one raw line, bypassing reply matching.
    pub fn read_line<const N: usize>(&mut self, out: &mut String<N>, timeout: Duration) -> bool {
        let Engine {
            transport, line, ..
        } = &mut *self.engine;
        let n = transport.read_line(line, timeout);
        out.clear();
        match core::str::from_utf8(&line[..n]) {
            Ok(s) if n > 0 => {
                push_truncated(out, s);
                true
            }
            _ => false,
        }
    }

    /// Route every line already waiting on the transport.
    ///
    /// Blank lines read as "nothing", so the loop is bounded by availability
    /// alone; `read_line` always consumes what it reports.
    pub fn poll_urcs(&mut self) {
        while self.engine.transport.is_available() {
            let timeout = self.engine.timeout;
            self.next_line(timeout, None, false);
        }
    }

    fn deadline(&mut self, timeout: Duration) -> Instant {
        let timeout = if timeout.as_ticks() == 0 {
            self.engine.timeout
        } else {
            timeout
        };
        self.engine.clock.now() + timeout
    }

    fn remaining(&mut self, deadline: Instant) -> Option<Duration> {
        let now = self.engine.clock.now();
        deadline
            .checked_duration_since(now)
            .filter(|d| d.as_ticks() > 0)
    }

    /// Read and classify one line. `reply` gets the first look at it and
    /// returns `true` if the line belongs to the pending reply. `OK` only
    /// terminates when `accept_ok` is set.
    ///
    /// Returns `None` when nothing was read.
    fn next_line(
        &mut self,
        timeout: Duration,
        reply: Option<&mut dyn FnMut(&str) -> bool>,
        accept_ok: bool,
    ) -> Option<Line> {
        let Engine {
            transport, line, ..
        } = &mut *self.engine;

        let n = transport.read_line(line, timeout);
        if n == 0 {
            return None;
        }
        let Ok(text) = core::str::from_utf8(&line[..n]) else {
            warn!("dropped non-text line ({} bytes)", n);
            return Some(Line::Other);
        };

        if let Some(reply) = reply {
            if reply(text) {
                return Some(Line::Other);
            }
        }
        if accept_ok && text.starts_with("OK") {
            return Some(Line::Terminal(Status::Ok));
        }
        if let Some(reason) = text.strip_prefix("+CME ERROR") {
            error!("[Error]{}", reason);
            return Some(Line::Terminal(Status::Error));
        }
        if text.starts_with("ERROR") {
            return Some(Line::Terminal(Status::Error));
        }

        trace!("<-- {}", text);
        self.handler.handle_urc(text, transport);
        Some(Line::Other)
    }
}

fn write_all<T: Transport>(transport: &mut T, activity: &mut Flags<Activity>, data: &[u8]) -> Result<(), Error> {
    activity.insert(Activity::Writing);
    let mut sent = 0;
    let result = loop {
        if sent == data.len() {
            break Ok(());
        }
        match transport.write(&data[sent..]) {
            0 => break Err(Error::Transport),
            n => sent += n,
        }
    };
    activity.remove(Activity::Writing);
    result
}

fn copy_payload<const N: usize>(line: &str, out: &mut String<N>) {
    out.clear();
    if let Some(at) = line.find(": ") {
        push_truncated(out, &line[at + 2..]);
    }
}

fn push_truncated<const N: usize>(out: &mut String<N>, s: &str) {
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
}
