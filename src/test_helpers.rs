//! Scripted transport, manual clock and recording listener for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::sync::Once;
use std::vec::Vec;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;

#[cfg(feature = "ntp")]
use crate::datetime::Datetime;
use crate::listener::Listener;
#[cfg(feature = "socket")]
use crate::{ring_buffer::RingBuffer, socket::SocketHandle};
use crate::transport::{Clock, Transport};

static INIT: Once = Once::new();

pub fn setup_test_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
            .is_test(true)
            .init();
    });
}

/// Manually advanced clock, in microseconds. Delays advance it.
#[derive(Clone, Default)]
pub struct MockClock {
    micros: Rc<Cell<u64>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.micros.set(self.micros.get() + by.as_micros());
    }

    pub fn instant(&self) -> Instant {
        Instant::from_micros(self.micros.get())
    }
}

impl Clock for MockClock {
    fn now(&mut self) -> Instant {
        self.instant()
    }
}

impl DelayNs for MockClock {
    fn delay_ns(&mut self, ns: u32) {
        self.micros.set(self.micros.get() + u64::from(ns).div_ceil(1000));
    }
}

#[derive(Default)]
struct Wire {
    inbound: Vec<u8>,
    pos: usize,
    responders: VecDeque<(String, String)>,
    written: Vec<Vec<u8>>,
    refuse_writes: bool,
}

/// Transport fed from a script.
///
/// Reads with nothing buffered advance the shared clock by their timeout, so
/// a missing reply turns into a timeout without real waiting. Writes are
/// logged and may trigger a one-shot reply registered with [`on`](Self::on).
#[derive(Clone)]
pub struct MockTransport {
    wire: Rc<RefCell<Wire>>,
    clock: MockClock,
}

impl MockTransport {
    pub fn new(clock: &MockClock) -> Self {
        Self {
            wire: Rc::default(),
            clock: clock.clone(),
        }
    }

    /// Make `data` readable immediately.
    pub fn push(&self, data: &str) {
        self.push_bytes(data.as_bytes());
    }

    pub fn push_bytes(&self, data: &[u8]) {
        self.wire.borrow_mut().inbound.extend_from_slice(data);
    }

    /// When a write starting with `command` happens, make `reply` readable.
    /// Each registration answers once; registrations for the same command
    /// answer in order.
    pub fn on(&self, command: &str, reply: &str) {
        self.wire
            .borrow_mut()
            .responders
            .push_back((command.into(), reply.into()));
    }

    pub fn refuse_writes(&self, refuse: bool) {
        self.wire.borrow_mut().refuse_writes = refuse;
    }

    /// Every write so far, lossily decoded.
    pub fn written(&self) -> Vec<String> {
        self.wire
            .borrow()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// How many writes started with `prefix`.
    pub fn sent(&self, prefix: &str) -> usize {
        self.written().iter().filter(|w| w.starts_with(prefix)).count()
    }

    pub fn clear_written(&self) {
        self.wire.borrow_mut().written.clear();
    }

    /// Responders not triggered yet.
    pub fn pending_replies(&self) -> usize {
        self.wire.borrow().responders.len()
    }

    pub fn unread_len(&self) -> usize {
        let wire = self.wire.borrow();
        wire.inbound.len() - wire.pos
    }
}

impl Transport for MockTransport {
    fn is_available(&mut self) -> bool {
        self.unread_len() > 0
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        let mut wire = self.wire.borrow_mut();
        let n = buf.len().min(wire.inbound.len() - wire.pos);
        if n == 0 {
            self.clock.advance(timeout);
            return 0;
        }
        let start = wire.pos;
        buf[..n].copy_from_slice(&wire.inbound[start..start + n]);
        wire.pos += n;
        n
    }

    fn read_line(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        let mut wire = self.wire.borrow_mut();
        let rest = &wire.inbound[wire.pos..];
        if rest.is_empty() {
            self.clock.advance(timeout);
            return 0;
        }
        let (line, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let n = line.len().min(buf.len());
        buf[..n].copy_from_slice(&line[..n]);
        wire.pos += consumed;
        n
    }

    fn unread(&mut self, len: usize) {
        let mut wire = self.wire.borrow_mut();
        wire.pos -= len.min(wire.pos);
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut wire = self.wire.borrow_mut();
        if wire.refuse_writes {
            return 0;
        }
        wire.written.push(data.to_vec());

        let text = String::from_utf8_lossy(data);
        let text = text.trim_end_matches(['\r', '\n']);
        if let Some(i) = wire
            .responders
            .iter()
            .position(|(command, _)| text.starts_with(command.as_str()))
        {
            if let Some((_, reply)) = wire.responders.remove(i) {
                wire.inbound.extend_from_slice(reply.as_bytes());
            }
        }
        data.len()
    }
}

/// Counts every listener callback.
#[derive(Default, Debug)]
pub struct RecordingListener {
    pub started: usize,
    pub registered: Vec<bool>,
    pub net_opened: usize,
    pub net_open_errors: usize,
    pub net_closed: usize,
    #[cfg(feature = "ntp")]
    pub synced: Vec<Datetime>,
    #[cfg(feature = "socket")]
    pub connecting: Vec<SocketHandle>,
    #[cfg(feature = "socket")]
    pub connected: Vec<SocketHandle>,
    #[cfg(feature = "socket")]
    pub connect_errors: Vec<SocketHandle>,
    #[cfg(feature = "socket")]
    pub closed: Vec<SocketHandle>,
    #[cfg(feature = "socket")]
    pub received: Vec<(SocketHandle, Vec<u8>)>,
    #[cfg(feature = "gps")]
    pub nmea: Vec<String>,
}

impl Listener for RecordingListener {
    fn started(&mut self) {
        self.started += 1;
    }

    fn registered(&mut self, roaming: bool) {
        self.registered.push(roaming);
    }

    #[cfg(feature = "net")]
    fn net_opened(&mut self) {
        self.net_opened += 1;
    }

    #[cfg(feature = "net")]
    fn net_open_error(&mut self) {
        self.net_open_errors += 1;
    }

    #[cfg(feature = "net")]
    fn net_closed(&mut self) {
        self.net_closed += 1;
    }

    #[cfg(feature = "ntp")]
    fn ntp_synced(&mut self, datetime: Datetime) {
        self.synced.push(datetime);
    }

    #[cfg(feature = "socket")]
    fn socket_connecting(&mut self, handle: SocketHandle) {
        self.connecting.push(handle);
    }

    #[cfg(feature = "socket")]
    fn socket_connected(&mut self, handle: SocketHandle) {
        self.connected.push(handle);
    }

    #[cfg(feature = "socket")]
    fn socket_connect_error(&mut self, handle: SocketHandle) {
        self.connect_errors.push(handle);
    }

    #[cfg(feature = "socket")]
    fn socket_closed(&mut self, handle: SocketHandle) {
        self.closed.push(handle);
    }

    #[cfg(feature = "socket")]
    fn socket_received(&mut self, handle: SocketHandle, buffer: &mut RingBuffer<'_>) {
        let mut data = std::vec![0u8; buffer.len()];
        let n = buffer.dequeue_slice(&mut data);
        data.truncate(n);
        self.received.push((handle, data));
    }

    #[cfg(feature = "gps")]
    fn gps_nmea(&mut self, sentence: &str) {
        self.nmea.push(sentence.into());
    }
}
