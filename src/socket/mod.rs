//! TCP/UDP sockets multiplexed over the one PDP context.
//!
//! Sockets live in a [`SocketSet`] indexed by the modem's link number. Their
//! state moves on two paths: direct calls (open, close, send) and the
//! `+QIOPEN` / `+QIURC` notifications routed from any transaction. The latter
//! only raise per-socket events, which the pump turns into listener calls,
//! table cleanup and reconnects.

mod set;

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;
use heapless::{String, Vec};

use crate::engine::{parse_delimited, parse_field, ResponseMode};
use crate::error::{Error, SocketError};
use crate::event::{flags, Flags};
use crate::listener::Listener;
use crate::modem::{Modem, Shared, Tx};
use crate::module_timing;
use crate::net::NetStatus;
use crate::ring_buffer::RingBuffer;
use crate::timer::Timer;
use crate::transport::{Clock, Transport};

pub use self::set::{Handle as SocketHandle, Set as SocketSet};

/// Sockets the driver tracks at once.
pub const NUM_OF_SOCKET: usize = 4;
/// Link numbers the modem supports.
pub const MAX_NUM_OF_SOCKET: usize = 12;

const _: () = core::assert!(NUM_OF_SOCKET <= MAX_NUM_OF_SOCKET);

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketKind {
    Tcp,
    Udp,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketState {
    #[default]
    Closed,
    Opening,
    Open,
}

flags! {
    pub(crate) enum SocketEvent {
        Opened = 0,
        OpeningError = 1,
        Received = 2,
        Closed = 3,
        ClosedByPeer = 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketConfig {
    /// Wait for `AT+QICLOSE`.
    pub timeout: Duration,
    /// Keep the socket registered and reopen it after it closes.
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SOCKET_TIMEOUT,
            auto_reconnect: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl SocketConfig {
    /// Replace zero durations with the defaults.
    fn normalized(self) -> Self {
        let or = |d: Duration, default| if d.as_ticks() == 0 { default } else { d };
        Self {
            timeout: or(self.timeout, DEFAULT_SOCKET_TIMEOUT),
            reconnect_delay: or(self.reconnect_delay, DEFAULT_RECONNECT_DELAY),
            ..self
        }
    }
}

/// One logical connection and its receive storage.
#[derive(Debug)]
pub struct Socket<'a> {
    host: &'a str,
    port: u16,
    kind: SocketKind,
    config: SocketConfig,
    pub(crate) state: SocketState,
    pub(crate) events: Flags<SocketEvent>,
    pub(crate) reconnect: Timer,
    link: Option<u8>,
    pub(crate) buffer: RingBuffer<'a>,
}

impl<'a> Socket<'a> {
    pub fn new(kind: SocketKind, host: &'a str, port: u16, buffer: RingBuffer<'a>) -> Self {
        let config = SocketConfig::default();
        Self {
            host,
            port,
            kind,
            config,
            state: SocketState::Closed,
            events: Flags::new(),
            reconnect: Timer::new(config.reconnect_delay),
            link: None,
            buffer,
        }
    }

    pub fn tcp(host: &'a str, port: u16, buffer: RingBuffer<'a>) -> Self {
        Self::new(SocketKind::Tcp, host, port, buffer)
    }

    pub fn udp(host: &'a str, port: u16, buffer: RingBuffer<'a>) -> Self {
        Self::new(SocketKind::Udp, host, port, buffer)
    }

    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config.normalized();
        self.reconnect = Timer::new(self.config.reconnect_delay);
        self
    }

    /// Ask for a specific link number. Ignored if it is taken.
    pub fn with_link(mut self, link: u8) -> Self {
        self.link = Some(link);
        self
    }

    pub fn host(&self) -> &'a str {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn link(&self) -> Option<u8> {
        self.link
    }

    pub fn buffer(&mut self) -> &mut RingBuffer<'a> {
        &mut self.buffer
    }

    /// Give the receive storage back.
    pub fn into_buffer(self) -> RingBuffer<'a> {
        self.buffer
    }
}

/// `AT+QICFG` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketOption {
    TransPacketSize(u16),
    /// Transparent mode wait time, in 100 ms units.
    TransWaitTime(u16),
    /// Hex encoding for sent and received data.
    DataFormat { send_hex: bool, recv_hex: bool },
    ViewMode(u8),
    TcpRetransmission { max_backoffs: u16, max_rto: u16 },
    DnsCache(bool),
    SendTimeout(u16),
    PassiveClosed(bool),
    UdpReadMode(u8),
    UdpSendMode(u8),
    TcpAccept(bool),
    TcpKeepAlive(bool),
    RecvBufferSize(u16),
    RecvIndication(u8),
}

impl fmt::Display for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TransPacketSize(v) => write!(f, "\"transpktsize\",{}", v),
            Self::TransWaitTime(v) => write!(f, "\"transwaittm\",{}", v),
            Self::DataFormat { send_hex, recv_hex } => {
                write!(f, "\"dataformat\",{},{}", u8::from(send_hex), u8::from(recv_hex))
            }
            Self::ViewMode(v) => write!(f, "\"viewmode\",{}", v),
            Self::TcpRetransmission { max_backoffs, max_rto } => {
                write!(f, "\"tcp/retranscfg\",{},{}", max_backoffs, max_rto)
            }
            Self::DnsCache(on) => write!(f, "\"dns/cache\",{}", u8::from(on)),
            Self::SendTimeout(v) => write!(f, "\"qisend/timeout\",{}", v),
            Self::PassiveClosed(on) => write!(f, "\"passiveclosed\",{}", u8::from(on)),
            Self::UdpReadMode(v) => write!(f, "\"udp/readmode\",{}", v),
            Self::UdpSendMode(v) => write!(f, "\"udp/sendmode\",{}", v),
            Self::TcpAccept(on) => write!(f, "\"tcp/accept\",{}", u8::from(on)),
            Self::TcpKeepAlive(on) => write!(f, "\"tcp/keepalive\",{}", u8::from(on)),
            Self::RecvBufferSize(v) => write!(f, "\"recv/buffersize\",{}", v),
            Self::RecvIndication(v) => write!(f, "\"recvind\",{}", v),
        }
    }
}

/// Applied in order each time the PDP context comes up.
const DEFAULT_OPTIONS: [SocketOption; 14] = [
    SocketOption::TransPacketSize(1024),
    SocketOption::TransWaitTime(2),
    SocketOption::DataFormat {
        send_hex: false,
        recv_hex: false,
    },
    SocketOption::ViewMode(0),
    SocketOption::TcpRetransmission {
        max_backoffs: 12,
        max_rto: 600,
    },
    SocketOption::DnsCache(true),
    SocketOption::SendTimeout(0),
    SocketOption::PassiveClosed(false),
    SocketOption::UdpReadMode(0),
    SocketOption::UdpSendMode(0),
    SocketOption::TcpAccept(true),
    SocketOption::TcpKeepAlive(false),
    SocketOption::RecvBufferSize(10240),
    SocketOption::RecvIndication(0),
];

impl<L: Listener> Shared<'_, L> {
    pub(crate) fn route_socket(&mut self, line: &str, transport: &mut dyn Transport) -> bool {
        if let Some(payload) = line.strip_prefix("+QIURC: ") {
            return match parse_delimited(payload, 0, ',') {
                Some("recv") => {
                    self.receive(payload, transport);
                    true
                }
                Some("closed") => {
                    if let Ok(link) = parse_field::<u8>(payload, 1) {
                        if let Some((_, socket)) = self.sockets.by_link_mut(link) {
                            socket.events.insert(SocketEvent::ClosedByPeer);
                            socket.events.insert(SocketEvent::Closed);
                            socket.state = SocketState::Closed;
                        }
                    }
                    true
                }
                _ => false,
            };
        }

        let Some(payload) = line.strip_prefix("+QIOPEN: ") else {
            return false;
        };
        let (Ok(link), Ok(err)) = (parse_field::<u8>(payload, 0), parse_field::<u16>(payload, 1)) else {
            return false;
        };
        if let Some((_, socket)) = self.sockets.by_link_mut(link) {
            if err == 0 {
                socket.events.insert(SocketEvent::Opened);
                socket.state = SocketState::Open;
            } else {
                debug!("[SOCK] link {} open error {}", link, err);
                socket.events.insert(SocketEvent::OpeningError);
                socket.state = SocketState::Closed;
            }
        }
        true
    }

    /// `+QIURC: "recv",<link>,<len>` is followed by exactly `len` raw bytes,
    /// which must leave the transport before line reading resumes.
    fn receive(&mut self, payload: &str, transport: &mut dyn Transport) {
        let (Ok(link), Ok(len)) = (parse_field::<u8>(payload, 1), parse_field::<usize>(payload, 2)) else {
            warn!("[SOCK] unreadable recv notification: {}", payload);
            return;
        };
        let timeout = module_timing::receive_payload();
        let mut remaining = len;

        let Shared {
            sockets, listener, ..
        } = self;
        if let Some((handle, socket)) = sockets.by_link_mut(link) {
            while remaining > 0 {
                let want = remaining.min(socket.buffer.window());
                if want == 0 {
                    break;
                }
                let n = transport.forward(&mut socket.buffer, want, timeout);
                if n == 0 {
                    break;
                }
                remaining -= n;
                listener.socket_received(handle, &mut socket.buffer);
            }
            socket.events.insert(SocketEvent::Received);
        }

        if remaining > 0 {
            warn!("[SOCK] link {}: dropped {} of {} bytes", link, remaining, len);
            discard(transport, remaining, timeout);
        }
    }
}

fn discard(transport: &mut dyn Transport, mut len: usize, timeout: Duration) {
    let mut scratch = [0u8; 64];
    while len > 0 {
        let want = len.min(scratch.len());
        let n = transport.read(&mut scratch[..want], timeout);
        if n == 0 {
            break;
        }
        len -= n;
    }
}

impl<'a, T: Transport, C: Clock, L: Listener> Tx<'_, 'a, T, C, L> {
    /// Register `socket` and issue its first open.
    ///
    /// A socket with `auto_reconnect` stays registered when that first open
    /// fails and is retried by the pump. Any other failure queues it for
    /// reclaim.
    pub(crate) fn open_socket(&mut self, socket: Socket<'a>) -> Result<SocketHandle, Error> {
        let sockets = &mut self.handler().sockets;
        if socket.buffer.capacity() == 0 {
            sockets.push_reclaim(socket);
            return Err(SocketError::NoBuffer.into());
        }
        let auto = socket.config.auto_reconnect;
        let handle = match sockets.insert(socket) {
            Ok(handle) => handle,
            Err((e, socket)) => {
                sockets.push_reclaim(socket);
                return Err(e.into());
            }
        };

        match self.open_link(handle) {
            Ok(()) => Ok(handle),
            Err(e) if auto => {
                debug!("[SOCK] link {} open deferred: {:?}", handle.link, e);
                self.arm_reconnect(handle);
                Ok(handle)
            }
            Err(e) => {
                self.release_socket(handle);
                Err(e)
            }
        }
    }

    /// Close if needed and take the socket out of the table for good.
    pub(crate) fn remove_socket(&mut self, handle: SocketHandle) -> Result<Socket<'a>, Error> {
        if self.handler().sockets.get(handle)?.state != SocketState::Closed {
            if let Err(e) = self.close_link(handle) {
                warn!("[SOCK] link {} close failed: {:?}", handle.link, e);
            }
        }
        Ok(self.handler().sockets.remove(handle)?)
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    pub(crate) fn configure_socket(&mut self, option: SocketOption) -> Result<(), Error> {
        self.exec(format_args!("AT+QICFG={}", option))
    }

    /// Issue `AT+QIOPEN` for a registered socket. Completion arrives as a
    /// `+QIOPEN` notification.
    pub(crate) fn open_link(&mut self, handle: SocketHandle) -> Result<(), Error> {
        let shared = self.handler();
        if !shared.net.status.contains(NetStatus::Open) || !shared.net.status.contains(NetStatus::Available) {
            return Err(Error::NotReady);
        }
        let context_id = shared.net.context_id;
        let socket = shared.sockets.get_mut(handle)?;
        let (kind, host, port) = (socket.kind, socket.host, socket.port);
        socket.state = SocketState::Opening;

        let result = self.exec(format_args!(
            "AT+QIOPEN={},{},\"{}\",\"{}\",{},0,1",
            context_id, handle.link, kind, host, port
        ));

        let shared = self.handler();
        match result {
            Ok(()) => {
                shared.listener.socket_connecting(handle);
                Ok(())
            }
            Err(e) => {
                if let Ok(socket) = shared.sockets.get_mut(handle) {
                    socket.state = SocketState::Closed;
                }
                Err(e)
            }
        }
    }

    /// `AT+QICLOSE`; the pump then sees a `Closed` event.
    pub(crate) fn close_link(&mut self, handle: SocketHandle) -> Result<(), Error> {
        let timeout = self.handler().sockets.get(handle)?.config.timeout;
        self.send_command(format_args!("AT+QICLOSE={},2", handle.link))?;
        self.expect_ok(timeout).into_result()?;

        if let Ok(socket) = self.handler().sockets.get_mut(handle) {
            socket.events.insert(SocketEvent::Closed);
            socket.state = SocketState::Closed;
        }
        Ok(())
    }

    /// Send `data` on an open socket, returning the number of bytes the
    /// modem acknowledged.
    pub(crate) fn send_socket(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, Error> {
        if self.handler().sockets.get(handle)?.state != SocketState::Open {
            return Err(SocketError::NotOpen.into());
        }

        self.send_command_with(format_args!("AT+QISEND={},{}", handle.link, data.len()), "\r")?;
        self.wait_for_token(">", module_timing::send_prompt())
            .into_result()?;
        self.send_data(data)?;

        let mut ack = String::<0>::new();
        self.get_response(Some("SEND OK"), &mut ack, ResponseMode::OnlyData, module_timing::send_ack())
            .into_result()?;
        Ok(data.len())
    }

    fn arm_reconnect(&mut self, handle: SocketHandle) {
        let now = self.now();
        if let Ok(socket) = self.handler().sockets.get_mut(handle) {
            socket.reconnect.arm(now);
        }
    }

    fn release_socket(&mut self, handle: SocketHandle) {
        if self.handler().sockets.release(handle).is_ok() {
            debug!("[SOCK] link {} released", handle.link);
        }
    }

    /// Core restart: every link number the modem handed out is gone.
    ///
    /// Open sockets report `closed` and plain ones are released. A socket
    /// caught opening is reset to `Closed` in place; only an auto-reconnect
    /// one reports the failed connect and starts its backoff.
    pub(crate) fn sockets_on_started(&mut self) {
        let now = self.now();
        let Shared {
            sockets, listener, ..
        } = self.handler();

        for handle in sockets.handles() {
            let Ok(socket) = sockets.get_mut(handle) else {
                continue;
            };
            let auto = socket.config.auto_reconnect;
            let state = socket.state;
            socket.state = SocketState::Closed;
            socket.events.clear();

            match state {
                SocketState::Opening if auto => {
                    socket.reconnect.arm(now);
                    listener.socket_connect_error(handle);
                }
                SocketState::Open => {
                    if !auto {
                        sockets.release(handle).ok();
                    }
                    listener.socket_closed(handle);
                }
                _ => {}
            }
        }
    }

    /// Data came online: apply the defaults and close links left over from
    /// before.
    pub(crate) fn sockets_on_net_opened(&mut self) {
        for option in DEFAULT_OPTIONS {
            if let Err(e) = self.configure_socket(option) {
                self.housekeeping_failed("socket defaults", e);
                break;
            }
        }
        if let Err(e) = self.clear_stale_links() {
            self.housekeeping_failed("socket table reset", e);
        }
    }

    fn clear_stale_links(&mut self) -> Result<(), Error> {
        self.send_command(format_args!("AT+QISTATE"))?;
        let mut rows = Vec::<String<10>, MAX_NUM_OF_SOCKET>::new();
        self.get_multiple_response("+QISTATE", &mut rows, ResponseMode::WaitOk, module_timing::socket_state_query())
            .into_result()?;

        for row in &rows {
            let Ok(link) = parse_field::<u8>(row, 0) else {
                continue;
            };
            if let Err(e) = self.exec(format_args!("AT+QICLOSE={},2", link)) {
                warn!("[SOCK] stale link {} not closed: {:?}", link, e);
                continue;
            }
            if let Some((_, socket)) = self.handler().sockets.by_link_mut(link) {
                socket.events.insert(SocketEvent::Closed);
                socket.state = SocketState::Closed;
            }
        }

        self.handler().net.status.insert(NetStatus::Available);
        Ok(())
    }

    pub(crate) fn handle_sockets(&mut self) {
        if !self.handler().net.status.contains(NetStatus::Open) {
            return;
        }
        for handle in self.handler().sockets.handles() {
            self.handle_socket(handle);
        }
    }

    fn handle_socket(&mut self, handle: SocketHandle) {
        let Ok(socket) = self.handler().sockets.get_mut(handle) else {
            return;
        };
        let events = core::mem::take(&mut socket.events);
        let auto = socket.config.auto_reconnect;

        if events.contains(SocketEvent::Opened) {
            self.handler().listener.socket_connected(handle);
        }

        if events.contains(SocketEvent::OpeningError) {
            self.handler().listener.socket_connect_error(handle);
            if !auto {
                self.release_socket(handle);
                return;
            }
            self.arm_reconnect(handle);
        }

        if events.contains(SocketEvent::ClosedByPeer) {
            if let Err(e) = self.close_link(handle) {
                self.housekeeping_failed("socket close", e);
            }
        }

        // close_link raises Closed again; consume it in this pass
        let closed_again = self
            .handler()
            .sockets
            .get_mut(handle)
            .map(|socket| socket.events.take(SocketEvent::Closed))
            .unwrap_or(false);
        if events.contains(SocketEvent::Closed) || closed_again {
            self.handler().listener.socket_closed(handle);
            if !auto {
                self.release_socket(handle);
                return;
            }
            self.arm_reconnect(handle);
        }

        if events.contains(SocketEvent::Received) {
            trace!("[SOCK] link {} received", handle.link);
        }

        let now = self.now();
        let due = self
            .handler()
            .sockets
            .get(handle)
            .map(|socket| auto && socket.state == SocketState::Closed && socket.reconnect.is_expired(now))
            .unwrap_or(false);
        if due {
            debug!("[SOCK] link {} reconnecting", handle.link);
            if let Err(e) = self.open_link(handle) {
                self.arm_reconnect(handle);
                self.housekeeping_failed("socket reconnect", e);
            }
        }
    }
}

impl<'a, T, C, L, M> Modem<'a, T, C, L, M>
where
    T: Transport,
    C: Clock,
    L: Listener,
    M: RawMutex,
{
    /// Register `socket` and start connecting it.
    ///
    /// Requires the data connection to be up, unless the socket has
    /// `auto_reconnect`, in which case it is accepted anyway and connected by
    /// the pump. A socket refused here can be taken back with
    /// [`socket_reclaim`](Self::socket_reclaim). If the call itself returns
    /// [`Error::Busy`], the socket is dropped.
    pub fn socket_open(&self, socket: Socket<'a>) -> Result<SocketHandle, Error> {
        self.transaction(|s| s.open_socket(socket))
    }

    pub fn socket_close(&self, handle: SocketHandle) -> Result<(), Error> {
        self.transaction(|s| s.close_link(handle))
    }

    /// Close if still connected and hand the socket back, ending any
    /// reconnect attempts.
    pub fn socket_remove(&self, handle: SocketHandle) -> Result<Socket<'a>, Error> {
        self.transaction(|s| s.remove_socket(handle))
    }

    /// Returns the number of bytes the modem acknowledged.
    pub fn socket_send(&self, handle: SocketHandle, data: &[u8]) -> Result<usize, Error> {
        self.transaction(|s| s.send_socket(handle, data))
    }

    pub fn socket_state(&self, handle: SocketHandle) -> Result<SocketState, Error> {
        self.with_shared(|shared| shared.sockets.get(handle).map(|socket| socket.state))?
            .map_err(Error::from)
    }

    /// Drain received bytes into `buf`.
    pub fn socket_read(&self, handle: SocketHandle, buf: &mut [u8]) -> Result<usize, Error> {
        self.with_shared(|shared| {
            shared
                .sockets
                .get_mut(handle)
                .map(|socket| socket.buffer.dequeue_slice(buf))
        })?
        .map_err(Error::from)
    }

    /// Take back a socket the driver let go of.
    pub fn socket_reclaim(&self) -> Result<Option<Socket<'a>>, Error> {
        self.with_shared(|shared| shared.sockets.reclaim())
    }

    pub fn socket_configure(&self, option: SocketOption) -> Result<(), Error> {
        self.transaction(|s| s.configure_socket(option))
    }
}
