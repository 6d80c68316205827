#[cfg(feature = "ntp")]
use crate::datetime::Datetime;
#[cfg(feature = "socket")]
use crate::{ring_buffer::RingBuffer, socket::SocketHandle};

/// Callbacks raised from inside [`Modem::pump`](crate::Modem::pump).
///
/// Every method defaults to doing nothing, so an implementation only spells
/// out the notifications it cares about. Callbacks run while the modem is
/// borrowed: calling back into the modem from one returns
/// [`Error::Busy`](crate::error::Error::Busy).
#[allow(unused_variables)]
pub trait Listener {
    /// The modem answered its first `AT` after power-up or reset.
    fn started(&mut self) {}

    fn registered(&mut self, roaming: bool) {}

    /// The PDP context became active.
    #[cfg(feature = "net")]
    fn net_opened(&mut self) {}

    /// Explicit context activation was refused or timed out.
    #[cfg(feature = "net")]
    fn net_open_error(&mut self) {}

    #[cfg(feature = "net")]
    fn net_closed(&mut self) {}

    #[cfg(feature = "ntp")]
    fn ntp_synced(&mut self, datetime: Datetime) {}

    #[cfg(feature = "socket")]
    fn socket_connecting(&mut self, handle: SocketHandle) {}

    #[cfg(feature = "socket")]
    fn socket_connected(&mut self, handle: SocketHandle) {}

    #[cfg(feature = "socket")]
    fn socket_connect_error(&mut self, handle: SocketHandle) {}

    #[cfg(feature = "socket")]
    fn socket_closed(&mut self, handle: SocketHandle) {}

    /// New bytes are in `buffer`. Called once per forwarded chunk, so a
    /// payload larger than the buffer arrives over several calls; drain the
    /// buffer to make room for the rest.
    #[cfg(feature = "socket")]
    fn socket_received(&mut self, handle: SocketHandle, buffer: &mut RingBuffer<'_>) {}

    /// One raw NMEA sentence, without line terminator.
    #[cfg(feature = "gps")]
    fn gps_nmea(&mut self, sentence: &str) {}
}

impl Listener for () {}
