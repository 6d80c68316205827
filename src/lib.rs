#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod event;

pub mod config;
pub mod datetime;
pub mod engine;
pub mod error;
pub mod listener;
pub mod modem;
mod module_timing;
pub mod registration;
pub mod ring_buffer;
pub mod timer;
pub mod transport;

#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "gps")]
pub mod gps;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "net")]
pub mod net;
#[cfg(feature = "ntp")]
pub mod ntp;
#[cfg(feature = "socket")]
pub mod socket;

#[cfg(test)]
mod test_helpers;

pub use config::{Apn, Config, NtpConfig};
pub use datetime::Datetime;
pub use error::{Error, SocketError, Status};
pub use event::{Flag, Flags};
pub use listener::Listener;
pub use modem::{CoreState, CoreStatus, Modem};
pub use transport::{Clock, Transport};
