/// Outcome of a single command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Ok,
    /// Terminal negative acknowledgement (`ERROR` or `+CME ERROR`).
    Error,
    /// No conclusive reply arrived before the deadline.
    Timeout,
    /// A previous request is still outstanding.
    Busy,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Status::Ok => Ok(()),
            Status::Error => Err(Error::Error),
            Status::Timeout => Err(Error::Timeout),
            Status::Busy => Err(Error::Busy),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketError {
    /// Every link number is already occupied.
    SetFull,
    /// The handle refers to a slot that was freed or reused.
    InvalidHandle,
    NotOpen,
    /// The socket was given zero bytes of receive storage.
    NoBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // Modem replies
    Error,
    Timeout,
    Busy,

    // Driver side
    Transport,
    Overflow,
    NotReady,
    Parse,

    Socket(SocketError),
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            Self::Error => defmt::write!(f, "Error"),
            Self::Timeout => defmt::write!(f, "Timeout"),
            Self::Busy => defmt::write!(f, "Busy"),
            Self::Transport => defmt::write!(f, "Transport"),
            Self::Overflow => defmt::write!(f, "Overflow"),
            Self::NotReady => defmt::write!(f, "NotReady"),
            Self::Parse => defmt::write!(f, "Parse"),
            Self::Socket(e) => defmt::write!(f, "Socket({:?})", e),
        }
    }
}

impl From<SocketError> for Error {
    fn from(e: SocketError) -> Self {
        Self::Socket(e)
    }
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Self::Overflow
    }
}

impl From<core::cell::BorrowMutError> for Error {
    fn from(_: core::cell::BorrowMutError) -> Self {
        Self::Busy
    }
}

impl From<core::num::ParseIntError> for Error {
    fn from(_: core::num::ParseIntError) -> Self {
        Self::Parse
    }
}
