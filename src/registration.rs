use embassy_time::{Duration, Instant};

use crate::engine::parse_field;
use crate::error::Error;

/// Registration state of one domain (`+CREG` for circuit switched, `+CGREG`
/// for packet switched), with when it was last seen and last changed.
#[derive(Debug, Clone, Default)]
pub struct RegistrationStatus {
    status: Status,
    updated: Option<Instant>,
    started: Option<Instant>,
}

impl RegistrationStatus {
    pub const fn new() -> Self {
        Self {
            status: Status::None,
            updated: None,
            started: None,
        }
    }

    /// How long the current status has lasted.
    pub fn duration(&self, now: Instant) -> Duration {
        self.started
            .and_then(|started| now.checked_duration_since(started))
            .unwrap_or_else(|| Duration::from_millis(0))
    }

    pub fn updated(&self) -> Option<Instant> {
        self.updated
    }

    pub fn reset(&mut self) {
        self.status = Status::None;
        self.updated = None;
        self.started = None;
    }

    pub fn get_status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, stat: Status, now: Instant) {
        if self.status != stat {
            self.status = stat;
            self.started = Some(now);
        }
        self.updated = Some(now);
    }

    pub fn registered(&self) -> bool {
        self.status.registered()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    #[default]
    None,
    NotRegistering,
    Home,
    Searching,
    Denied,
    OutOfCoverage,
    Roaming,
}

impl Status {
    pub fn registered(self) -> bool {
        matches!(self, Self::Home | Self::Roaming)
    }

    /// Parse the `<n>,<stat>[,...]` payload of a `+CREG`/`+CGREG` reply.
    pub fn from_reply(payload: &str) -> Result<Self, Error> {
        parse_field::<u8>(payload, 1).map(Self::from)
    }
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::NotRegistering,
            1 => Self::Home,
            2 => Self::Searching,
            3 => Self::Denied,
            4 => Self::OutOfCoverage,
            5 => Self::Roaming,
            _ => Self::None,
        }
    }
}
