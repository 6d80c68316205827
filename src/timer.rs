use embassy_time::{Duration, Instant};

/// One-shot deadline.
///
/// A disarmed timer counts as expired, so "retry unless backing off" reads as
/// `timer.is_expired(now)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer {
    armed_at: Option<Instant>,
    period: Duration,
}

impl Timer {
    pub const fn new(period: Duration) -> Self {
        Self {
            armed_at: None,
            period,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    pub fn arm_with(&mut self, now: Instant, period: Duration) {
        self.period = period;
        self.armed_at = Some(now);
    }

    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    /// Change the period without moving the arming instant.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.armed_at {
            Some(at) => now.checked_duration_since(at).unwrap_or(Duration::MIN) >= self.period,
            None => true,
        }
    }
}

/// Named timers driven by the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Deadline before the first bare `AT` probe.
    CoreInit,
    SimRetry,
    RegistrationRetry,
    NtpSync,
    GpsNmea,
}

impl TimerId {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

pub(crate) const SIM_RETRY: Duration = Duration::from_secs(3);
pub(crate) const REGISTRATION_RETRY: Duration = Duration::from_secs(3);
pub(crate) const GPS_NMEA_INTERVAL: Duration = Duration::from_secs(5);

/// Owner of every subsystem-level timer, so backoff policy lives in data
/// rather than in the handlers.
#[derive(Debug, Clone)]
pub struct Scheduler {
    timers: [Timer; TimerId::COUNT],
}

impl Scheduler {
    pub fn new(init_timeout: Duration) -> Self {
        let mut timers = [Timer::default(); TimerId::COUNT];
        timers[TimerId::CoreInit.index()] = Timer::new(init_timeout);
        timers[TimerId::SimRetry.index()] = Timer::new(SIM_RETRY);
        timers[TimerId::RegistrationRetry.index()] = Timer::new(REGISTRATION_RETRY);
        timers[TimerId::GpsNmea.index()] = Timer::new(GPS_NMEA_INTERVAL);
        Self { timers }
    }

    pub fn timer(&self, id: TimerId) -> &Timer {
        &self.timers[id.index()]
    }

    pub fn timer_mut(&mut self, id: TimerId) -> &mut Timer {
        &mut self.timers[id.index()]
    }

    pub fn arm(&mut self, id: TimerId, now: Instant) {
        self.timer_mut(id).arm(now)
    }

    pub fn disarm(&mut self, id: TimerId) {
        self.timer_mut(id).disarm()
    }

    pub fn is_expired(&self, id: TimerId, now: Instant) -> bool {
        self.timer(id).is_expired(now)
    }
}
