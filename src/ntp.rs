use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::config::NtpConfig;
use crate::engine::parse_field;
use crate::error::Error;
use crate::event::{flags, Flags};
use crate::listener::Listener;
use crate::modem::{Modem, Shared, Tx};
use crate::net::NetStatus;
use crate::timer::TimerId;
use crate::transport::{Clock, Transport};

/// Port the modem queries on the NTP server.
const NTP_PORT: u16 = 123;

flags! {
    pub enum NtpStatus {
        Syncing = 0,
        Synced = 1,
    }
}

flags! {
    pub(crate) enum NtpEvent {
        Synced = 0,
    }
}

/// Network time sync, scheduled on the `NtpSync` timer.
///
/// An attempt arms the timer with the retry interval. A successful `+QNTP`
/// reply stretches the same timer to the resync interval, so "time for the
/// next attempt" is always just "timer expired". An attempt that never
/// completes leaves `Syncing` set until the retry interval runs out.
pub struct NtpState<'a> {
    pub(crate) config: NtpConfig<'a>,
    pub(crate) status: Flags<NtpStatus>,
    pub(crate) events: Flags<NtpEvent>,
}

impl<'a> NtpState<'a> {
    pub(crate) fn new(config: NtpConfig<'a>) -> Self {
        Self {
            config,
            status: Flags::new(),
            events: Flags::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status.clear();
        self.events.clear();
    }

    pub fn is_synced(&self) -> bool {
        self.status.contains(NtpStatus::Synced)
    }
}

impl<L: Listener> Shared<'_, L> {
    /// `+QNTP: <err>[,<time>]`, the completion of `AT+QNTP`.
    pub(crate) fn route_ntp(&mut self, line: &str) -> bool {
        let Some(payload) = line.strip_prefix("+QNTP: ") else {
            return false;
        };

        match parse_field::<u16>(payload, 0) {
            Ok(0) => {
                debug!("[NTP] Synced");
                self.ntp.status.insert(NtpStatus::Synced);
                self.ntp.events.insert(NtpEvent::Synced);
                let resync = self.ntp.config.resync_interval;
                self.scheduler.timer_mut(TimerId::NtpSync).set_period(resync);
            }
            Ok(err) => debug!("[NTP] error - {}", err),
            Err(_) => debug!("[NTP] unreadable reply: {}", payload),
        }
        self.ntp.status.remove(NtpStatus::Syncing);
        true
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    /// Start one sync attempt. Completion arrives as a `+QNTP` line.
    pub(crate) fn sync_ntp(&mut self) -> Result<(), Error> {
        let now = self.now();
        let shared = self.handler();
        let retry = shared.ntp.config.retry_interval;
        shared.scheduler.timer_mut(TimerId::NtpSync).arm_with(now, retry);
        shared.ntp.status.remove(NtpStatus::Synced);
        shared.ntp.status.insert(NtpStatus::Syncing);

        let Some(server) = shared.ntp.config.server else {
            return Ok(());
        };
        let context_id = shared.net.context_id;
        self.exec(format_args!("AT+QNTP={},\"{}\",{}", context_id, server, NTP_PORT))
    }

    pub(crate) fn handle_ntp(&mut self) {
        let now = self.now();
        let shared = self.handler();
        if shared.net.status.contains(NetStatus::Open) && shared.scheduler.is_expired(TimerId::NtpSync, now) {
            if let Err(e) = self.sync_ntp() {
                self.housekeeping_failed("NTP sync", e);
            }
        }

        if self.handler().ntp.events.take(NtpEvent::Synced) {
            match self.get_time() {
                Ok(datetime) => self.handler().listener.ntp_synced(datetime),
                Err(e) => self.housekeeping_failed("clock read", e),
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
    /// Server used from the next sync attempt on.
    pub fn set_ntp_server(&self, server: &'a str) -> Result<(), Error> {
        self.with_shared(|shared| shared.ntp.config.server = Some(server))
    }

    pub fn ntp_status(&self) -> Result<Flags<NtpStatus>, Error> {
        self.with_shared(|shared| shared.ntp.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::modem::tests::{modem_with, TestModem};
    use crate::test_helpers::{MockClock, MockTransport};
    use embassy_time::Duration;

    fn online_modem(config: Config<'static>) -> (TestModem, MockTransport, MockClock) {
        let (modem, transport, clock) = modem_with(config);
        modem
            .with_shared(|s| {
                s.net.context_id = 1;
                s.net.status.insert(NetStatus::Open);
            })
            .unwrap();
        (modem, transport, clock)
    }

    #[test]
    fn first_attempt_is_immediate_once_online() {
        let (modem, transport, _clock) = online_modem(Config::new().with_ntp_server("pool.ntp.org"));
        transport.on("AT+QNTP", "OK\r\n");

        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();

        assert_eq!(transport.sent("AT+QNTP=1,\"pool.ntp.org\",123"), 1);
        assert!(modem.ntp_status().unwrap().contains(NtpStatus::Syncing));
    }

    #[test]
    fn offline_network_never_syncs() {
        let (modem, transport, _clock) = modem_with(Config::new().with_ntp_server("pool.ntp.org"));
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        assert!(transport.written().is_empty());
    }

    #[test]
    fn unanswered_attempt_is_retried_after_interval() {
        let config = Config::new()
            .with_ntp_server("pool.ntp.org")
            .with_ntp_intervals(Duration::from_secs(10), Duration::from_secs(3600));
        let (modem, transport, clock) = online_modem(config);
        transport.on("AT+QNTP", "OK\r\n");
        transport.on("AT+QNTP", "OK\r\n");

        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        clock.advance(Duration::from_secs(5));
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        assert_eq!(transport.sent("AT+QNTP"), 1);

        // still marked syncing, the retry interval overrides it
        clock.advance(Duration::from_secs(5));
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        assert_eq!(transport.sent("AT+QNTP"), 2);
    }

    #[test]
    fn sync_reply_reads_clock_and_schedules_resync() {
        let config = Config::new()
            .with_ntp_server("pool.ntp.org")
            .with_ntp_intervals(Duration::from_secs(10), Duration::from_secs(3600));
        let (modem, transport, clock) = online_modem(config);
        transport.on("AT+QNTP", "OK\r\n\r\n+QNTP: 0,\"2024/03/17,10:20:30+28\"\r\n");
        transport.on("AT+CCLK?", "+CCLK: \"24/03/17,10:20:31+28\"\r\nOK\r\n");

        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        modem.transaction(|s| Ok(s.poll_urcs())).unwrap();
        let status = modem.ntp_status().unwrap();
        assert!(status.contains(NtpStatus::Synced));
        assert!(!status.contains(NtpStatus::Syncing));

        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        let synced = modem.listener(|l| l.synced.clone()).unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].second, 31);

        // the retry interval no longer applies
        clock.advance(Duration::from_secs(60));
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        assert_eq!(transport.sent("AT+QNTP"), 1);

        transport.on("AT+QNTP", "OK\r\n");
        clock.advance(Duration::from_secs(3600));
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();
        assert_eq!(transport.sent("AT+QNTP"), 2);
        assert!(!modem.ntp_status().unwrap().contains(NtpStatus::Synced));
    }

    #[test]
    fn failed_sync_reply_clears_syncing_only() {
        let (modem, transport, _clock) = online_modem(Config::new().with_ntp_server("pool.ntp.org"));
        transport.on("AT+QNTP", "OK\r\n");
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();

        transport.push("+QNTP: 565\r\n");
        modem.transaction(|s| Ok(s.poll_urcs())).unwrap();

        assert!(modem.ntp_status().unwrap().is_empty());
    }

    #[test]
    fn without_server_only_the_schedule_advances() {
        let (modem, transport, _clock) = online_modem(Config::new());
        modem.transaction(|s| Ok(s.handle_ntp())).unwrap();

        assert!(transport.written().is_empty());
        assert!(modem.ntp_status().unwrap().contains(NtpStatus::Syncing));

        modem.set_ntp_server("time.google.com").unwrap();
        modem.with_shared(|s| assert_eq!(s.ntp.config.server, Some("time.google.com"))).unwrap();
    }
}
