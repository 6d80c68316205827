use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use heapless::String;

use crate::config::Config;
use crate::datetime::Datetime;
use crate::engine::{parse_field, Engine, ResponseMode, Row, Session, UrcHandler};
use crate::error::Error;
use crate::event::{flags, Flags};
use crate::listener::Listener;
use crate::module_timing;
use crate::registration::{RegistrationStatus, Status as RegStatus};
use crate::timer::{Scheduler, TimerId};
use crate::transport::{Clock, Transport};

#[cfg(feature = "gps")]
use crate::gps::GpsState;
#[cfg(feature = "http")]
use crate::http::HttpState;
#[cfg(feature = "net")]
use crate::net::NetState;
#[cfg(feature = "ntp")]
use crate::ntp::NtpState;
#[cfg(feature = "socket")]
use crate::socket::{SocketSet, NUM_OF_SOCKET};

flags! {
    /// Level status of the modem itself.
    pub enum CoreStatus {
        Active = 0,
        SimReady = 1,
        Registered = 2,
        Roaming = 3,
    }
}

flags! {
    pub(crate) enum CoreEvent {
        Starting = 0,
        Started = 1,
        Registered = 2,
    }
}

/// Bring-up progress, derived from [`CoreStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreState {
    Uninitialized,
    /// `RDY` seen, first probe pending.
    Starting,
    AtResponsive,
    SimReady,
    Registered,
}

/// Everything the pump handlers and the URC router mutate.
pub struct Shared<'a, L> {
    pub(crate) status: Flags<CoreStatus>,
    pub(crate) events: Flags<CoreEvent>,
    pub(crate) signal: u8,
    pub(crate) errors: u16,
    pub(crate) registration: RegistrationStatus,
    pub(crate) scheduler: Scheduler,
    #[cfg(feature = "net")]
    pub(crate) net: NetState<'a>,
    #[cfg(feature = "ntp")]
    pub(crate) ntp: NtpState<'a>,
    #[cfg(feature = "socket")]
    pub(crate) sockets: SocketSet<'a, NUM_OF_SOCKET>,
    #[cfg(feature = "http")]
    pub(crate) http: HttpState,
    #[cfg(feature = "gps")]
    pub(crate) gps: GpsState<'a>,
    pub(crate) listener: L,
    #[cfg(not(any(feature = "net", feature = "gps")))]
    _config: core::marker::PhantomData<&'a ()>,
}

impl<'a, L: Listener> Shared<'a, L> {
    fn new(config: &Config<'a>, listener: L) -> Self {
        Self {
            status: Flags::new(),
            events: Flags::new(),
            signal: 0,
            errors: 0,
            registration: RegistrationStatus::new(),
            scheduler: Scheduler::new(config.init_timeout),
            #[cfg(feature = "net")]
            net: NetState::new(config),
            #[cfg(feature = "ntp")]
            ntp: NtpState::new(config.ntp),
            #[cfg(feature = "socket")]
            sockets: SocketSet::new(),
            #[cfg(feature = "http")]
            http: HttpState::new(),
            #[cfg(feature = "gps")]
            gps: GpsState::new(),
            listener,
            #[cfg(not(any(feature = "net", feature = "gps")))]
            _config: core::marker::PhantomData,
        }
    }

    /// Forget everything learned from the modem. Configuration survives.
    pub(crate) fn reset(&mut self) {
        self.status.clear();
        self.signal = 0;
        self.errors = 0;
        self.registration.reset();
        self.scheduler.disarm(TimerId::SimRetry);
        self.scheduler.disarm(TimerId::RegistrationRetry);
        #[cfg(feature = "net")]
        self.net.reset();
        #[cfg(feature = "ntp")]
        {
            self.ntp.reset();
            self.scheduler.disarm(TimerId::NtpSync);
        }
        #[cfg(feature = "gps")]
        self.gps.reset();
        #[cfg(feature = "http")]
        self.http.reset();
    }

    pub(crate) fn core_state(&self) -> CoreState {
        // a pending restart outranks status left over from before it
        if self.events.contains(CoreEvent::Starting) {
            CoreState::Starting
        } else if self.status.contains(CoreStatus::Registered) {
            CoreState::Registered
        } else if self.status.contains(CoreStatus::SimReady) {
            CoreState::SimReady
        } else if self.status.contains(CoreStatus::Active) {
            CoreState::AtResponsive
        } else {
            CoreState::Uninitialized
        }
    }
}

impl<L: Listener> UrcHandler for Shared<'_, L> {
    fn handle_urc(&mut self, line: &str, transport: &mut dyn Transport) -> bool {
        if line.starts_with("RDY") {
            self.events.insert(CoreEvent::Starting);
            return true;
        }

        #[cfg(feature = "net")]
        if self.route_net(line) {
            return true;
        }

        #[cfg(feature = "socket")]
        if self.route_socket(line, transport) {
            return true;
        }

        #[cfg(feature = "http")]
        if self.route_http(line) {
            return true;
        }

        #[cfg(feature = "gps")]
        if self.route_gps(line) {
            return true;
        }

        #[cfg(not(feature = "socket"))]
        let _ = transport;
        trace!("unclaimed urc: {}", line);
        false
    }
}

struct Inner<'a, T, C, L> {
    engine: Engine<T, C>,
    shared: Shared<'a, L>,
}

/// One transaction against the modem, with access to the shared state.
pub(crate) type Tx<'s, 'a, T, C, L> = Session<'s, T, C, Shared<'a, L>>;

/// Driver for a Quectel cellular module.
///
/// All state machines advance inside [`pump`](Self::pump), which the host
/// calls on a fixed tick (about 1 ms). Every exchange with the module runs
/// under the guard `M`, so the module never sees interleaved commands.
/// `NoopRawMutex` is right for a single executor; a
/// `CriticalSectionRawMutex` works too, but then interrupts stay masked for
/// the whole exchange, which may last seconds.
pub struct Modem<'a, T, C, L = (), M = NoopRawMutex>
where
    M: RawMutex,
{
    inner: Mutex<M, RefCell<Inner<'a, T, C, L>>>,
    reset: AtomicBool,
}

impl<'a, T, C, L, M> Modem<'a, T, C, L, M>
where
    T: Transport,
    C: Clock,
    L: Listener,
    M: RawMutex,
{
    pub fn new(transport: T, mut clock: C, listener: L, config: Config<'a>) -> Self {
        let now = clock.now();
        let mut shared = Shared::new(&config, listener);
        shared.scheduler.arm(TimerId::CoreInit, now);

        Self {
            inner: Mutex::new(RefCell::new(Inner {
                engine: Engine::new(transport, clock, config.timeout),
                shared,
            })),
            reset: AtomicBool::new(false),
        }
    }

    /// Run `f` as one guarded transaction.
    pub(crate) fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Tx<'_, 'a, T, C, L>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.inner.lock(|inner| {
            let mut inner = inner.try_borrow_mut()?;
            let Inner { engine, shared } = &mut *inner;
            let mut session = engine.session(shared);
            f(&mut session)
        })
    }

    /// Read or update the shared state without touching the transport.
    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut Shared<'a, L>) -> R) -> Result<R, Error> {
        self.inner.lock(|inner| {
            let mut inner = inner.try_borrow_mut()?;
            Ok(f(&mut inner.shared))
        })
    }

    /// Advance every state machine by one step.
    ///
    /// Buffered notifications are routed first, then the handlers run in the
    /// order core, network, sockets, time sync, GPS, each as its own
    /// transaction.
    pub fn pump(&self) -> Result<(), Error> {
        if self.reset.load(Ordering::Acquire) {
            self.reset.store(false, Ordering::Release);
            self.transaction(|s| {
                let now = s.now();
                let shared = s.handler();
                shared.reset();
                shared.events.clear();
                shared.scheduler.arm(TimerId::CoreInit, now);
                debug!("reset");
                Ok(())
            })?;
        }

        self.transaction(|s| {
            s.poll_urcs();
            Ok(())
        })?;

        self.transaction(|s| {
            s.handle_core();
            Ok(())
        })?;

        #[cfg(feature = "net")]
        self.transaction(|s| {
            s.handle_net();
            Ok(())
        })?;

        #[cfg(feature = "socket")]
        self.transaction(|s| {
            s.handle_sockets();
            Ok(())
        })?;

        #[cfg(feature = "ntp")]
        self.transaction(|s| {
            s.handle_ntp();
            Ok(())
        })?;

        #[cfg(feature = "gps")]
        self.transaction(|s| {
            s.handle_gps();
            Ok(())
        })?;

        Ok(())
    }

    /// Reset the driver state at the start of the next [`pump`](Self::pump).
    ///
    /// Safe to call from a listener callback.
    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Pump until the module answers `AT`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        self.pump_until(timeout, |shared| shared.status.contains(CoreStatus::Active))
    }

    pub(crate) fn pump_until(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&Shared<'a, L>) -> bool,
    ) -> Result<(), Error> {
        let start = self.now()?;
        loop {
            if self.with_shared(|shared| done(shared))? {
                return Ok(());
            }
            let elapsed = self.now()?.checked_duration_since(start).unwrap_or_default();
            if elapsed >= timeout {
                return Err(Error::Timeout);
            }
            self.pump()?;
            self.delay_ms(1)?;
        }
    }

    pub fn now(&self) -> Result<Instant, Error> {
        self.inner.lock(|inner| Ok(inner.try_borrow_mut()?.engine.now()))
    }

    fn delay_ms(&self, ms: u32) -> Result<(), Error> {
        self.inner.lock(|inner| {
            inner.try_borrow_mut()?.engine.clock().delay_ms(ms);
            Ok(())
        })
    }

    /// `true` while a transaction holds the transport.
    pub fn is_command_running(&self) -> bool {
        self.inner.lock(|inner| {
            inner
                .try_borrow()
                .map(|inner| inner.engine.is_command_running())
                .unwrap_or(true)
        })
    }

    pub fn status(&self) -> Result<Flags<CoreStatus>, Error> {
        self.with_shared(|shared| shared.status)
    }

    pub fn core_state(&self) -> Result<CoreState, Error> {
        self.with_shared(|shared| shared.core_state())
    }

    /// Last `+CSQ` RSSI, 0 when unknown.
    pub fn signal(&self) -> Result<u8, Error> {
        self.with_shared(|shared| shared.signal)
    }

    /// Housekeeping steps that failed since the last start.
    pub fn errors(&self) -> Result<u16, Error> {
        self.with_shared(|shared| shared.errors)
    }

    pub fn listener<R>(&self, f: impl FnOnce(&mut L) -> R) -> Result<R, Error> {
        self.with_shared(|shared| f(&mut shared.listener))
    }

    pub fn set_echo(&self, on: bool) -> Result<(), Error> {
        self.transaction(|s| s.set_echo(on))
    }

    pub fn check_at(&self) -> Result<(), Error> {
        self.transaction(|s| s.check_at())
    }

    pub fn get_signal(&self) -> Result<u8, Error> {
        self.transaction(|s| s.get_signal())
    }

    pub fn check_sim(&self) -> Result<(), Error> {
        self.transaction(|s| s.check_sim())
    }

    pub fn register_network(&self) -> Result<RegStatus, Error> {
        self.transaction(|s| s.register_network())
    }

    pub fn auto_update_timezone(&self, enable: bool) -> Result<(), Error> {
        self.transaction(|s| s.auto_update_timezone(enable))
    }

    pub fn get_time(&self) -> Result<Datetime, Error> {
        self.transaction(|s| s.get_time())
    }

    pub fn hash_time(&self) -> Result<String<6>, Error> {
        self.transaction(|s| s.get_time().map(|dt| dt.hash()))
    }

    pub fn send_ussd(&self, code: &str) -> Result<(), Error> {
        self.transaction(|s| s.send_ussd(code))
    }

    #[cfg(test)]
    pub(crate) fn engine_mut(&mut self) -> &mut Engine<T, C> {
        &mut self.inner.get_mut().get_mut().engine
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    /// Send `args` and wait for `OK` within the default timeout.
    pub(crate) fn exec(&mut self, args: core::fmt::Arguments<'_>) -> Result<(), Error> {
        self.send_command(args)?;
        self.expect_ok(Duration::from_ticks(0)).into_result()
    }

    /// Send `args` and return the payload of its `prefix` line.
    pub(crate) fn query(
        &mut self,
        args: core::fmt::Arguments<'_>,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Row, Error> {
        self.send_command(args)?;
        let mut payload = Row::new();
        self.get_response(Some(prefix), &mut payload, ResponseMode::WaitOk, timeout)
            .into_result()?;
        Ok(payload)
    }

    pub(crate) fn set_echo(&mut self, on: bool) -> Result<(), Error> {
        self.exec(format_args!("ATE{}", u8::from(on)))
    }

    pub(crate) fn check_at(&mut self) -> Result<(), Error> {
        let result = self.exec(format_args!("AT"));
        self.handler().status.set(CoreStatus::Active, result.is_ok());
        result
    }

    pub(crate) fn get_signal(&mut self) -> Result<u8, Error> {
        if !self.handler().status.contains(CoreStatus::SimReady) {
            return Err(Error::NotReady);
        }

        let payload = self.query(format_args!("AT+CSQ"), "+CSQ", module_timing::status_query())?;
        let rssi: u8 = parse_field(&payload, 0)?;
        if rssi == 99 {
            self.handler().signal = 0;
            // no signal usually means the registration was lost
            self.register_network()?;
            return Ok(0);
        }
        self.handler().signal = rssi;
        Ok(rssi)
    }

    pub(crate) fn check_sim(&mut self) -> Result<(), Error> {
        let payload = match self.query(format_args!("AT+CPIN?"), "+CPIN", module_timing::status_query()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("SIM card error.");
                return Err(e);
            }
        };

        if payload.trim() != "READY" {
            debug!("SIM not ready: {}", payload.as_str());
            return Err(Error::NotReady);
        }
        debug!("SIM Ready.");
        self.handler().status.insert(CoreStatus::SimReady);
        Ok(())
    }

    pub(crate) fn register_network(&mut self) -> Result<RegStatus, Error> {
        let payload = self.query(format_args!("AT+CREG?"), "+CREG", module_timing::status_query())?;
        let stat = RegStatus::from_reply(&payload)?;
        let now = self.now();

        let shared = self.handler();
        shared.registration.set_status(stat, now);
        if stat.registered() {
            if !shared.status.contains(CoreStatus::Registered) {
                shared.events.insert(CoreEvent::Registered);
            }
            shared.status.insert(CoreStatus::Registered);
            shared.status.set(CoreStatus::Roaming, stat == RegStatus::Roaming);
            return Ok(stat);
        }

        shared.status.remove(CoreStatus::Registered);
        shared.status.remove(CoreStatus::Roaming);
        match stat {
            RegStatus::NotRegistering => {
                debug!("Registering network....");
                let payload = self.query(format_args!("AT+COPS?"), "+COPS", module_timing::status_query())?;
                let mode: u8 = parse_field(&payload, 0)?;
                self.exec(format_args!("AT+COPS=?"))?;
                if mode != 0 {
                    // back to automatic operator selection, then kick a fresh search
                    self.exec(format_args!("AT+COPS=0"))?;
                    self.exec(format_args!("AT+COPS"))?;
                }
            }
            RegStatus::Searching => debug!("Searching network...."),
            _ => {}
        }
        Ok(stat)
    }

    pub(crate) fn auto_update_timezone(&mut self, enable: bool) -> Result<(), Error> {
        self.exec(format_args!("AT+CTZU={}", if enable { 3 } else { 0 }))
    }

    pub(crate) fn get_time(&mut self) -> Result<Datetime, Error> {
        let payload = self.query(format_args!("AT+CCLK?"), "+CCLK", module_timing::status_query())?;
        Datetime::parse(&payload)
    }

    pub(crate) fn send_ussd(&mut self, code: &str) -> Result<(), Error> {
        if !self.handler().status.contains(CoreStatus::Registered) {
            return Err(Error::NotReady);
        }
        self.exec(format_args!("AT+CSCS=\"GSM\""))?;
        self.exec(format_args!("AT+CUSD=1,\"{}\",15", code))
    }

    /// Record a failed housekeeping step.
    pub(crate) fn housekeeping_failed(&mut self, what: &str, e: Error) {
        warn!("{} failed: {:?}", what, e);
        let shared = self.handler();
        shared.errors = shared.errors.saturating_add(1);
    }

    fn started(&mut self) {
        self.handler().events.insert(CoreEvent::Started);
        if let Err(e) = self.set_echo(false) {
            self.housekeeping_failed("echo off", e);
        }
    }

    pub(crate) fn handle_core(&mut self) {
        let now = self.now();
        let shared = self.handler();

        if shared.status.is_empty()
            && !shared.events.contains(CoreEvent::Starting)
            && shared.scheduler.is_expired(TimerId::CoreInit, now)
        {
            if self.check_at().is_err() {
                let now = self.now();
                self.handler().scheduler.arm(TimerId::CoreInit, now);
                return;
            }
            self.started();
        }

        if self.handler().events.take(CoreEvent::Starting) {
            self.handler().reset();
            debug!("Starting...");
            if self.check_at().is_ok() {
                self.started();
            } else {
                let now = self.now();
                self.handler().scheduler.arm(TimerId::CoreInit, now);
            }
        }

        let now = self.now();
        let shared = self.handler();
        if shared.status.contains(CoreStatus::Active)
            && !shared.status.contains(CoreStatus::SimReady)
            && shared.scheduler.is_expired(TimerId::SimRetry, now)
        {
            if let Err(e) = self.check_sim() {
                self.housekeeping_failed("SIM check", e);
                self.handler().scheduler.arm(TimerId::SimRetry, now);
            }
        }

        let shared = self.handler();
        if shared.status.contains(CoreStatus::SimReady)
            && !shared.status.contains(CoreStatus::Registered)
            && shared.scheduler.is_expired(TimerId::RegistrationRetry, now)
        {
            match self.register_network() {
                Ok(stat) if stat.registered() => {}
                Ok(_) => self.handler().scheduler.arm(TimerId::RegistrationRetry, now),
                Err(e) => {
                    self.housekeeping_failed("registration", e);
                    self.handler().scheduler.arm(TimerId::RegistrationRetry, now);
                }
            }
        }

        if self.handler().events.take(CoreEvent::Started) {
            debug!("Started.");
            let shared = self.handler();
            shared.signal = 0;
            shared.errors = 0;
            if let Err(e) = self.auto_update_timezone(true) {
                self.housekeeping_failed("timezone auto update", e);
            }
            #[cfg(feature = "socket")]
            self.sockets_on_started();
            self.handler().listener.started();
        }

        if self.handler().events.take(CoreEvent::Registered) {
            let shared = self.handler();
            let roaming = shared.status.contains(CoreStatus::Roaming);
            debug!("Network Registered{}.", if roaming { " (Roaming)" } else { "" });
            shared.listener.registered(roaming);
        }
    }
}
