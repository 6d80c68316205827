//! Packet data bring-up: GPRS attach, APN binding and PDP context activation.
//!
//! Progress is kept as level flags in [`NetStatus`] rather than an explicit
//! state, and advances strictly in the order attach, APN, activation. Each
//! step only runs once the previous one holds, and a step that fails is simply
//! retried on a later pump.

use embassy_time::Duration;
use heapless::{String, Vec};

use crate::config::{Apn, Config};
use crate::engine::{parse_delimited, parse_field, ResponseMode};
use crate::error::Error;
use crate::event::{flags, Flags};
use crate::listener::Listener;
use crate::modem::{CoreStatus, Modem, Shared, Tx};
use crate::module_timing;
use crate::registration::{RegistrationStatus, Status as RegStatus};
use crate::transport::{Clock, Transport};
use embassy_sync::blocking_mutex::raw::RawMutex;

/// Maximum number of rows read from an `AT+QIACT?` listing.
const MAX_CONTEXTS: usize = 16;

flags! {
    pub enum NetStatus {
        GprsRegistered = 0,
        Roaming = 1,
        ApnSet = 2,
        Opening = 3,
        Open = 4,
        /// Socket defaults applied and stale links cleared.
        Available = 5,
    }
}

flags! {
    pub(crate) enum NetEvent {
        GprsRegistered = 0,
        Opened = 1,
        Closed = 2,
    }
}

/// Where packet data bring-up currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetPhase {
    NotAttached,
    GprsRegistered,
    ApnSet,
    Opening,
    Open,
}

pub struct NetState<'a> {
    pub(crate) status: Flags<NetStatus>,
    pub(crate) events: Flags<NetEvent>,
    /// Context in use, 0 until the APN step ran.
    pub(crate) context_id: u8,
    configured_context: u8,
    pub(crate) apn: Apn<'a>,
    pub(crate) gprs: RegistrationStatus,
}

impl<'a> NetState<'a> {
    pub(crate) fn new(config: &Config<'a>) -> Self {
        Self {
            status: Flags::new(),
            events: Flags::new(),
            context_id: 0,
            configured_context: config.context_id,
            apn: config.apn,
            gprs: RegistrationStatus::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status.clear();
        self.events.clear();
        self.context_id = 0;
        self.gprs.reset();
    }

    /// Replace the credentials; binding and activation run again.
    pub(crate) fn set_apn(&mut self, apn: Apn<'a>) {
        self.apn = apn;
        self.status.remove(NetStatus::GprsRegistered);
        self.status.remove(NetStatus::ApnSet);
    }

    pub fn phase(&self) -> NetPhase {
        let status = &self.status;
        if status.contains(NetStatus::Open) {
            NetPhase::Open
        } else if status.contains(NetStatus::Opening) {
            NetPhase::Opening
        } else if status.contains(NetStatus::ApnSet) {
            NetPhase::ApnSet
        } else if status.contains(NetStatus::GprsRegistered) {
            NetPhase::GprsRegistered
        } else {
            NetPhase::NotAttached
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.contains(NetStatus::Open)
    }
}

impl<L: Listener> Shared<'_, L> {
    pub(crate) fn route_net(&mut self, line: &str) -> bool {
        #[cfg(feature = "ntp")]
        if self.route_ntp(line) {
            return true;
        }

        let Some(payload) = line.strip_prefix("+QIURC: ") else {
            return false;
        };
        if parse_delimited(payload, 0, ',') != Some("pdpdeact") {
            return false;
        }

        if parse_field::<u8>(payload, 1) == Ok(self.net.context_id) {
            let net = &mut self.net;
            net.status.remove(NetStatus::Open);
            net.status.remove(NetStatus::Opening);
            net.events.insert(NetEvent::Closed);
        }
        true
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    /// `AT+CGREG?`, the packet switched twin of the registration query.
    pub(crate) fn check_gprs(&mut self) -> Result<RegStatus, Error> {
        let payload = self.query(format_args!("AT+CGREG?"), "+CGREG", module_timing::status_query())?;
        let stat = RegStatus::from_reply(&payload)?;
        let now = self.now();

        let net = &mut self.handler().net;
        net.gprs.set_status(stat, now);
        if stat.registered() {
            net.status.insert(NetStatus::GprsRegistered);
            net.status.set(NetStatus::Roaming, stat == RegStatus::Roaming);
            net.events.insert(NetEvent::GprsRegistered);
        } else {
            net.status.remove(NetStatus::GprsRegistered);
        }
        Ok(stat)
    }

    /// Bind the APN to the configured context.
    ///
    /// Without credentials the profile already stored in the modem is used as
    /// is. After a successful `AT+QICSGP` the attach check runs again before
    /// activation.
    pub(crate) fn bind_apn(&mut self) -> Result<(), Error> {
        let net = &self.handler().net;
        let context_id = net.configured_context;
        let apn = net.apn;

        if let Apn::Given {
            name,
            username,
            password,
        } = apn
        {
            let auth = if username.is_some() { 3 } else { 0 };
            self.exec(format_args!(
                "AT+QICSGP={},3,\"{}\",\"{}\",\"{}\",{}",
                context_id,
                name,
                username.unwrap_or(""),
                password.unwrap_or(""),
                auth
            ))?;
            self.handler().net.status.remove(NetStatus::GprsRegistered);
        }

        let net = &mut self.handler().net;
        net.context_id = context_id;
        net.status.insert(NetStatus::ApnSet);
        Ok(())
    }

    /// Bring the PDP context up, reusing it if the modem already has it
    /// active.
    pub(crate) fn activate_pdp(&mut self) -> Result<(), Error> {
        let context_id = self.handler().net.context_id;
        if context_id == 0 {
            return Err(Error::NotReady);
        }

        debug!("getting online data");
        self.send_command(format_args!("AT+QIACT?"))?;
        let mut rows = Vec::<String<8>, MAX_CONTEXTS>::new();
        let listed = self
            .get_multiple_response("+QIACT", &mut rows, ResponseMode::WaitOk, module_timing::context_query())
            .is_ok();

        if listed
            && rows
                .iter()
                .any(|row| parse_field::<u8>(row, 0) == Ok(context_id))
        {
            self.context_opened();
            return Ok(());
        }

        self.handler().net.status.insert(NetStatus::Opening);
        self.send_command(format_args!("AT+QIACT={}", context_id))?;
        if let Err(e) = self.expect_ok(module_timing::context_activation()).into_result() {
            let shared = self.handler();
            shared.net.status.remove(NetStatus::Opening);
            shared.listener.net_open_error();
            return Err(e);
        }
        self.context_opened();
        Ok(())
    }

    fn context_opened(&mut self) {
        let net = &mut self.handler().net;
        if !net.status.contains(NetStatus::Open) {
            net.events.insert(NetEvent::Opened);
        }
        net.status.insert(NetStatus::Open);
        net.status.remove(NetStatus::Opening);
    }

    pub(crate) fn handle_net(&mut self) {
        let registered = self.handler().status.contains(CoreStatus::Registered);
        let status = self.handler().net.status;

        if registered && !status.contains(NetStatus::GprsRegistered) {
            if let Err(e) = self.check_gprs() {
                self.housekeeping_failed("GPRS check", e);
            }
        }

        let status = self.handler().net.status;
        if registered && status.contains(NetStatus::GprsRegistered) && !status.contains(NetStatus::ApnSet) {
            if let Err(e) = self.bind_apn() {
                self.housekeeping_failed("APN", e);
            }
        }

        let status = self.handler().net.status;
        if registered
            && status.contains(NetStatus::GprsRegistered)
            && status.contains(NetStatus::ApnSet)
            && !status.contains(NetStatus::Open)
            && !status.contains(NetStatus::Opening)
        {
            if let Err(e) = self.activate_pdp() {
                self.housekeeping_failed("PDP activation", e);
            }
        }

        if self.handler().net.events.take(NetEvent::GprsRegistered) {
            let roaming = self.handler().net.status.contains(NetStatus::Roaming);
            debug!("[GPRS] Registered{}.", if roaming { " (Roaming)" } else { "" });
        }

        if self.handler().net.events.take(NetEvent::Opened) {
            debug!("Data online");
            #[cfg(feature = "socket")]
            self.sockets_on_net_opened();
            self.handler().listener.net_opened();
        }

        if self.handler().net.events.take(NetEvent::Closed) {
            debug!("Data offline");
            let shared = self.handler();
            shared.net.status.remove(NetStatus::Available);
            shared.listener.net_closed();
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
    pub fn set_apn(&self, apn: Apn<'a>) -> Result<(), Error> {
        self.with_shared(|shared| shared.net.set_apn(apn))
    }

    pub fn net_status(&self) -> Result<Flags<NetStatus>, Error> {
        self.with_shared(|shared| shared.net.status)
    }

    pub fn net_phase(&self) -> Result<NetPhase, Error> {
        self.with_shared(|shared| shared.net.phase())
    }

    pub fn is_online(&self) -> Result<bool, Error> {
        self.with_shared(|shared| shared.net.is_online())
    }

    /// Activate the PDP context now instead of waiting for the pump.
    ///
    /// Cheap when the context is already up: only the listing query is sent.
    pub fn activate_pdp(&self) -> Result<(), Error> {
        self.transaction(|s| s.activate_pdp())
    }

    /// Pump until the PDP context is active.
    pub fn wait_online(&self, timeout: Duration) -> Result<(), Error> {
        self.pump_until(timeout, |shared| shared.net.is_online())
    }
}
