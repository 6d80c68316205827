//! GNSS engine control and raw NMEA collection.
//!
//! Sentences requested with `AT+QGPSGNMEA` come back as `+QGPSGNMEA` lines.
//! They are queued in a caller-provided ring buffer, one per `\n`-terminated
//! record, and handed to [`Listener::gps_nmea`] by the pump. Nothing here
//! parses NMEA.

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::engine::{parse_field, Row};
use crate::error::Error;
use crate::event::{flags, Flags};
use crate::listener::Listener;
use crate::modem::{CoreStatus, Modem, Shared, Tx};
use crate::module_timing;
#[cfg(feature = "net")]
use crate::net::NetStatus;
use crate::ring_buffer::RingBuffer;
use crate::timer::TimerId;
use crate::transport::{Clock, Transport};

/// Longest NMEA 0183 sentence, terminator excluded.
pub const NMEA_MAX_LEN: usize = 82;

/// Sentence types requested on every collection round.
const NMEA_KINDS: [&str; 6] = ["GGA", "RMC", "GSV", "GSA", "VTG", "GNS"];

flags! {
    pub enum GpsStatus {
        Active = 0,
    }
}

flags! {
    pub(crate) enum GpsEvent {
        NmeaAvailable = 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpsMode {
    Standalone = 1,
    MsBased = 2,
    MsAssisted = 3,
    SpeedOptimal = 4,
}

/// `AT+QGPSCFG` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpsOption<'a> {
    OutPort(&'a str),
    NmeaSource(bool),
    GpsNmeaType(u8),
    GlonassNmeaType(u8),
    GalileoNmeaType(u8),
    BeidouNmeaType(u8),
    GnssConfig(u8),
    OdpControl(u8),
    DpoEnable(u8),
    GsvExtNmeaType(u8),
    Plane(u8),
    AutoGps(bool),
    SuplVersion(u8),
    AgpsPosMode(u32),
    AgnssProtocol(u16, u16),
    FixFrequency(u8),
}

impl fmt::Display for GpsOption<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OutPort(port) => write!(f, "\"outport\",\"{}\"", port),
            Self::NmeaSource(on) => write!(f, "\"nmeasrc\",{}", u8::from(on)),
            Self::GpsNmeaType(v) => write!(f, "\"gpsnmeatype\",{}", v),
            Self::GlonassNmeaType(v) => write!(f, "\"glonassnmeatype\",{}", v),
            Self::GalileoNmeaType(v) => write!(f, "\"galileonmeatype\",{}", v),
            Self::BeidouNmeaType(v) => write!(f, "\"beidounmeatype\",{}", v),
            Self::GnssConfig(v) => write!(f, "\"gnssconfig\",{}", v),
            Self::OdpControl(v) => write!(f, "\"odpcontrol\",{}", v),
            Self::DpoEnable(v) => write!(f, "\"dpoenable\",{}", v),
            Self::GsvExtNmeaType(v) => write!(f, "\"gsvextnmeatype\",{}", v),
            Self::Plane(v) => write!(f, "\"plane\",{}", v),
            Self::AutoGps(on) => write!(f, "\"autogps\",{}", u8::from(on)),
            Self::SuplVersion(v) => write!(f, "\"suplver\",{}", v),
            Self::AgpsPosMode(v) => write!(f, "\"agpsposmode\",{}", v),
            Self::AgnssProtocol(a, b) => write!(f, "\"agnssprotocol\",{},{}", a, b),
            Self::FixFrequency(v) => write!(f, "\"fixfreq\",{}", v),
        }
    }
}

const DEFAULT_OPTIONS: [GpsOption<'static>; 16] = [
    GpsOption::OutPort("usbnmea"),
    GpsOption::NmeaSource(true),
    GpsOption::GpsNmeaType(0x1F),
    GpsOption::GlonassNmeaType(0),
    GpsOption::GalileoNmeaType(0),
    GpsOption::BeidouNmeaType(0),
    GpsOption::GnssConfig(1),
    GpsOption::OdpControl(0),
    GpsOption::DpoEnable(2),
    GpsOption::GsvExtNmeaType(0),
    GpsOption::Plane(0),
    GpsOption::AutoGps(false),
    GpsOption::SuplVersion(2),
    GpsOption::AgpsPosMode(0x01FE_FF7F),
    GpsOption::AgnssProtocol(0x03, 0x0507),
    GpsOption::FixFrequency(1),
];

const SUPL_SERVER: &str = "supl.google.com:7276";

pub struct GpsState<'a> {
    pub(crate) status: Flags<GpsStatus>,
    pub(crate) events: Flags<GpsEvent>,
    buffer: Option<RingBuffer<'a>>,
}

impl<'a> GpsState<'a> {
    pub(crate) fn new() -> Self {
        Self {
            status: Flags::new(),
            events: Flags::new(),
            buffer: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status.clear();
        self.events.clear();
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
    }
}

impl<L: Listener> Shared<'_, L> {
    /// `+QGPSGNMEA: <sentence>`
    pub(crate) fn route_gps(&mut self, line: &str) -> bool {
        let Some(sentence) = line.strip_prefix("+QGPSGNMEA: ") else {
            return false;
        };
        let Some(buffer) = self.gps.buffer.as_mut() else {
            trace!("[GPS] no buffer, sentence dropped");
            return true;
        };
        // whole records only
        if buffer.window() < sentence.len() + 1 {
            warn!("[GPS] buffer full, sentence dropped");
            return true;
        }
        buffer.enqueue_slice(sentence.as_bytes());
        buffer.enqueue_slice(b"\n");
        self.gps.events.insert(GpsEvent::NmeaAvailable);
        true
    }

    fn deliver_nmea(&mut self) {
        let Shared { gps, listener, .. } = self;
        let Some(buffer) = gps.buffer.as_mut() else {
            return;
        };
        let mut sentence = [0u8; NMEA_MAX_LEN];
        while let Some(n) = buffer.dequeue_line(&mut sentence) {
            match core::str::from_utf8(&sentence[..n]) {
                Ok(text) => listener.gps_nmea(text),
                Err(_) => warn!("[GPS] non-text sentence dropped"),
            }
        }
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    pub(crate) fn activate_gps(&mut self, mode: GpsMode) -> Result<(), Error> {
        self.exec(format_args!("AT+QGPS={}", mode as u8))?;
        self.handler().gps.status.insert(GpsStatus::Active);
        Ok(())
    }

    /// Stop the engine if the module reports it running. An unanswered state
    /// query counts as stopped.
    pub(crate) fn deactivate_gps(&mut self) -> Result<(), Error> {
        let running = self
            .query(format_args!("AT+QGPS?"), "+QGPS", module_timing::gps_query())
            .ok()
            .and_then(|row| parse_field::<u8>(&row, 0).ok())
            == Some(1);
        if running {
            self.exec(format_args!("AT+QGPSEND"))?;
        }
        self.handler().gps.status.remove(GpsStatus::Active);
        Ok(())
    }

    pub(crate) fn configure_gps(&mut self, option: GpsOption<'_>) -> Result<(), Error> {
        self.exec(format_args!("AT+QGPSCFG={}", option))
    }

    pub(crate) fn acquire_nmea(&mut self, kind: &str) -> Result<(), Error> {
        self.exec(format_args!("AT+QGPSGNMEA=\"{}\"", kind))
    }

    /// Raw `+QGPSLOC` payload in `<UTC>,<lat>,<lon>,...` form.
    pub(crate) fn gps_location(&mut self) -> Result<Row, Error> {
        self.query(format_args!("AT+QGPSLOC=2"), "+QGPSLOC", module_timing::gps_query())
    }

    /// Drop the stored assistance data.
    pub(crate) fn delete_gps_assist(&mut self) -> Result<(), Error> {
        self.exec(format_args!("AT+QGPSDEL=3"))
    }

    fn apply_gps_defaults(&mut self) {
        for option in DEFAULT_OPTIONS {
            if let Err(e) = self.configure_gps(option) {
                warn!("[GPS] {} not applied: {:?}", option, e);
            }
        }
        if let Err(e) = self.exec(format_args!("AT+QGPSSUPLURL=\"{}\"", SUPL_SERVER)) {
            warn!("[GPS] SUPL server not set: {:?}", e);
        }
    }

    fn start_gps(&mut self) -> Result<(), Error> {
        self.deactivate_gps()?;
        self.apply_gps_defaults();
        self.activate_gps(GpsMode::MsBased)
    }

    pub(crate) fn handle_gps(&mut self) {
        let now = self.now();
        let shared = self.handler();

        let online = shared.status.contains(CoreStatus::Active);
        #[cfg(feature = "net")]
        let online = online && shared.net.status.contains(NetStatus::Open);

        let active = shared.gps.status.contains(GpsStatus::Active);
        if online && !active && shared.scheduler.is_expired(TimerId::GpsNmea, now) {
            if let Err(e) = self.start_gps() {
                self.housekeeping_failed("GPS start", e);
                self.handler().scheduler.arm(TimerId::GpsNmea, now);
            }
        }

        let shared = self.handler();
        if shared.gps.status.contains(GpsStatus::Active) && shared.scheduler.is_expired(TimerId::GpsNmea, now) {
            shared.scheduler.arm(TimerId::GpsNmea, now);
            for kind in NMEA_KINDS {
                if let Err(e) = self.acquire_nmea(kind) {
                    self.housekeeping_failed("NMEA request", e);
                }
            }
        }

        let shared = self.handler();
        if shared.gps.events.take(GpsEvent::NmeaAvailable) {
            shared.deliver_nmea();
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
    /// Give the driver storage for queued sentences. Without it sentences
    /// are dropped as they arrive.
    pub fn gps_attach_buffer(&self, storage: &'a mut [u8]) -> Result<(), Error> {
        self.with_shared(|shared| shared.gps.buffer = Some(RingBuffer::new(storage)))
    }

    pub fn gps_activate(&self, mode: GpsMode) -> Result<(), Error> {
        self.transaction(|s| s.activate_gps(mode))
    }

    pub fn gps_deactivate(&self) -> Result<(), Error> {
        self.transaction(|s| s.deactivate_gps())
    }

    pub fn gps_configure(&self, option: GpsOption<'_>) -> Result<(), Error> {
        self.transaction(|s| s.configure_gps(option))
    }

    /// Request one sentence of `kind` (`"GGA"`, `"RMC"`, ...). It arrives
    /// through the listener.
    pub fn gps_acquire_nmea(&self, kind: &str) -> Result<(), Error> {
        self.transaction(|s| s.acquire_nmea(kind))
    }

    pub fn gps_location(&self) -> Result<Row, Error> {
        self.transaction(|s| s.gps_location())
    }

    pub fn gps_delete_assist(&self) -> Result<(), Error> {
        self.transaction(|s| s.delete_gps_assist())
    }

    pub fn gps_status(&self) -> Result<Flags<GpsStatus>, Error> {
        self.with_shared(|shared| shared.gps.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::tests::{modem, TestModem};
    use crate::test_helpers::{MockClock, MockTransport};
    use embassy_time::Duration;

    const GGA: &str = "$GPGGA,102030.00,5230.5000,N,01323.0000,E,1,08,0.9,35.0,M,44.0,M,,*4F";

    fn online_modem() -> (TestModem, MockTransport, MockClock) {
        let (modem, transport, clock) = modem();
        modem
            .with_shared(|s| {
                s.status.insert(CoreStatus::Active);
                #[cfg(feature = "net")]
                s.net.status.insert(NetStatus::Open);
            })
            .unwrap();
        (modem, transport, clock)
    }

    fn script_start(transport: &MockTransport) {
        transport.on("AT+QGPS?", "+QGPS: 1\r\n\r\nOK\r\n");
        transport.on("AT+QGPSEND", "OK\r\n");
        for _ in DEFAULT_OPTIONS {
            transport.on("AT+QGPSCFG", "OK\r\n");
        }
        transport.on("AT+QGPSSUPLURL", "OK\r\n");
        transport.on("AT+QGPS=2", "OK\r\n");
    }

    fn script_nmea_round(transport: &MockTransport) {
        for _ in NMEA_KINDS {
            transport.on("AT+QGPSGNMEA", "OK\r\n");
        }
    }

    #[test]
    fn engine_is_restarted_in_ms_based_mode() {
        let (modem, transport, _clock) = online_modem();
        script_start(&transport);
        script_nmea_round(&transport);

        modem.transaction(|s| Ok(s.handle_gps())).unwrap();

        let written = transport.written();
        assert_eq!(written[0], "AT+QGPS?\r\n");
        assert_eq!(written[1], "AT+QGPSEND\r\n");
        assert_eq!(written[2], "AT+QGPSCFG=\"outport\",\"usbnmea\"\r\n");
        assert_eq!(written[16], "AT+QGPSCFG=\"agnssprotocol\",3,1287\r\n");
        assert_eq!(written[18], "AT+QGPSSUPLURL=\"supl.google.com:7276\"\r\n");
        assert_eq!(written[19], "AT+QGPS=2\r\n");
        assert_eq!(written[20], "AT+QGPSGNMEA=\"GGA\"\r\n");
        assert_eq!(transport.sent("AT+QGPSGNMEA"), 6);
        assert!(modem.gps_status().unwrap().contains(GpsStatus::Active));
    }

    #[test]
    fn stopped_engine_is_not_ended() {
        let (modem, transport, _clock) = online_modem();
        transport.on("AT+QGPS?", "+QGPS: 0\r\n\r\nOK\r\n");
        modem.gps_deactivate().unwrap();
        assert_eq!(transport.sent("AT+QGPSEND"), 0);
    }

    #[test]
    fn nothing_happens_offline() {
        let (modem, transport, _clock) = modem();
        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert!(transport.written().is_empty());
    }

    #[test]
    fn refused_start_waits_for_interval() {
        let (modem, transport, clock) = online_modem();
        transport.on("AT+QGPS?", "+QGPS: 0\r\n\r\nOK\r\n");
        for _ in DEFAULT_OPTIONS {
            transport.on("AT+QGPSCFG", "OK\r\n");
        }
        transport.on("AT+QGPSSUPLURL", "OK\r\n");
        transport.on("AT+QGPS=2", "ERROR\r\n");

        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert!(modem.gps_status().unwrap().is_empty());
        assert_eq!(modem.errors().unwrap(), 1);

        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert_eq!(transport.sent("AT+QGPS?"), 1);

        clock.advance(Duration::from_secs(5));
        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert_eq!(transport.sent("AT+QGPS?"), 2);
    }

    #[test]
    fn sentences_are_requested_every_interval() {
        let (modem, transport, clock) = online_modem();
        modem.with_shared(|s| s.gps.status.insert(GpsStatus::Active)).unwrap();
        script_nmea_round(&transport);
        script_nmea_round(&transport);

        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        clock.advance(Duration::from_secs(4));
        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert_eq!(transport.sent("AT+QGPSGNMEA"), 6);

        clock.advance(Duration::from_secs(1));
        modem.transaction(|s| Ok(s.handle_gps())).unwrap();
        assert_eq!(transport.sent("AT+QGPSGNMEA"), 12);
    }

    #[test]
    fn sentences_reach_the_listener() {
        let (modem, transport, _clock) = modem();
        modem.gps_attach_buffer(std::vec![0u8; 256].leak()).unwrap();
        transport.push(&std::format!("+QGPSGNMEA: {}\r\n+QGPSGNMEA: $GPVTG,,T,,M,0.0,N,0.0,K,N*2C\r\n", GGA));

        modem
            .transaction(|s| {
                s.poll_urcs();
                s.handle_gps();
                Ok(())
            })
            .unwrap();

        modem
            .listener(|l| assert_eq!(l.nmea, [GGA, "$GPVTG,,T,,M,0.0,N,0.0,K,N*2C"]))
            .unwrap();
    }

    #[test]
    fn sentence_that_does_not_fit_is_dropped_whole() {
        let (modem, transport, _clock) = modem();
        modem.gps_attach_buffer(std::vec![0u8; 40].leak()).unwrap();
        transport.push(&std::format!("+QGPSGNMEA: {}\r\n+QGPSGNMEA: $GPGSA,A,1*1E\r\n", GGA));

        modem
            .transaction(|s| {
                s.poll_urcs();
                s.handle_gps();
                Ok(())
            })
            .unwrap();

        modem.listener(|l| assert_eq!(l.nmea, ["$GPGSA,A,1*1E"])).unwrap();
    }

    #[test]
    fn location_is_returned_raw() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QGPSLOC=2", "+QGPSLOC: 102030.0,52.50833,13.38333,0.9,35.0,3,0.0,0.0,0.0,170324,08\r\n\r\nOK\r\n");

        let location = modem.gps_location().unwrap();
        assert!(location.starts_with("102030.0,52.50833,13.38333"));
    }

    #[test]
    fn no_fix_is_an_error() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QGPSLOC=2", "+CME ERROR: 516\r\n");
        assert_eq!(modem.gps_location(), Err(Error::Error));
    }
}
