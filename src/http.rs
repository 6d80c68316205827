//! HTTP GET through the module's own client.
//!
//! The response is stored by the module in a temporary RAM file, which is
//! then streamed back through [`crate::file`] and deleted.

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};
use heapless::String;

use crate::engine::{parse_field, ResponseMode, Row};
use crate::error::Error;
use crate::event::{flags, Flags};
use crate::file::{File, Storage};
use crate::listener::Listener;
use crate::modem::{Modem, Shared, Tx};
use crate::module_timing;
use crate::transport::{Clock, Transport};

/// `<wait_time>` of `AT+QHTTPURL`, in seconds.
const URL_INPUT_TIME_S: u16 = 1000;
/// `<wait_time>` of `AT+QHTTPREADFILE`, in seconds.
const READ_FILE_TIME_S: u16 = 60;

flags! {
    pub enum HttpStatus {
        Requesting = 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HttpOption<'a> {
    ContextId(u8),
    RequestHeader(bool),
    ResponseHeader(bool),
    SslContextId(u8),
    ContentType(u8),
    ResponseOutputAuto(bool),
    ClosedIndication(bool),
    WindowSize(u16),
    CloseWaitTime(u16),
    /// `"<user>:<password>"`.
    Auth(&'a str),
    CustomHeader(&'a str),
}

impl fmt::Display for HttpOption<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ContextId(v) => write!(f, "\"contextid\",{}", v),
            Self::RequestHeader(on) => write!(f, "\"requestheader\",{}", u8::from(on)),
            Self::ResponseHeader(on) => write!(f, "\"responseheader\",{}", u8::from(on)),
            Self::SslContextId(v) => write!(f, "\"sslctxid\",{}", v),
            Self::ContentType(v) => write!(f, "\"contenttype\",{}", v),
            Self::ResponseOutputAuto(on) => write!(f, "\"rspout/auto\",{}", u8::from(on)),
            Self::ClosedIndication(on) => write!(f, "\"closed/ind\",{}", u8::from(on)),
            Self::WindowSize(v) => write!(f, "\"windowsize\",{}", v),
            Self::CloseWaitTime(v) => write!(f, "\"closewaittime\",{}", v),
            Self::Auth(v) => write!(f, "\"auth\",\"{}\"", v),
            Self::CustomHeader(v) => write!(f, "\"custom_header\",\"{}\"", v),
        }
    }
}

/// Applied before every request; the context id follows them.
const DEFAULT_OPTIONS: [HttpOption<'static>; 4] = [
    HttpOption::RequestHeader(false),
    HttpOption::ResponseHeader(true),
    HttpOption::ResponseOutputAuto(false),
    HttpOption::ClosedIndication(false),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HttpResponse {
    /// HTTP status code.
    pub code: u16,
    pub content_length: u32,
}

/// Bookkeeping for the single request the module can run.
///
/// A request whose reply wait timed out is still running on the module. It
/// stays marked as requesting until its late reply is routed here or its
/// timeout budget has passed once more; until then new requests get
/// [`Error::Busy`].
pub struct HttpState {
    pub(crate) status: Flags<HttpStatus>,
    outstanding_until: Option<Instant>,
    tmp_counter: u16,
}

impl HttpState {
    pub(crate) fn new() -> Self {
        Self {
            status: Flags::new(),
            outstanding_until: None,
            tmp_counter: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status.clear();
        self.outstanding_until = None;
    }

    fn is_busy(&self, now: Instant) -> bool {
        self.status.contains(HttpStatus::Requesting)
            && self.outstanding_until.map(|until| now < until).unwrap_or(false)
    }

    fn finish(&mut self) {
        self.status.remove(HttpStatus::Requesting);
        self.outstanding_until = None;
    }
}

impl<L: Listener> Shared<'_, L> {
    /// Late `+QHTTPGET` / `+QHTTPREADFILE` replies of a request that was
    /// already given up on.
    pub(crate) fn route_http(&mut self, line: &str) -> bool {
        if !(line.starts_with("+QHTTPGET:") || line.starts_with("+QHTTPREADFILE:")) {
            return false;
        }
        debug!("[HTTP] late reply: {}", line);
        self.http.finish();
        true
    }
}

/// Finds the blank line that ends a response header, across reads.
#[derive(Default)]
struct HeaderEnd {
    matched: u8,
}

impl HeaderEnd {
    /// Offset just past the header end within `chunk`, if it is there.
    fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        const END: &[u8] = b"\r\n\r\n";
        for (i, &b) in chunk.iter().enumerate() {
            self.matched = if b == END[usize::from(self.matched)] {
                self.matched + 1
            } else if b == b'\r' {
                1
            } else {
                0
            };
            if usize::from(self.matched) == END.len() {
                return Some(i + 1);
            }
        }
        None
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    pub(crate) fn configure_http(&mut self, option: HttpOption<'_>) -> Result<(), Error> {
        self.exec(format_args!("AT+QHTTPCFG={}", option))
    }

    pub(crate) fn stop_http(&mut self) -> Result<(), Error> {
        self.exec(format_args!("AT+QHTTPSTOP"))
    }

    /// Fetch `url` and stream its body through `reader`, one `buf`-sized
    /// chunk at a time. An empty `buf` skips the body.
    pub(crate) fn http_get(
        &mut self,
        url: &str,
        buf: &mut [u8],
        timeout: Duration,
        reader: &mut dyn FnMut(&[u8], u32),
    ) -> Result<HttpResponse, Error> {
        let now = self.now();
        if self.handler().http.is_busy(now) {
            return Err(Error::Busy);
        }

        let http = &mut self.handler().http;
        http.status.insert(HttpStatus::Requesting);
        http.tmp_counter = http.tmp_counter.wrapping_add(1);
        let mut name = String::<24>::new();
        fmt::Write::write_fmt(&mut name, format_args!("tmp{}.http", http.tmp_counter))?;

        let response = match self.request(url, &name, timeout) {
            Ok(response) => response,
            Err(e) => {
                if e == Error::Timeout {
                    let until = self.now() + timeout;
                    self.handler().http.outstanding_until = Some(until);
                } else {
                    self.handler().http.finish();
                }
                self.stop_http().ok();
                return Err(e);
            }
        };
        self.stop_http().ok();
        self.handler().http.finish();

        if !buf.is_empty() {
            let mut file = self.open_file(Storage::Ram, &name)?;
            let streamed = self.stream_body(&mut file, buf, response.content_length, reader);
            let closed = self.close_file(file);
            streamed.and(closed)?;
        }
        self.delete_file(Storage::Ram, &name)?;
        Ok(response)
    }

    fn request(&mut self, url: &str, file_name: &str, timeout: Duration) -> Result<HttpResponse, Error> {
        self.stop_http().ok();
        for option in DEFAULT_OPTIONS {
            if let Err(e) = self.configure_http(option) {
                warn!("[HTTP] {} not applied: {:?}", option, e);
            }
        }
        let context_id = self.handler().net.context_id;
        self.configure_http(HttpOption::ContextId(context_id))?;

        self.send_command(format_args!("AT+QHTTPURL={},{}", url.len(), URL_INPUT_TIME_S))?;
        let mut rest = Row::new();
        self.wait_for_line("CONNECT", &mut rest, module_timing::connect_prompt())
            .into_result()?;
        self.send_data(url.as_bytes())?;
        self.expect_ok(Duration::from_ticks(0)).into_result()?;

        self.exec(format_args!("AT+QHTTPGET={}", timeout.as_secs()))?;
        let mut payload = Row::new();
        self.get_response(Some("+QHTTPGET"), &mut payload, ResponseMode::OnlyData, timeout)
            .into_result()?;
        let err: u16 = parse_field(&payload, 0)?;
        if err != 0 {
            debug!("[HTTP] GET error {}", err);
            return Err(Error::Error);
        }
        let response = HttpResponse {
            code: parse_field(&payload, 1)?,
            content_length: parse_field(&payload, 2).unwrap_or(0),
        };
        debug!("[HTTP] {} bytes, status {}", response.content_length, response.code);

        self.exec(format_args!("AT+QHTTPREADFILE=\"RAM:{}\",{}", file_name, READ_FILE_TIME_S))?;
        self.get_response(
            Some("+QHTTPREADFILE"),
            &mut payload,
            ResponseMode::OnlyData,
            Duration::from_secs(READ_FILE_TIME_S.into()),
        )
        .into_result()?;
        if parse_field::<u16>(&payload, 0)? != 0 {
            return Err(Error::Error);
        }
        Ok(response)
    }

    fn stream_body(
        &mut self,
        file: &mut File,
        buf: &mut [u8],
        content_length: u32,
        reader: &mut dyn FnMut(&[u8], u32),
    ) -> Result<(), Error> {
        let mut header = HeaderEnd::default();
        let mut offset = 0u32;
        loop {
            let n = self.read_file(file, buf)?;
            if n == 0 {
                break;
            }
            if let Some(end) = header.feed(&buf[..n]) {
                self.seek_file(file, offset + end as u32)?;
                break;
            }
            offset += n as u32;
        }

        let mut total = 0u32;
        loop {
            let n = self.read_file(file, buf)?;
            if n == 0 {
                break;
            }
            reader(&buf[..n], content_length);
            total += n as u32;
            if total >= content_length {
                break;
            }
        }
        Ok(())
    }
}

impl<'a, T, C, L, M> Modem<'a, T, C, L, M>
where
    T: Transport,
    C: Clock,
    L: Listener,
    M: RawMutex,
{
    /// GET `url`, handing the body to `reader` as `(chunk, content_length)`.
    ///
    /// The whole exchange, body included, runs as one transaction: `reader`
    /// must not call back into the modem.
    pub fn http_get(
        &self,
        url: &str,
        buf: &mut [u8],
        timeout: Duration,
        mut reader: impl FnMut(&[u8], u32),
    ) -> Result<HttpResponse, Error> {
        self.transaction(|s| s.http_get(url, buf, timeout, &mut reader))
    }

    pub fn http_configure(&self, option: HttpOption<'_>) -> Result<(), Error> {
        self.transaction(|s| s.configure_http(option))
    }

    pub fn http_stop(&self) -> Result<(), Error> {
        self.transaction(|s| s.stop_http())
    }

    pub fn http_status(&self) -> Result<Flags<HttpStatus>, Error> {
        self.with_shared(|shared| shared.http.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::tests::{modem, TestModem};
    use crate::test_helpers::MockTransport;
    use std::vec::Vec;

    const BODY_FILE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";

    fn script_request(transport: &MockTransport, url: &str, get_reply: &str) {
        transport.on("AT+QHTTPSTOP", "OK\r\n");
        for _ in 0..5 {
            transport.on("AT+QHTTPCFG", "OK\r\n");
        }
        transport.on("AT+QHTTPURL", "CONNECT\r\n");
        transport.on(url, "OK\r\n");
        transport.on("AT+QHTTPGET", get_reply);
    }

    fn script_body(transport: &MockTransport) {
        transport.on("AT+QHTTPREADFILE", "OK\r\n\r\n+QHTTPREADFILE: 0\r\n");
        transport.on("AT+QHTTPSTOP", "OK\r\n");
        transport.on(
            "AT+QFLST",
            &std::format!("+QFLST: \"RAM:tmp1.http\",{}\r\n\r\nOK\r\n", BODY_FILE.len()),
        );
        transport.on("AT+QFOPEN", "+QFOPEN: 2\r\n\r\nOK\r\n");
        // header, read in 16-byte steps
        for chunk in BODY_FILE.as_bytes()[..48].chunks(16) {
            let chunk = core::str::from_utf8(chunk).unwrap();
            transport.on("AT+QFREAD", &std::format!("CONNECT 16\r\n{}\r\nOK\r\n", chunk));
        }
        transport.on("AT+QFSEEK=2,39,0", "OK\r\n");
        transport.on("AT+QFREAD", "CONNECT 11\r\nhello world\r\nOK\r\n");
        transport.on("AT+QFCLOSE=2", "OK\r\n");
        transport.on("AT+QFDEL", "OK\r\n");
    }

    fn get(modem: &TestModem, buf: &mut [u8]) -> (Result<HttpResponse, Error>, Vec<u8>) {
        let mut body = Vec::new();
        let result = modem.http_get("http://example.com/", buf, Duration::from_secs(10), |chunk, _| {
            body.extend_from_slice(chunk)
        });
        (result, body)
    }

    #[test]
    fn body_is_streamed_without_header() {
        let (modem, transport, _clock) = modem();
        script_request(&transport, "http://example.com/", "OK\r\n\r\n+QHTTPGET: 0,200,11\r\n");
        script_body(&transport);

        let mut buf = [0u8; 16];
        let (result, body) = get(&modem, &mut buf);

        assert_eq!(
            result,
            Ok(HttpResponse {
                code: 200,
                content_length: 11
            })
        );
        assert_eq!(body, b"hello world");
        assert_eq!(transport.pending_replies(), 0);
        assert!(modem.http_status().unwrap().is_empty());
    }

    #[test]
    fn request_is_configured_and_framed() {
        let (modem, transport, _clock) = modem();
        script_request(&transport, "http://example.com/", "OK\r\n\r\n+QHTTPGET: 0,204,0\r\n");
        transport.on("AT+QHTTPREADFILE", "OK\r\n\r\n+QHTTPREADFILE: 0\r\n");
        transport.on("AT+QFDEL", "OK\r\n");

        let (result, body) = get(&modem, &mut []);

        assert_eq!(result.unwrap().code, 204);
        assert!(body.is_empty());
        let written = transport.written();
        assert_eq!(
            &written[..8],
            [
                "AT+QHTTPSTOP\r\n",
                "AT+QHTTPCFG=\"requestheader\",0\r\n",
                "AT+QHTTPCFG=\"responseheader\",1\r\n",
                "AT+QHTTPCFG=\"rspout/auto\",0\r\n",
                "AT+QHTTPCFG=\"closed/ind\",0\r\n",
                "AT+QHTTPCFG=\"contextid\",0\r\n",
                "AT+QHTTPURL=19,1000\r\n",
                "http://example.com/",
            ]
        );
        assert_eq!(written[8], "AT+QHTTPGET=10\r\n");
        assert_eq!(written[9], "AT+QHTTPREADFILE=\"RAM:tmp1.http\",60\r\n");
        assert_eq!(transport.sent("AT+QFDEL=\"RAM:tmp1.http\""), 1);
    }

    #[test]
    fn server_error_stops_request() {
        let (modem, transport, _clock) = modem();
        script_request(&transport, "http://example.com/", "OK\r\n\r\n+QHTTPGET: 701\r\n");
        transport.on("AT+QHTTPSTOP", "OK\r\n");

        let (result, _) = get(&modem, &mut []);

        assert_eq!(result, Err(Error::Error));
        assert_eq!(transport.sent("AT+QHTTPREADFILE"), 0);
        assert_eq!(transport.sent("AT+QHTTPSTOP"), 2);
        assert!(modem.http_status().unwrap().is_empty());
    }

    #[test]
    fn timed_out_request_blocks_the_next_until_its_reply() {
        let (modem, transport, _clock) = modem();
        script_request(&transport, "http://example.com/", "OK\r\n");
        transport.on("AT+QHTTPSTOP", "OK\r\n");

        let (result, _) = get(&modem, &mut []);
        assert_eq!(result, Err(Error::Timeout));
        assert!(modem.http_status().unwrap().contains(HttpStatus::Requesting));

        let (result, _) = get(&modem, &mut []);
        assert_eq!(result, Err(Error::Busy));

        transport.push("+QHTTPGET: 0,200,11\r\n");
        modem.transaction(|s| Ok(s.poll_urcs())).unwrap();
        assert!(modem.http_status().unwrap().is_empty());
    }

    #[test]
    fn outstanding_mark_expires() {
        let (modem, transport, clock) = modem();
        script_request(&transport, "http://example.com/", "OK\r\n");
        transport.on("AT+QHTTPSTOP", "OK\r\n");
        let (result, _) = get(&modem, &mut []);
        assert_eq!(result, Err(Error::Timeout));

        clock.advance(Duration::from_secs(10));
        transport.clear_written();
        let (result, _) = get(&modem, &mut []);
        // not busy any more; the request itself goes out again
        assert_ne!(result, Err(Error::Busy));
        assert_eq!(transport.sent("AT+QHTTPSTOP"), 2);
    }

    #[test]
    fn options_render_their_keys() {
        let mut s = String::<64>::new();
        fmt::Write::write_fmt(&mut s, format_args!("{}", HttpOption::Auth("user:pass"))).unwrap();
        assert_eq!(s, "\"auth\",\"user:pass\"");
        s.clear();
        fmt::Write::write_fmt(&mut s, format_args!("{}", HttpOption::WindowSize(2048))).unwrap();
        assert_eq!(s, "\"windowsize\",2048");
    }

    #[test]
    fn header_end_is_found_across_chunks() {
        let mut end = HeaderEnd::default();
        assert_eq!(end.feed(b"Server: x\r\n\r"), None);
        assert_eq!(end.feed(b"\nbody"), Some(1));

        let mut end = HeaderEnd::default();
        assert_eq!(end.feed(b"A: b\r\r\n\r\nrest"), Some(9));
    }
}
