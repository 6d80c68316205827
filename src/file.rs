//! Module file system: UFS, RAM disk and SD card.
//!
//! Bulk transfers use `CONNECT` framing: after the prompt the exact number of
//! raw bytes follows, with no line structure until the count is met.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;
use heapless::String;

use crate::engine::{parse_field, ResponseMode, Row};
use crate::error::Error;
use crate::listener::Listener;
use crate::modem::{Modem, Tx};
use crate::module_timing;
use crate::transport::{Clock, Transport};

/// Upload chunk size; the module acknowledges each full chunk with `A`.
const UPLOAD_CHUNK: usize = 1024;
/// `<timeout>` argument of `AT+QFUPL`, in seconds.
const UPLOAD_TIMEOUT_S: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Storage {
    Ufs,
    Ram,
    Sd,
}

impl Storage {
    fn prefix(self) -> &'static str {
        match self {
            Self::Ufs => "",
            Self::Ram => "RAM:",
            Self::Sd => "SD:",
        }
    }
}

/// An open file on the module.
///
/// `length` is what the module reported at open time, updated by every
/// write; reads stop once `position` reaches it.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct File {
    handle: u32,
    length: u32,
    position: u32,
}

impl File {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn position(&self) -> u32 {
        self.position
    }
}

impl<T: Transport, C: Clock, L: Listener> Tx<'_, '_, T, C, L> {
    fn wait_connect(&mut self) -> Result<Row, Error> {
        let mut rest = Row::new();
        self.wait_for_line("CONNECT", &mut rest, module_timing::connect_prompt())
            .into_result()?;
        Ok(rest)
    }

    /// Returns the size the module stored.
    pub(crate) fn upload_file(&mut self, storage: Storage, name: &str, data: &[u8]) -> Result<usize, Error> {
        self.send_command(format_args!(
            "AT+QFUPL=\"{}{}\",{},{},1",
            storage.prefix(),
            name,
            data.len(),
            UPLOAD_TIMEOUT_S
        ))?;
        self.wait_connect()?;

        let mut ack = String::<4>::new();
        for chunk in data.chunks(UPLOAD_CHUNK) {
            self.send_data(chunk)?;
            if chunk.len() == UPLOAD_CHUNK {
                self.wait_for_line("A", &mut ack, module_timing::connect_prompt())
                    .into_result()?;
            }
        }

        let mut payload = Row::new();
        self.get_response(Some("+QFUPL"), &mut payload, ResponseMode::WaitOk, module_timing::connect_prompt())
            .into_result()?;
        Ok(parse_field(&payload, 0)?)
    }

    /// Open `name`, creating it if absent.
    pub(crate) fn open_file(&mut self, storage: Storage, name: &str) -> Result<File, Error> {
        let prefix = storage.prefix();

        // a file that does not exist yet lists as an error
        let length = self
            .query(format_args!("AT+QFLST=\"{}{}\"", prefix, name), "+QFLST", Duration::from_ticks(0))
            .ok()
            .and_then(|row| parse_field::<u32>(&row, 1).ok())
            .unwrap_or(0);

        let row = self.query(format_args!("AT+QFOPEN=\"{}{}\",0", prefix, name), "+QFOPEN", Duration::from_ticks(0))?;
        Ok(File {
            handle: parse_field(&row, 0)?,
            length,
            position: 0,
        })
    }

    /// Returns the number of bytes written.
    pub(crate) fn write_file(&mut self, file: &mut File, data: &[u8]) -> Result<usize, Error> {
        self.send_command(format_args!("AT+QFWRITE={},{}", file.handle, data.len()))?;
        self.wait_connect()?;
        self.send_data(data)?;

        let mut payload = Row::new();
        self.get_response(Some("+QFWRITE"), &mut payload, ResponseMode::WaitOk, Duration::from_ticks(0))
            .into_result()?;
        let written: u32 = parse_field(&payload, 0)?;
        file.length = parse_field(&payload, 1)?;
        file.position += written;
        Ok(written as usize)
    }

    /// Read from the current position. Returns 0 at the end of the file.
    pub(crate) fn read_file(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize, Error> {
        if file.position >= file.length || buf.is_empty() {
            return Ok(0);
        }

        self.send_command(format_args!("AT+QFREAD={},{}", file.handle, buf.len()))?;
        let rest = self.wait_connect()?;
        let available: usize = parse_field(&rest, 0)?;

        let want = available.min(buf.len());
        let n = self.read_data(&mut buf[..want], module_timing::receive_payload());
        self.expect_ok(Duration::from_ticks(0)).into_result()?;
        if n < want {
            return Err(Error::Timeout);
        }
        file.position += n as u32;
        Ok(n)
    }

    pub(crate) fn seek_file(&mut self, file: &mut File, offset: u32) -> Result<(), Error> {
        self.exec(format_args!("AT+QFSEEK={},{},0", file.handle, offset))?;
        file.position = offset;
        Ok(())
    }

    pub(crate) fn close_file(&mut self, file: File) -> Result<(), Error> {
        self.exec(format_args!("AT+QFCLOSE={}", file.handle))
    }

    pub(crate) fn delete_file(&mut self, storage: Storage, name: &str) -> Result<(), Error> {
        self.exec(format_args!("AT+QFDEL=\"{}{}\"", storage.prefix(), name))
    }
}

impl<'a, T, C, L, M> Modem<'a, T, C, L, M>
where
    T: Transport,
    C: Clock,
    L: Listener,
    M: RawMutex,
{
    /// Store `data` as `name`, replacing any existing file.
    pub fn file_upload(&self, storage: Storage, name: &str, data: &[u8]) -> Result<usize, Error> {
        self.transaction(|s| s.upload_file(storage, name, data))
    }

    pub fn file_open(&self, storage: Storage, name: &str) -> Result<File, Error> {
        self.transaction(|s| s.open_file(storage, name))
    }

    pub fn file_write(&self, file: &mut File, data: &[u8]) -> Result<usize, Error> {
        self.transaction(|s| s.write_file(file, data))
    }

    pub fn file_read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize, Error> {
        self.transaction(|s| s.read_file(file, buf))
    }

    pub fn file_seek(&self, file: &mut File, offset: u32) -> Result<(), Error> {
        self.transaction(|s| s.seek_file(file, offset))
    }

    pub fn file_close(&self, file: File) -> Result<(), Error> {
        self.transaction(|s| s.close_file(file))
    }

    pub fn file_delete(&self, storage: Storage, name: &str) -> Result<(), Error> {
        self.transaction(|s| s.delete_file(storage, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::tests::modem;

    #[test]
    fn upload_waits_for_chunk_acks() {
        let (modem, transport, _clock) = modem();
        let data = [0x5au8; 1500];
        transport.on("AT+QFUPL", "CONNECT\r\n");
        transport.on("ZZZZ", "A\r\n");
        transport.on("ZZZZ", "+QFUPL: 1500,3a2f\r\n\r\nOK\r\n");

        assert_eq!(modem.file_upload(Storage::Ufs, "cfg.bin", &data), Ok(1500));

        let written = transport.written();
        assert_eq!(written[0], "AT+QFUPL=\"cfg.bin\",1500,60,1\r\n");
        assert_eq!(written[1].len(), 1024);
        assert_eq!(written[2].len(), 476);
    }

    #[test]
    fn upload_without_prompt_sends_no_data() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFUPL", "+CME ERROR: 407\r\n");

        assert_eq!(modem.file_upload(Storage::Sd, "log.txt", b"x"), Err(Error::Error));
        assert_eq!(transport.written(), ["AT+QFUPL=\"SD:log.txt\",1,60,1\r\n"]);
    }

    #[test]
    fn open_reads_length_then_handle() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFLST", "+QFLST: \"RAM:body.http\",120\r\n\r\nOK\r\n");
        transport.on("AT+QFOPEN", "+QFOPEN: 1027\r\n\r\nOK\r\n");

        let file = modem.file_open(Storage::Ram, "body.http").unwrap();

        assert_eq!(file.handle(), 1027);
        assert_eq!(file.length(), 120);
        assert_eq!(
            transport.written(),
            ["AT+QFLST=\"RAM:body.http\"\r\n", "AT+QFOPEN=\"RAM:body.http\",0\r\n"]
        );
    }

    #[test]
    fn new_file_opens_empty() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFLST", "+CME ERROR: 405\r\n");
        transport.on("AT+QFOPEN", "+QFOPEN: 3\r\n\r\nOK\r\n");

        let mut file = modem.file_open(Storage::Ufs, "new.txt").unwrap();
        assert_eq!(file.length(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(modem.file_read(&mut file, &mut buf), Ok(0));
        assert_eq!(transport.sent("AT+QFREAD"), 0);
    }

    #[test]
    fn write_updates_length() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFLST", "ERROR\r\n");
        transport.on("AT+QFOPEN", "+QFOPEN: 3\r\n\r\nOK\r\n");
        transport.on("AT+QFWRITE", "CONNECT\r\n");
        transport.on("hello", "+QFWRITE: 5,5\r\n\r\nOK\r\n");

        let mut file = modem.file_open(Storage::Ufs, "new.txt").unwrap();
        assert_eq!(modem.file_write(&mut file, b"hello"), Ok(5));
        assert_eq!(file.length(), 5);
        assert_eq!(file.position(), 5);
        assert_eq!(transport.sent("AT+QFWRITE=3,5"), 1);
    }

    #[test]
    fn read_takes_announced_bytes() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFLST", "+QFLST: \"a.txt\",11\r\n\r\nOK\r\n");
        transport.on("AT+QFOPEN", "+QFOPEN: 1\r\n\r\nOK\r\n");
        transport.on("AT+QFREAD", "CONNECT 8\r\nhello wo\r\nOK\r\n");
        transport.on("AT+QFREAD", "CONNECT 3\r\nrld\r\nOK\r\n");

        let mut file = modem.file_open(Storage::Ufs, "a.txt").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(modem.file_read(&mut file, &mut buf), Ok(8));
        assert_eq!(&buf, b"hello wo");
        assert_eq!(modem.file_read(&mut file, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"rld");

        // end of file, nothing sent
        assert_eq!(modem.file_read(&mut file, &mut buf), Ok(0));
        assert_eq!(transport.sent("AT+QFREAD=1,8"), 2);
    }

    #[test]
    fn seek_close_delete() {
        let (modem, transport, _clock) = modem();
        transport.on("AT+QFLST", "+QFLST: \"a.txt\",11\r\n\r\nOK\r\n");
        transport.on("AT+QFOPEN", "+QFOPEN: 1\r\n\r\nOK\r\n");
        transport.on("AT+QFSEEK", "OK\r\n");
        transport.on("AT+QFCLOSE", "OK\r\n");
        transport.on("AT+QFDEL", "OK\r\n");

        let mut file = modem.file_open(Storage::Ufs, "a.txt").unwrap();
        modem.file_seek(&mut file, 6).unwrap();
        assert_eq!(file.position(), 6);
        modem.file_close(file).unwrap();
        modem.file_delete(Storage::Ufs, "a.txt").unwrap();

        assert_eq!(
            &transport.written()[2..],
            ["AT+QFSEEK=1,6,0\r\n", "AT+QFCLOSE=1\r\n", "AT+QFDEL=\"a.txt\"\r\n"]
        );
    }
}
