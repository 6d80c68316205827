use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;

use crate::ring_buffer::RingBuffer;

/// Half-duplex byte channel to the modem.
///
/// The driver only ever observes the channel through these polling calls;
/// any interrupt or DMA assistance is private to the implementation.
pub trait Transport {
    /// Whether unread bytes are waiting.
    fn is_available(&mut self) -> bool;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for them.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> usize;

    /// Read one line into `buf`, without the line terminator.
    ///
    /// Returns the number of bytes stored, `0` when no line arrived in time or
    /// the line was blank. The whole line is consumed either way; lines
    /// longer than `buf` are cut at `buf.len()`.
    fn read_line(&mut self, buf: &mut [u8], timeout: Duration) -> usize;

    /// Push back the `len` most recently read bytes so they are read again.
    fn unread(&mut self, len: usize);

    /// Write `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Move up to `len` bytes straight from the channel into `sink`.
    fn forward(&mut self, sink: &mut RingBuffer<'_>, len: usize, timeout: Duration) -> usize {
        let mut forwarded = 0;
        let mut chunk = [0u8; 64];
        while forwarded < len && sink.window() > 0 {
            let want = (len - forwarded).min(chunk.len()).min(sink.window());
            let n = self.read(&mut chunk[..want], timeout);
            if n == 0 {
                break;
            }
            forwarded += sink.enqueue_slice(&chunk[..n]);
        }
        forwarded
    }
}

/// Platform tick source.
///
/// `now` must be monotonic. The delay half is used by the blocking helpers
/// such as [`Modem::wait_online`](crate::Modem).
pub trait Clock: DelayNs {
    fn now(&mut self) -> Instant;
}
