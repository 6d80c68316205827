use core::cmp;

/// A byte ring buffer over caller-provided storage.
///
/// Socket receive buffers and the GPS sentence buffer are both this type; the
/// storage stays owned by the caller and is only borrowed for `'a`.
///
/// All slice accessors hand out the largest *contiguous* region, so filling or
/// draining a wrapped buffer takes two calls. `enqueue_slice` and
/// `dequeue_slice` do that for you.
#[derive(Debug)]
pub struct RingBuffer<'a> {
    storage: &'a mut [u8],
    read_at: usize,
    length: usize,
}

impl<'a> RingBuffer<'a> {
    pub fn new(storage: &'a mut [u8]) -> RingBuffer<'a> {
        RingBuffer {
            storage,
            read_at: 0,
            length: 0,
        }
    }

    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    /// Number of bytes that can still be added.
    pub fn window(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Largest number of bytes that can be added without wrapping.
    pub fn contiguous_window(&self) -> usize {
        cmp::min(self.window(), self.capacity() - self.get_idx(self.length))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.window() == 0
    }

    fn get_idx(&self, idx: usize) -> usize {
        let len = self.capacity();
        if len > 0 {
            (self.read_at + idx) % len
        } else {
            0
        }
    }

    /// Call `f` with the largest contiguous free region and commit the amount
    /// it reports as written.
    ///
    /// # Panics
    /// If `f` reports more bytes than the region it was given.
    pub fn enqueue_many_with<'b, R, F>(&'b mut self, f: F) -> (usize, R)
    where
        F: FnOnce(&'b mut [u8]) -> (usize, R),
    {
        if self.length == 0 {
            // Empty ring; restart at zero for the longest contiguous run.
            self.read_at = 0;
        }

        let write_at = self.get_idx(self.length);
        let max_size = self.contiguous_window();
        let (size, result) = f(&mut self.storage[write_at..write_at + max_size]);
        assert!(size <= max_size);
        self.length += size;
        (size, result)
    }

    /// Copy as much of `data` as fits, returning the number of bytes taken.
    pub fn enqueue_slice(&mut self, data: &[u8]) -> usize {
        let (size_1, data) = self.enqueue_many_with(|buf| {
            let size = cmp::min(buf.len(), data.len());
            buf[..size].copy_from_slice(&data[..size]);
            (size, &data[size..])
        });
        let (size_2, ()) = self.enqueue_many_with(|buf| {
            let size = cmp::min(buf.len(), data.len());
            buf[..size].copy_from_slice(&data[..size]);
            (size, ())
        });
        size_1 + size_2
    }

    /// Call `f` with the largest contiguous filled region and release the
    /// amount it reports as consumed.
    ///
    /// # Panics
    /// If `f` reports more bytes than the region it was given.
    pub fn dequeue_many_with<'b, R, F>(&'b mut self, f: F) -> (usize, R)
    where
        F: FnOnce(&'b mut [u8]) -> (usize, R),
    {
        let capacity = self.capacity();
        let max_size = cmp::min(self.len(), capacity - self.read_at);
        let (size, result) = f(&mut self.storage[self.read_at..self.read_at + max_size]);
        assert!(size <= max_size);
        self.read_at = if capacity > 0 {
            (self.read_at + size) % capacity
        } else {
            0
        };
        self.length -= size;
        (size, result)
    }

    /// Move as many bytes as fit into `data`, returning the count.
    pub fn dequeue_slice(&mut self, data: &mut [u8]) -> usize {
        let (size_1, data) = self.dequeue_many_with(|buf| {
            let size = cmp::min(buf.len(), data.len());
            data[..size].copy_from_slice(&buf[..size]);
            (size, &mut data[size..])
        });
        let (size_2, ()) = self.dequeue_many_with(|buf| {
            let size = cmp::min(buf.len(), data.len());
            data[..size].copy_from_slice(&buf[..size]);
            (size, ())
        });
        size_1 + size_2
    }

    /// Drain one `\n`-terminated record into `out`, without the terminator.
    ///
    /// Returns `None` while no complete record is buffered. Records longer
    /// than `out` are cut.
    pub fn dequeue_line(&mut self, out: &mut [u8]) -> Option<usize> {
        let end = (0..self.length).find(|&i| self.storage[self.get_idx(i)] == b'\n')?;
        let mut n = 0;
        for i in 0..end {
            let b = self.storage[self.get_idx(i)];
            if n < out.len() && b != b'\r' {
                out[n] = b;
                n += 1;
            }
        }
        self.read_at = self.get_idx(end + 1);
        self.length -= end + 1;
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_storage_end() {
        let mut storage = [0u8; 8];
        let mut ring = RingBuffer::new(&mut storage);

        assert_eq!(ring.enqueue_slice(b"abcdef"), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.dequeue_slice(&mut out), 4);
        assert_eq!(&out, b"abcd");

        // 2 bytes left at the end of storage, the rest wraps to the front
        assert_eq!(ring.enqueue_slice(b"ghijkl"), 6);
        assert!(ring.is_full());
        assert_eq!(ring.enqueue_slice(b"x"), 0);

        let mut out = [0u8; 8];
        assert_eq!(ring.dequeue_slice(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
        assert!(ring.is_empty());
    }

    #[test]
    fn dequeue_line_waits_for_terminator() {
        let mut storage = [0u8; 32];
        let mut ring = RingBuffer::new(&mut storage);
        ring.enqueue_slice(b"$GPGGA,1\r\n$GPRMC");

        let mut out = [0u8; 16];
        assert_eq!(ring.dequeue_line(&mut out), Some(8));
        assert_eq!(&out[..8], b"$GPGGA,1");
        assert_eq!(ring.dequeue_line(&mut out), None);
        assert_eq!(ring.len(), 6);
    }
}
