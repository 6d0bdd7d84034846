//! Power-of-two circular buffer backing each connection's outbound side.
//!
//! Length is derived from `head - tail` so it cannot drift from the actual
//! contents. Two limits shape backpressure: above the soft limit droppable
//! writes fail with `WouldBlock`, above the hard limit every write fails
//! with `OutOfMemory`.

use std::io::{self, IoSlice};

/// Smallest allocation.
const MIN_SIZE: usize = 4096;

/// Soft limit - droppable (QoS 0) writes above this return WouldBlock.
pub const SOFT_LIMIT: usize = 1024 * 1024;

/// Hard cap - all writes above this return OutOfMemory.
pub const MAX_SIZE: usize = 16 * 1024 * 1024;

pub struct WriteBuffer {
    /// Storage, None while empty (no allocation until first write).
    buf: Option<Box<[u8]>>,
    /// Write position (unbounded, wraps naturally).
    head: usize,
    /// Read position (unbounded, wraps naturally).
    tail: usize,
    /// Two consecutive idle observations are required before shrinking,
    /// so bursty traffic does not thrash the allocator.
    shrink_primed: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: None,
            head: 0,
            tail: 0,
            shrink_primed: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    #[inline]
    fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Two slices for vectored I/O; the second is empty unless the data wraps.
    #[inline]
    pub fn as_io_slices(&self) -> [IoSlice<'_>; 2] {
        let Some(buf) = &self.buf else {
            return [IoSlice::new(&[]), IoSlice::new(&[])];
        };

        let len = self.len();
        if len == 0 {
            return [IoSlice::new(&[]), IoSlice::new(&[])];
        }

        let cap = buf.len();
        let tail_pos = self.tail & (cap - 1);
        let to_end = cap - tail_pos;

        if len <= to_end {
            [
                IoSlice::new(&buf[tail_pos..tail_pos + len]),
                IoSlice::new(&[]),
            ]
        } else {
            [
                IoSlice::new(&buf[tail_pos..]),
                IoSlice::new(&buf[..len - to_end]),
            ]
        }
    }

    /// Advance the read position after a successful socket write.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.tail = self.tail.wrapping_add(n);

        // Reset positions when drained to maximize contiguous space
        if self.is_empty() {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Write bytes, growing as needed. Fails with WouldBlock above the soft
    /// limit so droppable traffic backs off.
    #[inline]
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_inner(data, true)
    }

    /// Write bytes bypassing the soft limit. Only the hard cap applies.
    /// For acks and QoS 1/2 deliveries that must not be dropped.
    #[inline]
    pub fn write_bytes_guaranteed(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_inner(data, false)
    }

    fn write_inner(&mut self, data: &[u8], enforce_soft_limit: bool) -> io::Result<()> {
        self.ensure_space(data.len(), enforce_soft_limit)?;

        let buf = self.buf.as_mut().expect("ensure_space allocates");
        let cap = buf.len();
        let head_pos = self.head & (cap - 1);

        let first = (cap - head_pos).min(data.len());
        buf[head_pos..head_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            buf[..rest].copy_from_slice(&data[first..]);
        }

        self.head = self.head.wrapping_add(data.len());
        Ok(())
    }

    fn ensure_space(&mut self, needed: usize, enforce_soft_limit: bool) -> io::Result<()> {
        if self.capacity() > 0 && self.free_space() >= needed {
            return Ok(());
        }

        let required = self
            .len()
            .checked_add(needed)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "size overflow"))?;
        let new_size = required
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX)
            .max(MIN_SIZE);

        if enforce_soft_limit && new_size > SOFT_LIMIT && self.capacity() < new_size {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "tx buffer soft limit reached",
            ));
        }

        if new_size > MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "tx buffer would exceed hard limit",
            ));
        }

        if self.buf.is_none() {
            self.buf = Some(vec![0u8; new_size].into_boxed_slice());
            return Ok(());
        }

        self.grow_to(new_size);
        Ok(())
    }

    /// Move contents into a buffer of `new_size`, unwrapping them.
    fn grow_to(&mut self, new_size: usize) {
        let len = self.len();
        let mut new_buf = vec![0u8; new_size].into_boxed_slice();

        if let Some(ref old) = self.buf {
            let cap = old.len();
            let tail_pos = self.tail & (cap - 1);
            let to_end = cap - tail_pos;

            if len <= to_end {
                new_buf[..len].copy_from_slice(&old[tail_pos..tail_pos + len]);
            } else {
                new_buf[..to_end].copy_from_slice(&old[tail_pos..]);
                new_buf[to_end..len].copy_from_slice(&old[..len - to_end]);
            }
        }

        self.buf = Some(new_buf);
        self.tail = 0;
        self.head = len;
    }

    /// Release or shrink an idle buffer. Requires two consecutive idle calls
    /// before acting; any traffic in between resets the primer.
    pub fn maybe_shrink(&mut self) {
        if self.buf.is_none() || !self.is_empty() {
            self.shrink_primed = false;
            return;
        }

        if !self.shrink_primed {
            self.shrink_primed = true;
            return;
        }
        self.shrink_primed = false;

        if self.capacity() <= MIN_SIZE * 16 {
            self.buf = None;
            self.head = 0;
            self.tail = 0;
        } else {
            self.grow_to(MIN_SIZE);
        }
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_consume() {
        let mut buf = WriteBuffer::new();
        assert!(buf.is_empty());

        buf.write_bytes(b"hello").unwrap();
        assert_eq!(buf.len(), 5);

        let slices = buf.as_io_slices();
        assert_eq!(&slices[0][..], b"hello");
        assert!(slices[1].is_empty());

        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_grows_preserving_contents() {
        let mut buf = WriteBuffer::new();
        let data = vec![0xA5u8; MIN_SIZE * 3];
        buf.write_bytes(&data).unwrap();
        assert!(buf.capacity() >= data.len());

        let slices = buf.as_io_slices();
        let mut collected = Vec::new();
        for s in &slices {
            collected.extend_from_slice(s);
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn test_wraparound_io_slices() {
        let mut buf = WriteBuffer::new();
        buf.write_bytes(&[1u8; 3000]).unwrap();
        buf.consume(2500);
        buf.write_bytes(&[2u8; 3000]).unwrap();

        let slices = buf.as_io_slices();
        let total: usize = slices.iter().map(|s| s.len()).sum();
        assert_eq!(total, buf.len());
    }

    #[test]
    fn test_soft_limit_would_block() {
        let mut buf = WriteBuffer::new();
        let chunk = vec![0u8; SOFT_LIMIT];
        buf.write_bytes(&chunk).unwrap();

        let err = buf.write_bytes(&chunk).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Guaranteed writes pass the soft limit
        buf.write_bytes_guaranteed(&[0u8; 1024]).unwrap();
    }

    #[test]
    fn test_hard_limit_out_of_memory() {
        let mut buf = WriteBuffer::new();
        let err = buf
            .write_bytes_guaranteed(&vec![0u8; MAX_SIZE + 1])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_shrink_hysteresis() {
        let mut buf = WriteBuffer::new();
        buf.write_bytes(&[0u8; 1000]).unwrap();
        buf.consume(1000);

        buf.maybe_shrink();
        assert!(buf.capacity() > 0); // primed only

        buf.maybe_shrink();
        assert_eq!(buf.capacity(), 0); // released

        // traffic resets the primer
        buf.write_bytes(&[0u8; 10]).unwrap();
        buf.maybe_shrink();
        buf.consume(10);
        buf.maybe_shrink();
        assert!(buf.capacity() > 0);
        buf.maybe_shrink();
        assert_eq!(buf.capacity(), 0);
    }
}
