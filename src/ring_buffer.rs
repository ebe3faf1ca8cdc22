//! A fixed-capacity ring buffer with sticky half-close tracking, used to pump
//! bytes between a client connection and its backend without an intermediate
//! copy loop per direction.
//!
//! This mirrors the original implementation's `Buffer` state machine:
//! `start`/`end` track the occupied region, `eof` records that the read side
//! has seen end-of-stream, and `shut_rd`/`shut_wr` record that we have
//! already propagated a shutdown in that direction so it is only ever done
//! once.

const CAPACITY: usize = 16 * 1024;

pub struct RingBuffer {
    data: Box<[u8; CAPACITY]>,
    start: usize,
    end: usize,
    /// The read side has observed EOF; no more bytes will ever arrive.
    eof: bool,
    /// We have already shut down (or observed shutdown of) the read side.
    shut_rd: bool,
    /// We have already shut down (or observed shutdown of) the write side.
    shut_wr: bool,
}

impl RingBuffer {
    pub fn new() -> Self {
        RingBuffer {
            data: Box::new([0u8; CAPACITY]),
            start: 0,
            end: 0,
            eof: false,
            shut_rd: false,
            shut_wr: false,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn free_space(&self) -> usize {
        CAPACITY - self.len()
    }

    /// Occupied bytes, ready to be written to the destination.
    pub fn occupied(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Free region at the tail of the buffer, ready to be filled by a read.
    /// The buffer is compacted to the front on every read, so this is always
    /// a single contiguous slice rather than a true wraparound ring.
    pub fn free_mut(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.end..]
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    pub fn mark_filled(&mut self, n: usize) {
        debug_assert!(n <= self.free_space());
        self.end += n;
    }

    pub fn mark_consumed(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn set_shut_rd(&mut self) {
        self.shut_rd = true;
    }

    pub fn set_shut_wr(&mut self) {
        self.shut_wr = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_shut_rd(&self) -> bool {
        self.shut_rd
    }

    pub fn is_shut_wr(&self) -> bool {
        self.shut_wr
    }

    /// There is room to read more bytes in, and the read side hasn't hit EOF
    /// or already been shut down.
    pub fn can_read(&self) -> bool {
        !self.eof && !self.shut_rd && self.free_space() > 0
    }

    /// There are bytes queued to write out, or EOF has been reached and we
    /// still need to propagate the shutdown once.
    pub fn can_write(&self) -> bool {
        !self.is_empty() || (self.eof && !self.shut_wr)
    }

    /// EOF has drained and the write-shutdown has not yet been issued.
    pub fn needs_shut_wr(&self) -> bool {
        self.eof && self.is_empty() && !self.shut_wr
    }

    /// The destination closed its read side (we observed a write error /
    /// peer shutdown) and we haven't propagated that back to our source yet.
    pub fn needs_shut_rd(&self) -> bool {
        self.shut_wr && !self.shut_rd && self.is_empty()
    }

    /// This half of the pipe still has work to do: either direction has not
    /// reached a fully shut-down, drained state.
    pub fn alive(&self) -> bool {
        !(self.eof && self.is_empty() && self.shut_wr)
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_can_read_and_cannot_write() {
        let buf = RingBuffer::new();
        assert!(buf.can_read());
        assert!(!buf.can_write());
        assert!(buf.alive());
    }

    #[test]
    fn fill_then_consume_roundtrip() {
        let mut buf = RingBuffer::new();
        let slice = buf.free_mut();
        slice[..5].copy_from_slice(b"hello");
        buf.mark_filled(5);
        assert_eq!(buf.occupied(), b"hello");
        assert!(buf.can_write());
        buf.mark_consumed(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_with_empty_buffer_needs_shut_wr_then_alive_goes_false() {
        let mut buf = RingBuffer::new();
        buf.mark_eof();
        assert!(buf.needs_shut_wr());
        assert!(buf.alive());
        buf.set_shut_wr();
        assert!(!buf.needs_shut_wr());
        assert!(!buf.alive());
    }

    #[test]
    fn eof_with_pending_bytes_does_not_need_shut_wr_yet() {
        let mut buf = RingBuffer::new();
        let slice = buf.free_mut();
        slice[..3].copy_from_slice(b"abc");
        buf.mark_filled(3);
        buf.mark_eof();
        assert!(!buf.needs_shut_wr());
        assert!(buf.can_write());
        buf.mark_consumed(3);
        assert!(buf.needs_shut_wr());
    }

    #[test]
    fn shut_wr_without_shut_rd_on_empty_buffer_needs_shut_rd() {
        let mut buf = RingBuffer::new();
        buf.set_shut_wr();
        assert!(buf.needs_shut_rd());
        buf.set_shut_rd();
        assert!(!buf.needs_shut_rd());
    }

    #[test]
    fn compaction_preserves_occupied_bytes() {
        let mut buf = RingBuffer::new();
        let slice = buf.free_mut();
        slice[..4].copy_from_slice(b"data");
        buf.mark_filled(4);
        buf.mark_consumed(2);
        assert_eq!(buf.occupied(), b"ta");
        let slice = buf.free_mut();
        slice[..2].copy_from_slice(b"xy");
        buf.mark_filled(2);
        assert_eq!(buf.occupied(), b"taxy");
    }
}
