//! Input buffer.
//!
//! A growable byte buffer with a read position and a write position:
//!
//! ```text
//!                  rpos             wpos        capacity
//! +------------------|----------------|-------------+
//! \________/\________/\_______/\______/
//!   retired requests   in-flight  unparsed tail
//! ```
//!
//! Bytes between `rpos` and `wpos` belong to in-flight requests (plus the
//! unparsed tail tracked separately by the connection). `rpos` advances as
//! requests retire; the buffer may only be rewound to offset zero once
//! `used()` drops to zero.

pub(crate) struct Ibuf {
    buf: Vec<u8>,
    rpos: usize,
    wpos: usize,
    readahead: usize,
}

impl Ibuf {
    pub fn new(readahead: usize) -> Self {
        Self {
            buf: vec![0; readahead],
            rpos: 0,
            wpos: 0,
            readahead,
        }
    }

    /// Bytes held by in-flight or unparsed requests.
    pub fn used(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Spare room after the write position.
    pub fn unused(&self) -> usize {
        self.buf.len() - self.wpos
    }

    /// Offset of the write position from the start of the buffer.
    pub fn pos(&self) -> usize {
        self.wpos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Ensures at least `extra` spare bytes, growing the buffer in place.
    /// Buffered data is never moved, so positions stay valid.
    pub fn reserve(&mut self, extra: usize) {
        let need = self.wpos + extra;
        if need > self.buf.len() {
            self.buf.resize(need.next_power_of_two(), 0);
        }
    }

    /// Spare room as a writable slice.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.wpos..]
    }

    /// The last `len` bytes before the write position (the unparsed tail).
    pub fn tail(&self, len: usize) -> &[u8] {
        &self.buf[self.wpos - len..self.wpos]
    }

    pub fn advance_wpos(&mut self, n: usize) {
        self.wpos += n;
        debug_assert!(self.wpos <= self.buf.len());
    }

    /// Retires `n` bytes of parsed requests.
    pub fn advance_rpos(&mut self, n: usize) {
        self.rpos += n;
        debug_assert!(self.rpos <= self.wpos);
    }

    /// Truncates `n` unparsed bytes off the end.
    pub fn rewind_wpos(&mut self, n: usize) {
        debug_assert!(self.wpos - n >= self.rpos);
        self.wpos -= n;
    }

    /// Appends bytes (used when the unparsed tail moves between buffers).
    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.buf[self.wpos..self.wpos + data.len()].copy_from_slice(data);
        self.wpos += data.len();
    }

    /// Rewinds to offset zero. Only legal when nothing is in flight; an
    /// oversized buffer is shrunk back to the readahead size.
    pub fn reset(&mut self, max_capacity: usize) {
        debug_assert_eq!(self.used(), 0);
        self.rpos = 0;
        self.wpos = 0;
        if self.buf.len() > max_capacity {
            self.buf = vec![0; self.readahead];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions() {
        let mut ibuf = Ibuf::new(64);
        assert_eq!(ibuf.used(), 0);
        assert_eq!(ibuf.unused(), 64);

        ibuf.spare_mut()[..5].copy_from_slice(b"hello");
        ibuf.advance_wpos(5);
        assert_eq!(ibuf.used(), 5);
        assert_eq!(ibuf.pos(), 5);
        assert_eq!(ibuf.tail(5), b"hello");

        ibuf.advance_rpos(5);
        assert_eq!(ibuf.used(), 0);
    }

    #[test]
    fn test_reserve_grows_without_moving_data() {
        let mut ibuf = Ibuf::new(8);
        ibuf.append(b"abcdefgh");
        ibuf.reserve(100);
        assert!(ibuf.unused() >= 100);
        assert_eq!(ibuf.tail(8), b"abcdefgh");
    }

    #[test]
    fn test_rewind_truncates_tail() {
        let mut ibuf = Ibuf::new(16);
        ibuf.append(b"abcdef");
        ibuf.rewind_wpos(2);
        assert_eq!(ibuf.used(), 4);
        assert_eq!(ibuf.tail(4), b"abcd");
    }

    #[test]
    fn test_reset_shrinks_oversized_buffer() {
        let mut ibuf = Ibuf::new(16);
        ibuf.reserve(4096);
        assert!(ibuf.capacity() >= 4096);
        ibuf.reset(1024);
        assert_eq!(ibuf.capacity(), 16);
        assert_eq!(ibuf.pos(), 0);

        // Within the limit the capacity is kept.
        let mut ibuf = Ibuf::new(16);
        ibuf.reserve(512);
        ibuf.reset(1024);
        assert!(ibuf.capacity() >= 512);
    }
}
