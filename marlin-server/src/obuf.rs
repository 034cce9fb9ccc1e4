//! Output buffer.
//!
//! A single-producer (TX) / single-consumer (NET) segment list gated by a
//! commit savepoint. Three monotone byte positions:
//!
//! - `staged` advances when a finalized response is appended (by TX for
//!   handler replies, by NET for decode errors). A response is staged as
//!   one segment, so partially built replies are never visible.
//! - `wend` is the commit savepoint: NET advances it to a message's
//!   post-TX `write_end` when the message completes its round trip. Only
//!   bytes below `wend` may be drained, which couples every retirement
//!   with freshly flushable output.
//! - `wpos` advances as bytes leave the socket.
//!
//! `staged > 0` means "written since the last reset": the rotation policy
//! uses it to decide whether a buffer pair can be reused. Resetting
//! requires a fully drained buffer and rewinds all positions to zero.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    segments: VecDeque<Bytes>,
    /// Drained bytes within the head segment.
    head_off: usize,
    staged: u64,
    wend: u64,
    wpos: u64,
}

#[derive(Default)]
pub(crate) struct Obuf {
    inner: Mutex<Inner>,
}

impl Obuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finalized response and returns the new staged end, the
    /// `write_end` savepoint its message carries back to NET.
    pub fn append(&self, segment: Bytes) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if !segment.is_empty() {
            inner.staged += segment.len() as u64;
            inner.segments.push_back(segment);
        }
        inner.staged
    }

    /// Appends and commits in one step: the NET-side path for decode
    /// errors answered without a TX round trip.
    pub fn append_committed(&self, segment: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        if !segment.is_empty() {
            inner.staged += segment.len() as u64;
            inner.segments.push_back(segment);
        }
        inner.wend = inner.staged;
    }

    /// Advances the commit savepoint to `write_end`. Savepoints are
    /// monotone; a NET-side error reply may already have committed past an
    /// older one.
    pub fn advance_wend(&self, write_end: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(write_end <= inner.staged);
        inner.wend = inner.wend.max(write_end);
    }

    /// Total bytes appended since the last reset, committed or not.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().staged
    }

    /// Committed bytes not yet drained.
    pub fn pending(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.wend - inner.wpos
    }

    /// Snapshots up to `max` committed, undrained slices for a vectored
    /// write. Staged bytes past the savepoint never leave the buffer.
    pub fn drain_slices(&self, max: usize) -> Vec<Bytes> {
        let inner = self.inner.lock().unwrap();
        let mut budget = (inner.wend - inner.wpos) as usize;
        let mut slices = Vec::with_capacity(inner.segments.len().min(max));
        for (i, segment) in inner.segments.iter().take(max).enumerate() {
            if budget == 0 {
                break;
            }
            let skip = if i == 0 { inner.head_off } else { 0 };
            let take = (segment.len() - skip).min(budget);
            slices.push(segment.slice(skip..skip + take));
            budget -= take;
        }
        slices
    }

    /// Records `n` bytes written to the socket, releasing fully drained
    /// segments.
    pub fn advance(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.wpos += n as u64;
        debug_assert!(inner.wpos <= inner.wend);
        let mut remaining = n;
        while remaining > 0 {
            let head_len = inner.segments[0].len() - inner.head_off;
            if remaining >= head_len {
                remaining -= head_len;
                inner.segments.pop_front();
                inner.head_off = 0;
            } else {
                inner.head_off += remaining;
                remaining = 0;
            }
        }
    }

    /// Rewinds all positions to zero. Only legal once everything staged
    /// has been committed and drained.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.staged, inner.wend);
        debug_assert_eq!(inner.wend, inner.wpos);
        inner.segments.clear();
        inner.head_off = 0;
        inner.staged = 0;
        inner.wend = 0;
        inner.wpos = 0;
    }

    /// Teardown: releases everything, drained or not. Responses queued for
    /// a closed connection are simply discarded.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.segments.clear();
        inner.head_off = 0;
        inner.staged = 0;
        inner.wend = 0;
        inner.wpos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_stages_without_committing() {
        let obuf = Obuf::new();
        let end = obuf.append(Bytes::from_static(b"hello"));
        assert_eq!(end, 5);
        assert_eq!(obuf.size(), 5);
        // Not committed: nothing to drain yet.
        assert_eq!(obuf.pending(), 0);
        assert!(obuf.drain_slices(16).is_empty());

        obuf.advance_wend(end);
        assert_eq!(obuf.pending(), 5);
    }

    #[test]
    fn test_empty_append_is_ignored() {
        let obuf = Obuf::new();
        assert_eq!(obuf.append(Bytes::new()), 0);
        assert_eq!(obuf.size(), 0);
    }

    #[test]
    fn test_savepoint_gates_draining() {
        let obuf = Obuf::new();
        let first = obuf.append(Bytes::from_static(b"abc"));
        obuf.append(Bytes::from_static(b"def"));
        obuf.advance_wend(first);

        let slices = obuf.drain_slices(16);
        let flat: Vec<u8> = slices.iter().flat_map(|b| b.to_vec()).collect();
        // Only the committed response is visible.
        assert_eq!(flat, b"abc");
    }

    #[test]
    fn test_savepoints_are_monotone() {
        let obuf = Obuf::new();
        let first = obuf.append(Bytes::from_static(b"abc"));
        obuf.append_committed(Bytes::from_static(b"def"));
        assert_eq!(obuf.pending(), 6);
        // A completion carrying the older savepoint cannot regress it.
        obuf.advance_wend(first);
        assert_eq!(obuf.pending(), 6);
    }

    #[test]
    fn test_drain_in_order_across_segments() {
        let obuf = Obuf::new();
        obuf.append_committed(Bytes::from_static(b"abc"));
        obuf.append_committed(Bytes::from_static(b"def"));

        let slices = obuf.drain_slices(16);
        let flat: Vec<u8> = slices.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(flat, b"abcdef");

        obuf.advance(4);
        let slices = obuf.drain_slices(16);
        assert_eq!(&slices[0][..], b"ef");
    }

    #[test]
    fn test_partial_drain_slices_head() {
        let obuf = Obuf::new();
        obuf.append_committed(Bytes::from_static(b"abcdef"));
        obuf.advance(2);
        assert_eq!(obuf.pending(), 4);

        let slices = obuf.drain_slices(16);
        assert_eq!(&slices[0][..], b"cdef");

        obuf.advance(4);
        assert_eq!(obuf.pending(), 0);
        // Fully drained but not reset: still non-empty for rotation.
        assert_eq!(obuf.size(), 6);
    }

    #[test]
    fn test_reset() {
        let obuf = Obuf::new();
        obuf.append_committed(Bytes::from_static(b"abc"));
        obuf.advance(3);
        obuf.reset();
        assert_eq!(obuf.size(), 0);
        assert_eq!(obuf.pending(), 0);
        assert!(obuf.drain_slices(16).is_empty());
    }

    #[test]
    fn test_clear_discards_undrained_output() {
        let obuf = Obuf::new();
        obuf.append_committed(Bytes::from_static(b"abc"));
        obuf.append(Bytes::from_static(b"staged"));
        obuf.clear();
        assert_eq!(obuf.size(), 0);
        assert_eq!(obuf.pending(), 0);
    }
}
