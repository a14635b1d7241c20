//! Per-connection receive/send state machine.
//!
//! A `Handler` accumulates inbound bytes, lets a [`Policy`] turn them
//! into a response, and tracks partial-send progress so a reactor can
//! resume exactly where a would-block interrupted it. All state lives
//! here, never on the stack, so any number of readiness or completion
//! events can interleave.
//!
//! Invariants:
//! - `0 <= sent <= send.len()`
//! - `sending` implies the send buffer is non-empty
//! - once `has_response` latches, the send buffer and offset are only
//!   touched by `still_sending` until the response drains

use crate::pool::Reset;
use bytes::BytesMut;

/// Per-connection buffers and the sending latch.
#[derive(Debug, Default)]
pub struct Handler {
    recv: BytesMut,
    send: BytesMut,
    sent: usize,
    sending: bool,
}

impl Handler {
    /// Append inbound bytes in wire order.
    pub fn append_recv(&mut self, bytes: &[u8]) {
        self.recv.extend_from_slice(bytes);
    }

    /// Bytes received and not yet consumed by a policy.
    pub fn received(&self) -> &[u8] {
        &self.recv
    }

    /// Reference policy: move everything received into the send buffer.
    ///
    /// While a response is in flight the bytes stay parked in the
    /// receive buffer; the reactor re-runs the policy after the drain.
    pub fn reflect(&mut self) {
        if self.sending || self.recv.is_empty() {
            return;
        }
        self.send.extend_from_slice(&self.recv);
        self.recv.clear();
    }

    /// Latch the sending state. Returns `true` exactly once per
    /// response: on the transition into sending, and only when there is
    /// something to send. While a send is in flight this reports
    /// `false` so callers never double-arm or double-submit.
    pub fn has_response(&mut self) -> bool {
        if self.sending || self.send.is_empty() {
            return false;
        }
        self.sent = 0;
        self.sending = true;
        true
    }

    /// Whether a response is currently in flight.
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// The unsent window of the current response.
    pub fn pending(&self) -> &[u8] {
        &self.send[self.sent..]
    }

    /// Account for `n` bytes just transmitted. Returns `true` while
    /// bytes remain; on drain the buffers reset and it returns `false`.
    /// Calling with 0 after a drain is a no-op returning `false`.
    pub fn still_sending(&mut self, n: usize) -> bool {
        if !self.sending {
            self.sent = 0;
            return false;
        }
        self.sent = (self.sent + n).min(self.send.len());
        if self.sent >= self.send.len() {
            self.send.clear();
            self.sent = 0;
            self.sending = false;
            return false;
        }
        true
    }
}

impl Reset for Handler {
    fn reset(&mut self) {
        self.recv.clear();
        self.send.clear();
        self.sent = 0;
        self.sending = false;
    }
}

/// The processing step between receive and send, swappable per server.
pub trait Policy {
    /// Inspect the handler's received bytes and stage a response.
    fn process(&mut self, handler: &mut Handler);
}

/// Echo policy: the response is the bytes received, verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reflect;

impl Policy for Reflect {
    fn process(&mut self, handler: &mut Handler) {
        handler.reflect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reflect_moves_received_bytes() {
        let mut h = Handler::default();
        h.append_recv(b"hello");
        h.reflect();
        assert!(h.received().is_empty());
        assert!(h.has_response());
        assert_eq!(h.pending(), b"hello");
    }

    #[test]
    fn has_response_latches_once() {
        let mut h = Handler::default();
        h.append_recv(b"x");
        h.reflect();
        assert!(h.has_response());
        assert!(!h.has_response());
        assert!(h.is_sending());
    }

    #[test]
    fn has_response_is_false_for_empty_buffer() {
        let mut h = Handler::default();
        assert!(!h.has_response());
        assert!(!h.is_sending());
    }

    #[test]
    fn partial_sends_advance_monotonically() {
        let mut h = Handler::default();
        h.append_recv(b"abcdef");
        h.reflect();
        assert!(h.has_response());
        assert!(h.still_sending(2));
        assert_eq!(h.pending(), b"cdef");
        assert!(h.still_sending(0));
        assert_eq!(h.pending(), b"cdef");
        assert!(h.still_sending(3));
        assert_eq!(h.pending(), b"f");
        assert!(!h.still_sending(1));
        assert!(!h.is_sending());
        assert!(h.pending().is_empty());
    }

    #[test]
    fn still_sending_zero_after_drain_is_idempotent() {
        let mut h = Handler::default();
        h.append_recv(b"ab");
        h.reflect();
        assert!(h.has_response());
        assert!(!h.still_sending(2));
        assert!(!h.still_sending(0));
        assert!(!h.still_sending(0));
        assert!(!h.is_sending());
    }

    #[test]
    fn bytes_park_while_sending_and_surface_after_drain() {
        let mut h = Handler::default();
        h.append_recv(b"first");
        h.reflect();
        assert!(h.has_response());

        // Mid-send arrivals must not disturb the in-flight response.
        h.append_recv(b"second");
        h.reflect();
        assert_eq!(h.pending(), b"first");
        assert_eq!(h.received(), b"second");

        assert!(!h.still_sending(5));
        h.reflect();
        assert!(h.has_response());
        assert_eq!(h.pending(), b"second");
    }

    #[test]
    fn reset_restores_defaults() {
        let mut h = Handler::default();
        h.append_recv(b"data");
        h.reflect();
        h.has_response();
        h.still_sending(1);
        h.reset();
        assert!(h.received().is_empty());
        assert!(!h.is_sending());
        assert!(!h.has_response());
    }

    proptest! {
        #[test]
        fn reflect_concatenates_chunks(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let mut h = Handler::default();
            let mut expected = Vec::new();
            for chunk in &chunks {
                h.append_recv(chunk);
                expected.extend_from_slice(chunk);
            }
            h.reflect();
            if expected.is_empty() {
                prop_assert!(!h.has_response());
            } else {
                prop_assert!(h.has_response());
                prop_assert_eq!(h.pending(), &expected[..]);
            }
        }

        #[test]
        fn offset_is_monotone_until_drain(len in 1usize..512, steps in proptest::collection::vec(0usize..64, 1..32)) {
            let mut h = Handler::default();
            h.append_recv(&vec![7u8; len]);
            h.reflect();
            prop_assert!(h.has_response());
            let mut remaining = len;
            for n in steps {
                let before = h.pending().len();
                let more = h.still_sending(n);
                if !more {
                    remaining = 0;
                    break;
                }
                let after = h.pending().len();
                prop_assert!(after <= before);
                remaining = after;
            }
            prop_assert_eq!(remaining == 0, !h.is_sending());
        }
    }
}
