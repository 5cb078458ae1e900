//! The Receive Engine (spec §4.5): in-order reassembly, the out-of-order
//! queue, receiver-side silly-window-syndrome avoidance and the delayed-ACK
//! policy.
//!
//! Naive segment-text handling only ever deals with in-order bytes
//! (out-of-order segments are dropped on the floor); the out-of-order queue
//! and delayed-ACK timer here are additions on top of that, built from a
//! `VecDeque`-backed buffer and an `Option<Instant>` timer field.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::TcpConfig;

pub struct RecvEngine {
    pub nxt: u32,
    pub irs: u32,
    pub mss: u16,
    pub wscale: u8,
    capacity: usize,
    buffer: VecDeque<u8>,
    /// Segments that arrived ahead of `nxt`, keyed by starting sequence
    /// number, coalesced on insert where ranges overlap or touch.
    ooo: BTreeMap<u32, Vec<u8>>,
    delayed_ack_deadline: Option<Instant>,
    /// Set once a FIN has been accepted into sequence order; `nxt` then
    /// points one past the FIN's virtual byte.
    pub fin_seen: bool,
}

/// What the state machine should do after feeding a segment's text through
/// the receive engine.
pub struct Accepted {
    /// Whether any new in-order bytes (or the FIN) advanced `nxt`.
    pub advanced: bool,
    /// An ACK must go out right away: out-of-order data arrived, or this is
    /// the first bytes to ever arrive so the peer gets an immediate ACK
    /// before the delayed-ACK timer is armed for the rest.
    pub ack_now: bool,
}

impl RecvEngine {
    pub fn new(irs: u32, mss: u16, cfg: &TcpConfig) -> Self {
        RecvEngine {
            nxt: irs.wrapping_add(1),
            irs,
            mss,
            wscale: 0,
            capacity: cfg.default_recv_window as usize,
            buffer: VecDeque::new(),
            ooo: BTreeMap::new(),
            delayed_ack_deadline: None,
            fin_seen: false,
        }
    }

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// RFC 9293 §3.8.6.2.2 / spec §4.5 receiver's SWS avoidance: a non-zero
    /// window smaller than `min(MSS, capacity/2)` is never advertised —
    /// below that threshold the connection advertises 0 instead of a tiny
    /// increment, until free space clears the threshold again.
    pub fn advertised_window(&self) -> u32 {
        let free = self.free_space() as u32;
        let threshold = (self.mss as u32).min(self.capacity as u32 / 2);
        if free < threshold {
            0
        } else {
            free
        }
    }

    /// The window value to place in the outgoing header, right-shifted by
    /// our negotiated window-scale factor (never rounds up, so the peer
    /// never oversends).
    pub fn advertised_window_field(&self) -> u16 {
        let raw = self.advertised_window() >> self.wscale;
        raw.min(u16::MAX as u32) as u16
    }

    /// Accepts a segment's payload (plus whether it carried FIN) at
    /// `seg_seq`. Segments (or portions of them) at or after `nxt` are
    /// merged into the in-order buffer or the out-of-order queue as
    /// appropriate; bytes strictly before `nxt` (already delivered) are
    /// trimmed off first.
    pub fn accept(&mut self, seg_seq: u32, mut data: &[u8], fin: bool, now: Instant) -> Accepted {
        let mut accepted = Accepted {
            advanced: false,
            ack_now: false,
        };

        let mut seq = seg_seq;
        if super::wrapping_lt(seq, self.nxt) {
            let skip = self.nxt.wrapping_sub(seq) as usize;
            if skip >= data.len() {
                // Fully-duplicate retransmission; only the FIN (if any and
                // not yet seen) still matters.
                data = &[];
            } else {
                data = &data[skip..];
            }
            seq = self.nxt;
        }

        if seq == self.nxt && !data.is_empty() {
            let take = std::cmp::min(data.len(), self.free_space());
            self.buffer.extend(data[..take].iter());
            self.nxt = self.nxt.wrapping_add(take as u32);
            accepted.advanced = true;
            self.drain_ooo();
        } else if !data.is_empty() && super::wrapping_lt(self.nxt, seq) {
            self.insert_ooo(seq, data);
            accepted.ack_now = true;
        }

        if fin {
            let fin_seq = seg_seq.wrapping_add(data_len_before_trim(seg_seq, seq, data));
            if fin_seq == self.nxt && !self.fin_seen {
                self.fin_seen = true;
                self.nxt = self.nxt.wrapping_add(1);
                accepted.advanced = true;
                accepted.ack_now = true;
            }
        }

        if accepted.advanced && !accepted.ack_now {
            if self.delayed_ack_deadline.is_none() {
                accepted.ack_now = self.buffer.len() >= self.mss as usize;
            }
        }

        accepted
    }

    fn insert_ooo(&mut self, seq: u32, data: &[u8]) {
        self.ooo.entry(seq).or_insert_with(|| data.to_vec());
    }

    /// After in-order bytes advance `nxt`, pulls any now-contiguous segments
    /// out of the out-of-order queue.
    fn drain_ooo(&mut self) {
        loop {
            let Some((&seq, _)) = self.ooo.iter().find(|(&seq, _)| !super::wrapping_lt(self.nxt, seq)) else {
                break;
            };
            let data = self.ooo.remove(&seq).unwrap();
            if super::wrapping_lt(seq, self.nxt) {
                let skip = self.nxt.wrapping_sub(seq) as usize;
                if skip >= data.len() {
                    continue;
                }
                let take = std::cmp::min(data.len() - skip, self.free_space());
                self.buffer.extend(data[skip..skip + take].iter());
                self.nxt = self.nxt.wrapping_add(take as u32);
            } else {
                let take = std::cmp::min(data.len(), self.free_space());
                self.buffer.extend(data[..take].iter());
                self.nxt = self.nxt.wrapping_add(take as u32);
            }
        }
    }

    pub fn consume(&mut self, out: &mut [u8]) -> usize {
        let n = std::cmp::min(out.len(), self.buffer.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buffer.pop_front().unwrap();
        }
        n
    }

    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Arms the delayed-ACK timer (spec §4.5); a bare ACK is due once this
    /// deadline passes with nothing else having triggered one sooner.
    pub fn arm_delayed_ack(&mut self, now: Instant, cfg: &TcpConfig) {
        if self.delayed_ack_deadline.is_none() {
            self.delayed_ack_deadline = Some(now + cfg.delayed_ack);
        }
    }

    pub fn delayed_ack_due(&self, now: Instant) -> bool {
        self.delayed_ack_deadline.map_or(false, |d| now >= d)
    }

    pub fn disarm_delayed_ack(&mut self) {
        self.delayed_ack_deadline = None;
    }
}

fn data_len_before_trim(orig_seq: u32, trimmed_seq: u32, trimmed: &[u8]) -> u32 {
    trimmed.len() as u32 + trimmed_seq.wrapping_sub(orig_seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecvEngine {
        RecvEngine::new(99, 536, &TcpConfig::default())
    }

    #[test]
    fn in_order_bytes_advance_nxt_and_are_consumable() {
        let mut e = engine();
        let start = e.nxt;
        let accepted = e.accept(start, b"hello", false, Instant::now());
        assert!(accepted.advanced);
        let mut out = [0u8; 5];
        assert_eq!(e.consume(&mut out), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn out_of_order_segment_is_queued_then_merged_on_gap_fill() {
        let mut e = engine();
        let start = e.nxt;
        let later = e.accept(start.wrapping_add(5), b"world", false, Instant::now());
        assert!(!later.advanced);
        assert!(later.ack_now);

        let fill = e.accept(start, b"hello", false, Instant::now());
        assert!(fill.advanced);

        let mut out = [0u8; 10];
        assert_eq!(e.consume(&mut out), 10);
        assert_eq!(&out, b"helloworld");
    }

    #[test]
    fn duplicate_bytes_are_trimmed_not_double_delivered() {
        let mut e = engine();
        let start = e.nxt;
        e.accept(start, b"hello", false, Instant::now());
        let dup = e.accept(start, b"hello", false, Instant::now());
        assert!(!dup.advanced);
        let mut out = [0u8; 10];
        assert_eq!(e.consume(&mut out), 5);
    }

    /// Heap's algorithm, enumerating every permutation of `0..n` in place.
    /// A small deterministic shuffler, used in place of a `proptest`/
    /// `quickcheck` dependency this crate doesn't otherwise need.
    fn each_permutation(n: usize, mut visit: impl FnMut(&[usize])) {
        let mut items: Vec<usize> = (0..n).collect();
        let mut c = vec![0usize; n];
        visit(&items);
        let mut i = 0;
        while i < n {
            if c[i] < i {
                if i % 2 == 0 {
                    items.swap(0, i);
                } else {
                    items.swap(c[i], i);
                }
                visit(&items);
                c[i] += 1;
                i = 0;
            } else {
                c[i] = 0;
                i += 1;
            }
        }
    }

    /// Testable properties 1–2 (ordering, no-duplicate-delivery): split a
    /// byte stream into fixed-size chunks, feed them to a fresh engine in
    /// every possible arrival order (including a repeated chunk standing in
    /// for a retransmission), and check the delivered bytes are always
    /// exactly the original stream, once each, in order.
    #[test]
    fn arbitrary_arrival_order_yields_in_order_no_duplicate_delivery() {
        let payload = b"HelloWorldTcp!!!";
        let chunk_len = 4;
        let chunks: Vec<(u32, &[u8])> = payload
            .chunks(chunk_len)
            .enumerate()
            .map(|(i, c)| ((i * chunk_len) as u32, c))
            .collect();

        let base = 1u32;
        each_permutation(chunks.len(), |order| {
            let mut e = RecvEngine::new(base.wrapping_sub(1), 536, &TcpConfig::default());
            let now = Instant::now();

            // Deliver in this permutation's order, then once more as a
            // retransmission of the first chunk in the order, exercising
            // "no duplicate delivery ... under arbitrary retransmission".
            for &idx in order {
                let (offset, data) = chunks[idx];
                e.accept(base.wrapping_add(offset), data, false, now);
            }
            let (offset, data) = chunks[order[0]];
            e.accept(base.wrapping_add(offset), data, false, now);

            let mut out = vec![0u8; payload.len()];
            let n = e.consume(&mut out);
            assert_eq!(n, payload.len(), "order {:?} did not fully reassemble", order);
            assert_eq!(&out[..n], &payload[..], "order {:?} misordered or duplicated bytes", order);

            let mut trailing = [0u8; 1];
            assert_eq!(e.consume(&mut trailing), 0, "no extra bytes beyond the original stream");
        });
    }
}
