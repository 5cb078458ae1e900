//! The per-connection data model (spec §3) and the RFC 9293 State Machine
//! (spec §4.2) driving it. Sequence-space bookkeeping is handed off to
//! [`crate::tcp::send::SendEngine`] and [`crate::tcp::recv::RecvEngine`]
//! instead of inlining it, and to produce wire segments through
//! [`crate::tcp::codec`] instead of `etherparse`.

use std::time::Instant;

use log::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::tcp::codec::{Header, Options, Segment, TcpOption};
use crate::tcp::recv::RecvEngine;
use crate::tcp::send::{PersistOutcome, RetransmitOutcome, SendEngine};
use crate::tcp::{is_between_wrapped, wrapping_lt, Flags, Kind, Quad, State};

/// A header/options/payload triple ready for the IP sender (spec §1, §6);
/// the checksum is filled in by the IP layer, not here.
#[derive(Debug, Clone)]
pub struct OutSegment {
    pub header: Header,
    pub options: Options,
    pub payload: Vec<u8>,
}

/// Registry/listener/stream-level side effects the dispatch loop
/// (`NetStack`) must act on after a state transition (spec §4.1, §4.2).
#[derive(Debug, Default)]
pub struct Effects {
    /// The handshake completed: a blocked `accept`/`connect` should wake.
    pub established: bool,
    /// The peer refused the connection (RST during SYN_SENT).
    pub refused: bool,
    /// The connection is fully torn down and must be dropped from the
    /// registry (TIME_WAIT expiry, RST-driven abort, or both sides closed).
    pub remove: bool,
    pub wake_reader: bool,
    pub wake_writer: bool,
    pub wake_closer: bool,
    /// A fast retransmit fired on this transition (spec §4.4, third dup ACK).
    pub fast_retransmit: bool,
    /// The retransmission timer fired and resent a segment.
    pub retransmit: bool,
    /// The persist timer fired and sent a zero-window probe.
    pub persist_probe: bool,
}

impl Effects {
    fn wake_all(mut self) -> Self {
        self.wake_reader = true;
        self.wake_writer = true;
        self.wake_closer = true;
        self
    }
}

/// One TCP connection: four-tuple, state, send/receive sequence spaces and
/// buffers, and the per-connection timers spec §3 and §4 describe.
pub struct Tcb {
    pub quad: Quad,
    pub kind: Kind,
    pub state: State,
    pub send: SendEngine,
    pub recv: RecvEngine,
    peer_wscale: Option<u8>,
    time_wait_deadline: Option<Instant>,
    fin_wait2_deadline: Option<Instant>,
    pub reset: bool,
}

fn syn_options(mss: u16) -> Options {
    Options(vec![
        TcpOption::MaxSegmentSize(mss),
        TcpOption::WindowScale(0),
    ])
}

/// Left-shifts a raw wire window field by the peer's self-announced shift
/// (spec §3 "window-scale shift counts for each direction", GLOSSARY
/// "Window Scale"): each side scales only the window values *it* sends, by
/// the shift *it* advertised in its own SYN, so decoding the peer's window
/// correctly means shifting by what the peer announced, not by our own.
/// `None` means the peer never offered the option, so its window is used
/// unscaled (RFC 7323 §1.3: window scaling is disabled for a direction
/// whose SYN carried no WSCALE option).
fn scale_peer_window(raw: u16, peer_wscale: Option<u8>) -> u32 {
    match peer_wscale {
        Some(shift) => (raw as u32) << shift,
        None => raw as u32,
    }
}

impl Tcb {
    /// Creates the child TCB a LISTEN connection spawns on receiving a SYN.
    pub fn listen_child(quad: Quad, iss: u32, seg: &Segment, cfg: &TcpConfig) -> Tcb {
        let mss = seg.options.mss().unwrap_or(cfg.default_mss);
        let peer_wscale = seg.options.window_scale();
        let mut send = SendEngine::new(iss, mss, cfg);
        let mut recv = RecvEngine::new(seg.header.seq, mss, cfg);
        recv.wscale = peer_wscale.map(|_| 0).unwrap_or(0);

        send.wnd = scale_peer_window(seg.header.window, peer_wscale);
        send.wnd_max = send.wnd;

        Tcb {
            quad,
            kind: Kind::Passive,
            state: State::SynRcvd,
            send,
            recv,
            peer_wscale,
            time_wait_deadline: None,
            fin_wait2_deadline: None,
            reset: false,
        }
    }

    /// A placeholder TCB for a bound-but-not-yet-synchronized LISTEN
    /// endpoint. `NetStack` never drives this one through `on_segment`
    /// (a LISTEN spawns a fresh [`Tcb::listen_child`] per inbound SYN
    /// instead); it exists only so the registry's `Entry` has something to
    /// lock, matching every other registered connection.
    pub fn listen_stub(quad: Quad, cfg: &TcpConfig) -> Tcb {
        Tcb {
            quad,
            kind: Kind::Passive,
            state: State::Listen,
            send: SendEngine::new(0, cfg.default_mss, cfg),
            recv: RecvEngine::new(0, cfg.default_mss, cfg),
            peer_wscale: None,
            time_wait_deadline: None,
            fin_wait2_deadline: None,
            reset: false,
        }
    }

    /// RFC 793 §3.4: a segment addressed to neither an open connection nor
    /// a LISTEN gets a bare RST (or RST+ACK if it carried no ACK itself).
    pub fn stray_rst(seg: &Segment, quad: &Quad) -> OutSegment {
        Self::rst_segment(seg, quad)
    }

    /// Creates the TCB for a local `connect`.
    pub fn syn_sent(quad: Quad, iss: u32, cfg: &TcpConfig) -> Tcb {
        let send = SendEngine::new(iss, cfg.default_mss, cfg);
        let recv = RecvEngine::new(0, cfg.default_mss, cfg);

        Tcb {
            quad,
            kind: Kind::Active,
            state: State::SynSent,
            send,
            recv,
            peer_wscale: None,
            time_wait_deadline: None,
            fin_wait2_deadline: None,
            reset: false,
        }
    }

    /// Builds the initial SYN this connection must transmit once registered.
    pub fn initial_syn(&mut self, now: Instant) -> OutSegment {
        self.send.queue_syn(now);
        self.segment(Flags::SYN, self.send.iss, 0, syn_options(self.send.mss), &[])
    }

    /// Builds the SYN+ACK a freshly-spawned SYN_RECEIVED child must send.
    pub fn initial_synack(&mut self, now: Instant) -> OutSegment {
        self.send.queue_syn(now);
        self.segment(
            Flags::SYN | Flags::ACK,
            self.send.iss,
            self.recv.nxt,
            syn_options(self.send.mss),
            &[],
        )
    }

    fn segment(&self, flags: Flags, seq: u32, ack: u32, options: Options, payload: &[u8]) -> OutSegment {
        OutSegment {
            header: Header {
                src_port: self.quad.local.port,
                dst_port: self.quad.remote.port,
                seq,
                ack,
                flags,
                window: self.recv.advertised_window_field(),
                checksum: 0,
                urgent_ptr: 0,
            },
            options,
            payload: payload.to_vec(),
        }
    }

    /// Flags for a retransmitted [`crate::tcp::send::Outgoing`]: a
    /// retransmitted SYN (or SYN+ACK) must carry the SYN bit again — a
    /// `Outgoing` otherwise only ever represents data/FIN and the codec has
    /// no other way to recover that it was ever a SYN.
    fn retransmit_flags(&self, seg: &crate::tcp::send::Outgoing) -> Flags {
        if seg.syn {
            match self.state {
                State::SynSent => Flags::SYN,
                _ => Flags::SYN | Flags::ACK,
            }
        } else if seg.fin {
            Flags::ACK | Flags::FIN
        } else {
            Flags::ACK
        }
    }

    fn ack_segment(&self) -> OutSegment {
        self.segment(Flags::ACK, self.send.nxt, self.recv.nxt, Options::default(), &[])
    }

    fn rst_segment(seg: &Segment, quad: &Quad) -> OutSegment {
        let (seq, flags) = if seg.header.flags.contains(Flags::ACK) {
            (seg.header.ack, Flags::RST)
        } else {
            (0, Flags::RST | Flags::ACK)
        };
        OutSegment {
            header: Header {
                src_port: quad.local.port,
                dst_port: quad.remote.port,
                seq,
                ack: seg.header.seq.wrapping_add(seg.seg_len()),
                flags,
                window: 0,
                checksum: 0,
                urgent_ptr: 0,
            },
            options: Options::default(),
            payload: Vec::new(),
        }
    }

    /// RFC 793 §3.3 acceptability test: four cases depending on whether the
    /// segment and our receive window are each empty.
    fn is_acceptable(&self, seg: &Segment) -> bool {
        let seg_len = seg.seg_len();
        let rcv_wnd = self.recv.advertised_window();
        let seq = seg.header.seq;

        if seg_len == 0 && rcv_wnd == 0 {
            seq == self.recv.nxt
        } else if seg_len == 0 && rcv_wnd > 0 {
            is_between_wrapped(self.recv.nxt.wrapping_sub(1), seq, self.recv.nxt.wrapping_add(rcv_wnd))
                || seq == self.recv.nxt
        } else if seg_len > 0 && rcv_wnd == 0 {
            false
        } else {
            let start_ok = is_between_wrapped(
                self.recv.nxt.wrapping_sub(1),
                seq,
                self.recv.nxt.wrapping_add(rcv_wnd),
            ) || seq == self.recv.nxt;
            let end = seq.wrapping_add(seg_len).wrapping_sub(1);
            let end_ok = is_between_wrapped(
                self.recv.nxt.wrapping_sub(1),
                end,
                self.recv.nxt.wrapping_add(rcv_wnd),
            );
            start_ok || end_ok
        }
    }

    /// The State Machine's single entry point for an inbound segment (spec
    /// §4.2). Returns any reply segments to transmit and the registry/stream
    /// side effects the dispatch loop must apply.
    pub fn on_segment(
        &mut self,
        seg: &Segment,
        now: Instant,
        cfg: &TcpConfig,
    ) -> (Vec<OutSegment>, Effects) {
        match self.state {
            State::Listen => self.on_segment_listen(seg, now, cfg),
            State::SynSent => self.on_segment_syn_sent(seg, now, cfg),
            _ => self.on_segment_synchronized(seg, now, cfg),
        }
    }

    fn on_segment_listen(&mut self, seg: &Segment, _now: Instant, _cfg: &TcpConfig) -> (Vec<OutSegment>, Effects) {
        // A real LISTEN Tcb never reaches on_segment directly: NetStack
        // spawns a child via `listen_child` before dispatch. Kept for
        // completeness/symmetry with the State enum's other variants.
        (Vec::new(), Effects::default())
    }

    fn on_segment_syn_sent(&mut self, seg: &Segment, now: Instant, cfg: &TcpConfig) -> (Vec<OutSegment>, Effects) {
        let mut effects = Effects::default();
        let acceptable_ack = seg.header.flags.contains(Flags::ACK)
            && (wrapping_lt(self.send.una.wrapping_sub(1), seg.header.ack)
                && wrapping_lt(seg.header.ack, self.send.nxt.wrapping_add(1)));

        if seg.header.flags.contains(Flags::RST) {
            if acceptable_ack {
                self.reset = true;
                effects.refused = true;
                effects.remove = true;
                return (Vec::new(), effects.wake_all());
            }
            return (Vec::new(), effects);
        }

        if seg.header.flags.contains(Flags::ACK) && !acceptable_ack {
            return (vec![Self::rst_segment(seg, &self.quad)], effects);
        }

        if !seg.header.flags.contains(Flags::SYN) {
            return (Vec::new(), effects);
        }

        self.recv = RecvEngine::new(seg.header.seq, seg.options.mss().unwrap_or(cfg.default_mss), cfg);
        self.peer_wscale = seg.options.window_scale();
        self.send.wnd = scale_peer_window(seg.header.window, self.peer_wscale);
        self.send.wnd_max = self.send.wnd;

        if seg.header.flags.contains(Flags::ACK) {
            self.send.on_ack(seg.header.ack, now);
            debug!("{:?} SYN_SENT -> ESTABLISHED", self.quad);
            self.state = State::Estab;
            effects.established = true;
            let ack = self.ack_segment();
            return (vec![ack], effects.wake_all());
        }

        // Simultaneous open: both sides sent a bare SYN.
        debug!("{:?} SYN_SENT -> SYN_RECEIVED (simultaneous open)", self.quad);
        self.state = State::SynRcvd;
        let synack = self.segment(
            Flags::SYN | Flags::ACK,
            self.send.iss,
            self.recv.nxt,
            syn_options(self.send.mss),
            &[],
        );
        (vec![synack], effects)
    }

    fn on_segment_synchronized(
        &mut self,
        seg: &Segment,
        now: Instant,
        cfg: &TcpConfig,
    ) -> (Vec<OutSegment>, Effects) {
        let mut effects = Effects::default();
        let mut out = Vec::new();

        // RFC 793 §3.9 SYN-RECEIVED / spec "Tie-breaks and edge cases": a
        // duplicate of the peer's own original SYN (identical seq — the
        // control bit occupies the one byte of sequence space
        // `is_acceptable` would otherwise reject as already consumed,
        // since `recv.nxt == irs + 1`) means our SYN+ACK was lost; answer
        // with another SYN+ACK instead of falling into the
        // unacceptable-segment or in-window-SYN paths below.
        if self.state == State::SynRcvd
            && seg.header.flags.contains(Flags::SYN)
            && seg.header.seq == self.recv.irs
        {
            trace!("{:?} duplicate SYN in SYN_RECEIVED, retransmitting SYN+ACK", self.quad);
            let synack = self.segment(
                Flags::SYN | Flags::ACK,
                self.send.iss,
                self.recv.nxt,
                syn_options(self.send.mss),
                &[],
            );
            return (vec![synack], effects);
        }

        if !self.is_acceptable(seg) {
            if !seg.header.flags.contains(Flags::RST) {
                out.push(self.ack_segment());
            }
            return (out, effects);
        }

        if seg.header.flags.contains(Flags::RST) {
            warn!("{:?} RST in {:?}, tearing down", self.quad, self.state);
            self.reset = true;
            effects.remove = true;
            match self.state {
                State::CloseWait => effects.wake_closer = true,
                _ => {}
            }
            self.state = State::Closed;
            return (Vec::new(), effects.wake_all());
        }

        if seg.header.flags.contains(Flags::SYN) {
            // RFC 793 §3.9 SYN-RECEIVED: any other (non-duplicate) SYN here
            // is not the retransmission case handled above. A passive-open
            // child quietly gives up — the user need not be informed, and
            // the listener can still accept a fresh SYN later — rather than
            // being treated as an attack. An active-open (simultaneous-open)
            // connection has no such fallback and falls through to the
            // RFC 5961 challenge-ACK-and-reset path below, same as every
            // other synchronized state.
            if self.state == State::SynRcvd && self.kind == Kind::Passive {
                return (Vec::new(), Effects { remove: true, ..Effects::default() });
            }
            // RFC 5961 simplification: treat an in-window SYN as an error,
            // answer with a challenge ACK-as-reset and tear the connection
            // down.
            self.reset = true;
            effects.remove = true;
            return (vec![Self::rst_segment(seg, &self.quad)], effects.wake_all());
        }

        if !seg.header.flags.contains(Flags::ACK) {
            return (out, effects);
        }

        if !self.process_ack(seg, now, cfg, &mut effects) {
            return (out, effects);
        }

        if effects.fast_retransmit {
            if let Some(resent) = self.send.resend_oldest_unacked(now) {
                trace!("{:?} fast retransmit seq={}", self.quad, resent.seq);
                let flags = self.retransmit_flags(&resent);
                let options = if resent.syn { syn_options(self.send.mss) } else { Options::default() };
                out.push(self.segment(flags, resent.seq, self.recv.nxt, options, &resent.data));
            }
        }

        if !seg.payload.is_empty() || seg.header.flags.contains(Flags::FIN) {
            self.process_text_and_fin(seg, now, cfg, &mut out, &mut effects);
        }

        (out, effects)
    }

    /// Handles the ACK half of an in-window segment. Returns `false` when
    /// the state machine should stop processing this segment further (e.g.
    /// an unacceptable ACK was answered and nothing else applies).
    fn process_ack(&mut self, seg: &Segment, now: Instant, cfg: &TcpConfig, effects: &mut Effects) -> bool {
        let ack = seg.header.ack;

        match self.state {
            State::SynRcvd => {
                if wrapping_lt(self.send.una.wrapping_sub(1), ack) && wrapping_lt(ack, self.send.nxt.wrapping_add(1)) {
                    self.send.on_ack(ack, now);
                    let window = scale_peer_window(seg.header.window, self.peer_wscale);
                    self.send.update_window(seg.header.seq, ack, window, now);
                    self.state = State::Estab;
                    effects.established = true;
                } else {
                    return false;
                }
            }
            _ => {
                if wrapping_lt(self.send.nxt, ack) {
                    // ACKs something not yet sent: ignore (ack_segment
                    // already handled the unacceptable-segment branch above
                    // for genuinely out-of-window cases).
                    return true;
                }
                if !wrapping_lt(self.send.una, ack) && ack != self.send.una {
                    return true;
                }

                let is_new = wrapping_lt(self.send.una, ack);
                let (freed, sample) = self.send.on_ack(ack, now);
                if let Some(r) = sample {
                    self.send.record_rtt_sample(r, cfg);
                }
                if is_new {
                    self.send.on_new_data_acked();
                    if freed {
                        effects.wake_writer = true;
                    }
                } else if ack == self.send.una {
                    if self.send.on_duplicate_ack(ack) {
                        effects.fast_retransmit = true;
                    }
                }

                let window = scale_peer_window(seg.header.window, self.peer_wscale);
                self.send.update_window(seg.header.seq, ack, window, now);

                match self.state {
                    State::FinWait1 if self.send.fin_acked() => {
                        trace!("{:?} FIN_WAIT_1 -> FIN_WAIT_2", self.quad);
                        self.state = State::FinWait2;
                        self.fin_wait2_deadline = Some(now + cfg.fin_wait2_timeout);
                    }
                    State::Closing if self.send.fin_acked() => {
                        trace!("{:?} CLOSING -> TIME_WAIT", self.quad);
                        self.state = State::TimeWait;
                        self.time_wait_deadline = Some(now + cfg.time_wait);
                    }
                    State::LastAck if self.send.fin_acked() => {
                        trace!("{:?} LAST_ACK -> CLOSED", self.quad);
                        self.state = State::Closed;
                        effects.remove = true;
                        effects.wake_closer = true;
                    }
                    State::TimeWait => {
                        self.time_wait_deadline = Some(now + cfg.time_wait);
                    }
                    _ => {}
                }
            }
        }
        true
    }

    fn process_text_and_fin(
        &mut self,
        seg: &Segment,
        now: Instant,
        cfg: &TcpConfig,
        out: &mut Vec<OutSegment>,
        effects: &mut Effects,
    ) {
        let accepts_text = matches!(
            self.state,
            State::Estab | State::FinWait1 | State::FinWait2
        );

        let accepted = if accepts_text {
            self.recv.accept(
                seg.header.seq,
                seg.payload,
                seg.header.flags.contains(Flags::FIN),
                now,
            )
        } else if seg.header.flags.contains(Flags::FIN) {
            self.recv.accept(seg.header.seq, &[], true, now)
        } else {
            crate::tcp::recv::Accepted {
                advanced: false,
                ack_now: false,
            }
        };

        if accepted.advanced && self.recv.has_data() {
            effects.wake_reader = true;
        }

        if self.recv.fin_seen {
            match self.state {
                State::Estab => {
                    trace!("{:?} ESTABLISHED -> CLOSE_WAIT (peer FIN)", self.quad);
                    self.state = State::CloseWait;
                    effects.wake_reader = true;
                    effects.wake_closer = true;
                }
                State::FinWait1 => {
                    // Simultaneous close.
                    trace!("{:?} FIN_WAIT_1 -> CLOSING (simultaneous close)", self.quad);
                    self.state = State::Closing;
                }
                State::FinWait2 => {
                    trace!("{:?} FIN_WAIT_2 -> TIME_WAIT", self.quad);
                    self.state = State::TimeWait;
                    self.time_wait_deadline = Some(now + cfg.time_wait);
                }
                State::TimeWait => {
                    self.time_wait_deadline = Some(now + cfg.time_wait);
                }
                _ => {}
            }
        }

        if accepted.ack_now {
            self.recv.disarm_delayed_ack();
            out.push(self.ack_segment());
        } else if accepted.advanced {
            self.recv.arm_delayed_ack(now, cfg);
        }
    }

    /// Initiates a local close (spec §4.2 "active close"/"passive close").
    pub fn close(&mut self, now: Instant) {
        match self.state {
            State::Estab => {
                self.state = State::FinWait1;
            }
            State::CloseWait => {
                self.state = State::LastAck;
            }
            _ => return,
        }
        self.send.queue_bare_fin(now);
    }

    pub fn send(&mut self, data: &[u8]) -> usize {
        self.send.enqueue(data)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        self.recv.consume(buf)
    }

    /// Periodic tick (spec §4.4): retransmission timer, persist timer,
    /// TIME_WAIT expiry, FIN_WAIT_2 watchdog, delayed-ACK flush, and
    /// whatever new data the send window now allows out the door.
    pub fn on_tick(&mut self, now: Instant, cfg: &TcpConfig) -> (Vec<OutSegment>, Effects) {
        let mut out = Vec::new();
        let mut effects = Effects::default();

        if let Some(deadline) = self.time_wait_deadline {
            if now >= deadline {
                self.state = State::Closed;
                effects.remove = true;
                return (out, effects);
            }
        }

        if let Some(deadline) = self.fin_wait2_deadline {
            if self.state == State::FinWait2 && now >= deadline {
                self.state = State::Closed;
                self.reset = true;
                effects.remove = true;
                return (out, effects.wake_all());
            }
        }

        if self.send.retransmit_due(now) {
            match self.send.on_retransmit_timeout(now, cfg) {
                RetransmitOutcome::Abort => {
                    warn!(
                        "{:?} retransmission retries exhausted, aborting",
                        self.quad
                    );
                    self.state = State::Closed;
                    self.reset = true;
                    effects.remove = true;
                    return (out, effects.wake_all());
                }
                RetransmitOutcome::Resend(seg) => {
                    trace!("{:?} retransmit seq={}", self.quad, seg.seq);
                    effects.retransmit = true;
                    let flags = self.retransmit_flags(&seg);
                    let options = if seg.syn { syn_options(self.send.mss) } else { Options::default() };
                    let ack = if flags.contains(Flags::ACK) { self.recv.nxt } else { 0 };
                    out.push(self.segment(flags, seg.seq, ack, options, &seg.data));
                }
                RetransmitOutcome::Nothing => {}
            }
        }

        if self.send.persist_due(now) {
            match self.send.on_persist_timeout(now, cfg) {
                PersistOutcome::Abort => {
                    self.state = State::Closed;
                    self.reset = true;
                    effects.remove = true;
                    return (out, effects.wake_all());
                }
                PersistOutcome::Probe(seq, data) => {
                    effects.persist_probe = true;
                    out.push(self.segment(Flags::ACK, seq, self.recv.nxt, Options::default(), &data));
                }
            }
        }

        if self.recv.delayed_ack_due(now) {
            self.recv.disarm_delayed_ack();
            out.push(self.ack_segment());
        }

        while let Some(seg) = self.send.produce_segment(now) {
            let flags = if seg.fin { Flags::ACK | Flags::FIN } else { Flags::ACK };
            out.push(self.segment(flags, seg.seq, self.recv.nxt, Options::default(), &seg.data));
        }

        (out, effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{Dual, Quad};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn quad() -> Quad {
        Quad::new(
            Dual::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4242),
            Dual::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
        )
    }

    fn seg(seq: u32, ack: u32, flags: Flags, window: u16) -> Segment<'static> {
        Segment {
            header: Header {
                src_port: 80,
                dst_port: 4242,
                seq,
                ack,
                flags,
                window,
                checksum: 0,
                urgent_ptr: 0,
            },
            options: Options::default(),
            payload: &[],
        }
    }

    /// Drives a fresh `SYN_SENT` Tcb to `ESTABLISHED` with a minimal
    /// SYN+ACK/ACK exchange, returning the peer's initial sequence number.
    fn established(tcb: &mut Tcb, now: Instant, cfg: &TcpConfig) -> u32 {
        let peer_iss = 5000u32;
        let synack = seg(peer_iss, tcb.send.nxt, Flags::SYN | Flags::ACK, 8192);
        let (_out, effects) = tcb.on_segment(&synack, now, cfg);
        assert!(effects.established);
        assert_eq!(tcb.state, State::Estab);
        peer_iss
    }

    /// Scenario D: local closes first (FIN_WAIT_1), peer ACKs the FIN
    /// without sending its own FIN (FIN_WAIT_2), and only later sends FIN,
    /// moving the connection to TIME_WAIT.
    #[test]
    fn fin_wait_2_path() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);
        let peer_iss = established(&mut tcb, now, &cfg);

        tcb.close(now);
        assert_eq!(tcb.state, State::FinWait1);
        tcb.on_tick(now, &cfg); // flushes the queued FIN
        let our_fin_seq = tcb.send.nxt.wrapping_sub(1);

        // Peer ACKs our FIN but sends no FIN of its own yet.
        let ack_only = seg(
            peer_iss.wrapping_add(1),
            our_fin_seq.wrapping_add(1),
            Flags::ACK,
            8192,
        );
        let (_out, _effects) = tcb.on_segment(&ack_only, now, &cfg);
        assert_eq!(tcb.state, State::FinWait2);

        // Peer's FIN arrives later.
        let fin = seg(
            peer_iss.wrapping_add(1),
            our_fin_seq.wrapping_add(1),
            Flags::FIN | Flags::ACK,
            8192,
        );
        let (out, _effects) = tcb.on_segment(&fin, now, &cfg);
        assert_eq!(tcb.state, State::TimeWait);
        assert!(out.iter().any(|o| o.header.flags.contains(Flags::ACK)));
    }

    /// Scenario E: both sides send FIN before seeing the other's —
    /// FIN_WAIT_1 moves to CLOSING on the peer's un-ACKing FIN, then to
    /// TIME_WAIT once the peer finally ACKs our FIN.
    #[test]
    fn simultaneous_close() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);
        let peer_iss = established(&mut tcb, now, &cfg);

        tcb.close(now);
        assert_eq!(tcb.state, State::FinWait1);
        tcb.on_tick(now, &cfg); // flushes the queued FIN
        let our_fin_seq = tcb.send.nxt.wrapping_sub(1);

        // Peer's FIN arrives acknowledging only our pre-close data, not our FIN.
        let fin = seg(peer_iss.wrapping_add(1), our_fin_seq, Flags::FIN | Flags::ACK, 8192);
        let (_out, _effects) = tcb.on_segment(&fin, now, &cfg);
        assert_eq!(tcb.state, State::Closing);

        // Peer now ACKs our FIN.
        let ack = seg(
            peer_iss.wrapping_add(2),
            our_fin_seq.wrapping_add(1),
            Flags::ACK,
            8192,
        );
        let (_out, _effects) = tcb.on_segment(&ack, now, &cfg);
        assert_eq!(tcb.state, State::TimeWait);
    }

    /// Scenario C (full): a silent peer never ACKs the SYN; after
    /// `max_retries` retransmissions the connection aborts with
    /// `ConnectionTimedOut` semantics (`reset` + `remove`, no more segments).
    #[test]
    fn syn_retransmission_exhausts_retries_and_aborts() {
        let cfg = TcpConfig {
            initial_rto_ms: 10,
            max_retries: 3,
            ..TcpConfig::default()
        };
        let mut now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);

        let mut aborted = false;
        for _ in 0..10 {
            now += Duration::from_millis(cfg.max_rto_ms + 10);
            let (_out, effects) = tcb.on_tick(now, &cfg);
            if effects.remove {
                aborted = true;
                break;
            }
        }

        assert!(aborted, "connection should abort once retries are exhausted");
        assert_eq!(tcb.state, State::Closed);
        assert!(tcb.reset);
    }

    /// A retransmitted SYN (the peer never replied in time) must still
    /// carry the SYN control bit and an identical sequence number — a
    /// bare-ACK retransmission would never be recognized by the peer as the
    /// same handshake attempt.
    #[test]
    fn syn_retransmission_carries_syn_flag_and_same_seq() {
        let cfg = TcpConfig {
            initial_rto_ms: 10,
            ..TcpConfig::default()
        };
        let mut now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        let first = tcb.initial_syn(now);
        assert!(first.header.flags.contains(Flags::SYN));
        assert!(!first.header.flags.contains(Flags::ACK));

        now += Duration::from_millis(cfg.initial_rto_ms + 10);
        let (out, effects) = tcb.on_tick(now, &cfg);
        assert!(!effects.remove);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.flags.contains(Flags::SYN));
        assert!(!out[0].header.flags.contains(Flags::ACK));
        assert_eq!(out[0].header.seq, first.header.seq);
    }

    /// Spec §4.4: the third duplicate ACK for the same byte triggers an
    /// immediate retransmission of the oldest unacked segment, without
    /// waiting for the retransmission timer.
    #[test]
    fn third_duplicate_ack_triggers_immediate_fast_retransmit() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);
        let peer_iss = established(&mut tcb, now, &cfg);

        tcb.send(b"hello");
        let (out, _) = tcb.on_tick(now, &cfg);
        assert_eq!(out.len(), 1, "the one segment of queued data should go out");
        let data_seq = out[0].header.seq;

        let dup = seg(peer_iss.wrapping_add(1), tcb.send.una, Flags::ACK, 8192);
        let (out1, e1) = tcb.on_segment(&dup, now, &cfg);
        assert!(out1.is_empty());
        assert!(!e1.fast_retransmit);
        let (out2, e2) = tcb.on_segment(&dup, now, &cfg);
        assert!(out2.is_empty());
        assert!(!e2.fast_retransmit);
        let (out3, e3) = tcb.on_segment(&dup, now, &cfg);
        assert!(e3.fast_retransmit);
        assert_eq!(out3.len(), 1, "the third dup ACK must resend immediately");
        assert_eq!(out3[0].header.seq, data_seq);
        assert!(out3[0].header.flags.contains(Flags::ACK));
        assert!(!out3[0].header.flags.contains(Flags::SYN));
    }

    /// The peer's advertised window must be left-shifted by the shift *it*
    /// announced in its own SYN (RFC 7323), not taken as a raw byte count.
    #[test]
    fn peer_window_is_scaled_by_peers_own_wscale() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);

        let peer_iss = 5000u32;
        let mut synack = seg(peer_iss, tcb.send.nxt, Flags::SYN | Flags::ACK, 100);
        synack.options = Options(vec![TcpOption::WindowScale(3)]);
        let (_out, effects) = tcb.on_segment(&synack, now, &cfg);
        assert!(effects.established);
        assert_eq!(tcb.send.wnd, 100 << 3, "raw window must be shifted by the peer's announced scale");

        // A later pure ACK with a new raw window is scaled the same way.
        let update = seg(peer_iss.wrapping_add(1), tcb.send.nxt, Flags::ACK, 200);
        tcb.on_segment(&update, now, &cfg);
        assert_eq!(tcb.send.wnd, 200 << 3);
    }

    /// A peer that never offers Window Scale gets its window taken as-is:
    /// scaling is disabled entirely for that direction (RFC 7323 §1.3).
    #[test]
    fn peer_window_is_unscaled_when_peer_never_offered_wscale() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut tcb = Tcb::syn_sent(quad(), 1000, &cfg);
        tcb.initial_syn(now);

        let peer_iss = 5000u32;
        let synack = seg(peer_iss, tcb.send.nxt, Flags::SYN | Flags::ACK, 4096);
        let (_out, effects) = tcb.on_segment(&synack, now, &cfg);
        assert!(effects.established);
        assert_eq!(tcb.send.wnd, 4096);
    }

    /// The final ACK of a passive-open handshake also carries the peer's
    /// real advertised window, which must replace the placeholder guessed
    /// from the SYN alone (and still honor the peer's announced shift).
    #[test]
    fn passive_open_final_ack_updates_send_window() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let mut syn = seg(9000, 0, Flags::SYN, 500);
        syn.options = Options(vec![TcpOption::WindowScale(2)]);
        let mut tcb = Tcb::listen_child(quad(), 1000, &syn, &cfg);
        assert_eq!(tcb.send.wnd, 500 << 2);
        tcb.initial_synack(now);

        let mut final_ack = seg(9001, tcb.send.nxt, Flags::ACK, 700);
        final_ack.options = Options(vec![TcpOption::WindowScale(2)]);
        let (_out, effects) = tcb.on_segment(&final_ack, now, &cfg);
        assert!(effects.established);
        assert_eq!(tcb.state, State::Estab);
        assert_eq!(tcb.send.wnd, 700 << 2, "the handshake-completing ACK's window must be recorded");
    }

    /// spec.md "Tie-breaks and edge cases": a duplicate of the peer's
    /// original SYN arriving in SYN_RECEIVED (our SYN+ACK was lost) gets
    /// another SYN+ACK with the same sequence number, not a bare ACK or a
    /// reset.
    #[test]
    fn duplicate_syn_in_syn_received_retransmits_synack() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let syn = seg(9000, 0, Flags::SYN, 500);
        let mut tcb = Tcb::listen_child(quad(), 1000, &syn, &cfg);
        let first_synack = tcb.initial_synack(now);
        assert_eq!(tcb.state, State::SynRcvd);

        let dup_syn = seg(9000, 0, Flags::SYN, 500);
        let (out, effects) = tcb.on_segment(&dup_syn, now, &cfg);
        assert_eq!(tcb.state, State::SynRcvd, "must stay in SYN_RECEIVED");
        assert!(!effects.remove);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.flags.contains(Flags::SYN));
        assert!(out[0].header.flags.contains(Flags::ACK));
        assert_eq!(out[0].header.seq, first_synack.header.seq);
        assert_eq!(out[0].header.ack, first_synack.header.ack);
    }

    /// A SYN in SYN_RECEIVED that is *not* a duplicate of the original
    /// (different seq) on a passive-open child is quietly dropped — the
    /// connection is removed with no reset and no reply, per the teacher's
    /// `Action::RemoveFromPending` for `Kind::Passive`.
    #[test]
    fn non_duplicate_syn_in_syn_received_drops_passive_child_silently() {
        let cfg = TcpConfig::default();
        let now = Instant::now();
        let syn = seg(9000, 0, Flags::SYN, 500);
        let mut tcb = Tcb::listen_child(quad(), 1000, &syn, &cfg);
        tcb.initial_synack(now);

        let other_syn = seg(12345, 0, Flags::SYN, 500);
        let (out, effects) = tcb.on_segment(&other_syn, now, &cfg);
        assert!(out.is_empty(), "no reset/challenge ACK for a passive child");
        assert!(effects.remove);
        assert!(!tcb.reset);
    }
}
