//! The per-connection ARQ state machine.
//!
//! One [`ControlBlock`] exists per (endpoint, peer, conversation) triple.
//! It is single-threaded and cooperative: `send` queues bytes, `input`
//! consumes caller-supplied datagrams, `flush` hands encoded datagrams to
//! the output callback, and `update`/`check` integrate with whatever
//! scheduler the host runs. Nothing here blocks or performs I/O.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::config::{EngineConfig, NoDelayLevel};
use crate::error::{Error, Result};
use crate::wire::{consts, log, seq_before, wrapping_diff, Cmd, Segment};

/// Output callback invoked by `flush()` with each encoded datagram.
pub type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// `state` value once a segment exhausts its transmission budget.
const DEAD_LINK_STATE: u32 = u32::MAX;

/// Jacobson/Karels-style RTT estimator feeding the retransmission timeout.
#[derive(Debug)]
struct RttEstimator {
    /// Smoothed round-trip time (ms); 0 until the first sample.
    srtt: u32,
    /// Mean deviation (ms).
    rttval: u32,
    /// Current retransmission timeout (ms).
    rto: u32,
    /// Floor for `rto`, set by the nodelay level.
    min_rto: u32,
}

impl RttEstimator {
    /// Fold one RTT sample in and recompute the timeout.
    fn sample(&mut self, rtt: u32, interval: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = (3 * self.rttval + delta) / 4;
            self.srtt = ((7 * self.srtt + rtt) / 8).max(1);
        }
        let rto = self.srtt + interval.max(4 * self.rttval);
        self.rto = rto.clamp(self.min_rto, consts::RTO_MAX);
    }
}

/// Send, receive, remote, and congestion windows, all in segments except
/// `incr` which tracks the congestion window in bytes for the AIMD phase.
#[derive(Debug)]
struct Windows {
    snd: u32,
    rcv: u32,
    rmt: u32,
    cwnd: u32,
    ssthresh: u32,
    incr: u32,
}

/// Zero-window probe state.
#[derive(Debug, Default)]
struct Probe {
    /// Pending ASK_SEND / ASK_TELL bits.
    flags: u32,
    /// When the next WASK fires.
    ts: u32,
    /// Current backoff, 0 when the remote window is open.
    wait: u32,
}

/// Counters and a timing snapshot, cheap to copy out for monitoring.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retransmissions: u64,
    pub fast_retransmissions: u64,
    pub srtt: u32,
    pub rttval: u32,
    pub rto: u32,
    pub cwnd: u32,
    pub snd_buf_len: usize,
    pub rcv_buf_len: usize,
}

/// The ARQ control block.
///
/// All five mutating operations (`send`, `recv`, `input`, `update`,
/// `flush`) must be externally serialized per block; distinct blocks are
/// independent.
pub struct ControlBlock {
    conv: u32,
    mtu: u32,
    mss: u32,
    /// 0 while healthy, [`DEAD_LINK_STATE`] once the link is given up on.
    state: u32,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    rtt: RttEstimator,
    wnd: Windows,
    probe: Probe,

    /// Last time handed to `update()`.
    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,

    nodelay: NoDelayLevel,
    stream: bool,
    nocwnd: bool,
    fastresend: u32,
    fastlimit: u32,
    fastack_conserve: bool,
    dead_link: u32,
    /// Cumulative retransmission count across the block's lifetime.
    xmit: u32,

    /// Application data not yet admitted to the send window. No sn yet.
    snd_queue: VecDeque<Segment>,
    /// In-flight segments, ascending sn within [snd_una, snd_nxt).
    snd_buf: VecDeque<Segment>,
    /// Out-of-order arrivals, ascending sn, all >= rcv_nxt, no duplicates.
    rcv_buf: VecDeque<Segment>,
    /// In-order segments ready for delivery.
    rcv_queue: VecDeque<Segment>,
    /// (sn, ts) pairs to acknowledge on the next flush.
    acklist: Vec<(u32, u32)>,

    /// Scratch datagram under construction during flush.
    buffer: BytesMut,
    output: Option<OutputFn>,
    log_mask: u32,
    stats: Stats,
}

impl ControlBlock {
    /// Create a control block for conversation `conv`.
    pub fn new(conv: u32, config: EngineConfig) -> Self {
        let mtu = config.mtu.max(consts::OVERHEAD + 1);
        let mss = mtu - consts::OVERHEAD;
        let delay = config.delay;
        Self {
            conv,
            mtu,
            mss,
            state: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rtt: RttEstimator {
                srtt: 0,
                rttval: 0,
                rto: consts::RTO_DEF,
                min_rto: delay.level.min_rto(),
            },
            wnd: Windows {
                snd: config.snd_wnd,
                rcv: config.rcv_wnd.max(consts::WND_RCV),
                rmt: consts::WND_RCV,
                cwnd: 1,
                ssthresh: consts::THRESH_INIT,
                incr: mss,
            },
            probe: Probe::default(),
            current: 0,
            interval: delay.interval.clamp(10, 5000),
            ts_flush: consts::INTERVAL,
            updated: false,
            nodelay: delay.level,
            stream: config.stream,
            nocwnd: delay.no_cwnd,
            fastresend: delay.resend,
            fastlimit: config.fast_limit,
            fastack_conserve: config.fastack_conserve,
            dead_link: config.dead_link,
            xmit: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity(((mtu + consts::OVERHEAD) * 3) as usize),
            output: None,
            log_mask: config.log_mask,
            stats: Stats::default(),
        }
    }

    /// Register the callback `flush()` emits encoded datagrams through.
    /// Exactly one callback per block; a later call replaces the earlier.
    pub fn set_output<F>(&mut self, output: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.output = Some(Box::new(output));
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Queue application bytes for transmission.
    ///
    /// In stream mode the tail of the send queue is topped up to a full
    /// MSS before new segments are cut; in message mode the data becomes
    /// one fragment chain with descending `frg` counters. Returns the
    /// bytes accepted. Nothing is emitted until the next flush.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mss = self.mss as usize;
        let total = data.len();
        let mut data = data;

        if self.stream {
            if let Some(tail) = self.snd_queue.back_mut() {
                if tail.data.len() < mss {
                    let room = mss - tail.data.len();
                    let extend = room.min(data.len());
                    let mut merged = BytesMut::with_capacity(tail.data.len() + extend);
                    merged.extend_from_slice(&tail.data);
                    merged.extend_from_slice(&data[..extend]);
                    tail.data = merged.freeze();
                    tail.frg = 0;
                    data = &data[extend..];
                }
            }
            if data.is_empty() {
                self.stats.bytes_sent += total as u64;
                return Ok(total);
            }
        }

        let count = if data.len() <= mss {
            1
        } else {
            data.len().div_ceil(mss)
        };
        if count >= consts::WND_RCV as usize {
            return Err(Error::OversizedMessage(count));
        }

        for i in 0..count {
            let size = data.len().min(mss);
            let (chunk, rest) = data.split_at(size);
            let mut seg =
                Segment::with_payload(self.conv, Cmd::Push, Bytes::copy_from_slice(chunk));
            seg.frg = if self.stream { 0 } else { (count - i - 1) as u8 };
            self.snd_queue.push_back(seg);
            data = rest;
        }

        if self.log_on(log::SEND) {
            trace!(conv = self.conv, bytes = total, fragments = count, "send");
        }
        self.stats.bytes_sent += total as u64;
        Ok(total)
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Size of the next complete message, without consuming it.
    ///
    /// Errors if the queue is empty or the head message's final fragment
    /// has not arrived yet.
    pub fn peek_size(&self) -> Result<usize> {
        let head = self.rcv_queue.front().ok_or(Error::RecvQueueEmpty)?;
        if head.frg == 0 {
            return Ok(head.data.len());
        }
        if self.rcv_queue.len() < head.frg as usize + 1 {
            return Err(Error::FragmentsMissing);
        }
        let mut total = 0;
        for seg in &self.rcv_queue {
            total += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Deliver the next complete message into `buf`, consuming it.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_impl(buf, false)
    }

    /// Copy the next complete message into `buf` without consuming it.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_impl(buf, true)
    }

    /// Next complete message as an owned buffer, or `None` when nothing
    /// is deliverable yet.
    pub fn recv_bytes(&mut self) -> Option<Bytes> {
        let size = self.peek_size().ok()?;
        let mut out = BytesMut::zeroed(size);
        match self.recv(&mut out) {
            Ok(n) => {
                debug_assert_eq!(n, size);
                Some(out.freeze())
            }
            Err(_) => None,
        }
    }

    fn recv_impl(&mut self, buf: &mut [u8], peek: bool) -> Result<usize> {
        if self.rcv_queue.is_empty() {
            return Err(Error::RecvQueueEmpty);
        }
        let size = self.peek_size().map_err(|_| Error::FragmentsMissing)?;
        if size > buf.len() {
            return Err(Error::BufferTooSmall { needed: size });
        }
        let was_full = self.rcv_queue.len() as u32 >= self.wnd.rcv;

        let mut copied = 0;
        if peek {
            for seg in &self.rcv_queue {
                buf[copied..copied + seg.data.len()].copy_from_slice(&seg.data);
                copied += seg.data.len();
                if seg.frg == 0 {
                    break;
                }
            }
        } else {
            while let Some(seg) = self.rcv_queue.pop_front() {
                buf[copied..copied + seg.data.len()].copy_from_slice(&seg.data);
                copied += seg.data.len();
                if self.log_on(log::RECV) {
                    trace!(conv = self.conv, sn = seg.sn, "recv");
                }
                if seg.frg == 0 {
                    break;
                }
            }
            self.stats.bytes_received += copied as u64;
        }
        debug_assert_eq!(copied, size);

        self.drain_rcv_buf();

        // The receive queue was window-limited and now has room again:
        // advertise the opened window on the next flush.
        if (self.rcv_queue.len() as u32) < self.wnd.rcv && was_full {
            self.probe.flags |= consts::ASK_TELL;
        }

        Ok(copied)
    }

    /// Move contiguous segments from the reorder buffer into the delivery
    /// queue, advancing `rcv_nxt`, while the queue has window room.
    fn drain_rcv_buf(&mut self) {
        loop {
            match self.rcv_buf.front() {
                Some(seg)
                    if seg.sn == self.rcv_nxt
                        && (self.rcv_queue.len() as u32) < self.wnd.rcv =>
                {
                    if let Some(seg) = self.rcv_buf.pop_front() {
                        self.rcv_queue.push_back(seg);
                        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    }
                }
                _ => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // input path
    // ------------------------------------------------------------------

    /// Feed one received datagram (or several concatenated) into the
    /// block. Decoding stops at the first malformed segment; everything
    /// decoded before it has already taken effect.
    pub fn input(&mut self, data: Bytes) -> Result<()> {
        if self.log_on(log::INPUT) {
            trace!(conv = self.conv, size = data.len(), "input");
        }
        if data.len() < consts::OVERHEAD as usize {
            return Err(Error::ShortDatagram(data.len()));
        }
        self.stats.packets_received += 1;

        let prev_una = self.snd_una;
        let mut acked = false;
        let mut max_ack = 0u32;
        let mut latest_ts = 0u32;
        let conserve = self.fastack_conserve;

        let mut buf = data;
        while buf.len() >= consts::OVERHEAD as usize {
            let seg = Segment::decode(&mut buf, self.conv)?;

            self.wnd.rmt = seg.wnd as u32;
            self.parse_una(seg.una);
            self.shrink_snd_buf();

            match seg.cmd {
                Cmd::Ack => {
                    let rtt = wrapping_diff(self.current, seg.ts);
                    if rtt >= 0 {
                        self.rtt.sample(rtt as u32, self.interval);
                    }
                    self.parse_ack(seg.sn);
                    self.shrink_snd_buf();
                    if !acked {
                        acked = true;
                        max_ack = seg.sn;
                        latest_ts = seg.ts;
                    } else if seq_before(max_ack, seg.sn)
                        && (!conserve || wrapping_diff(seg.ts, latest_ts) > 0)
                    {
                        max_ack = seg.sn;
                        latest_ts = seg.ts;
                    }
                    if self.log_on(log::IN_ACK) {
                        trace!(
                            conv = self.conv,
                            sn = seg.sn,
                            rtt,
                            rto = self.rtt.rto,
                            "input ack"
                        );
                    }
                }
                Cmd::Push => {
                    if self.log_on(log::IN_DATA) {
                        trace!(conv = self.conv, sn = seg.sn, ts = seg.ts, "input psh");
                    }
                    if wrapping_diff(seg.sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) < 0 {
                        self.acklist.push((seg.sn, seg.ts));
                        if wrapping_diff(seg.sn, self.rcv_nxt) >= 0 {
                            self.parse_data(seg);
                        }
                    }
                }
                Cmd::WndAsk => {
                    // Answer with a window advertisement on the next flush.
                    self.probe.flags |= consts::ASK_TELL;
                    if self.log_on(log::IN_PROBE) {
                        trace!(conv = self.conv, "input probe");
                    }
                }
                Cmd::WndTell => {
                    // The advertised window was already recorded above.
                    if self.log_on(log::IN_WINS) {
                        trace!(conv = self.conv, wnd = seg.wnd, "input wins");
                    }
                }
            }
        }

        if acked {
            self.parse_fastack(max_ack, latest_ts);
        }

        if wrapping_diff(self.snd_una, prev_una) > 0 && self.wnd.cwnd < self.wnd.rmt {
            self.grow_cwnd();
        }

        Ok(())
    }

    /// Cumulative progress: congestion window growth after `snd_una`
    /// moved forward. Slow start below `ssthresh`, byte-counted AIMD
    /// above it, capped at the remote window.
    fn grow_cwnd(&mut self) {
        let mss = self.mss;
        if self.wnd.cwnd < self.wnd.ssthresh {
            self.wnd.cwnd += 1;
            self.wnd.incr += mss;
        } else {
            if self.wnd.incr < mss {
                self.wnd.incr = mss;
            }
            self.wnd.incr += (mss * mss) / self.wnd.incr + (mss / 16);
            if (self.wnd.cwnd + 1) * mss <= self.wnd.incr {
                self.wnd.cwnd = if mss > 0 { self.wnd.incr.div_ceil(mss) } else { 1 };
            }
        }
        if self.wnd.cwnd > self.wnd.rmt {
            self.wnd.cwnd = self.wnd.rmt;
            self.wnd.incr = self.wnd.rmt * mss;
        }
    }

    /// Drop every in-flight segment the peer's cumulative ack covers.
    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if seq_before(seg.sn, una) {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// Remove the one in-flight segment a selective ack names.
    fn parse_ack(&mut self, sn: u32) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let cur = self.snd_buf[i].sn;
            if cur == sn {
                self.snd_buf.remove(i);
                break;
            }
            if seq_before(sn, cur) {
                break;
            }
        }
    }

    /// Bump the duplicate-ack counter of every in-flight segment older
    /// than the highest sn acknowledged in this input batch.
    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }
        let conserve = self.fastack_conserve;
        for seg in self.snd_buf.iter_mut() {
            if seq_before(sn, seg.sn) {
                break;
            }
            if seg.sn != sn && (!conserve || wrapping_diff(ts, seg.ts) >= 0) {
                seg.fastack += 1;
            }
        }
    }

    /// Advance `snd_una` to the head of the in-flight buffer, or to
    /// `snd_nxt` when everything is acknowledged.
    fn shrink_snd_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    /// Insert a PUSH segment into the reorder buffer, keeping it sorted
    /// ascending and rejecting duplicates, then drain whatever became
    /// contiguous.
    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if wrapping_diff(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) >= 0
            || seq_before(sn, self.rcv_nxt)
        {
            return;
        }

        // Walk from the tail: in-order traffic lands at the end.
        let mut insert_at = 0;
        let mut duplicate = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let cur = self.rcv_buf[i].sn;
            if cur == sn {
                duplicate = true;
                break;
            }
            if seq_before(cur, sn) {
                insert_at = i + 1;
                break;
            }
        }
        if !duplicate {
            self.rcv_buf.insert(insert_at, seg);
        }

        self.drain_rcv_buf();
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    /// Free slots in the receive queue, advertised in every outgoing
    /// header.
    fn wnd_unused(&self) -> u16 {
        let queued = self.rcv_queue.len() as u32;
        if queued < self.wnd.rcv {
            (self.wnd.rcv - queued).min(u32::from(u16::MAX)) as u16
        } else {
            0
        }
    }

    /// Hand the scratch buffer to the output callback and reset it.
    fn emit(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.log_mask & log::OUTPUT != 0 {
            trace!(conv = self.conv, size = self.buffer.len(), "output");
        }
        if let Some(out) = self.output.as_mut() {
            out(&self.buffer);
            self.stats.packets_sent += 1;
        }
        self.buffer.clear();
    }

    /// Emit the scratch buffer first if appending `need` more bytes would
    /// push the datagram past the MTU.
    fn reserve_room(&mut self, need: usize) {
        if self.buffer.len() + need > self.mtu as usize {
            self.emit();
        }
    }

    /// Emit pending ACKs, window probes, and due data segments, packed
    /// back-to-back into MTU-sized datagrams.
    ///
    /// A no-op until [`update`](Self::update) has run once.
    pub fn flush(&mut self) {
        if !self.updated {
            return;
        }
        let current = self.current;
        let wnd_free = self.wnd_unused();
        let una = self.rcv_nxt;

        // Template reused by every control segment this round.
        let mut ctl = Segment::new(self.conv, Cmd::Ack);
        ctl.wnd = wnd_free;
        ctl.una = una;

        self.buffer.clear();

        // 1. pending acknowledgements; the list keeps its allocation
        for i in 0..self.acklist.len() {
            let (sn, ts) = self.acklist[i];
            self.reserve_room(consts::OVERHEAD as usize);
            ctl.sn = sn;
            ctl.ts = ts;
            ctl.encode_into(&mut self.buffer);
            if self.log_on(log::OUT_ACK) {
                trace!(conv = self.conv, sn, ts, "output ack");
            }
        }
        self.acklist.clear();

        // 2. zero-window probe scheduling with 1.5x backoff
        if self.wnd.rmt == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = consts::PROBE_INIT;
                self.probe.ts = current.wrapping_add(self.probe.wait);
            } else if wrapping_diff(current, self.probe.ts) >= 0 {
                if self.probe.wait < consts::PROBE_INIT {
                    self.probe.wait = consts::PROBE_INIT;
                }
                self.probe.wait += self.probe.wait / 2;
                if self.probe.wait > consts::PROBE_LIMIT {
                    self.probe.wait = consts::PROBE_LIMIT;
                }
                self.probe.ts = current.wrapping_add(self.probe.wait);
                self.probe.flags |= consts::ASK_SEND;
            }
        } else {
            self.probe.ts = 0;
            self.probe.wait = 0;
        }

        // 3./4. window probe and window advertisement
        if self.probe.flags & consts::ASK_SEND != 0 {
            ctl.cmd = Cmd::WndAsk;
            self.reserve_room(consts::OVERHEAD as usize);
            ctl.encode_into(&mut self.buffer);
            if self.log_on(log::OUT_PROBE) {
                trace!(conv = self.conv, "output probe wask");
            }
        }
        if self.probe.flags & consts::ASK_TELL != 0 {
            ctl.cmd = Cmd::WndTell;
            self.reserve_room(consts::OVERHEAD as usize);
            ctl.encode_into(&mut self.buffer);
            if self.log_on(log::OUT_WINS) {
                trace!(conv = self.conv, wnd = wnd_free, "output wins");
            }
        }
        self.probe.flags = 0;

        // 5. admit queued data into the send window
        let mut cwnd = self.wnd.snd.min(self.wnd.rmt);
        if !self.nocwnd {
            cwnd = cwnd.min(self.wnd.cwnd);
        }
        while wrapping_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.conv = self.conv;
            seg.cmd = Cmd::Push;
            seg.wnd = wnd_free;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resend_ts = current;
            seg.rto = self.rtt.rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        // 6. walk the in-flight buffer: first sends, timeouts, fast
        // retransmits
        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay == NoDelayLevel::Off {
            self.rtt.rto >> 3
        } else {
            0
        };
        let mut lost = false;
        let mut change = 0u32;

        for i in 0..self.snd_buf.len() {
            let mut needsend = false;
            {
                let base_rto = self.rtt.rto;
                let seg = &mut self.snd_buf[i];
                if seg.xmit == 0 {
                    needsend = true;
                    seg.xmit = 1;
                    seg.rto = base_rto;
                    seg.resend_ts = current.wrapping_add(seg.rto + rtomin);
                } else if wrapping_diff(current, seg.resend_ts) >= 0 {
                    needsend = true;
                    seg.xmit += 1;
                    self.xmit += 1;
                    match self.nodelay {
                        NoDelayLevel::Off => seg.rto += seg.rto.max(base_rto),
                        NoDelayLevel::On => seg.rto += seg.rto / 2,
                        NoDelayLevel::Aggressive => seg.rto += base_rto / 2,
                    }
                    seg.resend_ts = current.wrapping_add(seg.rto);
                    lost = true;
                    self.stats.retransmissions += 1;
                } else if seg.fastack >= resent
                    && (seg.xmit <= self.fastlimit || self.fastlimit == 0)
                {
                    needsend = true;
                    seg.xmit += 1;
                    seg.fastack = 0;
                    seg.resend_ts = current.wrapping_add(seg.rto);
                    change += 1;
                    self.stats.fast_retransmissions += 1;
                }
            }

            if needsend {
                {
                    let seg = &mut self.snd_buf[i];
                    seg.ts = current;
                    seg.wnd = wnd_free;
                    seg.una = una;
                }
                let need = self.snd_buf[i].encoded_len();
                if self.buffer.len() + need > self.mtu as usize {
                    self.emit();
                }
                self.snd_buf[i].encode_into(&mut self.buffer);
                if self.log_on(log::OUT_DATA) {
                    trace!(
                        conv = self.conv,
                        sn = self.snd_buf[i].sn,
                        xmit = self.snd_buf[i].xmit,
                        "output psh"
                    );
                }
                if self.snd_buf[i].xmit >= self.dead_link {
                    self.state = DEAD_LINK_STATE;
                }
            }
        }

        // 7. trailing partial datagram
        self.emit();

        // 8./9. window collapse after fast retransmit or loss
        if change > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.wnd.ssthresh = (inflight / 2).max(consts::THRESH_MIN);
            self.wnd.cwnd = self.wnd.ssthresh + change;
            self.wnd.incr = self.wnd.cwnd * self.mss;
        }
        if lost {
            self.wnd.ssthresh = (cwnd / 2).max(consts::THRESH_MIN);
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }
        if self.wnd.cwnd < 1 {
            self.wnd.cwnd = 1;
            self.wnd.incr = self.mss;
        }
    }

    // ------------------------------------------------------------------
    // scheduling
    // ------------------------------------------------------------------

    /// Drive the block forward to time `now` (ms), flushing when the
    /// cadence deadline has passed. Call repeatedly, 10-100 ms apart, or
    /// as told by [`check`](Self::check).
    pub fn update(&mut self, now: u32) {
        self.current = now;
        if !self.updated {
            self.updated = true;
            self.ts_flush = now;
        }

        let mut slap = wrapping_diff(now, self.ts_flush);
        // Clock jumped; realign rather than flushing in a tight loop.
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = now;
            slap = 0;
        }
        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if wrapping_diff(now, self.ts_flush) >= 0 {
                self.ts_flush = now.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// Earliest time the next [`update`](Self::update) is needed: the
    /// flush deadline or the nearest retransmission, whichever comes
    /// first, clipped by the interval. Returns `now` when work is already
    /// due. Lets a driver sleep instead of polling.
    pub fn check(&self, now: u32) -> u32 {
        if !self.updated {
            return now;
        }
        let mut ts_flush = self.ts_flush;
        if !(-10000..10000).contains(&wrapping_diff(now, ts_flush)) {
            ts_flush = now;
        }
        if wrapping_diff(now, ts_flush) >= 0 {
            return now;
        }

        let tm_flush = wrapping_diff(ts_flush, now);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = wrapping_diff(seg.resend_ts, now);
            if diff <= 0 {
                return now;
            }
            tm_packet = tm_packet.min(diff);
        }

        let minimal = (tm_packet.min(tm_flush) as u32).min(self.interval);
        now.wrapping_add(minimal)
    }

    // ------------------------------------------------------------------
    // tuning
    // ------------------------------------------------------------------

    /// Change the MTU. The scratch buffer is resized to hold three
    /// maximum-size datagrams; MSS follows.
    pub fn set_mtu(&mut self, mtu: u32) -> Result<()> {
        if mtu < 50 || mtu < consts::OVERHEAD {
            return Err(Error::MtuTooSmall(mtu));
        }
        self.buffer = BytesMut::with_capacity(((mtu + consts::OVERHEAD) * 3) as usize);
        self.mtu = mtu;
        self.mss = mtu - consts::OVERHEAD;
        Ok(())
    }

    /// Set send/receive windows in segments; zero leaves a side
    /// unchanged, and the receive window never drops below 128.
    pub fn set_window(&mut self, snd: u32, rcv: u32) {
        if snd > 0 {
            self.wnd.snd = snd;
        }
        if rcv > 0 {
            self.wnd.rcv = rcv.max(consts::WND_RCV);
        }
    }

    /// Set the flush cadence, clamped to `[10, 5000]` ms.
    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval.clamp(10, 5000);
    }

    /// Retune latency behaviour at runtime. `None` leaves a knob
    /// unchanged.
    pub fn set_nodelay(
        &mut self,
        level: Option<NoDelayLevel>,
        interval: Option<u32>,
        resend: Option<u32>,
        no_cwnd: Option<bool>,
    ) {
        if let Some(level) = level {
            self.nodelay = level;
            self.rtt.min_rto = level.min_rto();
        }
        if let Some(interval) = interval {
            self.set_interval(interval);
        }
        if let Some(resend) = resend {
            self.fastresend = resend;
        }
        if let Some(no_cwnd) = no_cwnd {
            self.nocwnd = no_cwnd;
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Conversation id this block is bound to.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Maximum payload bytes per segment.
    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// Segments submitted but not yet acknowledged (queued + in flight).
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// True once any segment has been transmitted `dead_link` times.
    /// The block takes no action itself; teardown is the caller's call.
    pub fn is_dead(&self) -> bool {
        self.state == DEAD_LINK_STATE
    }

    /// Cumulative timeout retransmissions over the block's lifetime.
    pub fn xmit(&self) -> u32 {
        self.xmit
    }

    /// Current retransmission timeout (ms).
    pub fn rto(&self) -> u32 {
        self.rtt.rto
    }

    /// Smoothed round-trip time (ms); 0 before the first sample.
    pub fn srtt(&self) -> u32 {
        self.rtt.srtt
    }

    /// Counter snapshot for monitoring.
    pub fn stats(&self) -> Stats {
        Stats {
            srtt: self.rtt.srtt,
            rttval: self.rtt.rttval,
            rto: self.rtt.rto,
            cwnd: self.wnd.cwnd,
            snd_buf_len: self.snd_buf.len(),
            rcv_buf_len: self.rcv_buf.len(),
            ..self.stats.clone()
        }
    }

    #[inline]
    fn log_on(&self, mask: u32) -> bool {
        self.log_mask & mask != 0
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("conv", &self.conv)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("cwnd", &self.wnd.cwnd)
            .field("rmt_wnd", &self.wnd.rmt)
            .field("rto", &self.rtt.rto)
            .field("wait_snd", &self.wait_snd())
            .field("dead", &self.is_dead())
            .finish()
    }
}
