//! Engine tuning knobs.

use crate::wire::consts;

/// How aggressively the engine trades bandwidth for latency.
///
/// Selects the minimum RTO, whether first transmissions get the RTO/8
/// grace period, and how a timed-out segment's RTO grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoDelayLevel {
    /// Conservative: min RTO 100 ms, RTO at least doubles on timeout.
    #[default]
    Off,
    /// Low latency: min RTO 30 ms, RTO grows by half on timeout.
    On,
    /// Lowest latency: min RTO 30 ms, RTO grows by half the *base* RTO,
    /// so repeated losses back off much more slowly.
    Aggressive,
}

impl NoDelayLevel {
    pub(crate) fn min_rto(self) -> u32 {
        match self {
            NoDelayLevel::Off => consts::RTO_MIN,
            NoDelayLevel::On | NoDelayLevel::Aggressive => consts::RTO_NDL,
        }
    }
}

/// Latency/throughput trade-off bundle: nodelay level, flush interval,
/// fast-resend threshold, and the congestion-window switch.
#[derive(Debug, Clone, Copy)]
pub struct DelayConfig {
    pub level: NoDelayLevel,
    /// Flush cadence in ms, clamped to `[10, 5000]` by the engine.
    pub interval: u32,
    /// Retransmit after this many duplicate ACKs; 0 disables.
    pub resend: u32,
    /// Ignore the congestion window (the remote window still binds).
    pub no_cwnd: bool,
}

impl DelayConfig {
    /// Balanced defaults, matching the reference implementation.
    pub fn normal() -> Self {
        Self {
            level: NoDelayLevel::Off,
            interval: consts::INTERVAL,
            resend: 0,
            no_cwnd: false,
        }
    }

    /// Low-latency profile: nodelay, 10 ms flushes, fast resend at 2.
    pub fn fast() -> Self {
        Self {
            level: NoDelayLevel::On,
            interval: 10,
            resend: 2,
            no_cwnd: false,
        }
    }

    /// Lowest-latency profile: aggressive RTO growth, congestion window
    /// disabled.
    pub fn turbo() -> Self {
        Self {
            level: NoDelayLevel::Aggressive,
            interval: 10,
            resend: 2,
            no_cwnd: true,
        }
    }

    pub fn custom(level: NoDelayLevel, interval: u32, resend: u32, no_cwnd: bool) -> Self {
        Self {
            level,
            interval,
            resend,
            no_cwnd,
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Protocol-only configuration: every field is read by the engine itself,
/// none of it concerns transports or I/O.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum transmission unit; no emitted datagram exceeds this.
    pub mtu: u32,
    /// Send window in segments.
    pub snd_wnd: u32,
    /// Receive window in segments; raised to at least 128 so any legal
    /// fragment chain fits.
    pub rcv_wnd: u32,
    pub delay: DelayConfig,
    /// Stream mode: no message boundaries, queued data merges freely.
    pub stream: bool,
    /// Transmissions of a single segment before the link is declared dead.
    pub dead_link: u32,
    /// Cap on fast retransmissions per segment; 0 means unlimited.
    pub fast_limit: u32,
    /// Require timestamp ordering before bumping duplicate-ACK counters.
    pub fastack_conserve: bool,
    /// Bitmask over [`wire::log`](crate::wire::log) selecting trace events.
    pub log_mask: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: consts::MTU_DEF,
            snd_wnd: consts::WND_SND,
            rcv_wnd: consts::WND_RCV,
            delay: DelayConfig::normal(),
            stream: false,
            dead_link: consts::DEADLINK,
            fast_limit: consts::FASTACK_LIMIT,
            fastack_conserve: false,
            log_mask: 0,
        }
    }
}
