//! Transport configuration builder.

use std::time::Duration;

use arq_core::{DelayConfig, EngineConfig};

use crate::error::{ArqError, Result};

/// Configuration for streams and listeners, wrapping the engine tuning
/// plus the few knobs that belong to the socket layer.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Protocol engine tuning, handed to every control block.
    pub engine: EngineConfig,
    /// Size of the datagram receive buffer handed to the socket.
    pub recv_buffer_bytes: usize,
    /// Drop server-side routes that stayed silent this long.
    pub idle_timeout: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            recv_buffer_bytes: 64 * 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl ArqConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum transmission unit.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.engine.mtu = mtu;
        self
    }

    /// Set send and receive windows, in segments.
    pub fn window_size(mut self, snd: u32, rcv: u32) -> Self {
        self.engine.snd_wnd = snd;
        self.engine.rcv_wnd = rcv;
        self
    }

    /// Balanced latency profile (the default).
    pub fn normal_mode(mut self) -> Self {
        self.engine.delay = DelayConfig::normal();
        self
    }

    /// Low-latency profile: nodelay, 10 ms flushes, fast resend.
    pub fn fast_mode(mut self) -> Self {
        self.engine.delay = DelayConfig::fast();
        self
    }

    /// Lowest-latency profile: aggressive RTO growth, congestion window
    /// off.
    pub fn turbo_mode(mut self) -> Self {
        self.engine.delay = DelayConfig::turbo();
        self
    }

    /// Custom delay tuning.
    pub fn delay(mut self, delay: DelayConfig) -> Self {
        self.engine.delay = delay;
        self
    }

    /// Stream mode: a byte pipe without message boundaries.
    pub fn stream(mut self, enabled: bool) -> Self {
        self.engine.stream = enabled;
        self
    }

    /// Trace-event mask, see [`arq_core::wire::log`].
    pub fn log_mask(mut self, mask: u32) -> Self {
        self.engine.log_mask = mask;
        self
    }

    /// Idle timeout for server-side routes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Reject configurations the engine or socket layer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.engine.mtu < 50 || self.engine.mtu > 65535 {
            return Err(ArqError::config("mtu must be within 50..=65535"));
        }
        if self.engine.snd_wnd == 0 || self.engine.rcv_wnd == 0 {
            return Err(ArqError::config("window sizes must be non-zero"));
        }
        if self.engine.delay.interval == 0 {
            return Err(ArqError::config("flush interval must be non-zero"));
        }
        if self.recv_buffer_bytes < self.engine.mtu as usize {
            return Err(ArqError::config("receive buffer smaller than the mtu"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ArqConfig::default().validate().is_ok());
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let config = ArqConfig::new().mtu(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_applies_profile() {
        let config = ArqConfig::new().fast_mode().window_size(64, 256);
        assert_eq!(config.engine.snd_wnd, 64);
        assert_eq!(config.engine.rcv_wnd, 256);
        assert_eq!(config.engine.delay.interval, 10);
    }
}
