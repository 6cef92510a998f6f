//! Pure synchronous ARQ protocol engine, wire-compatible with KCP.
//!
//! This crate implements the reliable, ordered, connection-oriented
//! transport core with zero runtime dependencies: no tokio, no sockets,
//! no clocks. I/O is inverted — the host feeds received datagrams into
//! [`ControlBlock::input`], collects outgoing datagrams from the output
//! callback, and drives timing through [`ControlBlock::update`] /
//! [`ControlBlock::check`].
//!
//! ```text
//! ┌────────────────────────────┐
//! │  arq-core                  │
//! │                            │
//! │  wire    ← segments, codec │
//! │  config  ← tuning          │
//! │  error   ← return codes    │
//! │  engine  ← state machine   │
//! └────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod wire;

pub use config::{DelayConfig, EngineConfig, NoDelayLevel};
pub use engine::{ControlBlock, OutputFn, Stats};
pub use error::{Error, Result};
pub use wire::{peek_conv, Cmd, Segment};
