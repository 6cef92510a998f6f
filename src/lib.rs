//! Async KCP-compatible reliable ARQ transport over UDP.
//!
//! The protocol state machine lives in [`arq_core`]; this crate owns the
//! sockets and the tasks that drive it:
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │  arq-tokio  (this crate)              │
//! │                                       │
//! │  ArqStream / ArqListener  ← user API  │
//! │  driver     ← scheduler + UDP I/O     │
//! ├───────────────────────────────────────┤
//! │  arq-core  (dependency)               │
//! │                                       │
//! │  ControlBlock ← sync state machine    │
//! │  wire         ← segments & constants  │
//! └───────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arq_tokio::{ArqConfig, ArqStream};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: SocketAddr = "127.0.0.1:8080".parse()?;
//!     let mut stream = ArqStream::connect(addr, ArqConfig::new().fast_mode()).await?;
//!
//!     stream.send(b"hello over lossy ground").await?;
//!     if let Some(reply) = stream.recv().await {
//!         println!("got {} bytes back", reply.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod pool;

pub use config::ArqConfig;
pub use error::{ArqError, ConnectionError, Result};
pub use net::{ArqListener, ArqStream};

// Engine types callers commonly need when tuning.
pub use arq_core::{ControlBlock, DelayConfig, EngineConfig, NoDelayLevel, Stats};

/// Crate version, for handshake-free peers that log what they run.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
